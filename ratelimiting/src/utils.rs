pub mod port_utils {

    /// Result of parsing an operator supplied port list.
    #[derive(Debug, Default, PartialEq, Eq)]
    pub struct PortList {
        pub ports: Vec<u16>,
        /// Tokens that were not a valid 16-bit port, after trimming.
        pub rejected: Vec<String>,
    }

    // Split on `delimiter`, trim each token and keep the ones that parse as a port.
    // Malformed tokens (empty, non-numeric, out of range) are reported and skipped.
    pub fn parse_port_list(list: &str, delimiter: &str) -> PortList {
        let mut parsed = PortList::default();

        for token in list.split(delimiter) {
            let token = token.trim();
            match token.parse::<u16>() {
                Ok(port) => {
                    if !parsed.ports.contains(&port) {
                        parsed.ports.push(port);
                    }
                }
                Err(_) => parsed.rejected.push(token.to_string()),
            }
        }

        parsed
    }
}

pub mod time_utils {

    /// Source of monotonic time, in the same clock domain as `bpf_ktime_get_ns`.
    pub trait MonotonicClock {
        fn now_ns(&self) -> u64;
    }

    /// CLOCK_MONOTONIC
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl MonotonicClock for SystemClock {
        fn now_ns(&self) -> u64 {
            let mut ts = libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            };
            // CLOCK_MONOTONIC is always available on Linux
            unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
            (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
        }
    }

    #[cfg(test)]
    #[derive(Debug, Clone, Copy)]
    pub struct FixedClock(pub u64);

    #[cfg(test)]
    impl MonotonicClock for FixedClock {
        fn now_ns(&self) -> u64 {
            self.0
        }
    }
}

pub mod network_utils {

    use std::ffi::CString;

    // Resolve an interface name to its kernel index
    pub fn interface_index(name: &str) -> Option<u32> {
        let c_name = CString::new(name).ok()?;
        let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
        if index == 0 {
            None
        } else {
            Some(index)
        }
    }
}
