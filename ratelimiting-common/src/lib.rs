#![no_std]

//! Store layout shared by the rate limiting stage's control plane and its
//! XDP data-plane object.
//!
//! Map names must match the symbols compiled into the object file; key and
//! value types must match their declared sizes byte for byte.

// ============================================================================
// Entry point
// ============================================================================

/// Default name of the XDP entry point inside the data-plane object.
pub const DEFAULT_PROGRAM_NAME: &str = "xdp_ratelimiting";

// ============================================================================
// Store names
// ============================================================================

// global admission threshold, {SINGLE_ENTRY_KEY: connections per window}
pub const CONFIG_MAP: &str = "rl_config_map";

// sliding window, {connection/time id: monotonic insertion time (ns)}
pub const WINDOW_MAP: &str = "rl_window_map";

// cumulative received connections, {SINGLE_ENTRY_KEY: count}
pub const RECV_COUNT_MAP: &str = "rl_recv_count_map";

// cumulative dropped connections, {SINGLE_ENTRY_KEY: count}
pub const DROP_COUNT_MAP: &str = "rl_drop_count_map";

// destination port allow-list, {port: PORT_ALLOWED}
pub const PORTS_MAP: &str = "rl_ports_map";

// program array holding the next stage in the chain at NEXT_STAGE_INDEX
pub const NEXT_STAGE_MAP: &str = "xdp_rl_ingress_next_prog";

/// All stores the control plane requires, in the order they are validated.
pub const REQUIRED_MAPS: [&str; 6] = [
    CONFIG_MAP,
    WINDOW_MAP,
    RECV_COUNT_MAP,
    DROP_COUNT_MAP,
    PORTS_MAP,
    NEXT_STAGE_MAP,
];

// ============================================================================
// Keys and values
// ============================================================================

/// Key of the config and counter stores, which hold a single entry each.
pub const SINGLE_ENTRY_KEY: u64 = 0;

/// Program array slot a stage dispatches to.
pub const NEXT_STAGE_INDEX: u32 = 0;

/// Membership flag stored for every allowed port.
pub const PORT_ALLOWED: u8 = 1;

pub type WindowKey = u64;

/// Monotonic clock reading in nanoseconds, as produced by `bpf_ktime_get_ns`.
pub type Timestamp = u64;

pub type PortKey = u16;
