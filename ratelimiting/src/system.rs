use crate::command::StageArgs;
use log::{info, warn};
use std::fs;

// ---- startup diagnostics ----
fn read_first_line(path: &str) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.lines().next().map(|l| l.trim().to_string()))
}

fn kernel_version() -> Option<String> {
    // Prefer the release string, fall back to /proc/version (verbose)
    read_first_line("/proc/sys/kernel/osrelease").or_else(|| read_first_line("/proc/version"))
}

fn hostname() -> Option<String> {
    read_first_line("/proc/sys/kernel/hostname").or_else(|| read_first_line("/etc/hostname"))
}

fn bpffs_mounted() -> bool {
    fs::read_to_string("/proc/mounts")
        .map(|mounts| mounts.lines().any(|l| l.split_whitespace().nth(2) == Some("bpf")))
        .unwrap_or(false)
}

pub fn log_startup_info(args: &StageArgs) {
    let app_version = env!("CARGO_PKG_VERSION");
    let uid = unsafe { libc::geteuid() };

    let kver = kernel_version().unwrap_or_else(|| "unknown".to_string());
    let host = hostname().unwrap_or_else(|| "unknown".to_string());

    info!("ratelimiting v{} started", app_version);
    info!("Host: {} (uid={})", host, uid);
    info!("Kernel: {}", kver);
    if uid != 0 {
        warn!("It is recommended to run as root to enable eBPF capabilities");
    }
    if !bpffs_mounted() {
        warn!("No BPF filesystem mounted, pinned maps cannot be shared");
    }

    info!("Interface: {} (ifindex {})", args.iface, args.ifindex);
    info!("eBPF object: {} (program '{}')", args.object.display(), args.program);
    info!("Previous stage map: {}", args.map_name.display());
    info!("Linkage point: {}", args.pin_path.display());
    info!("Rate: {} connections per window", args.store.rate);
    match &args.store.ports {
        Some(ports) => info!("Ports: {}", ports),
        None => info!("Ports: not restricted"),
    }
    info!(
        "Buffer time: {}s, sweep interval: {}s",
        args.buffer_time.as_secs(),
        args.sweep_interval.as_secs()
    );
    if let Some(direction) = &args.direction {
        info!(
            "Direction '{}' requested; direction is reserved and has no effect",
            direction
        );
    }
}
