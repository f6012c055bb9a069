pub mod maps;

use anyhow::{anyhow, Context};
use aya::programs::{ProgramFd, Xdp};
use aya::{Ebpf, EbpfLoader};
use log::{debug, info};
use std::path::Path;

// Remove the locked memory limit; map memory is charged against it on older kernels
pub fn remove_rlimit_memlock() -> anyhow::Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        return Err(anyhow!(
            "setrlimit(RLIMIT_MEMLOCK) failed: {}",
            std::io::Error::last_os_error()
        ));
    }
    Ok(())
}

/// Data-plane object whose entry point is loaded (verified) but not attached.
///
/// The stage runs only when the previous stage tail-calls into `program`.
pub struct LoadedStage {
    pub ebpf: Ebpf,
    pub program: ProgramFd,
}

pub fn load_stage(object: &Path, program_name: &str) -> anyhow::Result<LoadedStage> {
    let mut ebpf = EbpfLoader::new()
        .load_file(object)
        .with_context(|| format!("Failed to load eBPF object {}", object.display()))?;

    // Objects without log statements have no log maps
    if let Err(e) = aya_log::EbpfLogger::init(&mut ebpf) {
        debug!("eBPF logger not initialized: {}", e);
    }

    let program = {
        let xdp: &mut Xdp = ebpf
            .program_mut(program_name)
            .ok_or_else(|| anyhow!("Program '{}' not found in eBPF object", program_name))?
            .try_into()
            .map_err(|e| anyhow!("Program '{}' is not an XDP program: {:?}", program_name, e))?;

        xdp.load()
            .with_context(|| format!("Failed to load program '{}'", program_name))?;

        xdp.fd()
            .map_err(|e| anyhow!("Program '{}' fd unavailable: {}", program_name, e))?
            .try_clone()
            .with_context(|| format!("Failed to duplicate fd of program '{}'", program_name))?
    };

    info!(
        "Loaded program '{}' from {}",
        program_name,
        object.display()
    );

    Ok(LoadedStage { ebpf, program })
}
