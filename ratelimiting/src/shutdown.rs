use crate::chain::{ChainLinker, LinkageRegistry};
use crate::logging::LogSink;
use anyhow::Context;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Install SIGINT/SIGTERM/SIGHUP handlers that request shutdown.
///
/// The handlers only notify; the steady loop wakes up and tears down in
/// ordinary control flow. Signals arriving after the first keep being logged.
pub fn listen_for_signals(shutdown: Arc<Notify>) -> anyhow::Result<JoinHandle<()>> {
    let mut interrupt =
        signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    Ok(tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                _ = interrupt.recv() => "SIGINT",
                _ = terminate.recv() => "SIGTERM",
                _ = hangup.recv() => "SIGHUP",
            };
            info!("Received {}, shutting down", name);
            shutdown.notify_one();
        }
    }))
}

/// What a teardown pass managed to do.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TeardownReport {
    pub unlinked: bool,
    pub withdrawn: bool,
    pub released: bool,
    pub log_closed: bool,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.unlinked && self.withdrawn && self.released && self.log_closed
    }
}

/// Unlinks the stage from the chain and releases everything it holds.
///
/// `resources` is whatever keeps the stage's maps and program open; dropping
/// it closes the handles.
pub struct ShutdownHandler<R, H> {
    linker: ChainLinker<R>,
    resources: Option<H>,
    log_sink: LogSink,
}

impl<R: LinkageRegistry, H> ShutdownHandler<R, H> {
    pub fn new(linker: ChainLinker<R>, resources: H, log_sink: LogSink) -> Self {
        ShutdownHandler {
            linker,
            resources: Some(resources),
            log_sink,
        }
    }

    /// Every step is attempted regardless of earlier failures; failures are
    /// only logged. Safe to call more than once.
    pub fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();

        match self.linker.unlink_upstream() {
            Ok(()) => {
                report.unlinked = true;
                info!(
                    "Removed stage from {}",
                    self.linker.upstream_path().display()
                );
            }
            Err(e) => error!("xdp chain remove program failed: {:#}", e),
        }

        match self.linker.withdraw() {
            Ok(()) => {
                report.withdrawn = true;
                info!(
                    "Removed linkage point {}",
                    self.linker.own_path().display()
                );
            }
            Err(e) => warn!("Failed to remove linkage point: {:#}", e),
        }

        match self.resources.take() {
            Some(resources) => {
                drop(resources);
                report.released = true;
                info!("Released data-plane maps and program");
            }
            None => debug!("Data-plane maps already released"),
        }

        info!("Teardown complete");
        log::logger().flush();
        match self.log_sink.close() {
            Ok(closed) => report.log_closed = closed,
            Err(e) => eprintln!("Failed to close log file: {}", e),
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::{MemoryRegistry, MemorySlot};
    use std::cell::Cell;
    use std::path::PathBuf;
    use std::rc::Rc;

    const UPSTREAM: &str = "/sys/fs/bpf/upstream_next_prog";
    const OWN: &str = "/sys/fs/bpf/xdp_rl_ingress_next_prog";

    /// Flags when the stage's handles are dropped.
    struct Handles(Rc<Cell<bool>>);

    impl Drop for Handles {
        fn drop(&mut self) {
            self.0.set(true);
        }
    }

    fn linked(registry: &MemoryRegistry) -> ChainLinker<&MemoryRegistry> {
        let linker = ChainLinker::new(registry, PathBuf::from(UPSTREAM), PathBuf::from(OWN));
        linker.link(&7, &mut MemorySlot::default()).unwrap();
        linker
    }

    #[test]
    fn test_teardown_unlinks_and_releases() {
        let (registry, upstream) = MemoryRegistry::with_pin(UPSTREAM);
        let dropped = Rc::new(Cell::new(false));
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::open(&dir.path().join("ratelimiting.log")).unwrap();

        let mut handler =
            ShutdownHandler::new(linked(&registry), Handles(dropped.clone()), sink.clone());
        let report = handler.teardown();

        assert!(report.is_clean());
        assert_eq!(upstream.successor(), None);
        assert!(!registry.is_pinned(OWN));
        assert!(dropped.get());
        assert!(!sink.is_open());
    }

    #[test]
    fn test_teardown_twice_only_reports_failures() {
        let (registry, _upstream) = MemoryRegistry::with_pin(UPSTREAM);
        let dropped = Rc::new(Cell::new(false));
        let mut handler =
            ShutdownHandler::new(linked(&registry), Handles(dropped), LogSink::default());

        handler.teardown();
        let second = handler.teardown();

        assert_eq!(second, TeardownReport::default());
    }

    #[test]
    fn test_teardown_continues_after_failed_steps() {
        let (registry, _upstream) = MemoryRegistry::with_pin(UPSTREAM);
        let linker = linked(&registry);
        // upstream stage went away and our pin was removed by hand
        registry.pins.borrow_mut().clear();
        let dropped = Rc::new(Cell::new(false));

        let mut handler = ShutdownHandler::new(linker, Handles(dropped.clone()), LogSink::default());
        let report = handler.teardown();

        assert!(!report.unlinked);
        assert!(!report.withdrawn);
        assert!(report.released);
        assert!(dropped.get());
    }
}
