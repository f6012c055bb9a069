pub mod sweeper;

use crate::ebpf::maps::{SharedStore, StateStores};
use crate::logging::LogSink;
use crate::utils::time_utils::MonotonicClock;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use sweeper::EvictionSweeper;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};

/// Steady state: sweep the window map once per interval until shutdown is
/// requested. Returns the number of completed cycles.
///
/// The first sweep runs one full interval after entering the loop. A shutdown
/// notification is observed between cycles only.
pub async fn run_steady<S, P, N, C>(
    stores: &mut StateStores<S, P, N>,
    sweeper: &EvictionSweeper,
    clock: &C,
    interval: Duration,
    log_sink: &LogSink,
    shutdown: Arc<Notify>,
) -> u64
where
    S: SharedStore<u64, u64>,
    P: SharedStore<u16, u8>,
    C: MonotonicClock,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        "Entering steady state, sweeping every {}s",
        interval.as_secs_f64()
    );

    let mut cycles = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_cycle(stores, sweeper, clock);
                cycles += 1;
                if let Err(e) = log_sink.flush() {
                    eprintln!("Failed to flush log file: {}", e);
                }
            }
            _ = shutdown.notified() => {
                info!("Sweep loop received shutdown signal, stopping...");
                break;
            }
        }
    }

    cycles
}

fn run_cycle<S, P, N, C>(stores: &mut StateStores<S, P, N>, sweeper: &EvictionSweeper, clock: &C)
where
    S: SharedStore<u64, u64>,
    P: SharedStore<u16, u8>,
    C: MonotonicClock,
{
    match sweeper.sweep(&mut stores.window, clock) {
        Ok(report) => debug!(
            "Sweep visited {} window entries, evicted {}, missing {}, failed {}",
            report.visited, report.evicted, report.missing, report.failed
        ),
        Err(e) => warn!("Window sweep failed: {:#}", e),
    }

    match stores.counters() {
        Ok((received, dropped)) => info!(
            "Connections received: {}, dropped: {}",
            received, dropped
        ),
        Err(e) => warn!("Failed to read connection counters: {:#}", e),
    }
}
