use crate::ebpf::maps::SharedStore;
use crate::utils::time_utils::MonotonicClock;
use anyhow::{Context, Result};
use log::{debug, info, warn};
use ratelimiting_common::{Timestamp, WindowKey};
use std::time::Duration;

/// Outcome of one pass over the window map.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub visited: usize,
    pub evicted: usize,
    /// Entries that disappeared between the key walk and their lookup or delete.
    pub missing: usize,
    pub failed: usize,
}

/// Deletes window entries older than the buffer time.
///
/// The data plane keeps inserting while a sweep runs. Keys are collected by a
/// single cursor walk first and then handled one map operation at a time, so
/// deleting an entry never resets the walk, and an entry inserted after the
/// walk is simply left for the next sweep.
#[derive(Debug, Clone, Copy)]
pub struct EvictionSweeper {
    buffer_ns: u64,
}

impl EvictionSweeper {
    pub fn new(buffer_time: Duration) -> Self {
        EvictionSweeper {
            buffer_ns: u64::try_from(buffer_time.as_nanos()).unwrap_or(u64::MAX),
        }
    }

    /// Entries stamped before this instant are stale. Saturates at zero so a
    /// young clock never evicts anything.
    pub fn cutoff(&self, now_ns: u64) -> u64 {
        now_ns.saturating_sub(self.buffer_ns)
    }

    pub fn sweep<W, C>(&self, window: &mut W, clock: &C) -> Result<SweepReport>
    where
        W: SharedStore<WindowKey, Timestamp>,
        C: MonotonicClock,
    {
        debug!("Deleting stale window entries");

        let now = clock.now_ns();
        let cutoff = self.cutoff(now);
        debug!("Current time is {}, cutoff is {}", now, cutoff);

        let keys = window
            .snapshot_keys()
            .context("Failed to walk window map keys")?;

        let mut report = SweepReport::default();
        for key in keys {
            report.visited += 1;

            let timestamp = match window.lookup(&key) {
                Ok(Some(timestamp)) => timestamp,
                Ok(None) => {
                    report.missing += 1;
                    debug!("Window entry {} already gone", key);
                    continue;
                }
                Err(e) => {
                    report.failed += 1;
                    warn!("Failed to read window entry {}: {}", key, e);
                    continue;
                }
            };

            if timestamp >= cutoff {
                continue;
            }

            debug!("Deleting stale window entry {} (inserted at {})", key, timestamp);
            match window.delete(&key) {
                Ok(true) => report.evicted += 1,
                Ok(false) => {
                    report.missing += 1;
                    info!("Window entry {} not found", key);
                }
                Err(e) => {
                    report.failed += 1;
                    warn!("Failed to delete window entry {}: {}", key, e);
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ebpf::maps::testing::MemoryStore;
    use crate::utils::time_utils::FixedClock;
    use anyhow::anyhow;

    const SEC: u64 = 1_000_000_000;
    const NOW: u64 = 1_000 * SEC;

    fn window_with(entries: &[(u64, u64)]) -> MemoryStore<u64, u64> {
        let mut window = MemoryStore::default();
        window.entries.extend(entries.iter().copied());
        window
    }

    #[test]
    fn test_sweep_evicts_only_stale_entries() {
        let sweeper = EvictionSweeper::new(Duration::from_secs(30));
        let mut window = window_with(&[
            (1, NOW - 60 * SEC),
            (2, NOW - 5 * SEC),
            (3, NOW - 31 * SEC),
            (4, NOW),
        ]);

        let report = sweeper.sweep(&mut window, &FixedClock(NOW)).unwrap();

        assert_eq!(report.visited, 4);
        assert_eq!(report.evicted, 2);
        assert_eq!(window.entries.keys().copied().collect::<Vec<_>>(), vec![2, 4]);
    }

    #[test]
    fn test_sweep_keeps_entry_exactly_at_buffer_edge() {
        let sweeper = EvictionSweeper::new(Duration::from_secs(30));
        let mut window = window_with(&[(1, NOW - 30 * SEC), (2, NOW - 30 * SEC - 1)]);

        sweeper.sweep(&mut window, &FixedClock(NOW)).unwrap();

        assert!(window.entries.contains_key(&1));
        assert!(!window.entries.contains_key(&2));
    }

    #[test]
    fn test_sweep_never_evicts_before_buffer_elapsed_since_boot() {
        let sweeper = EvictionSweeper::new(Duration::from_secs(30));
        let mut window = window_with(&[(1, 0), (2, 5 * SEC)]);

        let report = sweeper.sweep(&mut window, &FixedClock(10 * SEC)).unwrap();

        assert_eq!(sweeper.cutoff(10 * SEC), 0);
        assert_eq!(report.evicted, 0);
        assert_eq!(window.entries.len(), 2);
    }

    #[test]
    fn test_sweep_judges_entry_age_by_stored_timestamp_not_key() {
        let sweeper = EvictionSweeper::new(Duration::from_secs(30));
        // key looks fresh but the entry was stamped long ago, and the reverse
        let mut window = window_with(&[(NOW, NOW - 60 * SEC), (7, NOW - SEC)]);

        let report = sweeper.sweep(&mut window, &FixedClock(NOW)).unwrap();

        assert_eq!(report.evicted, 1);
        assert_eq!(window.entries.keys().copied().collect::<Vec<_>>(), vec![7]);
    }

    #[test]
    fn test_sweep_on_empty_window() {
        let sweeper = EvictionSweeper::new(Duration::from_secs(30));
        let mut window = MemoryStore::<u64, u64>::default();

        let report = sweeper.sweep(&mut window, &FixedClock(NOW)).unwrap();

        assert_eq!(report, SweepReport::default());
    }

    /// Window map with a data plane inserting a fresh entry on every lookup.
    struct BusyWindow {
        inner: MemoryStore<u64, u64>,
        next_key: u64,
    }

    impl SharedStore<u64, u64> for BusyWindow {
        fn lookup(&self, key: &u64) -> Result<Option<u64>> {
            self.inner.lookup(key)
        }

        fn update(&mut self, key: u64, value: u64) -> Result<()> {
            self.inner.update(key, value)
        }

        fn delete(&mut self, key: &u64) -> Result<bool> {
            // admission happens while the sweep is deleting
            self.next_key += 1;
            self.inner.entries.insert(self.next_key, NOW);
            self.inner.delete(key)
        }

        fn snapshot_keys(&self) -> Result<Vec<u64>> {
            self.inner.snapshot_keys()
        }
    }

    #[test]
    fn test_sweep_visits_start_keys_despite_concurrent_inserts() {
        let sweeper = EvictionSweeper::new(Duration::from_secs(30));
        let mut window = BusyWindow {
            inner: window_with(&[(1, 0), (2, 0), (3, NOW), (4, 0)]),
            next_key: 100,
        };

        let report = sweeper.sweep(&mut window, &FixedClock(NOW)).unwrap();

        assert_eq!(report.visited, 4);
        assert_eq!(report.evicted, 3);
        assert_eq!(
            window.inner.entries.keys().copied().collect::<Vec<_>>(),
            vec![3, 101, 102, 103]
        );
    }

    /// Window map whose entries vanish (LRU eviction) after the key walk.
    struct VanishingWindow {
        keys: Vec<u64>,
        inner: MemoryStore<u64, u64>,
    }

    impl SharedStore<u64, u64> for VanishingWindow {
        fn lookup(&self, key: &u64) -> Result<Option<u64>> {
            if *key == 13 {
                return Err(anyhow!("bpf_map_lookup_elem failed"));
            }
            self.inner.lookup(key)
        }

        fn update(&mut self, key: u64, value: u64) -> Result<()> {
            self.inner.update(key, value)
        }

        fn delete(&mut self, key: &u64) -> Result<bool> {
            self.inner.delete(key)
        }

        fn snapshot_keys(&self) -> Result<Vec<u64>> {
            Ok(self.keys.clone())
        }
    }

    #[test]
    fn test_sweep_tolerates_missing_and_failing_entries() {
        let sweeper = EvictionSweeper::new(Duration::from_secs(30));
        let mut window = VanishingWindow {
            keys: vec![1, 2, 13],
            inner: window_with(&[(1, 0)]),
        };

        let report = sweeper.sweep(&mut window, &FixedClock(NOW)).unwrap();

        assert_eq!(
            report,
            SweepReport {
                visited: 3,
                evicted: 1,
                missing: 1,
                failed: 1,
            }
        );
    }
}
