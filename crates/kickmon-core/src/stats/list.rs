use std::time::Duration;

use tracing::trace;

use super::ProcessStats;

/// Snapshots keyed by `(host, pid)`, kept sorted by key.
///
/// Entries are created on first update, replaced in place by newer samples
/// and never removed: a process that exited keeps contributing its last
/// cumulative counters to every merge.
#[derive(Debug, Clone, Default)]
pub struct ProcessStatsList {
    entries: Vec<ProcessStats>,
}

impl ProcessStatsList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessStats> {
        self.entries.iter()
    }

    pub fn get(&self, host: &str, pid: u32) -> Option<&ProcessStats> {
        self.position(host, pid).ok().map(|idx| &self.entries[idx])
    }

    /// Inserts the entry for `stats.key()`, or replaces it unless the stored
    /// sample is newer. Reports can arrive out of order, and a stale one must
    /// not roll cumulative counters back.
    pub fn update(&mut self, stats: ProcessStats) {
        match self.position(&stats.host, stats.pid) {
            Ok(idx) if stats.ts >= self.entries[idx].ts => self.entries[idx] = stats,
            Ok(idx) => trace!(
                pid = stats.pid,
                host = %stats.host,
                stale = stats.ts,
                kept = self.entries[idx].ts,
                "ignoring out-of-order report"
            ),
            Err(idx) => self.entries.insert(idx, stats),
        }
    }

    /// Folds every entry into one snapshot.
    ///
    /// Identity fields (pid, ppid, rank, host, exe) come from `base`; `ts` is
    /// `now`. Cumulative counters are summed over all entries. Memory, process
    /// and thread gauges are summed only over entries sampled within the last
    /// two intervals, so processes that exited long ago stop counting as live.
    pub fn merge(&self, base: &ProcessStats, now: f64, interval: Duration) -> ProcessStats {
        let window_start = now - 2.0 * interval.as_secs_f64();

        let mut merged = ProcessStats {
            ts: now,
            pid: base.pid,
            ppid: base.ppid,
            rank: base.rank,
            host: base.host.clone(),
            exe: base.exe.clone(),
            ..Default::default()
        };

        for entry in &self.entries {
            merged.add_counters(entry);
            if entry.ts >= window_start {
                merged.add_gauges(entry);
            }
        }

        merged
    }

    fn position(&self, host: &str, pid: u32) -> Result<usize, usize> {
        self.entries
            .binary_search_by(|e| (e.host.as_str(), e.pid).cmp(&(host, pid)))
    }
}
