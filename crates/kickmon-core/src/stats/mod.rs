//! Resource-usage snapshot model.

mod list;

pub use list::ProcessStatsList;

use serde::{Deserialize, Serialize};

/// Hardware performance counter samples. Unavailable counters read as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HwCounters {
    pub instructions: u64,
    pub cycles: u64,
    pub cache_references: u64,
    pub cache_misses: u64,
}

impl HwCounters {
    pub fn accumulate(&mut self, other: &HwCounters) {
        self.instructions += other.instructions;
        self.cycles += other.cycles;
        self.cache_references += other.cache_references;
        self.cache_misses += other.cache_misses;
    }
}

/// Point-in-time resource usage of one process (or a merged group).
///
/// Memory values are in kB, CPU times in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessStats {
    /// Sample time, seconds since the Unix epoch.
    pub ts: f64,
    pub pid: u32,
    pub ppid: u32,
    pub rank: u32,
    /// IPv4 address of the host the sample was taken on, dotted quad.
    pub host: String,
    pub exe: String,

    pub utime: f64,
    pub stime: f64,
    pub iowait: f64,

    pub vmpeak: u64,
    pub rsspeak: u64,
    pub vm: u64,
    pub rss: u64,
    pub procs: u32,
    pub threads: u32,

    pub hw: HwCounters,

    pub read_bytes: u64,
    pub write_bytes: u64,
    pub rchar: u64,
    pub wchar: u64,
    pub syscr: u64,
    pub syscw: u64,

    /// Bytes sent on sockets tracked by the interposition layer.
    pub bsend: u64,
    /// Bytes received on sockets tracked by the interposition layer.
    pub brecv: u64,
}

impl ProcessStats {
    /// Key used by [`ProcessStatsList`].
    pub fn key(&self) -> (&str, u32) {
        (self.host.as_str(), self.pid)
    }

    /// Adds cumulative counters (CPU, I/O, hardware, socket bytes).
    pub(crate) fn add_counters(&mut self, other: &ProcessStats) {
        self.utime += other.utime;
        self.stime += other.stime;
        self.iowait += other.iowait;
        self.hw.accumulate(&other.hw);
        self.read_bytes += other.read_bytes;
        self.write_bytes += other.write_bytes;
        self.rchar += other.rchar;
        self.wchar += other.wchar;
        self.syscr += other.syscr;
        self.syscw += other.syscw;
        self.bsend += other.bsend;
        self.brecv += other.brecv;
    }

    /// Adds point-in-time gauges (memory, process and thread counts).
    pub(crate) fn add_gauges(&mut self, other: &ProcessStats) {
        self.vmpeak += other.vmpeak;
        self.rsspeak += other.rsspeak;
        self.vm += other.vm;
        self.rss += other.rss;
        self.procs += other.procs;
        self.threads += other.threads;
    }
}
