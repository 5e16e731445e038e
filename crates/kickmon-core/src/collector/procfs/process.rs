//! Process collector producing [`ProcessStats`] from `/proc/[pid]/`.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::collector::procfs::parser::{
    ParseError, parse_environ, parse_proc_io, parse_proc_stat, parse_proc_status,
};
use crate::collector::traits::FileSystem;
use crate::config::{EXE_VARS, RANK_VARS, first_set};
use crate::stats::ProcessStats;
use crate::util::epoch_secs;

/// Clock ticks per second (USER_HZ). Standard value for Linux.
const CLK_TCK: f64 = 100.0;

/// Error type for collection failures.
#[derive(Debug)]
pub enum CollectError {
    /// Process disappeared: none of its views could be read.
    ProcessGone(u32),
    /// I/O error reading the process table.
    Io(std::io::Error),
    /// Views were readable but none could be parsed.
    Parse(String),
}

impl std::fmt::Display for CollectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectError::ProcessGone(pid) => write!(f, "process {} disappeared", pid),
            CollectError::Io(e) => write!(f, "I/O error: {}", e),
            CollectError::Parse(msg) => write!(f, "parse error: {}", msg),
        }
    }
}

impl std::error::Error for CollectError {}

impl From<std::io::Error> for CollectError {
    fn from(e: std::io::Error) -> Self {
        CollectError::Io(e)
    }
}

impl From<ParseError> for CollectError {
    fn from(e: ParseError) -> Self {
        CollectError::Parse(e.message)
    }
}

/// Outcome of reading one optional view.
enum View<T> {
    Missing,
    Unparsable(ParseError),
    Present(T),
}

impl<T> View<T> {
    fn present(&self) -> Option<&T> {
        match self {
            View::Present(v) => Some(v),
            _ => None,
        }
    }

    fn error(&self) -> Option<&ParseError> {
        match self {
            View::Unparsable(e) => Some(e),
            _ => None,
        }
    }
}

/// Collects per-process statistics from `/proc/[pid]/` files.
pub struct ProcessCollector<F: FileSystem> {
    fs: F,
    proc_path: String,
    host: String,
}

impl<F: FileSystem> ProcessCollector<F> {
    /// # Arguments
    /// * `fs` - Filesystem implementation (real or mock)
    /// * `proc_path` - Base path to proc filesystem (usually "/proc")
    /// * `host` - Address stamped into every snapshot as the host key
    pub fn new(fs: F, proc_path: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            fs,
            proc_path: proc_path.into(),
            host: host.into(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }

    /// Collects a snapshot of the calling process.
    ///
    /// Rank and executable path come from `lookup` (the caller's own
    /// environment); the executable falls back to `/proc/[pid]/exe`.
    pub fn collect_with_env(
        &self,
        pid: u32,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<ProcessStats, CollectError> {
        let mut stats = self.sample(pid)?;
        stats.rank = parse_rank(first_set(RANK_VARS, &lookup));
        stats.exe = match first_set(EXE_VARS, &lookup) {
            Some(exe) => exe,
            None => self.exe_of(pid).unwrap_or_default(),
        };
        Ok(stats)
    }

    /// Collects a snapshot of another process.
    ///
    /// Rank is read from the process's `environ`, the executable path from
    /// its `exe` link.
    pub fn collect(&self, pid: u32) -> Result<ProcessStats, CollectError> {
        let mut stats = self.sample(pid)?;
        let environ = self
            .fs
            .read_to_string(&self.pid_path(pid, "environ"))
            .map(|content| parse_environ(&content))
            .unwrap_or_default();
        stats.rank = parse_rank(first_set(RANK_VARS, |key| environ.get(key).cloned()));
        stats.exe = self.exe_of(pid).unwrap_or_default();
        Ok(stats)
    }

    /// Collects every process whose process group is `pgrp`, except
    /// `exclude`. Processes that vanish mid-scan are skipped.
    pub fn scan_group(&self, pgrp: i32, exclude: u32) -> Result<Vec<ProcessStats>, CollectError> {
        let mut found = Vec::new();

        for entry in self.fs.read_dir(Path::new(&self.proc_path))? {
            let Some(pid) = entry
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            if pid == exclude {
                continue;
            }

            let in_group = self
                .fs
                .read_to_string(&self.pid_path(pid, "stat"))
                .ok()
                .and_then(|content| parse_proc_stat(&content).ok())
                .is_some_and(|stat| stat.pgrp == pgrp);
            if !in_group {
                continue;
            }

            match self.collect(pid) {
                Ok(stats) => found.push(stats),
                Err(e) => debug!(pid, error = %e, "skipping group member"),
            }
        }

        found.sort_by_key(|s| s.pid);
        Ok(found)
    }

    /// Reads the three views and fills every field they cover.
    fn sample(&self, pid: u32) -> Result<ProcessStats, CollectError> {
        let stat = self.view(pid, "stat", parse_proc_stat);
        let status = self.view(pid, "status", parse_proc_status);
        let io = self.view(pid, "io", parse_proc_io);

        if stat.present().is_none() && status.present().is_none() && io.present().is_none() {
            let first_error = [stat.error(), status.error(), io.error()]
                .into_iter()
                .flatten()
                .next();
            return Err(match first_error {
                Some(e) => CollectError::from(e.clone()),
                None => CollectError::ProcessGone(pid),
            });
        }

        let mut stats = ProcessStats {
            ts: epoch_secs(),
            pid,
            host: self.host.clone(),
            procs: 1,
            ..Default::default()
        };

        if let Some(stat) = stat.present() {
            stats.ppid = stat.ppid;
            stats.utime = stat.utime as f64 / CLK_TCK;
            stats.stime = stat.stime as f64 / CLK_TCK;
            stats.iowait = stat.delayacct_blkio_ticks as f64 / CLK_TCK;
        }
        if let Some(status) = status.present() {
            stats.ppid = status.ppid;
            stats.vmpeak = status.vm_peak;
            stats.vm = status.vm_size;
            stats.rsspeak = status.vm_hwm;
            stats.rss = status.vm_rss;
            stats.threads = status.threads;
        }
        if let Some(io) = io.present() {
            stats.read_bytes = io.read_bytes;
            stats.write_bytes = io.write_bytes;
            stats.rchar = io.rchar;
            stats.wchar = io.wchar;
            stats.syscr = io.syscr;
            stats.syscw = io.syscw;
        }

        Ok(stats)
    }

    fn view<T>(&self, pid: u32, name: &str, parse: fn(&str) -> Result<T, ParseError>) -> View<T> {
        let Ok(content) = self.fs.read_to_string(&self.pid_path(pid, name)) else {
            return View::Missing;
        };
        match parse(&content) {
            Ok(v) => View::Present(v),
            Err(e) => {
                debug!(pid, view = name, error = %e, "unparsable view");
                View::Unparsable(e)
            }
        }
    }

    fn exe_of(&self, pid: u32) -> Option<String> {
        self.fs
            .read_link(&self.pid_path(pid, "exe"))
            .ok()
            .map(|p| p.to_string_lossy().into_owned())
    }

    fn pid_path(&self, pid: u32, name: &str) -> PathBuf {
        PathBuf::from(format!("{}/{}/{}", self.proc_path, pid, name))
    }
}

fn parse_rank(raw: Option<String>) -> u32 {
    raw.and_then(|r| r.trim().parse().ok()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::MockFs;
    use std::collections::HashMap;

    fn collector(fs: MockFs) -> ProcessCollector<MockFs> {
        ProcessCollector::new(fs, "/proc", "10.0.0.1")
    }

    #[test]
    fn test_collect_full_views() {
        let c = collector(MockFs::job_group());
        let stats = c.collect(102).unwrap();

        assert_eq!(stats.pid, 102);
        assert_eq!(stats.ppid, 101);
        assert_eq!(stats.host, "10.0.0.1");
        assert_eq!(stats.utime, 2.5);
        assert_eq!(stats.stime, 0.5);
        assert_eq!(stats.iowait, 0.4);
        assert_eq!(stats.vmpeak, 500000);
        assert_eq!(stats.vm, 450000);
        assert_eq!(stats.rsspeak, 120000);
        assert_eq!(stats.rss, 100000);
        assert_eq!(stats.threads, 4);
        assert_eq!(stats.procs, 1);
        assert_eq!(stats.rchar, 4096);
        assert_eq!(stats.write_bytes, 2048);
        assert_eq!(stats.rank, 2);
        assert_eq!(stats.exe, "/opt/app/bin/worker");
        assert!(stats.ts > 0.0);
    }

    #[test]
    fn test_collect_skips_missing_io() {
        let c = collector(MockFs::job_group());
        let stats = c.collect(101).unwrap();
        assert_eq!(stats.utime, 0.03);
        assert_eq!(stats.rchar, 0);
        assert_eq!(stats.rank, 0);
        assert_eq!(stats.exe, "/bin/sh");
    }

    #[test]
    fn test_collect_only_io_view() {
        let mut fs = MockFs::job_group();
        fs.remove_file("/proc/102/stat");
        fs.remove_file("/proc/102/status");

        let stats = collector(fs).collect(102).unwrap();
        assert_eq!(stats.utime, 0.0);
        assert_eq!(stats.rchar, 4096);
    }

    #[test]
    fn test_collect_gone_process() {
        let c = collector(MockFs::job_group());
        assert!(matches!(c.collect(999), Err(CollectError::ProcessGone(999))));
    }

    #[test]
    fn test_collect_unparsable_views() {
        let mut fs = MockFs::new();
        fs.add_process(7, "garbage", "", "");
        assert!(matches!(collector(fs).collect(7), Err(CollectError::Parse(_))));
    }

    #[test]
    fn test_collect_with_env_prefers_environment() {
        let c = collector(MockFs::job_group());
        let env: HashMap<&str, &str> = [("SLURM_PROCID", "5"), ("_", "/usr/bin/python3")].into();
        let stats = c
            .collect_with_env(100, |k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(stats.rank, 5);
        assert_eq!(stats.exe, "/usr/bin/python3");
    }

    #[test]
    fn test_collect_with_env_falls_back_to_exe_link() {
        let c = collector(MockFs::job_group());
        let stats = c.collect_with_env(100, |_| None).unwrap();
        assert_eq!(stats.rank, 0);
        assert_eq!(stats.exe, "/usr/bin/kickmon");
    }

    #[test]
    fn test_scan_group_excludes_caller_and_other_groups() {
        let c = collector(MockFs::job_group());
        let members = c.scan_group(100, 100).unwrap();
        let pids: Vec<u32> = members.iter().map(|s| s.pid).collect();
        assert_eq!(pids, vec![101, 102]);
    }

    #[test]
    fn test_scan_group_missing_proc() {
        let c = ProcessCollector::new(MockFs::new(), "/proc", "h");
        assert!(matches!(c.scan_group(1, 0), Err(CollectError::Io(_))));
    }
}
