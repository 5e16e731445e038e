//! Pre-built `/proc` states for collector and scheduler tests.

use super::filesystem::MockFs;

/// Builds a `/proc/[pid]/stat` line with the fields the collector reads.
///
/// All other numeric fields are zero; `blkio` lands in field 42
/// (`delayacct_blkio_ticks`).
pub fn stat_line(pid: u32, comm: &str, ppid: u32, pgrp: u32, utime: u64, stime: u64, blkio: u64) -> String {
    let mut fields: Vec<String> = vec!["S".into(), ppid.to_string(), pgrp.to_string()];
    fields.extend(std::iter::repeat_n("0".to_string(), 8));
    fields.push(utime.to_string());
    fields.push(stime.to_string());
    fields.extend(std::iter::repeat_n("0".to_string(), 26));
    fields.push(blkio.to_string());
    fields.extend(std::iter::repeat_n("0".to_string(), 12));
    format!("{} ({}) {}\n", pid, comm, fields.join(" "))
}

/// Builds a `/proc/[pid]/status` body.
pub fn status_body(name: &str, ppid: u32, vm_peak: u64, vm_size: u64, vm_hwm: u64, vm_rss: u64, threads: u32) -> String {
    format!(
        "Name:\t{name}\nState:\tS (sleeping)\nPPid:\t{ppid}\n\
         VmPeak:\t{vm_peak} kB\nVmSize:\t{vm_size} kB\n\
         VmHWM:\t{vm_hwm} kB\nVmRSS:\t{vm_rss} kB\nThreads:\t{threads}\n"
    )
}

/// Builds a `/proc/[pid]/io` body.
pub fn io_body(rchar: u64, wchar: u64, syscr: u64, syscw: u64, read_bytes: u64, write_bytes: u64) -> String {
    format!(
        "rchar: {rchar}\nwchar: {wchar}\nsyscr: {syscr}\nsyscw: {syscw}\n\
         read_bytes: {read_bytes}\nwrite_bytes: {write_bytes}\ncancelled_write_bytes: 0\n"
    )
}

impl MockFs {
    /// A harness (pid 100) leading process group 100 with two job processes,
    /// plus an unrelated process in group 200.
    ///
    /// - 101 `sh`: no `io` view, no environ
    /// - 102 `worker`: full views, `PMI_RANK=2` in its environ
    /// - 300 `other`: group 200
    pub fn job_group() -> Self {
        let mut fs = Self::new();

        fs.add_process(
            100,
            &stat_line(100, "kickmon", 1, 100, 10, 5, 0),
            &status_body("kickmon", 1, 20000, 18000, 4000, 3900, 2),
            &io_body(1000, 2000, 10, 20, 0, 0),
        );
        fs.add_link("/proc/100/exe", "/usr/bin/kickmon");

        fs.add_process(
            101,
            &stat_line(101, "sh", 100, 100, 3, 1, 0),
            &status_body("sh", 100, 8000, 7000, 1500, 1200, 1),
            "",
        );
        fs.add_link("/proc/101/exe", "/bin/sh");

        fs.add_process(
            102,
            &stat_line(102, "worker", 101, 100, 250, 50, 40),
            &status_body("worker", 101, 500000, 450000, 120000, 100000, 4),
            &io_body(4096, 8192, 4, 8, 1024, 2048),
        );
        fs.add_link("/proc/102/exe", "/opt/app/bin/worker");
        fs.add_file(
            "/proc/102/environ",
            "HOME=/home/user\0PMI_RANK=2\0_=/usr/bin/kickmon\0",
        );

        fs.add_process(
            300,
            &stat_line(300, "other", 1, 200, 1, 1, 0),
            &status_body("other", 1, 1000, 1000, 100, 100, 1),
            "",
        );

        fs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::traits::FileSystem;
    use std::path::Path;

    #[test]
    fn test_stat_line_field_positions() {
        let line = stat_line(7, "a b", 1, 7, 11, 12, 13);
        let after = &line[line.rfind(')').unwrap() + 1..];
        let fields: Vec<&str> = after.split_whitespace().collect();
        assert_eq!(fields[2], "7");
        assert_eq!(fields[11], "11");
        assert_eq!(fields[12], "12");
        assert_eq!(fields[39], "13");
    }

    #[test]
    fn test_job_group_layout() {
        let fs = MockFs::job_group();
        assert_eq!(fs.read_dir(Path::new("/proc")).unwrap().len(), 4);
        assert!(!fs.exists(Path::new("/proc/101/io")));
        assert!(fs.exists(Path::new("/proc/102/environ")));
    }
}
