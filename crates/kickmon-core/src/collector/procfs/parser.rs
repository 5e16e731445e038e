//! Parsers for `/proc` files.
//!
//! These are pure functions over file contents so they can be tested with
//! string inputs.

use std::collections::HashMap;

/// Error type for parsing failures.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
}

impl ParseError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Parse error: {}", self.message)
    }
}

impl std::error::Error for ParseError {}

/// Fields of `/proc/[pid]/stat` used for accounting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcStat {
    pub pid: u32,
    pub comm: String,
    pub ppid: u32,
    pub pgrp: i32,
    /// User CPU time in clock ticks.
    pub utime: u64,
    /// System CPU time in clock ticks.
    pub stime: u64,
    /// Aggregated block I/O delay in clock ticks; zero when the kernel does
    /// not report it.
    pub delayacct_blkio_ticks: u64,
}

/// Parses `/proc/[pid]/stat` content.
///
/// The comm field can contain spaces and parentheses, so the remaining fields
/// are taken after the last `)`.
pub fn parse_proc_stat(content: &str) -> Result<ProcStat, ParseError> {
    let content = content.trim();

    let open_paren = content
        .find('(')
        .ok_or_else(|| ParseError::new("missing '(' in stat"))?;
    let close_paren = content
        .rfind(')')
        .ok_or_else(|| ParseError::new("missing ')' in stat"))?;

    if close_paren <= open_paren {
        return Err(ParseError::new("invalid parentheses in stat"));
    }

    let pid: u32 = content[..open_paren]
        .trim()
        .parse()
        .map_err(|_| ParseError::new("invalid pid"))?;
    let comm = content[open_paren + 1..close_paren].to_string();

    let fields: Vec<&str> = content[close_paren + 1..].split_whitespace().collect();
    if fields.len() < 13 {
        return Err(ParseError::new(format!(
            "not enough fields in stat: expected 13+, got {}",
            fields.len()
        )));
    }

    let parse_field = |idx: usize, name: &str| -> Result<i64, ParseError> {
        fields[idx]
            .parse()
            .map_err(|_| ParseError::new(format!("invalid {}", name)))
    };
    let parse_field_u64 = |idx: usize, name: &str| -> Result<u64, ParseError> {
        fields[idx]
            .parse()
            .map_err(|_| ParseError::new(format!("invalid {}", name)))
    };

    Ok(ProcStat {
        pid,
        comm,
        ppid: parse_field(1, "ppid")? as u32,
        pgrp: parse_field(2, "pgrp")? as i32,
        utime: parse_field_u64(11, "utime")?,
        stime: parse_field_u64(12, "stime")?,
        delayacct_blkio_ticks: fields.get(39).and_then(|s| s.parse().ok()).unwrap_or(0),
    })
}

/// Fields of `/proc/[pid]/status`. Memory values are in kB.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcStatus {
    pub name: String,
    pub ppid: u32,
    pub vm_peak: u64,
    pub vm_size: u64,
    pub vm_hwm: u64,
    pub vm_rss: u64,
    pub threads: u32,
}

/// Parses `/proc/[pid]/status` content.
///
/// Format is `key:\tvalue` pairs, one per line. Kernel threads have no `Vm*`
/// lines; those fields stay zero.
pub fn parse_proc_status(content: &str) -> Result<ProcStatus, ParseError> {
    let fields: HashMap<&str, &str> = content
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect();

    if fields.is_empty() {
        return Err(ParseError::new("empty status"));
    }

    let parse_kb = |key: &str| -> u64 {
        fields
            .get(key)
            .and_then(|s| s.split_whitespace().next())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    };

    Ok(ProcStatus {
        name: fields.get("Name").unwrap_or(&"").to_string(),
        ppid: fields.get("PPid").and_then(|s| s.parse().ok()).unwrap_or(0),
        vm_peak: parse_kb("VmPeak"),
        vm_size: parse_kb("VmSize"),
        vm_hwm: parse_kb("VmHWM"),
        vm_rss: parse_kb("VmRSS"),
        threads: fields.get("Threads").and_then(|s| s.parse().ok()).unwrap_or(0),
    })
}

/// Parsed data from `/proc/[pid]/io`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcIo {
    pub rchar: u64,
    pub wchar: u64,
    pub syscr: u64,
    pub syscw: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
}

/// Parses `/proc/[pid]/io` content.
pub fn parse_proc_io(content: &str) -> Result<ProcIo, ParseError> {
    let mut io = ProcIo::default();
    let mut seen = false;

    for line in content.lines() {
        if let Some((key, value)) = line.split_once(':') {
            let value: u64 = value.trim().parse().unwrap_or(0);
            seen = true;
            match key.trim() {
                "rchar" => io.rchar = value,
                "wchar" => io.wchar = value,
                "syscr" => io.syscr = value,
                "syscw" => io.syscw = value,
                "read_bytes" => io.read_bytes = value,
                "write_bytes" => io.write_bytes = value,
                _ => {}
            }
        }
    }

    if !seen {
        return Err(ParseError::new("empty io"));
    }
    Ok(io)
}

/// Parses a NUL-separated `/proc/[pid]/environ` into key/value pairs.
pub fn parse_environ(content: &str) -> HashMap<String, String> {
    content
        .split('\0')
        .filter_map(|entry| entry.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::scenarios::{io_body, stat_line, status_body};

    #[test]
    fn test_parse_proc_stat() {
        let stat = parse_proc_stat(&stat_line(1234, "worker", 1, 1200, 250, 50, 40)).unwrap();
        assert_eq!(stat.pid, 1234);
        assert_eq!(stat.comm, "worker");
        assert_eq!(stat.ppid, 1);
        assert_eq!(stat.pgrp, 1200);
        assert_eq!(stat.utime, 250);
        assert_eq!(stat.stime, 50);
        assert_eq!(stat.delayacct_blkio_ticks, 40);
    }

    #[test]
    fn test_parse_proc_stat_comm_with_parens() {
        let stat = parse_proc_stat(&stat_line(5, "my (odd) proc", 1, 5, 1, 2, 0)).unwrap();
        assert_eq!(stat.comm, "my (odd) proc");
        assert_eq!(stat.utime, 1);
    }

    #[test]
    fn test_parse_proc_stat_short_line() {
        let stat = parse_proc_stat("9 (old) S 1 9 9 0 0 0 0 0 0 0 7 8").unwrap();
        assert_eq!(stat.utime, 7);
        assert_eq!(stat.stime, 8);
        assert_eq!(stat.delayacct_blkio_ticks, 0);
    }

    #[test]
    fn test_parse_proc_stat_invalid() {
        assert!(parse_proc_stat("").is_err());
        assert!(parse_proc_stat("1 (x) S 1").is_err());
        assert!(parse_proc_stat("abc (x) S 1 1 1 0 0 0 0 0 0 0 1 1").is_err());
    }

    #[test]
    fn test_parse_proc_status() {
        let status = parse_proc_status(&status_body("worker", 101, 500, 450, 120, 100, 4)).unwrap();
        assert_eq!(status.name, "worker");
        assert_eq!(status.ppid, 101);
        assert_eq!(status.vm_peak, 500);
        assert_eq!(status.vm_size, 450);
        assert_eq!(status.vm_hwm, 120);
        assert_eq!(status.vm_rss, 100);
        assert_eq!(status.threads, 4);
    }

    #[test]
    fn test_parse_proc_status_kernel_thread() {
        let status = parse_proc_status("Name:\tkworker/0:1\nPPid:\t2\nThreads:\t1\n").unwrap();
        assert_eq!(status.vm_rss, 0);
        assert_eq!(status.threads, 1);
    }

    #[test]
    fn test_parse_proc_io() {
        let io = parse_proc_io(&io_body(1, 2, 3, 4, 5, 6)).unwrap();
        assert_eq!(
            io,
            ProcIo {
                rchar: 1,
                wchar: 2,
                syscr: 3,
                syscw: 4,
                read_bytes: 5,
                write_bytes: 6,
            }
        );
        assert!(parse_proc_io("").is_err());
    }

    #[test]
    fn test_parse_environ() {
        let env = parse_environ("A=1\0B=x=y\0BROKEN\0\0");
        assert_eq!(env.get("A").map(String::as_str), Some("1"));
        assert_eq!(env.get("B").map(String::as_str), Some("x=y"));
        assert_eq!(env.len(), 2);
    }
}
