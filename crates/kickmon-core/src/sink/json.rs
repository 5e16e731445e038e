//! JSON telemetry documents and the bounded encoding buffer.

use std::io::{self, Write};

use serde::Serialize;

use crate::config::JobIds;
use crate::stats::ProcessStats;

/// Starting size of a [`TelemetryBuffer`].
pub const INITIAL_CAPACITY: usize = 1024;

/// Largest buffer an interval may grow to before the document is dropped.
pub const MAX_CAPACITY: usize = 1024 * 1024;

/// Flat document published for every process snapshot.
///
/// All fields are always present; unset identifiers are empty strings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryDocument<'a> {
    /// Whole seconds since the Unix epoch.
    pub ts: i64,
    pub wf_uuid: &'a str,
    pub wf_label: &'a str,
    pub dag_job_id: &'a str,
    pub condor_job_id: &'a str,
    pub xformation: &'a str,
    pub task_id: &'a str,
    pub pid: u32,
    pub exe: &'a str,
    pub utime: f64,
    pub stime: f64,
    pub iowait: f64,
    pub vm: u64,
    pub rss: u64,
    pub procs: u32,
    pub threads: u32,
    pub bread: u64,
    pub bwrite: u64,
    pub rchar: u64,
    pub wchar: u64,
    pub syscr: u64,
    pub syscw: u64,
}

impl<'a> TelemetryDocument<'a> {
    pub fn new(stats: &'a ProcessStats, job: &'a JobIds) -> Self {
        Self {
            ts: stats.ts.floor() as i64,
            wf_uuid: &job.wf_uuid,
            wf_label: &job.wf_label,
            dag_job_id: &job.dag_job_id,
            condor_job_id: &job.condor_job_id,
            xformation: &job.xformation,
            task_id: &job.task_id,
            pid: stats.pid,
            exe: &stats.exe,
            utime: stats.utime,
            stime: stats.stime,
            iowait: stats.iowait,
            vm: stats.vm,
            rss: stats.rss,
            procs: stats.procs,
            threads: stats.threads,
            bread: stats.read_bytes,
            bwrite: stats.write_bytes,
            rchar: stats.rchar,
            wchar: stats.wchar,
            syscr: stats.syscr,
            syscw: stats.syscw,
        }
    }
}

/// Result of one encoding attempt into a fixed-size region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoded {
    /// The complete document occupies the first `n` bytes.
    Complete(usize),
    /// The region was too small; nothing usable was produced.
    NeedsMoreSpace,
}

/// Document could not be encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Still too large at the buffer ceiling.
    TooLarge { limit: usize },
    /// Serializer failure unrelated to space.
    Json(String),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodeError::TooLarge { limit } => {
                write!(f, "document exceeds {} byte buffer limit", limit)
            }
            EncodeError::Json(msg) => write!(f, "JSON serialization failed: {}", msg),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Writer over a fixed slice that refuses to overflow.
struct Bounded<'a> {
    out: &'a mut [u8],
    len: usize,
    overflowed: bool,
}

impl Write for Bounded<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let end = self.len + buf.len();
        if end > self.out.len() {
            self.overflowed = true;
            return Err(io::Error::new(io::ErrorKind::WriteZero, "buffer full"));
        }
        self.out[self.len..end].copy_from_slice(buf);
        self.len = end;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Encodes `doc` into `out` without allocating.
pub fn encode_into<T: Serialize>(doc: &T, out: &mut [u8]) -> Result<Encoded, EncodeError> {
    let mut writer = Bounded {
        out,
        len: 0,
        overflowed: false,
    };
    match serde_json::to_writer(&mut writer, doc) {
        Ok(()) => Ok(Encoded::Complete(writer.len)),
        Err(_) if writer.overflowed => Ok(Encoded::NeedsMoreSpace),
        Err(e) => Err(EncodeError::Json(e.to_string())),
    }
}

/// Reusable encoding buffer that doubles on demand up to [`MAX_CAPACITY`].
#[derive(Debug, Clone)]
pub struct TelemetryBuffer {
    buf: Vec<u8>,
    limit: usize,
}

impl Default for TelemetryBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryBuffer {
    pub fn new() -> Self {
        Self::with_limits(INITIAL_CAPACITY, MAX_CAPACITY)
    }

    pub fn with_limits(initial: usize, limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            buf: vec![0; initial.clamp(1, limit)],
            limit,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Encodes `doc`, growing the buffer as needed. The returned slice is the
    /// complete document; partial output is never returned.
    pub fn encode<T: Serialize>(&mut self, doc: &T) -> Result<&[u8], EncodeError> {
        loop {
            match encode_into(doc, &mut self.buf)? {
                Encoded::Complete(n) => return Ok(&self.buf[..n]),
                Encoded::NeedsMoreSpace if self.buf.len() >= self.limit => {
                    return Err(EncodeError::TooLarge { limit: self.limit });
                }
                Encoded::NeedsMoreSpace => {
                    let grown = (self.buf.len() * 2).min(self.limit);
                    self.buf.resize(grown, 0);
                }
            }
        }
    }
}
