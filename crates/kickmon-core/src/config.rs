//! Environment-derived configuration.
//!
//! Everything here is captured once (at attach time for the harness, at load
//! time for the shim) and never re-read afterwards.

use std::time::Duration;

use crate::error::{MonitorError, Result};

pub const ENV_INTERVAL: &str = "KICKSTART_MON_INTERVAL";
pub const ENV_URL: &str = "KICKSTART_MON_URL";
pub const ENV_GPU: &str = "KICKSTART_MON_GPU";
pub const ENV_PEER: &str = "KICKSTART_MON_PEER";
pub const ENV_HWCOUNTERS: &str = "KICKSTART_MON_HWCOUNTERS";
pub const ENV_LOG: &str = "KICKSTART_MON_LOG";
pub const ENV_LOG_FILE: &str = "KICKSTART_MON_LOG_FILE";

pub const ENV_WF_UUID: &str = "PEGASUS_WF_UUID";
pub const ENV_WF_LABEL: &str = "PEGASUS_WF_LABEL";
pub const ENV_DAG_JOB_ID: &str = "PEGASUS_DAG_JOB_ID";
pub const ENV_CONDOR_JOB_ID: &str = "CONDOR_JOBID";
pub const ENV_XFORMATION: &str = "PEGASUS_XFORMATION";
pub const ENV_TASK_ID: &str = "PEGASUS_TASK_ID";

pub const ENV_TRACE_PREFIX: &str = "KICKSTART_PREFIX";
pub const ENV_TRACE_ALL: &str = "KICKSTART_TRACE_ALL";
pub const ENV_TRACE_CWD: &str = "KICKSTART_TRACE_CWD";
pub const ENV_TRACE_IGNORE: &str = "KICKSTART_TRACE_IGNORE";
pub const ENV_TRACE_MATCH: &str = "KICKSTART_TRACE_MATCH";

/// Rank variables set by the common MPI launchers, highest priority first.
pub const RANK_VARS: &[&str] = &[
    "OMPI_COMM_WORLD_RANK",
    "ALPS_APP_PE",
    "PMI_RANK",
    "PMI_ID",
    "MPIRUN_RANK",
    "SLURM_PROCID",
];

/// Executable-path variables, highest priority first. `_` is set by most
/// shells to the path of the program being executed.
pub const EXE_VARS: &[&str] = &["KICKSTART_MON_EXE", "_"];

/// Default sampling interval when none is configured.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Longest accepted sampling interval.
pub const MAX_INTERVAL: Duration = Duration::from_secs(3600);

/// Workflow and job identifiers stamped into every published document.
///
/// Unset identifiers are empty strings, never absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobIds {
    pub wf_uuid: String,
    pub wf_label: String,
    pub dag_job_id: String,
    pub condor_job_id: String,
    pub xformation: String,
    pub task_id: String,
}

impl JobIds {
    pub fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).unwrap_or_default();
        Self {
            wf_uuid: get(ENV_WF_UUID),
            wf_label: get(ENV_WF_LABEL),
            dag_job_id: get(ENV_DAG_JOB_ID),
            condor_job_id: get(ENV_CONDOR_JOB_ID),
            xformation: get(ENV_XFORMATION),
            task_id: get(ENV_TASK_ID),
        }
    }
}

/// Configuration of one monitoring attachment (harness side).
#[derive(Debug, Clone)]
pub struct MonitoringContext {
    /// Endpoint URL; `None` means intervals produce no output.
    pub endpoint: Option<String>,
    pub job: JobIds,
    pub interval: Duration,
    /// Start the GPU telemetry thread as well.
    pub gpu: bool,
    /// Make the harness a process-group leader so the job's processes can be
    /// enumerated by group id.
    pub new_process_group: bool,
}

impl MonitoringContext {
    /// Reads the context from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the context through an arbitrary lookup (used by tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let interval = match lookup(ENV_INTERVAL) {
            Some(raw) => parse_interval(&raw)?,
            None => DEFAULT_INTERVAL,
        };

        Ok(Self {
            endpoint: lookup(ENV_URL).filter(|s| !s.trim().is_empty()),
            job: JobIds::from_lookup(&lookup),
            interval,
            gpu: lookup(ENV_GPU).is_some_and(|v| is_truthy(&v)),
            new_process_group: true,
        })
    }
}

/// Parses an interval given in whole seconds, accepting 1..=3600.
pub fn parse_interval(raw: &str) -> Result<Duration> {
    let secs: u64 = raw
        .trim()
        .parse()
        .map_err(|_| MonitorError::Config(format!("invalid interval '{}'", raw)))?;
    let interval = Duration::from_secs(secs);
    if interval.is_zero() || interval > MAX_INTERVAL {
        return Err(MonitorError::Config(format!(
            "interval {}s out of range (1..={})",
            secs,
            MAX_INTERVAL.as_secs()
        )));
    }
    Ok(interval)
}

/// Treats any value except empty, `0`, `false`, `no` and `off` as set.
pub fn is_truthy(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "no" | "off"
    )
}

/// Returns the value of the first variable in `keys` that is set and non-empty.
pub fn first_set(keys: &[&str], lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
    keys.iter()
        .filter_map(|key| lookup(key))
        .find(|value| !value.trim().is_empty())
}

/// Configuration of the preloaded shim, read once per process image.
#[derive(Debug, Clone, Default)]
pub struct ShimConfig {
    /// Trace file is `<prefix>.<pid>`; `None` disables the trace file.
    pub trace_prefix: Option<String>,
    pub trace_all: bool,
    pub trace_cwd: bool,
    pub ignore_patterns: Vec<String>,
    pub match_patterns: Vec<String>,
    /// Where the final snapshot goes: `kickstart://<peer>` when a coordinator
    /// is advertised, otherwise the configured endpoint.
    pub endpoint: Option<String>,
    pub job: JobIds,
    pub hwcounters: bool,
    pub log_filter: Option<String>,
    pub log_file: Option<String>,
}

impl ShimConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str| lookup(key).is_some_and(|v| is_truthy(&v));
        let patterns = |key: &str| -> Vec<String> {
            lookup(key)
                .map(|v| {
                    v.split(':')
                        .filter(|p| !p.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };

        let endpoint = match lookup(ENV_PEER).filter(|p| !p.trim().is_empty()) {
            Some(peer) => Some(format!("kickstart://{}", peer.trim())),
            None => lookup(ENV_URL).filter(|u| !u.trim().is_empty()),
        };

        Self {
            trace_prefix: lookup(ENV_TRACE_PREFIX).filter(|p| !p.is_empty()),
            trace_all: flag(ENV_TRACE_ALL),
            trace_cwd: flag(ENV_TRACE_CWD),
            ignore_patterns: patterns(ENV_TRACE_IGNORE),
            match_patterns: patterns(ENV_TRACE_MATCH),
            endpoint,
            job: JobIds::from_lookup(&lookup),
            hwcounters: flag(ENV_HWCOUNTERS),
            log_filter: lookup(ENV_LOG),
            log_file: lookup(ENV_LOG_FILE).filter(|p| !p.is_empty()),
        }
    }

    /// Trace file path for a given process.
    pub fn trace_path(&self, pid: u32) -> Option<String> {
        self.trace_prefix
            .as_ref()
            .map(|prefix| format!("{}.{}", prefix, pid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_context_defaults() {
        let ctx = MonitoringContext::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(ctx.interval, DEFAULT_INTERVAL);
        assert!(ctx.endpoint.is_none());
        assert!(!ctx.gpu);
        assert_eq!(ctx.job, JobIds::default());
    }

    #[test]
    fn test_context_from_env_values() {
        let ctx = MonitoringContext::from_lookup(lookup_from(&[
            (ENV_INTERVAL, "15"),
            (ENV_URL, "file:///tmp/mon.jsonl"),
            (ENV_WF_UUID, "wf-1"),
            (ENV_TASK_ID, "ID0001"),
            (ENV_GPU, "1"),
        ]))
        .unwrap();

        assert_eq!(ctx.interval, Duration::from_secs(15));
        assert_eq!(ctx.endpoint.as_deref(), Some("file:///tmp/mon.jsonl"));
        assert_eq!(ctx.job.wf_uuid, "wf-1");
        assert_eq!(ctx.job.task_id, "ID0001");
        assert_eq!(ctx.job.wf_label, "");
        assert!(ctx.gpu);
    }

    #[test]
    fn test_interval_bounds() {
        assert!(parse_interval("0").is_err());
        assert!(parse_interval("3601").is_err());
        assert!(parse_interval("abc").is_err());
        assert_eq!(parse_interval(" 3600 ").unwrap(), MAX_INTERVAL);
    }

    #[test]
    fn test_truthy() {
        assert!(is_truthy("1"));
        assert!(is_truthy("yes"));
        assert!(!is_truthy("0"));
        assert!(!is_truthy("False"));
        assert!(!is_truthy(""));
    }

    #[test]
    fn test_first_set_priority() {
        let lookup = lookup_from(&[("PMI_RANK", "3"), ("SLURM_PROCID", "7")]);
        assert_eq!(first_set(RANK_VARS, &lookup).as_deref(), Some("3"));

        let lookup = lookup_from(&[("OMPI_COMM_WORLD_RANK", " "), ("SLURM_PROCID", "7")]);
        assert_eq!(first_set(RANK_VARS, &lookup).as_deref(), Some("7"));
    }

    #[test]
    fn test_shim_prefers_peer_endpoint() {
        let cfg = ShimConfig::from_lookup(lookup_from(&[
            (ENV_PEER, "10.1.2.3:4567"),
            (ENV_URL, "http://collector/api"),
            (ENV_TRACE_PREFIX, "/tmp/ks"),
            (ENV_TRACE_IGNORE, "*.so:/opt/*"),
        ]));

        assert_eq!(cfg.endpoint.as_deref(), Some("kickstart://10.1.2.3:4567"));
        assert_eq!(cfg.trace_path(42).as_deref(), Some("/tmp/ks.42"));
        assert_eq!(cfg.ignore_patterns, vec!["*.so", "/opt/*"]);
        assert!(cfg.match_patterns.is_empty());
    }

    #[test]
    fn test_shim_without_prefix_has_no_trace() {
        let cfg = ShimConfig::from_lookup(lookup_from(&[(ENV_URL, "file:///x")]));
        assert!(cfg.trace_path(1).is_none());
        assert_eq!(cfg.endpoint.as_deref(), Some("file:///x"));
    }
}
