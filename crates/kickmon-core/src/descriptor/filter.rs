//! Decides which file paths are worth tracking.

use std::path::{Component, Path, PathBuf};

use glob::{MatchOptions, Pattern};
use tracing::warn;

use crate::config::ShimConfig;

/// Pseudo-filesystems ignored unless everything is traced.
const DEFAULT_IGNORED_PREFIXES: &[&str] = &["/dev/", "/proc/", "/sys/"];

/// `*` crosses directory separators, so `*.so*` matches anywhere in a path.
const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    trace_all: bool,
    only_under_cwd: bool,
    cwd: PathBuf,
    trace_prefix: Option<String>,
    log_file: Option<PathBuf>,
    ignore: Vec<Pattern>,
    matches: Vec<Pattern>,
}

impl PathFilter {
    /// Accepts every path.
    pub fn permissive() -> Self {
        Self {
            trace_all: true,
            ..Default::default()
        }
    }

    pub fn from_config(cfg: &ShimConfig, cwd: impl Into<PathBuf>) -> Self {
        let mut filter = Self {
            trace_all: cfg.trace_all,
            only_under_cwd: cfg.trace_cwd,
            cwd: cwd.into(),
            ignore: compile(&cfg.ignore_patterns),
            matches: compile(&cfg.match_patterns),
            ..Default::default()
        };
        filter.trace_prefix = cfg
            .trace_prefix
            .as_deref()
            .map(|prefix| filter.absolutize(prefix).to_string_lossy().into_owned());
        filter.log_file = cfg.log_file.as_deref().map(|path| filter.absolutize(path));
        filter
    }

    /// True for the shim's own trace and log files, which are never tracked
    /// even when everything else is.
    pub fn is_own_file(&self, path: &str) -> bool {
        if path.is_empty() {
            return false;
        }
        let resolved = self.absolutize(path);
        if let Some(prefix) = &self.trace_prefix
            && resolved.to_string_lossy().starts_with(prefix.as_str())
        {
            return true;
        }
        self.log_file.as_deref() == Some(resolved.as_path())
    }

    /// Relative paths are resolved against the working directory captured at
    /// construction before any rule is applied.
    pub fn accepts(&self, path: &str) -> bool {
        if path.is_empty() || self.is_own_file(path) {
            return false;
        }
        let resolved = self.absolutize(path);

        if !self.trace_all
            && DEFAULT_IGNORED_PREFIXES
                .iter()
                .any(|prefix| resolved.to_string_lossy().starts_with(prefix))
        {
            return false;
        }

        if self.only_under_cwd && !resolved.starts_with(&self.cwd) {
            return false;
        }

        if self.ignore.iter().any(|p| matches(p, &resolved)) {
            return false;
        }

        self.matches.is_empty() || self.matches.iter().any(|p| matches(p, &resolved))
    }

    fn absolutize(&self, path: &str) -> PathBuf {
        let joined = if path.starts_with('/') {
            PathBuf::from(path)
        } else {
            self.cwd.join(path)
        };

        // lexical cleanup only; symlinks are not resolved
        let mut out = PathBuf::new();
        for component in joined.components() {
            match component {
                Component::ParentDir => {
                    out.pop();
                }
                Component::CurDir => {}
                other => out.push(other),
            }
        }
        out
    }
}

/// Compiles shell-style patterns, skipping the malformed ones.
fn compile(patterns: &[String]) -> Vec<Pattern> {
    patterns
        .iter()
        .filter_map(|raw| match Pattern::new(raw) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                warn!(pattern = %raw, error = %e, "ignoring malformed path pattern");
                None
            }
        })
        .collect()
}

fn matches(pattern: &Pattern, path: &Path) -> bool {
    pattern.matches_path_with(path, MATCH_OPTIONS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(cfg: ShimConfig) -> PathFilter {
        PathFilter::from_config(&cfg, "/work/job")
    }

    #[test]
    fn test_pattern_semantics() {
        let f = |pattern: &str| filter(ShimConfig {
            match_patterns: vec![pattern.into()],
            ..Default::default()
        });
        assert!(f("*.txt").accepts("/a/b/c.txt"));
        assert!(f("/opt/*").accepts("/opt/x/y"));
        assert!(f("/data/f??.dat").accepts("/data/foo.dat"));
        assert!(!f("/data/f??.dat").accepts("/data/fo.dat"));
        assert!(f("*/.cache/*").accepts("/home/u/.cache/x"));
        assert!(f("/data/[ab].csv").accepts("/data/b.csv"));
        assert!(!f("/data/[ab].csv").accepts("/data/c.csv"));
        assert!(!f("*.TXT").accepts("/a/b/c.txt"));
    }

    #[test]
    fn test_malformed_pattern_skipped() {
        let f = filter(ShimConfig {
            ignore_patterns: vec!["/data/[".into(), "*.tmp".into()],
            ..Default::default()
        });
        assert!(f.accepts("/data/[x"));
        assert!(!f.accepts("/data/x.tmp"));
    }

    #[test]
    fn test_default_ignores_pseudo_filesystems() {
        let f = filter(ShimConfig::default());
        assert!(!f.accepts("/dev/null"));
        assert!(!f.accepts("/proc/self/status"));
        assert!(!f.accepts("/sys/kernel/mm"));
        assert!(f.accepts("/data/input.txt"));
        assert!(f.accepts("a.txt"));
        assert!(!f.accepts(""));
    }

    #[test]
    fn test_trace_all_keeps_pseudo_filesystems() {
        let f = filter(ShimConfig {
            trace_all: true,
            ..Default::default()
        });
        assert!(f.accepts("/dev/null"));
    }

    #[test]
    fn test_trace_prefix_files_ignored() {
        let f = filter(ShimConfig {
            trace_prefix: Some("/tmp/ks".into()),
            ..Default::default()
        });
        assert!(!f.accepts("/tmp/ks.1234"));
        assert!(f.accepts("/tmp/other"));
    }

    #[test]
    fn test_own_files_ignored_even_when_tracing_all() {
        let f = filter(ShimConfig {
            trace_all: true,
            trace_prefix: Some("logs/ks".into()),
            log_file: Some("/var/log/shim.log".into()),
            ..Default::default()
        });
        assert!(f.is_own_file("/work/job/logs/ks.77"));
        assert!(!f.accepts("logs/ks.77"));
        assert!(!f.accepts("/var/log/../log/shim.log"));
        assert!(f.accepts("/var/log/other.log"));
        assert!(f.accepts("/dev/null"));
    }

    #[test]
    fn test_cwd_restriction_resolves_relative_paths() {
        let f = filter(ShimConfig {
            trace_cwd: true,
            ..Default::default()
        });
        assert!(f.accepts("out/result.dat"));
        assert!(f.accepts("/work/job/in.dat"));
        assert!(!f.accepts("/etc/passwd"));
        assert!(!f.accepts("../../etc/passwd"));
    }

    #[test]
    fn test_ignore_and_match_lists() {
        let f = filter(ShimConfig {
            ignore_patterns: vec!["*.so*".into()],
            match_patterns: vec!["/work/*".into(), "/data/*".into()],
            ..Default::default()
        });
        assert!(f.accepts("/data/x.csv"));
        assert!(f.accepts("local.csv"));
        assert!(!f.accepts("/data/libfoo.so.1"));
        assert!(!f.accepts("/etc/hosts"));
    }
}
