//! Tracing subscriber setup for the launcher and the preloaded shim.
//!
//! Both front ends log through `tracing`. Every line carries a local
//! timestamp and the emitting process id, because shim output from many
//! processes of one job usually ends up interleaved in the same file.

use std::fmt;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

/// Filter used by the shim when `KICKSTART_MON_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "warn";

/// Timer stamping `<local time> [<pid>]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PidTime;

impl FormatTime for PidTime {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        write!(
            w,
            "{} [{}]",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
            std::process::id()
        )
    }
}

/// Maps launcher flags to a level. Default is INFO; `-v` DEBUG, `-vv` TRACE,
/// `-q` errors only.
pub fn verbosity_level(verbose: u8, quiet: bool) -> Level {
    if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }
}

/// Parses a filter directive, falling back to [`DEFAULT_FILTER`].
pub fn make_filter(directive: Option<&str>) -> EnvFilter {
    directive
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the launcher subscriber on stderr. `RUST_LOG` adds directives
/// on top of the verbosity flags.
pub fn init_launcher(verbose: u8, quiet: bool) {
    let level = verbosity_level(verbose, quiet);
    let mut filter = EnvFilter::from_default_env();
    for target in ["kickmon", "kickmon_core"] {
        if let Ok(directive) = format!("{}={}", target, level).parse() {
            filter = filter.add_directive(directive);
        }
    }

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(PidTime)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Installs the shim subscriber. Output goes to `log_file` (appended) when
/// given and openable, else to stderr. Returns false if a subscriber was
/// already installed in this process.
pub fn init_shim(directive: Option<&str>, log_file: Option<&Path>) -> bool {
    let writer = match log_file.map(|p| OpenOptions::new().create(true).append(true).open(p)) {
        Some(Ok(file)) => BoxMakeWriter::new(Mutex::new(file)),
        _ => BoxMakeWriter::new(std::io::stderr),
    };

    tracing_subscriber::fmt()
        .with_env_filter(make_filter(directive))
        .with_timer(PidTime)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(writer)
        .try_init()
        .is_ok()
}
