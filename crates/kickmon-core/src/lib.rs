//! kickmon-core: shared library for the kickmon workspace.
//!
//! Provides:
//! - `descriptor`: per-process descriptor accounting table, path filter and trace writer
//! - `collector`: `/proc` readers producing [`stats::ProcessStats`] snapshots
//! - `stats`: snapshot model and the keyed, mergeable snapshot list
//! - `wire`: framed binary encoding of a snapshot for peer reports
//! - `sink`: telemetry publishing targets selected by endpoint URL
//! - `aggregator`: listener folding peer reports into a shared list
//! - `scheduler`: interval-driven monitoring threads (`start_monitoring`)
//! - `gpu`: optional GPU telemetry stream
//! - `config`, `logging`, `error`: ambient plumbing shared by the launcher and the shim

pub mod aggregator;
pub mod collector;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod gpu;
pub mod logging;
pub mod scheduler;
pub mod sink;
pub mod stats;
pub mod util;
pub mod wire;

pub use config::MonitoringContext;
pub use error::{MonitorError, Result};
pub use scheduler::{MonitoringSession, start_monitoring, stop_monitoring};
pub use stats::{ProcessStats, ProcessStatsList};

/// Version string used in the launcher and shim startup log lines.
pub fn version() -> String {
    format!(
        "{} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("KICKMON_GIT_SHA")
    )
}
