//! Per-process statistics collection from `/proc`.
//!
//! ```text
//!   ProcessCollector ──► FileSystem (trait)
//!                            │
//!                  ┌─────────┴─────────┐
//!               RealFs               MockFs
//!              (Linux)          (tests, fixtures)
//! ```
//!
//! A snapshot is assembled from `/proc/[pid]/stat`, `status` and `io`. Each
//! view is optional; only a process with no readable view is reported as
//! gone.

pub mod mock;
pub mod procfs;
pub mod traits;

pub use mock::MockFs;
pub use procfs::{CollectError, ProcessCollector};
pub use traits::{FileSystem, RealFs};
