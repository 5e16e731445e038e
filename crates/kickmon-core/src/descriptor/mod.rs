//! Descriptor accounting for the interposition layer.
//!
//! The table maps descriptor numbers to per-descriptor byte and operation
//! counters. The tracker drives it from intercepted events, decides which
//! paths are tracked, and writes a summary line to the trace output when a
//! descriptor is closed.

pub mod filter;
pub mod table;
pub mod trace;
mod tracker;

pub use filter::PathFilter;
pub use table::{DescriptorEntry, DescriptorKind, DescriptorTable};
pub use trace::TraceWriter;
pub use tracker::{DescriptorTracker, SocketTotals};
