//! Readers for the Linux `/proc` filesystem.

pub mod fd;
pub mod parser;
pub mod process;

pub use fd::{OpenDescriptor, list_open_descriptors};
pub use process::{CollectError, ProcessCollector};
