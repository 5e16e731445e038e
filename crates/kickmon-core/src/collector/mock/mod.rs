//! In-memory `/proc` fixtures for tests.

mod filesystem;
pub mod scenarios;

pub use filesystem::MockFs;
