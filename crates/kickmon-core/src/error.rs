//! Error types shared across the monitoring core.

use std::io;

use crate::collector::CollectError;
use crate::sink::json::EncodeError;
use crate::wire::WireError;

/// Result type for monitoring operations.
pub type Result<T> = std::result::Result<T, MonitorError>;

/// Errors surfaced by the monitoring core.
///
/// Only configuration and thread-startup failures are meant to reach the
/// harness; everything else is logged by the caller and the affected sample
/// is dropped.
#[derive(Debug)]
pub enum MonitorError {
    /// I/O error on a socket, pipe, timer or file.
    Io(io::Error),
    /// Invalid or unsupported configuration value.
    Config(String),
    /// Endpoint URL with a scheme no sink understands.
    UnknownScheme(String),
    /// Snapshot collection failed.
    Collect(CollectError),
    /// JSON document could not be encoded within the buffer ceiling.
    Encode(EncodeError),
    /// Peer report frame was malformed.
    Wire(WireError),
    /// HTTP publish failed or was refused.
    Http(String),
    /// GPU management interface failed.
    Gpu(String),
    /// A monitoring thread could not be started.
    Thread(String),
}

impl std::fmt::Display for MonitorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorError::Io(e) => write!(f, "I/O error: {}", e),
            MonitorError::Config(msg) => write!(f, "invalid configuration: {}", msg),
            MonitorError::UnknownScheme(url) => write!(f, "unsupported endpoint scheme: {}", url),
            MonitorError::Collect(e) => write!(f, "collection failed: {}", e),
            MonitorError::Encode(e) => write!(f, "encoding failed: {}", e),
            MonitorError::Wire(e) => write!(f, "malformed peer report: {}", e),
            MonitorError::Http(msg) => write!(f, "HTTP publish failed: {}", msg),
            MonitorError::Gpu(msg) => write!(f, "GPU query failed: {}", msg),
            MonitorError::Thread(msg) => write!(f, "cannot start monitoring thread: {}", msg),
        }
    }
}

impl std::error::Error for MonitorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MonitorError::Io(e) => Some(e),
            MonitorError::Collect(e) => Some(e),
            MonitorError::Encode(e) => Some(e),
            MonitorError::Wire(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for MonitorError {
    fn from(e: io::Error) -> Self {
        MonitorError::Io(e)
    }
}

impl From<CollectError> for MonitorError {
    fn from(e: CollectError) -> Self {
        MonitorError::Collect(e)
    }
}

impl From<EncodeError> for MonitorError {
    fn from(e: EncodeError) -> Self {
        MonitorError::Encode(e)
    }
}

impl From<WireError> for MonitorError {
    fn from(e: WireError) -> Self {
        MonitorError::Wire(e)
    }
}

impl From<reqwest::Error> for MonitorError {
    fn from(e: reqwest::Error) -> Self {
        MonitorError::Http(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MonitorError::UnknownScheme("gopher://x".to_string());
        assert_eq!(err.to_string(), "unsupported endpoint scheme: gopher://x");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "missing");
        let err = MonitorError::from(io_err);
        assert!(err.to_string().contains("I/O error"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
