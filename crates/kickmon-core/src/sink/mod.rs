//! Telemetry publishing targets.
//!
//! The endpoint URL is parsed once into a [`Sink`]:
//!
//! | scheme                      | sink          | payload                      |
//! |-----------------------------|---------------|------------------------------|
//! | `http://`, `https://`       | `Http`        | JSON document                |
//! | `rabbitmq://`, `rabbitmqs://` | `RabbitRelay` | base64 JSON in an envelope |
//! | `file://<path>`             | `File`        | JSON document, one per line  |
//! | `kickstart://<host>:<port>` | `PeerSocket`  | binary frame ([`crate::wire`]) |

pub mod file;
pub mod http;
pub mod json;
pub mod peer;

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::config::JobIds;
use crate::error::{MonitorError, Result};
use crate::stats::ProcessStats;

pub use file::FileSink;
pub use http::{HttpSink, RabbitSink};
pub use json::{Encoded, EncodeError, TelemetryBuffer, TelemetryDocument};
pub use peer::PeerSink;

/// Destination of published telemetry.
#[derive(Debug, Clone)]
pub enum Sink {
    Http(HttpSink),
    RabbitRelay(RabbitSink),
    File(FileSink),
    PeerSocket(PeerSink),
}

impl Sink {
    /// Selects the sink for an endpoint URL.
    pub fn from_url(url: &str) -> Result<Self> {
        let url = url.trim();
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| MonitorError::UnknownScheme(url.to_string()))?;

        match scheme.to_ascii_lowercase().as_str() {
            "http" | "https" => Ok(Sink::Http(HttpSink::new(url)?)),
            "rabbitmq" | "rabbitmqs" => Ok(Sink::RabbitRelay(RabbitSink::new(url)?)),
            "file" if !rest.is_empty() => Ok(Sink::File(FileSink::new(rest))),
            "file" => Err(MonitorError::Config("file:// endpoint without a path".into())),
            "kickstart" => Ok(Sink::PeerSocket(PeerSink::new(rest)?)),
            _ => Err(MonitorError::UnknownScheme(url.to_string())),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Sink::Http(_) => "http",
            Sink::RabbitRelay(_) => "rabbitmq",
            Sink::File(_) => "file",
            Sink::PeerSocket(_) => "peer",
        }
    }

    /// Delivers an encoded JSON document. The peer sink does not carry JSON.
    pub fn send_json(&self, document: &[u8]) -> Result<()> {
        match self {
            Sink::Http(sink) => sink.post(document),
            Sink::RabbitRelay(sink) => sink.post(document),
            Sink::File(sink) => sink.append(document),
            Sink::PeerSocket(_) => Err(MonitorError::Config(
                "peer sink carries process snapshots only".into(),
            )),
        }
    }
}

/// Encodes and delivers telemetry for one stream.
///
/// Owns the stream's buffer; each monitoring thread has its own publisher.
#[derive(Debug)]
pub struct Publisher {
    sink: Option<Sink>,
    buffer: TelemetryBuffer,
    job: JobIds,
}

impl Publisher {
    /// Builds a publisher for `endpoint`. A missing or unusable endpoint is
    /// logged once and yields a publisher that drops everything.
    pub fn new(endpoint: Option<&str>, job: JobIds) -> Self {
        let sink = match endpoint.map(Sink::from_url) {
            Some(Ok(sink)) => {
                debug!(sink = sink.kind(), "telemetry sink configured");
                Some(sink)
            }
            Some(Err(e)) => {
                error!(error = %e, "telemetry disabled");
                None
            }
            None => None,
        };
        Self::with_sink(sink, job)
    }

    pub fn with_sink(sink: Option<Sink>, job: JobIds) -> Self {
        Self {
            sink,
            buffer: TelemetryBuffer::new(),
            job,
        }
    }

    pub fn sink(&self) -> Option<&Sink> {
        self.sink.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.sink.is_some()
    }

    /// Publishes a process snapshot: a binary frame to a peer, a JSON
    /// document everywhere else.
    pub fn publish_stats(&mut self, stats: &ProcessStats) -> Result<()> {
        match &self.sink {
            None => Ok(()),
            Some(Sink::PeerSocket(peer)) => peer.send(stats),
            Some(sink) => {
                let document = TelemetryDocument::new(stats, &self.job);
                let encoded = self.buffer.encode(&document)?;
                sink.send_json(encoded)
            }
        }
    }

    /// Publishes an arbitrary JSON document. Dropped with a warning when
    /// the sink is a peer socket.
    pub fn publish_document<T: Serialize>(&mut self, document: &T) -> Result<()> {
        match &self.sink {
            None => Ok(()),
            Some(Sink::PeerSocket(peer)) => {
                warn!(peer = peer.address(), "peer sink cannot carry this document, dropped");
                Ok(())
            }
            Some(sink) => {
                let encoded = self.buffer.encode(document)?;
                sink.send_json(encoded)
            }
        }
    }
}
