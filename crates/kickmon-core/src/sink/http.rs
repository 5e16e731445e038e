//! HTTP publishing, plain and through a RabbitMQ management relay.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::Url;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;

use crate::error::{MonitorError, Result};

/// Routing key used for every relayed document.
pub const ROUTING_KEY: &str = "kickstart.monitoring";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Posts JSON bodies to a fixed URL.
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: HttpClient,
    url: Url,
    credentials: Option<(String, Option<String>)>,
}

impl HttpSink {
    /// Builds a sink for `url`. User info in the URL is moved into HTTP basic
    /// authentication.
    pub fn new(url: &str) -> Result<Self> {
        let mut url = Url::parse(url)
            .map_err(|e| MonitorError::Config(format!("invalid endpoint '{}': {}", url, e)))?;

        let credentials = if url.username().is_empty() {
            None
        } else {
            let user = url.username().to_string();
            let password = url.password().map(str::to_string);
            // cannot fail for http(s) URLs
            let _ = url.set_username("");
            let _ = url.set_password(None);
            Some((user, password))
        };

        let client = HttpClient::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| MonitorError::Http(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url,
            credentials,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    pub fn post(&self, body: &[u8]) -> Result<()> {
        let mut request = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_vec());
        if let Some((user, password)) = &self.credentials {
            request = request.basic_auth(user, password.as_deref());
        }

        let response = request.send()?;
        if !response.status().is_success() {
            return Err(MonitorError::Http(format!(
                "{} returned {}",
                self.url,
                response.status()
            )));
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct RelayEnvelope<'a> {
    properties: serde_json::Map<String, serde_json::Value>,
    routing_key: &'a str,
    payload: String,
    payload_encoding: &'a str,
}

/// Wraps documents in a RabbitMQ management-API publish envelope.
#[derive(Debug, Clone)]
pub struct RabbitSink {
    http: HttpSink,
}

impl RabbitSink {
    /// `url` must use the `rabbitmq://` or `rabbitmqs://` scheme; it is
    /// rewritten to `http://` / `https://` for the actual request.
    pub fn new(url: &str) -> Result<Self> {
        let rewritten = rewrite_rabbit_scheme(url)
            .ok_or_else(|| MonitorError::UnknownScheme(url.to_string()))?;
        Ok(Self {
            http: HttpSink::new(&rewritten)?,
        })
    }

    pub fn http(&self) -> &HttpSink {
        &self.http
    }

    pub fn post(&self, document: &[u8]) -> Result<()> {
        let envelope = envelope(document)?;
        self.http.post(&envelope)
    }
}

/// Builds the relay envelope around an encoded document.
pub fn envelope(document: &[u8]) -> Result<Vec<u8>> {
    let envelope = RelayEnvelope {
        properties: serde_json::Map::new(),
        routing_key: ROUTING_KEY,
        payload: STANDARD.encode(document),
        payload_encoding: "base64",
    };
    serde_json::to_vec(&envelope).map_err(|e| MonitorError::Http(e.to_string()))
}

/// Maps `rabbitmq://` to `http://` and `rabbitmqs://` to `https://`, with
/// the scheme matched case-insensitively.
fn rewrite_rabbit_scheme(url: &str) -> Option<String> {
    let (scheme, rest) = url.split_once("://")?;
    if scheme.eq_ignore_ascii_case("rabbitmqs") {
        Some(format!("https://{}", rest))
    } else if scheme.eq_ignore_ascii_case("rabbitmq") {
        Some(format!("http://{}", rest))
    } else {
        None
    }
}
