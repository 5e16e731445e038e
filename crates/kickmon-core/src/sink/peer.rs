//! Sends framed snapshots to a coordinating aggregator.

use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::error::{MonitorError, Result};
use crate::stats::ProcessStats;
use crate::wire;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct PeerSink {
    address: String,
}

impl PeerSink {
    /// `address` is `host:port` as advertised by the aggregator.
    pub fn new(address: impl Into<String>) -> Result<Self> {
        let address = address.into();
        if address.rsplit_once(':').is_none_or(|(host, port)| {
            host.is_empty() || port.parse::<u16>().is_err()
        }) {
            return Err(MonitorError::Config(format!(
                "peer address '{}' is not host:port",
                address
            )));
        }
        Ok(Self { address })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Opens one connection, writes exactly one frame and closes it.
    pub fn send(&self, stats: &ProcessStats) -> Result<()> {
        let target = self.resolve()?;
        let mut stream = TcpStream::connect_timeout(&target, CONNECT_TIMEOUT)?;
        stream.set_write_timeout(Some(CONNECT_TIMEOUT))?;
        stream.write_all(&wire::encode(stats))?;
        stream.shutdown(Shutdown::Write)?;
        Ok(())
    }

    fn resolve(&self) -> Result<SocketAddr> {
        self.address
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| MonitorError::Config(format!("cannot resolve '{}'", self.address)))
    }
}
