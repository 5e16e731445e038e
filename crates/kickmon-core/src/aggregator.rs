//! Coordinator-side listener for peer reports.
//!
//! Each report is one TCP connection carrying exactly one frame. Frames of
//! the wrong size or with a bad header are dropped without touching the list.
//! There is no acknowledgment and no authentication.

use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::Result;
use crate::stats::{ProcessStats, ProcessStatsList};
use crate::wire;

/// How long a connected peer may take to deliver its frame. Peers write the
/// whole frame right after connecting, so this only bounds how long a stalled
/// peer can hold up the monitoring thread.
const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Pause after a failed `accept`. The connection stays queued and the
/// listener stays readable, so without it the poll loop would spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct Aggregator {
    listener: TcpListener,
    advertised: String,
}

impl Aggregator {
    /// Listens on an ephemeral port on every interface and advertises it
    /// under `host`.
    pub fn bind(host: Ipv4Addr) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();
        let advertised = format!("{}:{}", host, port);
        debug!(%advertised, "aggregator listening");
        Ok(Self {
            listener,
            advertised,
        })
    }

    /// `host:port` for descendants to report to.
    pub fn advertised(&self) -> &str {
        &self.advertised
    }

    fn accept(&self) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        match self.listener.accept() {
            Ok(conn) => Ok(Some(conn)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Reads the single frame a peer sends on `stream`.
    fn read_report(stream: TcpStream, peer: SocketAddr) -> Result<ProcessStats> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;

        // one byte past a frame is enough to detect an oversized report
        let mut frame = Vec::with_capacity(wire::FRAME_SIZE + 1);
        stream
            .take(wire::FRAME_SIZE as u64 + 1)
            .read_to_end(&mut frame)?;

        let stats = wire::decode(&frame)?;
        debug!(%peer, pid = stats.pid, host = %stats.host, "peer report");
        Ok(stats)
    }

    /// Accepts one pending report. `Ok(None)` when no connection is waiting.
    pub fn receive(&self) -> Result<Option<ProcessStats>> {
        match self.accept()? {
            Some((stream, peer)) => Self::read_report(stream, peer).map(Some),
            None => Ok(None),
        }
    }

    /// Folds every pending report into `list` and returns how many were
    /// folded. Malformed reports are logged and dropped. A failed `accept`
    /// ends the drain; whatever is still queued is picked up next time.
    pub fn drain_into(&self, list: &mut ProcessStatsList) -> usize {
        let mut folded = 0;
        loop {
            let (stream, peer) = match self.accept() {
                Ok(Some(conn)) => conn,
                Ok(None) => return folded,
                Err(e) => {
                    warn!(error = %e, "cannot accept peer report");
                    std::thread::sleep(ACCEPT_BACKOFF);
                    return folded;
                }
            };
            match Self::read_report(stream, peer) {
                Ok(stats) => {
                    list.update(stats);
                    folded += 1;
                }
                Err(e) => warn!(%peer, error = %e, "dropping peer report"),
            }
        }
    }
}

impl AsFd for Aggregator {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.listener.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpStream;

    fn connect(agg: &Aggregator) -> TcpStream {
        let port = agg.advertised().rsplit_once(':').unwrap().1;
        TcpStream::connect(("127.0.0.1", port.parse::<u16>().unwrap())).unwrap()
    }

    fn report(pid: u32, ts: f64) -> ProcessStats {
        ProcessStats {
            ts,
            pid,
            host: "10.9.8.7".into(),
            utime: 1.0,
            ..Default::default()
        }
    }

    fn wait_for_reports(agg: &Aggregator, list: &mut ProcessStatsList, expected: usize) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut total = 0;
        while total < expected && std::time::Instant::now() < deadline {
            total += agg.drain_into(list);
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_advertised_address_uses_host() {
        let agg = Aggregator::bind(Ipv4Addr::new(10, 1, 2, 3)).unwrap();
        assert!(agg.advertised().starts_with("10.1.2.3:"));
    }

    #[test]
    fn test_no_pending_report() {
        let agg = Aggregator::bind(Ipv4Addr::LOCALHOST).unwrap();
        assert!(agg.receive().unwrap().is_none());
    }

    #[test]
    fn test_well_formed_reports_fold_by_key() {
        let agg = Aggregator::bind(Ipv4Addr::LOCALHOST).unwrap();
        let mut list = ProcessStatsList::new();

        for (pid, ts) in [(5, 1.0), (6, 1.0), (5, 2.0)] {
            let mut stream = connect(&agg);
            stream.write_all(&wire::encode(&report(pid, ts))).unwrap();
        }
        wait_for_reports(&agg, &mut list, 3);

        assert_eq!(list.len(), 2);
        assert_eq!(list.get("10.9.8.7", 5).unwrap().ts, 2.0);
    }

    #[test]
    fn test_wrong_length_report_rejected() {
        let agg = Aggregator::bind(Ipv4Addr::LOCALHOST).unwrap();
        let mut list = ProcessStatsList::new();

        let mut frame = wire::encode(&report(5, 1.0));
        frame.pop();
        let mut short = connect(&agg);
        short.write_all(&frame).unwrap();
        drop(short);

        let mut frame = wire::encode(&report(6, 1.0));
        frame.extend_from_slice(&[0, 0, 0]);
        let mut long = connect(&agg);
        long.write_all(&frame).unwrap();
        drop(long);

        // a good report afterwards proves both bad ones were consumed
        let mut good = connect(&agg);
        good.write_all(&wire::encode(&report(7, 1.0))).unwrap();
        drop(good);

        wait_for_reports(&agg, &mut list, 1);
        assert_eq!(list.len(), 1);
        assert!(list.get("10.9.8.7", 7).is_some());
    }

    #[test]
    fn test_stalled_peer_does_not_hold_up_drain() {
        let agg = Aggregator::bind(Ipv4Addr::LOCALHOST).unwrap();
        let mut list = ProcessStatsList::new();

        let _silent = connect(&agg);
        let mut good = connect(&agg);
        good.write_all(&wire::encode(&report(7, 1.0))).unwrap();
        drop(good);

        let started = std::time::Instant::now();
        wait_for_reports(&agg, &mut list, 1);
        assert!(list.get("10.9.8.7", 7).is_some());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_accept_failure_ends_drain() {
        let agg = Aggregator::bind(Ipv4Addr::LOCALHOST).unwrap();
        let mut list = ProcessStatsList::new();
        let _queued = connect(&agg);

        // the child runs with no descriptors to spare, so every accept
        // fails with EMFILE while the connection stays queued
        let pid = unsafe { libc::fork() };
        assert!(pid >= 0);
        if pid == 0 {
            unsafe {
                let mut limit: libc::rlimit = std::mem::zeroed();
                libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit);
                limit.rlim_cur = 0;
                libc::setrlimit(libc::RLIMIT_NOFILE, &limit);
                // a drain that never returns is killed by SIGALRM
                libc::alarm(5);
                let folded = agg.drain_into(&mut list);
                libc::_exit(if folded == 0 && list.is_empty() { 0 } else { 1 });
            }
        }

        let mut status = 0;
        assert_eq!(unsafe { libc::waitpid(pid, &mut status, 0) }, pid);
        assert!(libc::WIFEXITED(status), "drain did not return: status {status:#x}");
        assert_eq!(libc::WEXITSTATUS(status), 0);
    }
}
