use std::net::SocketAddr;

use tracing::trace;

use super::filter::PathFilter;
use super::table::{DescriptorEntry, DescriptorKind, DescriptorTable};
use super::trace::TraceWriter;
use crate::collector::procfs::OpenDescriptor;

/// Running byte totals over every socket the process touched, including
/// sockets already closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketTotals {
    pub sent: u64,
    pub received: u64,
}

/// Per-process descriptor bookkeeping.
///
/// One method per intercepted event. Callers report only successful calls;
/// events on descriptors that are not tracked are ignored.
#[derive(Debug)]
pub struct DescriptorTracker {
    table: DescriptorTable,
    filter: PathFilter,
    trace: TraceWriter,
    sockets: SocketTotals,
}

impl DescriptorTracker {
    pub fn new(filter: PathFilter, trace: TraceWriter) -> Self {
        Self {
            table: DescriptorTable::new(),
            filter,
            trace,
            sockets: SocketTotals::default(),
        }
    }

    pub fn table(&self) -> &DescriptorTable {
        &self.table
    }

    pub fn trace_mut(&mut self) -> &mut TraceWriter {
        &mut self.trace
    }

    pub fn socket_totals(&self) -> SocketTotals {
        self.sockets
    }

    /// A file was opened on `fd`. Paths rejected by the filter are not
    /// tracked; a stale entry left on the slot is closed out first.
    pub fn opened(&mut self, fd: i32, path: &str) {
        self.close_stale(fd);
        if !self.filter.accepts(path) {
            return;
        }
        if let Some(slot) = self.table.slot_mut(fd) {
            trace!(fd, path, "tracking file");
            *slot = DescriptorEntry::file(path);
        }
    }

    /// A socket on `fd` was connected to `peer`.
    pub fn connected(&mut self, fd: i32, peer: SocketAddr) {
        self.close_stale(fd);
        if let Some(slot) = self.table.slot_mut(fd) {
            trace!(fd, %peer, "tracking socket");
            *slot = DescriptorEntry::socket(peer.ip().to_string(), peer.port());
        }
    }

    /// A connection-less call on `fd` talked to `peer`.
    ///
    /// Starts socket accounting if the descriptor was untracked; if the peer
    /// changed since the last call, the old accounting is closed out and a
    /// fresh entry started. File descriptors are left alone.
    pub fn observed_peer(&mut self, fd: i32, peer: SocketAddr) {
        let address = peer.ip().to_string();
        let repoint = match self.table.get(fd) {
            None => true,
            Some(entry) => {
                entry.kind == DescriptorKind::Socket
                    && (entry.path != address || entry.port != peer.port())
            }
        };
        if repoint {
            self.connected(fd, peer);
        }
    }

    pub fn read(&mut self, fd: i32, bytes: usize) {
        let Some(entry) = self.table.live_mut(fd) else {
            return;
        };
        entry.bytes_read += bytes as u64;
        entry.read_ops += 1;
        if entry.kind == DescriptorKind::Socket {
            self.sockets.received += bytes as u64;
        }
    }

    pub fn wrote(&mut self, fd: i32, bytes: usize) {
        let Some(entry) = self.table.live_mut(fd) else {
            return;
        };
        entry.bytes_written += bytes as u64;
        entry.write_ops += 1;
        if entry.kind == DescriptorKind::Socket {
            self.sockets.sent += bytes as u64;
        }
    }

    /// A seek with offset argument `offset`; its magnitude is what counts.
    pub fn sought(&mut self, fd: i32, offset: i64) {
        if let Some(entry) = self.table.live_mut(fd) {
            entry.bytes_sought += offset.unsigned_abs();
            entry.seek_ops += 1;
        }
    }

    /// `old` was duplicated onto `new`.
    ///
    /// Whatever `new` held is implicitly closed; `new` then tracks the same
    /// target as `old` with its own zeroed counters.
    pub fn duplicated(&mut self, old: i32, new: i32, new_prior_size: u64) {
        if old == new {
            return;
        }
        if !self.table.ensure_capacity(old) || !self.table.ensure_capacity(new) {
            return;
        }
        self.closed(new, new_prior_size);
        let copy = self.table.get(old).map(DescriptorEntry::fresh_copy);
        if let (Some(copy), Some(slot)) = (copy, self.table.slot_mut(new)) {
            *slot = copy;
        }
    }

    /// `fd` was closed; a live entry is summarized to the trace and reset.
    pub fn closed(&mut self, fd: i32, final_size: u64) {
        if let Some(entry) = self.table.take(fd) {
            self.trace.descriptor(&entry, final_size);
        }
    }

    /// Implicitly closes every live descriptor, in ascending order.
    /// `size_of` supplies the final size for files.
    pub fn close_all(&mut self, size_of: impl Fn(i32) -> u64) {
        for fd in self.table.live_descriptors() {
            let size = match self.table.get(fd).map(|e| e.kind) {
                Some(DescriptorKind::File) => size_of(fd),
                _ => 0,
            };
            self.closed(fd, size);
        }
    }

    /// A path was truncated to `length`.
    pub fn truncated_path(&mut self, path: &str, length: u64) {
        if self.filter.accepts(path) {
            self.trace.truncate(path, length);
        }
    }

    /// The file behind `fd` was truncated to `length`.
    pub fn truncated_fd(&mut self, fd: i32, length: u64) {
        if let Some(entry) = self.table.get(fd)
            && entry.kind == DescriptorKind::File
        {
            let path = entry.path.clone();
            self.trace.truncate(&path, length);
        }
    }

    /// Starts tracking descriptors that were already open when the process
    /// image started. Only regular paths are tracked; sockets, pipes and
    /// anonymous inodes carry no usable address.
    pub fn seed(&mut self, descriptors: &[OpenDescriptor]) {
        for d in descriptors {
            let target = d.target.to_string_lossy();
            if target.starts_with('/') {
                self.opened(d.fd, &target);
            }
        }
    }

    fn close_stale(&mut self, fd: i32) {
        // a slot still live here means the close was not observed
        self.closed(fd, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::trace::SharedBuffer;
    use std::path::PathBuf;

    fn tracker() -> (DescriptorTracker, SharedBuffer) {
        let buf = SharedBuffer::default();
        let tracker = DescriptorTracker::new(
            PathFilter::permissive(),
            TraceWriter::new(Box::new(buf.clone())),
        );
        (tracker, buf)
    }

    #[test]
    fn test_open_write_close_file() {
        let (mut t, buf) = tracker();
        t.opened(3, "a.txt");
        t.wrote(3, 100);
        t.closed(3, 100);

        assert_eq!(buf.lines(), vec!["file: 'a.txt' 100 0 100 0 1 0 0"]);
        assert!(t.table().get(3).is_none());
    }

    #[test]
    fn test_counters_sum_observed_activity() {
        let (mut t, buf) = tracker();
        t.opened(4, "/data/in.dat");
        t.read(4, 10);
        t.read(4, 20);
        t.sought(4, -5);
        t.sought(4, 15);
        t.wrote(4, 7);

        let entry = t.table().get(4).unwrap().clone();
        assert_eq!(entry.bytes_read, 30);
        assert_eq!(entry.read_ops, 2);
        assert_eq!(entry.bytes_written, 7);
        assert_eq!(entry.write_ops, 1);
        assert_eq!(entry.bytes_sought, 20);
        assert_eq!(entry.seek_ops, 2);

        t.closed(4, 37);
        assert_eq!(buf.lines(), vec!["file: '/data/in.dat' 37 30 7 2 1 20 2"]);
    }

    #[test]
    fn test_socket_connect_send_recv_close() {
        let (mut t, buf) = tracker();
        t.connected(5, "10.0.0.5:9999".parse().unwrap());
        t.wrote(5, 50);
        t.read(5, 30);
        t.closed(5, 0);

        assert_eq!(buf.lines(), vec!["socket: 10.0.0.5 9999 30 50 1 1"]);
        assert_eq!(
            t.socket_totals(),
            SocketTotals {
                sent: 50,
                received: 30
            }
        );
    }

    #[test]
    fn test_untracked_descriptors_ignored() {
        let (mut t, buf) = tracker();
        t.read(9, 100);
        t.wrote(9, 100);
        t.sought(9, 1);
        t.closed(9, 0);
        t.read(-1, 1);
        assert!(buf.contents().is_empty());
    }

    #[test]
    fn test_filtered_path_not_tracked() {
        let buf = SharedBuffer::default();
        let mut t = DescriptorTracker::new(
            PathFilter::default(),
            TraceWriter::new(Box::new(buf.clone())),
        );
        t.opened(3, "/proc/self/status");
        t.read(3, 100);
        t.closed(3, 0);
        assert!(t.table().get(3).is_none());
        assert!(buf.contents().is_empty());
    }

    #[test]
    fn test_dup_then_close_original() {
        let (mut t, buf) = tracker();
        t.opened(3, "/data/x");
        t.read(3, 10);
        t.duplicated(3, 7, 0);

        t.closed(3, 10);
        let dup = t.table().get(7).unwrap();
        assert_eq!(dup.path, "/data/x");
        assert_eq!(dup.kind, DescriptorKind::File);
        assert_eq!(dup.bytes_read, 0);

        t.wrote(7, 4);
        t.closed(7, 14);
        assert_eq!(
            buf.lines(),
            vec!["file: '/data/x' 10 10 0 1 0 0 0", "file: '/data/x' 14 0 4 0 1 0 0"]
        );
    }

    #[test]
    fn test_dup_side_activity_is_independent() {
        let (mut t, _buf) = tracker();
        t.opened(3, "/data/x");
        t.duplicated(3, 4, 0);
        t.read(3, 100);
        assert_eq!(t.table().get(4).unwrap().bytes_read, 0);
    }

    #[test]
    fn test_dup_onto_live_descriptor_closes_it() {
        let (mut t, buf) = tracker();
        t.opened(3, "/data/a");
        t.opened(4, "/data/b");
        t.wrote(4, 2);
        t.duplicated(3, 4, 2);

        assert_eq!(buf.lines(), vec!["file: '/data/b' 2 0 2 0 1 0 0"]);
        assert_eq!(t.table().get(4).unwrap().path, "/data/a");
    }

    #[test]
    fn test_dup_beyond_capacity_grows_table() {
        let (mut t, _buf) = tracker();
        t.opened(3, "/data/a");
        t.duplicated(3, 1000, 0);
        assert!(t.table().capacity() > 1000);
        assert_eq!(t.table().get(1000).unwrap().path, "/data/a");
        assert_eq!(t.table().get(3).unwrap().path, "/data/a");
    }

    #[test]
    fn test_observed_peer_repoints_socket() {
        let (mut t, buf) = tracker();
        t.observed_peer(6, "10.0.0.1:53".parse().unwrap());
        t.wrote(6, 40);
        t.observed_peer(6, "10.0.0.1:53".parse().unwrap());
        t.read(6, 60);
        t.observed_peer(6, "10.0.0.2:53".parse().unwrap());
        t.wrote(6, 1);
        t.closed(6, 0);

        assert_eq!(
            buf.lines(),
            vec!["socket: 10.0.0.1 53 60 40 1 1", "socket: 10.0.0.2 53 0 1 0 1"]
        );
    }

    #[test]
    fn test_observed_peer_leaves_files_alone() {
        let (mut t, _buf) = tracker();
        t.opened(3, "/data/a");
        t.observed_peer(3, "10.0.0.1:53".parse().unwrap());
        assert_eq!(t.table().get(3).unwrap().kind, DescriptorKind::File);
    }

    #[test]
    fn test_close_all_uses_file_sizes() {
        let (mut t, buf) = tracker();
        t.opened(8, "/data/b");
        t.opened(3, "/data/a");
        t.connected(5, "[::1]:80".parse().unwrap());
        t.close_all(|fd| fd as u64 * 10);

        assert_eq!(
            buf.lines(),
            vec![
                "file: '/data/a' 30 0 0 0 0 0 0",
                "socket: ::1 80 0 0 0 0",
                "file: '/data/b' 80 0 0 0 0 0 0",
            ]
        );
        assert!(t.table().live_descriptors().is_empty());
    }

    #[test]
    fn test_reopen_without_close_flushes_stale_entry() {
        let (mut t, buf) = tracker();
        t.opened(3, "/data/old");
        t.opened(3, "/data/new");
        assert_eq!(buf.lines(), vec!["file: '/data/old' 0 0 0 0 0 0 0"]);
        assert_eq!(t.table().get(3).unwrap().path, "/data/new");
    }

    #[test]
    fn test_seed_tracks_regular_paths_only() {
        let (mut t, _buf) = tracker();
        t.seed(&[
            OpenDescriptor {
                fd: 0,
                target: PathBuf::from("/dev/pts/0"),
            },
            OpenDescriptor {
                fd: 3,
                target: PathBuf::from("/data/inherited.log"),
            },
            OpenDescriptor {
                fd: 4,
                target: PathBuf::from("socket:[1234]"),
            },
            OpenDescriptor {
                fd: 5,
                target: PathBuf::from("pipe:[99]"),
            },
        ]);
        assert_eq!(t.table().live_descriptors(), vec![0, 3]);
    }

    #[test]
    fn test_truncate_lines() {
        let (mut t, buf) = tracker();
        t.opened(3, "/data/a");
        t.truncated_fd(3, 12);
        t.truncated_fd(9, 1);
        t.truncated_path("/data/b", 0);
        assert_eq!(
            buf.lines(),
            vec!["truncate: '/data/a' 12", "truncate: '/data/b' 0"]
        );
    }
}
