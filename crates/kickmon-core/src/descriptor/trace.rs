//! Line-oriented trace output, one file per process.
//!
//! ```text
//! start: 1700000000.000
//! cmd: ./solver -i in.dat
//! exe: /opt/app/bin/solver
//! file: 'in.dat' 4096 4096 0 1 0 0 0
//! socket: 10.0.0.5 9999 30 50 1 1
//! threads: 3 5
//! stop: 1700000012.345
//! ```

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

use tracing::warn;

use super::table::{DescriptorEntry, DescriptorKind};

/// Writes trace lines to an optional sink.
///
/// Without a sink every call is a no-op, which is how a process without a
/// trace prefix runs. A failed write disables the sink after one warning.
#[derive(Default)]
pub struct TraceWriter {
    out: Option<Box<dyn Write + Send>>,
}

impl std::fmt::Debug for TraceWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceWriter")
            .field("enabled", &self.out.is_some())
            .finish()
    }
}

impl TraceWriter {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self { out: Some(out) }
    }

    /// Opens `path` for appending, creating it if needed.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(Box::new(file)))
    }

    pub fn is_enabled(&self) -> bool {
        self.out.is_some()
    }

    pub fn start(&mut self, ts: f64) {
        self.line(format_args!("start: {:.3}", ts));
    }

    pub fn cmd(&mut self, argv: &[String]) {
        self.line(format_args!("cmd: {}", argv.join(" ")));
    }

    pub fn exe(&mut self, path: &str) {
        self.line(format_args!("exe: {}", path));
    }

    pub fn fork(&mut self, parent_pid: u32) {
        self.line(format_args!("fork: {}", parent_pid));
    }

    /// Summary of a closed descriptor. `final_size` only applies to files.
    pub fn descriptor(&mut self, entry: &DescriptorEntry, final_size: u64) {
        match entry.kind {
            DescriptorKind::File => self.line(format_args!(
                "file: '{}' {} {} {} {} {} {} {}",
                entry.path,
                final_size,
                entry.bytes_read,
                entry.bytes_written,
                entry.read_ops,
                entry.write_ops,
                entry.bytes_sought,
                entry.seek_ops
            )),
            DescriptorKind::Socket => self.line(format_args!(
                "socket: {} {} {} {} {} {}",
                entry.path,
                entry.port,
                entry.bytes_read,
                entry.bytes_written,
                entry.read_ops,
                entry.write_ops
            )),
            DescriptorKind::None => {}
        }
    }

    pub fn truncate(&mut self, path: &str, length: u64) {
        self.line(format_args!("truncate: '{}' {}", path, length));
    }

    pub fn threads(&mut self, max_concurrent: u64, total_created: u64) {
        self.line(format_args!("threads: {} {}", max_concurrent, total_created));
    }

    pub fn stop(&mut self, ts: f64) {
        self.line(format_args!("stop: {:.3}", ts));
    }

    pub fn flush(&mut self) {
        if let Some(out) = self.out.as_mut()
            && let Err(e) = out.flush()
        {
            warn!(error = %e, "trace flush failed");
        }
    }

    /// Drops the sink, closing the underlying file.
    pub fn close(&mut self) {
        self.flush();
        self.out = None;
    }

    fn line(&mut self, args: std::fmt::Arguments<'_>) {
        let Some(out) = self.out.as_mut() else {
            return;
        };
        // one write per line so concurrent appenders never interleave mid-line
        let text = format!("{}\n", args);
        if let Err(e) = out.write_all(text.as_bytes()) {
            warn!(error = %e, "trace write failed, disabling trace output");
            self.out = None;
        }
    }
}

/// In-memory trace sink shared with the test that inspects it.
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct SharedBuffer(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

#[cfg(test)]
impl SharedBuffer {
    pub(crate) fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }

    pub(crate) fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_string).collect()
    }
}

#[cfg(test)]
impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_formats() {
        let buf = SharedBuffer::default();
        let mut trace = TraceWriter::new(Box::new(buf.clone()));

        trace.start(1700000000.0);
        trace.cmd(&["./solver".into(), "-i".into(), "in.dat".into()]);
        trace.exe("/opt/app/bin/solver");
        trace.fork(77);
        let mut file = DescriptorEntry::file("a.txt");
        file.bytes_written = 100;
        file.write_ops = 1;
        trace.descriptor(&file, 100);
        let mut sock = DescriptorEntry::socket("10.0.0.5", 9999);
        sock.bytes_read = 30;
        sock.bytes_written = 50;
        sock.read_ops = 1;
        sock.write_ops = 1;
        trace.descriptor(&sock, 0);
        trace.descriptor(&DescriptorEntry::default(), 0);
        trace.truncate("out.dat", 0);
        trace.threads(3, 5);
        trace.stop(1700000012.5);

        assert_eq!(
            buf.lines(),
            vec![
                "start: 1700000000.000",
                "cmd: ./solver -i in.dat",
                "exe: /opt/app/bin/solver",
                "fork: 77",
                "file: 'a.txt' 100 0 100 0 1 0 0",
                "socket: 10.0.0.5 9999 30 50 1 1",
                "truncate: 'out.dat' 0",
                "threads: 3 5",
                "stop: 1700000012.500",
            ]
        );
    }

    #[test]
    fn test_disabled_writer_is_noop() {
        let mut trace = TraceWriter::disabled();
        assert!(!trace.is_enabled());
        trace.start(1.0);
        trace.stop(2.0);
        trace.close();
    }

    #[test]
    fn test_open_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ks.1");

        let mut first = TraceWriter::open(&path).unwrap();
        first.start(1.0);
        first.close();
        let mut second = TraceWriter::open(&path).unwrap();
        second.stop(2.0);
        second.close();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "start: 1.000\nstop: 2.000\n");
    }
}
