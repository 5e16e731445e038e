//! Framed binary encoding of one [`ProcessStats`] for peer reports.
//!
//! Frame layout (all integers little-endian):
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ HEADER (16 bytes)                            │
//! │   magic: [u8; 4]        = b"KSMR"            │
//! │   version: u16          = 1                  │
//! │   _reserved: u16        = 0                  │
//! │   payload_len: u32      = RECORD_SIZE        │
//! │   crc32: u32            (of the payload)     │
//! ├──────────────────────────────────────────────┤
//! │ PAYLOAD (RECORD_SIZE bytes)                  │
//! │   ts: f64                                    │
//! │   pid, ppid, rank: u32                       │
//! │   host: [u8; 16]        NUL-padded           │
//! │   utime, stime, iowait: f64                  │
//! │   vmpeak, rsspeak, vm, rss: u64              │
//! │   procs, threads: u32                        │
//! │   instructions, cycles,                      │
//! │   cache_references, cache_misses: u64        │
//! │   read_bytes, write_bytes, rchar, wchar,     │
//! │   syscr, syscw: u64                          │
//! │   bsend, brecv: u64                          │
//! │   exe_len: u16                               │
//! │   exe: [u8; 256]        NUL-padded           │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! A frame of any other total length is rejected outright.

use crate::stats::{HwCounters, ProcessStats};

const MAGIC: [u8; 4] = *b"KSMR";
const VERSION: u16 = 1;
pub const HEADER_SIZE: usize = 16;
const HOST_LEN: usize = 16;
const EXE_LEN: usize = 256;

/// Size of the fixed payload.
pub const RECORD_SIZE: usize = 8 + 3 * 4 + HOST_LEN + 3 * 8 + 4 * 8 + 2 * 4 + 4 * 8 + 6 * 8 + 2 * 8 + 2 + EXE_LEN;

/// Size of a complete frame on the wire.
pub const FRAME_SIZE: usize = HEADER_SIZE + RECORD_SIZE;

/// Reasons a peer frame is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Frame is not exactly [`FRAME_SIZE`] bytes.
    Length { expected: usize, actual: usize },
    BadMagic([u8; 4]),
    UnsupportedVersion(u16),
    /// Header announces a payload length other than [`RECORD_SIZE`].
    PayloadLength(u32),
    Checksum { expected: u32, actual: u32 },
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Length { expected, actual } => {
                write!(f, "frame is {} bytes, expected {}", actual, expected)
            }
            WireError::BadMagic(m) => write!(f, "bad magic {:?}", m),
            WireError::UnsupportedVersion(v) => write!(f, "unsupported version {}", v),
            WireError::PayloadLength(n) => write!(f, "bad payload length {}", n),
            WireError::Checksum { expected, actual } => {
                write!(f, "checksum mismatch: header {:08x}, payload {:08x}", expected, actual)
            }
        }
    }
}

impl std::error::Error for WireError {}

/// Encodes a snapshot into a complete frame.
///
/// Host and executable strings longer than their fields are truncated at a
/// character boundary.
pub fn encode(stats: &ProcessStats) -> Vec<u8> {
    let mut payload = Writer::with_capacity(RECORD_SIZE);
    payload.f64(stats.ts);
    payload.u32(stats.pid);
    payload.u32(stats.ppid);
    payload.u32(stats.rank);
    payload.padded(truncate_utf8(&stats.host, HOST_LEN), HOST_LEN);
    payload.f64(stats.utime);
    payload.f64(stats.stime);
    payload.f64(stats.iowait);
    payload.u64(stats.vmpeak);
    payload.u64(stats.rsspeak);
    payload.u64(stats.vm);
    payload.u64(stats.rss);
    payload.u32(stats.procs);
    payload.u32(stats.threads);
    payload.u64(stats.hw.instructions);
    payload.u64(stats.hw.cycles);
    payload.u64(stats.hw.cache_references);
    payload.u64(stats.hw.cache_misses);
    payload.u64(stats.read_bytes);
    payload.u64(stats.write_bytes);
    payload.u64(stats.rchar);
    payload.u64(stats.wchar);
    payload.u64(stats.syscr);
    payload.u64(stats.syscw);
    payload.u64(stats.bsend);
    payload.u64(stats.brecv);
    let exe = truncate_utf8(&stats.exe, EXE_LEN);
    payload.u16(exe.len() as u16);
    payload.padded(exe, EXE_LEN);
    let payload = payload.0;
    debug_assert_eq!(payload.len(), RECORD_SIZE);

    let mut frame = Vec::with_capacity(FRAME_SIZE);
    frame.extend_from_slice(&MAGIC);
    frame.extend_from_slice(&VERSION.to_le_bytes());
    frame.extend_from_slice(&0u16.to_le_bytes());
    frame.extend_from_slice(&(RECORD_SIZE as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    frame
}

/// Decodes a complete frame.
pub fn decode(frame: &[u8]) -> Result<ProcessStats, WireError> {
    if frame.len() != FRAME_SIZE {
        return Err(WireError::Length {
            expected: FRAME_SIZE,
            actual: frame.len(),
        });
    }

    let mut header = Reader::new(&frame[..HEADER_SIZE]);
    let magic = header.array::<4>();
    if magic != MAGIC {
        return Err(WireError::BadMagic(magic));
    }
    let version = header.u16();
    if version != VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }
    let _reserved = header.u16();
    let payload_len = header.u32();
    if payload_len as usize != RECORD_SIZE {
        return Err(WireError::PayloadLength(payload_len));
    }
    let expected = header.u32();

    let payload = &frame[HEADER_SIZE..];
    let actual = crc32fast::hash(payload);
    if actual != expected {
        return Err(WireError::Checksum { expected, actual });
    }

    let mut r = Reader::new(payload);
    let ts = r.f64();
    let pid = r.u32();
    let ppid = r.u32();
    let rank = r.u32();
    let host = r.padded_str(HOST_LEN, HOST_LEN);
    let utime = r.f64();
    let stime = r.f64();
    let iowait = r.f64();
    let vmpeak = r.u64();
    let rsspeak = r.u64();
    let vm = r.u64();
    let rss = r.u64();
    let procs = r.u32();
    let threads = r.u32();
    let hw = HwCounters {
        instructions: r.u64(),
        cycles: r.u64(),
        cache_references: r.u64(),
        cache_misses: r.u64(),
    };
    let read_bytes = r.u64();
    let write_bytes = r.u64();
    let rchar = r.u64();
    let wchar = r.u64();
    let syscr = r.u64();
    let syscw = r.u64();
    let bsend = r.u64();
    let brecv = r.u64();
    let exe_len = (r.u16() as usize).min(EXE_LEN);
    let exe = r.padded_str(EXE_LEN, exe_len);

    Ok(ProcessStats {
        ts,
        pid,
        ppid,
        rank,
        host,
        exe,
        utime,
        stime,
        iowait,
        vmpeak,
        rsspeak,
        vm,
        rss,
        procs,
        threads,
        hw,
        read_bytes,
        write_bytes,
        rchar,
        wchar,
        syscr,
        syscw,
        bsend,
        brecv,
    })
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

struct Writer(Vec<u8>);

impl Writer {
    fn with_capacity(n: usize) -> Self {
        Self(Vec::with_capacity(n))
    }
    fn u16(&mut self, v: u16) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn u64(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn f64(&mut self, v: f64) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn padded(&mut self, s: &str, width: usize) {
        self.0.extend_from_slice(s.as_bytes());
        self.0.resize(self.0.len() + width - s.len(), 0);
    }
}

/// Sequential reader over a buffer whose length was validated up front.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }
    fn array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }
    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.array())
    }
    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.array())
    }
    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.array())
    }
    fn f64(&mut self) -> f64 {
        f64::from_le_bytes(self.array())
    }
    /// Reads a `width`-byte field holding at most `len` meaningful bytes,
    /// stopping at the first NUL.
    fn padded_str(&mut self, width: usize, len: usize) -> String {
        let field = &self.buf[self.pos..self.pos + width];
        self.pos += width;
        let field = &field[..len];
        let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        String::from_utf8_lossy(&field[..end]).into_owned()
    }
}
