//! Hardware performance counters via `perf_event_open(2)`.
//!
//! Counters measure user space of the calling process and are inherited by
//! threads created afterwards. A counter the kernel refuses (no PMU,
//! `perf_event_paranoid`, seccomp) stays closed and reads as zero.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use kickmon_core::stats::HwCounters;
use tracing::debug;

const PERF_TYPE_HARDWARE: u32 = 0;
const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;
const PERF_COUNT_HW_CACHE_REFERENCES: u64 = 2;
const PERF_COUNT_HW_CACHE_MISSES: u64 = 3;

const FLAG_INHERIT: u64 = 1 << 1;
const FLAG_EXCLUDE_KERNEL: u64 = 1 << 5;
const FLAG_EXCLUDE_HV: u64 = 1 << 6;

const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;

/// First published layout of `struct perf_event_attr` (`PERF_ATTR_SIZE_VER0`).
/// The kernel accepts it and zero-fills the newer fields.
#[repr(C)]
#[derive(Default)]
struct PerfEventAttr {
    kind: u32,
    size: u32,
    config: u64,
    sample_period: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events: u32,
    bp_type: u32,
    config1: u64,
}

const ATTR_SIZE_VER0: u32 = 64;

/// Open counters of one process image.
#[derive(Debug, Default)]
pub(crate) struct HwCounterGroup {
    instructions: Option<OwnedFd>,
    cycles: Option<OwnedFd>,
    cache_references: Option<OwnedFd>,
    cache_misses: Option<OwnedFd>,
}

impl HwCounterGroup {
    pub(crate) fn open() -> Self {
        Self {
            instructions: open_counter(PERF_COUNT_HW_INSTRUCTIONS),
            cycles: open_counter(PERF_COUNT_HW_CPU_CYCLES),
            cache_references: open_counter(PERF_COUNT_HW_CACHE_REFERENCES),
            cache_misses: open_counter(PERF_COUNT_HW_CACHE_MISSES),
        }
    }

    pub(crate) fn read(&self) -> HwCounters {
        HwCounters {
            instructions: read_counter(self.instructions.as_ref()),
            cycles: read_counter(self.cycles.as_ref()),
            cache_references: read_counter(self.cache_references.as_ref()),
            cache_misses: read_counter(self.cache_misses.as_ref()),
        }
    }
}

fn open_counter(config: u64) -> Option<OwnedFd> {
    let attr = PerfEventAttr {
        kind: PERF_TYPE_HARDWARE,
        size: ATTR_SIZE_VER0,
        config,
        flags: FLAG_INHERIT | FLAG_EXCLUDE_KERNEL | FLAG_EXCLUDE_HV,
        ..Default::default()
    };
    // SAFETY: attr outlives the call; pid 0 / cpu -1 measures this process
    // on any CPU, no group leader, close-on-exec.
    let fd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            &attr as *const PerfEventAttr,
            0 as libc::pid_t,
            -1 as libc::c_int,
            -1 as libc::c_int,
            PERF_FLAG_FD_CLOEXEC,
        )
    };
    if fd < 0 {
        debug!(config, error = %std::io::Error::last_os_error(), "hardware counter unavailable");
        return None;
    }
    // SAFETY: the syscall returned a fresh descriptor.
    Some(unsafe { OwnedFd::from_raw_fd(fd as libc::c_int) })
}

fn read_counter(fd: Option<&OwnedFd>) -> u64 {
    let Some(fd) = fd else {
        return 0;
    };
    let mut value = 0u64;
    // SAFETY: reads exactly 8 bytes into a u64.
    let n = unsafe {
        libc::read(
            fd.as_raw_fd(),
            &mut value as *mut u64 as *mut libc::c_void,
            std::mem::size_of::<u64>(),
        )
    };
    if n == 8 { value } else { 0 }
}
