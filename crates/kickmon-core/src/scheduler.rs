//! Interval-driven monitoring threads.
//!
//! Each telemetry stream runs on its own thread blocked in a single
//! `poll(2)` over three descriptors:
//!
//! ```text
//!   shutdown pipe ──┐
//!   aggregator  ────┼──► poll ──► drain reports / flush / exit
//!   timerfd     ────┘
//! ```
//!
//! A shutdown request produces exactly one more flush before the thread
//! exits. `EINTR` restarts the wait.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::aggregator::Aggregator;
use crate::collector::{FileSystem, ProcessCollector, RealFs};
use crate::config::MonitoringContext;
use crate::error::{MonitorError, Result};
use crate::gpu;
use crate::sink::Publisher;
use crate::stats::{ProcessStats, ProcessStatsList};
use crate::util::{current_pgrp, current_pid, epoch_secs, local_host_address};

/// Write end of the shutdown pipe plus the read end every thread polls.
#[derive(Debug)]
pub(crate) struct ShutdownSignal {
    read: OwnedFd,
    write: OwnedFd,
}

impl ShutdownSignal {
    pub(crate) fn new() -> io::Result<Self> {
        let mut fds: [RawFd; 2] = [-1; 2];
        // SAFETY: fds points at two writable ints.
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: pipe2 succeeded, both descriptors are fresh and owned here.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok(Self { read, write })
    }

    /// Descriptor that becomes readable once shutdown is requested. Nobody
    /// reads the byte, so every poller keeps seeing it.
    pub(crate) fn watch(&self) -> io::Result<OwnedFd> {
        self.read.try_clone()
    }

    pub(crate) fn signal(&self) {
        let byte = 1u8;
        // SAFETY: writes one byte from a valid local.
        let _ = unsafe {
            libc::write(
                self.write.as_raw_fd(),
                &byte as *const u8 as *const libc::c_void,
                1,
            )
        };
    }
}

/// Periodic `timerfd` on the monotonic clock.
#[derive(Debug)]
pub(crate) struct IntervalTimer {
    fd: OwnedFd,
}

impl IntervalTimer {
    pub(crate) fn new(interval: Duration) -> io::Result<Self> {
        // SAFETY: plain syscall wrapper.
        let fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_CLOEXEC | libc::TFD_NONBLOCK)
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: timerfd_create succeeded.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let period = libc::timespec {
            tv_sec: interval.as_secs() as libc::time_t,
            tv_nsec: interval.subsec_nanos() as libc::c_long,
        };
        let spec = libc::itimerspec {
            it_interval: period,
            it_value: period,
        };
        // SAFETY: spec is a valid itimerspec; old value is not requested.
        let rc = unsafe { libc::timerfd_settime(fd.as_raw_fd(), 0, &spec, std::ptr::null_mut()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    /// Consumes pending expirations; returns how many elapsed.
    pub(crate) fn acknowledge(&self) -> u64 {
        let mut expirations = 0u64;
        // SAFETY: reads exactly 8 bytes into a u64.
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut expirations as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        if n == 8 { expirations } else { 0 }
    }
}

impl AsFd for IntervalTimer {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Which sources were ready after one wait.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Ready {
    pub shutdown: bool,
    pub timer: bool,
    pub listener: bool,
}

/// Blocks until at least one source is readable, retrying on `EINTR`.
pub(crate) fn wait(
    shutdown: BorrowedFd<'_>,
    timer: BorrowedFd<'_>,
    listener: Option<BorrowedFd<'_>>,
) -> io::Result<Ready> {
    let pollfd = |fd: RawFd| libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let mut fds = [
        pollfd(shutdown.as_raw_fd()),
        pollfd(timer.as_raw_fd()),
        // a negative descriptor is ignored by poll
        pollfd(listener.map_or(-1, |l| l.as_raw_fd())),
    ];

    loop {
        // SAFETY: fds is a valid array of pollfd for the duration of the call.
        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }

        let readable =
            |p: &libc::pollfd| p.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0;
        return Ok(Ready {
            shutdown: readable(&fds[0]),
            timer: readable(&fds[1]),
            listener: readable(&fds[2]),
        });
    }
}

/// Handle to running monitoring threads.
#[derive(Debug)]
pub struct MonitoringSession {
    shutdown: ShutdownSignal,
    threads: Vec<JoinHandle<()>>,
    peer_address: String,
}

impl MonitoringSession {
    /// `host:port` of the aggregator, to be exported to descendants as
    /// `KICKSTART_MON_PEER`.
    pub fn peer_address(&self) -> &str {
        &self.peer_address
    }

    /// Requests shutdown and waits for every thread's final flush.
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        self.shutdown.signal();
        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("monitor").to_string();
            if handle.join().is_err() {
                error!(thread = %name, "monitoring thread panicked");
            }
        }
        info!("monitoring stopped");
    }
}

impl Drop for MonitoringSession {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

/// Attaches monitoring to the calling process and its process group.
///
/// Starts the process stream (and the GPU stream when enabled) and returns
/// once the threads are running.
pub fn start_monitoring(ctx: MonitoringContext) -> Result<MonitoringSession> {
    if ctx.new_process_group {
        // SAFETY: setpgid(0, 0) only changes this process's group.
        if unsafe { libc::setpgid(0, 0) } < 0 {
            debug!(error = %io::Error::last_os_error(), "keeping existing process group");
        }
    }

    let host = local_host_address();
    let aggregator = Aggregator::bind(host)?;
    let peer_address = aggregator.advertised().to_string();
    let shutdown = ShutdownSignal::new()?;

    let collector = ProcessCollector::new(RealFs::new(), "/proc", host.to_string());
    let mut threads = Vec::new();

    let process_stream = ProcessStream::new(ctx.clone(), collector, aggregator);
    let watch = shutdown.watch()?;
    threads.push(spawn("kickmon-monitor", move || process_stream.run(watch))?);

    if ctx.gpu {
        let watch = shutdown.watch()?;
        let gpu_ctx = ctx.clone();
        match spawn("kickmon-gpu", move || gpu::run_stream(gpu_ctx, watch)) {
            Ok(handle) => threads.push(handle),
            Err(e) => {
                let mut session = MonitoringSession {
                    shutdown,
                    threads,
                    peer_address,
                };
                session.shutdown_and_join();
                return Err(e);
            }
        }
    }

    info!(
        interval_secs = ctx.interval.as_secs(),
        peer = %peer_address,
        endpoint = ctx.endpoint.as_deref().unwrap_or("<none>"),
        "monitoring started"
    );
    Ok(MonitoringSession {
        shutdown,
        threads,
        peer_address,
    })
}

/// Detaches monitoring: one final report per stream, then the threads exit.
pub fn stop_monitoring(session: MonitoringSession) {
    session.stop();
}

fn spawn(name: &str, body: impl FnOnce() + Send + 'static) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map_err(|e| MonitorError::Thread(format!("{}: {}", name, e)))
}

/// The process telemetry stream.
pub(crate) struct ProcessStream<F: FileSystem> {
    ctx: MonitoringContext,
    collector: ProcessCollector<F>,
    aggregator: Aggregator,
    list: ProcessStatsList,
    publisher: Publisher,
    pid: u32,
    pgrp: i32,
}

impl<F: FileSystem> ProcessStream<F> {
    pub(crate) fn new(
        ctx: MonitoringContext,
        collector: ProcessCollector<F>,
        aggregator: Aggregator,
    ) -> Self {
        let publisher = Publisher::new(ctx.endpoint.as_deref(), ctx.job.clone());
        Self {
            ctx,
            collector,
            aggregator,
            list: ProcessStatsList::new(),
            publisher,
            pid: current_pid(),
            pgrp: current_pgrp(),
        }
    }

    pub(crate) fn run(mut self, shutdown: OwnedFd) {
        let timer = match IntervalTimer::new(self.ctx.interval) {
            Ok(timer) => timer,
            Err(e) => {
                error!(error = %e, "cannot create interval timer, monitoring disabled");
                return;
            }
        };

        loop {
            let ready = match wait(shutdown.as_fd(), timer.as_fd(), Some(self.aggregator.as_fd())) {
                Ok(ready) => ready,
                Err(e) => {
                    error!(error = %e, "poll failed, stopping monitoring");
                    self.flush();
                    return;
                }
            };

            if ready.listener {
                self.aggregator.drain_into(&mut self.list);
            }
            if ready.shutdown {
                self.flush();
                return;
            }
            if ready.timer && timer.acknowledge() > 0 {
                self.flush();
            }
        }
    }

    /// Refreshes the group, merges and publishes one snapshot.
    pub(crate) fn flush(&mut self) -> ProcessStats {
        match self.collector.scan_group(self.pgrp, self.pid) {
            Ok(members) => {
                for stats in members {
                    self.list.update(stats);
                }
            }
            Err(e) => debug!(error = %e, "process group scan skipped"),
        }

        let base = self
            .collector
            .collect_with_env(self.pid, |key| std::env::var(key).ok())
            .unwrap_or_else(|e| {
                debug!(error = %e, "cannot sample coordinator");
                ProcessStats {
                    pid: self.pid,
                    host: self.collector.host().to_string(),
                    ..Default::default()
                }
            });

        let merged = self.list.merge(&base, epoch_secs(), self.ctx.interval);
        if let Err(e) = self.publisher.publish_stats(&merged) {
            warn!(error = %e, "dropping interval report");
        }
        merged
    }
}
