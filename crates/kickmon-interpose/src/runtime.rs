//! Per-process shim state.
//!
//! One [`Runtime`] is built when the library loads and installed behind an
//! atomic pointer. A forked child and a process whose `exec` failed build
//! and install a fresh one; the previous runtime is leaked because other
//! threads of the parent image may still hold references to it.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use kickmon_core::collector::procfs::list_open_descriptors;
use kickmon_core::collector::{ProcessCollector, RealFs};
use kickmon_core::config::ShimConfig;
use kickmon_core::descriptor::{DescriptorTracker, PathFilter, SocketTotals, TraceWriter};
use kickmon_core::logging;
use kickmon_core::sink::Publisher;
use kickmon_core::util::{current_pid, epoch_secs, local_host_address};
use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, info, warn};

use crate::guard::HookGuard;
use crate::hooks::fd_size;
use crate::hwcounters::HwCounterGroup;

static RUNTIME: AtomicPtr<Runtime> = AtomicPtr::new(ptr::null_mut());

/// Threads created by the application, excluding the main thread and
/// threads spawned by the shim itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ThreadCounters {
    pub live: u64,
    pub max: u64,
    pub total: u64,
}

impl ThreadCounters {
    pub(crate) fn started(&mut self) {
        self.live += 1;
        self.total += 1;
        self.max = self.max.max(self.live);
    }

    pub(crate) fn finished(&mut self) {
        self.live = self.live.saturating_sub(1);
    }

    /// Undoes a `started` whose thread never came to exist.
    pub(crate) fn abandoned(&mut self) {
        self.live = self.live.saturating_sub(1);
        self.total = self.total.saturating_sub(1);
    }
}

pub(crate) struct Runtime {
    owner: u32,
    config: ShimConfig,
    tracker: ReentrantMutex<RefCell<DescriptorTracker>>,
    threads: Mutex<ThreadCounters>,
    hw: Option<HwCounterGroup>,
    finalized: AtomicBool,
}

impl Runtime {
    /// Opens the trace file, writes its header and seeds the descriptor
    /// table from `/proc/self/fd`. `forked_from` adds the `fork:` line.
    ///
    /// Descriptors are listed before the trace is opened, and the filter
    /// drops the log file and any trace inherited from a parent, so the
    /// shim never accounts for its own output.
    pub(crate) fn boot(config: ShimConfig, forked_from: Option<u32>) -> Self {
        let owner = current_pid();
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        let inherited = list_open_descriptors(&RealFs::new(), Path::new("/proc/self/fd"));
        let filter = PathFilter::from_config(&config, cwd);
        let mut tracker = DescriptorTracker::new(filter, open_trace(&config, owner));

        let out = tracker.trace_mut();
        out.start(epoch_secs());
        out.cmd(&command_line());
        if let Ok(exe) = std::fs::read_link("/proc/self/exe") {
            out.exe(&exe.to_string_lossy());
        }
        if let Some(parent) = forked_from {
            out.fork(parent);
        }
        out.flush();

        tracker.seed(&inherited);

        Self {
            owner,
            hw: config.hwcounters.then(HwCounterGroup::open),
            config,
            tracker: ReentrantMutex::new(RefCell::new(tracker)),
            threads: Mutex::new(ThreadCounters::default()),
            finalized: AtomicBool::new(false),
        }
    }

    pub(crate) fn config(&self) -> &ShimConfig {
        &self.config
    }

    /// Runs `f` on the tracker under the process-wide lock. `None` if the
    /// tracker is already borrowed further up this thread's stack.
    pub(crate) fn with_tracker<R>(&self, f: impl FnOnce(&mut DescriptorTracker) -> R) -> Option<R> {
        let locked = self.tracker.lock();
        let mut tracker = locked.try_borrow_mut().ok()?;
        Some(f(&mut tracker))
    }

    pub(crate) fn thread_started(&self) {
        self.threads.lock().started();
    }

    pub(crate) fn thread_finished(&self) {
        self.threads.lock().finished();
    }

    pub(crate) fn thread_not_started(&self) {
        self.threads.lock().abandoned();
    }

    pub(crate) fn thread_counters(&self) -> ThreadCounters {
        *self.threads.lock()
    }

    /// Closes out every tracked descriptor, writes the thread and stop
    /// lines, and publishes the final snapshot. Runs at most once, and only
    /// in the process that built this runtime.
    pub(crate) fn finalize(&self) {
        if self.owner != current_pid() || self.finalized.swap(true, Ordering::AcqRel) {
            return;
        }
        let threads = self.thread_counters();
        let sockets = self
            .with_tracker(|tracker| {
                tracker.close_all(fd_size);
                let out = tracker.trace_mut();
                out.threads(threads.max, threads.total);
                out.stop(epoch_secs());
                out.close();
                tracker.socket_totals()
            })
            .unwrap_or_default();
        self.publish_final(sockets);
    }

    fn publish_final(&self, sockets: SocketTotals) {
        let collector = ProcessCollector::new(RealFs::new(), "/proc", local_host_address().to_string());
        let mut stats = match collector.collect_with_env(self.owner, |key| std::env::var(key).ok()) {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %e, "cannot collect final snapshot");
                return;
            }
        };
        stats.hw = self.hw.as_ref().map(HwCounterGroup::read).unwrap_or_default();
        stats.bsend = sockets.sent;
        stats.brecv = sockets.received;

        let mut publisher = Publisher::new(self.config.endpoint.as_deref(), self.config.job.clone());
        match publisher.publish_stats(&stats) {
            Ok(()) => debug!(pid = stats.pid, utime = stats.utime, "final snapshot published"),
            Err(e) => warn!(error = %e, "final snapshot dropped"),
        }
    }
}

fn open_trace(config: &ShimConfig, pid: u32) -> TraceWriter {
    let Some(path) = config.trace_path(pid) else {
        return TraceWriter::disabled();
    };
    match TraceWriter::open(Path::new(&path)) {
        Ok(trace) => trace,
        Err(e) => {
            warn!(%path, error = %e, "cannot open trace file");
            TraceWriter::disabled()
        }
    }
}

fn command_line() -> Vec<String> {
    std::fs::read("/proc/self/cmdline")
        .map(|raw| {
            String::from_utf8_lossy(&raw)
                .split('\0')
                .filter(|arg| !arg.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Publishes `runtime` as the process's current runtime.
pub(crate) fn install(runtime: Runtime) -> &'static Runtime {
    let fresh = Box::into_raw(Box::new(runtime));
    RUNTIME.store(fresh, Ordering::Release);
    // SAFETY: just leaked, never freed.
    unsafe { &*fresh }
}

pub(crate) fn current() -> Option<&'static Runtime> {
    let ptr = RUNTIME.load(Ordering::Acquire);
    // SAFETY: installed runtimes are leaked, so a non-null pointer stays valid.
    unsafe { ptr.as_ref() }
}

/// Library constructor.
#[cfg_attr(test, allow(dead_code))]
pub(crate) fn on_load() {
    let Some(_guard) = HookGuard::enter() else {
        return;
    };
    let config = ShimConfig::from_env();
    logging::init_shim(config.log_filter.as_deref(), config.log_file.as_deref().map(Path::new));
    let runtime = install(Runtime::boot(config, None));
    info!(
        version = %kickmon_core::version(),
        peer = runtime.config().endpoint.as_deref().unwrap_or("<none>"),
        "kickmon shim loaded"
    );
}

/// Library destructor, and the `_exit` hooks.
pub(crate) fn on_exit() {
    let Some(_guard) = HookGuard::enter() else {
        return;
    };
    if let Some(runtime) = current() {
        runtime.finalize();
    }
}

/// Child side of a successful fork.
pub(crate) fn after_fork(parent: u32) {
    let Some(_guard) = HookGuard::enter() else {
        return;
    };
    let config = current().map(|rt| rt.config().clone()).unwrap_or_else(ShimConfig::from_env);
    install(Runtime::boot(config, Some(parent)));
    debug!(parent, "runtime reinitialized after fork");
}

/// Flushes everything before an exec replaces the image.
pub(crate) fn before_exec() {
    on_exit();
}

/// The exec returned, so this image keeps running.
pub(crate) fn after_failed_exec() {
    let Some(_guard) = HookGuard::enter() else {
        return;
    };
    let config = current().map(|rt| rt.config().clone()).unwrap_or_else(ShimConfig::from_env);
    install(Runtime::boot(config, None));
    debug!("runtime reinitialized after failed exec");
}

/// Serializes tests that install a process-wide runtime or run the hooks
/// that replace it.
#[cfg(test)]
pub(crate) static INSTALL_LOCK: Mutex<()> = parking_lot::const_mutex(());

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_thread_counters() {
        let mut counters = ThreadCounters::default();
        counters.started();
        counters.started();
        counters.finished();
        counters.started();
        counters.finished();
        counters.finished();
        counters.finished();
        counters.started();
        counters.abandoned();
        assert_eq!(
            counters,
            ThreadCounters {
                live: 0,
                max: 2,
                total: 3
            }
        );
    }

    #[test]
    fn test_command_line_is_this_process() {
        let argv = command_line();
        assert!(!argv.is_empty());
    }

    #[test]
    fn test_finalize_writes_summary_once() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("trace");
        let data = dir.path().join("data.bin");
        std::fs::write(&data, vec![0u8; 64]).unwrap();

        let config = ShimConfig {
            trace_prefix: Some(prefix.to_string_lossy().into_owned()),
            ..Default::default()
        };
        let runtime = Runtime::boot(config, Some(1));
        runtime.thread_started();
        runtime.thread_started();
        runtime.thread_finished();

        let file = std::fs::File::open(&data).unwrap();
        let fd = file.as_raw_fd();
        runtime.with_tracker(|t| {
            t.opened(fd, &data.to_string_lossy());
            t.read(fd, 64);
        });

        runtime.finalize();
        runtime.finalize();
        drop(file);

        let trace = std::fs::read_to_string(format!("{}.{}", prefix.display(), std::process::id())).unwrap();
        let lines: Vec<&str> = trace.lines().collect();
        assert!(lines[0].starts_with("start: "));
        assert!(lines[1].starts_with("cmd: "));
        assert!(lines.contains(&"fork: 1"));
        assert!(lines.contains(&format!("file: '{}' 64 64 0 1 0 0 0", data.display()).as_str()));
        assert!(lines.contains(&"threads: 2 2"));
        assert_eq!(lines.iter().filter(|l| l.starts_with("stop: ")).count(), 1);
        assert!(lines.last().unwrap().starts_with("stop: "));
    }

    #[test]
    fn test_boot_skips_own_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        let prefix = root.join("trace");
        let log = root.join("shim.log");
        let data = root.join("data.bin");
        std::fs::write(&data, b"abc").unwrap();

        // an inherited parent trace and an open log, as after fork
        let parent_trace = std::fs::File::create(format!("{}.1", prefix.display())).unwrap();
        let log_handle = std::fs::File::create(&log).unwrap();
        let data_handle = std::fs::File::open(&data).unwrap();

        let config = ShimConfig {
            trace_prefix: Some(prefix.to_string_lossy().into_owned()),
            trace_all: true,
            log_file: Some(log.to_string_lossy().into_owned()),
            ..Default::default()
        };
        let runtime = Runtime::boot(config, None);
        let tracked: Vec<String> = runtime
            .with_tracker(|t| {
                let table = t.table();
                table
                    .live_descriptors()
                    .into_iter()
                    .filter_map(|fd| table.get(fd).map(|e| e.path.clone()))
                    .collect()
            })
            .unwrap();

        let own_trace = format!("{}.{}", prefix.display(), std::process::id());
        assert!(tracked.contains(&data.to_string_lossy().into_owned()));
        assert!(!tracked.iter().any(|p| p == &own_trace));
        assert!(!tracked.iter().any(|p| p.starts_with(&*prefix.to_string_lossy())));
        assert!(!tracked.iter().any(|p| p == &*log.to_string_lossy()));
        assert!(runtime
            .with_tracker(|t| t.table().get(data_handle.as_raw_fd()).is_some())
            .unwrap());
        drop((parent_trace, log_handle));
    }
}
