//! kickmon - runs a command under job monitoring.
//!
//! Attaches the monitor to its own process group, starts the command with
//! the I/O shim preloaded and the aggregator address exported, then stops
//! monitoring once the command exits and hands back its exit status.

use std::ffi::OsString;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use clap::Parser;
use kickmon_core::config::{self, ENV_PEER, MonitoringContext};
use kickmon_core::{logging, start_monitoring, stop_monitoring};
use tracing::{debug, error, info, warn};

/// File name of the preloadable shim, looked up next to this executable.
const SHIM_FILE: &str = "libkickmon_interpose.so";

/// Runs a command under job monitoring.
#[derive(Parser, Debug)]
#[command(name = "kickmon", about = "Runs a command under job monitoring", version)]
struct Args {
    /// Sampling interval in seconds (1-3600). Default is 60.
    #[arg(short, long, env = config::ENV_INTERVAL, value_parser = parse_interval)]
    interval: Option<Duration>,

    /// Telemetry endpoint: http(s)://, rabbitmq(s)://, file://<path> or kickstart://host:port.
    #[arg(short, long, env = config::ENV_URL)]
    url: Option<String>,

    /// Also sample GPUs through nvidia-smi.
    #[arg(long)]
    gpu: bool,

    /// Path to the shim library. Defaults to libkickmon_interpose.so next to this binary.
    #[arg(long, env = "KICKMON_PRELOAD", value_name = "PATH")]
    preload: Option<PathBuf>,

    /// Run the command without the shim (no per-file accounting).
    #[arg(long, conflicts_with = "preload")]
    no_preload: bool,

    /// Stay in the current process group instead of starting a new one.
    #[arg(long)]
    keep_group: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,

    /// Command to run, with its arguments.
    #[arg(required = true, trailing_var_arg = true, num_args = 1.., value_name = "COMMAND")]
    command: Vec<OsString>,
}

fn parse_interval(raw: &str) -> Result<Duration, String> {
    config::parse_interval(raw).map_err(|e| e.to_string())
}

/// Builds the monitoring context: job identifiers and GPU switch from the
/// environment, interval and endpoint from the (env-backed) flags.
fn context(args: &Args) -> kickmon_core::Result<MonitoringContext> {
    let mut ctx = MonitoringContext::from_lookup(|key| match key {
        config::ENV_INTERVAL | config::ENV_URL => None,
        _ => std::env::var(key).ok(),
    })?;
    if let Some(interval) = args.interval {
        ctx.interval = interval;
    }
    ctx.endpoint = args.url.clone().filter(|url| !url.trim().is_empty());
    ctx.gpu |= args.gpu;
    ctx.new_process_group = !args.keep_group;
    Ok(ctx)
}

/// Picks the shim to preload, or `None` to run without one.
fn resolve_shim(args: &Args) -> Option<PathBuf> {
    if args.no_preload {
        return None;
    }
    let candidate = match &args.preload {
        Some(path) => path.clone(),
        None => std::env::current_exe().ok()?.parent()?.join(SHIM_FILE),
    };
    if candidate.is_file() {
        Some(candidate)
    } else {
        warn!(
            "Shim not found at {}, running without I/O accounting",
            candidate.display()
        );
        None
    }
}

/// `LD_PRELOAD` value putting the shim ahead of whatever was preloaded.
fn preload_value(shim: &Path, existing: Option<OsString>) -> OsString {
    let mut value = shim.as_os_str().to_os_string();
    if let Some(existing) = existing.filter(|e| !e.is_empty()) {
        value.push(":");
        value.push(existing);
    }
    value
}

fn build_command(argv: &[OsString], shim: Option<&Path>, peer: &str) -> Command {
    let mut command = Command::new(&argv[0]);
    command.args(&argv[1..]).env(ENV_PEER, peer);
    if let Some(shim) = shim {
        command.env("LD_PRELOAD", preload_value(shim, std::env::var_os("LD_PRELOAD")));
    }
    command
}

/// Shell convention: the exit code, or 128 plus the terminating signal.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

fn main() {
    let args = Args::parse();

    logging::init_launcher(args.verbose, args.quiet);

    info!("kickmon {} starting", kickmon_core::version());

    let ctx = match context(&args) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("{}", e);
            std::process::exit(2);
        }
    };
    let shim = resolve_shim(&args);
    debug!(
        "Config: interval={}s, endpoint={}, gpu={}, shim={}",
        ctx.interval.as_secs(),
        ctx.endpoint.as_deref().unwrap_or("<none>"),
        ctx.gpu,
        shim.as_deref().map_or_else(|| "<none>".into(), Path::to_string_lossy)
    );

    let session = match start_monitoring(ctx) {
        Ok(session) => session,
        Err(e) => {
            error!("Failed to start monitoring: {}", e);
            std::process::exit(1);
        }
    };

    // forwards termination to the command; monitoring stops once it exits
    let child_pid = Arc::new(AtomicI32::new(0));
    let forward_to = child_pid.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        let pid = forward_to.load(Ordering::SeqCst);
        if pid > 0 {
            info!(pid, "Received shutdown signal, terminating command");
            // SAFETY: kill has no memory-safety preconditions.
            unsafe { libc::kill(pid, libc::SIGTERM) };
        }
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    let program = args.command[0].to_string_lossy().into_owned();
    let status = build_command(&args.command, shim.as_deref(), session.peer_address())
        .spawn()
        .and_then(|mut child| {
            child_pid.store(child.id() as i32, Ordering::SeqCst);
            info!(pid = child.id(), "Started {}", program);
            let status = child.wait();
            child_pid.store(0, Ordering::SeqCst);
            status
        });

    stop_monitoring(session);

    match status {
        Ok(status) => {
            let code = exit_code(status);
            info!(code, "{} finished", program);
            std::process::exit(code);
        }
        Err(e) => {
            error!("Failed to run {}: {}", program, e);
            std::process::exit(127);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::ffi::OsStr;

    #[test]
    fn test_args_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_command_keeps_its_own_flags() {
        let args = Args::try_parse_from(["kickmon", "-i", "5", "ls", "-l", "--color"]).unwrap();
        assert_eq!(args.interval, Some(Duration::from_secs(5)));
        assert_eq!(args.command, vec!["ls", "-l", "--color"]);

        let args = Args::try_parse_from(["kickmon", "-vv", "--", "sh", "-c", "true"]).unwrap();
        assert_eq!(args.verbose, 2);
        assert_eq!(args.command, vec!["sh", "-c", "true"]);
    }

    #[test]
    fn test_command_required() {
        assert!(Args::try_parse_from(["kickmon", "--gpu"]).is_err());
    }

    #[test]
    fn test_interval_out_of_range_rejected() {
        assert!(Args::try_parse_from(["kickmon", "-i", "0", "true"]).is_err());
        assert!(Args::try_parse_from(["kickmon", "-i", "3601", "true"]).is_err());
    }

    #[test]
    fn test_context_applies_flags() {
        let args = Args::try_parse_from([
            "kickmon",
            "-i",
            "10",
            "-u",
            "file:///tmp/out.json",
            "--gpu",
            "--keep-group",
            "true",
        ])
        .unwrap();
        let ctx = context(&args).unwrap();
        assert_eq!(ctx.interval, Duration::from_secs(10));
        assert_eq!(ctx.endpoint.as_deref(), Some("file:///tmp/out.json"));
        assert!(ctx.gpu);
        assert!(!ctx.new_process_group);
    }

    #[test]
    fn test_preload_value() {
        let shim = Path::new("/opt/kickmon/libkickmon_interpose.so");
        assert_eq!(preload_value(shim, None), "/opt/kickmon/libkickmon_interpose.so");
        assert_eq!(preload_value(shim, Some("".into())), "/opt/kickmon/libkickmon_interpose.so");
        assert_eq!(
            preload_value(shim, Some("libfoo.so".into())),
            "/opt/kickmon/libkickmon_interpose.so:libfoo.so"
        );
    }

    #[test]
    fn test_build_command_exports_peer() {
        let argv: Vec<OsString> = vec!["echo".into(), "hi".into()];
        let command = build_command(&argv, None, "10.0.0.5:4100");
        let envs: Vec<_> = command.get_envs().collect();
        assert!(envs.contains(&(OsStr::new(ENV_PEER), Some(OsStr::new("10.0.0.5:4100")))));
        assert!(!envs.iter().any(|(k, _)| *k == "LD_PRELOAD"));
        assert_eq!(command.get_args().collect::<Vec<_>>(), vec!["hi"]);
    }

    #[test]
    fn test_exit_code() {
        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(exit_code(ExitStatus::from_raw(libc::SIGKILL)), 137);
    }

    #[test]
    fn test_missing_shim_disables_preload() {
        let args =
            Args::try_parse_from(["kickmon", "--preload", "/nonexistent/libshim.so", "true"]).unwrap();
        assert_eq!(resolve_shim(&args), None);
        let args = Args::try_parse_from(["kickmon", "--no-preload", "true"]).unwrap();
        assert_eq!(resolve_shim(&args), None);
    }
}
