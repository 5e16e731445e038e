//! Optional GPU telemetry stream.
//!
//! Devices are discovered once when the stream starts; every interval each
//! device is sampled and published as its own document through the same sink
//! machinery as the process stream. The vendor interface sits behind
//! [`GpuBackend`]; the shipped backend drives `nvidia-smi`.

use std::os::fd::{AsFd, OwnedFd};
use std::process::Command;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{JobIds, MonitoringContext};
use crate::error::{MonitorError, Result};
use crate::scheduler::{IntervalTimer, wait};
use crate::sink::Publisher;
use crate::util::epoch_secs;

/// A device found at discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuDevice {
    pub index: u32,
    pub uuid: String,
    pub name: String,
}

/// Memory held by one process on a device, in MiB.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuProcessUsage {
    pub pid: u32,
    pub used_memory: u64,
}

/// One reading of one device. Values the device does not report are zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GpuSample {
    pub index: u32,
    /// Percent.
    pub utilization_gpu: f64,
    /// Percent.
    pub utilization_memory: f64,
    /// MiB.
    pub memory_used: u64,
    /// MiB.
    pub memory_total: u64,
    /// Watts.
    pub power_draw: f64,
    /// Degrees Celsius.
    pub temperature: f64,
    /// MHz.
    pub clock_sm: u64,
    /// MHz.
    pub clock_memory: u64,
    pub processes: Vec<GpuProcessUsage>,
}

/// Vendor management interface.
pub trait GpuBackend: Send {
    fn discover(&mut self) -> Result<Vec<GpuDevice>>;
    fn sample(&mut self, devices: &[GpuDevice]) -> Result<Vec<GpuSample>>;
}

/// Published document for one device sample.
#[derive(Debug, Serialize)]
pub struct GpuDocument<'a> {
    pub ts: i64,
    pub wf_uuid: &'a str,
    pub wf_label: &'a str,
    pub dag_job_id: &'a str,
    pub condor_job_id: &'a str,
    pub xformation: &'a str,
    pub task_id: &'a str,
    pub gpu_uuid: &'a str,
    pub gpu_name: &'a str,
    #[serde(flatten)]
    pub sample: &'a GpuSample,
}

impl<'a> GpuDocument<'a> {
    pub fn new(ts: f64, job: &'a JobIds, device: &'a GpuDevice, sample: &'a GpuSample) -> Self {
        Self {
            ts: ts.floor() as i64,
            wf_uuid: &job.wf_uuid,
            wf_label: &job.wf_label,
            dag_job_id: &job.dag_job_id,
            condor_job_id: &job.condor_job_id,
            xformation: &job.xformation,
            task_id: &job.task_id,
            gpu_uuid: &device.uuid,
            gpu_name: &device.name,
            sample,
        }
    }
}

/// Backend running the `nvidia-smi` command-line tool.
#[derive(Debug, Clone)]
pub struct NvidiaSmi {
    program: String,
}

impl Default for NvidiaSmi {
    fn default() -> Self {
        Self {
            program: "nvidia-smi".to_string(),
        }
    }
}

impl NvidiaSmi {
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn query(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|e| MonitorError::Gpu(format!("cannot run {}: {}", self.program, e)))?;
        if !output.status.success() {
            return Err(MonitorError::Gpu(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

const CSV: &str = "--format=csv,noheader,nounits";

impl GpuBackend for NvidiaSmi {
    fn discover(&mut self) -> Result<Vec<GpuDevice>> {
        let out = self.query(&["--query-gpu=index,uuid,name", CSV])?;
        parse_devices(&out)
    }

    fn sample(&mut self, devices: &[GpuDevice]) -> Result<Vec<GpuSample>> {
        let metrics = self.query(&[
            "--query-gpu=index,utilization.gpu,utilization.memory,memory.used,memory.total,\
             power.draw,temperature.gpu,clocks.sm,clocks.mem",
            CSV,
        ])?;
        let apps = self
            .query(&["--query-compute-apps=gpu_uuid,pid,used_memory", CSV])
            .unwrap_or_else(|e| {
                debug!(error = %e, "per-process GPU usage unavailable");
                String::new()
            });
        let mut samples = parse_samples(&metrics)?;
        attach_processes(&mut samples, devices, &apps);
        Ok(samples)
    }
}

fn csv_fields(line: &str) -> Vec<&str> {
    line.split(',').map(str::trim).collect()
}

/// Numbers reported as `[N/A]` or `[Not Supported]` read as zero.
fn number<T: std::str::FromStr + Default>(field: Option<&&str>) -> T {
    field.and_then(|s| s.parse().ok()).unwrap_or_default()
}

pub fn parse_devices(csv: &str) -> Result<Vec<GpuDevice>> {
    csv.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let f = csv_fields(line);
            let index = f
                .first()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| MonitorError::Gpu(format!("bad device line '{}'", line)))?;
            Ok(GpuDevice {
                index,
                uuid: f.get(1).unwrap_or(&"").to_string(),
                name: f.get(2..).map(|rest| rest.join(",")).unwrap_or_default(),
            })
        })
        .collect()
}

pub fn parse_samples(csv: &str) -> Result<Vec<GpuSample>> {
    csv.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let f = csv_fields(line);
            let index = f
                .first()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| MonitorError::Gpu(format!("bad sample line '{}'", line)))?;
            Ok(GpuSample {
                index,
                utilization_gpu: number(f.get(1)),
                utilization_memory: number(f.get(2)),
                memory_used: number(f.get(3)),
                memory_total: number(f.get(4)),
                power_draw: number(f.get(5)),
                temperature: number(f.get(6)),
                clock_sm: number(f.get(7)),
                clock_memory: number(f.get(8)),
                processes: Vec::new(),
            })
        })
        .collect()
}

/// Distributes `gpu_uuid,pid,used_memory` rows onto the matching samples.
pub fn attach_processes(samples: &mut [GpuSample], devices: &[GpuDevice], csv: &str) {
    for line in csv.lines().filter(|l| !l.trim().is_empty()) {
        let f = csv_fields(line);
        let (Some(uuid), Some(pid)) = (f.first(), f.get(1).and_then(|s| s.parse().ok())) else {
            continue;
        };
        let Some(device) = devices.iter().find(|d| d.uuid == *uuid) else {
            continue;
        };
        if let Some(sample) = samples.iter_mut().find(|s| s.index == device.index) {
            sample.processes.push(GpuProcessUsage {
                pid,
                used_memory: number(f.get(2)),
            });
        }
    }
}

/// Entry point of the GPU thread.
pub(crate) fn run_stream(ctx: MonitoringContext, shutdown: OwnedFd) {
    run_stream_with(ctx, shutdown, NvidiaSmi::default());
}

pub(crate) fn run_stream_with(ctx: MonitoringContext, shutdown: OwnedFd, mut backend: impl GpuBackend) {
    let devices = match backend.discover() {
        Ok(devices) if !devices.is_empty() => devices,
        Ok(_) => {
            warn!("no GPU devices found, GPU monitoring disabled");
            return;
        }
        Err(e) => {
            error!(error = %e, "GPU discovery failed, GPU monitoring disabled");
            return;
        }
    };
    info!(count = devices.len(), "GPU monitoring started");

    let timer = match IntervalTimer::new(ctx.interval) {
        Ok(timer) => timer,
        Err(e) => {
            error!(error = %e, "cannot create GPU interval timer");
            return;
        }
    };
    let mut publisher = Publisher::new(ctx.endpoint.as_deref(), ctx.job.clone());

    loop {
        let ready = match wait(shutdown.as_fd(), timer.as_fd(), None) {
            Ok(ready) => ready,
            Err(e) => {
                error!(error = %e, "GPU poll failed");
                return;
            }
        };
        if ready.shutdown {
            flush(&mut backend, &devices, &ctx.job, &mut publisher);
            return;
        }
        if ready.timer && timer.acknowledge() > 0 {
            flush(&mut backend, &devices, &ctx.job, &mut publisher);
        }
    }
}

fn flush(backend: &mut impl GpuBackend, devices: &[GpuDevice], job: &JobIds, publisher: &mut Publisher) {
    let samples = match backend.sample(devices) {
        Ok(samples) => samples,
        Err(e) => {
            warn!(error = %e, "GPU sample dropped");
            return;
        }
    };
    let ts = epoch_secs();
    for sample in &samples {
        let Some(device) = devices.iter().find(|d| d.index == sample.index) else {
            continue;
        };
        let document = GpuDocument::new(ts, job, device, sample);
        if let Err(e) = publisher.publish_document(&document) {
            warn!(gpu = device.index, error = %e, "dropping GPU report");
        }
    }
}
