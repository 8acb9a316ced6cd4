//! # GPU Collector - nvidia-smi Sampling
//!
//! Queries the vendor CLI tool in a single CSV invocation per cycle:
//! index, uuid, name, temperature, utilization, memory, power, fan, driver
//! and PCIe link, plus a second query enumerating compute processes.
//! `[N/A]` fields map to zero, or to `None` where the field is genuinely
//! optional (fan speed on passively cooled cards).
//!
//! Hosts without the tool report an unavailable snapshot and the collector
//! loop skips itself permanently.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{run_command, Collector, ThresholdRules};
use crate::config::GpuCollectorConfig;
use crate::wire::{unix_now, Alert, MetricPoint};

const QUERY_FIELDS: &str = "index,uuid,name,temperature.gpu,utilization.gpu,memory.total,\
memory.used,memory.free,power.draw,power.limit,fan.speed,driver_version,\
pcie.link.gen.current,pcie.link.width.current";

/// Metrics for a single GPU.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuDevice {
    pub index: u32,
    pub uuid: String,
    pub name: String,
    pub temperature_celsius: f64,
    pub utilization_percent: f64,
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
    pub memory_free_mb: u64,
    pub memory_percent: f64,
    pub power_draw_watts: f64,
    pub power_limit_watts: f64,
    pub fan_speed_percent: Option<f64>,
    pub driver_version: String,
    pub pcie_gen: u32,
    pub pcie_width: u32,
}

/// A compute process occupying GPU memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuProcess {
    pub pid: u32,
    pub process_name: String,
    pub gpu_uuid: String,
    pub memory_used_mb: u64,
}

/// Complete GPU snapshot for one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuSnapshot {
    pub timestamp: f64,
    pub host: String,
    pub gpu_count: usize,
    pub driver_version: String,
    pub cuda_version: String,
    pub gpus: Vec<GpuDevice>,
    pub processes: Vec<GpuProcess>,
    pub available: bool,
    pub error: Option<String>,
}

impl GpuSnapshot {
    fn unavailable(host: &str, error: String) -> Self {
        Self {
            timestamp: unix_now(),
            host: host.to_string(),
            gpu_count: 0,
            driver_version: String::new(),
            cuda_version: String::new(),
            gpus: Vec::new(),
            processes: Vec::new(),
            available: false,
            error: Some(error),
        }
    }
}

fn parse_f64(field: &str) -> f64 {
    let field = field.trim();
    if field == "[N/A]" {
        return 0.0;
    }
    field.parse().unwrap_or(0.0)
}

fn parse_opt_f64(field: &str) -> Option<f64> {
    let field = field.trim();
    if field == "[N/A]" {
        return None;
    }
    field.parse().ok()
}

fn parse_u64(field: &str) -> u64 {
    let field = field.trim();
    if field == "[N/A]" {
        return 0;
    }
    field.parse().unwrap_or(0)
}

fn parse_u32(field: &str) -> u32 {
    parse_u64(field) as u32
}

/// Parse the CSV output of the device query. Malformed lines are skipped.
pub(crate) fn parse_device_csv(output: &str) -> Vec<GpuDevice> {
    let mut gpus = Vec::new();
    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() < 14 {
            continue;
        }
        let memory_total = parse_u64(parts[5]);
        let memory_used = parse_u64(parts[6]);
        gpus.push(GpuDevice {
            index: parse_u32(parts[0]),
            uuid: parts[1].to_string(),
            name: parts[2].to_string(),
            temperature_celsius: parse_f64(parts[3]),
            utilization_percent: parse_f64(parts[4]),
            memory_total_mb: memory_total,
            memory_used_mb: memory_used,
            memory_free_mb: parse_u64(parts[7]),
            memory_percent: if memory_total > 0 {
                memory_used as f64 / memory_total as f64 * 100.0
            } else {
                0.0
            },
            power_draw_watts: parse_f64(parts[8]),
            power_limit_watts: parse_f64(parts[9]),
            fan_speed_percent: parse_opt_f64(parts[10]),
            driver_version: parts[11].to_string(),
            pcie_gen: parse_u32(parts[12]),
            pcie_width: parse_u32(parts[13]),
        });
    }
    gpus
}

/// Parse the CSV output of the compute-apps query.
pub(crate) fn parse_compute_csv(output: &str) -> Vec<GpuProcess> {
    let mut processes = Vec::new();
    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() < 4 {
            continue;
        }
        let Ok(pid) = parts[0].parse::<u32>() else {
            continue;
        };
        processes.push(GpuProcess {
            pid,
            process_name: parts[1].to_string(),
            gpu_uuid: parts[2].to_string(),
            memory_used_mb: parse_u64(parts[3]),
        });
    }
    processes
}

/// Pull the CUDA version out of the plain nvidia-smi banner.
pub(crate) fn parse_cuda_version(banner: &str) -> Option<String> {
    for line in banner.lines() {
        if let Some(rest) = line.split("CUDA Version:").nth(1) {
            return rest.split_whitespace().next().map(str::to_string);
        }
    }
    None
}

fn find_nvidia_smi() -> Option<PathBuf> {
    const CANDIDATES: &[&str] = &[
        "/usr/bin/nvidia-smi",
        "/usr/local/bin/nvidia-smi",
        "/opt/nvidia/bin/nvidia-smi",
    ];
    for candidate in CANDIDATES {
        if Path::new(candidate).exists() {
            return Some(PathBuf::from(candidate));
        }
    }
    // fall back to a PATH search
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join("nvidia-smi"))
        .find(|p| p.exists())
}

/// nvidia-smi-backed sampler.
pub struct GpuCollector {
    host: String,
    smi_path: Option<PathBuf>,
}

impl GpuCollector {
    pub fn new(config: &GpuCollectorConfig, host: impl Into<String>) -> Self {
        let smi_path = config
            .nvidia_smi_path
            .as_ref()
            .map(PathBuf::from)
            .filter(|p| p.exists())
            .or_else(find_nvidia_smi);
        if smi_path.is_none() {
            debug!("nvidia-smi not found; GPU collection disabled");
        }
        Self {
            host: host.into(),
            smi_path,
        }
    }
}

#[async_trait]
impl Collector for GpuCollector {
    type Snapshot = GpuSnapshot;

    fn name(&self) -> &'static str {
        "gpu"
    }

    fn available(&self) -> bool {
        self.smi_path.is_some()
    }

    async fn collect(&self) -> GpuSnapshot {
        let Some(smi) = self.smi_path.as_deref().and_then(Path::to_str) else {
            return GpuSnapshot::unavailable(&self.host, "nvidia-smi not found".to_string());
        };

        let query = format!("--query-gpu={QUERY_FIELDS}");
        let device_output = match run_command(
            smi,
            &[&query, "--format=csv,noheader,nounits"],
            10,
        )
        .await
        {
            Ok(out) => out,
            Err(e) => return GpuSnapshot::unavailable(&self.host, e.to_string()),
        };
        let gpus = parse_device_csv(&device_output);

        // best-effort extras; a failure here does not fail the cycle
        let processes = run_command(
            smi,
            &[
                "--query-compute-apps=pid,process_name,gpu_uuid,used_memory",
                "--format=csv,noheader,nounits",
            ],
            10,
        )
        .await
        .map(|out| parse_compute_csv(&out))
        .unwrap_or_default();

        let cuda_version = run_command(smi, &[], 10)
            .await
            .ok()
            .and_then(|banner| parse_cuda_version(&banner))
            .unwrap_or_default();

        GpuSnapshot {
            timestamp: unix_now(),
            host: self.host.clone(),
            gpu_count: gpus.len(),
            driver_version: gpus
                .first()
                .map(|g| g.driver_version.clone())
                .unwrap_or_default(),
            cuda_version,
            gpus,
            processes,
            available: true,
            error: None,
        }
    }

    fn metric_points(&self, snap: &GpuSnapshot) -> Vec<MetricPoint> {
        let ts = snap.timestamp;
        let host = snap.host.as_str();

        if !snap.available {
            return vec![MetricPoint::new("sidra_gpu_available", 0.0, ts).with_label("host", host)];
        }

        let mut points = vec![
            MetricPoint::new("sidra_gpu_available", 1.0, ts).with_label("host", host),
            MetricPoint::new("sidra_gpu_count", snap.gpu_count as f64, ts)
                .with_label("host", host),
        ];

        for gpu in &snap.gpus {
            let point = |name: &str, value: f64| {
                MetricPoint::new(name, value, ts)
                    .with_label("host", host)
                    .with_label("gpu", gpu.index.to_string())
                    .with_label("name", gpu.name.clone())
            };
            points.push(point("sidra_gpu_temperature_celsius", gpu.temperature_celsius));
            points.push(point("sidra_gpu_utilization_percent", gpu.utilization_percent));
            points.push(point("sidra_gpu_memory_total_mb", gpu.memory_total_mb as f64));
            points.push(point("sidra_gpu_memory_used_mb", gpu.memory_used_mb as f64));
            points.push(point("sidra_gpu_memory_percent", gpu.memory_percent));
            points.push(point("sidra_gpu_power_draw_watts", gpu.power_draw_watts));
            if let Some(fan) = gpu.fan_speed_percent {
                points.push(point("sidra_gpu_fan_speed_percent", fan));
            }
        }

        points
    }

    fn check_thresholds(&self, snap: &GpuSnapshot, rules: &ThresholdRules) -> Vec<Alert> {
        let mut alerts = Vec::new();
        if !snap.available {
            return alerts;
        }

        for gpu in &snap.gpus {
            let temp_threshold = rules.critical_for("gpu_temp", 85.0);
            if gpu.temperature_celsius >= temp_threshold {
                alerts.push(Alert {
                    metric: "gpu_temp".to_string(),
                    value: serde_json::json!(gpu.temperature_celsius),
                    threshold: Some(serde_json::json!(temp_threshold)),
                    severity: if gpu.temperature_celsius >= 90.0 {
                        crate::wire::Severity::Critical
                    } else {
                        crate::wire::Severity::High
                    },
                    message: format!(
                        "GPU {} ({}) temperature at {:.0}°C",
                        gpu.index, gpu.name, gpu.temperature_celsius
                    ),
                    timestamp: snap.timestamp,
                    host: snap.host.clone(),
                    labels: std::collections::BTreeMap::from([(
                        "gpu".to_string(),
                        gpu.index.to_string(),
                    )]),
                });
            }

            let mem_threshold = rules.critical_for("gpu_memory", 95.0);
            if gpu.memory_percent >= mem_threshold {
                alerts.push(Alert {
                    metric: "gpu_memory".to_string(),
                    value: serde_json::json!(gpu.memory_percent),
                    threshold: Some(serde_json::json!(mem_threshold)),
                    severity: if gpu.memory_percent >= 98.0 {
                        crate::wire::Severity::Critical
                    } else {
                        crate::wire::Severity::High
                    },
                    message: format!(
                        "GPU {} ({}) memory at {:.1}%",
                        gpu.index, gpu.name, gpu.memory_percent
                    ),
                    timestamp: snap.timestamp,
                    host: snap.host.clone(),
                    labels: std::collections::BTreeMap::from([(
                        "gpu".to_string(),
                        gpu.index.to_string(),
                    )]),
                });
            }
        }

        alerts
    }
}
