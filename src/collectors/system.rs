//! # System Collector - CPU, Memory, Disk, Network, Load
//!
//! Samples host-level metrics through `sysinfo`: total and per-core CPU,
//! 1/5/15-minute load, memory and swap, per-mount disk usage (special
//! filesystems skipped), network interface counters (loopback and virtual
//! interfaces skipped), uptime, and process count. Disk I/O counters for
//! the root device come from `/proc/diskstats` where available.
//!
//! The sampler holds one persistent `sysinfo::System` so CPU usage deltas
//! are computed against the previous cycle; the refresh itself runs on the
//! blocking worker pool.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, Networks, System};

use super::{Collector, ThresholdRules};
use crate::wire::{unix_now, Alert, MetricPoint};

/// Filesystems that are memory-backed or image mounts, not real capacity.
const SKIP_FILESYSTEMS: &[&str] = &["tmpfs", "squashfs", "devtmpfs"];
/// Loopback and virtual interface prefixes.
const SKIP_INTERFACES: &[&str] = &["lo", "veth", "docker", "br-"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuMetrics {
    pub usage_percent: f64,
    pub cores: usize,
    pub load_1m: f64,
    pub load_5m: f64,
    pub load_15m: f64,
    pub per_core: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryMetrics {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub usage_percent: f64,
    pub swap_total: u64,
    pub swap_used: u64,
    pub swap_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskMetrics {
    pub path: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub usage_percent: f64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_count: u64,
    pub write_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkMetrics {
    pub interface: String,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub errors_in: u64,
    pub errors_out: u64,
}

/// Complete system snapshot for one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub timestamp: f64,
    pub host: String,
    pub cpu: CpuMetrics,
    pub memory: MemoryMetrics,
    pub disks: Vec<DiskMetrics>,
    pub network: Vec<NetworkMetrics>,
    pub uptime_seconds: f64,
    pub boot_time: f64,
    pub process_count: usize,
    pub error: Option<String>,
}

impl SystemSnapshot {
    fn failed(host: &str, error: String) -> Self {
        Self {
            timestamp: unix_now(),
            host: host.to_string(),
            cpu: CpuMetrics {
                usage_percent: 0.0,
                cores: 0,
                load_1m: 0.0,
                load_5m: 0.0,
                load_15m: 0.0,
                per_core: Vec::new(),
            },
            memory: MemoryMetrics {
                total_bytes: 0,
                used_bytes: 0,
                available_bytes: 0,
                usage_percent: 0.0,
                swap_total: 0,
                swap_used: 0,
                swap_percent: 0.0,
            },
            disks: Vec::new(),
            network: Vec::new(),
            uptime_seconds: 0.0,
            boot_time: 0.0,
            process_count: 0,
            error: Some(error),
        }
    }
}

/// Aggregated whole-disk I/O counters.
#[derive(Debug, Clone, Copy, Default)]
struct DiskIo {
    read_bytes: u64,
    write_bytes: u64,
    read_count: u64,
    write_count: u64,
}

/// Parse `/proc/diskstats`, summing counters for whole physical disks
/// (sd*/vd* without a partition suffix, nvme*n* without a `p` suffix).
fn parse_diskstats(content: &str) -> DiskIo {
    let mut io = DiskIo::default();
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        let name = fields[2];
        if !is_whole_disk(name) {
            continue;
        }
        io.read_count += fields[3].parse::<u64>().unwrap_or(0);
        io.read_bytes += fields[5].parse::<u64>().unwrap_or(0) * 512;
        io.write_count += fields[7].parse::<u64>().unwrap_or(0);
        io.write_bytes += fields[9].parse::<u64>().unwrap_or(0) * 512;
    }
    io
}

fn is_whole_disk(name: &str) -> bool {
    if name.starts_with("sd") || name.starts_with("vd") {
        return !name.ends_with(|c: char| c.is_ascii_digit());
    }
    if name.starts_with("nvme") {
        return !name.contains('p');
    }
    false
}

fn sample_system(sys: &mut System, host: &str) -> SystemSnapshot {
    sys.refresh_cpu();
    sys.refresh_memory();
    sys.refresh_processes();

    let load = System::load_average();
    let cpu = CpuMetrics {
        usage_percent: sys.global_cpu_info().cpu_usage() as f64,
        cores: sys.cpus().len(),
        load_1m: load.one,
        load_5m: load.five,
        load_15m: load.fifteen,
        per_core: sys.cpus().iter().map(|c| c.cpu_usage() as f64).collect(),
    };

    let total = sys.total_memory();
    let used = sys.used_memory();
    let swap_total = sys.total_swap();
    let swap_used = sys.used_swap();
    let memory = MemoryMetrics {
        total_bytes: total,
        used_bytes: used,
        available_bytes: sys.available_memory(),
        usage_percent: if total > 0 {
            used as f64 / total as f64 * 100.0
        } else {
            0.0
        },
        swap_total,
        swap_used,
        swap_percent: if swap_total > 0 {
            swap_used as f64 / swap_total as f64 * 100.0
        } else {
            0.0
        },
    };

    let root_io = std::fs::read_to_string("/proc/diskstats")
        .map(|c| parse_diskstats(&c))
        .unwrap_or_default();

    let mut disks = Vec::new();
    let disk_list = Disks::new_with_refreshed_list();
    for disk in disk_list.list() {
        let fs = disk.file_system().to_string_lossy();
        if SKIP_FILESYSTEMS.contains(&fs.as_ref()) {
            continue;
        }
        let path = disk.mount_point().to_string_lossy().into_owned();
        let total_bytes = disk.total_space();
        let free_bytes = disk.available_space();
        let used_bytes = total_bytes.saturating_sub(free_bytes);
        let is_root = path == "/";
        disks.push(DiskMetrics {
            path,
            total_bytes,
            used_bytes,
            free_bytes,
            usage_percent: if total_bytes > 0 {
                used_bytes as f64 / total_bytes as f64 * 100.0
            } else {
                0.0
            },
            read_bytes: if is_root { root_io.read_bytes } else { 0 },
            write_bytes: if is_root { root_io.write_bytes } else { 0 },
            read_count: if is_root { root_io.read_count } else { 0 },
            write_count: if is_root { root_io.write_count } else { 0 },
        });
    }

    let mut network = Vec::new();
    let interfaces = Networks::new_with_refreshed_list();
    for (name, data) in &interfaces {
        if SKIP_INTERFACES.iter().any(|p| name.starts_with(p)) {
            continue;
        }
        network.push(NetworkMetrics {
            interface: name.clone(),
            bytes_sent: data.total_transmitted(),
            bytes_recv: data.total_received(),
            packets_sent: data.total_packets_transmitted(),
            packets_recv: data.total_packets_received(),
            errors_in: data.total_errors_on_received(),
            errors_out: data.total_errors_on_transmitted(),
        });
    }

    SystemSnapshot {
        timestamp: unix_now(),
        host: host.to_string(),
        cpu,
        memory,
        disks,
        network,
        uptime_seconds: System::uptime() as f64,
        boot_time: System::boot_time() as f64,
        process_count: sys.processes().len(),
        error: None,
    }
}

/// Host-level sampler backed by a persistent `sysinfo::System`.
pub struct SystemCollector {
    host: String,
    sys: Arc<Mutex<System>>,
}

impl SystemCollector {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            sys: Arc::new(Mutex::new(System::new_all())),
        }
    }
}

#[async_trait]
impl Collector for SystemCollector {
    type Snapshot = SystemSnapshot;

    fn name(&self) -> &'static str {
        "system"
    }

    fn available(&self) -> bool {
        true
    }

    async fn collect(&self) -> SystemSnapshot {
        let sys = Arc::clone(&self.sys);
        let host = self.host.clone();
        tokio::task::spawn_blocking(move || sample_system(&mut sys.lock(), &host))
            .await
            .unwrap_or_else(|e| SystemSnapshot::failed(&self.host, e.to_string()))
    }

    fn metric_points(&self, snap: &SystemSnapshot) -> Vec<MetricPoint> {
        let ts = snap.timestamp;
        let host = snap.host.as_str();
        let point =
            |name: &str, value: f64| MetricPoint::new(name, value, ts).with_label("host", host);

        let mut points = vec![
            point("sidra_cpu_usage_percent", snap.cpu.usage_percent),
            point("sidra_cpu_cores", snap.cpu.cores as f64),
            point("sidra_load_1m", snap.cpu.load_1m),
            point("sidra_load_5m", snap.cpu.load_5m),
            point("sidra_load_15m", snap.cpu.load_15m),
            point("sidra_memory_total_bytes", snap.memory.total_bytes as f64),
            point("sidra_memory_used_bytes", snap.memory.used_bytes as f64),
            point(
                "sidra_memory_available_bytes",
                snap.memory.available_bytes as f64,
            ),
            point("sidra_memory_usage_percent", snap.memory.usage_percent),
            point("sidra_swap_usage_percent", snap.memory.swap_percent),
            point("sidra_uptime_seconds", snap.uptime_seconds),
            point("sidra_process_count", snap.process_count as f64),
        ];

        for disk in &snap.disks {
            let disk_point = |name: &str, value: f64| {
                point(name, value).with_label("path", disk.path.clone())
            };
            points.push(disk_point("sidra_disk_total_bytes", disk.total_bytes as f64));
            points.push(disk_point("sidra_disk_used_bytes", disk.used_bytes as f64));
            points.push(disk_point("sidra_disk_free_bytes", disk.free_bytes as f64));
            points.push(disk_point("sidra_disk_usage_percent", disk.usage_percent));
            if disk.path == "/" && (disk.read_bytes > 0 || disk.write_bytes > 0) {
                points.push(disk_point("sidra_disk_read_bytes_total", disk.read_bytes as f64));
                points.push(disk_point(
                    "sidra_disk_write_bytes_total",
                    disk.write_bytes as f64,
                ));
            }
        }

        for net in &snap.network {
            let net_point = |name: &str, value: f64| {
                point(name, value).with_label("interface", net.interface.clone())
            };
            points.push(net_point("sidra_network_bytes_sent", net.bytes_sent as f64));
            points.push(net_point("sidra_network_bytes_recv", net.bytes_recv as f64));
            points.push(net_point(
                "sidra_network_packets_sent",
                net.packets_sent as f64,
            ));
            points.push(net_point(
                "sidra_network_packets_recv",
                net.packets_recv as f64,
            ));
            points.push(net_point(
                "sidra_network_errors_total",
                (net.errors_in + net.errors_out) as f64,
            ));
        }

        points
    }

    fn check_thresholds(&self, snap: &SystemSnapshot, rules: &ThresholdRules) -> Vec<Alert> {
        let mut alerts = Vec::new();

        if let Some((severity, threshold)) = rules.classify("cpu_usage", snap.cpu.usage_percent) {
            alerts.push(Alert {
                metric: "cpu_usage".to_string(),
                value: serde_json::json!(snap.cpu.usage_percent),
                threshold: Some(serde_json::json!(threshold)),
                severity,
                message: format!("CPU usage at {:.1}%", snap.cpu.usage_percent),
                timestamp: snap.timestamp,
                host: snap.host.clone(),
                labels: Default::default(),
            });
        }

        if let Some((severity, threshold)) =
            rules.classify("memory_usage", snap.memory.usage_percent)
        {
            alerts.push(Alert {
                metric: "memory_usage".to_string(),
                value: serde_json::json!(snap.memory.usage_percent),
                threshold: Some(serde_json::json!(threshold)),
                severity,
                message: format!("Memory usage at {:.1}%", snap.memory.usage_percent),
                timestamp: snap.timestamp,
                host: snap.host.clone(),
                labels: Default::default(),
            });
        }

        for disk in &snap.disks {
            if let Some((severity, threshold)) = rules.classify("disk_usage", disk.usage_percent) {
                alerts.push(Alert {
                    metric: "disk_usage".to_string(),
                    value: serde_json::json!(disk.usage_percent),
                    threshold: Some(serde_json::json!(threshold)),
                    severity,
                    message: format!("Disk {} at {:.1}%", disk.path, disk.usage_percent),
                    timestamp: snap.timestamp,
                    host: snap.host.clone(),
                    labels: std::collections::BTreeMap::from([(
                        "path".to_string(),
                        disk.path.clone(),
                    )]),
                });
            }
        }

        alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Severity;

    fn snapshot() -> SystemSnapshot {
        SystemSnapshot {
            timestamp: 1000.0,
            host: "h1".to_string(),
            cpu: CpuMetrics {
                usage_percent: 42.0,
                cores: 8,
                load_1m: 1.5,
                load_5m: 1.2,
                load_15m: 0.9,
                per_core: vec![40.0; 8],
            },
            memory: MemoryMetrics {
                total_bytes: 16 << 30,
                used_bytes: 8 << 30,
                available_bytes: 8 << 30,
                usage_percent: 50.0,
                swap_total: 4 << 30,
                swap_used: 1 << 30,
                swap_percent: 25.0,
            },
            disks: vec![DiskMetrics {
                path: "/".to_string(),
                total_bytes: 100 << 30,
                used_bytes: 50 << 30,
                free_bytes: 50 << 30,
                usage_percent: 50.0,
                read_bytes: 1024,
                write_bytes: 2048,
                read_count: 10,
                write_count: 20,
            }],
            network: vec![NetworkMetrics {
                interface: "eth0".to_string(),
                bytes_sent: 100,
                bytes_recv: 200,
                packets_sent: 10,
                packets_recv: 20,
                errors_in: 1,
                errors_out: 2,
            }],
            uptime_seconds: 3600.0,
            boot_time: 0.0,
            process_count: 123,
            error: None,
        }
    }

    #[test]
    fn metric_points_carry_host_and_entity_labels() {
        let collector = SystemCollector::new("h1");
        let points = collector.metric_points(&snapshot());

        assert!(points.iter().all(|p| p.labels["host"] == "h1"));

        let disk = points
            .iter()
            .find(|p| p.name == "sidra_disk_usage_percent")
            .unwrap();
        assert_eq!(disk.labels["path"], "/");
        assert_eq!(disk.value, 50.0);

        let net_err = points
            .iter()
            .find(|p| p.name == "sidra_network_errors_total")
            .unwrap();
        assert_eq!(net_err.labels["interface"], "eth0");
        assert_eq!(net_err.value, 3.0);

        assert!(points.iter().any(|p| p.name == "sidra_disk_read_bytes_total"));
    }

    #[test]
    fn healthy_snapshot_produces_no_alerts() {
        let collector = SystemCollector::new("h1");
        let alerts = collector.check_thresholds(&snapshot(), &ThresholdRules::default());
        assert!(alerts.is_empty());
    }

    #[test]
    fn overloaded_snapshot_alerts_with_tiered_severity() {
        let collector = SystemCollector::new("h1");
        let mut snap = snapshot();
        snap.cpu.usage_percent = 96.0;
        snap.memory.usage_percent = 86.0;
        snap.disks[0].usage_percent = 82.0;

        let alerts = collector.check_thresholds(&snap, &ThresholdRules::default());
        assert_eq!(alerts.len(), 3);

        let cpu = alerts.iter().find(|a| a.metric == "cpu_usage").unwrap();
        assert_eq!(cpu.severity, Severity::Critical);
        assert_eq!(cpu.host, "h1");

        let mem = alerts.iter().find(|a| a.metric == "memory_usage").unwrap();
        assert_eq!(mem.severity, Severity::High);

        let disk = alerts.iter().find(|a| a.metric == "disk_usage").unwrap();
        assert_eq!(disk.severity, Severity::Warning);
        assert_eq!(disk.labels["path"], "/");
    }

    #[test]
    fn diskstats_sums_whole_disks_only() {
        let content = "\
   8       0 sda 100 0 2000 50 200 0 4000 80 0 0 0
   8       1 sda1 90 0 1800 45 180 0 3600 70 0 0 0
 259       0 nvme0n1 10 0 100 5 20 0 200 8 0 0 0
 259       1 nvme0n1p1 9 0 90 4 18 0 180 7 0 0 0
   7       0 loop0 5 0 50 2 0 0 0 0 0 0 0
";
        let io = parse_diskstats(content);
        assert_eq!(io.read_count, 110);
        assert_eq!(io.read_bytes, 2100 * 512);
        assert_eq!(io.write_count, 220);
        assert_eq!(io.write_bytes, 4200 * 512);
    }

    #[test]
    fn whole_disk_heuristic() {
        assert!(is_whole_disk("sda"));
        assert!(!is_whole_disk("sda1"));
        assert!(is_whole_disk("vdb"));
        assert!(is_whole_disk("nvme0n1"));
        assert!(!is_whole_disk("nvme0n1p2"));
        assert!(!is_whole_disk("loop0"));
        assert!(!is_whole_disk("dm-0"));
    }

    #[tokio::test]
    async fn live_collect_produces_a_plausible_snapshot() {
        let collector = SystemCollector::new("test-host");
        let snap = collector.collect().await;
        assert!(snap.error.is_none());
        assert!(snap.cpu.cores > 0);
        assert!(snap.memory.total_bytes > 0);
        assert!(snap.process_count > 0);
        assert_eq!(snap.host, "test-host");
    }
}
