//! # Container Collector - Docker Daemon Sampling
//!
//! Enumerates every container (running, stopped, paused) through the
//! docker CLI, inspects each for health, restart count, and start time,
//! and samples live stats (CPU, memory, network) for up to ten running
//! containers per cycle so a large fleet cannot stall the collector.
//! Requires the daemon socket to exist; hosts without it report an
//! unavailable snapshot.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{run_command, Collector, ThresholdRules};
use crate::config::DockerCollectorConfig;
use crate::wire::{unix_now, Alert, MetricPoint, Severity};

/// Live stats are sampled for at most this many running containers per
/// cycle; each stats call is a separate subprocess with its own timeout.
const STATS_CONTAINER_CAP: usize = 10;

/// Metrics for a single container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerMetrics {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    /// running, exited, paused, created, ...
    pub state: String,
    /// healthy, unhealthy, starting; None when no healthcheck exists
    pub health: Option<String>,
    pub created: String,
    pub started_at: Option<String>,
    pub cpu_percent: f64,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
    pub memory_percent: f64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub restart_count: u32,
    pub labels: HashMap<String, String>,
}

/// Complete container snapshot for one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerSnapshot {
    pub timestamp: f64,
    pub host: String,
    pub docker_version: String,
    pub containers_total: u64,
    pub containers_running: u64,
    pub containers_paused: u64,
    pub containers_stopped: u64,
    pub images_count: u64,
    pub containers: Vec<ContainerMetrics>,
    pub available: bool,
    pub error: Option<String>,
}

impl DockerSnapshot {
    fn unavailable(host: &str, error: String) -> Self {
        Self {
            timestamp: unix_now(),
            host: host.to_string(),
            docker_version: String::new(),
            containers_total: 0,
            containers_running: 0,
            containers_paused: 0,
            containers_stopped: 0,
            images_count: 0,
            containers: Vec::new(),
            available: false,
            error: Some(error),
        }
    }
}

/// Parse a docker-style human size ("1.5GiB", "820kB") into bytes.
pub(crate) fn parse_size(size: &str) -> u64 {
    let size = size.trim();
    if size.is_empty() {
        return 0;
    }
    // longest suffixes first so "GiB" is not consumed as "B"
    const UNITS: &[(&str, u64)] = &[
        ("TiB", 1 << 40),
        ("GiB", 1 << 30),
        ("MiB", 1 << 20),
        ("KiB", 1 << 10),
        ("TB", 1_000_000_000_000),
        ("GB", 1_000_000_000),
        ("MB", 1_000_000),
        ("kB", 1_000),
        ("KB", 1_000),
        ("B", 1),
    ];
    for (suffix, multiplier) in UNITS {
        if let Some(number) = size.strip_suffix(suffix) {
            return number
                .trim()
                .parse::<f64>()
                .map(|n| (n * *multiplier as f64) as u64)
                .unwrap_or(0);
        }
    }
    size.parse::<f64>().map(|n| n as u64).unwrap_or(0)
}

/// Parse one `docker stats --format {{json .}}` document.
pub(crate) fn parse_stats_json(doc: &Value) -> (f64, u64, u64, f64, u64, u64) {
    let percent = |key: &str| {
        doc.get(key)
            .and_then(Value::as_str)
            .map(|s| s.trim_end_matches('%'))
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0)
    };
    let cpu_percent = percent("CPUPerc");
    let mem_percent = percent("MemPerc");

    let mem_usage_str = doc.get("MemUsage").and_then(Value::as_str).unwrap_or("0B / 0B");
    let mut mem_parts = mem_usage_str.split('/');
    let mem_usage = parse_size(mem_parts.next().unwrap_or("0"));
    let mem_limit = parse_size(mem_parts.next_back().unwrap_or("0"));

    let net_io_str = doc.get("NetIO").and_then(Value::as_str).unwrap_or("0B / 0B");
    let mut net_parts = net_io_str.split('/');
    let net_rx = parse_size(net_parts.next().unwrap_or("0"));
    let net_tx = parse_size(net_parts.next().unwrap_or("0"));

    (cpu_percent, mem_usage, mem_limit, mem_percent, net_rx, net_tx)
}

/// Pull health, start time, restart count, and labels out of a
/// `docker inspect` document.
pub(crate) fn parse_inspect_json(doc: &Value) -> (Option<String>, Option<String>, u32, HashMap<String, String>) {
    let state = doc.get("State").cloned().unwrap_or(Value::Null);
    let health = state
        .pointer("/Health/Status")
        .and_then(Value::as_str)
        .map(str::to_string);
    let started_at = state
        .get("StartedAt")
        .and_then(Value::as_str)
        .map(str::to_string);
    let restart_count = doc
        .get("RestartCount")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;
    let labels = doc
        .pointer("/Config/Labels")
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();
    (health, started_at, restart_count, labels)
}

/// docker-CLI-backed sampler.
pub struct DockerCollector {
    host: String,
    socket_path: String,
}

impl DockerCollector {
    pub fn new(config: &DockerCollectorConfig, host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            socket_path: config.socket_path.clone(),
        }
    }

    async fn daemon_info(&self) -> HashMap<String, Value> {
        let mut info = HashMap::new();
        if let Ok(out) = run_command("docker", &["info", "--format", "{{json .}}"], 10).await {
            if let Ok(doc) = serde_json::from_str::<Value>(&out) {
                for (key, target) in [
                    ("ServerVersion", "version"),
                    ("Containers", "containers_total"),
                    ("ContainersRunning", "containers_running"),
                    ("ContainersPaused", "containers_paused"),
                    ("ContainersStopped", "containers_stopped"),
                    ("Images", "images"),
                ] {
                    if let Some(v) = doc.get(key) {
                        info.insert(target.to_string(), v.clone());
                    }
                }
            }
        }
        info
    }

    async fn list_containers(&self) -> Vec<ContainerMetrics> {
        let format = r#"{"id":"{{.ID}}","name":"{{.Names}}","image":"{{.Image}}","status":"{{.Status}}","state":"{{.State}}","created":"{{.CreatedAt}}"}"#;
        let Ok(out) = run_command("docker", &["ps", "-a", "--format", format], 10).await else {
            return Vec::new();
        };

        let mut containers = Vec::new();
        for line in out.lines().filter(|l| !l.trim().is_empty()) {
            let Ok(doc) = serde_json::from_str::<Value>(line) else {
                continue;
            };
            let field = |key: &str| {
                doc.get(key)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            let id = field("id");
            if id.is_empty() {
                continue;
            }

            let (health, started_at, restart_count, labels) = match run_command(
                "docker",
                &["inspect", &id],
                5,
            )
            .await
            .ok()
            .and_then(|out| serde_json::from_str::<Value>(&out).ok())
            .and_then(|docs| docs.get(0).cloned())
            {
                Some(inspect) => parse_inspect_json(&inspect),
                None => (None, None, 0, HashMap::new()),
            };

            containers.push(ContainerMetrics {
                id,
                name: field("name"),
                image: field("image"),
                status: field("status"),
                state: field("state"),
                health,
                created: field("created"),
                started_at,
                cpu_percent: 0.0,
                memory_usage_bytes: 0,
                memory_limit_bytes: 0,
                memory_percent: 0.0,
                network_rx_bytes: 0,
                network_tx_bytes: 0,
                restart_count,
                labels,
            });
        }
        containers
    }

    async fn attach_stats(&self, containers: &mut [ContainerMetrics]) {
        let running_ids: Vec<String> = containers
            .iter()
            .filter(|c| c.state == "running")
            .take(STATS_CONTAINER_CAP)
            .map(|c| c.id.clone())
            .collect();

        for id in running_ids {
            // per-container timeout: a wedged container is skipped
            let Ok(out) = run_command(
                "docker",
                &["stats", &id, "--no-stream", "--format", "{{json .}}"],
                5,
            )
            .await
            else {
                continue;
            };
            let Ok(doc) = serde_json::from_str::<Value>(&out) else {
                continue;
            };
            let (cpu, mem_usage, mem_limit, mem_percent, net_rx, net_tx) =
                parse_stats_json(&doc);
            if let Some(container) = containers.iter_mut().find(|c| c.id == id) {
                container.cpu_percent = cpu;
                container.memory_usage_bytes = mem_usage;
                container.memory_limit_bytes = mem_limit;
                container.memory_percent = mem_percent;
                container.network_rx_bytes = net_rx;
                container.network_tx_bytes = net_tx;
            }
        }
    }
}

#[async_trait]
impl Collector for DockerCollector {
    type Snapshot = DockerSnapshot;

    fn name(&self) -> &'static str {
        "docker"
    }

    fn available(&self) -> bool {
        Path::new(&self.socket_path).exists()
    }

    async fn collect(&self) -> DockerSnapshot {
        if !self.available() {
            return DockerSnapshot::unavailable(&self.host, "docker socket not found".to_string());
        }

        let info = self.daemon_info().await;
        let mut containers = self.list_containers().await;
        self.attach_stats(&mut containers).await;

        let get_u64 = |key: &str| info.get(key).and_then(Value::as_u64).unwrap_or(0);
        debug!(containers = containers.len(), "docker cycle complete");

        DockerSnapshot {
            timestamp: unix_now(),
            host: self.host.clone(),
            docker_version: info
                .get("version")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            containers_total: get_u64("containers_total"),
            containers_running: get_u64("containers_running"),
            containers_paused: get_u64("containers_paused"),
            containers_stopped: get_u64("containers_stopped"),
            images_count: get_u64("images"),
            containers,
            available: true,
            error: None,
        }
    }

    fn metric_points(&self, snap: &DockerSnapshot) -> Vec<MetricPoint> {
        let ts = snap.timestamp;
        let host = snap.host.as_str();
        let point =
            |name: &str, value: f64| MetricPoint::new(name, value, ts).with_label("host", host);

        if !snap.available {
            return vec![point("sidra_docker_available", 0.0)];
        }

        let mut points = vec![
            point("sidra_docker_available", 1.0),
            point("sidra_docker_containers_total", snap.containers_total as f64),
            point(
                "sidra_docker_containers_running",
                snap.containers_running as f64,
            ),
            point(
                "sidra_docker_containers_stopped",
                snap.containers_stopped as f64,
            ),
            point("sidra_docker_images_total", snap.images_count as f64),
        ];

        for container in &snap.containers {
            let c_point = |name: &str, value: f64| {
                point(name, value)
                    .with_label("container", container.name.clone())
                    .with_label("image", container.image.clone())
            };
            let running = if container.state == "running" { 1.0 } else { 0.0 };
            points.push(c_point("sidra_container_running", running));
            if container.state == "running" {
                points.push(c_point("sidra_container_cpu_percent", container.cpu_percent));
                points.push(c_point(
                    "sidra_container_memory_usage_bytes",
                    container.memory_usage_bytes as f64,
                ));
                points.push(c_point(
                    "sidra_container_memory_percent",
                    container.memory_percent,
                ));
            }
            points.push(c_point(
                "sidra_container_restart_count",
                container.restart_count as f64,
            ));
        }

        points
    }

    fn check_thresholds(&self, snap: &DockerSnapshot, _rules: &ThresholdRules) -> Vec<Alert> {
        let mut alerts = Vec::new();
        if !snap.available {
            return alerts;
        }

        for container in &snap.containers {
            let labels = std::collections::BTreeMap::from([(
                "container".to_string(),
                container.name.clone(),
            )]);

            if container.health.as_deref() == Some("unhealthy") {
                alerts.push(Alert {
                    metric: "container_health".to_string(),
                    value: serde_json::json!("unhealthy"),
                    threshold: None,
                    severity: Severity::High,
                    message: format!("Container {} is unhealthy", container.name),
                    timestamp: snap.timestamp,
                    host: snap.host.clone(),
                    labels: labels.clone(),
                });
            }

            if container.state == "exited" && container.restart_count > 0 {
                alerts.push(Alert {
                    metric: "container_exited".to_string(),
                    value: serde_json::json!(container.restart_count),
                    threshold: None,
                    severity: Severity::High,
                    message: format!(
                        "Container {} exited (restarts: {})",
                        container.name, container.restart_count
                    ),
                    timestamp: snap.timestamp,
                    host: snap.host.clone(),
                    labels: labels.clone(),
                });
            }

            if container.memory_percent > 90.0 {
                alerts.push(Alert {
                    metric: "container_memory".to_string(),
                    value: serde_json::json!(container.memory_percent),
                    threshold: Some(serde_json::json!(90.0)),
                    severity: Severity::High,
                    message: format!(
                        "Container {} memory at {:.1}%",
                        container.name, container.memory_percent
                    ),
                    timestamp: snap.timestamp,
                    host: snap.host.clone(),
                    labels,
                });
            }
        }

        alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_parsing_covers_docker_units() {
        assert_eq!(parse_size("0B"), 0);
        assert_eq!(parse_size("512B"), 512);
        assert_eq!(parse_size("1.5KiB"), 1536);
        assert_eq!(parse_size("820kB"), 820_000);
        assert_eq!(parse_size("2MiB"), 2 * 1024 * 1024);
        assert_eq!(parse_size("1.5GiB"), (1.5 * (1u64 << 30) as f64) as u64);
        assert_eq!(parse_size("3GB"), 3_000_000_000);
        assert_eq!(parse_size(""), 0);
        assert_eq!(parse_size("junk"), 0);
    }

    #[test]
    fn stats_document_parses_cpu_memory_and_network() {
        let doc = serde_json::json!({
            "CPUPerc": "12.34%",
            "MemUsage": "1.5GiB / 8GiB",
            "MemPerc": "18.75%",
            "NetIO": "820kB / 2MB",
        });
        let (cpu, mem_usage, mem_limit, mem_percent, net_rx, net_tx) = parse_stats_json(&doc);
        assert_eq!(cpu, 12.34);
        assert_eq!(mem_usage, (1.5 * (1u64 << 30) as f64) as u64);
        assert_eq!(mem_limit, 8 * (1u64 << 30));
        assert_eq!(mem_percent, 18.75);
        assert_eq!(net_rx, 820_000);
        assert_eq!(net_tx, 2_000_000);
    }

    #[test]
    fn missing_stats_fields_default_to_zero() {
        let (cpu, mem_usage, mem_limit, mem_percent, net_rx, net_tx) =
            parse_stats_json(&serde_json::json!({}));
        assert_eq!(
            (cpu, mem_usage, mem_limit, mem_percent, net_rx, net_tx),
            (0.0, 0, 0, 0.0, 0, 0)
        );
    }

    #[test]
    fn inspect_document_yields_health_and_restarts() {
        let doc = serde_json::json!({
            "State": {
                "StartedAt": "2026-07-30T10:00:00Z",
                "Health": { "Status": "unhealthy" },
            },
            "RestartCount": 7,
            "Config": { "Labels": { "app": "web", "tier": "frontend" } },
        });
        let (health, started_at, restarts, labels) = parse_inspect_json(&doc);
        assert_eq!(health.as_deref(), Some("unhealthy"));
        assert_eq!(started_at.as_deref(), Some("2026-07-30T10:00:00Z"));
        assert_eq!(restarts, 7);
        assert_eq!(labels["app"], "web");
    }

    #[test]
    fn inspect_without_healthcheck_yields_none() {
        let doc = serde_json::json!({ "State": { "StartedAt": "x" } });
        let (health, _, restarts, labels) = parse_inspect_json(&doc);
        assert!(health.is_none());
        assert_eq!(restarts, 0);
        assert!(labels.is_empty());
    }

    fn container(name: &str) -> ContainerMetrics {
        ContainerMetrics {
            id: "abc123".to_string(),
            name: name.to_string(),
            image: "nginx:latest".to_string(),
            status: "Up 2 hours".to_string(),
            state: "running".to_string(),
            health: None,
            created: "2026-07-30".to_string(),
            started_at: None,
            cpu_percent: 1.0,
            memory_usage_bytes: 1024,
            memory_limit_bytes: 2048,
            memory_percent: 50.0,
            network_rx_bytes: 0,
            network_tx_bytes: 0,
            restart_count: 0,
            labels: HashMap::new(),
        }
    }

    fn snapshot(containers: Vec<ContainerMetrics>) -> DockerSnapshot {
        DockerSnapshot {
            timestamp: 1000.0,
            host: "h1".to_string(),
            docker_version: "26.0".to_string(),
            containers_total: containers.len() as u64,
            containers_running: 1,
            containers_paused: 0,
            containers_stopped: 0,
            images_count: 3,
            containers,
            available: true,
            error: None,
        }
    }

    #[test]
    fn unhealthy_exited_and_hot_containers_alert_high() {
        let collector = DockerCollector {
            host: "h1".to_string(),
            socket_path: "/nonexistent".to_string(),
        };

        let mut unhealthy = container("web");
        unhealthy.health = Some("unhealthy".to_string());

        let mut crashed = container("worker");
        crashed.state = "exited".to_string();
        crashed.restart_count = 3;

        let mut hot = container("cache");
        hot.memory_percent = 95.0;

        let alerts = collector.check_thresholds(
            &snapshot(vec![unhealthy, crashed, hot]),
            &ThresholdRules::default(),
        );
        assert_eq!(alerts.len(), 3);
        assert!(alerts.iter().all(|a| a.severity == Severity::High));
        let metrics: Vec<&str> = alerts.iter().map(|a| a.metric.as_str()).collect();
        assert_eq!(
            metrics,
            vec!["container_health", "container_exited", "container_memory"]
        );
    }

    #[test]
    fn exited_without_restarts_is_not_an_alert() {
        let collector = DockerCollector {
            host: "h1".to_string(),
            socket_path: "/nonexistent".to_string(),
        };
        let mut stopped = container("one-shot");
        stopped.state = "exited".to_string();
        stopped.restart_count = 0;
        let alerts =
            collector.check_thresholds(&snapshot(vec![stopped]), &ThresholdRules::default());
        assert!(alerts.is_empty());
    }

    #[test]
    fn running_containers_emit_stats_points() {
        let collector = DockerCollector {
            host: "h1".to_string(),
            socket_path: "/nonexistent".to_string(),
        };
        let points = collector.metric_points(&snapshot(vec![container("web")]));
        assert!(points.iter().any(|p| p.name == "sidra_container_cpu_percent"
            && p.labels["container"] == "web"));
        assert!(points
            .iter()
            .any(|p| p.name == "sidra_docker_containers_running" && p.value == 1.0));
    }
}
