//! # Service Collector - Units and Critical Processes
//!
//! Watches a configurable set of service units through `systemctl show`,
//! collects the full list of failed units, and scans the process table for
//! critical daemons (container runtimes, language runtimes, databases, web
//! servers) regardless of whether they run as units.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use sysinfo::System;

use super::{run_command, Collector, ThresholdRules};
use crate::config::ServiceCollectorConfig;
use crate::wire::{unix_now, Alert, MetricPoint, Severity};

/// Units watched on every host, in addition to the configured set.
const DEFAULT_SERVICES: &[&str] = &[
    "docker",
    "sshd",
    "nginx",
    "postgresql",
    "postgresql@14-main",
    "redis",
    "redis-server",
    "mysql",
    "mariadb",
    "mongod",
    "ollama",
    "netdata",
    "prometheus",
    "grafana-server",
    "wazuh-agent",
];

/// Processes monitored even when they are not units.
const CRITICAL_PROCESSES: &[&str] = &[
    "dockerd",
    "containerd",
    "ollama",
    "python",
    "node",
    "java",
    "postgres",
    "redis-server",
    "nginx",
    "gunicorn",
    "uvicorn",
];

/// Units whose outage is always critical.
const ESSENTIAL_UNITS: &[&str] = &["docker", "sshd", "postgresql"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub active: bool,
    pub running: bool,
    pub enabled: bool,
    /// ActiveState: active, inactive, failed, ...
    pub status: String,
    /// SubState: running, dead, exited, ...
    pub sub_state: String,
    pub description: String,
    pub pid: Option<u32>,
    pub memory_bytes: u64,
    pub restart_count: u32,
    pub last_restart: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub cmdline: String,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub status: String,
    pub create_time: f64,
}

/// Complete service snapshot for one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub timestamp: f64,
    pub host: String,
    pub services: Vec<ServiceStatus>,
    pub failed_services: Vec<String>,
    pub critical_processes: Vec<ProcessInfo>,
    pub systemd_available: bool,
}

/// Parse `systemctl show` key=value output.
pub(crate) fn parse_show_output(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            line.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect()
}

/// Build a service status from `systemctl show` properties. Returns `None`
/// for units that do not exist on this host.
pub(crate) fn service_from_props(
    name: &str,
    props: &HashMap<String, String>,
) -> Option<ServiceStatus> {
    let active_state = props.get("ActiveState").cloned().unwrap_or_default();
    let sub_state = props.get("SubState").cloned().unwrap_or_default();
    let unit_file_state = props.get("UnitFileState").cloned().unwrap_or_default();

    // inactive+dead with no unit file means the unit is simply not installed
    if active_state == "inactive" && sub_state == "dead" && unit_file_state.is_empty() {
        return None;
    }

    let memory = props
        .get("MemoryCurrent")
        .filter(|v| v.as_str() != "[not set]")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let pid = props
        .get("MainPID")
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|&p| p != 0);

    Some(ServiceStatus {
        name: name.to_string(),
        active: active_state == "active",
        running: sub_state == "running",
        enabled: unit_file_state == "enabled",
        status: active_state,
        sub_state,
        description: props.get("Description").cloned().unwrap_or_default(),
        pid,
        memory_bytes: memory,
        restart_count: props
            .get("NRestarts")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        last_restart: props
            .get("StateChangeTimestamp")
            .cloned()
            .unwrap_or_default(),
    })
}

/// Parse `systemctl --failed --no-legend --plain` output into unit names.
pub(crate) fn parse_failed_units(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

fn is_critical_process(name: &str) -> bool {
    let lower = name.to_lowercase();
    CRITICAL_PROCESSES.iter().any(|c| lower.contains(c))
}

fn scan_processes(sys: &mut System) -> Vec<ProcessInfo> {
    sys.refresh_processes();
    sys.processes()
        .iter()
        .filter(|(_, p)| is_critical_process(p.name()))
        .map(|(pid, p)| {
            let cmdline: String = p.cmd().join(" ").chars().take(200).collect();
            ProcessInfo {
                pid: pid.as_u32(),
                name: p.name().to_string(),
                cmdline,
                cpu_percent: p.cpu_usage() as f64,
                memory_bytes: p.memory(),
                status: p.status().to_string(),
                create_time: p.start_time() as f64,
            }
        })
        .collect()
}

/// systemctl-backed sampler plus a process-table scan.
pub struct ServiceCollector {
    host: String,
    watch: Vec<String>,
    sys: Arc<Mutex<System>>,
}

impl ServiceCollector {
    pub fn new(config: &ServiceCollectorConfig, host: impl Into<String>) -> Self {
        let mut names: HashSet<String> = DEFAULT_SERVICES.iter().map(|s| s.to_string()).collect();
        names.extend(config.watch_services.iter().cloned());
        let mut watch: Vec<String> = names.into_iter().collect();
        watch.sort();
        Self {
            host: host.into(),
            watch,
            sys: Arc::new(Mutex::new(System::new())),
        }
    }

    async fn systemd_available(&self) -> bool {
        run_command("systemctl", &["--version"], 5).await.is_ok()
    }

    async fn service_statuses(&self) -> Vec<ServiceStatus> {
        let mut services = Vec::new();
        for name in &self.watch {
            let Ok(out) = run_command(
                "systemctl",
                &[
                    "show",
                    name,
                    "--property=ActiveState,SubState,Description,MainPID,MemoryCurrent,NRestarts,StateChangeTimestamp,UnitFileState",
                ],
                5,
            )
            .await
            else {
                continue;
            };
            if let Some(service) = service_from_props(name, &parse_show_output(&out)) {
                services.push(service);
            }
        }
        services
    }

    async fn failed_units(&self) -> Vec<String> {
        match run_command("systemctl", &["--failed", "--no-legend", "--plain"], 10).await {
            Ok(out) => parse_failed_units(&out),
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl Collector for ServiceCollector {
    type Snapshot = ServiceSnapshot;

    fn name(&self) -> &'static str {
        "services"
    }

    fn available(&self) -> bool {
        true
    }

    async fn collect(&self) -> ServiceSnapshot {
        let systemd_available = self.systemd_available().await;

        let (services, failed_services) = if systemd_available {
            (self.service_statuses().await, self.failed_units().await)
        } else {
            (Vec::new(), Vec::new())
        };

        let sys = Arc::clone(&self.sys);
        let critical_processes = tokio::task::spawn_blocking(move || scan_processes(&mut sys.lock()))
            .await
            .unwrap_or_default();

        ServiceSnapshot {
            timestamp: unix_now(),
            host: self.host.clone(),
            services,
            failed_services,
            critical_processes,
            systemd_available,
        }
    }

    fn metric_points(&self, snap: &ServiceSnapshot) -> Vec<MetricPoint> {
        let ts = snap.timestamp;
        let host = snap.host.as_str();
        let point =
            |name: &str, value: f64| MetricPoint::new(name, value, ts).with_label("host", host);

        let mut points = vec![point(
            "sidra_services_failed_total",
            snap.failed_services.len() as f64,
        )];

        for service in &snap.services {
            let svc_point =
                |name: &str, value: f64| point(name, value).with_label("service", service.name.clone());
            points.push(svc_point(
                "sidra_service_active",
                if service.active { 1.0 } else { 0.0 },
            ));
            points.push(svc_point(
                "sidra_service_running",
                if service.running { 1.0 } else { 0.0 },
            ));
            if service.memory_bytes > 0 {
                points.push(svc_point(
                    "sidra_service_memory_bytes",
                    service.memory_bytes as f64,
                ));
            }
            points.push(svc_point(
                "sidra_service_restarts_total",
                service.restart_count as f64,
            ));
        }

        for process in &snap.critical_processes {
            let proc_point = |name: &str, value: f64| {
                point(name, value)
                    .with_label("process", process.name.clone())
                    .with_label("pid", process.pid.to_string())
            };
            points.push(proc_point("sidra_process_cpu_percent", process.cpu_percent));
            points.push(proc_point(
                "sidra_process_memory_bytes",
                process.memory_bytes as f64,
            ));
        }

        points
    }

    fn check_thresholds(&self, snap: &ServiceSnapshot, _rules: &ThresholdRules) -> Vec<Alert> {
        let mut alerts = Vec::new();

        for failed in &snap.failed_services {
            alerts.push(Alert {
                metric: "service_failed".to_string(),
                value: serde_json::json!(failed),
                threshold: None,
                severity: Severity::Critical,
                message: format!("Service {failed} has failed"),
                timestamp: snap.timestamp,
                host: snap.host.clone(),
                labels: std::collections::BTreeMap::from([(
                    "service".to_string(),
                    failed.clone(),
                )]),
            });
        }

        for service in &snap.services {
            let labels = std::collections::BTreeMap::from([(
                "service".to_string(),
                service.name.clone(),
            )]);

            if service.enabled && !service.running {
                let severity = if ESSENTIAL_UNITS.contains(&service.name.as_str()) {
                    Severity::Critical
                } else {
                    Severity::High
                };
                alerts.push(Alert {
                    metric: "service_down".to_string(),
                    value: serde_json::json!(service.status),
                    threshold: None,
                    severity,
                    message: format!(
                        "Service {} is not running (status: {})",
                        service.name, service.status
                    ),
                    timestamp: snap.timestamp,
                    host: snap.host.clone(),
                    labels: labels.clone(),
                });
            }

            if service.restart_count >= 5 {
                alerts.push(Alert {
                    metric: "service_restarts".to_string(),
                    value: serde_json::json!(service.restart_count),
                    threshold: Some(serde_json::json!(5)),
                    severity: Severity::Warning,
                    message: format!(
                        "Service {} has restarted {} times",
                        service.name, service.restart_count
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
