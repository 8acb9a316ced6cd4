//! # Configuration - Edge and Central
//!
//! Typed configuration for both processes, loaded from an optional YAML
//! file with explicit environment overrides on top. Every section carries
//! production defaults so an agent started with no file and no environment
//! still runs against `http://127.0.0.1:8200`.
//!
//! Environment overrides (edge): `SIDRA_AGENT_ID`, `SIDRA_CENTRAL_URL`,
//! `SIDRA_API_KEY`, `SIDRA_LOG_LEVEL`. The central reads `SIDRA_BIND_ADDRESS`,
//! `SIDRA_TSDB_URL`, `SIDRA_EVENT_STORE_URL`, `SIDRA_EVENT_STORE_USER`,
//! `SIDRA_EVENT_STORE_PASSWORD`, and `SIDRA_LOG_LEVEL`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::{Result, TelemetryError};

fn hostname() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "unknown-host".to_string())
}

/// System metrics collector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemCollectorConfig {
    pub enabled: bool,
    /// Sampling period in seconds
    pub interval: u64,
    /// Mount points that must always be sampled
    pub disk_paths: Vec<String>,
}

impl Default for SystemCollectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: 10,
            disk_paths: vec!["/".to_string()],
        }
    }
}

/// GPU metrics collector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuCollectorConfig {
    pub enabled: bool,
    pub interval: u64,
    /// Explicit nvidia-smi location; auto-detected when unset
    pub nvidia_smi_path: Option<String>,
}

impl Default for GpuCollectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: 10,
            nvidia_smi_path: None,
        }
    }
}

/// Container metrics collector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerCollectorConfig {
    pub enabled: bool,
    pub interval: u64,
    pub socket_path: String,
}

impl Default for DockerCollectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: 10,
            socket_path: "/var/run/docker.sock".to_string(),
        }
    }
}

/// Log collector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogCollectorConfig {
    pub enabled: bool,
    pub interval: u64,
    /// Files to tail-follow
    pub paths: Vec<String>,
    /// Also tail recent container stdout/stderr
    pub docker_logs: bool,
    pub max_lines_per_batch: usize,
}

impl Default for LogCollectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: 30,
            paths: vec![
                "/var/log/syslog".to_string(),
                "/var/log/auth.log".to_string(),
                "/var/log/kern.log".to_string(),
            ],
            docker_logs: true,
            max_lines_per_batch: 1000,
        }
    }
}

/// Service/unit collector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceCollectorConfig {
    pub enabled: bool,
    pub interval: u64,
    /// Units watched in addition to the built-in set
    pub watch_services: Vec<String>,
}

impl Default for ServiceCollectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: 60,
            watch_services: vec![
                "docker".to_string(),
                "sshd".to_string(),
                "nginx".to_string(),
                "postgresql".to_string(),
                "redis".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorsConfig {
    pub system: SystemCollectorConfig,
    pub gpu: GpuCollectorConfig,
    pub docker: DockerCollectorConfig,
    pub logs: LogCollectorConfig,
    pub services: ServiceCollectorConfig,
}

/// Batching behavior of the aggregator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    /// Seconds between periodic flushes
    pub batch_interval: u64,
    /// Maximum items (metrics + alerts + logs) per batch
    pub max_batch_size: usize,
    /// Maximum batch age in seconds before a flush is forced
    pub max_batch_age: u64,
    /// Send critical items immediately rather than batching
    pub critical_immediate: bool,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            batch_interval: 30,
            max_batch_size: 100,
            max_batch_age: 60,
            critical_immediate: true,
        }
    }
}

/// Durable local buffer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub enabled: bool,
    pub path: String,
    pub max_size_mb: u64,
    pub retention_hours: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/var/lib/sidra-agent/buffer.dat".to_string(),
            max_size_mb: 100,
            retention_hours: 24,
        }
    }
}

/// Alert threshold rule maps, keyed by metric name
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityRules {
    pub critical_thresholds: HashMap<String, f64>,
    pub high_thresholds: HashMap<String, f64>,
}

impl Default for PriorityRules {
    fn default() -> Self {
        let critical_thresholds = HashMap::from([
            ("cpu_usage".to_string(), 95.0),
            ("memory_usage".to_string(), 95.0),
            ("disk_usage".to_string(), 95.0),
            ("gpu_temp".to_string(), 85.0),
            ("gpu_memory".to_string(), 95.0),
        ]);
        let high_thresholds = HashMap::from([
            ("cpu_usage".to_string(), 85.0),
            ("memory_usage".to_string(), 85.0),
            ("disk_usage".to_string(), 90.0),
            ("gpu_memory".to_string(), 90.0),
        ]);
        Self {
            critical_thresholds,
            high_thresholds,
        }
    }
}

/// Main Edge Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    /// Agent identity; stamped as `host` on everything it emits
    pub agent_id: String,
    pub agent_version: String,

    /// Central Brain base URL
    pub central_url: String,
    /// Total per-request timeout in seconds
    pub central_timeout: u64,
    /// Retries after the first attempt
    pub central_retry_count: u32,
    /// Base backoff delay in seconds
    pub central_retry_delay: u64,
    /// Forwarded as `Authorization: Bearer` when set
    pub api_key: Option<String>,

    pub collectors: CollectorsConfig,
    pub batching: BatchingConfig,
    pub buffer: BufferConfig,
    pub priority: PriorityRules,

    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            agent_id: hostname(),
            agent_version: crate::AGENT_VERSION.to_string(),
            central_url: "http://127.0.0.1:8200".to_string(),
            central_timeout: 30,
            central_retry_count: 3,
            central_retry_delay: 5,
            api_key: None,
            collectors: CollectorsConfig::default(),
            batching: BatchingConfig::default(),
            buffer: BufferConfig::default(),
            priority: PriorityRules::default(),
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl EdgeConfig {
    /// Load configuration from an optional YAML file, then apply
    /// environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => {
                let loaded = config::Config::builder()
                    .add_source(config::File::with_name(p))
                    .build()
                    .map_err(|e| TelemetryError::Configuration(e.to_string()))?;
                loaded
                    .try_deserialize::<EdgeConfig>()
                    .map_err(|e| TelemetryError::Configuration(e.to_string()))?
            }
            None => EdgeConfig::default(),
        };
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SIDRA_AGENT_ID") {
            self.agent_id = v;
        }
        if let Ok(v) = std::env::var("SIDRA_CENTRAL_URL") {
            self.central_url = v;
        }
        if let Ok(v) = std::env::var("SIDRA_API_KEY") {
            self.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("SIDRA_LOG_LEVEL") {
            self.log_level = v;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.agent_id.is_empty() {
            return Err(TelemetryError::Configuration(
                "agent_id must not be empty".to_string(),
            ));
        }
        if self.batching.max_batch_size == 0 {
            return Err(TelemetryError::Configuration(
                "batching.max_batch_size must be at least 1".to_string(),
            ));
        }
        if !self.central_url.starts_with("http://") && !self.central_url.starts_with("https://") {
            return Err(TelemetryError::Configuration(format!(
                "central_url must be an http(s) URL, got {}",
                self.central_url
            )));
        }
        Ok(())
    }
}

/// Central Brain configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CentralConfig {
    pub bind_address: String,
    /// Downstream time-series store base URL
    pub tsdb_url: String,
    /// Downstream log/event store base URL
    pub event_store_url: String,
    pub event_store_user: String,
    pub event_store_password: String,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8200".to_string(),
            tsdb_url: "http://localhost:8428".to_string(),
            event_store_url: "http://localhost:5080".to_string(),
            event_store_user: "admin@sidra.local".to_string(),
            event_store_password: "sidra-admin".to_string(),
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl CentralConfig {
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => {
                let loaded = config::Config::builder()
                    .add_source(config::File::with_name(p))
                    .build()
                    .map_err(|e| TelemetryError::Configuration(e.to_string()))?;
                loaded
                    .try_deserialize::<CentralConfig>()
                    .map_err(|e| TelemetryError::Configuration(e.to_string()))?
            }
            None => CentralConfig::default(),
        };
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SIDRA_BIND_ADDRESS") {
            self.bind_address = v;
        }
        if let Ok(v) = std::env::var("SIDRA_TSDB_URL") {
            self.tsdb_url = v;
        }
        if let Ok(v) = std::env::var("SIDRA_EVENT_STORE_URL") {
            self.event_store_url = v;
        }
        if let Ok(v) = std::env::var("SIDRA_EVENT_STORE_USER") {
            self.event_store_user = v;
        }
        if let Ok(v) = std::env::var("SIDRA_EVENT_STORE_PASSWORD") {
            self.event_store_password = v;
        }
        if let Ok(v) = std::env::var("SIDRA_LOG_LEVEL") {
            self.log_level = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_contract() {
        let cfg = EdgeConfig::default();
        assert_eq!(cfg.central_timeout, 30);
        assert_eq!(cfg.central_retry_count, 3);
        assert_eq!(cfg.central_retry_delay, 5);
        assert_eq!(cfg.batching.batch_interval, 30);
        assert_eq!(cfg.batching.max_batch_size, 100);
        assert_eq!(cfg.batching.max_batch_age, 60);
        assert!(cfg.batching.critical_immediate);
        assert!(cfg.buffer.enabled);
        assert_eq!(cfg.buffer.max_size_mb, 100);
        assert_eq!(cfg.buffer.retention_hours, 24);
        assert_eq!(cfg.collectors.logs.max_lines_per_batch, 1000);
        assert_eq!(cfg.priority.critical_thresholds["cpu_usage"], 95.0);
        assert_eq!(cfg.priority.high_thresholds["disk_usage"], 90.0);
    }

    #[test]
    fn partial_yaml_keeps_defaults_for_missing_sections() {
        let yaml = r#"
agent_id: edge-42
central_url: "http://central:8200"
batching:
  max_batch_size: 50
"#;
        let cfg: EdgeConfig = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(cfg.agent_id, "edge-42");
        assert_eq!(cfg.batching.max_batch_size, 50);
        // untouched sections keep their defaults
        assert_eq!(cfg.batching.batch_interval, 30);
        assert_eq!(cfg.collectors.system.interval, 10);
        assert!(cfg.buffer.enabled);
    }

    #[test]
    fn invalid_central_url_is_rejected() {
        let cfg = EdgeConfig {
            central_url: "central:8200".to_string(),
            ..EdgeConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
