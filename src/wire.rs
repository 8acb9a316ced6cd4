//! # Wire Types - Shared Value Records
//!
//! Plain value structs crossing the edge-to-central boundary: metric points,
//! alerts, log entries, and the batches that carry them, plus the ingest
//! payload shapes the central accepts. All of these serialize to the JSON
//! wire format; timestamps are epoch seconds as `f64` (fractional allowed).
//!
//! None of these types are mutated after creation. The aggregator owns the
//! only mutable pipeline state; everything here is created once by a
//! collector (or an ingest handler) and moved through the pipeline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current wall-clock time as fractional epoch seconds.
pub fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Delivery priority for metrics and batches
///
/// Doubles as the on-disk buffer ordering key: `CRITICAL` items flush first,
/// then by age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    /// Send immediately, bypassing batching
    Critical,
    /// Send within the next batch interval
    High,
    /// Batch on the default interval
    Normal,
    /// Send whenever convenient
    Low,
}

impl Priority {
    /// Buffer storage ordinal: 0 = critical .. 3 = low.
    pub fn as_index(self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    pub fn from_index(index: u8) -> Self {
        match index {
            0 => Priority::Critical,
            1 => Priority::High,
            3 => Priority::Low,
            _ => Priority::Normal,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Critical => write!(f, "CRITICAL"),
            Priority::High => write!(f, "HIGH"),
            Priority::Normal => write!(f, "NORMAL"),
            Priority::Low => write!(f, "LOW"),
        }
    }
}

/// Alert severity as it appears on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Warning,
    Info,
}

impl Severity {
    /// Cooldown window in seconds for repeated alerts of this severity,
    /// keyed on `(host, metric)`.
    pub fn cooldown_secs(self) -> u64 {
        match self {
            Severity::Critical => 60,
            Severity::High => 300,
            Severity::Warning => 900,
            Severity::Info => 3600,
        }
    }

    /// Critical and high severity alerts bypass batching entirely.
    pub fn is_immediate(self) -> bool {
        matches!(self, Severity::Critical | Severity::High)
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Critical => write!(f, "critical"),
            Severity::High => write!(f, "high"),
            Severity::Warning => write!(f, "warning"),
            Severity::Info => write!(f, "info"),
        }
    }
}

/// Log line classification level
///
/// Distinct from [`Severity`]: log collectors classify lines into this set,
/// and `critical`/`error` entries force an immediate flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Critical,
    Error,
    Warning,
    Info,
}

impl LogLevel {
    /// Entries at this level are shipped immediately rather than batched.
    pub fn is_urgent(self) -> bool {
        matches!(self, LogLevel::Critical | LogLevel::Error)
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Critical => write!(f, "critical"),
            LogLevel::Error => write!(f, "error"),
            LogLevel::Warning => write!(f, "warning"),
            LogLevel::Info => write!(f, "info"),
        }
    }
}

/// A single metric sample
///
/// Created by a collector at sample time, owned by the aggregator until
/// flushed, and never mutated. The `priority` field is edge-internal and
/// does not cross the wire; only the batch carries a priority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricPoint {
    /// Metric identifier, e.g. `sidra_cpu_usage_percent`
    pub name: String,
    /// Sampled value
    pub value: f64,
    /// Epoch seconds at sample time
    pub timestamp: f64,
    /// Small label map; keys unique, deterministic order
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Edge-internal delivery class; not serialized
    #[serde(skip)]
    pub priority: Priority,
}

impl MetricPoint {
    pub fn new(name: impl Into<String>, value: f64, timestamp: f64) -> Self {
        Self {
            name: name.into(),
            value,
            timestamp,
            labels: BTreeMap::new(),
            priority: Priority::Normal,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// A threshold or health alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// The metric or condition that fired, e.g. `cpu_usage`
    pub metric: String,
    /// Observed value; numeric or string
    pub value: serde_json::Value,
    /// Threshold that was crossed, if any
    #[serde(default)]
    pub threshold: Option<serde_json::Value>,
    pub severity: Severity,
    /// Human-readable description
    pub message: String,
    pub timestamp: f64,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Alert {
    /// Cooldown key: repeated alerts for the same host and metric are
    /// suppressed inside the severity's window.
    pub fn cooldown_key(&self) -> String {
        format!("{}:{}", self.metric, self.host)
    }
}

/// A single collected log line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: f64,
    /// File path or `docker://<container>`
    pub source: String,
    pub level: LogLevel,
    /// Line content, truncated to 500 characters at collection
    pub message: String,
    #[serde(default)]
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

/// A bounded group of metrics, alerts, and logs ready to send
///
/// Assembled by the aggregator, consumed exactly once by the sender, then
/// discarded on success or re-queued to the durable buffer on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub timestamp: f64,
    pub host: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub metrics: Vec<MetricPoint>,
    #[serde(default)]
    pub alerts: Vec<Alert>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
}

impl Batch {
    pub fn empty(host: impl Into<String>) -> Self {
        Self {
            timestamp: unix_now(),
            host: host.into(),
            priority: Priority::Normal,
            metrics: Vec::new(),
            alerts: Vec::new(),
            logs: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty() && self.alerts.is_empty() && self.logs.is_empty()
    }

    /// Total item count across all three payload kinds.
    pub fn item_count(&self) -> usize {
        self.metrics.len() + self.alerts.len() + self.logs.len()
    }

    /// Number of distinct payload kinds present.
    pub fn kind_count(&self) -> usize {
        usize::from(!self.metrics.is_empty())
            + usize::from(!self.alerts.is_empty())
            + usize::from(!self.logs.is_empty())
    }

    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self)
            .map_err(|e| crate::TelemetryError::SystemError(format!("batch serialization: {e}")))
    }
}

/// Payload accepted by `POST /api/v1/ingest/metrics`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsPayload {
    pub timestamp: f64,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub metrics: Vec<MetricPoint>,
}

/// Payload accepted by `POST /api/v1/ingest/alerts`
///
/// Accepts either a singular `alert` or an `alerts` list; both forms appear
/// on the wire (the sender's immediate path uses the singular form).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsPayload {
    pub timestamp: f64,
    #[serde(default)]
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<Alert>,
    #[serde(default)]
    pub alerts: Vec<Alert>,
}

impl AlertsPayload {
    /// Flatten the singular and plural forms into one list.
    pub fn into_alerts(self) -> Vec<Alert> {
        let mut alerts = self.alerts;
        if let Some(alert) = self.alert {
            alerts.push(alert);
        }
        alerts
    }
}

/// Payload accepted by `POST /api/v1/ingest/logs`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsPayload {
    pub timestamp: f64,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
}

/// Envelope stored in the durable buffer for a batch that failed to send
///
/// Captures the originating endpoint so a later flush replays the payload
/// verbatim against the same route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferedEnvelope {
    pub endpoint: String,
    pub payload: String,
    pub timestamp: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_roundtrips_through_index() {
        for p in [
            Priority::Critical,
            Priority::High,
            Priority::Normal,
            Priority::Low,
        ] {
            assert_eq!(Priority::from_index(p.as_index()), p);
        }
    }

    #[test]
    fn priority_serializes_uppercase() {
        assert_eq!(
            serde_json::to_string(&Priority::Critical).unwrap(),
            "\"CRITICAL\""
        );
        let p: Priority = serde_json::from_str("\"LOW\"").unwrap();
        assert_eq!(p, Priority::Low);
    }

    #[test]
    fn severity_cooldowns_match_contract() {
        assert_eq!(Severity::Critical.cooldown_secs(), 60);
        assert_eq!(Severity::High.cooldown_secs(), 300);
        assert_eq!(Severity::Warning.cooldown_secs(), 900);
        assert_eq!(Severity::Info.cooldown_secs(), 3600);
    }

    #[test]
    fn batch_json_roundtrip_is_structurally_equal() {
        let mut batch = Batch::empty("edge-01");
        batch.metrics.push(
            MetricPoint::new("sidra_cpu_usage_percent", 42.5, 1700000000.25)
                .with_label("host", "edge-01"),
        );
        batch.alerts.push(Alert {
            metric: "cpu_usage".into(),
            value: serde_json::json!(97.1),
            threshold: Some(serde_json::json!(95)),
            severity: Severity::Critical,
            message: "CPU usage at 97.1%".into(),
            timestamp: 1700000000.5,
            host: "edge-01".into(),
            labels: BTreeMap::new(),
        });
        batch.logs.push(LogEntry {
            timestamp: 1700000001.0,
            source: "/var/log/syslog".into(),
            level: LogLevel::Error,
            message: "disk full".into(),
            host: "edge-01".into(),
            container: None,
            service: None,
        });

        let json = batch.to_json().unwrap();
        let parsed: Batch = serde_json::from_str(&json).unwrap();
        let rejson = parsed.to_json().unwrap();

        let a: serde_json::Value = serde_json::from_str(&json).unwrap();
        let b: serde_json::Value = serde_json::from_str(&rejson).unwrap();
        assert_eq!(a, b);
        assert_eq!(parsed.item_count(), 3);
        assert_eq!(parsed.kind_count(), 3);
    }

    #[test]
    fn metric_priority_does_not_cross_the_wire() {
        let m =
            MetricPoint::new("sidra_load_1m", 1.0, 100.0).with_priority(Priority::Critical);
        let json = serde_json::to_value(&m).unwrap();
        assert!(json.get("priority").is_none());
        let back: MetricPoint = serde_json::from_value(json).unwrap();
        assert_eq!(back.priority, Priority::Normal);
    }

    #[test]
    fn alerts_payload_flattens_singular_form() {
        let payload: AlertsPayload = serde_json::from_str(
            r#"{"timestamp": 1.0, "host": "h1",
                "alert": {"metric":"cpu_usage","value":99,"severity":"high",
                          "message":"m","timestamp":1.0}}"#,
        )
        .unwrap();
        let alerts = payload.into_alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].metric, "cpu_usage");
    }
}
