//! # Downstream Writers - TSDB and Event Store Wire Formats
//!
//! The central fans ingested data out to two opaque HTTP sinks:
//!
//! - **TSDB**: metrics as Prometheus text import lines,
//!   `<name>{<k>="<v>",...} <value> <ts_ms>` with millisecond timestamps.
//!   Label values are escaped (`\` and `"`); newlines cannot appear in a
//!   line-oriented format and are stripped.
//! - **Event store**: logs and alerts as JSON arrays against named streams,
//!   each element carrying `_timestamp` as integer microseconds.
//!
//! Both writers report failure as an error so the ingest layer can return
//! 5xx and the edge buffers the payload; at-least-once delivery with
//! idempotent sinks is the contract.

use serde_json::json;
use tracing::error;

use crate::wire::{Alert, LogEntry, MetricPoint};
use crate::{Result, TelemetryError};

/// Escape a label value for the Prometheus text format.
fn escape_label_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => {}
            _ => out.push(c),
        }
    }
    out
}

/// Render metrics as Prometheus text import lines.
pub fn render_prometheus_lines(metrics: &[MetricPoint]) -> String {
    let mut lines = Vec::with_capacity(metrics.len());
    for m in metrics {
        let ts_ms = (m.timestamp * 1000.0).round() as i64;
        if m.labels.is_empty() {
            lines.push(format!("{} {} {}", m.name, m.value, ts_ms));
        } else {
            let labels: Vec<String> = m
                .labels
                .iter()
                .map(|(k, v)| format!("{k}=\"{}\"", escape_label_value(v)))
                .collect();
            lines.push(format!("{}{{{}}} {} {}", m.name, labels.join(","), m.value, ts_ms));
        }
    }
    lines.join("\n")
}

fn stringify(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn micros(timestamp: f64) -> i64 {
    (timestamp * 1_000_000.0).round() as i64
}

/// Client for the downstream time-series store.
pub struct TsdbWriter {
    base_url: String,
    client: reqwest::Client,
}

impl TsdbWriter {
    pub fn new(base_url: &str, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Write metrics through the Prometheus text import endpoint.
    pub async fn write(&self, metrics: &[MetricPoint]) -> Result<()> {
        if metrics.is_empty() {
            return Ok(());
        }
        let body = render_prometheus_lines(metrics);
        let url = format!("{}/api/v1/import/prometheus", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                error!("tsdb write error: {e}");
                TelemetryError::Downstream(format!("tsdb write: {e}"))
            })?;
        if !resp.status().is_success() {
            return Err(TelemetryError::Downstream(format!(
                "tsdb returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    /// PromQL pass-through.
    pub async fn query(&self, query: &str) -> Result<serde_json::Value> {
        let url = format!("{}/api/v1/query", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("query", query)])
            .send()
            .await
            .map_err(|e| TelemetryError::Downstream(format!("tsdb query: {e}")))?;
        resp.json::<serde_json::Value>()
            .await
            .map_err(|e| TelemetryError::Downstream(format!("tsdb query decode: {e}")))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Client for the downstream log/event store.
pub struct EventStoreWriter {
    base_url: String,
    user: String,
    password: String,
    client: reqwest::Client,
}

impl EventStoreWriter {
    pub fn new(base_url: &str, user: &str, password: &str, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            user: user.to_string(),
            password: password.to_string(),
            client,
        }
    }

    /// Write raw event records to a named stream.
    pub async fn write_events(&self, stream: &str, events: &[serde_json::Value]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let url = format!("{}/api/default/{stream}/_json", self.base_url);
        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.user, Some(&self.password))
            .json(events)
            .send()
            .await
            .map_err(|e| {
                error!("event store write error: {e}");
                TelemetryError::Downstream(format!("event store write: {e}"))
            })?;
        if !resp.status().is_success() {
            return Err(TelemetryError::Downstream(format!(
                "event store returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    /// Write log entries to the `logs` stream.
    pub async fn write_logs(&self, logs: &[LogEntry], default_host: &str) -> Result<()> {
        let events: Vec<serde_json::Value> = logs
            .iter()
            .map(|l| {
                let host = if l.host.is_empty() { default_host } else { &l.host };
                json!({
                    "_timestamp": micros(l.timestamp),
                    "level": l.level,
                    "message": l.message,
                    "source": l.source,
                    "host": host,
                })
            })
            .collect();
        self.write_events("logs", &events).await
    }

    /// Write alerts to the `alerts` stream.
    pub async fn write_alerts(&self, alerts: &[Alert]) -> Result<()> {
        let events: Vec<serde_json::Value> = alerts
            .iter()
            .map(|a| {
                json!({
                    "_timestamp": micros(a.timestamp),
                    "metric": a.metric,
                    "value": stringify(&a.value),
                    "threshold": a.threshold.as_ref().map(stringify).unwrap_or_default(),
                    "severity": a.severity,
                    "message": a.message,
                    "host": a.host,
                })
            })
            .collect();
        self.write_events("alerts", &events).await
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}
