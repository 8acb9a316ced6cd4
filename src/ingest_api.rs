//! # Central Ingest API
//!
//! The HTTP surface of the Central Brain: accepts metric, alert, log, and
//! mixed batches from any edge agent, fans them out to the downstream
//! stores, and exposes the query surface (recent alerts, PromQL
//! pass-through, fixed summary).
//!
//! Ingest is fire-and-forget from the edge's perspective once a 2xx is
//! returned. A failed write to either downstream - including partial
//! success on the batch endpoint - returns a 500 with
//! `{"detail": "<message>"}` so the edge buffers and retries.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics::counter;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::alert_cache::AlertCache;
use crate::config::CentralConfig;
use crate::store_writers::{EventStoreWriter, TsdbWriter};
use crate::wire::{unix_now, Alert, AlertsPayload, Batch, LogsPayload, MetricsPayload, Severity};
use crate::{Result, TelemetryError};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub tsdb: Arc<TsdbWriter>,
    pub events: Arc<EventStoreWriter>,
    pub alerts: Arc<AlertCache>,
}

impl AppState {
    pub fn from_config(config: &CentralConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| TelemetryError::Network(format!("http client build: {e}")))?;
        Ok(Self {
            tsdb: Arc::new(TsdbWriter::new(&config.tsdb_url, client.clone())),
            events: Arc::new(EventStoreWriter::new(
                &config.event_store_url,
                &config.event_store_user,
                &config.event_store_password,
                client,
            )),
            alerts: Arc::new(AlertCache::default()),
        })
    }
}

/// Error shape of the ingest surface: 500 with `{"detail": …}`.
pub struct ApiError(String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "detail": self.0 })),
        )
            .into_response()
    }
}

impl From<TelemetryError> for ApiError {
    fn from(e: TelemetryError) -> Self {
        ApiError(e.to_string())
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/ingest/metrics", post(ingest_metrics))
        .route("/api/v1/ingest/alerts", post(ingest_alerts))
        .route("/api/v1/ingest/logs", post(ingest_logs))
        .route("/api/v1/ingest/batch", post(ingest_batch))
        .route("/api/v1/alerts/recent", get(recent_alerts))
        .route("/api/v1/alerts/critical", get(critical_alerts))
        .route("/api/v1/query", get(query_metrics))
        .route("/api/v1/summary", get(summary))
        .with_state(state)
}

/// Serve the ingest API until the token is cancelled.
pub async fn serve(bind_address: &str, state: AppState, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .map_err(|e| TelemetryError::Network(format!("bind {bind_address}: {e}")))?;
    info!("central ingest API listening on {bind_address}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| TelemetryError::Network(format!("ingest server: {e}")))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": unix_now(),
        "components": {
            "tsdb": state.tsdb.base_url(),
            "event_store": state.events.base_url(),
        }
    }))
}

/// Stamp the payload host onto metrics whose labels lack one.
fn stamp_host(metrics: &mut [crate::wire::MetricPoint], host: &str) {
    if host.is_empty() {
        return;
    }
    for metric in metrics.iter_mut() {
        metric
            .labels
            .entry("host".to_string())
            .or_insert_with(|| host.to_string());
    }
}

fn stamp_alert_hosts(alerts: &mut [Alert], host: &str) {
    for alert in alerts.iter_mut() {
        if alert.host.is_empty() {
            alert.host = host.to_string();
        }
    }
}

fn log_loud_alerts(alerts: &[Alert]) {
    for alert in alerts {
        if alert.severity.is_immediate() {
            warn!(
                "ALERT [{}] {}: {}",
                alert.severity.to_string().to_uppercase(),
                alert.host,
                alert.message
            );
        }
    }
}

async fn ingest_metrics(
    State(state): State<AppState>,
    Json(mut payload): Json<MetricsPayload>,
) -> std::result::Result<Json<Value>, ApiError> {
    stamp_host(&mut payload.metrics, &payload.host);
    state.tsdb.write(&payload.metrics).await?;
    counter!("sidra_central_metrics_ingested_total", payload.metrics.len() as u64);
    Ok(Json(json!({
        "status": "ok",
        "metrics_received": payload.metrics.len(),
    })))
}

async fn ingest_alerts(
    State(state): State<AppState>,
    Json(payload): Json<AlertsPayload>,
) -> std::result::Result<Json<Value>, ApiError> {
    let host = payload.host.clone();
    let mut alerts = payload.into_alerts();
    stamp_alert_hosts(&mut alerts, &host);

    for alert in &alerts {
        state.alerts.add(alert.clone());
    }
    log_loud_alerts(&alerts);

    state.events.write_alerts(&alerts).await?;
    counter!("sidra_central_alerts_ingested_total", alerts.len() as u64);
    Ok(Json(json!({
        "status": "ok",
        "alerts_received": alerts.len(),
    })))
}

async fn ingest_logs(
    State(state): State<AppState>,
    Json(payload): Json<LogsPayload>,
) -> std::result::Result<Json<Value>, ApiError> {
    state.events.write_logs(&payload.logs, &payload.host).await?;
    counter!("sidra_central_logs_ingested_total", payload.logs.len() as u64);
    Ok(Json(json!({
        "status": "ok",
        "logs_received": payload.logs.len(),
    })))
}

async fn ingest_batch(
    State(state): State<AppState>,
    Json(mut batch): Json<Batch>,
) -> std::result::Result<Json<Value>, ApiError> {
    let mut received = serde_json::Map::new();

    if !batch.metrics.is_empty() {
        stamp_host(&mut batch.metrics, &batch.host);
        state.tsdb.write(&batch.metrics).await?;
        received.insert("metrics".into(), json!(batch.metrics.len()));
    }

    if !batch.alerts.is_empty() {
        stamp_alert_hosts(&mut batch.alerts, &batch.host);
        for alert in &batch.alerts {
            state.alerts.add(alert.clone());
        }
        log_loud_alerts(&batch.alerts);
        state.events.write_alerts(&batch.alerts).await?;
        received.insert("alerts".into(), json!(batch.alerts.len()));
    }

    if !batch.logs.is_empty() {
        state.events.write_logs(&batch.logs, &batch.host).await?;
        received.insert("logs".into(), json!(batch.logs.len()));
    }

    counter!("sidra_central_batches_ingested_total", 1);
    Ok(Json(json!({ "status": "ok", "received": received })))
}

#[derive(Debug, Deserialize)]
struct CountParam {
    count: Option<usize>,
}

async fn recent_alerts(
    State(state): State<AppState>,
    Query(params): Query<CountParam>,
) -> Json<Value> {
    let alerts = state.alerts.recent(params.count.unwrap_or(100));
    Json(json!({ "count": alerts.len(), "alerts": alerts }))
}

async fn critical_alerts(
    State(state): State<AppState>,
    Query(params): Query<CountParam>,
) -> Json<Value> {
    let alerts = state
        .alerts
        .by_severity(Severity::Critical, params.count.unwrap_or(50));
    Json(json!({ "count": alerts.len(), "alerts": alerts }))
}

#[derive(Debug, Deserialize)]
struct QueryParam {
    q: String,
}

async fn query_metrics(
    State(state): State<AppState>,
    Query(params): Query<QueryParam>,
) -> std::result::Result<Json<Value>, ApiError> {
    let result = state.tsdb.query(&params.q).await?;
    Ok(Json(result))
}

/// Fixed queries run by the summary endpoint.
const SUMMARY_QUERIES: &[(&str, &str)] = &[
    ("hosts_up", "count(sidra_agent_health == 1)"),
    ("avg_cpu", "avg(sidra_cpu_usage_percent)"),
    ("avg_memory", "avg(sidra_memory_usage_percent)"),
    ("critical_alerts", "count(alerts{severity=\"critical\"})"),
];

async fn summary(State(state): State<AppState>) -> Json<Value> {
    let mut results: HashMap<&str, Value> = HashMap::new();
    for (name, query) in SUMMARY_QUERIES.iter().copied() {
        let value = match state.tsdb.query(query).await {
            Ok(resp) => resp
                .pointer("/data/result/0/value/1")
                .cloned()
                .unwrap_or_else(|| json!("N/A")),
            Err(_) => json!("N/A"),
        };
        results.insert(name, value);
    }

    let recent: Vec<Value> = state
        .alerts
        .recent(10)
        .into_iter()
        .map(|a| {
            json!({
                "severity": a.severity,
                "host": a.host,
                "message": a.message,
            })
        })
        .collect();

    Json(json!({
        "timestamp": unix_now(),
        "metrics": results,
        "recent_alerts": recent,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_is_stamped_only_when_absent() {
        let mut metrics = vec![
            crate::wire::MetricPoint::new("sidra_a", 1.0, 1.0),
            crate::wire::MetricPoint::new("sidra_b", 2.0, 1.0).with_label("host", "other"),
        ];
        stamp_host(&mut metrics, "edge-01");
        assert_eq!(metrics[0].labels["host"], "edge-01");
        assert_eq!(metrics[1].labels["host"], "other");
    }

    #[test]
    fn empty_payload_host_stamps_nothing() {
        let mut metrics = vec![crate::wire::MetricPoint::new("sidra_a", 1.0, 1.0)];
        stamp_host(&mut metrics, "");
        assert!(metrics[0].labels.get("host").is_none());
    }

    #[test]
    fn summary_queries_cover_the_fixed_set() {
        let names: Vec<&str> = SUMMARY_QUERIES.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["hosts_up", "avg_cpu", "avg_memory", "critical_alerts"]);
    }
}
