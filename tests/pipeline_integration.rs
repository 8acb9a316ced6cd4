//! End-to-end pipeline: an edge sender delivering into a real central
//! ingest app, which fans out to recording mock downstream sinks.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tempfile::TempDir;

use sidra_telemetry::alert_cache::AlertCache;
use sidra_telemetry::central_sender::CentralSender;
use sidra_telemetry::config::BufferConfig;
use sidra_telemetry::ingest_api::{router, AppState};
use sidra_telemetry::local_buffer::DurableBuffer;
use sidra_telemetry::store_writers::{EventStoreWriter, TsdbWriter};
use sidra_telemetry::wire::{Alert, Batch, LogEntry, LogLevel, MetricPoint, Severity};

/// Everything the mock downstream sinks have received.
#[derive(Default)]
struct SinkLog {
    tsdb_bodies: Vec<String>,
    events: Vec<(String, Value)>,
    tsdb_failing: bool,
}

type SharedSinkLog = Arc<Mutex<SinkLog>>;

async fn spawn_mock_sinks(log: SharedSinkLog) -> String {
    let app = Router::new()
        .route(
            "/api/v1/import/prometheus",
            post(|State(log): State<SharedSinkLog>, body: String| async move {
                let mut log = log.lock();
                if log.tsdb_failing {
                    return StatusCode::INTERNAL_SERVER_ERROR;
                }
                log.tsdb_bodies.push(body);
                StatusCode::NO_CONTENT
            }),
        )
        .route(
            "/api/v1/query",
            get(|| async {
                Json(json!({
                    "status": "success",
                    "data": { "result": [ { "value": [1700000000, "5"] } ] }
                }))
            }),
        )
        .route(
            "/api/default/:stream/_json",
            post(
                |Path(stream): Path<String>,
                 State(log): State<SharedSinkLog>,
                 Json(body): Json<Value>| async move {
                    log.lock().events.push((stream, body));
                    StatusCode::OK
                },
            ),
        )
        .with_state(log);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn spawn_central(sink_url: &str) -> (String, Arc<AlertCache>) {
    let client = reqwest::Client::new();
    let alerts = Arc::new(AlertCache::default());
    let state = AppState {
        tsdb: Arc::new(TsdbWriter::new(sink_url, client.clone())),
        events: Arc::new(EventStoreWriter::new(sink_url, "admin", "secret", client)),
        alerts: Arc::clone(&alerts),
    };
    let app = router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), alerts)
}

fn full_batch() -> Batch {
    let mut batch = Batch::empty("edge-01");
    batch.timestamp = 1700000000.5;
    // deliberately without a host label, to exercise the re-stamp
    batch
        .metrics
        .push(MetricPoint::new("sidra_cpu_usage_percent", 42.5, 1700000000.25));
    batch.alerts.push(Alert {
        metric: "cpu_usage".to_string(),
        value: json!(97.5),
        threshold: Some(json!(95)),
        severity: Severity::Critical,
        message: "CPU usage at 97.5%".to_string(),
        timestamp: 1700000000.5,
        host: String::new(),
        labels: BTreeMap::new(),
    });
    batch.logs.push(LogEntry {
        timestamp: 1700000000.75,
        source: "/var/log/syslog".to_string(),
        level: LogLevel::Error,
        message: "disk full".to_string(),
        host: String::new(),
        container: None,
        service: None,
    });
    batch
}

#[test_log::test(tokio::test)]
async fn mixed_batch_flows_to_both_sinks_with_host_stamped() {
    let sinks: SharedSinkLog = Arc::default();
    let sink_url = spawn_mock_sinks(Arc::clone(&sinks)).await;
    let (central_url, _alerts) = spawn_central(&sink_url).await;

    let sender = CentralSender::new(&central_url, None, 5, 0, 0, None).unwrap();
    let result = sender.send_batch(&full_batch()).await;
    assert!(result.success, "ingest should accept the batch: {:?}", result.error);

    let log = sinks.lock();

    // metrics reached the TSDB with the payload host stamped into labels
    assert_eq!(log.tsdb_bodies.len(), 1);
    let line = &log.tsdb_bodies[0];
    assert!(line.contains("sidra_cpu_usage_percent"));
    assert!(line.contains(r#"host="edge-01""#));
    assert!(line.ends_with(" 42.5 1700000000250"));

    // alerts and logs reached their event streams with micro timestamps
    let streams: Vec<&str> = log.events.iter().map(|(s, _)| s.as_str()).collect();
    assert!(streams.contains(&"alerts"));
    assert!(streams.contains(&"logs"));

    let (_, alert_body) = log.events.iter().find(|(s, _)| s == "alerts").unwrap();
    assert_eq!(alert_body[0]["_timestamp"], json!(1_700_000_000_500_000i64));
    assert_eq!(alert_body[0]["host"], "edge-01");
    assert_eq!(alert_body[0]["value"], "97.5");

    let (_, log_body) = log.events.iter().find(|(s, _)| s == "logs").unwrap();
    assert_eq!(log_body[0]["_timestamp"], json!(1_700_000_000_750_000i64));
    assert_eq!(log_body[0]["level"], "error");
    assert_eq!(log_body[0]["host"], "edge-01");
}

#[tokio::test]
async fn ingested_alerts_are_readable_from_the_cache_endpoints() {
    let sinks: SharedSinkLog = Arc::default();
    let sink_url = spawn_mock_sinks(Arc::clone(&sinks)).await;
    let (central_url, _) = spawn_central(&sink_url).await;

    let sender = CentralSender::new(&central_url, None, 5, 0, 0, None).unwrap();
    assert!(sender.send_batch(&full_batch()).await.success);

    let client = reqwest::Client::new();
    let recent: Value = client
        .get(format!("{central_url}/api/v1/alerts/recent?count=10"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(recent["count"], 1);
    assert_eq!(recent["alerts"][0]["metric"], "cpu_usage");
    assert_eq!(recent["alerts"][0]["host"], "edge-01");

    let critical: Value = client
        .get(format!("{central_url}/api/v1/alerts/critical?count=5"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(critical["count"], 1);
    assert_eq!(critical["alerts"][0]["severity"], "critical");
}

#[tokio::test]
async fn health_query_and_summary_surfaces_respond() {
    let sinks: SharedSinkLog = Arc::default();
    let sink_url = spawn_mock_sinks(Arc::clone(&sinks)).await;
    let (central_url, alerts) = spawn_central(&sink_url).await;

    let client = reqwest::Client::new();

    let health: Value = client
        .get(format!("{central_url}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");
    assert!(health["timestamp"].as_f64().unwrap() > 0.0);

    // PromQL pass-through returns the TSDB response verbatim
    let query: Value = client
        .get(format!(
            "{central_url}/api/v1/query?q=avg(sidra_cpu_usage_percent)"
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(query["status"], "success");

    alerts.add(Alert {
        metric: "memory_usage".to_string(),
        value: json!(91),
        threshold: None,
        severity: Severity::High,
        message: "Memory usage at 91.0%".to_string(),
        timestamp: 1700000001.0,
        host: "edge-02".to_string(),
        labels: BTreeMap::new(),
    });

    let summary: Value = client
        .get(format!("{central_url}/api/v1/summary"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(summary["metrics"]["avg_cpu"], "5");
    assert_eq!(summary["recent_alerts"][0]["host"], "edge-02");
}

#[tokio::test]
async fn downstream_failure_returns_500_and_the_edge_buffers() {
    let sinks: SharedSinkLog = Arc::default();
    sinks.lock().tsdb_failing = true;
    let sink_url = spawn_mock_sinks(Arc::clone(&sinks)).await;
    let (central_url, _) = spawn_central(&sink_url).await;

    let dir = TempDir::new().unwrap();
    let buffer = DurableBuffer::open(&BufferConfig {
        enabled: true,
        path: dir.path().join("buffer.dat").to_string_lossy().into_owned(),
        max_size_mb: 10,
        retention_hours: 24,
    })
    .await
    .unwrap();

    let sender = CentralSender::new(&central_url, None, 5, 0, 0, Some(buffer.clone())).unwrap();

    let mut batch = Batch::empty("edge-01");
    batch
        .metrics
        .push(MetricPoint::new("sidra_cpu_usage_percent", 42.5, 1700000000.25));
    let result = sender.send_batch(&batch).await;

    assert!(!result.success);
    assert!(result.buffered, "500 from the central must land in the buffer");
    assert_eq!(buffer.count().await.unwrap(), 1);

    // once the downstream recovers, the buffered batch flushes through
    sinks.lock().tsdb_failing = false;
    let sent = sender.flush_buffer().await.unwrap();
    assert_eq!(sent, 1);
    assert_eq!(buffer.count().await.unwrap(), 0);
    assert_eq!(sinks.lock().tsdb_bodies.len(), 1);
}

#[tokio::test]
async fn malformed_payload_gets_a_client_error_not_a_buffer_entry() {
    let sinks: SharedSinkLog = Arc::default();
    let sink_url = spawn_mock_sinks(Arc::clone(&sinks)).await;
    let (central_url, _) = spawn_central(&sink_url).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{central_url}/api/v1/ingest/metrics"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_client_error());
}
