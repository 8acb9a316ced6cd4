//! # Central Sender - Delivery with Bounded Retries
//!
//! HTTP client that ships batches from the edge to the Central Brain:
//!
//! - **Bounded retries**: `retry_count + 1` attempts per batch with
//!   exponential backoff (`retry_delay * 2^attempt`).
//! - **Rate-limit honoring**: a 429 sleeps for the server's `Retry-After`
//!   (default 60 s) and consumes an attempt.
//! - **Poison detection**: any other 4xx is terminal - the payload is bad,
//!   so it is surfaced and never buffered.
//! - **Buffer fallback**: exhausted transient failures (5xx, network,
//!   timeout) append the serialized batch to the durable buffer, priority 0
//!   for CRITICAL batches and 2 otherwise.
//! - **Buffer flushing**: when the central is healthy, up to 100 buffered
//!   items are replayed in priority order with a single retry each.
//!
//! The retry policy itself is a pure function ([`decide`]) over the attempt
//! number and the observed outcome; the sender is just a driver over it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use tracing::{debug, error, info, warn};

use crate::local_buffer::DurableBuffer;
use crate::wire::{
    unix_now, Alert, AlertsPayload, Batch, BufferedEnvelope, LogEntry, LogsPayload, MetricPoint,
    MetricsPayload, Priority,
};
use crate::{Result, TelemetryError};

/// Outcome of a single delivery attempt.
#[derive(Debug, Clone)]
pub enum SendOutcome {
    Accepted {
        status: u16,
    },
    HttpRejected {
        status: u16,
        detail: String,
        retry_after: Option<u64>,
    },
    NetworkFailed(String),
    TimedOut,
}

/// What the retry policy wants next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Delivered; stop.
    Done,
    /// Transient failure; wait `delay` and try again.
    Retry { delay: Duration },
    /// Server asked us to back off; wait `delay` and try again.
    RateLimited { delay: Duration },
    /// Terminal client error; the payload is poison. Do not retry or buffer.
    Poison,
    /// Attempts used up; hand the batch to the buffer.
    Exhausted,
}

/// Pure retry policy: maps one attempt's outcome to the next action.
///
/// `attempt` is zero-based; `max_attempts` includes the first try.
pub fn decide(
    attempt: u32,
    max_attempts: u32,
    base_delay: Duration,
    outcome: &SendOutcome,
) -> RetryDecision {
    let attempts_left = attempt + 1 < max_attempts;
    match outcome {
        SendOutcome::Accepted { .. } => RetryDecision::Done,
        SendOutcome::HttpRejected {
            status: 429,
            retry_after,
            ..
        } => {
            if attempts_left {
                RetryDecision::RateLimited {
                    delay: Duration::from_secs(retry_after.unwrap_or(60)),
                }
            } else {
                RetryDecision::Exhausted
            }
        }
        SendOutcome::HttpRejected { status, .. } if (400..500).contains(status) => {
            RetryDecision::Poison
        }
        _ => {
            if attempts_left {
                RetryDecision::Retry {
                    delay: base_delay * 2u32.saturating_pow(attempt),
                }
            } else {
                RetryDecision::Exhausted
            }
        }
    }
}

/// Result of a send operation as seen by callers.
#[derive(Debug, Clone)]
pub struct SendResult {
    pub success: bool,
    /// Last HTTP status observed, 0 when the failure was transport-level
    pub status_code: u16,
    pub error: Option<String>,
    /// Whether the payload was handed to the durable buffer
    pub buffered: bool,
}

impl SendResult {
    fn ok(status: u16) -> Self {
        Self {
            success: true,
            status_code: status,
            error: None,
            buffered: false,
        }
    }
}

enum DriveOutcome {
    Delivered { status: u16 },
    Poisoned { status: u16, detail: String },
    Exhausted { last_error: String },
}

/// HTTP sender with retry, backoff, and durable-buffer integration.
pub struct CentralSender {
    base_url: String,
    api_key: Option<String>,
    retry_count: u32,
    retry_delay: Duration,
    client: reqwest::Client,
    buffer: Option<DurableBuffer>,
    healthy: AtomicBool,
}

impl CentralSender {
    pub fn new(
        central_url: &str,
        api_key: Option<String>,
        timeout_secs: u64,
        retry_count: u32,
        retry_delay_secs: u64,
        buffer: Option<DurableBuffer>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(format!("SidraEdgeAgent/{}", crate::AGENT_VERSION))
            .build()
            .map_err(|e| TelemetryError::Network(format!("http client build: {e}")))?;

        Ok(Self {
            base_url: central_url.trim_end_matches('/').to_string(),
            api_key,
            retry_count,
            retry_delay: Duration::from_secs(retry_delay_secs),
            client,
            buffer,
            healthy: AtomicBool::new(false),
        })
    }

    /// Ingest route for a batch: alerts take precedence, then logs, then
    /// metrics; batches carrying more than one kind go to the combined
    /// endpoint so nothing is dropped server-side.
    pub fn endpoint_for(batch: &Batch) -> &'static str {
        if batch.kind_count() > 1 {
            "/api/v1/ingest/batch"
        } else if !batch.alerts.is_empty() {
            "/api/v1/ingest/alerts"
        } else if !batch.logs.is_empty() {
            "/api/v1/ingest/logs"
        } else {
            "/api/v1/ingest/metrics"
        }
    }

    /// Send a batch, buffering it on exhausted transient failure.
    pub async fn send_batch(&self, batch: &Batch) -> SendResult {
        let payload = match batch.to_json() {
            Ok(p) => p,
            Err(e) => {
                error!("batch serialization failed: {e}");
                return SendResult {
                    success: false,
                    status_code: 0,
                    error: Some(e.to_string()),
                    buffered: false,
                };
            }
        };
        let endpoint = Self::endpoint_for(batch);

        match self.drive(endpoint, &payload, self.retry_count + 1).await {
            DriveOutcome::Delivered { status } => {
                debug!(endpoint, items = batch.item_count(), "batch delivered");
                SendResult::ok(status)
            }
            DriveOutcome::Poisoned { status, detail } => {
                error!(endpoint, status, "central rejected batch as malformed: {detail}");
                SendResult {
                    success: false,
                    status_code: status,
                    error: Some(detail),
                    buffered: false,
                }
            }
            DriveOutcome::Exhausted { last_error } => {
                let buffered = self.buffer_batch(endpoint, payload, batch).await;
                SendResult {
                    success: false,
                    status_code: 0,
                    error: Some(last_error),
                    buffered,
                }
            }
        }
    }

    async fn buffer_batch(&self, endpoint: &str, payload: String, batch: &Batch) -> bool {
        let Some(buffer) = &self.buffer else {
            return false;
        };
        let priority = if batch.priority == Priority::Critical { 0 } else { 2 };
        let envelope = BufferedEnvelope {
            endpoint: endpoint.to_string(),
            payload,
            timestamp: batch.timestamp,
        };
        let body = match serde_json::to_string(&envelope) {
            Ok(b) => b,
            Err(e) => {
                error!("buffer envelope serialization failed: {e}");
                return false;
            }
        };
        match buffer.append(body, priority).await {
            Ok(id) => {
                info!(id, priority, "batch buffered for later delivery");
                true
            }
            Err(e) => {
                error!("failed to buffer batch: {e}");
                false
            }
        }
    }

    /// Send metrics directly, without batching or buffering.
    pub async fn send_metrics(&self, metrics: Vec<MetricPoint>, host: &str) -> SendResult {
        let payload = MetricsPayload {
            timestamp: unix_now(),
            host: host.to_string(),
            priority: Priority::Normal,
            metrics,
        };
        self.send_payload("/api/v1/ingest/metrics", &payload).await
    }

    /// Send a single alert immediately.
    pub async fn send_alert(&self, alert: Alert) -> SendResult {
        let payload = AlertsPayload {
            timestamp: unix_now(),
            host: alert.host.clone(),
            alert: Some(alert),
            alerts: Vec::new(),
        };
        self.send_payload("/api/v1/ingest/alerts", &payload).await
    }

    /// Send log entries directly.
    pub async fn send_logs(&self, logs: Vec<LogEntry>, host: &str) -> SendResult {
        let payload = LogsPayload {
            timestamp: unix_now(),
            host: host.to_string(),
            logs,
        };
        self.send_payload("/api/v1/ingest/logs", &payload).await
    }

    async fn send_payload<T: serde::Serialize>(&self, endpoint: &str, payload: &T) -> SendResult {
        let body = match serde_json::to_string(payload) {
            Ok(b) => b,
            Err(e) => {
                return SendResult {
                    success: false,
                    status_code: 0,
                    error: Some(e.to_string()),
                    buffered: false,
                }
            }
        };
        match self.drive(endpoint, &body, self.retry_count + 1).await {
            DriveOutcome::Delivered { status } => SendResult::ok(status),
            DriveOutcome::Poisoned { status, detail } => SendResult {
                success: false,
                status_code: status,
                error: Some(detail),
                buffered: false,
            },
            DriveOutcome::Exhausted { last_error } => SendResult {
                success: false,
                status_code: 0,
                error: Some(last_error),
                buffered: false,
            },
        }
    }

    /// Probe `GET /health` and record the result.
    pub async fn check_health(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        let mut request = self.client.get(&url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let healthy = match request.send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!("health check failed: {e}");
                false
            }
        };
        self.healthy.store(healthy, Ordering::Relaxed);
        healthy
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Replay buffered items against their original endpoints.
    ///
    /// Runs only when the central is healthy. Returns the number of items
    /// delivered; successes are deleted, the rest are retry-marked.
    pub async fn flush_buffer(&self) -> Result<usize> {
        let Some(buffer) = &self.buffer else {
            return Ok(0);
        };
        if !self.check_health().await {
            warn!("central unhealthy; skipping buffer flush");
            return Ok(0);
        }

        let items = buffer.peek_batch(100).await?;
        let mut delivered_ids = Vec::new();
        let mut sent = 0usize;

        for item in items {
            let envelope: BufferedEnvelope = match serde_json::from_str(&item.data) {
                Ok(e) => e,
                Err(e) => {
                    warn!(id = item.id, "undecodable buffered item: {e}");
                    buffer.mark_retry(item.id).await?;
                    continue;
                }
            };

            // one retry per buffered item; the flusher comes back around
            match self.drive(&envelope.endpoint, &envelope.payload, 2).await {
                DriveOutcome::Delivered { .. } => {
                    delivered_ids.push(item.id);
                    sent += 1;
                }
                _ => buffer.mark_retry(item.id).await?,
            }
        }

        buffer.delete(delivered_ids).await?;
        Ok(sent)
    }

    /// Drive the retry policy for one payload.
    async fn drive(&self, endpoint: &str, payload: &str, max_attempts: u32) -> DriveOutcome {
        let mut last_error = String::from("no attempts made");

        for attempt in 0..max_attempts {
            let outcome = self.send_once(endpoint, payload).await;
            match decide(attempt, max_attempts, self.retry_delay, &outcome) {
                RetryDecision::Done => {
                    let status = match outcome {
                        SendOutcome::Accepted { status } => status,
                        _ => 200,
                    };
                    return DriveOutcome::Delivered { status };
                }
                RetryDecision::Poison => {
                    let (status, detail) = match outcome {
                        SendOutcome::HttpRejected { status, detail, .. } => (status, detail),
                        other => (0, describe_outcome(&other)),
                    };
                    return DriveOutcome::Poisoned { status, detail };
                }
                RetryDecision::RateLimited { delay } => {
                    warn!(endpoint, "rate limited; honoring Retry-After of {delay:?}");
                    last_error = format!("rate limited (429), waited {delay:?}");
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::Retry { delay } => {
                    last_error = describe_outcome(&outcome);
                    warn!(
                        endpoint,
                        attempt = attempt + 1,
                        "send attempt failed ({last_error}); retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::Exhausted => {
                    last_error = describe_outcome(&outcome);
                    break;
                }
            }
        }

        DriveOutcome::Exhausted {
            last_error: format!("all {max_attempts} attempts failed: {last_error}"),
        }
    }

    async fn send_once(&self, endpoint: &str, payload: &str) -> SendOutcome {
        let url = format!("{}{}", self.base_url, endpoint);
        let mut request = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .body(payload.to_owned());
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        match request.send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if resp.status().is_success() {
                    SendOutcome::Accepted { status }
                } else {
                    let retry_after = (status == 429)
                        .then(|| {
                            resp.headers()
                                .get(reqwest::header::RETRY_AFTER)
                                .and_then(|v| v.to_str().ok())
                                .and_then(|s| s.parse().ok())
                        })
                        .flatten();
                    let detail: String = resp
                        .text()
                        .await
                        .unwrap_or_default()
                        .chars()
                        .take(500)
                        .collect();
                    SendOutcome::HttpRejected {
                        status,
                        detail,
                        retry_after,
                    }
                }
            }
            Err(e) if e.is_timeout() => SendOutcome::TimedOut,
            Err(e) => SendOutcome::NetworkFailed(e.to_string()),
        }
    }

    /// Release the sender. The pooled connections close on drop; this exists
    /// so shutdown reads symmetrically with the buffer.
    pub async fn close(&self) {
        debug!("sender closed");
    }
}

fn describe_outcome(outcome: &SendOutcome) -> String {
    match outcome {
        SendOutcome::Accepted { status } => format!("accepted ({status})"),
        SendOutcome::HttpRejected { status, .. } => format!("server returned {status}"),
        SendOutcome::NetworkFailed(e) => format!("network error: {e}"),
        SendOutcome::TimedOut => "request timeout".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_secs(5);

    fn http(status: u16) -> SendOutcome {
        SendOutcome::HttpRejected {
            status,
            detail: String::new(),
            retry_after: None,
        }
    }

    #[test]
    fn success_is_done() {
        assert_eq!(
            decide(0, 4, BASE, &SendOutcome::Accepted { status: 200 }),
            RetryDecision::Done
        );
    }

    #[test]
    fn server_errors_retry_with_doubling_backoff() {
        assert_eq!(
            decide(0, 4, BASE, &http(503)),
            RetryDecision::Retry { delay: Duration::from_secs(5) }
        );
        assert_eq!(
            decide(1, 4, BASE, &http(503)),
            RetryDecision::Retry { delay: Duration::from_secs(10) }
        );
        assert_eq!(
            decide(2, 4, BASE, &http(503)),
            RetryDecision::Retry { delay: Duration::from_secs(20) }
        );
        assert_eq!(decide(3, 4, BASE, &http(503)), RetryDecision::Exhausted);
    }

    #[test]
    fn network_and_timeout_are_retryable() {
        assert!(matches!(
            decide(0, 4, BASE, &SendOutcome::NetworkFailed("refused".into())),
            RetryDecision::Retry { .. }
        ));
        assert!(matches!(
            decide(0, 4, BASE, &SendOutcome::TimedOut),
            RetryDecision::Retry { .. }
        ));
    }

    #[test]
    fn client_errors_are_poison_on_the_first_attempt() {
        assert_eq!(decide(0, 4, BASE, &http(400)), RetryDecision::Poison);
        assert_eq!(decide(0, 4, BASE, &http(404)), RetryDecision::Poison);
        assert_eq!(decide(0, 4, BASE, &http(422)), RetryDecision::Poison);
    }

    #[test]
    fn rate_limit_honors_retry_after_and_defaults_to_sixty() {
        let with_header = SendOutcome::HttpRejected {
            status: 429,
            detail: String::new(),
            retry_after: Some(7),
        };
        assert_eq!(
            decide(0, 4, BASE, &with_header),
            RetryDecision::RateLimited { delay: Duration::from_secs(7) }
        );
        assert_eq!(
            decide(0, 4, BASE, &http(429)),
            RetryDecision::RateLimited { delay: Duration::from_secs(60) }
        );
        // a 429 on the final attempt is exhaustion, not an endless wait
        assert_eq!(decide(3, 4, BASE, &http(429)), RetryDecision::Exhausted);
    }

    #[test]
    fn endpoint_selection_prefers_alerts_then_logs_then_metrics() {
        let mut batch = Batch::empty("h1");
        assert_eq!(CentralSender::endpoint_for(&batch), "/api/v1/ingest/metrics");

        batch.logs.push(crate::wire::LogEntry {
            timestamp: 1.0,
            source: "s".into(),
            level: crate::wire::LogLevel::Info,
            message: "m".into(),
            host: "h1".into(),
            container: None,
            service: None,
        });
        assert_eq!(CentralSender::endpoint_for(&batch), "/api/v1/ingest/logs");

        batch.logs.clear();
        batch.alerts.push(Alert {
            metric: "cpu_usage".into(),
            value: serde_json::json!(99),
            threshold: None,
            severity: crate::wire::Severity::High,
            message: "m".into(),
            timestamp: 1.0,
            host: "h1".into(),
            labels: Default::default(),
        });
        assert_eq!(CentralSender::endpoint_for(&batch), "/api/v1/ingest/alerts");

        // mixed batches take the combined endpoint
        batch.metrics.push(MetricPoint::new("sidra_x", 1.0, 1.0));
        assert_eq!(CentralSender::endpoint_for(&batch), "/api/v1/ingest/batch");
    }
}
