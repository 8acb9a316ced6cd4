//! # Batch Aggregator - Priority-Aware Batching with Deduplication
//!
//! Turns the stream of metric points, alerts, and log entries produced by
//! the collectors into timely, size-bounded, deduplicated batches:
//!
//! - **Critical bypass**: CRITICAL metrics, critical/high alerts, and
//!   critical/error logs return an immediate one-shot batch without
//!   disturbing the accumulating one.
//! - **Metric dedup**: a sample is skipped when its value has not moved
//!   meaningfully since the last accepted sample of the same name
//!   (absolute `< 1.0` for percent metrics, relative `< 1%` otherwise).
//!   Dedup is advisory and never applies to CRITICAL metrics.
//! - **Alert cooldowns**: repeated alerts for the same `(host, metric)`
//!   are dropped inside a severity-dependent window (60 s critical,
//!   300 s high, 900 s warning, 3600 s otherwise).
//! - **Bounded batches**: the current batch is returned as soon as it
//!   reaches `max_batch_size` items or `max_batch_age` seconds.
//!
//! The mutable state (current batch, dedup map, cooldown map) is the only
//! mutable core state of the edge pipeline. It is owned by a single actor
//! task; callers hold a cloneable [`BatchAggregator`] handle whose methods
//! send commands over a channel and await the reply, so every mutation is
//! serialized without a shared lock.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::config::BatchingConfig;
use crate::wire::{unix_now, Alert, Batch, LogEntry, MetricPoint, Priority};

/// Batch state machine: Empty -> Accumulating -> ReadyToSend -> Empty.
///
/// Plain value state driven by the aggregator actor. All methods take an
/// explicit `now` so the transition logic is deterministic under test.
#[derive(Debug)]
pub struct AggregatorState {
    host: String,
    max_batch_size: usize,
    max_batch_age: f64,
    current: Batch,
    batch_started: f64,
    /// metric name -> last accepted value
    last_values: HashMap<String, f64>,
    /// `(metric, host)` cooldown key -> acceptance time
    alert_cooldowns: HashMap<String, f64>,
}

impl AggregatorState {
    pub fn new(host: impl Into<String>, config: &BatchingConfig) -> Self {
        let host = host.into();
        Self {
            current: Batch::empty(&host),
            host,
            max_batch_size: config.max_batch_size,
            max_batch_age: config.max_batch_age as f64,
            batch_started: unix_now(),
            last_values: HashMap::new(),
            alert_cooldowns: HashMap::new(),
        }
    }

    /// Add a metric; returns a batch when one is ready to send.
    ///
    /// CRITICAL metrics produce an immediate single-element batch and leave
    /// the accumulating batch untouched.
    pub fn add_metric(&mut self, metric: MetricPoint, now: f64) -> Option<Batch> {
        if metric.priority == Priority::Critical {
            return Some(self.immediate_batch(vec![metric], Vec::new(), Vec::new(), now));
        }

        if self.should_skip_metric(&metric) {
            return None;
        }

        self.note_accumulation(now);
        self.last_values.insert(metric.name.clone(), metric.value);
        self.current.metrics.push(metric);
        self.check_batch_ready(now)
    }

    /// Add an alert; in-cooldown alerts are dropped, critical/high alerts
    /// return an immediate single-element batch.
    pub fn add_alert(&mut self, alert: Alert, now: f64) -> Option<Batch> {
        let key = alert.cooldown_key();
        if self.in_cooldown(&key, alert.severity.cooldown_secs(), now) {
            return None;
        }
        self.alert_cooldowns.insert(key, now);

        if alert.severity.is_immediate() {
            return Some(self.immediate_batch(Vec::new(), vec![alert], Vec::new(), now));
        }

        self.note_accumulation(now);
        self.current.alerts.push(alert);
        self.check_batch_ready(now)
    }

    /// Add a group of log entries.
    ///
    /// Critical and error entries are returned as an immediate batch; the
    /// remaining entries join the accumulating batch.
    pub fn add_logs(&mut self, logs: Vec<LogEntry>, now: f64) -> Option<Batch> {
        let (urgent, normal): (Vec<_>, Vec<_>) =
            logs.into_iter().partition(|l| l.level.is_urgent());

        if !normal.is_empty() {
            self.note_accumulation(now);
            self.current.logs.extend(normal);
        }

        if !urgent.is_empty() {
            return Some(self.immediate_batch(Vec::new(), Vec::new(), urgent, now));
        }
        self.check_batch_ready(now)
    }

    /// Return the current batch if non-empty and reset the state machine.
    pub fn flush(&mut self, now: f64) -> Option<Batch> {
        if self.current.is_empty() {
            return None;
        }
        Some(self.take_current(now))
    }

    /// The age clock starts at the Empty -> Accumulating transition.
    fn note_accumulation(&mut self, now: f64) {
        if self.current.is_empty() {
            self.batch_started = now;
        }
    }

    fn check_batch_ready(&mut self, now: f64) -> Option<Batch> {
        let age = now - self.batch_started;
        if self.current.item_count() >= self.max_batch_size || age >= self.max_batch_age {
            return Some(self.take_current(now));
        }
        None
    }

    fn take_current(&mut self, now: f64) -> Batch {
        let mut batch = std::mem::replace(&mut self.current, Batch::empty(&self.host));
        batch.timestamp = now;
        self.batch_started = now;
        batch
    }

    fn immediate_batch(
        &self,
        metrics: Vec<MetricPoint>,
        alerts: Vec<Alert>,
        logs: Vec<LogEntry>,
        now: f64,
    ) -> Batch {
        Batch {
            timestamp: now,
            host: self.host.clone(),
            priority: Priority::Critical,
            metrics,
            alerts,
            logs,
        }
    }

    /// Dedup rule: skip when the value has not changed meaningfully since
    /// the last accepted sample of the same name.
    fn should_skip_metric(&self, metric: &MetricPoint) -> bool {
        let Some(&last) = self.last_values.get(&metric.name) else {
            return false;
        };

        // Percent-style metrics: absolute movement under one point.
        if metric.name.to_lowercase().contains("percent") {
            return (metric.value - last).abs() < 1.0;
        }

        // Everything else: relative movement under 1%. A zero last value
        // disables the rule.
        if last != 0.0 {
            let change_pct = ((metric.value - last) / last).abs() * 100.0;
            return change_pct < 1.0;
        }

        false
    }

    fn in_cooldown(&self, key: &str, cooldown_secs: u64, now: f64) -> bool {
        match self.alert_cooldowns.get(key) {
            Some(&accepted_at) => (now - accepted_at) < cooldown_secs as f64,
            None => false,
        }
    }

    /// Current number of items in the accumulating batch.
    pub fn pending_items(&self) -> usize {
        self.current.item_count()
    }
}

enum Command {
    AddMetric(MetricPoint, oneshot::Sender<Option<Batch>>),
    AddAlert(Alert, oneshot::Sender<Option<Batch>>),
    AddLogs(Vec<LogEntry>, oneshot::Sender<Option<Batch>>),
    Flush(oneshot::Sender<Option<Batch>>),
}

/// Cloneable handle to the aggregator actor.
///
/// Dropping every handle ends the actor task.
#[derive(Clone)]
pub struct BatchAggregator {
    tx: mpsc::Sender<Command>,
}

impl BatchAggregator {
    /// Spawn the actor task owning the aggregator state.
    pub fn spawn(host: impl Into<String>, config: &BatchingConfig) -> Self {
        let (tx, mut rx) = mpsc::channel::<Command>(256);
        let mut state = AggregatorState::new(host, config);

        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                let _ = match command {
                    Command::AddMetric(metric, reply) => {
                        reply.send(state.add_metric(metric, unix_now()))
                    }
                    Command::AddAlert(alert, reply) => {
                        reply.send(state.add_alert(alert, unix_now()))
                    }
                    Command::AddLogs(logs, reply) => {
                        reply.send(state.add_logs(logs, unix_now()))
                    }
                    Command::Flush(reply) => reply.send(state.flush(unix_now())),
                };
            }
        });

        Self { tx }
    }

    pub async fn add_metric(&self, metric: MetricPoint) -> Option<Batch> {
        self.request(|reply| Command::AddMetric(metric, reply)).await
    }

    pub async fn add_alert(&self, alert: Alert) -> Option<Batch> {
        self.request(|reply| Command::AddAlert(alert, reply)).await
    }

    pub async fn add_logs(&self, logs: Vec<LogEntry>) -> Option<Batch> {
        self.request(|reply| Command::AddLogs(logs, reply)).await
    }

    pub async fn flush(&self) -> Option<Batch> {
        self.request(Command::Flush).await
    }

    async fn request<F>(&self, make: F) -> Option<Batch>
    where
        F: FnOnce(oneshot::Sender<Option<Batch>>) -> Command,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(make(reply_tx)).await.is_err() {
            warn!("aggregator actor is gone; dropping item");
            return None;
        }
        reply_rx.await.unwrap_or_default()
    }
}
