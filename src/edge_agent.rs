//! # Edge Agent Supervisor
//!
//! Owns every long-running task of the edge process: five collector loops,
//! the aggregator actor, the durable buffer, and the sender, plus three
//! housekeeping loops (periodic batch flush, buffer flush, health
//! self-metrics). A single cancellation token propagates shutdown to all of
//! them; SIGINT/SIGTERM trigger a bounded final flush before exit.
//!
//! The agent is expected to run forever. No error from any subsystem
//! reaches `main`: collector failures are logged and their loops continue,
//! send failures land in the durable buffer, and the status line keeps
//! printing through a central outage with only the buffer gauge growing.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use metrics::gauge;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::batching::BatchAggregator;
use crate::central_sender::CentralSender;
use crate::collectors::docker::DockerCollector;
use crate::collectors::gpu::GpuCollector;
use crate::collectors::logs::LogCollector;
use crate::collectors::services::ServiceCollector;
use crate::collectors::system::SystemCollector;
use crate::collectors::{Collector, ThresholdRules};
use crate::config::EdgeConfig;
use crate::local_buffer::{BufferStore, DurableBuffer};
use crate::wire::{unix_now, Batch, MetricPoint, Priority};
use crate::Result;

const BUFFER_FLUSH_INTERVAL: Duration = Duration::from_secs(300);
const HEALTH_REPORT_INTERVAL: Duration = Duration::from_secs(60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Main edge daemon: orchestrates collectors and ships data to the
/// Central Brain.
pub struct EdgeAgent {
    config: EdgeConfig,
    aggregator: BatchAggregator,
    sender: Arc<CentralSender>,
    buffer: Option<DurableBuffer>,
    cancel: CancellationToken,
}

impl EdgeAgent {
    /// Wire up buffer, sender, and aggregator. Must be called inside a
    /// tokio runtime (the aggregator actor is spawned here).
    pub fn new(config: EdgeConfig) -> Result<Self> {
        let buffer = if config.buffer.enabled {
            let store = BufferStore::open(
                Path::new(&config.buffer.path),
                config.buffer.max_size_mb,
                config.buffer.retention_hours,
            )?;
            Some(DurableBuffer::from_store(store))
        } else {
            None
        };

        let sender = Arc::new(CentralSender::new(
            &config.central_url,
            config.api_key.clone(),
            config.central_timeout,
            config.central_retry_count,
            config.central_retry_delay,
            buffer.clone(),
        )?);

        let aggregator = BatchAggregator::spawn(config.agent_id.clone(), &config.batching);

        Ok(Self {
            config,
            aggregator,
            sender,
            buffer,
            cancel: CancellationToken::new(),
        })
    }

    /// Token observed by every spawned task; cancelling it stops the agent.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until SIGINT/SIGTERM or cancellation, then shut down gracefully.
    pub async fn run(&self) -> Result<()> {
        info!(
            "starting sidra edge agent {} on {} -> {}",
            crate::AGENT_VERSION,
            self.config.agent_id,
            self.config.central_url
        );

        if !self.sender.check_health().await {
            warn!("central brain not reachable; data will be buffered locally");
        }

        let rules = Arc::new(ThresholdRules::from_config(&self.config.priority));
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        if self.config.collectors.system.enabled {
            tasks.push(self.spawn_system_loop(Arc::clone(&rules)));
        }
        if self.config.collectors.gpu.enabled {
            tasks.push(self.spawn_collector_loop(
                GpuCollector::new(&self.config.collectors.gpu, self.config.agent_id.clone()),
                self.config.collectors.gpu.interval,
                Arc::clone(&rules),
            ));
        }
        if self.config.collectors.docker.enabled {
            tasks.push(self.spawn_collector_loop(
                DockerCollector::new(&self.config.collectors.docker, self.config.agent_id.clone()),
                self.config.collectors.docker.interval,
                Arc::clone(&rules),
            ));
        }
        if self.config.collectors.services.enabled {
            tasks.push(self.spawn_collector_loop(
                ServiceCollector::new(
                    &self.config.collectors.services,
                    self.config.agent_id.clone(),
                ),
                self.config.collectors.services.interval,
                Arc::clone(&rules),
            ));
        }
        if self.config.collectors.logs.enabled {
            tasks.push(self.spawn_log_loop());
        }
        tasks.push(self.spawn_batch_sender());
        tasks.push(self.spawn_buffer_flusher());
        tasks.push(self.spawn_health_reporter());

        info!("edge agent started with {} tasks", tasks.len());

        self.wait_for_shutdown_signal().await;
        self.shutdown(tasks).await;
        Ok(())
    }

    #[cfg(unix)]
    async fn wait_for_shutdown_signal(&self) {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                self.cancel.cancelled().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
            _ = sigterm.recv() => info!("SIGTERM received"),
            _ = self.cancel.cancelled() => {}
        }
    }

    #[cfg(not(unix))]
    async fn wait_for_shutdown_signal(&self) {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("interrupt received"),
            _ = self.cancel.cancelled() => {}
        }
    }

    async fn shutdown(&self, tasks: Vec<JoinHandle<()>>) {
        info!("stopping edge agent");
        self.cancel.cancel();

        if tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!("tasks did not finish inside the shutdown grace period");
        }

        // best-effort final flush; loss here reappears via the buffer path
        let final_flush = async {
            if let Some(batch) = self.aggregator.flush().await {
                let result = self.sender.send_batch(&batch).await;
                if !result.success {
                    warn!("final flush not delivered: {:?}", result.error);
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, final_flush).await.is_err() {
            warn!("final flush timed out");
        }

        self.sender.close().await;
        if let Some(buffer) = &self.buffer {
            if let Err(e) = buffer.close().await {
                warn!("buffer close failed: {e}");
            }
        }
        info!("edge agent stopped");
    }

    /// Generic collector loop: sample, convert, feed the aggregator, ship
    /// whatever batches come back ready.
    fn spawn_collector_loop<C>(
        &self,
        collector: C,
        interval_secs: u64,
        rules: Arc<ThresholdRules>,
    ) -> JoinHandle<()>
    where
        C: Collector + 'static,
    {
        let aggregator = self.aggregator.clone();
        let sender = Arc::clone(&self.sender);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            if !collector.available() {
                info!("{} source not available; collector disabled", collector.name());
                return;
            }
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let snapshot = collector.collect().await;
                for point in collector.metric_points(&snapshot) {
                    if let Some(batch) = aggregator.add_metric(point).await {
                        deliver(&sender, batch).await;
                    }
                }
                for alert in collector.check_thresholds(&snapshot, &rules) {
                    if let Some(batch) = aggregator.add_alert(alert).await {
                        deliver(&sender, batch).await;
                    }
                }
            }
        })
    }

    /// System loop is special-cased for the per-cycle status line.
    fn spawn_system_loop(&self, rules: Arc<ThresholdRules>) -> JoinHandle<()> {
        let collector = SystemCollector::new(self.config.agent_id.clone());
        let interval_secs = self.config.collectors.system.interval;
        let aggregator = self.aggregator.clone();
        let sender = Arc::clone(&self.sender);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let snapshot = collector.collect().await;
                if let Some(e) = &snapshot.error {
                    error!("system metrics collection error: {e}");
                    continue;
                }

                let alerts = collector.check_thresholds(&snapshot, &rules);
                info!(
                    "cycle: cpu {:.1}% | mem {:.1}% | disks {} | alerts {}",
                    snapshot.cpu.usage_percent,
                    snapshot.memory.usage_percent,
                    snapshot.disks.len(),
                    alerts.len()
                );

                for point in collector.metric_points(&snapshot) {
                    if let Some(batch) = aggregator.add_metric(point).await {
                        deliver(&sender, batch).await;
                    }
                }
                for alert in alerts {
                    if let Some(batch) = aggregator.add_alert(alert).await {
                        deliver(&sender, batch).await;
                    }
                }
            }
        })
    }

    fn spawn_log_loop(&self) -> JoinHandle<()> {
        let collector = LogCollector::new(&self.config.collectors.logs, self.config.agent_id.clone());
        let interval_secs = self.config.collectors.logs.interval;
        let max_lines = self.config.collectors.logs.max_lines_per_batch;
        let aggregator = self.aggregator.clone();
        let sender = Arc::clone(&self.sender);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let batch = collector.collect(max_lines).await;
                if batch.entries.is_empty() {
                    continue;
                }
                if let Some(ready) = aggregator.add_logs(batch.entries).await {
                    deliver(&sender, ready).await;
                }
            }
        })
    }

    /// Wakes every `batch_interval` and ships whatever accumulated.
    fn spawn_batch_sender(&self) -> JoinHandle<()> {
        let interval_secs = self.config.batching.batch_interval;
        let aggregator = self.aggregator.clone();
        let sender = Arc::clone(&self.sender);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Some(batch) = aggregator.flush().await {
                    deliver(&sender, batch).await;
                }
            }
        })
    }

    /// Retries buffered batches every five minutes when the central is up.
    fn spawn_buffer_flusher(&self) -> JoinHandle<()> {
        let Some(buffer) = self.buffer.clone() else {
            return tokio::spawn(async {});
        };
        let sender = Arc::clone(&self.sender);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(BUFFER_FLUSH_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // skip the immediate first tick

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match buffer.count().await {
                    Ok(0) => continue,
                    Ok(_) => match sender.flush_buffer().await {
                        Ok(0) => {}
                        Ok(sent) => info!("flushed {sent} buffered items"),
                        Err(e) => error!("buffer flush error: {e}"),
                    },
                    Err(e) => error!("buffer count error: {e}"),
                }
            }
        })
    }

    /// Emits `sidra_agent_health` and the buffer gauge every minute.
    fn spawn_health_reporter(&self) -> JoinHandle<()> {
        let host = self.config.agent_id.clone();
        let version = self.config.agent_version.clone();
        let aggregator = self.aggregator.clone();
        let buffer = self.buffer.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEALTH_REPORT_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let health = MetricPoint::new("sidra_agent_health", 1.0, unix_now())
                    .with_label("host", host.clone())
                    .with_label("version", version.clone())
                    .with_priority(Priority::Low);
                aggregator.add_metric(health).await;

                if let Some(buffer) = &buffer {
                    match buffer.count().await {
                        Ok(count) => {
                            gauge!("sidra_agent_buffer_items", count as f64);
                            let point =
                                MetricPoint::new("sidra_agent_buffer_items", count as f64, unix_now())
                                    .with_label("host", host.clone())
                                    .with_priority(Priority::Low);
                            aggregator.add_metric(point).await;
                        }
                        Err(e) => error!("health reporter buffer stats error: {e}"),
                    }
                }
            }
        })
    }
}

/// Ship a ready batch; failures are logged, the sender handles buffering.
async fn deliver(sender: &CentralSender, batch: Batch) {
    let result = sender.send_batch(&batch).await;
    if !result.success {
        warn!(
            buffered = result.buffered,
            "batch delivery failed: {}",
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
}
