//! # Sidra Telemetry Pipeline
//!
//! A two-tier infrastructure telemetry pipeline for private server fleets.
//! Edge Agents run on every monitored host, sampling system, GPU, container,
//! log, and service data; a Central Brain ingests their batches and fans them
//! out to a time-series store and an event store.
//!
//! ## 🏗️ Architecture Overview
//!
//! The pipeline is two independent processes connected by one HTTP boundary:
//!
//! ### Edge Agent (`sidra-edge`)
//! - **Collectors**: five independent samplers (system, GPU, containers,
//!   logs, services), each on its own period. One collector failing never
//!   stops the others.
//! - **Aggregator**: an actor-owned, priority-classified queue that turns
//!   the metric/alert/log stream into bounded, deduplicated batches.
//! - **Durable Buffer**: a crash-safe on-disk priority queue holding batches
//!   the sender could not deliver.
//! - **Sender**: HTTP client with bounded retries, exponential backoff,
//!   rate-limit honoring, and periodic buffer flushing.
//! - **Supervisor**: owns every long-running task, the cancellation token,
//!   signal handling, and agent health self-metrics.
//!
//! ### Central Brain (`sidra-central`)
//! - **Ingest endpoints**: accept metric / alert / log / mixed batches from
//!   any edge.
//! - **Fan-out writers**: Prometheus-text import for the TSDB, JSON streams
//!   for the event store.
//! - **Alert cache**: bounded in-memory ring of the most recent alerts.
//! - **Query surface**: PromQL pass-through plus a fixed summary.
//!
//! ## ⚡ Delivery Semantics
//!
//! - At-least-once with idempotent sinks; exactly-once is explicitly not the
//!   contract.
//! - Critical items (CRITICAL metrics, critical/high alerts, critical/error
//!   logs) bypass batching and are attempted for immediate delivery; on
//!   failure they are buffered at the highest priority.
//! - A buffered item is removed only after a downstream 2xx.
//! - Ordering between batches is not guaranteed; correctness downstream
//!   depends only on the explicit sample timestamps.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sidra_telemetry::config::EdgeConfig;
//! use sidra_telemetry::edge_agent::EdgeAgent;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EdgeConfig::load(None)?;
//!     let agent = EdgeAgent::new(config)?;
//!     agent.run().await?;
//!     Ok(())
//! }
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Agent version reported in health metrics and the HTTP `User-Agent`.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

// Ambient modules - logging setup and configuration for both processes
pub mod config; // Edge and central configuration, YAML file + SIDRA_* env overrides
pub mod logging; // tracing-subscriber initialization (console + optional rolling file)

// Edge pipeline modules
pub mod batching; // Priority-aware aggregator: dedup, cooldowns, bounded batches
pub mod central_sender; // HTTP sender with retry decisions and buffer fallback
pub mod collectors; // The five samplers and their shared contract
pub mod edge_agent; // Supervisor: task ownership, shutdown, health reporting
pub mod local_buffer; // Crash-safe on-disk priority queue for undelivered batches

// Central brain modules
pub mod alert_cache; // Bounded ring of recent alerts
pub mod ingest_api; // axum ingest/query surface
pub mod store_writers; // TSDB and event-store wire formats

// Shared wire types
pub mod wire; // MetricPoint, Alert, LogEntry, Batch, ingest payloads

pub use wire::{Alert, Batch, LogEntry, LogLevel, MetricPoint, Priority, Severity};

/// Comprehensive error type covering both pipeline tiers
///
/// Each variant maps to one error class of the taxonomy: collector-local
/// failures stay inside their collector loop, sender errors distinguish
/// transient from terminal, buffer and downstream failures carry enough
/// context to be logged and acted on. No error from any subsystem reaches
/// `main` on the edge; the supervisor logs and continues.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum TelemetryError {
    /// Single-source sampling failure - logged, the collector continues
    #[error("Collector error: {0}")]
    Collector(String),

    /// Aggregator invariant violation - current batch is dropped to recover
    #[error("Aggregation error: {0}")]
    Aggregation(String),

    /// Durable buffer I/O or format failure
    #[error("Buffer error: {0}")]
    Buffer(String),

    /// Transport-level send failure (connection refused, DNS, reset)
    #[error("Network error: {0}")]
    Network(String),

    /// Operation exceeded its deadline - always retryable
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// HTTP-level failure with the status the peer returned
    #[error("HTTP error: status {status}: {detail}")]
    Http { status: u16, detail: String },

    /// Invalid or unloadable configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Durable storage corruption or unexpected on-disk state
    #[error("Storage error: {0}")]
    Storage(String),

    /// A downstream sink (TSDB or event store) rejected a write
    #[error("Downstream write error: {0}")]
    Downstream(String),

    /// Unexpected conditions that fit no other class
    #[error("System error: {0}")]
    SystemError(String),
}

impl From<std::io::Error> for TelemetryError {
    fn from(e: std::io::Error) -> Self {
        TelemetryError::Buffer(e.to_string())
    }
}

/// Result type for all pipeline operations
pub type Result<T> = std::result::Result<T, TelemetryError>;
