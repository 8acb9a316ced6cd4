//! # Collectors - Independent Samplers
//!
//! Five samplers feed the edge pipeline, each on its own period: system,
//! GPU, containers, logs, and services. They share one contract: report
//! whether the source exists on this host, produce a typed snapshot,
//! convert a snapshot to wire-format metric points, and check a snapshot
//! against the threshold rules. Collectors are independent - one failing
//! never stops the others, and a failure is embedded in the snapshot
//! rather than propagated.
//!
//! Anything that blocks (subprocess invocations, file reads, sysinfo
//! refreshes) runs off the scheduling hot path, either through
//! `tokio::process` or on the blocking worker pool.

pub mod docker;
pub mod gpu;
pub mod logs;
pub mod services;
pub mod system;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::PriorityRules;
use crate::wire::{Alert, MetricPoint, Severity};
use crate::{Result, TelemetryError};

/// Uniform sampling contract.
///
/// The supervisor's collector loops are generic over this trait; the log
/// collector has its own entry point because it produces log entries
/// rather than metric points.
#[async_trait]
pub trait Collector: Send + Sync {
    type Snapshot: Send + 'static;

    fn name(&self) -> &'static str;

    /// Whether this source exists on the host (e.g. a GPU driver or a
    /// container daemon socket). Unavailable collectors are skipped.
    fn available(&self) -> bool;

    /// Take one sample. Failures are embedded in the snapshot.
    async fn collect(&self) -> Self::Snapshot;

    /// Wire-format metrics for a snapshot.
    fn metric_points(&self, snapshot: &Self::Snapshot) -> Vec<MetricPoint>;

    /// Threshold alerts for a snapshot.
    fn check_thresholds(&self, snapshot: &Self::Snapshot, rules: &ThresholdRules) -> Vec<Alert>;
}

/// Resolved threshold rule set.
///
/// The critical and high tiers come from configuration; the warning tier
/// is part of the built-in contract.
#[derive(Debug, Clone)]
pub struct ThresholdRules {
    critical: HashMap<String, f64>,
    high: HashMap<String, f64>,
    warning: HashMap<String, f64>,
}

impl ThresholdRules {
    pub fn from_config(rules: &PriorityRules) -> Self {
        let warning = HashMap::from([
            ("cpu_usage".to_string(), 70.0),
            ("memory_usage".to_string(), 80.0),
            ("disk_usage".to_string(), 80.0),
        ]);
        Self {
            critical: rules.critical_thresholds.clone(),
            high: rules.high_thresholds.clone(),
            warning,
        }
    }

    pub fn critical_for(&self, metric: &str, default: f64) -> f64 {
        self.critical.get(metric).copied().unwrap_or(default)
    }

    pub fn high_for(&self, metric: &str, default: f64) -> f64 {
        self.high.get(metric).copied().unwrap_or(default)
    }

    pub fn warning_for(&self, metric: &str, default: f64) -> f64 {
        self.warning.get(metric).copied().unwrap_or(default)
    }

    /// Classify a usage-style value into a severity tier, returning the
    /// threshold that was crossed.
    pub fn classify(&self, metric: &str, value: f64) -> Option<(Severity, f64)> {
        let critical = self.critical_for(metric, 95.0);
        let high = self.high_for(metric, 85.0);
        let warning = self.warning_for(metric, 70.0);
        if value >= critical {
            Some((Severity::Critical, critical))
        } else if value >= high {
            Some((Severity::High, high))
        } else if value >= warning {
            Some((Severity::Warning, warning))
        } else {
            None
        }
    }
}

impl Default for ThresholdRules {
    fn default() -> Self {
        Self::from_config(&PriorityRules::default())
    }
}

/// Run a subprocess with a deadline, returning trimmed stdout.
pub(crate) async fn run_command(
    program: &str,
    args: &[&str],
    timeout_secs: u64,
) -> Result<String> {
    let output = tokio::time::timeout(
        Duration::from_secs(timeout_secs),
        tokio::process::Command::new(program).args(args).output(),
    )
    .await
    .map_err(|_| TelemetryError::Timeout(format!("{program} timed out after {timeout_secs}s")))?
    .map_err(|e| TelemetryError::Collector(format!("{program}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(TelemetryError::Collector(format!(
            "{program} exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_uses_the_three_tiers() {
        let rules = ThresholdRules::default();
        assert_eq!(rules.classify("cpu_usage", 50.0), None);
        assert_eq!(rules.classify("cpu_usage", 72.0), Some((Severity::Warning, 70.0)));
        assert_eq!(rules.classify("cpu_usage", 85.0), Some((Severity::High, 85.0)));
        assert_eq!(rules.classify("cpu_usage", 97.0), Some((Severity::Critical, 95.0)));
    }

    #[test]
    fn disk_warning_tier_starts_at_eighty() {
        let rules = ThresholdRules::default();
        assert_eq!(rules.classify("disk_usage", 79.0), None);
        assert_eq!(rules.classify("disk_usage", 81.0), Some((Severity::Warning, 80.0)));
        assert_eq!(rules.classify("disk_usage", 90.0), Some((Severity::High, 90.0)));
    }

    #[test]
    fn config_overrides_take_precedence() {
        let mut config = PriorityRules::default();
        config.critical_thresholds.insert("cpu_usage".to_string(), 99.0);
        let rules = ThresholdRules::from_config(&config);
        assert_eq!(rules.classify("cpu_usage", 97.0), Some((Severity::High, 85.0)));
        assert_eq!(rules.classify("cpu_usage", 99.5), Some((Severity::Critical, 99.0)));
    }
}
