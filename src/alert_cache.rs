//! Bounded in-memory ring of recent alerts.
//!
//! Central-side working set for the query endpoints and any LLM consumer of
//! `/api/v1/alerts/recent`. Holds the most recent 1,000 alerts; newest wins
//! when full. Not persisted - durable alert history lives in the event
//! store, and losing this cache on restart is acceptable.

use std::collections::VecDeque;

use parking_lot::RwLock;

use crate::wire::{unix_now, Alert, Severity};

pub const DEFAULT_CAPACITY: usize = 1000;

/// An alert plus the time the central ingested it.
#[derive(Debug, Clone)]
pub struct AlertCacheEntry {
    pub alert: Alert,
    pub received_at: f64,
}

/// Lock-guarded ring buffer; ingest handlers write, query handlers read.
pub struct AlertCache {
    capacity: usize,
    entries: RwLock<VecDeque<AlertCacheEntry>>,
}

impl AlertCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn add(&self, alert: Alert) {
        let mut entries = self.entries.write();
        entries.push_back(AlertCacheEntry {
            alert,
            received_at: unix_now(),
        });
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// The `n` most recent alerts, oldest first.
    pub fn recent(&self, n: usize) -> Vec<Alert> {
        let entries = self.entries.read();
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).map(|e| e.alert.clone()).collect()
    }

    /// The `n` most recent alerts of one severity, oldest first.
    pub fn by_severity(&self, severity: Severity, n: usize) -> Vec<Alert> {
        let entries = self.entries.read();
        let matching: Vec<&AlertCacheEntry> = entries
            .iter()
            .filter(|e| e.alert.severity == severity)
            .collect();
        let skip = matching.len().saturating_sub(n);
        matching
            .into_iter()
            .skip(skip)
            .map(|e| e.alert.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for AlertCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
