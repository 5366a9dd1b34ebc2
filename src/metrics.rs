use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of [`SessionMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub links_created: u64,
    pub links_connected: u64,
    pub links_failed: u64,
    pub links_closed: u64,
    pub protocol_errors: u64,
    pub signals_relayed: u64,
}

impl MetricsSnapshot {
    /// Links created but not yet closed or failed.
    #[must_use]
    pub fn links_open(&self) -> u64 {
        self.links_created
            .saturating_sub(self.links_failed + self.links_closed)
    }
}

/// Session counters, written by the session actor and readable from any handle.
#[derive(Debug, Default)]
pub struct SessionMetrics {
    links_created: AtomicU64,
    links_connected: AtomicU64,
    links_failed: AtomicU64,
    links_closed: AtomicU64,
    protocol_errors: AtomicU64,
    signals_relayed: AtomicU64,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_link_created(&self) {
        self.links_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_link_connected(&self) {
        self.links_connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_link_failed(&self) {
        self.links_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_link_closed(&self) {
        self.links_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_signal_relayed(&self) {
        self.signals_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            links_created: self.links_created.load(Ordering::Relaxed),
            links_connected: self.links_connected.load(Ordering::Relaxed),
            links_failed: self.links_failed.load(Ordering::Relaxed),
            links_closed: self.links_closed.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            signals_relayed: self.signals_relayed.load(Ordering::Relaxed),
        }
    }
}
