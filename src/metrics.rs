//! Hot-path counters, queryable for introspection. Mirrors the shape of a
//! router metrics struct: plain atomics updated in place, no locking.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct HubMetrics {
    pub markers_active: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_total: AtomicU64,
    pub bus_messages_consumed: AtomicU64,
    pub bus_messages_malformed: AtomicU64,
    pub batches_sent: AtomicU64,
    pub slow_consumer_drops: AtomicU64,
    pub hydrate_attempts: AtomicU64,
}

impl HubMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> HubMetricsSnapshot {
        HubMetricsSnapshot {
            markers_active: self.markers_active.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_total: self.connections_total.load(Ordering::Relaxed),
            bus_messages_consumed: self.bus_messages_consumed.load(Ordering::Relaxed),
            bus_messages_malformed: self.bus_messages_malformed.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            slow_consumer_drops: self.slow_consumer_drops.load(Ordering::Relaxed),
            hydrate_attempts: self.hydrate_attempts.load(Ordering::Relaxed),
        }
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HubMetricsSnapshot {
    pub markers_active: u64,
    pub connections_active: u64,
    pub connections_total: u64,
    pub bus_messages_consumed: u64,
    pub bus_messages_malformed: u64,
    pub batches_sent: u64,
    pub slow_consumer_drops: u64,
    pub hydrate_attempts: u64,
}
