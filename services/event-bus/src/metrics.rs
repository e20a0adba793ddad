//! Observability for the Event Bus
//!
//! Counters tracked with atomics and exposed as a synchronous snapshot for
//! external polling. No push-metrics interface.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Core counters for one bus instance.
#[derive(Debug, Default)]
pub struct BusMetrics {
    pub published: AtomicU64,
    pub publish_failures: AtomicU64,
    pub delivered: AtomicU64,
    pub handler_errors: AtomicU64,
    pub deserialization_failures: AtomicU64,
}

impl BusMetrics {
    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deserialization_failure(&self) {
        self.deserialization_failures.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of the bus counters, queue depth included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BusMetricsSnapshot {
    pub published: u64,
    pub publish_failures: u64,
    pub delivered: u64,
    pub handler_errors: u64,
    pub deserialization_failures: u64,
    /// Messages waiting across this instance's subscription queues.
    pub queue_depth: u64,
    /// Subscriptions whose consumer task is still running.
    pub active_subscriptions: u64,
}

impl BusMetrics {
    pub fn snapshot(&self, queue_depth: u64, active_subscriptions: u64) -> BusMetricsSnapshot {
        BusMetricsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            deserialization_failures: self.deserialization_failures.load(Ordering::Relaxed),
            queue_depth,
            active_subscriptions,
        }
    }
}
