//! Observability for the broadcast throttler
//!
//! Atomically tracked counters with a synchronous snapshot for external
//! polling.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct ThrottleMetrics {
    pub sent_immediate: AtomicU64,
    pub accepted: AtomicU64,
    pub dropped: AtomicU64,
    pub batches_flushed: AtomicU64,
    pub messages_flushed: AtomicU64,
    pub delivery_failures: AtomicU64,
}

impl ThrottleMetrics {
    pub fn snapshot(
        &self,
        queue_depth: u64,
        pending_batch_len: u64,
        tracked_keys: u64,
    ) -> ThrottleStats {
        ThrottleStats {
            sent_immediate: self.sent_immediate.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            messages_flushed: self.messages_flushed.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            queue_depth,
            pending_batch_len,
            tracked_keys,
        }
    }
}

/// Point-in-time view of throttler counters and queue state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThrottleStats {
    /// Priority messages delivered immediately, bypassing all limits.
    pub sent_immediate: u64,
    /// Non-priority messages accepted for batching.
    pub accepted: u64,
    /// Messages dropped by per-key rate limiting.
    pub dropped: u64,
    pub batches_flushed: u64,
    pub messages_flushed: u64,
    pub delivery_failures: u64,
    /// Messages waiting in the intake channel.
    pub queue_depth: u64,
    /// Messages accumulated in the pending batch.
    pub pending_batch_len: u64,
    /// Dedup keys currently tracked.
    pub tracked_keys: u64,
}
