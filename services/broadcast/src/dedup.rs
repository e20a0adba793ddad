//! Per-key rate limiting with bounded bookkeeping
//!
//! A dedup key treats rapid repeated updates about the same underlying fact
//! as duplicates. Bookkeeping is bounded: once the tracked-key count exceeds
//! its limit, entries older than the staleness window are evicted.
//!
//! Uses `tokio::time::Instant` so paused-clock tests are deterministic.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

/// Derive the dedup key for a message: ordered `field:value` pairs for the
/// configured fields present in the message, or the stringified message if
/// none match.
pub fn dedup_key(message: &Value, debounce_keys: &[String]) -> String {
    let mut parts = Vec::new();
    for field in debounce_keys {
        if let Some(value) = message.get(field) {
            parts.push(format!("{field}:{value}"));
        }
    }
    if parts.is_empty() {
        message.to_string()
    } else {
        parts.join("|")
    }
}

/// Tracks the last accepted instant per dedup key.
#[derive(Debug)]
pub struct DedupTracker {
    last_accepted: HashMap<String, Instant>,
    min_interval: Duration,
    key_limit: usize,
    stale_after: Duration,
}

impl DedupTracker {
    pub fn new(min_interval: Duration, key_limit: usize, stale_after: Duration) -> Self {
        Self {
            last_accepted: HashMap::new(),
            min_interval,
            key_limit,
            stale_after,
        }
    }

    /// Returns whether a message under `key` may be accepted now, recording
    /// the acceptance if so.
    pub fn accept(&mut self, key: &str) -> bool {
        let now = Instant::now();
        if let Some(last) = self.last_accepted.get(key) {
            if now.duration_since(*last) < self.min_interval {
                return false;
            }
        }
        self.last_accepted.insert(key.to_string(), now);
        if self.last_accepted.len() > self.key_limit {
            self.evict_stale(now);
        }
        true
    }

    fn evict_stale(&mut self, now: Instant) {
        let before = self.last_accepted.len();
        let stale_after = self.stale_after;
        self.last_accepted
            .retain(|_, last| now.duration_since(*last) <= stale_after);
        debug!(
            evicted = before - self.last_accepted.len(),
            remaining = self.last_accepted.len(),
            "dedup key eviction"
        );
    }

    pub fn tracked_keys(&self) -> usize {
        self.last_accepted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_uses_configured_fields_in_order() {
        let keys = vec!["type".to_string(), "symbol".to_string()];
        let msg = json!({"symbol": "BTC/USDT", "type": "price", "px": 64000});
        assert_eq!(dedup_key(&msg, &keys), "type:\"price\"|symbol:\"BTC/USDT\"");
    }

    #[test]
    fn key_skips_absent_fields() {
        let keys = vec!["type".to_string(), "symbol".to_string()];
        let msg = json!({"type": "heartbeat"});
        assert_eq!(dedup_key(&msg, &keys), "type:\"heartbeat\"");
    }

    #[test]
    fn key_falls_back_to_whole_message() {
        let keys = vec!["symbol".to_string()];
        let msg = json!({"other": 1});
        assert_eq!(dedup_key(&msg, &keys), msg.to_string());
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_within_min_interval() {
        let mut tracker =
            DedupTracker::new(Duration::from_millis(200), 1000, Duration::from_secs(60));
        assert!(tracker.accept("k"));
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(!tracker.accept("k"));
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(tracker.accept("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn independent_keys_do_not_interfere() {
        let mut tracker =
            DedupTracker::new(Duration::from_millis(200), 1000, Duration::from_secs(60));
        assert!(tracker.accept("a"));
        assert!(tracker.accept("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn evicts_stale_keys_past_the_limit() {
        let mut tracker = DedupTracker::new(Duration::from_millis(10), 4, Duration::from_secs(1));
        for key in ["a", "b", "c", "d"] {
            assert!(tracker.accept(key));
        }
        // All four go stale, then a fifth key trips the limit.
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(tracker.accept("e"));
        assert_eq!(tracker.tracked_keys(), 1);
    }
}
