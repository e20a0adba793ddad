//! Throttle configuration
//!
//! Supplied at construction, immutable thereafter. `batch_window` and
//! `max_messages_per_second` jointly bound worst-case end-to-end latency
//! and outbound volume.

use std::time::Duration;

use thiserror::Error;

/// Dedup-map size above which stale entries are evicted.
pub const DEFAULT_DEDUP_KEY_LIMIT: usize = 1000;

/// Age past which a tracked dedup key counts as stale.
pub const DEFAULT_DEDUP_STALE_AFTER: Duration = Duration::from_secs(60);

/// Errors surfaced by the broadcast throttler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ThrottleError {
    #[error("Invalid throttle configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Throttler is stopped")]
    Stopped,
}

/// Configuration for one `BroadcastThrottler` instance.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Acceptance ceiling per dedup key.
    pub max_messages_per_second: u32,
    /// Maximum time a pending batch may wait before being flushed.
    pub batch_window: Duration,
    /// Ordered message fields defining a dedup identity. Fields absent from
    /// a message are skipped; if none match, the whole message is the key.
    pub debounce_keys: Vec<String>,
    /// Hard cap forcing an early flush.
    pub max_batch_size: usize,
    /// Whether to rate-limit repeated updates sharing a dedup key.
    pub drop_duplicates: bool,
    /// Tracked-key count above which stale entries are evicted.
    pub dedup_key_limit: usize,
    /// Staleness window used during eviction.
    pub dedup_stale_after: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_messages_per_second: 10,
            batch_window: Duration::from_millis(100),
            debounce_keys: vec!["type".to_string(), "symbol".to_string()],
            max_batch_size: 50,
            drop_duplicates: true,
            dedup_key_limit: DEFAULT_DEDUP_KEY_LIMIT,
            dedup_stale_after: DEFAULT_DEDUP_STALE_AFTER,
        }
    }
}

impl ThrottleConfig {
    pub fn validate(&self) -> Result<(), ThrottleError> {
        if self.max_messages_per_second == 0 {
            return Err(invalid("max_messages_per_second must be positive"));
        }
        if self.batch_window.is_zero() {
            return Err(invalid("batch_window must be positive"));
        }
        if self.max_batch_size == 0 {
            return Err(invalid("max_batch_size must be positive"));
        }
        if self.dedup_key_limit == 0 {
            return Err(invalid("dedup_key_limit must be positive"));
        }
        Ok(())
    }

    /// Minimum spacing between two accepted messages under one dedup key.
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.max_messages_per_second))
    }
}

fn invalid(reason: &str) -> ThrottleError {
    ThrottleError::InvalidConfig {
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ThrottleConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_values_are_rejected() {
        let mut config = ThrottleConfig::default();
        config.max_messages_per_second = 0;
        assert!(config.validate().is_err());

        let mut config = ThrottleConfig::default();
        config.batch_window = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = ThrottleConfig::default();
        config.max_batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn min_interval_matches_rate() {
        let config = ThrottleConfig {
            max_messages_per_second: 5,
            ..ThrottleConfig::default()
        };
        assert_eq!(config.min_interval(), Duration::from_millis(200));
    }
}
