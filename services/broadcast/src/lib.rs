//! Broadcast throttler service
//!
//! Protects a downstream delivery path (typically a WebSocket fan-out
//! layer) from a high-frequency internal update stream. Non-priority
//! messages are rate-limited per dedup key and batched under a time and
//! size bound; priority messages bypass every limit and are delivered
//! immediately.
//!
//! # Modules
//! - `config`: `ThrottleConfig` and validation
//! - `dedup`: per-key rate limiting with bounded bookkeeping
//! - `batch`: the pending batch and the `batch_update` envelope
//! - `throttler`: the `BroadcastThrottler` and its background tasks
//! - `metrics`: counters exposed as synchronous snapshots

pub mod batch;
pub mod config;
pub mod dedup;
pub mod metrics;
pub mod throttler;

pub use batch::{batch_envelope, PendingBatch};
pub use config::{ThrottleConfig, ThrottleError};
pub use dedup::DedupTracker;
pub use metrics::ThrottleStats;
pub use throttler::{sink_fn, BroadcastThrottler, DeliverySink, SinkError};
