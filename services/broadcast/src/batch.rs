//! The pending batch and its flush envelope
//!
//! Accepted messages accumulate here in arrival order until a size or time
//! trigger flushes them. A single-message flush delivers the message as-is;
//! a multi-message flush wraps the batch in one `batch_update` envelope to
//! cut per-message delivery overhead.

use chrono::Utc;
use serde_json::{json, Value};

/// Ordered accumulation of accepted messages awaiting a flush.
#[derive(Debug, Default)]
pub struct PendingBatch {
    messages: Vec<Value>,
}

impl PendingBatch {
    pub fn push(&mut self, message: Value) {
        self.messages.push(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Take the whole batch, leaving the pending state empty.
    pub fn take(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.messages)
    }
}

/// Wrap a multi-message batch into one delivery envelope.
pub fn batch_envelope(messages: Vec<Value>) -> Value {
    json!({
        "type": "batch_update",
        "count": messages.len(),
        "timestamp": Utc::now().to_rfc3339(),
        "messages": messages,
    })
}
