//! Message queues with priority lanes and scoped acknowledgment
//!
//! A `MessageQueue` is FIFO within a priority lane; high-priority messages
//! are delivered ahead of normal ones already waiting. Consuming yields a
//! `Delivery` guard: `ack()` finalizes the message, dropping the guard
//! without acking requeues it at the front of its lane with the
//! `redelivered` flag set. The guard releases on every exit path, including
//! a panicking callback.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use events::taxonomy::PublishPriority;
use tokio::sync::Notify;
use tracing::debug;

/// A serialized message as it exists inside the broker.
#[derive(Debug, Clone)]
pub struct WireMessage {
    /// Topic routing key, equal to the event type's wire value.
    pub routing_key: String,
    /// Serialized event envelope.
    pub payload: Vec<u8>,
    /// Queue lane this message is delivered from.
    pub priority: PublishPriority,
    /// Survives as long as the broker process does.
    pub persistent: bool,
    /// Set when the message re-enters the queue after an unacked delivery.
    pub redelivered: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    high: VecDeque<WireMessage>,
    normal: VecDeque<WireMessage>,
    closed: bool,
}

impl QueueState {
    fn lane(&mut self, priority: PublishPriority) -> &mut VecDeque<WireMessage> {
        match priority {
            PublishPriority::High => &mut self.high,
            PublishPriority::Normal => &mut self.normal,
        }
    }
}

/// A single broker queue. One consumer per exclusive queue.
#[derive(Debug)]
pub struct MessageQueue {
    name: String,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl MessageQueue {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue at the back of the message's priority lane.
    /// Messages arriving after close are dropped.
    pub fn push(&self, msg: WireMessage) {
        {
            let mut state = self.lock();
            if state.closed {
                debug!(queue = %self.name, "message arrived after queue close, dropped");
                return;
            }
            let priority = msg.priority;
            state.lane(priority).push_back(msg);
        }
        self.notify.notify_one();
    }

    /// Requeue at the front of the message's priority lane (broker
    /// redelivery after an unacked delivery).
    fn requeue_front(&self, mut msg: WireMessage) {
        msg.redelivered = true;
        {
            let mut state = self.lock();
            if state.closed {
                debug!(queue = %self.name, "redelivery after queue close, dropped");
                return;
            }
            let priority = msg.priority;
            state.lane(priority).push_front(msg);
        }
        self.notify.notify_one();
    }

    /// Await the next message. Returns `None` once the queue is closed and
    /// drained of nothing further to deliver.
    pub async fn recv(self: &Arc<Self>) -> Option<Delivery> {
        loop {
            {
                let mut state = self.lock();
                if let Some(msg) = state.high.pop_front().or_else(|| state.normal.pop_front()) {
                    return Some(Delivery {
                        queue: Arc::clone(self),
                        message: Some(msg),
                    });
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Close the queue. Waiting consumers wake with `None`; undelivered
    /// messages are discarded with the queue.
    pub fn close(&self) {
        {
            let mut state = self.lock();
            state.closed = true;
        }
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Messages currently waiting across both lanes.
    pub fn depth(&self) -> usize {
        let state = self.lock();
        state.high.len() + state.normal.len()
    }
}

/// Scoped acknowledgment for one delivered message.
///
/// Holds the message until `ack()`; dropping the guard on any other exit
/// path requeues the message for redelivery.
#[derive(Debug)]
pub struct Delivery {
    queue: Arc<MessageQueue>,
    message: Option<WireMessage>,
}

impl Delivery {
    pub fn payload(&self) -> &[u8] {
        self.message
            .as_ref()
            .map(|m| m.payload.as_slice())
            .unwrap_or_default()
    }

    pub fn routing_key(&self) -> &str {
        self.message
            .as_ref()
            .map(|m| m.routing_key.as_str())
            .unwrap_or_default()
    }

    pub fn redelivered(&self) -> bool {
        self.message.as_ref().is_some_and(|m| m.redelivered)
    }

    /// Finalize the message; it will not be redelivered.
    pub fn ack(mut self) {
        self.message = None;
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(msg) = self.message.take() {
            self.queue.requeue_front(msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(key: &str, body: &str, priority: PublishPriority) -> WireMessage {
        WireMessage {
            routing_key: key.to_string(),
            payload: body.as_bytes().to_vec(),
            priority,
            persistent: true,
            redelivered: false,
        }
    }

    #[tokio::test]
    async fn fifo_within_a_lane() {
        let queue = MessageQueue::new("q");
        queue.push(msg("k", "a", PublishPriority::Normal));
        queue.push(msg("k", "b", PublishPriority::Normal));
        let first = queue.recv().await.unwrap();
        assert_eq!(first.payload(), b"a");
        first.ack();
        let second = queue.recv().await.unwrap();
        assert_eq!(second.payload(), b"b");
        second.ack();
    }

    #[tokio::test]
    async fn high_priority_overtakes_waiting_normal() {
        let queue = MessageQueue::new("q");
        queue.push(msg("k", "normal", PublishPriority::Normal));
        queue.push(msg("k", "urgent", PublishPriority::High));
        let first = queue.recv().await.unwrap();
        assert_eq!(first.payload(), b"urgent");
        first.ack();
        let second = queue.recv().await.unwrap();
        assert_eq!(second.payload(), b"normal");
        second.ack();
    }

    #[tokio::test]
    async fn dropped_guard_requeues_with_redelivered_flag() {
        let queue = MessageQueue::new("q");
        queue.push(msg("k", "a", PublishPriority::Normal));
        {
            let delivery = queue.recv().await.unwrap();
            assert!(!delivery.redelivered());
            // dropped without ack
        }
        let retry = queue.recv().await.unwrap();
        assert_eq!(retry.payload(), b"a");
        assert!(retry.redelivered());
        retry.ack();
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn close_wakes_waiting_consumer() {
        let queue = MessageQueue::new("q");
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.recv().await.is_none() })
        };
        tokio::task::yield_now().await;
        queue.close();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn push_after_close_is_dropped() {
        let queue = MessageQueue::new("q");
        queue.close();
        queue.push(msg("k", "late", PublishPriority::Normal));
        assert_eq!(queue.depth(), 0);
    }
}
