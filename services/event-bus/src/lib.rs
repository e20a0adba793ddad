//! Event Bus service
//!
//! Durable, topic-routed, at-least-once pub/sub decoupling producers and
//! consumers across the platform's services.
//!
//! # Modules
//! - `queue`: FIFO message queues with a priority lane and scoped acks
//! - `broker`: the in-process durable topic broker (exchange + routing)
//! - `bus`: the `EventBus` facade (connect, publish, subscribe, teardown)
//! - `metrics`: counters exposed as synchronous snapshots
//!
//! Flow: a producer builds an `Event` and calls `publish()`; each active
//! subscription owns an exclusive queue bound to the system exchange and a
//! consumer task that deserializes and hands events to its callback.

pub mod broker;
pub mod bus;
pub mod metrics;
pub mod queue;

pub use broker::{Broker, BrokerConfig, BrokerError, Connection};
pub use bus::{handler_fn, BusConfig, EventBus, EventHandler, HealthStatus, SubscriptionHandle};
pub use metrics::BusMetricsSnapshot;
pub use queue::{Delivery, MessageQueue, WireMessage};
