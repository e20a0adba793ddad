//! The EventBus facade
//!
//! One bus instance per service process: connect once at startup, publish
//! and subscribe during the process lifetime, disconnect at teardown. The
//! instance exclusively owns its broker connection; consumer tasks receive
//! only a queue handle and a callback.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use events::envelope::Event;
use events::errors::BusError;
use events::taxonomy::EventType;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, BrokerError, Connection};
use crate::metrics::{BusMetrics, BusMetricsSnapshot};
use crate::queue::{Delivery, MessageQueue, WireMessage};

/// Errors a consumer callback may return; logged, never retried.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Consumer callback registered with `subscribe`.
///
/// Must not block indefinitely; no internal timeout is imposed. A returned
/// error is logged and delivery of subsequent messages continues.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event) -> Result<(), HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, event: Event) -> Result<(), HandlerError> {
        (self.0)(event).await
    }
}

/// Wrap an async closure as an `EventHandler`.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Bus configuration, fixed at construction.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Name of the system-wide durable topic exchange.
    pub exchange: String,
    /// Publish deadline applied when the caller does not pass one.
    pub default_publish_timeout: Duration,
    /// When set, generated queue names become `{prefix}.{routing_key}`,
    /// stable across restarts; otherwise a fresh UUID-suffixed name is
    /// generated per subscription.
    pub queue_prefix: Option<String>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            exchange: "platform.events".to_string(),
            default_publish_timeout: Duration::from_secs(5),
            queue_prefix: None,
        }
    }
}

/// Result of `health_check`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Handle to one subscription's consumer task.
#[derive(Debug)]
pub struct SubscriptionHandle {
    event_type: EventType,
    queue_name: String,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Cancel the consumer task. Cancellation mid-delivery leaves the
    /// in-flight message unacked, so the broker requeues it.
    pub fn cancel(&self) {
        self.task.abort();
    }

    /// Whether the consumer task has exited (completed, errored or
    /// cancelled). An exited task is never restarted by the bus.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

struct OwnedSubscription {
    queue_name: String,
    queue: Arc<MessageQueue>,
    abort: AbortHandle,
}

/// Inter-service event bus over the durable topic broker.
pub struct EventBus {
    broker: Broker,
    config: BusConfig,
    source: String,
    connection: Option<Connection>,
    subscriptions: Vec<OwnedSubscription>,
    metrics: Arc<BusMetrics>,
}

impl EventBus {
    /// Build a bus for `source` (the producer identity this service stamps
    /// on events). Construct once at process start; pass by handle.
    pub fn new(broker: Broker, config: BusConfig, source: impl Into<String>) -> Self {
        Self {
            broker,
            config,
            source: source.into(),
            connection: None,
            subscriptions: Vec::new(),
            metrics: Arc::new(BusMetrics::default()),
        }
    }

    /// Producer identity stamped on events built via [`EventBus::event`].
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Convenience constructor for an event originating from this service.
    pub fn event(&self, event_type: EventType, data: serde_json::Value) -> Event {
        Event::new(event_type, data, self.source.clone())
    }

    /// Open the broker connection and declare the system topic exchange.
    ///
    /// Single-use per bus instance: a second call before `disconnect` is a
    /// caller error. Fails loudly if the broker is unreachable; retry policy
    /// beyond that belongs to the caller.
    pub async fn connect(&mut self) -> Result<(), BusError> {
        if self.connection.is_some() {
            return Err(BusError::AlreadyConnected);
        }
        let connection = self.broker.connect().await.map_err(map_broker_error)?;
        connection
            .declare_exchange(&self.config.exchange)
            .await
            .map_err(map_broker_error)?;
        info!(exchange = %self.config.exchange, source = %self.source, "event bus connected");
        self.connection = Some(connection);
        Ok(())
    }

    /// Publish an event under a deadline.
    ///
    /// The event is serialized here; priority derives statically from its
    /// type and the message is marked persistent. Exceeding the deadline
    /// fails with `PublishTimeout`, distinct from `NotConnected`. No retry
    /// is attempted.
    pub async fn publish(&self, event: &Event, timeout: Option<Duration>) -> Result<(), BusError> {
        let connection = self.connection.as_ref().ok_or(BusError::NotConnected)?;
        let payload = event.to_bytes()?;
        let message = WireMessage {
            routing_key: event.routing_key().to_string(),
            payload,
            priority: event.priority(),
            persistent: true,
            redelivered: false,
        };
        let deadline = timeout.unwrap_or(self.config.default_publish_timeout);
        match tokio::time::timeout(deadline, connection.publish(&self.config.exchange, message))
            .await
        {
            Err(_) => {
                self.metrics.record_publish_failure();
                Err(BusError::PublishTimeout {
                    routing_key: event.routing_key().to_string(),
                    timeout_ms: deadline.as_millis() as u64,
                })
            }
            Ok(Err(err)) => {
                self.metrics.record_publish_failure();
                Err(map_broker_error(err))
            }
            Ok(Ok(routed)) => {
                self.metrics.record_published();
                debug!(
                    event_id = %event.id,
                    routing_key = event.routing_key(),
                    priority = event.priority().as_wire(),
                    routed,
                    "event published"
                );
                Ok(())
            }
        }
    }

    /// Subscribe a callback to one event type.
    ///
    /// Declares an exclusive queue (caller-named or generated), binds it
    /// with routing key = the type's wire value, and spawns an independently
    /// cancellable consumer task. Returns the task handle.
    pub async fn subscribe(
        &mut self,
        event_type: EventType,
        handler: Arc<dyn EventHandler>,
        queue_name: Option<String>,
    ) -> Result<SubscriptionHandle, BusError> {
        let connection = self.connection.as_ref().ok_or(BusError::NotConnected)?;
        let routing_key = event_type.as_wire();
        let queue_name = queue_name.unwrap_or_else(|| match &self.config.queue_prefix {
            Some(prefix) => format!("{prefix}.{routing_key}"),
            None => format!("evt.{}.{}", routing_key, Uuid::now_v7()),
        });

        let queue = connection
            .declare_queue(&queue_name, true)
            .await
            .map_err(|err| subscription_error(routing_key, err))?;
        connection
            .bind_queue(&self.config.exchange, &queue_name, routing_key)
            .await
            .map_err(|err| subscription_error(routing_key, err))?;

        let task = tokio::spawn(consume_loop(
            Arc::clone(&queue),
            handler,
            queue_name.clone(),
            Arc::clone(&self.metrics),
        ));
        self.subscriptions.push(OwnedSubscription {
            queue_name: queue_name.clone(),
            queue,
            abort: task.abort_handle(),
        });
        info!(routing_key, queue = %queue_name, "subscription started");
        Ok(SubscriptionHandle {
            event_type,
            queue_name,
            task,
        })
    }

    /// Subscribe one callback to several event types.
    ///
    /// Issues N independent subscriptions with no atomicity across them: on
    /// a failure the error is returned as-is and earlier subscriptions stay
    /// active (they are torn down by `disconnect` like any other).
    pub async fn subscribe_multi(
        &mut self,
        event_types: &[EventType],
        handler: Arc<dyn EventHandler>,
    ) -> Result<Vec<SubscriptionHandle>, BusError> {
        let mut handles = Vec::with_capacity(event_types.len());
        for &event_type in event_types {
            handles.push(
                self.subscribe(event_type, Arc::clone(&handler), None)
                    .await?,
            );
        }
        Ok(handles)
    }

    /// Tear the instance down: cancel every consumer task, best-effort
    /// delete the queues this instance declared, close the connection.
    ///
    /// Safe to call after partial subscription failures, or when never
    /// connected (a no-op then).
    pub async fn disconnect(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        for sub in &self.subscriptions {
            sub.abort.abort();
        }
        for sub in self.subscriptions.drain(..) {
            if let Err(err) = connection.delete_queue(&sub.queue_name).await {
                warn!(queue = %sub.queue_name, %err, "queue delete failed during disconnect");
            }
        }
        if let Err(err) = connection.close().await {
            warn!(%err, "connection close failed during disconnect");
        }
        info!(source = %self.source, "event bus disconnected");
    }

    /// Connection health without an active round trip: unhealthy if never
    /// connected (or already disconnected) or the connection reports closed.
    pub fn health_check(&self) -> HealthStatus {
        match &self.connection {
            None => HealthStatus::Unhealthy {
                reason: "not connected".to_string(),
            },
            Some(connection) if !connection.is_open() => HealthStatus::Unhealthy {
                reason: "connection closed".to_string(),
            },
            Some(_) => HealthStatus::Healthy,
        }
    }

    /// Synchronous snapshot of counters plus current queue depth.
    pub fn metrics(&self) -> BusMetricsSnapshot {
        let queue_depth: u64 = self
            .subscriptions
            .iter()
            .map(|s| s.queue.depth() as u64)
            .sum();
        let active = self
            .subscriptions
            .iter()
            .filter(|s| !s.abort.is_finished())
            .count() as u64;
        self.metrics.snapshot(queue_depth, active)
    }
}

/// Per-subscription consumption loop.
///
/// Each message is handled under a scoped ack: deserialization failures are
/// acked and dropped (never requeued, avoiding poison-message loops);
/// handler errors are logged and acked; a panic leaves the delivery guard
/// unacked so the broker redelivers. The loop exits when its queue closes
/// and is never restarted by the bus.
async fn consume_loop(
    queue: Arc<MessageQueue>,
    handler: Arc<dyn EventHandler>,
    queue_name: String,
    metrics: Arc<BusMetrics>,
) {
    while let Some(delivery) = queue.recv().await {
        handle_delivery(delivery, handler.as_ref(), &queue_name, &metrics).await;
    }
    debug!(queue = %queue_name, "consumer loop exited");
}

async fn handle_delivery(
    delivery: Delivery,
    handler: &dyn EventHandler,
    queue_name: &str,
    metrics: &BusMetrics,
) {
    let event = match Event::from_bytes(delivery.payload()) {
        Ok(event) => event,
        Err(err) => {
            metrics.record_deserialization_failure();
            warn!(queue = %queue_name, %err, "malformed event payload dropped");
            delivery.ack();
            return;
        }
    };
    let event_id = event.id;
    match handler.handle(event).await {
        Ok(()) => {
            metrics.record_delivered();
            delivery.ack();
        }
        Err(err) => {
            metrics.record_handler_error();
            error!(queue = %queue_name, %event_id, %err, "consumer callback failed");
            // Delivered but failed: logged, not retried.
            delivery.ack();
        }
    }
}

fn subscription_error(routing_key: &str, err: BrokerError) -> BusError {
    BusError::Subscription {
        routing_key: routing_key.to_string(),
        reason: err.to_string(),
    }
}

fn map_broker_error(err: BrokerError) -> BusError {
    BusError::Closed {
        reason: err.to_string(),
    }
}
