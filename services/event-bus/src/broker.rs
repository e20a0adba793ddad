//! In-process durable topic broker
//!
//! The broker runs as a single actor task owning every exchange, queue and
//! connection. Handles talk to it over a command channel, so a publish is a
//! real round trip that suspends the caller until the broker has routed the
//! message (which is what gives `publish` its timeout semantics).
//!
//! Topic exchanges route a message to every queue bound with a matching
//! routing key. Exclusive queues are owned by one connection and deleted
//! when it closes, scoping a subscription's lifetime to its process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::queue::{MessageQueue, WireMessage};

/// Broker-level failures, mapped into `BusError` by the bus facade.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Broker has shut down")]
    Shutdown,

    #[error("Unknown exchange: {name}")]
    UnknownExchange { name: String },

    #[error("Unknown queue: {name}")]
    UnknownQueue { name: String },

    #[error("Queue {name} is exclusively owned by another connection")]
    QueueInUse { name: String },

    #[error("Connection is closed")]
    ConnectionClosed,
}

/// Tuning knobs for the broker actor.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Depth of the command channel between handles and the actor.
    pub command_buffer: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { command_buffer: 256 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ConnectionId(u64);

enum Command {
    OpenConnection {
        reply: oneshot::Sender<ConnectionId>,
    },
    CloseConnection {
        conn: ConnectionId,
        reply: oneshot::Sender<()>,
    },
    DeclareExchange {
        name: String,
        durable: bool,
        reply: oneshot::Sender<()>,
    },
    DeclareQueue {
        conn: ConnectionId,
        name: String,
        exclusive: bool,
        reply: oneshot::Sender<Result<Arc<MessageQueue>, BrokerError>>,
    },
    BindQueue {
        exchange: String,
        queue: String,
        routing_key: String,
        reply: oneshot::Sender<Result<(), BrokerError>>,
    },
    Publish {
        exchange: String,
        message: WireMessage,
        reply: oneshot::Sender<Result<usize, BrokerError>>,
    },
    DeleteQueue {
        name: String,
        reply: oneshot::Sender<Result<(), BrokerError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct Exchange {
    /// routing key -> bound queue names
    bindings: HashMap<String, Vec<String>>,
}

struct QueueEntry {
    queue: Arc<MessageQueue>,
    owner: ConnectionId,
    exclusive: bool,
}

#[derive(Default)]
struct ConnectionEntry {
    queues: Vec<String>,
}

struct BrokerState {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, QueueEntry>,
    connections: HashMap<ConnectionId, ConnectionEntry>,
    next_connection: u64,
}

impl BrokerState {
    fn new() -> Self {
        Self {
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            connections: HashMap::new(),
            next_connection: 0,
        }
    }

    fn route(&mut self, exchange: &str, message: WireMessage) -> Result<usize, BrokerError> {
        let exchange = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::UnknownExchange {
                name: exchange.to_string(),
            })?;
        let Some(bound) = exchange.bindings.get(&message.routing_key) else {
            // Topic exchange semantics: an unroutable message is dropped.
            debug!(routing_key = %message.routing_key, "no bindings, message dropped");
            return Ok(0);
        };
        let mut routed = 0;
        for name in bound {
            if let Some(entry) = self.queues.get(name) {
                entry.queue.push(message.clone());
                routed += 1;
            }
        }
        Ok(routed)
    }

    fn delete_queue(&mut self, name: &str) -> Result<(), BrokerError> {
        let entry = self
            .queues
            .remove(name)
            .ok_or_else(|| BrokerError::UnknownQueue {
                name: name.to_string(),
            })?;
        entry.queue.close();
        for exchange in self.exchanges.values_mut() {
            for bound in exchange.bindings.values_mut() {
                bound.retain(|q| q != name);
            }
        }
        if let Some(conn) = self.connections.get_mut(&entry.owner) {
            conn.queues.retain(|q| q != name);
        }
        Ok(())
    }

    fn close_connection(&mut self, conn: ConnectionId) {
        let Some(entry) = self.connections.remove(&conn) else {
            return;
        };
        for name in entry.queues {
            if self.queues.get(&name).is_some_and(|q| q.exclusive) {
                if let Err(err) = self.delete_queue(&name) {
                    warn!(queue = %name, %err, "failed to delete exclusive queue on close");
                }
            }
        }
    }
}

async fn run(mut rx: mpsc::Receiver<Command>) {
    let mut state = BrokerState::new();
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::OpenConnection { reply } => {
                let id = ConnectionId(state.next_connection);
                state.next_connection += 1;
                state.connections.insert(id, ConnectionEntry::default());
                debug!(connection = id.0, "connection opened");
                let _ = reply.send(id);
            }
            Command::CloseConnection { conn, reply } => {
                state.close_connection(conn);
                debug!(connection = conn.0, "connection closed");
                let _ = reply.send(());
            }
            Command::DeclareExchange {
                name,
                durable,
                reply,
            } => {
                state.exchanges.entry(name.clone()).or_insert_with(|| {
                    info!(exchange = %name, durable, "exchange declared");
                    Exchange {
                        bindings: HashMap::new(),
                    }
                });
                let _ = reply.send(());
            }
            Command::DeclareQueue {
                conn,
                name,
                exclusive,
                reply,
            } => {
                let result = declare_queue(&mut state, conn, name, exclusive);
                let _ = reply.send(result);
            }
            Command::BindQueue {
                exchange,
                queue,
                routing_key,
                reply,
            } => {
                let result = bind_queue(&mut state, &exchange, &queue, routing_key);
                let _ = reply.send(result);
            }
            Command::Publish {
                exchange,
                message,
                reply,
            } => {
                let _ = reply.send(state.route(&exchange, message));
            }
            Command::DeleteQueue { name, reply } => {
                let _ = reply.send(state.delete_queue(&name));
            }
            Command::Shutdown { reply } => {
                for entry in state.queues.values() {
                    entry.queue.close();
                }
                info!("broker shut down");
                let _ = reply.send(());
                return;
            }
        }
    }
    // All handles dropped; close remaining queues so consumers unblock.
    for entry in state.queues.values() {
        entry.queue.close();
    }
}

fn declare_queue(
    state: &mut BrokerState,
    conn: ConnectionId,
    name: String,
    exclusive: bool,
) -> Result<Arc<MessageQueue>, BrokerError> {
    if !state.connections.contains_key(&conn) {
        return Err(BrokerError::ConnectionClosed);
    }
    if let Some(existing) = state.queues.get(&name) {
        if existing.exclusive && existing.owner != conn {
            return Err(BrokerError::QueueInUse { name });
        }
        return Ok(Arc::clone(&existing.queue));
    }
    let queue = MessageQueue::new(name.clone());
    state.queues.insert(
        name.clone(),
        QueueEntry {
            queue: Arc::clone(&queue),
            owner: conn,
            exclusive,
        },
    );
    if let Some(entry) = state.connections.get_mut(&conn) {
        entry.queues.push(name.clone());
    }
    debug!(queue = %name, exclusive, "queue declared");
    Ok(queue)
}

fn bind_queue(
    state: &mut BrokerState,
    exchange: &str,
    queue: &str,
    routing_key: String,
) -> Result<(), BrokerError> {
    if !state.queues.contains_key(queue) {
        return Err(BrokerError::UnknownQueue {
            name: queue.to_string(),
        });
    }
    let exchange = state
        .exchanges
        .get_mut(exchange)
        .ok_or_else(|| BrokerError::UnknownExchange {
            name: exchange.to_string(),
        })?;
    let bound = exchange.bindings.entry(routing_key).or_default();
    if !bound.iter().any(|q| q == queue) {
        bound.push(queue.to_string());
    }
    Ok(())
}

/// Cloneable handle to the broker actor.
#[derive(Clone)]
pub struct Broker {
    tx: mpsc::Sender<Command>,
}

impl Broker {
    /// Spawn the broker task and return a handle. One broker per process,
    /// constructed at startup and passed to dependents.
    pub fn start(config: BrokerConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.command_buffer);
        tokio::spawn(run(rx));
        Self { tx }
    }

    /// Open a connection to the broker.
    pub async fn connect(&self) -> Result<Connection, BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::OpenConnection { reply })
            .await
            .map_err(|_| BrokerError::Shutdown)?;
        let id = rx.await.map_err(|_| BrokerError::Shutdown)?;
        Ok(Connection {
            id,
            tx: self.tx.clone(),
            open: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Stop the broker, closing every queue. Waiting consumers unblock.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// A connection owned by one bus instance. Exclusive queues declared on it
/// are deleted when it closes.
pub struct Connection {
    id: ConnectionId,
    tx: mpsc::Sender<Command>,
    open: Arc<AtomicBool>,
}

impl Connection {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(BrokerError::ConnectionClosed);
        }
        Ok(())
    }

    async fn roundtrip<T>(
        &self,
        cmd: Command,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, BrokerError> {
        self.ensure_open()?;
        self.tx.send(cmd).await.map_err(|_| BrokerError::Shutdown)?;
        rx.await.map_err(|_| BrokerError::Shutdown)
    }

    /// Declare (idempotently) a durable topic exchange.
    pub async fn declare_exchange(&self, name: &str) -> Result<(), BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.roundtrip(
            Command::DeclareExchange {
                name: name.to_string(),
                durable: true,
                reply,
            },
            rx,
        )
        .await
    }

    /// Declare a queue owned by this connection.
    pub async fn declare_queue(
        &self,
        name: &str,
        exclusive: bool,
    ) -> Result<Arc<MessageQueue>, BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.roundtrip(
            Command::DeclareQueue {
                conn: self.id,
                name: name.to_string(),
                exclusive,
                reply,
            },
            rx,
        )
        .await?
    }

    /// Bind a queue to an exchange under a routing key.
    pub async fn bind_queue(
        &self,
        exchange: &str,
        queue: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.roundtrip(
            Command::BindQueue {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
                reply,
            },
            rx,
        )
        .await?
    }

    /// Publish to an exchange; resolves once the broker has routed the
    /// message to every bound queue. Returns the number of queues reached.
    pub async fn publish(
        &self,
        exchange: &str,
        message: WireMessage,
    ) -> Result<usize, BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.roundtrip(
            Command::Publish {
                exchange: exchange.to_string(),
                message,
                reply,
            },
            rx,
        )
        .await?
    }

    /// Delete a queue, closing it for its consumer.
    pub async fn delete_queue(&self, name: &str) -> Result<(), BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.roundtrip(
            Command::DeleteQueue {
                name: name.to_string(),
                reply,
            },
            rx,
        )
        .await?
    }

    /// Close the connection; the broker deletes its exclusive queues.
    pub async fn close(&self) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.open.store(false, Ordering::Release);
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::CloseConnection {
                conn: self.id,
                reply,
            })
            .await
            .map_err(|_| BrokerError::Shutdown)?;
        rx.await.map_err(|_| BrokerError::Shutdown)
    }

    /// Whether the connection is still open, without a round trip.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.tx.is_closed()
    }
}
