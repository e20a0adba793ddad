//! The broadcast throttler
//!
//! Two background tasks own the message flow: a batching task draining the
//! intake channel into the pending batch (flushing the instant the batch
//! hits `max_batch_size`), and a periodic flush task bounding worst-case
//! latency to roughly one batch window. Priority messages skip both and go
//! straight to the delivery sink.
//!
//! The pending batch and dedup map sit behind mutexes: flush takes the
//! whole batch under the lock and delivers outside it, so a slow sink never
//! blocks acceptance.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::batch::{batch_envelope, PendingBatch};
use crate::config::{ThrottleConfig, ThrottleError};
use crate::dedup::{dedup_key, DedupTracker};
use crate::metrics::{ThrottleMetrics, ThrottleStats};

/// Depth of the intake channel between `broadcast` and the batching task.
const INTAKE_CAPACITY: usize = 1024;

/// Errors a delivery sink may return; logged, never propagated.
pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// Downstream delivery callback.
///
/// Receives either a raw message or a `batch_update` envelope. A returned
/// error terminates only that delivery attempt; it never corrupts throttle
/// state or kills the background tasks.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(&self, payload: Value) -> Result<(), SinkError>;
}

struct FnSink<F>(F);

#[async_trait]
impl<F, Fut> DeliverySink for FnSink<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), SinkError>> + Send,
{
    async fn deliver(&self, payload: Value) -> Result<(), SinkError> {
        (self.0)(payload).await
    }
}

/// Wrap an async closure as a `DeliverySink`.
pub fn sink_fn<F, Fut>(f: F) -> Arc<dyn DeliverySink>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), SinkError>> + Send + 'static,
{
    Arc::new(FnSink(f))
}

struct Shared {
    pending: Mutex<PendingBatch>,
    dedup: Mutex<DedupTracker>,
    /// Held across take-and-deliver so at most one flush is in flight;
    /// without it a size-triggered flush could overtake a slow window
    /// flush and reach the sink out of acceptance order.
    flush_gate: tokio::sync::Mutex<()>,
    metrics: ThrottleMetrics,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, PendingBatch> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dedup(&self) -> MutexGuard<'_, DedupTracker> {
        self.dedup.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Tasks {
    /// Returns the intake receiver on exit so `stop` can close and drain it.
    batcher: JoinHandle<mpsc::Receiver<Value>>,
    timer: JoinHandle<()>,
}

/// Fans state changes out to interactive client connections without
/// overloading them.
pub struct BroadcastThrottler {
    config: ThrottleConfig,
    sink: Arc<dyn DeliverySink>,
    shared: Arc<Shared>,
    intake_tx: mpsc::Sender<Value>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Option<Tasks>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for BroadcastThrottler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastThrottler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BroadcastThrottler {
    /// Validate the configuration and start the background tasks.
    pub fn start(
        config: ThrottleConfig,
        sink: Arc<dyn DeliverySink>,
    ) -> Result<Self, ThrottleError> {
        config.validate()?;
        let shared = Arc::new(Shared {
            pending: Mutex::new(PendingBatch::default()),
            dedup: Mutex::new(DedupTracker::new(
                config.min_interval(),
                config.dedup_key_limit,
                config.dedup_stale_after,
            )),
            flush_gate: tokio::sync::Mutex::new(()),
            metrics: ThrottleMetrics::default(),
        });
        let (intake_tx, intake_rx) = mpsc::channel(INTAKE_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let batcher = tokio::spawn(batch_loop(
            intake_rx,
            shutdown_rx.clone(),
            Arc::clone(&shared),
            Arc::clone(&sink),
            config.max_batch_size,
        ));
        let timer = tokio::spawn(flush_timer_loop(
            shutdown_rx,
            Arc::clone(&shared),
            Arc::clone(&sink),
            config.batch_window,
        ));
        info!(
            max_messages_per_second = config.max_messages_per_second,
            batch_window_ms = config.batch_window.as_millis() as u64,
            max_batch_size = config.max_batch_size,
            "broadcast throttler started"
        );
        Ok(Self {
            config,
            sink,
            shared,
            intake_tx,
            shutdown_tx,
            tasks: Some(Tasks { batcher, timer }),
            stopped: AtomicBool::new(false),
        })
    }

    /// Submit a message for delivery.
    ///
    /// Priority messages are delivered synchronously via the sink, bypassing
    /// rate limiting and batching; they are never dropped or delayed.
    /// Non-priority messages are rate-limited per dedup key and enqueued for
    /// batching; a drop is recorded, not an error.
    pub async fn broadcast(&self, message: Value, priority: bool) -> Result<(), ThrottleError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(ThrottleError::Stopped);
        }
        if priority {
            deliver(self.sink.as_ref(), &self.shared.metrics, message).await;
            self.shared
                .metrics
                .sent_immediate
                .fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        if self.config.drop_duplicates {
            let key = dedup_key(&message, &self.config.debounce_keys);
            if !self.shared.dedup().accept(&key) {
                self.shared.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(%key, "message dropped by rate limit");
                return Ok(());
            }
        }
        self.intake_tx
            .send(message)
            .await
            .map_err(|_| ThrottleError::Stopped)?;
        self.shared.metrics.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Stop the background tasks, then perform one final flush so buffered
    /// messages are delivered rather than dropped. Idempotent.
    ///
    /// The intake channel is closed before the final sweep, so any
    /// `broadcast` that already returned `Ok` has its message either swept
    /// into the final flush or its send refused; an accepted message is
    /// never silently lost.
    pub async fn stop(&mut self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        if let Some(tasks) = self.tasks.take() {
            let _ = tasks.timer.await;
            if let Ok(mut intake_rx) = tasks.batcher.await {
                intake_rx.close();
                while let Ok(message) = intake_rx.try_recv() {
                    self.shared.pending().push(message);
                }
            }
        }
        flush(&self.shared, self.sink.as_ref()).await;
        info!("broadcast throttler stopped");
    }

    /// Synchronous snapshot of counters, intake depth and batch state.
    pub fn stats(&self) -> ThrottleStats {
        let queue_depth = (self.intake_tx.max_capacity() - self.intake_tx.capacity()) as u64;
        let pending = self.shared.pending().len() as u64;
        let tracked = self.shared.dedup().tracked_keys() as u64;
        self.shared.metrics.snapshot(queue_depth, pending, tracked)
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }
}

/// Drain the intake channel into the pending batch; flush the instant the
/// batch reaches `max_batch_size`. On shutdown the receiver is handed back
/// to `stop`, which closes it and sweeps what remains into the final flush.
async fn batch_loop(
    mut intake_rx: mpsc::Receiver<Value>,
    mut shutdown_rx: watch::Receiver<bool>,
    shared: Arc<Shared>,
    sink: Arc<dyn DeliverySink>,
    max_batch_size: usize,
) -> mpsc::Receiver<Value> {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            message = intake_rx.recv() => {
                let Some(message) = message else { break };
                let full = {
                    let mut pending = shared.pending();
                    pending.push(message);
                    pending.len() >= max_batch_size
                };
                if full {
                    flush(&shared, sink.as_ref()).await;
                }
            }
        }
    }
    debug!("batching task exited");
    intake_rx
}

/// Flush whatever is pending every batch window, bounding worst-case
/// latency for any accepted non-priority message.
async fn flush_timer_loop(
    mut shutdown_rx: watch::Receiver<bool>,
    shared: Arc<Shared>,
    sink: Arc<dyn DeliverySink>,
    batch_window: std::time::Duration,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + batch_window, batch_window);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = ticker.tick() => flush(&shared, sink.as_ref()).await,
        }
    }
    debug!("flush timer task exited");
}

/// Take the whole pending batch and deliver it: a single message as-is, a
/// multi-message batch wrapped in one `batch_update` envelope. The flush
/// gate is held until the sink returns, so sequential batches reach the
/// sink in acceptance order even when a delivery is slow.
async fn flush(shared: &Shared, sink: &dyn DeliverySink) {
    let _gate = shared.flush_gate.lock().await;
    let mut batch = shared.pending().take();
    if batch.is_empty() {
        return;
    }
    let count = batch.len() as u64;
    let payload = if batch.len() == 1 {
        batch.remove(0)
    } else {
        batch_envelope(batch)
    };
    shared
        .metrics
        .batches_flushed
        .fetch_add(1, Ordering::Relaxed);
    shared
        .metrics
        .messages_flushed
        .fetch_add(count, Ordering::Relaxed);
    deliver(sink, &shared.metrics, payload).await;
}

/// Invoke the sink. A sink error is logged and counted; it terminates only
/// this delivery attempt.
async fn deliver(sink: &dyn DeliverySink, metrics: &ThrottleMetrics, payload: Value) {
    if let Err(err) = sink.deliver(payload).await {
        metrics.delivery_failures.fetch_add(1, Ordering::Relaxed);
        warn!(%err, "delivery callback failed");
    }
}
