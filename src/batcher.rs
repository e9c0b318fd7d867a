//! Write-behind batching pipeline
//!
//! The registry enqueues one [`SessionBatch`] per mutation; a single worker
//! drains the queue on a fixed interval, or immediately once the backlog
//! reaches twice the flush size, and applies each drained prefix atomically
//! through a [`BatchWriter`]. Failed flushes are re-queued at the head so
//! per-session ordering survives retries.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::store::StoreError;

/// Consecutive flush failures after which `/health` reports degraded.
const DEGRADED_THRESHOLD: u32 = 3;

/// Flush attempts during shutdown before giving up on the backlog.
const SHUTDOWN_RETRIES: u32 = 3;

/// Coalesced write unit for one session.
#[derive(Debug, Clone)]
pub struct SessionBatch {
    pub session_id: String,
    pub user_id: String,
    pub metadata: Value,
    pub is_active: bool,
    pub events: Vec<Value>,
    pub errors: Vec<Value>,
}

impl SessionBatch {
    pub fn metadata_only(session_id: String, user_id: String, metadata: Value, is_active: bool) -> Self {
        Self {
            session_id,
            user_id,
            metadata,
            is_active,
            events: Vec::new(),
            errors: Vec::new(),
        }
    }
}

/// Destination for drained batches. Implementations apply the whole slice
/// within one transaction.
#[async_trait]
pub trait BatchWriter: Send + Sync {
    async fn apply_batches(&self, batches: &[SessionBatch]) -> Result<(), StoreError>;
}

pub struct EventBatcher {
    queue: Mutex<VecDeque<SessionBatch>>,
    writer: Arc<dyn BatchWriter>,
    batch_size: usize,
    flush_now: Notify,
    shutting_down: AtomicBool,
    consecutive_failures: AtomicU32,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventBatcher {
    pub fn new(writer: Arc<dyn BatchWriter>, batch_size: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            writer,
            batch_size: batch_size.max(1),
            flush_now: Notify::new(),
            shutting_down: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            worker: Mutex::new(None),
        })
    }

    /// Start the flush worker. Call once at startup.
    pub fn spawn_worker(self: &Arc<Self>, interval: Duration) {
        let batcher = Arc::clone(self);
        let handle = tokio::spawn(async move {
            batcher.worker_loop(interval).await;
        });
        *self.worker.lock().unwrap() = Some(handle);
    }

    /// Non-blocking enqueue. A backlog of twice the flush size wakes the
    /// worker immediately to bound memory.
    pub fn enqueue(&self, batch: SessionBatch) {
        let backlog = {
            let mut queue = self.queue.lock().unwrap();
            queue.push_back(batch);
            queue.len()
        };

        if backlog >= self.batch_size * 2 {
            debug!(backlog, "batch queue over high-water mark, requesting flush");
            self.flush_now.notify_one();
        }
    }

    /// Drain up to one flush worth of entries and apply them in order. On
    /// failure the drained entries go back to the head of the queue in their
    /// original relative order.
    pub async fn flush(&self) -> Result<usize, StoreError> {
        let drained: Vec<SessionBatch> = {
            let mut queue = self.queue.lock().unwrap();
            let take = queue.len().min(self.batch_size);
            queue.drain(..take).collect()
        };

        if drained.is_empty() {
            return Ok(0);
        }

        match self.writer.apply_batches(&drained).await {
            Ok(()) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                debug!(count = drained.len(), "flushed session batches");
                Ok(drained.len())
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(error = %e, failures, "batch flush failed, re-queueing");
                let mut queue = self.queue.lock().unwrap();
                for batch in drained.into_iter().rev() {
                    queue.push_front(batch);
                }
                Err(e)
            }
        }
    }

    /// Drain and flush everything, then stop the worker.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        self.flush_now.notify_one();

        let handle = { self.worker.lock().unwrap().take() };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "batch worker terminated abnormally");
            }
        } else {
            // No worker was ever spawned; flush inline.
            self.drain_all().await;
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_degraded(&self) -> bool {
        self.consecutive_failures.load(Ordering::Relaxed) >= DEGRADED_THRESHOLD
    }

    async fn worker_loop(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.flush_now.notified() => {}
            }

            if self.shutting_down.load(Ordering::Relaxed) {
                break;
            }

            // Keep draining while full flushes come back; a short flush means
            // the backlog fit, an error waits for the next tick.
            loop {
                match self.flush().await {
                    Ok(n) if n == self.batch_size => continue,
                    _ => break,
                }
            }
        }

        self.drain_all().await;
        info!("batch worker stopped");
    }

    async fn drain_all(&self) {
        let mut attempts = 0;
        while self.queue_len() > 0 {
            match self.flush().await {
                Ok(_) => attempts = 0,
                Err(e) => {
                    attempts += 1;
                    if attempts >= SHUTDOWN_RETRIES {
                        error!(
                            error = %e,
                            abandoned = self.queue_len(),
                            "giving up on batch backlog during shutdown"
                        );
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}
