//! Deferred event dispatch.
//!
//! Events raised during a transaction are buffered per transaction id and
//! released to a bounded worker pool only when that transaction commits:
//!
//! ```text
//! record(tx, ev) ──► pending[tx] ──on_commit(tx)──► queue ──► worker ──► EventSink
//!                        │
//!                        └──on_rollback(tx)──► discarded
//! ```
//!
//! # Guarantees
//!
//! - **Commit-gated**: nothing recorded under a transaction is delivered
//!   while it is active, and nothing is delivered if it rolls back.
//! - **Backpressure, not loss**: when the queue is full, `on_commit` waits.
//! - **Best effort delivery**: sink failures are logged, never retried and
//!   never reach the committing caller.
//! - **Per-transaction order**: events of one transaction enter the queue in
//!   record order. Nothing is promised across transactions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use smallvec::SmallVec;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::{Event, TransactionId};

/// Delivers committed events to the outside world (mail, webhooks, ...).
#[async_trait]
pub trait EventSink<Ev>: Send + Sync + 'static {
    async fn deliver(&self, event: Ev) -> anyhow::Result<()>;
}

/// A committed event on its way to the sink.
#[derive(Debug, Clone)]
pub struct DispatchTask<Ev> {
    pub tx_id: TransactionId,
    /// Position of the event within its transaction.
    pub sequence: usize,
    pub committed_at: DateTime<Utc>,
    pub event: Ev,
}

/// Worker pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    pub worker_pool_size: usize,
    pub queue_capacity: usize,
    pub drain_timeout: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            worker_pool_size: 5,
            queue_capacity: 256,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// Snapshot of dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Handed to the worker queue.
    pub submitted: u64,
    /// Accepted by the sink.
    pub delivered: u64,
    /// Rejected by the sink (error or panic).
    pub failed: u64,
    /// Dropped before reaching the queue (rollback or shutdown).
    pub discarded: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
}

type Buffer<Ev> = SmallVec<[Ev; 4]>;

/// Buffers events per transaction and delivers them after commit.
pub struct EventDispatcher<Ev> {
    pending: DashMap<TransactionId, Buffer<Ev>>,
    sender: Mutex<Option<mpsc::Sender<DispatchTask<Ev>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
    drain_timeout: Duration,
}

impl<Ev: Event> EventDispatcher<Ev> {
    /// Spawn the worker pool. Must be called inside a tokio runtime.
    pub fn start(sink: Arc<dyn EventSink<Ev>>, settings: DispatchSettings) -> Arc<Self> {
        let pool_size = settings.worker_pool_size.max(1);
        let (sender, receiver) = mpsc::channel(settings.queue_capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let counters = Arc::new(Counters::default());

        let workers = (0..pool_size)
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    worker_id,
                    Arc::clone(&receiver),
                    Arc::clone(&sink),
                    Arc::clone(&counters),
                ))
            })
            .collect();

        info!(
            workers = pool_size,
            capacity = settings.queue_capacity,
            "event dispatcher started"
        );

        Arc::new(Self {
            pending: DashMap::new(),
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            counters,
            drain_timeout: settings.drain_timeout,
        })
    }

    /// Buffer an event under its transaction. Never waits on other
    /// transactions' buffers.
    pub fn record(&self, tx_id: TransactionId, event: Ev) {
        self.pending.entry(tx_id).or_default().push(event);
        debug!(%tx_id, "event recorded");
    }

    /// Number of events currently buffered for `tx_id`.
    pub fn pending_for(&self, tx_id: TransactionId) -> usize {
        self.pending.get(&tx_id).map(|buf| buf.len()).unwrap_or(0)
    }

    /// Number of transactions with buffered events.
    pub fn pending_transactions(&self) -> usize {
        self.pending.len()
    }

    /// Move the transaction's events onto the worker queue, in record order.
    ///
    /// Waits while the queue is full. Returns the number of events submitted.
    pub async fn on_commit(&self, tx_id: TransactionId) -> usize {
        let Some((_, events)) = self.pending.remove(&tx_id) else {
            return 0;
        };
        let total = events.len();

        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(sender) = sender else {
            warn!(%tx_id, dropped = total, "dispatcher is shut down, committed events dropped");
            self.counters
                .discarded
                .fetch_add(total as u64, Ordering::Relaxed);
            return 0;
        };

        let committed_at = Utc::now();
        let mut submitted = 0;
        for (sequence, event) in events.into_iter().enumerate() {
            let task = DispatchTask {
                tx_id,
                sequence,
                committed_at,
                event,
            };
            if sender.send(task).await.is_err() {
                let dropped = total - submitted;
                warn!(%tx_id, dropped, "dispatch queue closed during submission");
                self.counters
                    .discarded
                    .fetch_add(dropped as u64, Ordering::Relaxed);
                break;
            }
            submitted += 1;
        }

        self.counters
            .submitted
            .fetch_add(submitted as u64, Ordering::Relaxed);
        debug!(%tx_id, submitted, "committed events submitted");
        submitted
    }

    /// Drop the transaction's events without delivering them.
    pub fn on_rollback(&self, tx_id: TransactionId) -> usize {
        let discarded = self
            .pending
            .remove(&tx_id)
            .map(|(_, events)| events.len())
            .unwrap_or(0);
        if discarded > 0 {
            self.counters
                .discarded
                .fetch_add(discarded as u64, Ordering::Relaxed);
            debug!(%tx_id, discarded, "events discarded on rollback");
        }
        discarded
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
        }
    }

    /// Close the queue and give the workers `drain_timeout` to finish what
    /// is already queued. Workers still running afterwards are aborted.
    ///
    /// Returns `true` when the queue drained in time.
    pub async fn shutdown(&self) -> bool {
        drop(
            self.sender
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        let mut workers =
            std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));

        let drained = tokio::time::timeout(
            self.drain_timeout,
            futures::future::join_all(workers.iter_mut()),
        )
        .await
        .is_ok();

        if drained {
            info!("event dispatcher drained");
        } else {
            warn!(
                timeout_ms = self.drain_timeout.as_millis() as u64,
                "event dispatcher did not drain in time, aborting workers"
            );
            for worker in &workers {
                worker.abort();
            }
        }
        drained
    }
}

async fn run_worker<Ev: Event>(
    worker_id: usize,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<DispatchTask<Ev>>>>,
    sink: Arc<dyn EventSink<Ev>>,
    counters: Arc<Counters>,
) {
    loop {
        // Hold the lock only while waiting for the next task.
        let next = queue.lock().await.recv().await;
        let Some(task) = next else {
            break;
        };
        let DispatchTask {
            tx_id,
            sequence,
            event,
            ..
        } = task;

        match AssertUnwindSafe(sink.deliver(event)).catch_unwind().await {
            Ok(Ok(())) => {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
                debug!(worker_id, %tx_id, sequence, "event delivered");
            }
            Ok(Err(e)) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(worker_id, %tx_id, sequence, error = %e, "event delivery failed");
            }
            Err(_) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(worker_id, %tx_id, sequence, "event sink panicked");
            }
        }
    }
    debug!(worker_id, "dispatch worker stopped");
}
