//! Control-loop runtime: turns change notifications into reconciliation
//! passes.
//!
//! Keys go through a [`WorkQueue`] that collapses duplicate notifications and
//! never hands the same key to two workers at once. A fixed pool of workers
//! drains the queue; failed or requeued passes come back after a per-key
//! exponential backoff.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::reconciler::Reconciler;
use crate::types::{Notification, ReconcileOutcome, RuleKey};

/// Configuration for the reconciliation loop.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Number of passes that may run at once.
    pub max_concurrent: usize,
    /// Delay before the first retry of a key.
    pub backoff_base: Duration,
    /// Upper bound on the retry delay.
    pub backoff_max: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(1000),
        }
    }
}

impl LoopConfig {
    /// Retry delay after `failures` consecutive failures.
    pub fn backoff(&self, failures: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(failures))
            .min(self.backoff_max)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<RuleKey>,
    dirty: HashSet<RuleKey>,
    processing: HashSet<RuleKey>,
    failures: HashMap<RuleKey, u32>,
    shutting_down: bool,
}

/// Deduplicating work queue keyed by rule.
///
/// A key added while it is being processed is held back until
/// [`WorkQueue::done`] is called for it.
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    ready: Notify,
}

impl WorkQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue `key` unless it is already waiting.
    pub async fn add(&self, key: RuleKey) {
        let mut state = self.state.lock().await;
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.ready.notify_one();
    }

    /// Enqueue `key` once `delay` has elapsed.
    pub fn add_after(self: &Arc<Self>, key: RuleKey, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key).await;
        });
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<RuleKey> {
        loop {
            let ready = self.ready.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            ready.await;
        }
    }

    /// Mark `key` as processed, releasing any add that arrived meanwhile.
    pub async fn done(&self, key: &RuleKey) {
        let mut state = self.state.lock().await;
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.ready.notify_one();
        }
    }

    /// Record a failure for `key` and return how many it has had before.
    pub async fn record_failure(&self, key: &RuleKey) -> u32 {
        let mut state = self.state.lock().await;
        let failures = state.failures.entry(key.clone()).or_insert(0);
        let previous = *failures;
        *failures = failures.saturating_add(1);
        previous
    }

    /// Reset the failure count for `key`.
    pub async fn forget(&self, key: &RuleKey) {
        self.state.lock().await.failures.remove(key);
    }

    /// Number of keys waiting to be processed.
    pub async fn len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// Whether no keys are waiting.
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.queue.is_empty()
    }

    /// Stop handing out keys and wake every waiting worker.
    pub async fn shut_down(&self) {
        self.state.lock().await.shutting_down = true;
        self.ready.notify_waiters();
    }
}

/// Counters for a loop run.
#[derive(Debug, Default)]
struct LoopCounters {
    passes: AtomicU64,
    errors: AtomicU64,
    requeues: AtomicU64,
}

/// Totals reported when the loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub passes: u64,
    pub errors: u64,
    pub requeues: u64,
}

impl LoopCounters {
    fn stats(&self) -> LoopStats {
        LoopStats {
            passes: self.passes.load(Ordering::SeqCst),
            errors: self.errors.load(Ordering::SeqCst),
            requeues: self.requeues.load(Ordering::SeqCst),
        }
    }
}

/// Handle that stops a running [`ReconciliationLoop`].
#[derive(Debug, Clone)]
pub struct LoopStopper {
    tx: Arc<watch::Sender<bool>>,
}

impl LoopStopper {
    /// Ask the loop to stop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LoopStopped`] if a stop was already requested.
    pub fn stop(&self) -> Result<()> {
        if self.tx.send_replace(true) {
            Err(Error::LoopStopped)
        } else {
            Ok(())
        }
    }
}

/// Drives a [`Reconciler`] from a notification stream.
pub struct ReconciliationLoop {
    reconciler: Arc<Reconciler>,
    queue: Arc<WorkQueue>,
    config: LoopConfig,
    stop_tx: Arc<watch::Sender<bool>>,
    counters: Arc<LoopCounters>,
}

impl ReconciliationLoop {
    /// Create a new loop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `max_concurrent` is zero.
    pub fn new(reconciler: Arc<Reconciler>, config: LoopConfig) -> Result<Self> {
        if config.max_concurrent == 0 {
            return Err(Error::invalid_config("max_concurrent must be at least 1"));
        }
        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            reconciler,
            queue: Arc::new(WorkQueue::new()),
            config,
            stop_tx: Arc::new(stop_tx),
            counters: Arc::new(LoopCounters::default()),
        })
    }

    /// Handle for stopping the loop from another task.
    pub fn stopper(&self) -> LoopStopper {
        LoopStopper {
            tx: Arc::clone(&self.stop_tx),
        }
    }

    /// The loop's work queue.
    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Totals so far.
    pub fn stats(&self) -> LoopStats {
        self.counters.stats()
    }

    /// Run until stopped or until the notification stream closes.
    ///
    /// Every stored key is enqueued once at start, and again whenever the
    /// stream reports that notifications were dropped.
    ///
    /// # Errors
    ///
    /// Returns the store's error if the initial listing fails.
    pub async fn run(&self, mut notifications: broadcast::Receiver<Notification>) -> Result<LoopStats> {
        let mut stop_rx = self.stop_tx.subscribe();
        if *stop_rx.borrow_and_update() {
            return Err(Error::LoopStopped);
        }

        self.resync().await?;
        info!(workers = self.config.max_concurrent, "Starting reconciliation loop");

        let workers: Vec<_> = (0..self.config.max_concurrent)
            .map(|id| {
                let worker = Worker {
                    id,
                    reconciler: Arc::clone(&self.reconciler),
                    queue: Arc::clone(&self.queue),
                    config: self.config.clone(),
                    counters: Arc::clone(&self.counters),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        loop {
            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        info!("Reconciliation loop stop requested");
                        break;
                    }
                }
                received = notifications.recv() => match received {
                    Ok(notification) => {
                        debug!(key = %notification.key, kind = ?notification.kind, "Notification received");
                        self.queue.add(notification.key).await;
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Notifications dropped, resyncing");
                        if let Err(e) = self.resync().await {
                            warn!(error = %e, "Resync failed");
                        }
                    }
                    Err(RecvError::Closed) => {
                        info!("Notification stream closed");
                        break;
                    }
                },
            }
        }

        self.queue.shut_down().await;
        for joined in join_all(workers).await {
            if let Err(e) = joined {
                warn!(error = %e, "Worker task failed");
            }
        }

        let stats = self.stats();
        info!(
            passes = stats.passes,
            errors = stats.errors,
            requeues = stats.requeues,
            "Reconciliation loop stopped"
        );
        Ok(stats)
    }

    async fn resync(&self) -> Result<()> {
        let keys = self.reconciler.store().list().await?;
        debug!(count = keys.len(), "Enqueueing all constraints");
        for key in keys {
            self.queue.add(key).await;
        }
        Ok(())
    }
}

struct Worker {
    id: usize,
    reconciler: Arc<Reconciler>,
    queue: Arc<WorkQueue>,
    config: LoopConfig,
    counters: Arc<LoopCounters>,
}

impl Worker {
    async fn run(self) {
        while let Some(key) = self.queue.get().await {
            self.process(&key).await;
            self.queue.done(&key).await;
        }
        debug!(worker = self.id, "Worker exiting");
    }

    async fn process(&self, key: &RuleKey) {
        self.counters.passes.fetch_add(1, Ordering::SeqCst);
        match self.reconciler.reconcile(key).await {
            Ok(ReconcileOutcome::Done) => self.queue.forget(key).await,
            Ok(ReconcileOutcome::Requeue { reason }) => {
                self.counters.requeues.fetch_add(1, Ordering::SeqCst);
                let delay = self.retry_delay(key).await;
                debug!(key = %key, reason = %reason, delay = ?delay, "Requeueing");
                self.queue.add_after(key.clone(), delay);
            }
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::SeqCst);
                let delay = self.retry_delay(key).await;
                warn!(key = %key, error = %e, delay = ?delay, "Reconciliation failed, retrying");
                self.queue.add_after(key.clone(), delay);
            }
        }
    }

    async fn retry_delay(&self, key: &RuleKey) -> Duration {
        let failures = self.queue.record_failure(key).await;
        self.config.backoff(failures)
    }
}
