//! Seams to the worker fleet and the validation data.
//!
//! The real transport and validator live outside this crate. The loopback
//! transport runs workers as in-process closures for simulations and tests.

use crate::collector::UpdateCollector;
use crate::core::{Error, Result, RoundNumber, WorkerId};
use crate::model::{GlobalModelState, WorkerUpdate};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

/// Delivers snapshots to workers and their updates back to the collector.
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    /// Send the round's snapshot to every worker.
    ///
    /// Updates are expected to reach `collector` asynchronously; this call
    /// should not wait for them.
    async fn broadcast(
        &self,
        round: RoundNumber,
        snapshot: Arc<GlobalModelState>,
        collector: Arc<UpdateCollector>,
    ) -> Result<()>;

    /// Tell all workers that training is over.
    async fn terminate_workers(&self) -> Result<()> {
        Ok(())
    }
}

/// Scores a model on held-out data, e.g. validation accuracy.
#[async_trait]
pub trait ValidationOracle: Send + Sync {
    /// Evaluate a snapshot.
    async fn evaluate(&self, state: &GlobalModelState) -> Result<f64>;
}

type Behavior = dyn Fn(&str, RoundNumber, &GlobalModelState) -> Option<WorkerUpdate> + Send + Sync;

struct LoopbackWorker {
    id: WorkerId,
    delay: Duration,
    behavior: Arc<Behavior>,
}

/// In-process transport driving each worker with a closure.
///
/// A closure returning `None` models a worker that never answers.
pub struct LoopbackTransport {
    workers: Vec<LoopbackWorker>,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
    broadcasts: AtomicU64,
    terminated: AtomicBool,
    fail_broadcasts: AtomicU64,
}

impl LoopbackTransport {
    /// Transport without workers.
    pub fn new() -> Self {
        Self {
            workers: Vec::new(),
            in_flight: Mutex::new(Vec::new()),
            broadcasts: AtomicU64::new(0),
            terminated: AtomicBool::new(false),
            fail_broadcasts: AtomicU64::new(0),
        }
    }

    /// Add a worker answering after `delay`.
    pub fn with_worker<F>(mut self, id: &str, delay: Duration, behavior: F) -> Self
    where
        F: Fn(&str, RoundNumber, &GlobalModelState) -> Option<WorkerUpdate> + Send + Sync + 'static,
    {
        self.workers.push(LoopbackWorker {
            id: id.to_string(),
            delay,
            behavior: Arc::new(behavior),
        });
        self
    }

    /// Make the next `count` broadcasts fail.
    pub fn fail_next_broadcasts(&self, count: u64) {
        self.fail_broadcasts.store(count, Ordering::SeqCst);
    }

    /// Number of successful broadcasts.
    pub fn broadcast_count(&self) -> u64 {
        self.broadcasts.load(Ordering::SeqCst)
    }

    /// Whether `terminate_workers` was called.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerTransport for LoopbackTransport {
    async fn broadcast(
        &self,
        round: RoundNumber,
        snapshot: Arc<GlobalModelState>,
        collector: Arc<UpdateCollector>,
    ) -> Result<()> {
        if self.is_terminated() {
            return Err(Error::Transport("workers already terminated".to_string()));
        }
        let pending_failure = self
            .fail_broadcasts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if pending_failure.is_ok() {
            return Err(Error::Transport(format!("broadcast of round {} failed", round)));
        }

        let mut in_flight = self.in_flight.lock().await;
        in_flight.retain(|handle| !handle.is_finished());

        for worker in &self.workers {
            let id = worker.id.clone();
            let delay = worker.delay;
            let behavior = Arc::clone(&worker.behavior);
            let snapshot = Arc::clone(&snapshot);
            let collector = Arc::clone(&collector);

            in_flight.push(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let Some(update) = behavior(&id, round, &snapshot) else {
                    debug!(worker = %id, round, "Worker stayed silent");
                    return;
                };
                if let Err(err) = collector.submit(update).await {
                    debug!(worker = %id, round, error = %err, "Loopback delivery rejected");
                }
            }));
        }

        self.broadcasts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn terminate_workers(&self) -> Result<()> {
        self.terminated.store(true, Ordering::SeqCst);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.in_flight.lock().await);
        for handle in &handles {
            handle.abort();
        }
        // Aborted tasks resolve with a cancellation error; only draining matters.
        futures::future::join_all(handles).await;
        Ok(())
    }
}
