//! Worker pool.
//!
//! `N` tokio tasks share one bounded inbound channel. Each worker runs a
//! dispatch to completion before taking the next delivery. A `WorkerSlot`
//! tracks what a worker is doing so shutdown can tell pre-commit work
//! (abandoned, left for redelivery) from a commit in progress (awaited).

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dispatch::Dispatcher;
use crate::broker::Delivery;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Processing(Uuid),
    /// Commit started; the worker runs to the end of the dispatch.
    Committing(Uuid),
    /// Abandoned by shutdown before commit.
    Cancelled,
}

/// Phase of one worker, shared with shutdown.
#[derive(Debug)]
pub struct WorkerSlot {
    phase: Mutex<Phase>,
}

impl Default for WorkerSlot {
    fn default() -> Self {
        Self {
            phase: Mutex::new(Phase::Idle),
        }
    }
}

impl WorkerSlot {
    fn phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn start(&self, id: Uuid) {
        *self.phase() = Phase::Processing(id);
    }

    /// Enter the commit phase. False once shutdown abandoned this dispatch.
    pub(crate) fn begin_commit(&self) -> bool {
        let mut phase = self.phase();
        match *phase {
            Phase::Processing(id) | Phase::Committing(id) => {
                *phase = Phase::Committing(id);
                true
            }
            Phase::Idle | Phase::Cancelled => false,
        }
    }

    /// Back to pre-commit work after a failed commit.
    pub(crate) fn resume(&self) {
        let mut phase = self.phase();
        if let Phase::Committing(id) = *phase {
            *phase = Phase::Processing(id);
        }
    }

    pub(crate) fn finish(&self) {
        *self.phase() = Phase::Idle;
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        *self.phase() == Phase::Cancelled
    }

    /// Abandon pre-commit work. Returns the envelope id if there was any.
    fn cancel(&self) -> Option<Uuid> {
        let mut phase = self.phase();
        match *phase {
            Phase::Processing(id) => {
                *phase = Phase::Cancelled;
                Some(id)
            }
            _ => None,
        }
    }
}

/// Outcome of `MessageBus::shutdown`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShutdownReport {
    /// Envelopes abandoned before commit; the broker redelivers them.
    pub abandoned: Vec<Uuid>,
    /// Workers that stopped on their own before the deadline.
    pub drained: usize,
}

impl ShutdownReport {
    /// True when no in-flight dispatch had to be abandoned.
    pub fn is_clean(&self) -> bool {
        self.abandoned.is_empty()
    }
}

struct Worker {
    slot: Arc<WorkerSlot>,
    handle: JoinHandle<()>,
}

/// Fixed set of workers pulling from one shared inbound channel.
pub struct WorkerPool {
    workers: Vec<Worker>,
}

impl WorkerPool {
    pub(crate) fn spawn(
        count: usize,
        dispatcher: Arc<Dispatcher>,
        inbound: mpsc::Receiver<Delivery>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        let inbound = Arc::new(tokio::sync::Mutex::new(inbound));
        let workers = (0..count)
            .map(|index| {
                let slot = Arc::new(WorkerSlot::default());
                let handle = tokio::spawn(run_worker(
                    index,
                    Arc::clone(&slot),
                    Arc::clone(&dispatcher),
                    Arc::clone(&inbound),
                    stop.clone(),
                ));
                Worker { slot, handle }
            })
            .collect();
        info!(workers = count, "Worker pool started");
        Self { workers }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Wait for workers to stop (admission must already be closed), then
    /// abandon whatever has not reached its commit by `deadline`.
    pub(crate) async fn drain(self, timeout: Duration) -> ShutdownReport {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut report = ShutdownReport::default();

        for Worker { slot, mut handle } in self.workers {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_ok() {
                report.drained += 1;
                continue;
            }
            match slot.cancel() {
                Some(id) => {
                    warn!(id = %id, "Shutdown deadline passed, abandoning dispatch");
                    handle.abort();
                    let _ = handle.await;
                    report.abandoned.push(id);
                }
                None => {
                    debug!("Shutdown deadline passed during commit, waiting for it");
                    let _ = handle.await;
                }
            }
        }

        info!(
            drained = report.drained,
            abandoned = report.abandoned.len(),
            "Worker pool stopped"
        );
        report
    }
}

async fn run_worker(
    index: usize,
    slot: Arc<WorkerSlot>,
    dispatcher: Arc<Dispatcher>,
    inbound: Arc<tokio::sync::Mutex<mpsc::Receiver<Delivery>>>,
    mut stop: watch::Receiver<bool>,
) {
    debug!(worker = index, "Worker started");
    loop {
        if *stop.borrow() {
            break;
        }
        let delivery = {
            let mut inbound = inbound.lock().await;
            tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                    continue;
                }
                delivery = inbound.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            }
        };
        dispatcher.dispatch(delivery, &slot).await;
    }
    debug!(worker = index, "Worker stopped");
}
