//! Per-instance exclusion.
//!
//! Workers run in parallel and pull from one shared queue, so two envelopes
//! for the same saga can be in flight at once. Before loading an instance a
//! worker takes the instance's lease and holds it until its unit of work has
//! committed or rolled back. Versioning still guards the store; the lease
//! keeps hot sagas from burning retries on conflicts.
//!
//! Entries exist only while some worker holds or waits for a lease, so the
//! map does not grow with the number of sagas ever seen.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::envelope::SagaId;

type Slot = Arc<AsyncMutex<()>>;

/// Lease table keyed by saga identity.
#[derive(Default)]
pub struct SagaLeases {
    slots: Arc<Mutex<HashMap<SagaId, Slot>>>,
}

impl SagaLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and take the lease of `saga_id`.
    pub async fn acquire(&self, saga_id: SagaId) -> LeaseGuard {
        let slot = {
            let mut slots = match self.slots.lock() {
                Ok(slots) => slots,
                Err(poisoned) => poisoned.into_inner(),
            };
            Arc::clone(slots.entry(saga_id).or_default())
        };

        let guard = Arc::clone(&slot).lock_owned().await;
        debug!(saga_id = %saga_id, "Saga lease acquired");

        LeaseGuard {
            saga_id,
            guard: Some(guard),
            slot: Some(slot),
            slots: Arc::clone(&self.slots),
        }
    }

    /// Number of instances currently leased or awaited.
    pub fn active(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or(0)
    }
}

/// Held lease. Dropping it releases the instance.
pub struct LeaseGuard {
    saga_id: SagaId,
    guard: Option<OwnedMutexGuard<()>>,
    slot: Option<Slot>,
    slots: Arc<Mutex<HashMap<SagaId, Slot>>>,
}

impl LeaseGuard {
    pub fn saga_id(&self) -> SagaId {
        self.saga_id
    }
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("saga_id", &self.saga_id)
            .finish()
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        // Release first so a waiter can proceed, then drop the table entry
        // if nobody else refers to it. Waiters hold a clone of the slot, so
        // the count check under the table lock is race free.
        drop(self.guard.take());
        let Some(slot) = self.slot.take() else {
            return;
        };
        let mut slots = match self.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        // One reference in the table, one in `slot`.
        if Arc::strong_count(&slot) == 2 {
            slots.remove(&self.saga_id);
        }
        debug!(saga_id = %self.saga_id, "Saga lease released");
    }
}
