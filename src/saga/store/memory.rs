//! In-memory saga stores.
//!
//! `InMemorySagaStore` applies every write immediately and is used by
//! non-transactional buses. `TransactionalMemorySagaStore` stages writes on
//! a `MemoryTransaction` and applies them at commit, re-checking versions
//! under the provider's commit lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{check_version, select_ids, SagaStore, StoreError};
use crate::envelope::SagaId;
use crate::saga::SagaInstance;
use crate::tx::{MemoryTransaction, Transaction, TxError};

type Instances = Arc<Mutex<HashMap<SagaId, SagaInstance>>>;

fn lock(instances: &Instances) -> Result<MutexGuard<'_, HashMap<SagaId, SagaInstance>>, StoreError> {
    instances
        .lock()
        .map_err(|e| StoreError::Storage(format!("saga store lock poisoned: {}", e)))
}

/// Non-durable saga store guarded by a mutex.
#[derive(Default, Clone)]
pub struct InMemorySagaStore {
    instances: Instances,
}

impl InMemorySagaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored instances.
    pub fn len(&self) -> usize {
        self.instances.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn get(
        &self,
        _tx: &mut dyn Transaction,
        id: SagaId,
    ) -> Result<Option<SagaInstance>, StoreError> {
        Ok(lock(&self.instances)?.get(&id).cloned())
    }

    async fn save(
        &self,
        _tx: &mut dyn Transaction,
        instance: &SagaInstance,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let mut instances = lock(&self.instances)?;
        let stored = instances.get(&instance.id).map(|i| i.version);
        check_version(instance.id, stored, expected_version)?;

        let version = expected_version + 1;
        let mut saved = instance.clone();
        saved.version = version;
        instances.insert(instance.id, saved);
        Ok(version)
    }

    async fn delete(&self, _tx: &mut dyn Transaction, id: SagaId) -> Result<(), StoreError> {
        lock(&self.instances)?.remove(&id);
        Ok(())
    }

    async fn find_by_correlation(
        &self,
        _tx: &mut dyn Transaction,
        saga_type: &str,
        correlation_id: &str,
    ) -> Result<Vec<SagaId>, StoreError> {
        let instances = lock(&self.instances)?;
        Ok(select_ids(instances.values(), |i| {
            i.continues(saga_type, correlation_id)
        }))
    }

    async fn list_active(
        &self,
        _tx: &mut dyn Transaction,
        saga_type: &str,
    ) -> Result<Vec<SagaId>, StoreError> {
        let instances = lock(&self.instances)?;
        Ok(select_ids(instances.values(), |i| {
            i.saga_type == saga_type && !i.status.is_terminal()
        }))
    }
}

/// In-memory saga store participating in `MemoryTransaction`s.
///
/// Reads see committed state only. Saves are checked eagerly (so a stale
/// writer fails fast) and again at commit.
#[derive(Default, Clone)]
pub struct TransactionalMemorySagaStore {
    instances: Instances,
}

impl TransactionalMemorySagaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed snapshot of an instance, outside any transaction.
    pub fn committed(&self, id: SagaId) -> Option<SagaInstance> {
        self.instances
            .lock()
            .ok()
            .and_then(|m| m.get(&id).cloned())
    }

    fn memory_tx(tx: &mut dyn Transaction) -> Result<&mut MemoryTransaction, StoreError> {
        tx.as_any_mut()
            .downcast_mut::<MemoryTransaction>()
            .ok_or_else(|| {
                StoreError::Storage(
                    "transactional memory store requires a memory transaction".to_string(),
                )
            })
    }
}

#[async_trait]
impl SagaStore for TransactionalMemorySagaStore {
    async fn get(
        &self,
        _tx: &mut dyn Transaction,
        id: SagaId,
    ) -> Result<Option<SagaInstance>, StoreError> {
        Ok(lock(&self.instances)?.get(&id).cloned())
    }

    async fn save(
        &self,
        tx: &mut dyn Transaction,
        instance: &SagaInstance,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let stored = lock(&self.instances)?.get(&instance.id).map(|i| i.version);
        check_version(instance.id, stored, expected_version)?;

        let version = expected_version + 1;
        let mut saved = instance.clone();
        saved.version = version;
        let saga_id = instance.id;

        let for_check = Arc::clone(&self.instances);
        let for_apply = Arc::clone(&self.instances);
        Self::memory_tx(tx)?.stage(
            move || {
                let stored = for_check
                    .lock()
                    .map_err(|e| TxError::Commit(e.to_string()))?
                    .get(&saga_id)
                    .map(|i| i.version);
                check_version(saga_id, stored, expected_version).map_err(TxError::Conflict)
            },
            move || {
                if let Ok(mut instances) = for_apply.lock() {
                    instances.insert(saga_id, saved);
                }
            },
        );
        Ok(version)
    }

    async fn delete(&self, tx: &mut dyn Transaction, id: SagaId) -> Result<(), StoreError> {
        let instances = Arc::clone(&self.instances);
        Self::memory_tx(tx)?.stage(
            || Ok(()),
            move || {
                if let Ok(mut instances) = instances.lock() {
                    instances.remove(&id);
                }
            },
        );
        Ok(())
    }

    async fn find_by_correlation(
        &self,
        _tx: &mut dyn Transaction,
        saga_type: &str,
        correlation_id: &str,
    ) -> Result<Vec<SagaId>, StoreError> {
        let instances = lock(&self.instances)?;
        Ok(select_ids(instances.values(), |i| {
            i.continues(saga_type, correlation_id)
        }))
    }

    async fn list_active(
        &self,
        _tx: &mut dyn Transaction,
        saga_type: &str,
    ) -> Result<Vec<SagaId>, StoreError> {
        let instances = lock(&self.instances)?;
        Ok(select_ids(instances.values(), |i| {
            i.saga_type == saga_type && !i.status.is_terminal()
        }))
    }
}
