//! Saga persistence.
//!
//! `SagaStore` loads and saves instances with optimistic versioning: `save`
//! succeeds only when the stored version equals the version the caller
//! loaded, and stores `expected + 1`. Every operation receives the unit of
//! work's transaction; transactional stores write through it, others ignore
//! it and are durable (or not) as soon as the call returns.

use async_trait::async_trait;

use crate::envelope::SagaId;
use crate::saga::SagaInstance;
use crate::tx::Transaction;

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::{InMemorySagaStore, TransactionalMemorySagaStore};
#[cfg(feature = "postgres")]
pub use postgres::PgSagaStore;

/// Errors raised by saga stores.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The stored version is not the one the caller loaded. `actual` is
    /// `None` when no instance is stored.
    #[error("Version conflict on saga {saga_id}: expected {expected}, found {actual:?}")]
    VersionConflict {
        saga_id: SagaId,
        expected: u64,
        actual: Option<u64>,
    },

    #[error("Storage error: {0}")]
    Storage(String),
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Check a stored version against the caller's expectation.
pub(crate) fn check_version(
    saga_id: SagaId,
    stored: Option<u64>,
    expected: u64,
) -> Result<(), StoreError> {
    if stored.unwrap_or(0) == expected {
        Ok(())
    } else {
        Err(StoreError::VersionConflict {
            saga_id,
            expected,
            actual: stored,
        })
    }
}

/// Storage for saga instances.
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Load an instance. Absence is `Ok(None)`, never an error.
    async fn get(
        &self,
        tx: &mut dyn Transaction,
        id: SagaId,
    ) -> Result<Option<SagaInstance>, StoreError>;

    /// Persist `instance` if the stored version equals `expected_version`
    /// (0 for an instance that was never saved). Returns the new version.
    ///
    /// `instance.version` is ignored; the stored version is always
    /// `expected_version + 1`.
    async fn save(
        &self,
        tx: &mut dyn Transaction,
        instance: &SagaInstance,
        expected_version: u64,
    ) -> Result<u64, StoreError>;

    /// Remove an instance. Removing an absent instance is not an error.
    async fn delete(&self, tx: &mut dyn Transaction, id: SagaId) -> Result<(), StoreError>;

    /// Active instances of `saga_type` started in the conversation
    /// `correlation_id`.
    async fn find_by_correlation(
        &self,
        tx: &mut dyn Transaction,
        saga_type: &str,
        correlation_id: &str,
    ) -> Result<Vec<SagaId>, StoreError>;

    /// Every active instance of `saga_type`.
    async fn list_active(
        &self,
        tx: &mut dyn Transaction,
        saga_type: &str,
    ) -> Result<Vec<SagaId>, StoreError>;
}

/// Ids of the instances matching `keep`, sorted.
pub(crate) fn select_ids<'a>(
    instances: impl Iterator<Item = &'a SagaInstance>,
    keep: impl Fn(&SagaInstance) -> bool,
) -> Vec<SagaId> {
    let mut ids: Vec<SagaId> = instances.filter(|i| keep(i)).map(|i| i.id).collect();
    ids.sort();
    ids
}
