//! Unit-of-work transactions.
//!
//! A `TransactionProvider` hands out one `Transaction` per dispatched
//! envelope. Saga state writes and outbox staging happen inside it, so the
//! whole dispatch becomes visible at commit or not at all.
//!
//! Providers are looked up by name in a `ProviderRegistry`. Each entry is a
//! `BackendFactory` producing the provider together with the saga store and
//! outbox that participate in its transactions:
//!
//! | Name | Transactions | Saga store | Outbox |
//! |------|--------------|------------|--------|
//! | *(none)* | no-op | in-memory | none |
//! | `memory` | staged, applied at commit | transactional in-memory | in-memory |
//! | `pg` | PostgreSQL (`postgres` feature) | table per service | table per service |

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::{BusError, Result};
use crate::outbox::{MemoryOutbox, NoopOutbox, Outbox};
use crate::saga::{InMemorySagaStore, SagaStore, StoreError, TransactionalMemorySagaStore};

pub mod memory;
pub mod noop;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::{MemoryTransaction, MemoryTxProvider};
pub use noop::{NoopTransaction, NoopTxProvider};
#[cfg(feature = "postgres")]
pub use postgres::{PgTransaction, PgTxProvider};

/// Name of the in-memory transactional provider.
pub const MEMORY_PROVIDER: &str = "memory";
/// Name of the PostgreSQL provider.
pub const PG_PROVIDER: &str = "pg";

/// Errors raised by transaction providers.
#[derive(Debug, thiserror::Error)]
pub enum TxError {
    #[error("Failed to begin transaction: {0}")]
    Begin(String),

    #[error("Failed to commit transaction: {0}")]
    Commit(String),

    #[error("Failed to roll back transaction: {0}")]
    Rollback(String),

    /// A write staged in the transaction lost an optimistic-concurrency race
    /// at commit time.
    #[error("Commit conflict: {0}")]
    Conflict(StoreError),
}

/// One unit of work.
#[async_trait]
pub trait Transaction: Send {
    async fn commit(self: Box<Self>) -> std::result::Result<(), TxError>;

    async fn rollback(self: Box<Self>) -> std::result::Result<(), TxError>;

    /// False for the no-op transaction: each write is independently durable.
    fn is_transactional(&self) -> bool {
        true
    }

    /// Access to the concrete transaction for stores that participate in it.
    fn as_any_mut(&mut self) -> &mut (dyn Any + Send);
}

/// Capability producing transactions.
#[async_trait]
pub trait TransactionProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn begin(&self) -> std::result::Result<Box<dyn Transaction>, TxError>;
}

/// Everything that shares one transaction boundary.
#[derive(Clone)]
pub struct Backend {
    pub provider: Arc<dyn TransactionProvider>,
    pub saga_store: Arc<dyn SagaStore>,
    pub outbox: Arc<dyn Outbox>,
}

impl Backend {
    /// Non-transactional backend: no-op transactions and an in-memory saga
    /// store. Each step is committed independently (at-least-once with
    /// possibly duplicated side effects).
    pub fn non_transactional() -> Self {
        Self {
            provider: Arc::new(NoopTxProvider),
            saga_store: Arc::new(InMemorySagaStore::new()),
            outbox: Arc::new(NoopOutbox),
        }
    }

    pub fn is_transactional(&self) -> bool {
        self.provider.name() != noop::NOOP_PROVIDER
    }
}

/// Factory for a named transactional backend.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    /// Connect and prepare the backend for `service_name`.
    ///
    /// Failures are configuration failures: a bus is never built around a
    /// backend that could not be set up.
    async fn connect(&self, connection_string: &str, service_name: &str) -> Result<Backend>;
}

/// Registration table: provider name → backend factory.
#[derive(Clone)]
pub struct ProviderRegistry {
    factories: HashMap<String, Arc<dyn BackendFactory>>,
}

impl ProviderRegistry {
    /// Registry with no providers.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Add or replace a provider.
    pub fn register(&mut self, name: impl Into<String>, factory: Arc<dyn BackendFactory>) {
        self.factories.insert(name.into(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Build the backend for a provider name.
    pub async fn connect(
        &self,
        name: &str,
        connection_string: &str,
        service_name: &str,
    ) -> Result<Backend> {
        let factory = self.factories.get(name).ok_or_else(|| {
            BusError::Configuration(format!(
                "No transaction provider registered for '{}'",
                name
            ))
        })?;
        let backend = factory.connect(connection_string, service_name).await?;
        info!(provider = %name, service = %service_name, "Transactional backend connected");
        Ok(backend)
    }
}

impl Default for ProviderRegistry {
    /// Registry with the built-in providers.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(MEMORY_PROVIDER, Arc::new(MemoryBackendFactory));
        registry.register(PG_PROVIDER, Arc::new(PgBackendFactory));
        registry
    }
}

/// Factory for the in-memory transactional backend. Ignores the
/// connection string.
pub struct MemoryBackendFactory;

#[async_trait]
impl BackendFactory for MemoryBackendFactory {
    async fn connect(&self, _connection_string: &str, _service_name: &str) -> Result<Backend> {
        let provider = Arc::new(MemoryTxProvider::new());
        Ok(Backend {
            provider,
            saga_store: Arc::new(TransactionalMemorySagaStore::new()),
            outbox: Arc::new(MemoryOutbox::new()),
        })
    }
}

/// Factory for the PostgreSQL backend.
pub struct PgBackendFactory;

#[async_trait]
impl BackendFactory for PgBackendFactory {
    #[cfg(feature = "postgres")]
    async fn connect(&self, connection_string: &str, service_name: &str) -> Result<Backend> {
        postgres::connect_backend(connection_string, service_name).await
    }

    #[cfg(not(feature = "postgres"))]
    async fn connect(&self, _connection_string: &str, _service_name: &str) -> Result<Backend> {
        Err(BusError::Configuration(
            "The 'pg' provider requires the 'postgres' feature. Rebuild with --features postgres"
                .to_string(),
        ))
    }
}
