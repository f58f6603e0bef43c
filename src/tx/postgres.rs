//! PostgreSQL transactional provider.
//!
//! One `PgTransaction` wraps one `sqlx` transaction. The saga store and the
//! outbox of the same backend downcast to it and run their statements on its
//! connection, so saga state and staged outbound envelopes commit together.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool, Postgres};
use tracing::info;

use super::{Backend, Transaction, TransactionProvider, TxError, PG_PROVIDER};
use crate::error::{BusError, Result};
use crate::outbox::PgOutbox;
use crate::saga::PgSagaStore;

/// Provider of PostgreSQL transactions.
#[derive(Clone)]
pub struct PgTxProvider {
    pool: PgPool,
}

impl PgTxProvider {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TransactionProvider for PgTxProvider {
    fn name(&self) -> &str {
        PG_PROVIDER
    }

    async fn begin(&self) -> std::result::Result<Box<dyn Transaction>, TxError> {
        let inner = self
            .pool
            .begin()
            .await
            .map_err(|e| TxError::Begin(e.to_string()))?;
        Ok(Box::new(PgTransaction { inner }))
    }
}

/// An open PostgreSQL transaction.
pub struct PgTransaction {
    inner: sqlx::Transaction<'static, Postgres>,
}

impl PgTransaction {
    /// Connection to run statements on inside this transaction.
    pub fn connection(&mut self) -> &mut PgConnection {
        &mut *self.inner
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn commit(self: Box<Self>) -> std::result::Result<(), TxError> {
        self.inner
            .commit()
            .await
            .map_err(|e| TxError::Commit(e.to_string()))
    }

    async fn rollback(self: Box<Self>) -> std::result::Result<(), TxError> {
        self.inner
            .rollback()
            .await
            .map_err(|e| TxError::Rollback(e.to_string()))
    }

    fn as_any_mut(&mut self) -> &mut (dyn Any + Send) {
        self
    }
}

/// Find the `PgTransaction` behind a unit of work.
pub(crate) fn pg_connection(
    tx: &mut dyn Transaction,
) -> std::result::Result<&mut PgConnection, String> {
    tx.as_any_mut()
        .downcast_mut::<PgTransaction>()
        .map(PgTransaction::connection)
        .ok_or_else(|| "postgres store requires a postgres transaction".to_string())
}

/// Connect, create the service's tables and assemble the backend.
pub async fn connect_backend(connection_string: &str, service_name: &str) -> Result<Backend> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(connection_string)
        .await
        .map_err(|e| BusError::Configuration(format!("Failed to connect to postgres: {}", e)))?;

    let saga_store = PgSagaStore::new(service_name);
    saga_store
        .init(&pool)
        .await
        .map_err(|e| BusError::Configuration(format!("Failed to create saga table: {}", e)))?;

    let outbox = PgOutbox::new(pool.clone(), service_name);
    outbox
        .init()
        .await
        .map_err(|e| BusError::Configuration(format!("Failed to create outbox table: {}", e)))?;

    info!(service = %service_name, "PostgreSQL backend initialized");

    Ok(Backend {
        provider: Arc::new(PgTxProvider::new(pool)),
        saga_store: Arc::new(saga_store),
        outbox: Arc::new(outbox),
    })
}
