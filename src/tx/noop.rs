//! No-op provider used when the bus runs non-transactionally.

use std::any::Any;

use async_trait::async_trait;

use super::{Transaction, TransactionProvider, TxError};

/// Name reported by the no-op provider.
pub const NOOP_PROVIDER: &str = "noop";

/// Hands out transactions that commit nothing: every store write is
/// already durable (or not) by the time it returns.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTxProvider;

#[async_trait]
impl TransactionProvider for NoopTxProvider {
    fn name(&self) -> &str {
        NOOP_PROVIDER
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, TxError> {
        Ok(Box::new(NoopTransaction))
    }
}

#[derive(Debug, Default)]
pub struct NoopTransaction;

#[async_trait]
impl Transaction for NoopTransaction {
    async fn commit(self: Box<Self>) -> Result<(), TxError> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), TxError> {
        Ok(())
    }

    fn is_transactional(&self) -> bool {
        false
    }

    fn as_any_mut(&mut self) -> &mut (dyn Any + Send) {
        self
    }
}
