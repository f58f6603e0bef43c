//! In-memory transactional provider.
//!
//! Participating stores stage their writes on the `MemoryTransaction` as a
//! check (optimistic-concurrency validation) plus an apply step. At commit
//! every check runs, then every apply, under a provider-wide commit lock, so
//! commits are atomic with respect to each other. Rollback (or drop) simply
//! discards the staged writes.

use std::any::Any;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use super::{Transaction, TransactionProvider, TxError, MEMORY_PROVIDER};

type Check = Box<dyn Fn() -> Result<(), TxError> + Send>;
type Apply = Box<dyn FnOnce() + Send>;

/// Provider of `MemoryTransaction`s.
#[derive(Default, Clone)]
pub struct MemoryTxProvider {
    commit_lock: Arc<Mutex<()>>,
}

impl MemoryTxProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionProvider for MemoryTxProvider {
    fn name(&self) -> &str {
        MEMORY_PROVIDER
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, TxError> {
        Ok(Box::new(MemoryTransaction {
            commit_lock: Arc::clone(&self.commit_lock),
            checks: Vec::new(),
            applies: Vec::new(),
        }))
    }
}

/// A staged set of writes.
pub struct MemoryTransaction {
    commit_lock: Arc<Mutex<()>>,
    checks: Vec<Check>,
    applies: Vec<Apply>,
}

impl MemoryTransaction {
    /// Stage a write. `check` runs at commit before any write is applied and
    /// aborts the commit when it fails.
    pub fn stage(
        &mut self,
        check: impl Fn() -> Result<(), TxError> + Send + 'static,
        apply: impl FnOnce() + Send + 'static,
    ) {
        self.checks.push(Box::new(check));
        self.applies.push(Box::new(apply));
    }

    /// Number of staged writes.
    pub fn staged(&self) -> usize {
        self.applies.len()
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn commit(self: Box<Self>) -> Result<(), TxError> {
        let this = *self;
        let _guard = this
            .commit_lock
            .lock()
            .map_err(|e| TxError::Commit(e.to_string()))?;

        for check in &this.checks {
            check()?;
        }
        let count = this.applies.len();
        for apply in this.applies {
            apply();
        }
        debug!(writes = count, "Memory transaction committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), TxError> {
        debug!(discarded = self.applies.len(), "Memory transaction rolled back");
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut (dyn Any + Send) {
        self
    }
}
