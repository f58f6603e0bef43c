//! Transactional outbox.
//!
//! Outbound envelopes produced during a dispatch are written into the same
//! transaction as the saga state they belong to. The flow:
//!
//! 1. Stage outbound envelopes in the outbox (inside the unit of work)
//! 2. Commit, then acknowledge the inbound envelope
//! 3. Publish each envelope to the broker
//! 4. Mark published envelopes as sent
//!
//! If the process dies between 2 and 4, the envelopes stay pending and are
//! re-published by `MessageBus::start` before consumption begins. Consumers
//! therefore see at-least-once delivery of outbound messages, never a
//! message for work that was rolled back.
//!
//! Non-transactional buses use `NoopOutbox` and publish straight after the
//! (no-op) commit.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use crate::broker::Outgoing;
use crate::tx::{MemoryTransaction, Transaction};

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "postgres")]
pub use postgres::PgOutbox;

/// Errors that can occur during outbox operations.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("Outbox storage failed: {0}")]
    Storage(String),

    #[error("Outbox requires a {expected} transaction")]
    WrongTransaction { expected: &'static str },
}

/// Durable staging area for outbound envelopes.
#[async_trait]
pub trait Outbox: Send + Sync {
    /// Record envelopes as part of the transaction.
    async fn stage(
        &self,
        tx: &mut dyn Transaction,
        messages: &[Outgoing],
    ) -> Result<(), OutboxError>;

    /// Forget envelopes that reached the broker.
    async fn mark_sent(&self, ids: &[Uuid]) -> Result<(), OutboxError>;

    /// Committed envelopes not yet marked sent, oldest first.
    async fn pending(&self) -> Result<Vec<Outgoing>, OutboxError>;

    /// False when staging is a no-op.
    fn is_durable(&self) -> bool {
        true
    }
}

/// Outbox for non-transactional buses.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopOutbox;

#[async_trait]
impl Outbox for NoopOutbox {
    async fn stage(
        &self,
        _tx: &mut dyn Transaction,
        _messages: &[Outgoing],
    ) -> Result<(), OutboxError> {
        Ok(())
    }

    async fn mark_sent(&self, _ids: &[Uuid]) -> Result<(), OutboxError> {
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<Outgoing>, OutboxError> {
        Ok(Vec::new())
    }

    fn is_durable(&self) -> bool {
        false
    }
}

/// Outbox participating in `MemoryTransaction`s.
#[derive(Default, Clone)]
pub struct MemoryOutbox {
    entries: Arc<Mutex<Vec<Outgoing>>>,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Outbox for MemoryOutbox {
    async fn stage(
        &self,
        tx: &mut dyn Transaction,
        messages: &[Outgoing],
    ) -> Result<(), OutboxError> {
        if messages.is_empty() {
            return Ok(());
        }
        let tx = tx
            .as_any_mut()
            .downcast_mut::<MemoryTransaction>()
            .ok_or(OutboxError::WrongTransaction { expected: "memory" })?;

        let entries = Arc::clone(&self.entries);
        let staged = messages.to_vec();
        tx.stage(
            || Ok(()),
            move || {
                if let Ok(mut entries) = entries.lock() {
                    entries.extend(staged);
                }
            },
        );
        Ok(())
    }

    async fn mark_sent(&self, ids: &[Uuid]) -> Result<(), OutboxError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| OutboxError::Storage(e.to_string()))?;
        entries.retain(|o| !ids.contains(&o.envelope.id));
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<Outgoing>, OutboxError> {
        let entries = self
            .entries
            .lock()
            .map_err(|e| OutboxError::Storage(e.to_string()))?;
        Ok(entries.clone())
    }
}
