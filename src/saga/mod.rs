//! Saga orchestration.
//!
//! A saga type is a small state machine over `SagaStatus`. It declares the
//! message types that start an instance and those that continue one, and
//! provides the step logic. The engine (`SagaGlue`) only resolves, leases,
//! loads, saves and finalizes instances; business rules live in the saga.
//!
//! Timeouts are ordinary envelopes: `StepContext::request_timeout` emits a
//! delayed `relaybus.saga.timeout` envelope addressed to the instance, and
//! its delivery runs `Saga::on_timeout`.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::broker::Outgoing;
use crate::emit::Emitter;
use crate::envelope::{Envelope, SagaId};
use crate::error::{BusError, HandlerError, Result};
use crate::serialization::{self, Message, SerializationError};

pub mod glue;
pub mod instance;
pub mod lease;
pub mod store;
pub mod subscriptions;

pub use glue::SagaGlue;
pub use instance::{SagaInstance, SagaStatus};
pub use lease::{LeaseGuard, SagaLeases};
#[cfg(feature = "postgres")]
pub use store::PgSagaStore;
pub use store::{InMemorySagaStore, SagaStore, StoreError, TransactionalMemorySagaStore};
pub use subscriptions::{DelayedSubscriptions, SubscriptionChange};

/// Message type of self-addressed timeout envelopes.
pub const TIMEOUT_MESSAGE_TYPE: &str = "relaybus.saga.timeout";

/// What happens to an instance once it reaches a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FinalizePolicy {
    /// Remove the instance from the store.
    #[default]
    Delete,
    /// Keep the instance, saved with its terminal status.
    Archive,
}

/// A saga type.
pub trait Saga: Send + Sync + 'static {
    type State: Serialize + DeserializeOwned + Default + Send;

    /// Stable name, stored with every instance.
    fn saga_type(&self) -> &str;

    /// Message types that create a new instance when no instance is
    /// addressed.
    fn starters(&self) -> &[&'static str];

    /// Message types accepted by an existing instance. Their subscriptions
    /// are active only while some instance is active.
    fn continuations(&self) -> &[&'static str];

    /// Apply one inbound message to the state and return the new status.
    fn handle(
        &self,
        ctx: &mut StepContext<'_>,
        state: &mut Self::State,
    ) -> std::result::Result<SagaStatus, HandlerError>;

    /// Called when a requested timeout fires on an active instance.
    fn on_timeout(
        &self,
        _ctx: &mut StepContext<'_>,
        _state: &mut Self::State,
    ) -> std::result::Result<SagaStatus, HandlerError> {
        Ok(SagaStatus::TimedOut)
    }

    fn finalize_policy(&self) -> FinalizePolicy {
        FinalizePolicy::Delete
    }
}

/// Context of one saga step.
pub struct StepContext<'a> {
    saga_id: SagaId,
    is_new: bool,
    emitter: Emitter<'a>,
}

impl<'a> StepContext<'a> {
    pub(crate) fn new(saga_id: SagaId, is_new: bool, emitter: Emitter<'a>) -> Self {
        Self {
            saga_id,
            is_new,
            emitter,
        }
    }

    pub fn saga_id(&self) -> SagaId {
        self.saga_id
    }

    /// True on the step that creates the instance.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn envelope(&self) -> &Envelope {
        self.emitter.inbound()
    }

    pub fn message_type(&self) -> &str {
        &self.envelope().message_type
    }

    /// Whether the inbound message is an `M`.
    pub fn is<M: Message>(&self) -> bool {
        self.message_type() == M::MESSAGE_TYPE
    }

    pub fn decode<M: Message>(&self) -> std::result::Result<M, SerializationError> {
        self.emitter.routing().decode(self.envelope())
    }

    pub fn send<M: Message>(&mut self, queue: &str, message: &M) -> Result<Uuid> {
        self.emitter.send(queue, message)
    }

    pub fn publish<M: Message>(&mut self, message: &M) -> Result<Uuid> {
        self.emitter.publish(message)
    }

    pub fn reply<M: Message>(&mut self, message: &M) -> Result<Uuid> {
        self.emitter.reply(message)
    }

    /// Schedule a timeout for this instance. It is delivered back through
    /// the service queue after `after`, once this step commits.
    pub fn request_timeout(&mut self, after: Duration) -> Uuid {
        let routing = self.emitter.routing();
        let envelope = routing
            .envelope(
                TIMEOUT_MESSAGE_TYPE,
                Vec::new(),
                Some(self.emitter.correlation_id()),
                self.emitter.saga_id(),
            )
            .with_saga_id(self.saga_id);
        let outgoing = Outgoing::to_queue(routing.queue.clone(), envelope).with_delay(after);
        self.emitter.push(outgoing)
    }
}

/// Object-safe view of a `Saga`, with state encoding handled.
pub(crate) trait DynSaga: Send + Sync {
    fn saga_type(&self) -> &str;

    fn starters(&self) -> &[&'static str];

    fn continuations(&self) -> &[&'static str];

    fn finalize_policy(&self) -> FinalizePolicy;

    fn starts_with(&self, message_type: &str) -> bool {
        self.starters().iter().any(|t| *t == message_type)
    }

    fn accepts(&self, message_type: &str) -> bool {
        self.starts_with(message_type) || self.continuations().iter().any(|t| *t == message_type)
    }

    /// Run one step on encoded state; returns the new encoded state and
    /// status.
    fn step(
        &self,
        ctx: &mut StepContext<'_>,
        state: Option<&[u8]>,
        timeout: bool,
    ) -> Result<(Vec<u8>, SagaStatus)>;
}

pub(crate) struct SagaAdapter<S>(pub S);

impl<S: Saga> DynSaga for SagaAdapter<S> {
    fn saga_type(&self) -> &str {
        self.0.saga_type()
    }

    fn starters(&self) -> &[&'static str] {
        self.0.starters()
    }

    fn continuations(&self) -> &[&'static str] {
        self.0.continuations()
    }

    fn finalize_policy(&self) -> FinalizePolicy {
        self.0.finalize_policy()
    }

    fn step(
        &self,
        ctx: &mut StepContext<'_>,
        state: Option<&[u8]>,
        timeout: bool,
    ) -> Result<(Vec<u8>, SagaStatus)> {
        let saga_type = self.0.saga_type().to_string();
        let serializer = std::sync::Arc::clone(&ctx.emitter.routing().serializer);

        let mut decoded: S::State = match state {
            Some(bytes) => serialization::decode_value(serializer.as_ref(), &saga_type, bytes)?,
            None => S::State::default(),
        };

        let status = if timeout {
            self.0.on_timeout(ctx, &mut decoded)
        } else {
            self.0.handle(ctx, &mut decoded)
        }
        .map_err(|e| BusError::from_user(ctx.message_type(), e))?;

        let encoded = serialization::encode_value(serializer.as_ref(), &saga_type, &decoded)?;
        Ok((encoded, status))
    }
}

#[cfg(test)]
mod tests;
