//! Outbound message construction.
//!
//! Handlers and saga steps never publish directly. They push `Outgoing`
//! entries into the unit of work's buffer, which is staged in the outbox and
//! published only after commit.
//!
//! Addressing:
//! - `send`: default exchange, routed by destination queue name
//! - `publish`: events exchange, routed by message type
//! - `reply`: the sender's queue (`x-reply-to`), addressed to the sender's
//!   saga instance (`x-reply-to-saga`) if it had one

use std::sync::Arc;

use uuid::Uuid;

use crate::broker::Outgoing;
use crate::envelope::{
    Envelope, SagaId, HEADER_CONTENT_TYPE, HEADER_REPLY_TO, HEADER_REPLY_TO_SAGA,
};
use crate::error::{BusError, Result};
use crate::serialization::{self, Message, SerializationError, Serializer};

/// Per-bus addressing and codec settings.
pub struct Routing {
    /// Queue this service consumes from; the reply address of everything
    /// it emits.
    pub queue: String,
    pub events_exchange: String,
    pub serializer: Arc<dyn Serializer>,
}

impl Routing {
    pub fn new(
        queue: impl Into<String>,
        events_exchange: impl Into<String>,
        serializer: Arc<dyn Serializer>,
    ) -> Self {
        Self {
            queue: queue.into(),
            events_exchange: events_exchange.into(),
            serializer,
        }
    }

    /// Build an envelope stamped with this service's reply address.
    pub fn envelope(
        &self,
        message_type: &str,
        body: Vec<u8>,
        correlation_id: Option<String>,
        from_saga: Option<SagaId>,
    ) -> Envelope {
        let mut envelope = Envelope::new(message_type, body)
            .with_header(HEADER_REPLY_TO, self.queue.clone())
            .with_header(HEADER_CONTENT_TYPE, self.serializer.name());
        envelope.correlation_id = Some(correlation_id.unwrap_or_else(|| envelope.id.to_string()));
        if let Some(saga_id) = from_saga {
            envelope = envelope.with_header(HEADER_REPLY_TO_SAGA, saga_id.to_string());
        }
        envelope
    }

    pub fn encode<M: Message>(&self, message: &M) -> std::result::Result<Vec<u8>, SerializationError> {
        serialization::encode(self.serializer.as_ref(), message)
    }

    pub fn decode<M: Message>(&self, envelope: &Envelope) -> std::result::Result<M, SerializationError> {
        serialization::decode(self.serializer.as_ref(), &envelope.body)
    }

    /// Addressed to a queue through the default exchange.
    pub fn send_to<M: Message>(
        &self,
        queue: &str,
        message: &M,
        correlation_id: Option<String>,
        from_saga: Option<SagaId>,
    ) -> Result<Outgoing> {
        let body = self.encode(message)?;
        let envelope = self.envelope(M::MESSAGE_TYPE, body, correlation_id, from_saga);
        Ok(Outgoing::to_queue(queue, envelope))
    }

    /// Published on the events exchange under the message type.
    pub fn publish<M: Message>(
        &self,
        message: &M,
        correlation_id: Option<String>,
        from_saga: Option<SagaId>,
    ) -> Result<Outgoing> {
        let body = self.encode(message)?;
        let envelope = self.envelope(M::MESSAGE_TYPE, body, correlation_id, from_saga);
        Ok(Outgoing::to_topic(
            self.events_exchange.clone(),
            M::MESSAGE_TYPE,
            envelope,
        ))
    }
}

/// Outbound buffer of one dispatch, bound to the inbound envelope.
pub struct Emitter<'a> {
    routing: &'a Routing,
    inbound: &'a Envelope,
    saga_id: Option<SagaId>,
    outbound: &'a mut Vec<Outgoing>,
}

impl<'a> Emitter<'a> {
    pub(crate) fn new(
        routing: &'a Routing,
        inbound: &'a Envelope,
        saga_id: Option<SagaId>,
        outbound: &'a mut Vec<Outgoing>,
    ) -> Self {
        Self {
            routing,
            inbound,
            saga_id,
            outbound,
        }
    }

    /// Correlation id inherited from the inbound envelope, or the inbound id
    /// when it started the conversation.
    pub fn correlation_id(&self) -> String {
        self.inbound
            .correlation_id
            .clone()
            .unwrap_or_else(|| self.inbound.id.to_string())
    }

    /// Send to another service's queue.
    pub fn send<M: Message>(&mut self, queue: &str, message: &M) -> Result<Uuid> {
        let outgoing =
            self.routing
                .send_to(queue, message, Some(self.correlation_id()), self.saga_id)?;
        Ok(self.push(outgoing))
    }

    /// Publish an event to every subscribed service.
    pub fn publish<M: Message>(&mut self, message: &M) -> Result<Uuid> {
        let outgoing = self
            .routing
            .publish(message, Some(self.correlation_id()), self.saga_id)?;
        Ok(self.push(outgoing))
    }

    /// Reply to the sender of the inbound envelope. The reply is addressed
    /// to the sender's saga instance when it came from one.
    pub fn reply<M: Message>(&mut self, message: &M) -> Result<Uuid> {
        let Some(queue) = self.inbound.reply_to() else {
            return Err(BusError::handler(
                M::MESSAGE_TYPE,
                format!("envelope {} carries no reply address", self.inbound.id),
            ));
        };
        let mut outgoing =
            self.routing
                .send_to(queue, message, Some(self.correlation_id()), self.saga_id)?;
        outgoing.envelope.saga_id = self.inbound.reply_to_saga();
        Ok(self.push(outgoing))
    }

    /// Queue an already addressed envelope.
    pub fn push(&mut self, outgoing: Outgoing) -> Uuid {
        let id = outgoing.envelope.id;
        self.outbound.push(outgoing);
        id
    }

    pub(crate) fn routing(&self) -> &Routing {
        self.routing
    }

    pub(crate) fn saga_id(&self) -> Option<SagaId> {
        self.saga_id
    }

    pub(crate) fn inbound(&self) -> &Envelope {
        self.inbound
    }
}
