//! Message envelope: the unit the broker delivers and the bus dispatches.
//!
//! An `Envelope` is immutable once received. The only field that changes
//! across redeliveries is `delivery_attempt`, which the broker increments.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Header carrying the queue the sender consumes from (reply target).
pub const HEADER_REPLY_TO: &str = "x-reply-to";
/// Header carrying the saga instance that emitted a message, so replies
/// can be routed back to it.
pub const HEADER_REPLY_TO_SAGA: &str = "x-reply-to-saga";
/// Header carrying the serializer used to encode the body.
pub const HEADER_CONTENT_TYPE: &str = "content-type";

/// Identity of a saga instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SagaId(Uuid);

impl SagaId {
    /// Allocate a fresh identity.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Parse from the textual form used in headers.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for SagaId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SagaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A message as carried by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique message id. Stable across redeliveries.
    pub id: Uuid,
    /// Correlation id shared by every message of one logical conversation.
    pub correlation_id: Option<String>,
    /// Saga instance this message is addressed to, if any.
    pub saga_id: Option<SagaId>,
    /// Message type name used for handler and saga routing.
    pub message_type: String,
    /// Encoded payload.
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
    /// 1 on first delivery, incremented by the broker on each redelivery.
    pub delivery_attempt: u32,
}

impl Envelope {
    /// Create a fresh envelope for a message type and encoded body.
    pub fn new(message_type: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            correlation_id: None,
            saga_id: None,
            message_type: message_type.into(),
            body,
            headers: HashMap::new(),
            delivery_attempt: 1,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_saga_id(mut self, saga_id: SagaId) -> Self {
        self.saga_id = Some(saga_id);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Queue of the service that sent this envelope.
    pub fn reply_to(&self) -> Option<&str> {
        self.header(HEADER_REPLY_TO)
    }

    /// Saga instance that emitted this envelope.
    pub fn reply_to_saga(&self) -> Option<SagaId> {
        self.header(HEADER_REPLY_TO_SAGA).and_then(SagaId::parse)
    }

    /// Number of deliveries that preceded this one, as known by the broker.
    pub fn prior_deliveries(&self) -> u32 {
        self.delivery_attempt.saturating_sub(1)
    }

    /// Copy of this envelope as the broker would redeliver it.
    pub fn redelivered(&self) -> Self {
        let mut next = self.clone();
        next.delivery_attempt = next.delivery_attempt.saturating_add(1);
        next
    }
}
