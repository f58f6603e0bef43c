//! Broker boundary.
//!
//! The bus treats the broker as a black box offering:
//! - `publish(exchange, routing_key, envelope)`
//! - `consume(queue)` → stream of deliveries, each acked or nacked
//! - queue/binding management (`declare_queue`, `bind`, `unbind`, `purge`)
//! - a channel of connection-level errors, observed to trigger re-subscribe
//!
//! Routing follows AMQP conventions: the default exchange (`""`) routes by
//! queue name; any other exchange routes to every queue bound with the
//! message's routing key.
//!
//! Implementations:
//! - `MemoryBroker`: in-process reference broker for tests and embedding

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::envelope::Envelope;

pub mod memory;

pub use memory::MemoryBroker;

/// The default exchange: routing key is the destination queue name.
pub const DEFAULT_EXCHANGE: &str = "";

/// Errors that can occur during broker operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Acknowledgement failed: {0}")]
    Ack(String),

    #[error("Unknown queue: {0}")]
    UnknownQueue(String),
}

/// An envelope on its way out, with its broker address.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub exchange: String,
    pub routing_key: String,
    pub envelope: Envelope,
    /// Hold the message back for this long before routing it.
    pub deliver_after: Option<Duration>,
}

impl Outgoing {
    /// Address an envelope directly to a queue.
    pub fn to_queue(queue: impl Into<String>, envelope: Envelope) -> Self {
        Self {
            exchange: DEFAULT_EXCHANGE.to_string(),
            routing_key: queue.into(),
            envelope,
            deliver_after: None,
        }
    }

    /// Publish an envelope on a topic exchange.
    pub fn to_topic(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        envelope: Envelope,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            envelope,
            deliver_after: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.deliver_after = Some(delay);
        self
    }
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send {
    /// Remove the message from the queue.
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;

    /// Return the message to the queue for redelivery.
    async fn nack(self: Box<Self>) -> Result<(), BrokerError>;
}

/// A received envelope awaiting acknowledgement.
///
/// Dropping a delivery without settling it leaves the message with the
/// broker, which redelivers it.
pub struct Delivery {
    envelope: Envelope,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(envelope: Envelope, acker: Box<dyn Acknowledger>) -> Self {
        Self { envelope, acker }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    pub async fn nack(self) -> Result<(), BrokerError> {
        self.acker.nack().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .finish_non_exhaustive()
    }
}

/// Interface to the message broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Create the queue if it does not exist.
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError>;

    async fn bind(&self, queue: &str, exchange: &str, routing_key: &str)
        -> Result<(), BrokerError>;

    async fn unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Discard every message waiting in the queue. Returns how many were
    /// discarded.
    async fn purge(&self, queue: &str) -> Result<usize, BrokerError>;

    async fn publish(&self, outgoing: Outgoing) -> Result<(), BrokerError>;

    /// Start consuming a queue. The stream ends when the connection drops.
    async fn consume(&self, queue: &str) -> Result<mpsc::UnboundedReceiver<Delivery>, BrokerError>;

    /// Connection-level errors.
    fn connection_errors(&self) -> broadcast::Receiver<BrokerError>;
}
