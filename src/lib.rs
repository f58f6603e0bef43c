//! Relaybus - transactional message dispatch and saga orchestration
//!
//! A message bus for services talking over an at-least-once broker. Each
//! inbound envelope is processed as one unit of work: handlers, saga state
//! changes and outbound messages commit or roll back together, and the
//! broker acknowledgement follows the commit.

pub mod broker;
pub mod bus;
pub mod config;
pub mod dlq;
pub mod emit;
pub mod envelope;
pub mod error;
pub mod outbox;
pub mod registry;
pub mod saga;
pub mod serialization;
pub mod tx;
pub mod unit_of_work;
pub mod utils;

pub use broker::{Broker, BrokerError, Delivery, MemoryBroker, Outgoing};
pub use bus::{MessageBus, ShutdownReport};
pub use config::{BusConfig, ConflictRetryConfig, TransactionalConfig};
pub use dlq::DeadLetter;
pub use envelope::{Envelope, SagaId};
pub use error::{BusError, ErrorKind, HandlerError, Result};
pub use registry::{Handler, Invocation};
pub use saga::{FinalizePolicy, Saga, SagaInstance, SagaStatus, SagaStore, StepContext};
pub use serialization::Message;
pub use tx::{BackendFactory, ProviderRegistry};
