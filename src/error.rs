//! Bus-level error taxonomy.
//!
//! Every module raises its own error type; they converge here so dispatch
//! can decide between retry, redelivery and dead-lettering from a single
//! `ErrorKind`. Only `Configuration` ever escapes to the caller of `build`,
//! `register_*` or `start`; all other kinds are contained in one envelope's
//! dispatch.

use std::fmt;

use crate::broker::BrokerError;
use crate::envelope::SagaId;
use crate::outbox::OutboxError;
use crate::saga::StoreError;
use crate::serialization::SerializationError;
use crate::tx::TxError;

/// Error returned by user handler and saga step code.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur while building or running a bus.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Broker error: {0}")]
    TransientBroker(#[from] BrokerError),

    #[error("Handler for '{message_type}' failed: {source}")]
    Handler {
        message_type: String,
        #[source]
        source: HandlerError,
    },

    #[error("Version conflict on saga {saga_id}: expected {expected}, found {actual:?}")]
    VersionConflict {
        saga_id: SagaId,
        expected: u64,
        actual: Option<u64>,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),
}

impl BusError {
    /// Wrap a user handler failure.
    pub fn handler(message_type: impl Into<String>, source: impl Into<HandlerError>) -> Self {
        Self::Handler {
            message_type: message_type.into(),
            source: source.into(),
        }
    }

    /// Classify a failure returned by user handler or saga step code. A
    /// payload that did not decode stays a serialization error so it is
    /// dead-lettered without retry.
    pub fn from_user(message_type: impl Into<String>, source: HandlerError) -> Self {
        match source.downcast::<SerializationError>() {
            Ok(err) => Self::Serialization(*err),
            Err(source) => Self::handler(message_type, source),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::TransientBroker(_) => ErrorKind::TransientBroker,
            Self::Handler { .. } => ErrorKind::Handler,
            Self::VersionConflict { .. } => ErrorKind::VersionConflict,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Serialization(_) => ErrorKind::Serialization,
        }
    }
}

impl From<StoreError> for BusError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::VersionConflict {
                saga_id,
                expected,
                actual,
            } => Self::VersionConflict {
                saga_id,
                expected,
                actual,
            },
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<TxError> for BusError {
    fn from(err: TxError) -> Self {
        match err {
            TxError::Conflict(store) => store.into(),
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<OutboxError> for BusError {
    fn from(err: OutboxError) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Classification of a `BusError`, recorded on dead letters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    TransientBroker,
    Handler,
    VersionConflict,
    Storage,
    Serialization,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::TransientBroker => "transient_broker",
            Self::Handler => "handler",
            Self::VersionConflict => "version_conflict",
            Self::Storage => "storage",
            Self::Serialization => "serialization",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "configuration" => Self::Configuration,
            "transient_broker" => Self::TransientBroker,
            "handler" => Self::Handler,
            "version_conflict" => Self::VersionConflict,
            "storage" => Self::Storage,
            "serialization" => Self::Serialization,
            _ => return None,
        })
    }

    /// Whether redelivering the same envelope can possibly succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Configuration | Self::Serialization)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
