//! Persisted saga state.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::envelope::SagaId;

/// Lifecycle state of a saga instance.
///
/// ```text
///            step / on_timeout
///   Active ─────────────────────┬──► Completed
///     ▲  │                      ├──► Aborted
///     └──┘                      └──► TimedOut
/// ```
///
/// Only `Active` instances accept further steps; the others are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SagaStatus {
    Active,
    Completed,
    TimedOut,
    Aborted,
}

impl SagaStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "active" => Self::Active,
            "completed" => Self::Completed,
            "timed_out" => Self::TimedOut,
            "aborted" => Self::Aborted,
            _ => return None,
        })
    }
}

impl fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A saga instance as stored.
///
/// `version` is 0 for an instance that has never been saved; every
/// successful save stores `expected + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaInstance {
    pub id: SagaId,
    pub saga_type: String,
    /// State encoded with the bus serializer.
    pub state: Vec<u8>,
    pub version: u64,
    pub status: SagaStatus,
    /// Correlation id of the message that started the instance. Messages
    /// of the same conversation that carry no saga id are routed by it.
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl SagaInstance {
    /// A fresh, never-saved instance.
    pub fn new(id: SagaId, saga_type: impl Into<String>, state: Vec<u8>) -> Self {
        Self {
            id,
            saga_type: saga_type.into(),
            state,
            version: 0,
            status: SagaStatus::Active,
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Whether this instance is active and belongs to the conversation
    /// `correlation_id`.
    pub fn continues(&self, saga_type: &str, correlation_id: &str) -> bool {
        self.saga_type == saga_type
            && !self.status.is_terminal()
            && self.correlation_id.as_deref() == Some(correlation_id)
    }

    pub fn is_new(&self) -> bool {
        self.version == 0
    }
}
