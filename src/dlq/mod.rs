//! Dead letter records.
//!
//! An envelope that exhausts its retries (or cannot be decoded) is copied to
//! the configured dead-letter queue with headers recording why:
//!
//! | Header | Content |
//! |--------|---------|
//! | `x-dead-letter-kind` | `ErrorKind` of the last failure |
//! | `x-dead-letter-reason` | error message of the last failure |
//! | `x-dead-letter-attempts` | failed deliveries before dead-lettering |
//! | `x-original-queue` | queue the envelope was consumed from |
//! | `x-dead-lettered-at` | RFC 3339 timestamp |
//!
//! The envelope id, type, body and correlation are kept, so an operator can
//! inspect a dead letter with `DeadLetter::from_envelope` and replay it by
//! sending the envelope back to its original queue.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::broker::Outgoing;
use crate::envelope::Envelope;
use crate::error::ErrorKind;

pub const HEADER_DEAD_LETTER_KIND: &str = "x-dead-letter-kind";
pub const HEADER_DEAD_LETTER_REASON: &str = "x-dead-letter-reason";
pub const HEADER_DEAD_LETTER_ATTEMPTS: &str = "x-dead-letter-attempts";
pub const HEADER_ORIGINAL_QUEUE: &str = "x-original-queue";
pub const HEADER_DEAD_LETTERED_AT: &str = "x-dead-lettered-at";

/// Errors that can occur while reading a dead letter.
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("Envelope {0} is not a dead letter")]
    NotDeadLettered(Uuid),

    #[error("Invalid dead letter header {header}: {value}")]
    InvalidHeader { header: &'static str, value: String },
}

/// Why and when an envelope was dead-lettered.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub envelope_id: Uuid,
    pub message_type: String,
    pub kind: ErrorKind,
    pub reason: String,
    pub attempts: u32,
    pub original_queue: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Record for an envelope failing now.
    pub fn new(
        envelope: &Envelope,
        kind: ErrorKind,
        reason: impl Into<String>,
        attempts: u32,
        original_queue: impl Into<String>,
    ) -> Self {
        Self {
            envelope_id: envelope.id,
            message_type: envelope.message_type.clone(),
            kind,
            reason: reason.into(),
            attempts,
            original_queue: original_queue.into(),
            dead_lettered_at: Utc::now(),
        }
    }

    /// Copy of `envelope` carrying this record, addressed to `queue`.
    pub fn to_outgoing(&self, queue: &str, envelope: &Envelope) -> Outgoing {
        let mut dead = envelope.clone();
        dead.delivery_attempt = 1;
        dead.headers
            .insert(HEADER_DEAD_LETTER_KIND.to_string(), self.kind.as_str().to_string());
        dead.headers
            .insert(HEADER_DEAD_LETTER_REASON.to_string(), self.reason.clone());
        dead.headers
            .insert(HEADER_DEAD_LETTER_ATTEMPTS.to_string(), self.attempts.to_string());
        dead.headers
            .insert(HEADER_ORIGINAL_QUEUE.to_string(), self.original_queue.clone());
        dead.headers.insert(
            HEADER_DEAD_LETTERED_AT.to_string(),
            self.dead_lettered_at.to_rfc3339(),
        );
        Outgoing::to_queue(queue, dead)
    }

    /// Read the record carried by a dead-lettered envelope.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, DlqError> {
        let kind = envelope
            .header(HEADER_DEAD_LETTER_KIND)
            .ok_or(DlqError::NotDeadLettered(envelope.id))?;
        let kind = ErrorKind::parse(kind).ok_or_else(|| DlqError::InvalidHeader {
            header: HEADER_DEAD_LETTER_KIND,
            value: kind.to_string(),
        })?;

        let attempts = envelope.header(HEADER_DEAD_LETTER_ATTEMPTS).unwrap_or("0");
        let attempts = attempts.parse().map_err(|_| DlqError::InvalidHeader {
            header: HEADER_DEAD_LETTER_ATTEMPTS,
            value: attempts.to_string(),
        })?;

        let dead_lettered_at = match envelope.header(HEADER_DEAD_LETTERED_AT) {
            Some(at) => DateTime::parse_from_rfc3339(at)
                .map_err(|_| DlqError::InvalidHeader {
                    header: HEADER_DEAD_LETTERED_AT,
                    value: at.to_string(),
                })?
                .with_timezone(&Utc),
            None => DateTime::<Utc>::UNIX_EPOCH,
        };

        Ok(Self {
            envelope_id: envelope.id,
            message_type: envelope.message_type.clone(),
            kind,
            reason: envelope
                .header(HEADER_DEAD_LETTER_REASON)
                .unwrap_or_default()
                .to_string(),
            attempts,
            original_queue: envelope
                .header(HEADER_ORIGINAL_QUEUE)
                .unwrap_or_default()
                .to_string(),
            dead_lettered_at,
        })
    }
}
