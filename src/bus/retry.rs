//! Failure bookkeeping for redelivered envelopes.
//!
//! Counts are process-local and lost on restart. The broker's own delivery
//! counter (`Envelope::delivery_attempt`) is the fallback, so the retry
//! ceiling still holds after a restart when the broker tracks redeliveries.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use uuid::Uuid;

use crate::envelope::Envelope;
use crate::error::{BusError, ErrorKind};

/// Last recorded failure of an envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryRecord {
    pub failures: u32,
    pub kind: ErrorKind,
    pub reason: String,
}

/// Envelope id → failure record.
#[derive(Default)]
pub struct RetryState {
    records: Mutex<HashMap<Uuid, RetryRecord>>,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<Uuid, RetryRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Count one more failed delivery. Returns the failures recorded so far.
    pub fn record_failure(&self, envelope: &Envelope, error: &BusError) -> u32 {
        let mut records = self.records();
        let record = records.entry(envelope.id).or_insert_with(|| RetryRecord {
            failures: envelope.prior_deliveries(),
            kind: error.kind(),
            reason: String::new(),
        });
        record.failures += 1;
        record.kind = error.kind();
        record.reason = error.to_string();
        record.failures
    }

    /// Failed deliveries that preceded this one.
    pub fn failures(&self, envelope: &Envelope) -> u32 {
        let local = self
            .records()
            .get(&envelope.id)
            .map(|r| r.failures)
            .unwrap_or(0);
        local.max(envelope.prior_deliveries())
    }

    pub fn last(&self, id: Uuid) -> Option<RetryRecord> {
        self.records().get(&id).cloned()
    }

    /// Forget an envelope once it has been settled for good.
    pub fn clear(&self, id: Uuid) {
        self.records().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_accumulate_per_envelope() {
        let state = RetryState::new();
        let a = Envelope::new("t", vec![]);
        let b = Envelope::new("t", vec![]);

        assert_eq!(state.record_failure(&a, &BusError::handler("t", "boom")), 1);
        assert_eq!(
            state.record_failure(&a.redelivered(), &BusError::Storage("down".into())),
            2
        );
        assert_eq!(state.record_failure(&b, &BusError::handler("t", "boom")), 1);

        let last = state.last(a.id).unwrap();
        assert_eq!(last.failures, 2);
        assert_eq!(last.kind, ErrorKind::Storage);
        assert!(last.reason.contains("down"));
        assert_eq!(state.len(), 2);
    }

    #[test]
    fn test_broker_counter_used_when_local_state_missing() {
        let state = RetryState::new();
        let envelope = Envelope::new("t", vec![]).redelivered().redelivered();
        assert_eq!(state.failures(&envelope), 2);

        // First local failure continues from the broker's count.
        assert_eq!(state.record_failure(&envelope, &BusError::handler("t", "x")), 3);
    }

    #[test]
    fn test_clear_forgets() {
        let state = RetryState::new();
        let envelope = Envelope::new("t", vec![]);
        state.record_failure(&envelope, &BusError::handler("t", "x"));
        state.clear(envelope.id);
        assert!(state.is_empty());
        assert_eq!(state.failures(&envelope), 0);
    }
}
