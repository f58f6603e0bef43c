//! Delayed subscriptions.
//!
//! Continuation message types are bound to the service queue only while at
//! least one active saga instance expects them. Each delayed binding is
//! reference-counted by the set of instances that need it; the broker
//! binding is created when the set becomes non-empty and removed when it
//! empties. Types bound permanently (handler and starter types) are never
//! unbound by a saga finishing.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::broker::{Broker, BrokerError};
use crate::envelope::SagaId;

/// A binding change produced by a saga step, applied after commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionChange {
    Activate {
        message_type: String,
        saga_id: SagaId,
    },
    Release {
        message_type: String,
        saga_id: SagaId,
    },
}

#[derive(Default)]
struct Bindings {
    permanent: HashSet<String>,
    delayed: HashMap<String, HashSet<SagaId>>,
}

impl Bindings {
    fn is_bound(&self, message_type: &str) -> bool {
        self.permanent.contains(message_type)
            || self
                .delayed
                .get(message_type)
                .is_some_and(|sagas| !sagas.is_empty())
    }
}

/// Binding table of one service queue on the events exchange.
pub struct DelayedSubscriptions {
    broker: Arc<dyn Broker>,
    queue: String,
    exchange: String,
    bindings: Mutex<Bindings>,
}

impl DelayedSubscriptions {
    pub fn new(broker: Arc<dyn Broker>, queue: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self {
            broker,
            queue: queue.into(),
            exchange: exchange.into(),
            bindings: Mutex::new(Bindings::default()),
        }
    }

    /// Bind a message type for the lifetime of the bus.
    pub async fn bind_permanent(&self, message_type: &str) -> Result<(), BrokerError> {
        let mut bindings = self.bindings.lock().await;
        if !bindings.is_bound(message_type) {
            self.broker
                .bind(&self.queue, &self.exchange, message_type)
                .await?;
        }
        bindings.permanent.insert(message_type.to_string());
        debug!(message_type = %message_type, "Permanent subscription bound");
        Ok(())
    }

    /// Apply one change.
    pub async fn apply(&self, change: &SubscriptionChange) -> Result<(), BrokerError> {
        match change {
            SubscriptionChange::Activate {
                message_type,
                saga_id,
            } => self.activate(message_type, *saga_id).await,
            SubscriptionChange::Release {
                message_type,
                saga_id,
            } => self.release(message_type, *saga_id).await,
        }
    }

    /// Record that `saga_id` expects `message_type`; bind on first need.
    pub async fn activate(&self, message_type: &str, saga_id: SagaId) -> Result<(), BrokerError> {
        let mut bindings = self.bindings.lock().await;
        if !bindings.is_bound(message_type) {
            self.broker
                .bind(&self.queue, &self.exchange, message_type)
                .await?;
            info!(message_type = %message_type, saga_id = %saga_id, "Delayed subscription activated");
        }
        bindings
            .delayed
            .entry(message_type.to_string())
            .or_default()
            .insert(saga_id);
        Ok(())
    }

    /// Record that `saga_id` no longer expects `message_type`; unbind when
    /// no instance needs it.
    pub async fn release(&self, message_type: &str, saga_id: SagaId) -> Result<(), BrokerError> {
        let mut bindings = self.bindings.lock().await;
        let Some(sagas) = bindings.delayed.get_mut(message_type) else {
            return Ok(());
        };
        if !sagas.remove(&saga_id) {
            return Ok(());
        }
        if sagas.is_empty() {
            bindings.delayed.remove(message_type);
            if !bindings.permanent.contains(message_type) {
                self.broker
                    .unbind(&self.queue, &self.exchange, message_type)
                    .await?;
                info!(message_type = %message_type, "Delayed subscription deactivated");
            }
        }
        Ok(())
    }

    pub async fn is_active(&self, message_type: &str) -> bool {
        self.bindings.lock().await.is_bound(message_type)
    }

    /// Every message type currently bound, sorted.
    pub async fn active_bindings(&self) -> Vec<String> {
        let bindings = self.bindings.lock().await;
        let mut all: BTreeSet<String> = bindings.permanent.iter().cloned().collect();
        all.extend(
            bindings
                .delayed
                .iter()
                .filter(|(_, sagas)| !sagas.is_empty())
                .map(|(t, _)| t.clone()),
        );
        all.into_iter().collect()
    }

    /// Re-create every binding, e.g. after the broker connection was lost.
    pub async fn rebind_all(&self) -> Result<(), BrokerError> {
        for message_type in self.active_bindings().await {
            self.broker
                .bind(&self.queue, &self.exchange, &message_type)
                .await?;
        }
        Ok(())
    }
}
