//! Saga engine.
//!
//! For each inbound envelope the glue decides which instances it concerns:
//!
//! | Envelope | Action |
//! |----------|--------|
//! | timeout, addressed | `on_timeout` on the instance if still active |
//! | addressed, instance exists | step the instance if its saga accepts the type |
//! | addressed, no instance, starter type | create the instance under that id |
//! | not addressed, continuation type | step every active instance of the conversation (same correlation id) |
//! | not addressed, starter type, no such instance | create one instance per starting saga |
//! | anything else | ignored |
//!
//! Every load-modify-save cycle runs under the instance lease, which the
//! unit of work holds until it is settled. Version conflicts are returned
//! unchanged; the bus retries the whole dispatch.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};

use tracing::{debug, info, warn};

use super::{
    DynSaga, FinalizePolicy, Saga, SagaAdapter, SagaInstance, SagaLeases, SagaStore,
    SubscriptionChange, TIMEOUT_MESSAGE_TYPE,
};
use crate::emit::Routing;
use crate::envelope::SagaId;
use crate::error::{BusError, Result};
use crate::tx::Transaction;
use crate::unit_of_work::UnitOfWork;

type SagaTable = Vec<Arc<dyn DynSaga>>;

pub struct SagaGlue {
    building: Mutex<SagaTable>,
    frozen: OnceLock<Arc<SagaTable>>,
    store: Arc<dyn SagaStore>,
    leases: SagaLeases,
    routing: Arc<Routing>,
}

impl SagaGlue {
    pub fn new(store: Arc<dyn SagaStore>, routing: Arc<Routing>) -> Self {
        Self {
            building: Mutex::new(Vec::new()),
            frozen: OnceLock::new(),
            store,
            leases: SagaLeases::new(),
            routing,
        }
    }

    /// Add a saga type. Fails once frozen or if the type name is taken.
    pub fn register<S: Saga>(&self, saga: S) -> Result<()> {
        let mut building = self
            .building
            .lock()
            .map_err(|e| BusError::Configuration(format!("saga registry poisoned: {}", e)))?;
        if self.frozen.get().is_some() {
            return Err(BusError::Configuration(format!(
                "cannot register saga '{}' after the bus has started",
                saga.saga_type()
            )));
        }
        if building.iter().any(|s| s.saga_type() == saga.saga_type()) {
            return Err(BusError::Configuration(format!(
                "saga '{}' is already registered",
                saga.saga_type()
            )));
        }
        info!(
            saga_type = %saga.saga_type(),
            starters = ?saga.starters(),
            continuations = ?saga.continuations(),
            "Saga registered"
        );
        building.push(Arc::new(SagaAdapter(saga)));
        Ok(())
    }

    pub fn freeze(&self) {
        let building = self.building.lock().unwrap_or_else(|e| e.into_inner());
        self.frozen.get_or_init(|| Arc::new(building.clone()));
    }

    fn sagas(&self) -> &[Arc<dyn DynSaga>] {
        self.frozen.get().map(|t| t.as_slice()).unwrap_or(&[])
    }

    fn saga(&self, saga_type: &str) -> Option<&Arc<dyn DynSaga>> {
        self.sagas().iter().find(|s| s.saga_type() == saga_type)
    }

    /// Starter message types of every registered saga.
    pub fn starter_types(&self) -> Vec<String> {
        let types: HashSet<&str> = self
            .sagas()
            .iter()
            .flat_map(|s| s.starters().iter().copied())
            .collect();
        let mut types: Vec<String> = types.into_iter().map(str::to_string).collect();
        types.sort();
        types
    }

    /// Whether any saga reacts to this message type.
    pub fn accepts(&self, message_type: &str) -> bool {
        message_type == TIMEOUT_MESSAGE_TYPE || self.sagas().iter().any(|s| s.accepts(message_type))
    }

    pub fn leases(&self) -> &SagaLeases {
        &self.leases
    }

    /// Apply the envelope of `uow` to the instances it concerns.
    pub async fn handle(&self, uow: &mut UnitOfWork) -> Result<()> {
        let message_type = uow.envelope().message_type.clone();
        let target = uow.envelope().saga_id;

        if message_type == TIMEOUT_MESSAGE_TYPE {
            let Some(saga_id) = target else {
                warn!(id = %uow.envelope().id, "Timeout envelope without saga id ignored");
                return Ok(());
            };
            return self.addressed(uow, saga_id, &message_type, true).await;
        }

        match target {
            Some(saga_id) => self.addressed(uow, saga_id, &message_type, false).await,
            None => {
                let correlated = self.correlated(uow, &message_type).await?;
                if !correlated.is_empty() {
                    for saga_id in correlated {
                        self.addressed(uow, saga_id, &message_type, false).await?;
                    }
                    return Ok(());
                }

                let starting: Vec<Arc<dyn DynSaga>> = self
                    .sagas()
                    .iter()
                    .filter(|s| s.starts_with(&message_type))
                    .cloned()
                    .collect();
                if starting.is_empty() && self.accepts(&message_type) {
                    warn!(
                        message_type = %message_type,
                        "Continuation without saga id cannot be correlated, ignored"
                    );
                }
                for saga in starting {
                    let saga_id = SagaId::new();
                    let lease = self.leases.acquire(saga_id).await;
                    uow.hold(lease);
                    let instance = Self::started(uow, saga_id, saga.as_ref());
                    self.step(uow, saga.as_ref(), instance, false).await?;
                }
                Ok(())
            }
        }
    }

    async fn addressed(
        &self,
        uow: &mut UnitOfWork,
        saga_id: SagaId,
        message_type: &str,
        timeout: bool,
    ) -> Result<()> {
        let lease = self.leases.acquire(saga_id).await;
        uow.hold(lease);

        match self.store.get(uow.tx(), saga_id).await? {
            Some(instance) => {
                let Some(saga) = self.saga(&instance.saga_type).cloned() else {
                    warn!(saga_id = %saga_id, saga_type = %instance.saga_type, "No saga registered for stored instance");
                    return Ok(());
                };
                if instance.status.is_terminal() {
                    debug!(saga_id = %saga_id, status = %instance.status, "Instance finished, message ignored");
                    return Ok(());
                }
                if !timeout && !saga.accepts(message_type) {
                    debug!(saga_id = %saga_id, message_type = %message_type, "Message not accepted by saga, ignored");
                    return Ok(());
                }
                self.step(uow, saga.as_ref(), instance, timeout).await
            }
            None if timeout => {
                debug!(saga_id = %saga_id, "Timeout for unknown instance ignored");
                Ok(())
            }
            None => {
                let starter = self
                    .sagas()
                    .iter()
                    .find(|s| s.starts_with(message_type))
                    .cloned();
                match starter {
                    Some(saga) => {
                        let instance = Self::started(uow, saga_id, saga.as_ref());
                        self.step(uow, saga.as_ref(), instance, false).await
                    }
                    None => {
                        warn!(saga_id = %saga_id, message_type = %message_type, "No saga instance for addressed message, ignored");
                        Ok(())
                    }
                }
            }
        }
    }

    /// Active instances, across saga types, that continue with
    /// `message_type` in the conversation of the inbound envelope. Sorted so
    /// leases are always taken in the same order.
    async fn correlated(&self, uow: &mut UnitOfWork, message_type: &str) -> Result<Vec<SagaId>> {
        let Some(correlation_id) = uow.envelope().correlation_id.clone() else {
            return Ok(Vec::new());
        };
        let mut ids = Vec::new();
        for saga in self.sagas() {
            if !saga.continuations().iter().any(|t| *t == message_type) {
                continue;
            }
            ids.extend(
                self.store
                    .find_by_correlation(uow.tx(), saga.saga_type(), &correlation_id)
                    .await?,
            );
        }
        ids.sort();
        ids.dedup();
        if !ids.is_empty() {
            debug!(correlation_id = %correlation_id, instances = ids.len(), "Continuation correlated");
        }
        Ok(ids)
    }

    /// A new instance, joined to the conversation of the envelope that
    /// starts it.
    fn started(uow: &UnitOfWork, saga_id: SagaId, saga: &dyn DynSaga) -> SagaInstance {
        let envelope = uow.envelope();
        let correlation_id = envelope
            .correlation_id
            .clone()
            .unwrap_or_else(|| envelope.id.to_string());
        SagaInstance::new(saga_id, saga.saga_type(), Vec::new())
            .with_correlation_id(Some(correlation_id))
    }

    /// Activations for the continuations of every stored active instance.
    /// Applied when a bus starts, so instances that outlived a previous
    /// process keep their delayed subscriptions.
    pub async fn active_subscriptions(
        &self,
        tx: &mut dyn Transaction,
    ) -> Result<Vec<SubscriptionChange>> {
        let mut changes = Vec::new();
        for saga in self.sagas() {
            if saga.continuations().is_empty() {
                continue;
            }
            for saga_id in self.store.list_active(tx, saga.saga_type()).await? {
                for message_type in saga.continuations() {
                    changes.push(SubscriptionChange::Activate {
                        message_type: message_type.to_string(),
                        saga_id,
                    });
                }
            }
        }
        Ok(changes)
    }

    /// One load-modify-save cycle. The instance lease is already held.
    async fn step(
        &self,
        uow: &mut UnitOfWork,
        saga: &dyn DynSaga,
        instance: SagaInstance,
        timeout: bool,
    ) -> Result<()> {
        let expected = instance.version;
        let is_new = instance.is_new();

        let (state, status) = {
            let mut ctx = uow.step_context(&self.routing, instance.id, is_new);
            let state = (!is_new).then_some(instance.state.as_slice());
            saga.step(&mut ctx, state, timeout)?
        };

        let next = SagaInstance {
            state,
            status,
            ..instance
        };
        let version = self.store.save(uow.tx(), &next, expected).await?;

        if status.is_terminal() && saga.finalize_policy() == FinalizePolicy::Delete {
            self.store.delete(uow.tx(), next.id).await?;
        }

        if is_new && !status.is_terminal() {
            for message_type in saga.continuations() {
                uow.change_subscription(SubscriptionChange::Activate {
                    message_type: message_type.to_string(),
                    saga_id: next.id,
                });
            }
        } else if !is_new && status.is_terminal() {
            for message_type in saga.continuations() {
                uow.change_subscription(SubscriptionChange::Release {
                    message_type: message_type.to_string(),
                    saga_id: next.id,
                });
            }
        }

        debug!(
            saga_id = %next.id,
            saga_type = %next.saga_type,
            version,
            status = %status,
            "Saga step applied"
        );
        Ok(())
    }
}
