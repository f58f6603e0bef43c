//! Per-envelope dispatch.
//!
//! One delivery is one unit of work:
//!
//! 1. begin a transaction
//! 2. run every handler bound to the message type, in registration order
//! 3. run the saga engine if any saga reacts to the type
//! 4. stage the outbound envelopes in the outbox
//! 5. commit, then ack, then publish, then mark the outbox entries sent
//! 6. apply delayed-subscription changes, then release the saga leases
//!
//! Failures roll the transaction back:
//! - version conflicts re-run the whole dispatch a bounded number of times,
//!   then fall back to redelivery
//! - undecodable or misconfigured envelopes go straight to the dead-letter
//!   queue
//! - everything else is counted and nacked; once the count reaches
//!   `max_retries` the next delivery is dead-lettered instead of dispatched

use std::sync::Arc;

use backon::{BackoffBuilder, ExponentialBuilder};
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::retry::RetryState;
use super::worker::WorkerSlot;
use crate::broker::{Broker, Delivery, Outgoing};
use crate::dlq::DeadLetter;
use crate::emit::Routing;
use crate::envelope::Envelope;
use crate::error::{BusError, ErrorKind, Result};
use crate::registry::HandlerRegistry;
use crate::saga::{DelayedSubscriptions, SagaGlue};
use crate::tx::Backend;
use crate::unit_of_work::{Committed, UnitOfWork};

/// Shared state of every worker of one bus.
pub(crate) struct Dispatcher {
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) backend: Backend,
    pub(crate) routing: Arc<Routing>,
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) glue: Arc<SagaGlue>,
    pub(crate) subscriptions: Arc<DelayedSubscriptions>,
    pub(crate) retries: RetryState,
    pub(crate) dead_letter: Option<String>,
    pub(crate) max_retries: u32,
    pub(crate) conflict_backoff: ExponentialBuilder,
}

enum Attempt {
    Committed(Committed),
    /// Shutdown abandoned the dispatch before it reached its commit.
    Abandoned,
}

impl Dispatcher {
    /// Dispatch one delivery and settle it with the broker.
    #[tracing::instrument(
        name = "bus.dispatch",
        skip_all,
        fields(
            id = %delivery.envelope().id,
            message_type = %delivery.envelope().message_type,
            attempt = delivery.envelope().delivery_attempt
        )
    )]
    pub(crate) async fn dispatch(&self, delivery: Delivery, slot: &WorkerSlot) {
        let envelope = delivery.envelope().clone();
        slot.start(envelope.id);
        self.dispatch_envelope(delivery, &envelope, slot).await;
        slot.finish();
    }

    async fn dispatch_envelope(&self, delivery: Delivery, envelope: &Envelope, slot: &WorkerSlot) {
        let message_type = envelope.message_type.as_str();
        if self.registry.handlers_for(message_type).is_empty() && !self.glue.accepts(message_type) {
            warn!("No handler or saga for message type, envelope dropped");
            self.ack(delivery).await;
            return;
        }

        if let Some(queue) = self.dead_letter.as_deref() {
            let failures = self.retries.failures(envelope);
            if failures >= self.max_retries {
                let (kind, reason) = match self.retries.last(envelope.id) {
                    Some(last) => (last.kind, last.reason),
                    None => (
                        ErrorKind::Handler,
                        format!("{} failed deliveries, last failure not recorded", failures),
                    ),
                };
                self.dead_letter(queue, delivery, envelope, kind, reason, failures, slot)
                    .await;
                return;
            }
        }

        let mut conflicts = self.conflict_backoff.build();
        loop {
            match self.attempt(envelope, slot).await {
                Ok(Attempt::Committed(committed)) => {
                    self.retries.clear(envelope.id);
                    self.settle(delivery, committed).await;
                    return;
                }
                Ok(Attempt::Abandoned) => {
                    debug!("Dispatch abandoned before commit, left for redelivery");
                    drop(delivery);
                    return;
                }
                Err(err @ BusError::VersionConflict { .. }) => match conflicts.next() {
                    Some(delay) => {
                        warn!(error = %err, delay_ms = %delay.as_millis(), "Saga version conflict, retrying dispatch");
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        self.fail(delivery, envelope, err, slot).await;
                        return;
                    }
                },
                Err(err) => {
                    self.fail(delivery, envelope, err, slot).await;
                    return;
                }
            }
        }
    }

    /// One pass over handlers and sagas inside a fresh transaction.
    async fn attempt(&self, envelope: &Envelope, slot: &WorkerSlot) -> Result<Attempt> {
        let tx = self.backend.provider.begin().await?;
        let mut uow = UnitOfWork::new(envelope.clone(), tx);

        if let Err(err) = self.run(&mut uow).await {
            uow.rollback().await;
            return Err(err);
        }
        if !slot.begin_commit() {
            uow.rollback().await;
            return Ok(Attempt::Abandoned);
        }
        match uow.commit().await {
            Ok(committed) => Ok(Attempt::Committed(committed)),
            Err(err) => {
                slot.resume();
                Err(err)
            }
        }
    }

    async fn run(&self, uow: &mut UnitOfWork) -> Result<()> {
        let message_type = uow.envelope().message_type.clone();

        for handler in self.registry.handlers_for(&message_type) {
            let mut invocation = uow.invocation(&self.routing);
            handler.handle(&mut invocation).await?;
        }

        if self.glue.accepts(&message_type) {
            self.glue.handle(uow).await?;
        }

        uow.stage_outbox(self.backend.outbox.as_ref()).await
    }

    /// Post-commit: ack, publish, mark sent, apply subscription changes.
    async fn settle(&self, delivery: Delivery, committed: Committed) {
        self.ack(delivery).await;

        let sent = self.publish_all(&committed.outbound).await;
        if !sent.is_empty() {
            if let Err(e) = self.backend.outbox.mark_sent(&sent).await {
                warn!(error = %e, "Failed to mark outbox entries sent, they will be re-published on restart");
            }
        }

        for change in &committed.subscriptions {
            if let Err(e) = self.subscriptions.apply(change).await {
                warn!(error = %e, change = ?change, "Failed to apply subscription change");
            }
        }

        debug!(
            outbound = committed.outbound.len(),
            leases = committed.leased(),
            "Dispatch settled"
        );
    }

    /// Publish in order; returns the ids that reached the broker.
    pub(crate) async fn publish_all(&self, outbound: &[Outgoing]) -> Vec<Uuid> {
        let mut sent = Vec::with_capacity(outbound.len());
        for outgoing in outbound {
            match self.broker.publish(outgoing.clone()).await {
                Ok(()) => sent.push(outgoing.envelope.id),
                Err(e) => {
                    warn!(
                        error = %e,
                        id = %outgoing.envelope.id,
                        message_type = %outgoing.envelope.message_type,
                        "Publish failed, envelope stays in the outbox"
                    );
                }
            }
        }
        sent
    }

    async fn fail(&self, delivery: Delivery, envelope: &Envelope, err: BusError, slot: &WorkerSlot) {
        let kind = err.kind();

        if !kind.is_retryable() {
            let failures = self.retries.failures(envelope) + 1;
            match self.dead_letter.as_deref() {
                Some(queue) => {
                    self.dead_letter(queue, delivery, envelope, kind, err.to_string(), failures, slot)
                        .await;
                }
                None => {
                    error!(error = %err, kind = %kind, "Envelope cannot be processed and no dead-letter queue is configured, dropped");
                    self.retries.clear(envelope.id);
                    self.ack(delivery).await;
                }
            }
            return;
        }

        let failures = self.retries.record_failure(envelope, &err);
        warn!(error = %err, kind = %kind, failures, "Dispatch failed, envelope returned for redelivery");
        if let Err(e) = delivery.nack().await {
            warn!(error = %e, "Nack failed, relying on broker redelivery");
        }
    }

    /// Route the envelope to the dead-letter queue through a unit of work of
    /// its own, then ack it.
    #[allow(clippy::too_many_arguments)]
    async fn dead_letter(
        &self,
        queue: &str,
        delivery: Delivery,
        envelope: &Envelope,
        kind: ErrorKind,
        reason: String,
        attempts: u32,
        slot: &WorkerSlot,
    ) {
        let record = DeadLetter::new(envelope, kind, reason, attempts, self.routing.queue.clone());
        let outgoing = record.to_outgoing(queue, envelope);

        match self.commit_dead_letter(envelope, outgoing, slot).await {
            Ok(Attempt::Committed(committed)) => {
                error!(
                    dead_letter = %queue,
                    kind = %record.kind,
                    reason = %record.reason,
                    attempts,
                    "Envelope dead-lettered"
                );
                self.retries.clear(envelope.id);
                self.settle(delivery, committed).await;
            }
            Ok(Attempt::Abandoned) => drop(delivery),
            Err(e) => {
                error!(error = %e, "Failed to dead-letter envelope, returned for redelivery");
                if let Err(e) = delivery.nack().await {
                    warn!(error = %e, "Nack failed, relying on broker redelivery");
                }
            }
        }
    }

    async fn commit_dead_letter(
        &self,
        envelope: &Envelope,
        outgoing: Outgoing,
        slot: &WorkerSlot,
    ) -> Result<Attempt> {
        let tx = self.backend.provider.begin().await?;
        let mut uow = UnitOfWork::new(envelope.clone(), tx);
        uow.emit(outgoing);

        if let Err(err) = uow.stage_outbox(self.backend.outbox.as_ref()).await {
            uow.rollback().await;
            return Err(err);
        }
        if !slot.begin_commit() {
            uow.rollback().await;
            return Ok(Attempt::Abandoned);
        }
        match uow.commit().await {
            Ok(committed) => Ok(Attempt::Committed(committed)),
            Err(err) => {
                slot.resume();
                Err(err)
            }
        }
    }

    async fn ack(&self, delivery: Delivery) {
        if let Err(e) = delivery.ack().await {
            warn!(error = %e, "Ack failed, envelope may be redelivered");
        }
    }
}
