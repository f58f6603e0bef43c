//! Unit of work: one inbound envelope, its transaction, the outbound
//! envelopes it produced, the saga leases it holds and the subscription
//! changes it implies. Committed or rolled back as one.

use tracing::{debug, warn};

use crate::broker::Outgoing;
use crate::emit::{Emitter, Routing};
use crate::envelope::{Envelope, SagaId};
use crate::error::Result;
use crate::outbox::Outbox;
use crate::registry::Invocation;
use crate::saga::{LeaseGuard, StepContext, SubscriptionChange};
use crate::tx::Transaction;

pub struct UnitOfWork {
    envelope: Envelope,
    tx: Box<dyn Transaction>,
    outbound: Vec<Outgoing>,
    leases: Vec<LeaseGuard>,
    subscriptions: Vec<SubscriptionChange>,
}

impl UnitOfWork {
    pub fn new(envelope: Envelope, tx: Box<dyn Transaction>) -> Self {
        Self {
            envelope,
            tx,
            outbound: Vec::new(),
            leases: Vec::new(),
            subscriptions: Vec::new(),
        }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn tx(&mut self) -> &mut dyn Transaction {
        self.tx.as_mut()
    }

    pub fn outbound(&self) -> &[Outgoing] {
        &self.outbound
    }

    /// Context for a plain handler.
    pub fn invocation<'a>(&'a mut self, routing: &'a Routing) -> Invocation<'a> {
        Invocation::new(
            self.tx.as_mut(),
            Emitter::new(routing, &self.envelope, None, &mut self.outbound),
        )
    }

    /// Context for one saga step.
    pub fn step_context<'a>(
        &'a mut self,
        routing: &'a Routing,
        saga_id: SagaId,
        is_new: bool,
    ) -> StepContext<'a> {
        StepContext::new(
            saga_id,
            is_new,
            Emitter::new(routing, &self.envelope, Some(saga_id), &mut self.outbound),
        )
    }

    /// Keep a saga lease until the unit of work is settled.
    pub fn hold(&mut self, lease: LeaseGuard) {
        self.leases.push(lease);
    }

    /// Add an outbound envelope produced outside any handler.
    pub fn emit(&mut self, outgoing: Outgoing) {
        self.outbound.push(outgoing);
    }

    pub fn change_subscription(&mut self, change: SubscriptionChange) {
        self.subscriptions.push(change);
    }

    /// Record outbound envelopes in the outbox, inside the transaction.
    pub async fn stage_outbox(&mut self, outbox: &dyn Outbox) -> Result<()> {
        outbox.stage(self.tx.as_mut(), &self.outbound).await?;
        Ok(())
    }

    pub async fn commit(self) -> Result<Committed> {
        self.tx.commit().await?;
        debug!(
            id = %self.envelope.id,
            outbound = self.outbound.len(),
            "Unit of work committed"
        );
        Ok(Committed {
            outbound: self.outbound,
            subscriptions: self.subscriptions,
            leases: self.leases,
        })
    }

    /// Discard everything. Leases are released once the transaction is gone.
    pub async fn rollback(self) {
        if let Err(e) = self.tx.rollback().await {
            warn!(id = %self.envelope.id, error = %e, "Rollback failed");
        }
    }
}

/// Post-commit work of a unit of work. Leases stay held until this is
/// dropped, so subscription changes of one saga apply in commit order.
pub struct Committed {
    pub outbound: Vec<Outgoing>,
    pub subscriptions: Vec<SubscriptionChange>,
    leases: Vec<LeaseGuard>,
}

impl Committed {
    pub fn leased(&self) -> usize {
        self.leases.len()
    }
}
