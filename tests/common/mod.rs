//! Shared fixtures for end-to-end tests.
//!
//! Wires a `MemoryBroker` to a `MessageBus` and provides a small order
//! saga plus polling helpers.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use relaybus::tx::{NoopTransaction, MEMORY_PROVIDER};
use relaybus::{
    BusConfig, FinalizePolicy, HandlerError, MemoryBroker, Message, MessageBus, Saga, SagaId,
    SagaInstance, SagaStatus, SagaStore, StepContext, TransactionalConfig,
};

pub const SERVICE: &str = "orders";
pub const DEAD_LETTER: &str = "orders.dlq";
pub const PAYMENTS: &str = "payments";

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: String,
}

impl Message for OrderPlaced {
    const MESSAGE_TYPE: &'static str = "order.Placed";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestPayment {
    pub order_id: String,
}

impl Message for RequestPayment {
    const MESSAGE_TYPE: &'static str = "payment.Request";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentCaptured {
    pub amount: u64,
}

impl Message for PaymentCaptured {
    const MESSAGE_TYPE: &'static str = "payment.Captured";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCompleted {
    pub order_id: String,
    pub amount: u64,
}

impl Message for OrderCompleted {
    const MESSAGE_TYPE: &'static str = "order.Completed";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick;

impl Message for Tick {
    const MESSAGE_TYPE: &'static str = "counter.Tick";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartCounter;

impl Message for StartCounter {
    const MESSAGE_TYPE: &'static str = "counter.Start";
}

// ============================================================================
// Sagas
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct OrderState {
    pub order_id: String,
    pub amount: u64,
}

/// Places an order, requests payment, completes on capture.
pub struct OrderSaga {
    pub policy: FinalizePolicy,
    pub timeout: Option<Duration>,
}

impl Default for OrderSaga {
    fn default() -> Self {
        Self {
            policy: FinalizePolicy::Archive,
            timeout: None,
        }
    }
}

impl Saga for OrderSaga {
    type State = OrderState;

    fn saga_type(&self) -> &str {
        "order"
    }

    fn starters(&self) -> &[&'static str] {
        &[OrderPlaced::MESSAGE_TYPE]
    }

    fn continuations(&self) -> &[&'static str] {
        &[PaymentCaptured::MESSAGE_TYPE]
    }

    fn handle(
        &self,
        ctx: &mut StepContext<'_>,
        state: &mut OrderState,
    ) -> Result<SagaStatus, HandlerError> {
        if ctx.is::<OrderPlaced>() {
            let placed: OrderPlaced = ctx.decode()?;
            state.order_id = placed.order_id.clone();
            ctx.send(
                PAYMENTS,
                &RequestPayment {
                    order_id: placed.order_id,
                },
            )?;
            if let Some(after) = self.timeout {
                ctx.request_timeout(after);
            }
            return Ok(SagaStatus::Active);
        }

        let captured: PaymentCaptured = ctx.decode()?;
        state.amount = captured.amount;
        ctx.publish(&OrderCompleted {
            order_id: state.order_id.clone(),
            amount: captured.amount,
        })?;
        Ok(SagaStatus::Completed)
    }

    fn finalize_policy(&self) -> FinalizePolicy {
        self.policy
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CounterState {
    pub count: u32,
}

/// Counts ticks and records the count seen by every step.
pub struct CounterSaga {
    pub seen: Arc<Mutex<Vec<u32>>>,
}

impl Saga for CounterSaga {
    type State = CounterState;

    fn saga_type(&self) -> &str {
        "counter"
    }

    fn starters(&self) -> &[&'static str] {
        &[StartCounter::MESSAGE_TYPE]
    }

    fn continuations(&self) -> &[&'static str] {
        &[Tick::MESSAGE_TYPE]
    }

    fn handle(
        &self,
        ctx: &mut StepContext<'_>,
        state: &mut CounterState,
    ) -> Result<SagaStatus, HandlerError> {
        if ctx.is::<Tick>() {
            state.count += 1;
            self.seen
                .lock()
                .map_err(|e| e.to_string())?
                .push(state.count);
        }
        Ok(SagaStatus::Active)
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Configuration with the in-memory transactional provider and a
/// dead-letter queue.
pub fn transactional_config() -> BusConfig {
    BusConfig {
        transactional: TransactionalConfig {
            provider: MEMORY_PROVIDER.to_string(),
            connection_string: String::new(),
        },
        dead_letter: DEAD_LETTER.to_string(),
        ..BusConfig::for_service(SERVICE)
    }
}

pub async fn build(config: BusConfig) -> (MemoryBroker, MessageBus) {
    let broker = MemoryBroker::new();
    let bus = MessageBus::build(config, Arc::new(broker.clone()))
        .await
        .expect("bus should build");
    (broker, bus)
}

/// Poll `check` until it holds; panics after five seconds.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

/// Poll the stored instance until `check` holds; panics after five
/// seconds.
pub async fn wait_for_instance(
    bus: &MessageBus,
    saga_id: SagaId,
    what: &str,
    check: impl Fn(Option<&SagaInstance>) -> bool,
) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !check(instance(bus, saga_id).await.as_ref()) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

/// Current stored instance, read outside any unit of work.
pub async fn instance(bus: &MessageBus, saga_id: SagaId) -> Option<SagaInstance> {
    bus.saga_store()
        .get(&mut NoopTransaction, saga_id)
        .await
        .expect("store read")
}
