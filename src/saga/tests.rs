//! Tests for the saga engine.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::*;
use crate::emit::Routing;
use crate::error::ErrorKind;
use crate::serialization::JsonSerializer;
use crate::tx::{MemoryTxProvider, TransactionProvider};
use crate::unit_of_work::{Committed, UnitOfWork};

// ============================================================================
// Fixtures
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: String,
}

impl Message for OrderPlaced {
    const MESSAGE_TYPE: &'static str = "order.Placed";
}

#[derive(Debug, Serialize, Deserialize)]
struct PaymentCaptured {
    amount: u64,
}

impl Message for PaymentCaptured {
    const MESSAGE_TYPE: &'static str = "payment.Captured";
}

#[derive(Debug, Serialize, Deserialize)]
struct RequestPayment {
    order_id: String,
}

impl Message for RequestPayment {
    const MESSAGE_TYPE: &'static str = "payment.Request";
}

#[derive(Debug, Serialize, Deserialize)]
struct OrderCompleted {
    order_id: String,
}

impl Message for OrderCompleted {
    const MESSAGE_TYPE: &'static str = "order.Completed";
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct OrderState {
    order_id: String,
    paid: u64,
}

#[derive(Default)]
struct OrderSaga {
    policy: FinalizePolicy,
    timeout: Option<Duration>,
    decline: bool,
}

impl Saga for OrderSaga {
    type State = OrderState;

    fn saga_type(&self) -> &str {
        "order"
    }

    fn starters(&self) -> &[&'static str] {
        &["order.Placed"]
    }

    fn continuations(&self) -> &[&'static str] {
        &["payment.Captured"]
    }

    fn handle(
        &self,
        ctx: &mut StepContext<'_>,
        state: &mut OrderState,
    ) -> std::result::Result<SagaStatus, HandlerError> {
        if ctx.is::<OrderPlaced>() {
            let placed: OrderPlaced = ctx.decode()?;
            state.order_id = placed.order_id.clone();
            ctx.send(
                "payments",
                &RequestPayment {
                    order_id: placed.order_id,
                },
            )?;
            if let Some(after) = self.timeout {
                ctx.request_timeout(after);
            }
            return Ok(SagaStatus::Active);
        }

        if self.decline {
            return Err("card declined".into());
        }
        let captured: PaymentCaptured = ctx.decode()?;
        state.paid = captured.amount;
        ctx.publish(&OrderCompleted {
            order_id: state.order_id.clone(),
        })?;
        Ok(SagaStatus::Completed)
    }

    fn finalize_policy(&self) -> FinalizePolicy {
        self.policy
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Ticks {
    count: u32,
}

struct CounterSaga;

impl Saga for CounterSaga {
    type State = Ticks;

    fn saga_type(&self) -> &str {
        "counter"
    }

    fn starters(&self) -> &[&'static str] {
        &["counter.Start"]
    }

    fn continuations(&self) -> &[&'static str] {
        &["counter.Tick"]
    }

    fn handle(
        &self,
        ctx: &mut StepContext<'_>,
        state: &mut Ticks,
    ) -> std::result::Result<SagaStatus, HandlerError> {
        if ctx.message_type() == "counter.Tick" {
            state.count += 1;
        }
        Ok(SagaStatus::Active)
    }
}

struct Harness {
    glue: SagaGlue,
    store: TransactionalMemorySagaStore,
    provider: MemoryTxProvider,
    routing: Arc<Routing>,
}

impl Harness {
    fn new<S: Saga>(saga: S) -> Self {
        Self::sharing(saga, TransactionalMemorySagaStore::new(), MemoryTxProvider::new())
    }

    fn sharing<S: Saga>(
        saga: S,
        store: TransactionalMemorySagaStore,
        provider: MemoryTxProvider,
    ) -> Self {
        let routing = Arc::new(Routing::new("orders", "events", Arc::new(JsonSerializer)));
        let glue = SagaGlue::new(Arc::new(store.clone()), Arc::clone(&routing));
        glue.register(saga).unwrap();
        glue.freeze();
        Self {
            glue,
            store,
            provider,
            routing,
        }
    }

    fn envelope<M: Message>(&self, message: &M) -> Envelope {
        let body = self.routing.encode(message).unwrap();
        self.routing.envelope(M::MESSAGE_TYPE, body, None, None)
    }

    fn raw(&self, message_type: &str) -> Envelope {
        self.routing.envelope(message_type, b"{}".to_vec(), None, None)
    }

    async fn begin(&self, envelope: Envelope) -> UnitOfWork {
        UnitOfWork::new(envelope, self.provider.begin().await.unwrap())
    }

    async fn dispatch(&self, envelope: Envelope) -> Result<Committed> {
        let mut uow = self.begin(envelope).await;
        if let Err(e) = self.glue.handle(&mut uow).await {
            uow.rollback().await;
            return Err(e);
        }
        uow.commit().await
    }

    async fn start(&self) -> (SagaId, Committed) {
        let committed = self
            .dispatch(self.envelope(&OrderPlaced {
                order_id: "o-1".to_string(),
            }))
            .await
            .unwrap();
        let saga_id = match &committed.subscriptions[0] {
            SubscriptionChange::Activate { saga_id, .. } => *saga_id,
            other => panic!("Expected activation, got {:?}", other),
        };
        (saga_id, committed)
    }
}

fn decode_state(instance: &SagaInstance) -> OrderState {
    serialization::decode_value(&JsonSerializer, "order", &instance.state).unwrap()
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_starter_creates_instance_at_version_one() {
    let h = Harness::new(OrderSaga::default());
    let (saga_id, committed) = h.start().await;

    let instance = h.store.committed(saga_id).unwrap();
    assert_eq!(instance.version, 1);
    assert_eq!(instance.status, SagaStatus::Active);
    assert_eq!(instance.saga_type, "order");
    assert_eq!(decode_state(&instance).order_id, "o-1");

    assert_eq!(
        committed.subscriptions,
        vec![SubscriptionChange::Activate {
            message_type: "payment.Captured".to_string(),
            saga_id,
        }]
    );
    assert_eq!(committed.outbound.len(), 1);
    let request = &committed.outbound[0];
    assert_eq!(request.routing_key, "payments");
    assert_eq!(request.envelope.reply_to_saga(), Some(saga_id));
    assert_eq!(request.envelope.reply_to(), Some("orders"));
}

#[tokio::test]
async fn test_continuation_advances_to_version_two_and_archives() {
    let h = Harness::new(OrderSaga {
        policy: FinalizePolicy::Archive,
        ..Default::default()
    });
    let (saga_id, _) = h.start().await;

    let continuation = h
        .envelope(&PaymentCaptured { amount: 42 })
        .with_saga_id(saga_id);
    let committed = h.dispatch(continuation).await.unwrap();

    let instance = h.store.committed(saga_id).unwrap();
    assert_eq!(instance.version, 2);
    assert_eq!(instance.status, SagaStatus::Completed);
    assert_eq!(decode_state(&instance).paid, 42);

    assert_eq!(committed.outbound.len(), 1);
    assert_eq!(
        committed.outbound[0].envelope.message_type,
        OrderCompleted::MESSAGE_TYPE
    );
    assert_eq!(committed.outbound[0].exchange, "events");
    assert_eq!(
        committed.subscriptions,
        vec![SubscriptionChange::Release {
            message_type: "payment.Captured".to_string(),
            saga_id,
        }]
    );
}

#[tokio::test]
async fn test_completed_instance_deleted_by_default() {
    let h = Harness::new(OrderSaga::default());
    let (saga_id, _) = h.start().await;

    h.dispatch(h.envelope(&PaymentCaptured { amount: 1 }).with_saga_id(saga_id))
        .await
        .unwrap();

    assert_eq!(h.store.committed(saga_id), None);
}

#[tokio::test]
async fn test_message_for_finished_instance_is_ignored() {
    let h = Harness::new(OrderSaga {
        policy: FinalizePolicy::Archive,
        ..Default::default()
    });
    let (saga_id, _) = h.start().await;
    let captured = h.envelope(&PaymentCaptured { amount: 1 }).with_saga_id(saga_id);
    h.dispatch(captured.clone()).await.unwrap();

    let again = h.dispatch(captured.redelivered()).await.unwrap();
    assert!(again.outbound.is_empty());
    assert_eq!(h.store.committed(saga_id).unwrap().version, 2);
}

#[tokio::test]
async fn test_uncorrelated_continuation_is_ignored() {
    let h = Harness::new(OrderSaga::default());
    let committed = h
        .dispatch(h.envelope(&PaymentCaptured { amount: 1 }))
        .await
        .unwrap();
    assert!(committed.outbound.is_empty());
    assert!(committed.subscriptions.is_empty());
}

#[tokio::test]
async fn test_continuation_in_the_conversation_reaches_its_saga() {
    let h = Harness::new(OrderSaga {
        policy: FinalizePolicy::Archive,
        ..Default::default()
    });
    let (saga_id, committed) = h.start().await;
    let correlation_id = committed.outbound[0].envelope.correlation_id.clone();
    assert_eq!(
        h.store.committed(saga_id).unwrap().correlation_id,
        correlation_id
    );

    // Published by another service's handler: no saga address, same conversation.
    let body = h.routing.encode(&PaymentCaptured { amount: 7 }).unwrap();
    let captured = h.routing.envelope(
        PaymentCaptured::MESSAGE_TYPE,
        body,
        correlation_id.clone(),
        None,
    );
    let committed = h.dispatch(captured).await.unwrap();

    let instance = h.store.committed(saga_id).unwrap();
    assert_eq!(instance.version, 2);
    assert_eq!(instance.status, SagaStatus::Completed);
    assert_eq!(decode_state(&instance).paid, 7);
    assert_eq!(committed.outbound[0].envelope.correlation_id, correlation_id);
}

#[tokio::test]
async fn test_active_subscriptions_cover_stored_active_instances() {
    let h = Harness::new(OrderSaga {
        policy: FinalizePolicy::Archive,
        ..Default::default()
    });
    let (open, _) = h.start().await;
    let (closed, _) = h.start().await;
    h.dispatch(h.envelope(&PaymentCaptured { amount: 1 }).with_saga_id(closed))
        .await
        .unwrap();

    let mut tx = h.provider.begin().await.unwrap();
    let changes = h.glue.active_subscriptions(tx.as_mut()).await.unwrap();
    tx.rollback().await.unwrap();
    assert_eq!(
        changes,
        vec![SubscriptionChange::Activate {
            message_type: "payment.Captured".to_string(),
            saga_id: open,
        }]
    );
}

#[tokio::test]
async fn test_addressed_starter_creates_instance_with_that_id() {
    let h = Harness::new(OrderSaga::default());
    let saga_id = SagaId::new();
    h.dispatch(
        h.envelope(&OrderPlaced {
            order_id: "o-2".to_string(),
        })
        .with_saga_id(saga_id),
    )
    .await
    .unwrap();

    assert_eq!(h.store.committed(saga_id).unwrap().version, 1);
}

// ============================================================================
// Timeouts
// ============================================================================

#[tokio::test]
async fn test_timeout_is_self_addressed_and_times_out_instance() {
    let h = Harness::new(OrderSaga {
        timeout: Some(Duration::from_secs(30)),
        ..Default::default()
    });
    let (saga_id, committed) = h.start().await;

    let alarm = committed
        .outbound
        .iter()
        .find(|o| o.envelope.message_type == TIMEOUT_MESSAGE_TYPE)
        .unwrap();
    assert_eq!(alarm.routing_key, "orders");
    assert_eq!(alarm.deliver_after, Some(Duration::from_secs(30)));
    assert_eq!(alarm.envelope.saga_id, Some(saga_id));

    let committed = h.dispatch(alarm.envelope.clone()).await.unwrap();
    assert_eq!(h.store.committed(saga_id), None);
    assert!(matches!(
        committed.subscriptions[0],
        SubscriptionChange::Release { .. }
    ));
}

#[tokio::test]
async fn test_timeout_archived_as_timed_out() {
    let h = Harness::new(OrderSaga {
        timeout: Some(Duration::from_secs(30)),
        policy: FinalizePolicy::Archive,
        ..Default::default()
    });
    let (saga_id, _) = h.start().await;

    let alarm = h.raw(TIMEOUT_MESSAGE_TYPE).with_saga_id(saga_id);
    h.dispatch(alarm).await.unwrap();

    let instance = h.store.committed(saga_id).unwrap();
    assert_eq!(instance.status, SagaStatus::TimedOut);
    assert_eq!(instance.version, 2);
}

#[tokio::test]
async fn test_stale_timeout_ignored() {
    let h = Harness::new(OrderSaga::default());
    let committed = h
        .dispatch(h.raw(TIMEOUT_MESSAGE_TYPE).with_saga_id(SagaId::new()))
        .await
        .unwrap();
    assert!(committed.outbound.is_empty());
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_step_failure_leaves_instance_untouched() {
    let h = Harness::new(OrderSaga {
        decline: true,
        ..Default::default()
    });
    let (saga_id, _) = h.start().await;

    let result = h
        .dispatch(h.envelope(&PaymentCaptured { amount: 1 }).with_saga_id(saga_id))
        .await;
    assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::Handler));

    let instance = h.store.committed(saga_id).unwrap();
    assert_eq!(instance.version, 1);
    assert_eq!(instance.status, SagaStatus::Active);
    assert_eq!(h.glue.leases().active(), 0);
}

#[tokio::test]
async fn test_concurrent_engines_conflict_on_stale_version() {
    let store = TransactionalMemorySagaStore::new();
    let provider = MemoryTxProvider::new();
    let a = Harness::sharing(OrderSaga::default(), store.clone(), provider.clone());
    let b = Harness::sharing(OrderSaga::default(), store.clone(), provider);
    let (saga_id, _) = a.start().await;

    // Separate lease tables: both load version 1.
    let captured = a.envelope(&PaymentCaptured { amount: 1 }).with_saga_id(saga_id);
    let mut first = a.begin(captured.clone()).await;
    let mut second = b.begin(captured).await;
    a.glue.handle(&mut first).await.unwrap();
    b.glue.handle(&mut second).await.unwrap();

    first.commit().await.unwrap();
    let result = second.commit().await;
    assert!(matches!(
        result,
        Err(BusError::VersionConflict {
            expected: 1,
            actual: None,
            ..
        })
    ));
}

#[test]
fn test_register_after_freeze_rejected() {
    let routing = Arc::new(Routing::new("orders", "events", Arc::new(JsonSerializer)));
    let glue = SagaGlue::new(Arc::new(InMemorySagaStore::new()), routing);
    glue.register(OrderSaga::default()).unwrap();
    assert!(matches!(
        glue.register(OrderSaga::default()),
        Err(BusError::Configuration(_))
    ));

    glue.freeze();
    assert!(matches!(
        glue.register(CounterSaga),
        Err(BusError::Configuration(_))
    ));
    assert_eq!(glue.starter_types(), vec!["order.Placed".to_string()]);
    assert!(glue.accepts("payment.Captured"));
    assert!(glue.accepts(TIMEOUT_MESSAGE_TYPE));
    assert!(!glue.accepts("counter.Start"));
}

// ============================================================================
// Per-instance serialization
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_steps_on_one_instance_never_conflict() {
    let h = Arc::new(Harness::new(CounterSaga));
    let saga_id = SagaId::new();
    h.dispatch(h.raw("counter.Start").with_saga_id(saga_id))
        .await
        .unwrap();

    let barrier = Arc::new(tokio::sync::Barrier::new(16));
    let mut handles = Vec::new();
    for _ in 0..16 {
        let h = Arc::clone(&h);
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            h.dispatch(h.raw("counter.Tick").with_saga_id(saga_id)).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let instance = h.store.committed(saga_id).unwrap();
    assert_eq!(instance.version, 17);
    let ticks: Ticks = serialization::decode_value(&JsonSerializer, "counter", &instance.state).unwrap();
    assert_eq!(ticks.count, 16);
    assert_eq!(h.glue.leases().active(), 0);
}
