//! Tests for the message bus lifecycle and dispatch.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use super::*;
use crate::broker::{MemoryBroker, Outgoing};
use crate::config::{ConflictRetryConfig, TransactionalConfig};
use crate::dlq::DeadLetter;
use crate::envelope::{Envelope, HEADER_REPLY_TO};
use crate::error::ErrorKind;
use crate::outbox::MemoryOutbox;
use crate::saga::{SagaInstance, SagaStatus, StepContext, StoreError, TransactionalMemorySagaStore};
use crate::tx::{
    BackendFactory, MemoryTxProvider, NoopTransaction, Transaction, TransactionProvider,
    MEMORY_PROVIDER,
};

const QUEUE: &str = "svc";
const DLQ: &str = "svc.dlq";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Ping {
    n: u32,
}

impl Message for Ping {
    const MESSAGE_TYPE: &'static str = "test.Ping";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Pong {
    n: u32,
}

impl Message for Pong {
    const MESSAGE_TYPE: &'static str = "test.Pong";
}

fn config() -> BusConfig {
    BusConfig::for_service(QUEUE)
}

fn transactional() -> BusConfig {
    BusConfig {
        transactional: TransactionalConfig {
            provider: MEMORY_PROVIDER.to_string(),
            connection_string: String::new(),
        },
        dead_letter: DLQ.to_string(),
        ..config()
    }
}

async fn bus_with(config: BusConfig) -> (MemoryBroker, MessageBus) {
    let broker = MemoryBroker::new();
    let bus = MessageBus::build(config, Arc::new(broker.clone()))
        .await
        .unwrap();
    (broker, bus)
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

fn counting(bus: &MessageBus) -> Arc<AtomicU32> {
    let calls = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&calls);
    bus.handle_message::<Ping, _>(move |_, _| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .unwrap();
    calls
}

/// Signals when it starts, then never finishes on its own.
struct Stall(Arc<Notify>);

#[async_trait]
impl Handler for Stall {
    async fn handle(&self, _invocation: &mut Invocation<'_>) -> Result<()> {
        self.0.notify_one();
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(())
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_register_after_start_is_configuration_error() {
    let (_broker, bus) = bus_with(config()).await;
    counting(&bus);
    bus.start().await.unwrap();

    let handler = bus.handle_message::<Ping, _>(|_, _| Ok(()));
    assert!(matches!(handler, Err(BusError::Configuration(_))));

    bus.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_start_twice_is_a_no_op() {
    let (broker, bus) = bus_with(config()).await;
    let calls = counting(&bus);

    bus.start().await.unwrap();
    bus.start().await.unwrap();
    assert!(bus.is_started().await);
    assert!(broker.is_bound(QUEUE, &bus.config().events_exchange, Ping::MESSAGE_TYPE));

    bus.send(QUEUE, &Ping { n: 1 }).await.unwrap();
    eventually("handler call", || calls.load(Ordering::SeqCst) == 1).await;

    let report = bus.shutdown(Duration::from_secs(1)).await;
    assert!(report.is_clean());
    assert_eq!(report.drained, 1);
}

#[tokio::test]
async fn test_restart_after_shutdown_rejected() {
    let (_broker, bus) = bus_with(config()).await;
    bus.start().await.unwrap();
    bus.shutdown(Duration::from_secs(1)).await;

    assert!(matches!(bus.start().await, Err(BusError::Configuration(_))));
    assert_eq!(
        bus.shutdown(Duration::from_secs(1)).await,
        ShutdownReport::default()
    );
}

// ============================================================================
// Dispatch
// ============================================================================

#[tokio::test]
async fn test_handlers_run_in_order_and_reply_goes_to_sender() {
    let (broker, bus) = bus_with(config()).await;
    let order = Arc::new(Mutex::new(Vec::new()));

    let first = Arc::clone(&order);
    bus.handle_message::<Ping, _>(move |_, ping| {
        first.lock().unwrap().push(format!("first:{}", ping.n));
        Ok(())
    })
    .unwrap();
    let second = Arc::clone(&order);
    bus.handle_message::<Ping, _>(move |inv, ping| {
        second.lock().unwrap().push(format!("second:{}", ping.n));
        inv.reply(&Pong { n: ping.n + 1 })?;
        Ok(())
    })
    .unwrap();
    bus.start().await.unwrap();

    broker.declare_queue("client").await.unwrap();
    let body = serde_json::to_vec(&Ping { n: 7 }).unwrap();
    let request = Envelope::new(Ping::MESSAGE_TYPE, body)
        .with_correlation_id("conv-1")
        .with_header(HEADER_REPLY_TO, "client");
    broker
        .publish(Outgoing::to_queue(QUEUE, request))
        .await
        .unwrap();

    eventually("reply", || broker.queued("client").len() == 1).await;
    let reply = &broker.queued("client")[0];
    assert_eq!(reply.message_type, Pong::MESSAGE_TYPE);
    assert_eq!(reply.correlation_id.as_deref(), Some("conv-1"));
    assert_eq!(reply.reply_to(), Some(QUEUE));
    assert_eq!(
        *order.lock().unwrap(),
        vec!["first:7".to_string(), "second:7".to_string()]
    );

    bus.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_unknown_message_type_is_acknowledged() {
    let (broker, bus) = bus_with(config()).await;
    let calls = counting(&bus);
    bus.start().await.unwrap();

    broker
        .publish(Outgoing::to_queue(QUEUE, Envelope::new("nobody.Listens", vec![])))
        .await
        .unwrap();
    bus.send(QUEUE, &Ping { n: 1 }).await.unwrap();

    // One worker: the unknown envelope was settled before the ping.
    eventually("handler call", || calls.load(Ordering::SeqCst) == 1).await;
    let report = bus.shutdown(Duration::from_secs(1)).await;
    assert!(report.is_clean());
    assert!(broker.queued(QUEUE).is_empty());
}

#[tokio::test]
async fn test_undecodable_body_dead_lettered_without_retry() {
    let (broker, bus) = bus_with(transactional()).await;
    let calls = counting(&bus);
    bus.start().await.unwrap();

    let garbage = Envelope::new(Ping::MESSAGE_TYPE, b"{not json".to_vec());
    broker
        .publish(Outgoing::to_queue(QUEUE, garbage.clone()))
        .await
        .unwrap();

    eventually("dead letter", || broker.queued(DLQ).len() == 1).await;
    let dead = &broker.queued(DLQ)[0];
    let record = DeadLetter::from_envelope(dead).unwrap();
    assert_eq!(dead.id, garbage.id);
    assert_eq!(record.kind, ErrorKind::Serialization);
    assert_eq!(record.original_queue, QUEUE);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(bus.retry_state().is_empty());

    bus.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_failure_is_counted_and_redelivered() {
    let (_broker, bus) = bus_with(config()).await;
    let calls = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&calls);
    bus.handle_message::<Ping, _>(move |_, _| {
        if seen.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err("first try fails".into());
        }
        Ok(())
    })
    .unwrap();
    bus.start().await.unwrap();

    bus.send(QUEUE, &Ping { n: 1 }).await.unwrap();
    eventually("redelivery", || calls.load(Ordering::SeqCst) == 2).await;
    eventually("retry state cleared", || bus.retry_state().is_empty()).await;

    bus.shutdown(Duration::from_secs(1)).await;
}

// ============================================================================
// Sagas
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct PingState {
    last: u32,
}

/// Started by `Ping`; records the delivery attempt of every step it runs.
struct PingSaga {
    attempts: Arc<Mutex<Vec<u32>>>,
}

impl PingSaga {
    fn new() -> (Self, Arc<Mutex<Vec<u32>>>) {
        let attempts = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                attempts: Arc::clone(&attempts),
            },
            attempts,
        )
    }
}

impl Saga for PingSaga {
    type State = PingState;

    fn saga_type(&self) -> &str {
        "ping"
    }

    fn starters(&self) -> &[&'static str] {
        &[Ping::MESSAGE_TYPE]
    }

    fn continuations(&self) -> &[&'static str] {
        &[]
    }

    fn handle(
        &self,
        ctx: &mut StepContext<'_>,
        state: &mut PingState,
    ) -> std::result::Result<SagaStatus, HandlerError> {
        self.attempts
            .lock()
            .unwrap()
            .push(ctx.envelope().delivery_attempt);
        let ping: Ping = ctx.decode()?;
        state.last = ping.n;
        Ok(SagaStatus::Active)
    }
}

/// Saga store that reports a version conflict on its first `conflicts` saves.
struct ConflictingStore {
    inner: TransactionalMemorySagaStore,
    conflicts: AtomicU32,
}

#[async_trait]
impl SagaStore for ConflictingStore {
    async fn get(
        &self,
        tx: &mut dyn Transaction,
        id: SagaId,
    ) -> std::result::Result<Option<SagaInstance>, StoreError> {
        self.inner.get(tx, id).await
    }

    async fn save(
        &self,
        tx: &mut dyn Transaction,
        instance: &SagaInstance,
        expected_version: u64,
    ) -> std::result::Result<u64, StoreError> {
        let conflicted = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if conflicted {
            return Err(StoreError::VersionConflict {
                saga_id: instance.id,
                expected: expected_version,
                actual: Some(expected_version + 1),
            });
        }
        self.inner.save(tx, instance, expected_version).await
    }

    async fn delete(
        &self,
        tx: &mut dyn Transaction,
        id: SagaId,
    ) -> std::result::Result<(), StoreError> {
        self.inner.delete(tx, id).await
    }

    async fn find_by_correlation(
        &self,
        tx: &mut dyn Transaction,
        saga_type: &str,
        correlation_id: &str,
    ) -> std::result::Result<Vec<SagaId>, StoreError> {
        self.inner
            .find_by_correlation(tx, saga_type, correlation_id)
            .await
    }

    async fn list_active(
        &self,
        tx: &mut dyn Transaction,
        saga_type: &str,
    ) -> std::result::Result<Vec<SagaId>, StoreError> {
        self.inner.list_active(tx, saga_type).await
    }
}

struct FixedBackend(Backend);

#[async_trait]
impl BackendFactory for FixedBackend {
    async fn connect(&self, _connection_string: &str, _service_name: &str) -> Result<Backend> {
        Ok(self.0.clone())
    }
}

/// Transactional bus whose saga store conflicts `conflicts` times, retrying
/// each delivery at most `max_attempts` times.
async fn bus_with_conflicts(conflicts: u32, max_attempts: usize) -> (MemoryBroker, MessageBus) {
    let backend = Backend {
        provider: Arc::new(MemoryTxProvider::new()),
        saga_store: Arc::new(ConflictingStore {
            inner: TransactionalMemorySagaStore::new(),
            conflicts: AtomicU32::new(conflicts),
        }),
        outbox: Arc::new(MemoryOutbox::new()),
    };
    let mut providers = ProviderRegistry::empty();
    providers.register("conflicting", Arc::new(FixedBackend(backend)));

    let config = BusConfig {
        transactional: TransactionalConfig {
            provider: "conflicting".to_string(),
            connection_string: String::new(),
        },
        conflict_retry: ConflictRetryConfig {
            max_attempts,
            min_delay_ms: 1,
            max_delay_ms: 5,
        },
        ..config()
    };
    let broker = MemoryBroker::new();
    let bus = MessageBus::with_providers(config, Arc::new(broker.clone()), &providers)
        .await
        .unwrap();
    (broker, bus)
}

async fn stored(bus: &MessageBus, saga_id: SagaId) -> Option<SagaInstance> {
    bus.saga_store()
        .get(&mut NoopTransaction, saga_id)
        .await
        .unwrap()
}

async fn wait_stored(bus: &MessageBus, saga_id: SagaId) -> SagaInstance {
    let found = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(instance) = stored(bus, saga_id).await {
                return instance;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    match found {
        Ok(instance) => instance,
        Err(_) => panic!("timed out waiting for saga {}", saga_id),
    }
}

#[tokio::test]
async fn test_saga_undecodable_body_dead_lettered_without_retry() {
    let (broker, bus) = bus_with(transactional()).await;
    let (saga, attempts) = PingSaga::new();
    bus.register_saga(saga).unwrap();
    bus.start().await.unwrap();

    let garbage = Envelope::new(Ping::MESSAGE_TYPE, b"{not json".to_vec());
    broker
        .publish(Outgoing::to_queue(QUEUE, garbage.clone()))
        .await
        .unwrap();

    eventually("dead letter", || broker.queued(DLQ).len() == 1).await;
    let dead = &broker.queued(DLQ)[0];
    let record = DeadLetter::from_envelope(dead).unwrap();
    assert_eq!(dead.id, garbage.id);
    assert_eq!(record.kind, ErrorKind::Serialization);
    assert_eq!(record.attempts, 1);

    // The step ran once and was never redelivered.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*attempts.lock().unwrap(), vec![1]);
    assert!(bus.retry_state().is_empty());

    bus.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_version_conflicts_within_budget_rerun_in_place() {
    let (_broker, bus) = bus_with_conflicts(2, 2).await;
    let (saga, attempts) = PingSaga::new();
    bus.register_saga(saga).unwrap();
    bus.start().await.unwrap();

    let saga_id = SagaId::new();
    bus.send_to_saga(QUEUE, saga_id, &Ping { n: 7 }).await.unwrap();

    let instance = wait_stored(&bus, saga_id).await;
    assert_eq!(instance.version, 1);
    // Two conflicts, then success, all within the first delivery.
    assert_eq!(*attempts.lock().unwrap(), vec![1, 1, 1]);
    eventually("retry state cleared", || bus.retry_state().is_empty()).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(attempts.lock().unwrap().len(), 3);

    bus.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_version_conflicts_beyond_budget_count_a_failure_and_redeliver() {
    let (_broker, bus) = bus_with_conflicts(4, 2).await;
    let (saga, attempts) = PingSaga::new();
    bus.register_saga(saga).unwrap();
    bus.start().await.unwrap();

    let saga_id = SagaId::new();
    bus.send_to_saga(QUEUE, saga_id, &Ping { n: 7 }).await.unwrap();

    let instance = wait_stored(&bus, saga_id).await;
    assert_eq!(instance.version, 1);
    // Three runs exhaust the budget; the redelivery conflicts once more.
    assert_eq!(*attempts.lock().unwrap(), vec![1, 1, 1, 2, 2]);
    eventually("retry state cleared", || bus.retry_state().is_empty()).await;

    bus.shutdown(Duration::from_secs(1)).await;
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_abandons_work_before_commit() {
    let (broker, bus) = bus_with(config()).await;
    let started = Arc::new(Notify::new());
    bus.register_handler(Ping::MESSAGE_TYPE, Arc::new(Stall(Arc::clone(&started))))
        .unwrap();
    bus.start().await.unwrap();

    let id = bus.send(QUEUE, &Ping { n: 1 }).await.unwrap();
    started.notified().await;

    let report = bus.shutdown(Duration::from_millis(50)).await;
    assert_eq!(report.abandoned, vec![id]);
    assert_eq!(report.drained, 0);

    eventually("requeue", || broker.queued(QUEUE).len() == 1).await;
    let requeued = &broker.queued(QUEUE)[0];
    assert_eq!(requeued.id, id);
    assert!(requeued.delivery_attempt > 1);
}

// ============================================================================
// Outbox
// ============================================================================

#[tokio::test]
async fn test_unsent_outbox_entries_republished_on_start() {
    let (broker, bus) = bus_with(transactional()).await;
    broker.declare_queue("billing").await.unwrap();

    let leftover = Outgoing::to_queue("billing", Envelope::new("billing.Charge", vec![]));
    let mut tx = MemoryTxProvider::new().begin().await.unwrap();
    bus.outbox()
        .stage(tx.as_mut(), std::slice::from_ref(&leftover))
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(bus.outbox().pending().await.unwrap().len(), 1);

    bus.start().await.unwrap();

    assert_eq!(broker.queued("billing").len(), 1);
    assert_eq!(broker.queued("billing")[0].id, leftover.envelope.id);
    assert!(bus.outbox().pending().await.unwrap().is_empty());

    bus.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_outbound_marked_sent_after_publish() {
    let (broker, bus) = bus_with(transactional()).await;
    broker.declare_queue("audit").await.unwrap();
    bus.handle_message::<Ping, _>(|inv, ping| {
        inv.send("audit", &Pong { n: ping.n })?;
        Ok(())
    })
    .unwrap();
    bus.start().await.unwrap();

    bus.send(QUEUE, &Ping { n: 3 }).await.unwrap();
    eventually("audit message", || broker.queued("audit").len() == 1).await;

    // Publish precedes mark_sent; give the worker a moment to finish.
    let outbox = bus.outbox();
    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while !outbox.pending().await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(drained.is_ok());

    bus.shutdown(Duration::from_secs(1)).await;
}

// ============================================================================
// Reconnect
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_consumer_resubscribes_after_connection_loss() {
    let (broker, bus) = bus_with(config()).await;
    let calls = counting(&bus);
    bus.start().await.unwrap();

    bus.send(QUEUE, &Ping { n: 1 }).await.unwrap();
    eventually("first delivery", || calls.load(Ordering::SeqCst) == 1).await;

    broker.simulate_connection_loss();
    bus.send(QUEUE, &Ping { n: 2 }).await.unwrap();

    eventually("delivery after reconnect", || calls.load(Ordering::SeqCst) == 2).await;
    assert!(broker.is_bound(QUEUE, &bus.config().events_exchange, Ping::MESSAGE_TYPE));

    bus.shutdown(Duration::from_secs(1)).await;
}
