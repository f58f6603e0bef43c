//! Message bus.
//!
//! `MessageBus` owns the handler registry, the saga engine, the
//! transactional backend and the worker pool of one service:
//!
//! ```text
//! broker ──consume──► pump ──bounded channel──► worker × N ──► Dispatcher
//!    ▲                                                          │
//!    └──────────── ack / publish (after commit) ◄───────────────┘
//! ```
//!
//! Lifecycle: `build` → `register_*` / `handle_message` → `start` →
//! `shutdown`. Registration is rejected once the bus has started.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::config::BusConfig;
use crate::emit::Routing;
use crate::envelope::SagaId;
use crate::error::{BusError, HandlerError, Result};
use crate::outbox::Outbox;
use crate::registry::{FnHandler, Handler, HandlerRegistry, Invocation};
use crate::saga::{DelayedSubscriptions, Saga, SagaGlue, SagaStore};
use crate::serialization::{serializer_for, Message};
use crate::tx::{Backend, ProviderRegistry};

mod dispatch;
mod pump;
pub mod retry;
pub mod worker;

use dispatch::Dispatcher;
pub use retry::{RetryRecord, RetryState};
pub use worker::{ShutdownReport, WorkerPool};

struct Running {
    stop: watch::Sender<bool>,
    pump: JoinHandle<()>,
    pool: WorkerPool,
}

#[derive(Default)]
struct Lifecycle {
    running: Option<Running>,
    shut_down: bool,
}

/// Transactional message bus of one service.
pub struct MessageBus {
    config: BusConfig,
    dispatcher: Arc<Dispatcher>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

impl MessageBus {
    /// Build a bus with the built-in transaction providers.
    ///
    /// Invalid configuration (including an unknown provider name) is a
    /// `BusError::Configuration` and no bus is produced.
    pub async fn build(config: BusConfig, broker: Arc<dyn Broker>) -> Result<Self> {
        Self::with_providers(config, broker, &ProviderRegistry::default()).await
    }

    /// Build a bus resolving the transactional provider in `providers`.
    pub async fn with_providers(
        config: BusConfig,
        broker: Arc<dyn Broker>,
        providers: &ProviderRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let serializer = serializer_for(&config.serializer)
            .map_err(|e| BusError::Configuration(e.to_string()))?;

        let backend = if config.transactional.is_enabled() {
            providers
                .connect(
                    &config.transactional.provider,
                    config.backend_connection_string(),
                    &config.service_name,
                )
                .await?
        } else {
            Backend::non_transactional()
        };

        let routing = Arc::new(Routing::new(
            config.service_name.clone(),
            config.events_exchange.clone(),
            serializer,
        ));
        let glue = Arc::new(SagaGlue::new(
            Arc::clone(&backend.saga_store),
            Arc::clone(&routing),
        ));
        let subscriptions = Arc::new(DelayedSubscriptions::new(
            Arc::clone(&broker),
            config.service_name.clone(),
            config.events_exchange.clone(),
        ));

        info!(
            service = %config.service_name,
            workers = config.effective_workers(),
            provider = %backend.provider.name(),
            transactional = backend.is_transactional(),
            dead_letter = ?config.dead_letter_queue(),
            serializer = %config.serializer,
            "Message bus built"
        );

        let dispatcher = Arc::new(Dispatcher {
            broker,
            backend,
            routing,
            registry: Arc::new(HandlerRegistry::new()),
            glue,
            subscriptions,
            retries: RetryState::new(),
            dead_letter: config.dead_letter_queue().map(str::to_string),
            max_retries: config.max_retries,
            conflict_backoff: config.conflict_retry.backoff(),
        });

        Ok(Self {
            config,
            dispatcher,
            lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Queue this bus consumes from.
    pub fn queue(&self) -> &str {
        &self.dispatcher.routing.queue
    }

    pub fn is_transactional(&self) -> bool {
        self.dispatcher.backend.is_transactional()
    }

    pub fn saga_store(&self) -> Arc<dyn SagaStore> {
        Arc::clone(&self.dispatcher.backend.saga_store)
    }

    pub fn outbox(&self) -> Arc<dyn Outbox> {
        Arc::clone(&self.dispatcher.backend.outbox)
    }

    pub fn subscriptions(&self) -> &DelayedSubscriptions {
        &self.dispatcher.subscriptions
    }

    pub fn retry_state(&self) -> &RetryState {
        &self.dispatcher.retries
    }

    /// Saga instances currently leased by an in-flight dispatch.
    pub fn active_leases(&self) -> usize {
        self.dispatcher.glue.leases().active()
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Bind a typed closure to `M::MESSAGE_TYPE`.
    pub fn handle_message<M, F>(&self, f: F) -> Result<()>
    where
        M: Message,
        F: Fn(&mut Invocation<'_>, M) -> std::result::Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.register_handler(M::MESSAGE_TYPE, Arc::new(FnHandler::<M, F>::new(f)))
    }

    /// Bind a handler to a message type. Handlers of one type run in
    /// registration order and must all succeed.
    pub fn register_handler(&self, message_type: &str, handler: Arc<dyn Handler>) -> Result<()> {
        self.dispatcher.registry.register(message_type, handler)?;
        debug!(message_type = %message_type, "Handler registered");
        Ok(())
    }

    pub fn register_saga<S: Saga>(&self, saga: S) -> Result<()> {
        self.dispatcher.glue.register(saga)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start consuming. Calling it again is a no-op.
    ///
    /// Freezes registration, declares the service and dead-letter queues,
    /// optionally purges the service queue, re-publishes outbox entries left
    /// over from a previous run, binds the handled and saga-starting message
    /// types and the continuations of stored active sagas, then spawns the
    /// consumer pump and the workers.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.running.is_some() {
            debug!("Message bus already started");
            return Ok(());
        }
        if lifecycle.shut_down {
            return Err(BusError::Configuration(
                "a bus cannot be restarted after shutdown".to_string(),
            ));
        }

        let dispatcher = &self.dispatcher;
        dispatcher.registry.freeze();
        dispatcher.glue.freeze();

        let queue = self.queue().to_string();
        dispatcher.broker.declare_queue(&queue).await?;
        if let Some(dead_letter) = dispatcher.dead_letter.as_deref() {
            dispatcher.broker.declare_queue(dead_letter).await?;
        }

        if self.config.purge_on_startup {
            let purged = dispatcher.broker.purge(&queue).await?;
            info!(queue = %queue, purged, "Purged queue on startup");
        }

        self.recover_outbox().await?;

        let mut permanent = dispatcher.registry.message_types();
        permanent.extend(dispatcher.glue.starter_types());
        permanent.sort();
        permanent.dedup();
        for message_type in &permanent {
            dispatcher.subscriptions.bind_permanent(message_type).await?;
        }
        self.restore_subscriptions().await?;

        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.inbound_capacity);
        let (stop, stop_rx) = watch::channel(false);

        let pool = WorkerPool::spawn(
            self.config.effective_workers(),
            Arc::clone(dispatcher),
            inbound_rx,
            stop_rx.clone(),
        );
        let pump = pump::Pump {
            broker: Arc::clone(&dispatcher.broker),
            queue: queue.clone(),
            subscriptions: Arc::clone(&dispatcher.subscriptions),
            inbound: inbound_tx,
        };
        let pump = tokio::spawn(pump.run(stop_rx));

        lifecycle.running = Some(Running { stop, pump, pool });
        info!(queue = %queue, bindings = ?permanent, "Message bus started");
        Ok(())
    }

    pub async fn is_started(&self) -> bool {
        self.lifecycle.lock().await.running.is_some()
    }

    /// Publish outbox entries committed by a previous run but never sent.
    async fn recover_outbox(&self) -> Result<()> {
        let outbox = &self.dispatcher.backend.outbox;
        let pending = outbox.pending().await?;
        if pending.is_empty() {
            return Ok(());
        }
        let sent = self.dispatcher.publish_all(&pending).await;
        outbox.mark_sent(&sent).await?;
        info!(
            pending = pending.len(),
            published = sent.len(),
            "Re-published unsent outbox entries"
        );
        Ok(())
    }

    /// Re-activate the continuation bindings of saga instances stored by a
    /// previous run.
    async fn restore_subscriptions(&self) -> Result<()> {
        let dispatcher = &self.dispatcher;
        let mut tx = dispatcher.backend.provider.begin().await?;
        let changes = match dispatcher.glue.active_subscriptions(tx.as_mut()).await {
            Ok(changes) => changes,
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback after failed saga listing failed");
                }
                return Err(e);
            }
        };
        tx.rollback().await?;

        for change in &changes {
            dispatcher.subscriptions.apply(change).await?;
        }
        if !changes.is_empty() {
            info!(activations = changes.len(), "Restored delayed subscriptions of stored sagas");
        }
        Ok(())
    }

    /// Stop admitting envelopes and wait up to `timeout` for in-flight
    /// dispatches. Dispatches that have not begun committing by then are
    /// abandoned and left for redelivery; a commit in progress finishes.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        let running = {
            let mut lifecycle = self.lifecycle.lock().await;
            lifecycle.shut_down = true;
            lifecycle.running.take()
        };
        let Some(Running { stop, pump, pool }) = running else {
            return ShutdownReport::default();
        };

        info!(timeout_ms = %timeout.as_millis(), "Message bus shutting down");
        let _ = stop.send(true);
        let _ = pump.await;
        let report = pool.drain(timeout).await;
        info!(
            abandoned = ?report.abandoned,
            "Message bus stopped"
        );
        report
    }

    // ------------------------------------------------------------------
    // Emission outside handlers
    // ------------------------------------------------------------------

    /// Send a message to a service queue. Not part of any unit of work.
    pub async fn send<M: Message>(&self, queue: &str, message: &M) -> Result<Uuid> {
        let outgoing = self.dispatcher.routing.send_to(queue, message, None, None)?;
        let id = outgoing.envelope.id;
        self.dispatcher.broker.publish(outgoing).await?;
        Ok(id)
    }

    /// Send a message addressed to one saga instance of the receiving
    /// service.
    pub async fn send_to_saga<M: Message>(
        &self,
        queue: &str,
        saga_id: SagaId,
        message: &M,
    ) -> Result<Uuid> {
        let mut outgoing = self.dispatcher.routing.send_to(queue, message, None, None)?;
        outgoing.envelope.saga_id = Some(saga_id);
        let id = outgoing.envelope.id;
        self.dispatcher.broker.publish(outgoing).await?;
        Ok(id)
    }

    /// Publish an event on the events exchange.
    pub async fn publish<M: Message>(&self, message: &M) -> Result<Uuid> {
        let outgoing = self.dispatcher.routing.publish(message, None, None)?;
        let id = outgoing.envelope.id;
        self.dispatcher.broker.publish(outgoing).await?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests;
