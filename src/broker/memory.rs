//! In-process reference broker.
//!
//! Models the broker semantics the bus relies on:
//! - queues buffer messages until a consumer attaches
//! - default-exchange routing by queue name, topic routing by binding
//!   (`#` binds every routing key of an exchange)
//! - nack, or dropping an unsettled delivery, requeues the message with
//!   `delivery_attempt` incremented
//! - delayed publish
//! - simulated connection loss: consumer streams end and an error is
//!   broadcast on `connection_errors()`

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::{
    Acknowledger, Broker, BrokerError, Delivery, Outgoing, DEFAULT_EXCHANGE,
};
use crate::envelope::Envelope;

/// Capacity of the connection error broadcast.
const ERROR_CHANNEL_CAPACITY: usize = 16;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Envelope>,
    consumer: Option<mpsc::UnboundedSender<Delivery>>,
    bindings: HashSet<(String, String)>,
}

struct Inner {
    queues: Mutex<HashMap<String, QueueState>>,
    published: Mutex<Vec<Outgoing>>,
    errors: broadcast::Sender<BrokerError>,
}

impl Inner {
    fn queues(&self) -> MutexGuard<'_, HashMap<String, QueueState>> {
        // A panic while holding the lock leaves plain data behind; keep serving.
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// In-memory broker. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                queues: Mutex::new(HashMap::new()),
                published: Mutex::new(Vec::new()),
                errors,
            }),
        }
    }

    /// Messages waiting in a queue that has no consumer attached.
    pub fn queued(&self, queue: &str) -> Vec<Envelope> {
        self.inner
            .queues()
            .get(queue)
            .map(|q| q.pending.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every message published so far, in publish order.
    pub fn published(&self) -> Vec<Outgoing> {
        self.inner
            .published
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    pub fn is_bound(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.inner
            .queues()
            .get(queue)
            .map(|q| {
                q.bindings
                    .contains(&(exchange.to_string(), routing_key.to_string()))
            })
            .unwrap_or(false)
    }

    /// Drop every consumer stream and report the loss on
    /// `connection_errors()`. Queued and unsettled messages survive.
    pub fn simulate_connection_loss(&self) {
        let consumers: Vec<_> = self
            .inner
            .queues()
            .values_mut()
            .filter_map(|q| q.consumer.take())
            .collect();
        drop(consumers);
        warn!("Memory broker connection dropped");
        let _ = self
            .inner
            .errors
            .send(BrokerError::ConnectionLost("simulated".to_string()));
    }

    fn route(inner: &Arc<Inner>, exchange: &str, routing_key: &str, envelope: Envelope) {
        if exchange == DEFAULT_EXCHANGE {
            Self::enqueue(inner, routing_key, envelope);
            return;
        }

        let targets: Vec<String> = inner
            .queues()
            .iter()
            .filter(|(_, q)| {
                q.bindings
                    .contains(&(exchange.to_string(), routing_key.to_string()))
                    || q.bindings.contains(&(exchange.to_string(), "#".to_string()))
            })
            .map(|(name, _)| name.clone())
            .collect();

        if targets.is_empty() {
            debug!(%exchange, %routing_key, "No bound queue, message dropped");
        }
        for queue in targets {
            Self::enqueue(inner, &queue, envelope.clone());
        }
    }

    fn enqueue(inner: &Arc<Inner>, queue: &str, envelope: Envelope) {
        let consumer = {
            let mut queues = inner.queues();
            let Some(state) = queues.get_mut(queue) else {
                debug!(%queue, id = %envelope.id, "Unknown queue, message dropped");
                return;
            };
            match &state.consumer {
                Some(sender) if !sender.is_closed() => sender.clone(),
                _ => {
                    state.consumer = None;
                    state.pending.push_back(envelope);
                    return;
                }
            }
        };

        let delivery = Self::delivery(inner, queue, envelope);
        if let Err(mpsc::error::SendError(undelivered)) = consumer.send(delivery) {
            // Consumer went away: detach it, then let the unsettled delivery
            // requeue itself into `pending`.
            let mut queues = inner.queues();
            if let Some(state) = queues.get_mut(queue) {
                if state
                    .consumer
                    .as_ref()
                    .is_some_and(|c| c.same_channel(&consumer))
                {
                    state.consumer = None;
                }
            }
            drop(queues);
            drop(undelivered);
        }
    }

    fn delivery(inner: &Arc<Inner>, queue: &str, envelope: Envelope) -> Delivery {
        let acker = MemoryAcker {
            inner: Arc::clone(inner),
            queue: queue.to_string(),
            envelope: Some(envelope.clone()),
        };
        Delivery::new(envelope, Box::new(acker))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.inner.queues().entry(queue.to_string()).or_default();
        debug!(%queue, "Queue declared");
        Ok(())
    }

    async fn bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut queues = self.inner.queues();
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        state
            .bindings
            .insert((exchange.to_string(), routing_key.to_string()));
        Ok(())
    }

    async fn unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut queues = self.inner.queues();
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        state
            .bindings
            .remove(&(exchange.to_string(), routing_key.to_string()));
        Ok(())
    }

    async fn purge(&self, queue: &str) -> Result<usize, BrokerError> {
        let mut queues = self.inner.queues();
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        let purged = state.pending.len();
        state.pending.clear();
        info!(%queue, purged, "Queue purged");
        Ok(purged)
    }

    async fn publish(&self, outgoing: Outgoing) -> Result<(), BrokerError> {
        if let Ok(mut published) = self.inner.published.lock() {
            published.push(outgoing.clone());
        }

        let Outgoing {
            exchange,
            routing_key,
            envelope,
            deliver_after,
        } = outgoing;

        match deliver_after {
            Some(delay) if !delay.is_zero() => {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    MemoryBroker::route(&inner, &exchange, &routing_key, envelope);
                });
            }
            _ => Self::route(&self.inner, &exchange, &routing_key, envelope),
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<mpsc::UnboundedReceiver<Delivery>, BrokerError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let backlog: Vec<Envelope> = {
            let mut queues = self.inner.queues();
            let state = queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
            state.consumer = Some(sender.clone());
            state.pending.drain(..).collect()
        };

        for envelope in backlog {
            let delivery = Self::delivery(&self.inner, queue, envelope);
            let _ = sender.send(delivery);
        }

        info!(%queue, "Consumer attached");
        Ok(receiver)
    }

    fn connection_errors(&self) -> broadcast::Receiver<BrokerError> {
        self.inner.errors.subscribe()
    }
}

/// Settles a `MemoryBroker` delivery. Requeues on drop if never settled.
struct MemoryAcker {
    inner: Arc<Inner>,
    queue: String,
    envelope: Option<Envelope>,
}

impl MemoryAcker {
    fn requeue(&mut self) {
        if let Some(envelope) = self.envelope.take() {
            MemoryBroker::enqueue(&self.inner, &self.queue, envelope.redelivered());
        }
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        let mut this = self;
        this.envelope = None;
        Ok(())
    }

    async fn nack(self: Box<Self>) -> Result<(), BrokerError> {
        let mut this = self;
        this.requeue();
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        self.requeue();
    }
}
