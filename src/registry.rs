//! Handler registration and invocation.
//!
//! The registry is mutable only before the bus starts, under its own lock.
//! `freeze` snapshots it into an immutable map that workers read without
//! locking; any registration after that is a configuration error.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use uuid::Uuid;

use crate::emit::Emitter;
use crate::envelope::Envelope;
use crate::error::{BusError, HandlerError, Result};
use crate::serialization::{Message, SerializationError};
use crate::tx::Transaction;

/// Context passed to a handler for one inbound envelope.
pub struct Invocation<'a> {
    tx: &'a mut dyn Transaction,
    emitter: Emitter<'a>,
}

impl<'a> Invocation<'a> {
    pub(crate) fn new(tx: &'a mut dyn Transaction, emitter: Emitter<'a>) -> Self {
        Self { tx, emitter }
    }

    pub fn envelope(&self) -> &Envelope {
        self.emitter.inbound()
    }

    /// The unit of work's transaction, for handlers writing their own state
    /// through the same provider.
    pub fn transaction(&mut self) -> &mut dyn Transaction {
        &mut *self.tx
    }

    pub fn decode<M: Message>(&self) -> std::result::Result<M, SerializationError> {
        self.emitter.routing().decode(self.envelope())
    }

    pub fn correlation_id(&self) -> String {
        self.emitter.correlation_id()
    }

    pub fn send<M: Message>(&mut self, queue: &str, message: &M) -> Result<Uuid> {
        self.emitter.send(queue, message)
    }

    pub fn publish<M: Message>(&mut self, message: &M) -> Result<Uuid> {
        self.emitter.publish(message)
    }

    pub fn reply<M: Message>(&mut self, message: &M) -> Result<Uuid> {
        self.emitter.reply(message)
    }
}

/// A message handler.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, invocation: &mut Invocation<'_>) -> Result<()>;
}

/// Adapter from a typed closure to `Handler`. Decodes the body as `M`; a
/// body that does not decode is a serialization error, not a handler error.
pub struct FnHandler<M, F> {
    f: F,
    _message: PhantomData<fn(M)>,
}

impl<M, F> FnHandler<M, F>
where
    M: Message,
    F: Fn(&mut Invocation<'_>, M) -> std::result::Result<(), HandlerError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _message: PhantomData,
        }
    }
}

#[async_trait]
impl<M, F> Handler for FnHandler<M, F>
where
    M: Message,
    F: Fn(&mut Invocation<'_>, M) -> std::result::Result<(), HandlerError> + Send + Sync,
{
    async fn handle(&self, invocation: &mut Invocation<'_>) -> Result<()> {
        let message = invocation.decode::<M>()?;
        (self.f)(invocation, message).map_err(|e| BusError::from_user(M::MESSAGE_TYPE, e))
    }
}

type HandlerMap = HashMap<String, Vec<Arc<dyn Handler>>>;

/// Message type → handlers, in registration order.
#[derive(Default)]
pub struct HandlerRegistry {
    building: Mutex<HandlerMap>,
    frozen: OnceLock<Arc<HandlerMap>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a handler to a message type. Fails once the registry is frozen.
    pub fn register(&self, message_type: &str, handler: Arc<dyn Handler>) -> Result<()> {
        let mut building = self
            .building
            .lock()
            .map_err(|e| BusError::Configuration(format!("handler registry poisoned: {}", e)))?;
        if self.frozen.get().is_some() {
            return Err(BusError::Configuration(format!(
                "cannot register a handler for '{}' after the bus has started",
                message_type
            )));
        }
        building
            .entry(message_type.to_string())
            .or_default()
            .push(handler);
        Ok(())
    }

    /// Stop accepting registrations and return the final table. Idempotent.
    pub fn freeze(&self) -> Arc<HandlerMap> {
        let building = self.building.lock().unwrap_or_else(|e| e.into_inner());
        let table = self.frozen.get_or_init(|| Arc::new(building.clone()));
        Arc::clone(table)
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.get().is_some()
    }

    /// Handlers for a message type. Empty before `freeze`.
    pub fn handlers_for(&self, message_type: &str) -> &[Arc<dyn Handler>] {
        self.frozen
            .get()
            .and_then(|table| table.get(message_type))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Registered message types, sorted.
    pub fn message_types(&self) -> Vec<String> {
        let mut types: Vec<String> = match self.frozen.get() {
            Some(table) => table.keys().cloned().collect(),
            None => self
                .building
                .lock()
                .map(|m| m.keys().cloned().collect())
                .unwrap_or_default(),
        };
        types.sort();
        types
    }
}
