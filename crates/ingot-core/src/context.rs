//! Per-message context.
//!
//! A [`Context`] is built from a raw [`Delivery`] by
//! [`Context::from_delivery`] and handed to every handler of the chain behind
//! an `Arc`. It carries:
//!
//! - the delivery itself (payload, routing metadata, properties), read-only;
//! - a map of named JSON **fields** that handlers add or overwrite, such as a
//!   parsed payload or a derived message;
//! - typed **state** slots for values that are not JSON, one per type.
//!
//! One context belongs to one pipeline execution and is dropped when that
//! execution finishes.
//!
//! ```rust,ignore
//! async fn parse_json(ctx: Arc<Context>, next: Next) -> Result<(), BoxError> {
//!     let content: Value = ctx.json()?;
//!     ctx.set("content", content);
//!     next.run().await?;
//!     Ok(())
//! }
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::delivery::{Delivery, Properties};
use crate::error::BrokerResult;

/// The per-message record threaded through the handler chain.
pub struct Context {
    delivery: Delivery,
    fields: Mutex<Map<String, Value>>,
    state: Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
}

impl Context {
    /// Builds a fresh context from a raw delivery.
    ///
    /// No validation is performed on the payload; parsing is left to
    /// handlers.
    pub fn from_delivery(delivery: Delivery) -> Self {
        Self {
            delivery,
            fields: Mutex::new(Map::new()),
            state: Mutex::new(HashMap::new()),
        }
    }

    // ─── Delivery ────────────────────────────────────────────────────────────

    /// Returns the underlying delivery.
    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    /// Returns the raw payload bytes.
    pub fn content(&self) -> &[u8] {
        &self.delivery.content
    }

    pub fn routing_key(&self) -> &str {
        &self.delivery.routing_key
    }

    pub fn exchange(&self) -> &str {
        &self.delivery.exchange
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery.delivery_tag
    }

    pub fn properties(&self) -> &Properties {
        &self.delivery.properties
    }

    /// Deserializes the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.delivery.content)
    }

    /// Acknowledges the delivery.
    ///
    /// Does nothing when the delivery was consumed in auto-ack mode.
    pub async fn ack(&self) -> BrokerResult<()> {
        match &self.delivery.acker {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }

    /// Rejects the delivery.
    ///
    /// Does nothing when the delivery was consumed in auto-ack mode.
    pub async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        match &self.delivery.acker {
            Some(acker) => acker.nack(requeue).await,
            None => Ok(()),
        }
    }

    // ─── Fields ──────────────────────────────────────────────────────────────

    /// Adds or overwrites a named field, returning the previous value.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.lock().insert(key.into(), value.into())
    }

    /// Returns a clone of a named field.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.fields.lock().get(key).cloned()
    }

    /// Deserializes a named field into `T`.
    ///
    /// Returns `None` if the field is missing or has a different shape.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.fields.lock().remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.lock().contains_key(key)
    }

    /// Returns a snapshot of all named fields.
    pub fn fields(&self) -> Map<String, Value> {
        self.fields.lock().clone()
    }

    // ─── Typed state ─────────────────────────────────────────────────────────

    /// Stores a typed value. Only one value per type is kept.
    pub fn insert_state<T: Send + Sync + 'static>(&self, value: T) {
        self.state.lock().insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Returns a clone of the stored value of type `T`.
    pub fn state<T: Clone + 'static>(&self) -> Option<T> {
        self.state
            .lock()
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    pub fn has_state<T: 'static>(&self) -> bool {
        self.state.lock().contains_key(&TypeId::of::<T>())
    }

    /// Removes and returns the stored value of type `T`.
    pub fn take_state<T: 'static>(&self) -> Option<T> {
        self.state
            .lock()
            .remove(&TypeId::of::<T>())
            .and_then(|v| v.downcast::<T>().ok())
            .map(|v| *v)
    }
}

impl From<Delivery> for Context {
    fn from(delivery: Delivery) -> Self {
        Self::from_delivery(delivery)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("delivery", &self.delivery)
            .field("fields", &*self.fields.lock())
            .finish_non_exhaustive()
    }
}
