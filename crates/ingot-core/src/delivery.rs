//! Raw deliveries as handed over by a broker.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BrokerResult;

/// Message properties attached by the publisher.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Properties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: BTreeMap<String, Value>,
    /// 1 = transient, 2 = persistent.
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    /// Seconds since the Unix epoch.
    pub timestamp: Option<u64>,
    /// The `type` property.
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
}

/// Settles a delivery with the broker.
///
/// Only deliveries consumed without auto-acknowledgement carry one.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Positively acknowledges the delivery.
    async fn ack(&self) -> BrokerResult<()>;

    /// Rejects the delivery, optionally asking the broker to requeue it.
    async fn nack(&self, requeue: bool) -> BrokerResult<()>;
}

/// Boxed acknowledger shared between clones of a delivery.
pub type BoxedAcknowledger = Arc<dyn Acknowledger>;

/// A message as received from the broker: metadata, properties and payload.
#[derive(Clone, Default)]
pub struct Delivery {
    /// Channel-scoped tag identifying this delivery.
    pub delivery_tag: u64,
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key the message was published with.
    pub routing_key: String,
    /// Whether the broker delivered this message before.
    pub redelivered: bool,
    pub properties: Properties,
    /// Raw payload bytes.
    pub content: Vec<u8>,
    pub acker: Option<BoxedAcknowledger>,
}

impl Delivery {
    /// Creates a delivery carrying `content`, with empty metadata.
    pub fn new(content: impl Into<Vec<u8>>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    /// Sets the exchange and routing key.
    pub fn with_route(mut self, exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self.routing_key = routing_key.into();
        self
    }

    /// Sets the delivery tag.
    pub fn with_tag(mut self, tag: u64) -> Self {
        self.delivery_tag = tag;
        self
    }

    /// Sets the message properties.
    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    /// Attaches an acknowledger.
    pub fn with_acker(mut self, acker: BoxedAcknowledger) -> Self {
        self.acker = Some(acker);
        self
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("content_len", &self.content.len())
            .field("acker", &self.acker.is_some())
            .finish()
    }
}
