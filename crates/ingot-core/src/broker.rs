//! Broker capability.
//!
//! The framework never speaks a wire protocol itself. Everything it needs
//! from a broker client is expressed by three traits:
//!
//! ```text
//! Broker::connect(url) ──▶ Connection::create_channel() ──▶ Channel
//!                                                            ├─ assert_exchange
//!                                                            ├─ assert_queue
//!                                                            ├─ bind_queue
//!                                                            └─ consume ──▶ DeliveryStream
//! ```
//!
//! `ingot-transport` provides an in-memory implementation and an AMQP one.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::delivery::Delivery;
use crate::error::BrokerResult;
use crate::settings::{ConsumeOptions, ExchangeOptions, ExchangeType, QueueOptions};

/// Stream of deliveries produced by [`Channel::consume`].
///
/// The stream ends when the broker closes the consumer or the connection.
pub type DeliveryStream = BoxStream<'static, BrokerResult<Delivery>>;

/// Entry point of a broker client.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Opens a connection to `url` (`amqp://[user:password@]host`).
    async fn connect(&self, url: &str) -> BrokerResult<BoxedConnection>;
}

/// An open broker connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Opens a channel on this connection.
    async fn create_channel(&self) -> BrokerResult<BoxedChannel>;

    /// Closes the connection and every channel opened on it.
    async fn close(&self) -> BrokerResult<()>;
}

/// A channel used to declare topology and consume.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Declares `name` with the given type, or checks an existing one.
    async fn assert_exchange(
        &self,
        name: &str,
        kind: ExchangeType,
        options: &ExchangeOptions,
    ) -> BrokerResult<()>;

    /// Declares a queue and returns its resolved name.
    ///
    /// A blank `name` asks the broker to generate one.
    async fn assert_queue(&self, name: &str, options: &QueueOptions) -> BrokerResult<String>;

    /// Binds `queue` to `exchange` with one routing key.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()>;

    /// Starts consuming from `queue`.
    async fn consume(&self, queue: &str, options: &ConsumeOptions) -> BrokerResult<DeliveryStream>;
}

pub type BoxedBroker = Arc<dyn Broker>;
pub type BoxedConnection = Box<dyn Connection>;
pub type BoxedChannel = Box<dyn Channel>;
