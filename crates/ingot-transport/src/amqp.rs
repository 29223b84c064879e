//! AMQP 0-9-1 broker backed by `lapin`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use ingot_core::{
    Acknowledger, BoxedChannel, BoxedConnection, Broker, BrokerError, BrokerResult, Channel,
    Connection, ConsumeOptions, Delivery, DeliveryStream, ExchangeOptions, ExchangeType,
    Properties, QueueOptions,
};
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::types::FieldTable;
use lapin::{BasicProperties, ConnectionProperties, ExchangeKind};
use tracing::{debug, info};

/// Maps a `lapin` error onto the broker error taxonomy.
fn map_error(err: lapin::Error) -> BrokerError {
    match &err {
        lapin::Error::ProtocolError(amqp) => {
            let message = amqp.get_message().to_string();
            match amqp.kind() {
                AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                    BrokerError::PreconditionFailed(message)
                }
                AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => BrokerError::NotFound(message),
                AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED)
                | AMQPErrorKind::Soft(AMQPSoftError::RESOURCELOCKED) => {
                    BrokerError::AccessRefused(message)
                }
                _ => BrokerError::Protocol(err.to_string()),
            }
        }
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            BrokerError::ConnectionClosed {
                reason: err.to_string(),
            }
        }
        _ => BrokerError::Protocol(err.to_string()),
    }
}

fn exchange_kind(kind: ExchangeType) -> ExchangeKind {
    match kind {
        ExchangeType::Fanout => ExchangeKind::Fanout,
        ExchangeType::Direct => ExchangeKind::Direct,
        ExchangeType::Topic => ExchangeKind::Topic,
        ExchangeType::Headers => ExchangeKind::Headers,
    }
}

fn convert_properties(props: &BasicProperties) -> Properties {
    let text = |value: &Option<lapin::types::ShortString>| value.as_ref().map(|s| s.to_string());

    let headers = props
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .map(|(key, value)| {
                    (
                        key.to_string(),
                        serde_json::to_value(value).unwrap_or_default(),
                    )
                })
                .collect()
        })
        .unwrap_or_else(BTreeMap::new);

    Properties {
        content_type: text(props.content_type()),
        content_encoding: text(props.content_encoding()),
        headers,
        delivery_mode: *props.delivery_mode(),
        priority: *props.priority(),
        correlation_id: text(props.correlation_id()),
        reply_to: text(props.reply_to()),
        expiration: text(props.expiration()),
        message_id: text(props.message_id()),
        timestamp: *props.timestamp(),
        kind: text(props.kind()),
        user_id: text(props.user_id()),
        app_id: text(props.app_id()),
    }
}

fn convert_delivery(delivery: lapin::message::Delivery, manual_ack: bool) -> Delivery {
    let acker: Option<ingot_core::BoxedAcknowledger> = manual_ack.then(|| {
        Arc::new(AmqpAcker {
            acker: delivery.acker.clone(),
        }) as _
    });

    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        properties: convert_properties(&delivery.properties),
        content: delivery.data,
        acker,
    }
}

// ============================================================================
// AmqpBroker
// ============================================================================

/// Broker client speaking AMQP 0-9-1.
#[derive(Clone, Default)]
pub struct AmqpBroker {
    properties: ConnectionProperties,
}

impl AmqpBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses custom connection properties (client name, executor, ...).
    pub fn with_properties(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self, url: &str) -> BrokerResult<BoxedConnection> {
        info!(url = %ingot_core::mask_password(url), "Connecting to AMQP broker");
        let conn = lapin::Connection::connect(url, self.properties.clone())
            .await
            .map_err(|e| BrokerError::connection_failed(url, e))?;
        Ok(Box::new(AmqpConnection { conn }))
    }
}

/// An AMQP connection.
pub struct AmqpConnection {
    conn: lapin::Connection,
}

#[async_trait]
impl Connection for AmqpConnection {
    async fn create_channel(&self) -> BrokerResult<BoxedChannel> {
        let channel = self.conn.create_channel().await.map_err(map_error)?;
        debug!(channel = channel.id(), "Opened AMQP channel");
        Ok(Box::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> BrokerResult<()> {
        self.conn.close(200, "OK").await.map_err(map_error)
    }
}

/// An AMQP channel.
pub struct AmqpChannel {
    channel: lapin::Channel,
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn assert_exchange(
        &self,
        name: &str,
        kind: ExchangeType,
        options: &ExchangeOptions,
    ) -> BrokerResult<()> {
        self.channel
            .exchange_declare(
                name,
                exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    internal: options.internal,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_error)
    }

    async fn assert_queue(&self, name: &str, options: &QueueOptions) -> BrokerResult<String> {
        let queue = self
            .channel
            .queue_declare(
                name.trim(),
                QueueDeclareOptions {
                    exclusive: options.exclusive,
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_error)?;
        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_error)
    }

    async fn consume(&self, queue: &str, options: &ConsumeOptions) -> BrokerResult<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &options.consumer_tag,
                BasicConsumeOptions {
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_error)?;

        let manual_ack = !options.no_ack;
        Ok(consumer
            .map(move |item| {
                item.map(|delivery| convert_delivery(delivery, manual_ack))
                    .map_err(map_error)
            })
            .boxed())
    }
}

struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> BrokerResult<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(map_error)
    }

    async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(map_error)
    }
}
