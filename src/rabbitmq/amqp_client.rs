// src/rabbitmq/amqp_client.rs
//
// Transport seam between the connection manager and the broker. The manager
// only ever talks to these traits; `LapinConnector` is the production
// implementation.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::oneshot;
use tracing::debug;

use crate::message::{Delivery, Message};

/// AMQP reply code for a normal shutdown.
const REPLY_SUCCESS: u16 = 200;

pub type DeliveryStream = BoxStream<'static, lapin::Result<Delivery>>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub no_wait: bool,
}

impl ExchangeOptions {
    /// Durable, not auto-deleted, not internal.
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Self::default()
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub no_wait: bool,
}

impl QueueOptions {
    /// Durable, not exclusive, not auto-deleted.
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Self::default()
        }
    }
}

/// Broker answer to a publish when publisher confirms are enabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Confirm {
    Ack,
    Nack,
    NotRequested,
}

/// Opens broker connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> lapin::Result<Arc<dyn AmqpConnection>>;
}

#[async_trait]
pub trait AmqpConnection: Send + Sync {
    async fn open_channel(&self) -> lapin::Result<Arc<dyn AmqpChannel>>;

    /// Subscribes to the connection's unexpected close. The receiver resolves
    /// with the cause at most once; a clean close never resolves it.
    fn close_events(&self) -> oneshot::Receiver<lapin::Error>;

    fn is_closed(&self) -> bool;

    async fn close(&self) -> lapin::Result<()>;
}

#[async_trait]
pub trait AmqpChannel: Send + Sync {
    async fn qos(&self, prefetch_count: u16) -> lapin::Result<()>;

    async fn enable_confirms(&self) -> lapin::Result<()>;

    async fn declare_exchange(
        &self,
        name: &str,
        kind: &str,
        options: ExchangeOptions,
        arguments: FieldTable,
    ) -> lapin::Result<()>;

    /// Returns the queue name, which the broker assigns when `name` is empty.
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
        arguments: FieldTable,
    ) -> lapin::Result<String>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> lapin::Result<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> lapin::Result<Confirm>;

    /// Starts a manual-ack consumer.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> lapin::Result<DeliveryStream>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> lapin::Result<()>;
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> lapin::Result<()>;

    async fn nack(&self, requeue: bool) -> lapin::Result<()>;

    async fn reject(&self, requeue: bool) -> lapin::Result<()>;
}

/// Maps a configured exchange type onto lapin's kind; unknown types are
/// passed through for plugin exchanges.
pub fn exchange_kind(kind: &str) -> ExchangeKind {
    match kind {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "headers" => ExchangeKind::Headers,
        "topic" => ExchangeKind::Topic,
        other => ExchangeKind::Custom(other.to_string()),
    }
}

#[derive(Default, Clone)]
pub struct LapinConnector {
    properties: ConnectionProperties,
}

impl LapinConnector {
    pub fn new(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(&self, url: &str) -> lapin::Result<Arc<dyn AmqpConnection>> {
        let connection = Connection::connect(url, self.properties.clone()).await?;
        Ok(Arc::new(LapinConnection { connection }))
    }
}

struct LapinConnection {
    connection: Connection,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    async fn open_channel(&self) -> lapin::Result<Arc<dyn AmqpChannel>> {
        let channel = self.connection.create_channel().await?;
        debug!(channel_id = channel.id(), "Opened channel");
        Ok(Arc::new(LapinChannel { channel }))
    }

    fn close_events(&self) -> oneshot::Receiver<lapin::Error> {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        self.connection.on_error(move |error| {
            let sender = tx.lock().ok().and_then(|mut slot| slot.take());
            if let Some(sender) = sender {
                let _ = sender.send(error);
            }
        });
        rx
    }

    fn is_closed(&self) -> bool {
        !self.connection.status().connected()
    }

    async fn close(&self) -> lapin::Result<()> {
        self.connection.close(REPLY_SUCCESS, "Closing connection").await
    }
}

struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn qos(&self, prefetch_count: u16) -> lapin::Result<()> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
    }

    async fn enable_confirms(&self) -> lapin::Result<()> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: &str,
        options: ExchangeOptions,
        arguments: FieldTable,
    ) -> lapin::Result<()> {
        self.channel
            .exchange_declare(
                name,
                exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    internal: options.internal,
                    nowait: options.no_wait,
                    ..ExchangeDeclareOptions::default()
                },
                arguments,
            )
            .await
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
        arguments: FieldTable,
    ) -> lapin::Result<String> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    nowait: options.no_wait,
                    ..QueueDeclareOptions::default()
                },
                arguments,
            )
            .await?;
        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> lapin::Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                arguments,
            )
            .await
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> lapin::Result<Confirm> {
        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                message.properties(),
            )
            .await?
            .await?;

        Ok(if confirmation.is_nack() {
            Confirm::Nack
        } else if confirmation.is_ack() {
            Confirm::Ack
        } else {
            Confirm::NotRequested
        })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> lapin::Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(consumer
            .map(|delivery| delivery.map(into_delivery))
            .boxed())
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) -> lapin::Result<()> {
        self.channel.close(REPLY_SUCCESS, "Closing channel").await
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let message = Message::from_properties(delivery.data, &delivery.properties);
    Delivery::new(
        delivery.delivery_tag,
        delivery.exchange.as_str(),
        delivery.routing_key.as_str(),
        delivery.redelivered,
        message,
        Arc::new(delivery.acker),
    )
}

#[async_trait]
impl Acknowledge for Acker {
    async fn ack(&self) -> lapin::Result<()> {
        Acker::ack(self, BasicAckOptions::default()).await
    }

    async fn nack(&self, requeue: bool) -> lapin::Result<()> {
        Acker::nack(
            self,
            BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            },
        )
        .await
    }

    async fn reject(&self, requeue: bool) -> lapin::Result<()> {
        Acker::reject(self, BasicRejectOptions { requeue }).await
    }
}
