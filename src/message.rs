use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::BasicProperties;
use serde::Serialize;

use crate::rabbitmq::amqp_client::Acknowledge;
use crate::rabbitmq::{RabbitMQError, Result};

pub const TEXT_PLAIN: &str = "text/plain";
pub const APPLICATION_JSON: &str = "application/json";

/// AMQP delivery mode. Persistent messages survive a broker restart when
/// they sit in a durable queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    #[default]
    Transient,
    Persistent,
}

impl DeliveryMode {
    pub fn as_u8(self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
        }
    }

    pub fn from_u8(mode: u8) -> Self {
        if mode == 2 {
            DeliveryMode::Persistent
        } else {
            DeliveryMode::Transient
        }
    }
}

/// An outgoing (or received) message and where it should be routed.
#[derive(Clone, Debug)]
pub struct Message {
    pub body: Vec<u8>,
    pub content_type: String,
    pub delivery_mode: DeliveryMode,
    pub priority: Option<u8>,
    pub headers: FieldTable,
    pub routing_key: String,
    /// `None` publishes through the manager's configured exchange,
    /// `Some("")` targets the broker's default exchange explicitly.
    pub exchange: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    /// A transient `text/plain` message with no routing information.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            content_type: TEXT_PLAIN.to_string(),
            delivery_mode: DeliveryMode::Transient,
            priority: None,
            headers: FieldTable::default(),
            routing_key: String::new(),
            exchange: None,
            message_id: None,
            timestamp: None,
        }
    }

    /// Serializes `payload` with serde_json and tags it `application/json`.
    pub fn json<T: Serialize>(payload: &T) -> Result<Self> {
        let body = serde_json::to_vec(payload)?;
        Ok(Self::new(body).with_content_type(APPLICATION_JSON))
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn persistent(mut self) -> Self {
        self.delivery_mode = DeliveryMode::Persistent;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Adds a string header, replacing any previous value for `key`.
    pub fn with_header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.insert(
            ShortString::from(key),
            AMQPValue::LongString(LongString::from(value.into())),
        );
        self
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn body_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub(crate) fn properties(&self) -> BasicProperties {
        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(self.content_type.as_str()))
            .with_delivery_mode(self.delivery_mode.as_u8())
            .with_headers(self.headers.clone());

        if let Some(priority) = self.priority {
            properties = properties.with_priority(priority);
        }
        if let Some(message_id) = &self.message_id {
            properties = properties.with_message_id(ShortString::from(message_id.as_str()));
        }
        if let Some(timestamp) = self.timestamp {
            properties = properties.with_timestamp(timestamp.timestamp().max(0) as u64);
        }
        properties
    }

    pub(crate) fn from_properties(body: Vec<u8>, properties: &BasicProperties) -> Self {
        let mut message = Message::new(body);
        if let Some(content_type) = properties.content_type() {
            message.content_type = content_type.as_str().to_string();
        }
        if let Some(mode) = properties.delivery_mode() {
            message.delivery_mode = DeliveryMode::from_u8(*mode);
        }
        message.priority = *properties.priority();
        if let Some(headers) = properties.headers() {
            message.headers = headers.clone();
        }
        message.message_id = properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_string());
        message.timestamp = properties
            .timestamp()
            .and_then(|secs| DateTime::from_timestamp(secs as i64, 0));
        message
    }
}

/// A message handed to a consumer. The reader of the output channel owns
/// acknowledgement; nothing is acked automatically.
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub message: Message,
    acker: Arc<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        redelivered: bool,
        message: Message,
        acker: Arc<dyn Acknowledge>,
    ) -> Self {
        Self {
            delivery_tag,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            redelivered,
            message,
            acker,
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.message.body
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker
            .ack()
            .await
            .map_err(|e| RabbitMQError::AckError(format!("ack {}: {}", self.delivery_tag, e)))
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker
            .nack(requeue)
            .await
            .map_err(|e| RabbitMQError::AckError(format!("nack {}: {}", self.delivery_tag, e)))
    }

    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker
            .reject(requeue)
            .await
            .map_err(|e| RabbitMQError::AckError(format!("reject {}: {}", self.delivery_tag, e)))
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}
