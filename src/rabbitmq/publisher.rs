// src/rabbitmq/publisher.rs

use chrono::Utc;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

use super::amqp_client::Confirm;
use super::connection::ConnectionManager;
use super::errors::{is_connection_lost, RabbitMQError, Result};
use crate::message::Message;

impl ConnectionManager {
    /// Publishes a text body to the configured queue.
    pub async fn publish(&self, body: impl Into<Vec<u8>>) -> Result<()> {
        let queue = self.inner.queue_name.clone();
        self.publish_to_queue(&queue, body).await
    }

    /// Publishes a text body with `queue` as the routing key, through the
    /// configured exchange (the default exchange unless one was set).
    pub async fn publish_to_queue(&self, queue: &str, body: impl Into<Vec<u8>>) -> Result<()> {
        self.publish_with_options(Message::new(body).with_routing_key(queue))
            .await
    }

    pub async fn publish_to_exchange(
        &self,
        exchange: &str,
        routing_key: &str,
        body: impl Into<Vec<u8>>,
    ) -> Result<()> {
        self.publish_to_exchange_with_options(exchange, routing_key, Message::new(body))
            .await
    }

    /// Publishes a fully specified message to `exchange`, overriding whatever
    /// routing the message carried.
    pub async fn publish_to_exchange_with_options(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> Result<()> {
        self.publish_with_options(message.with_exchange(exchange).with_routing_key(routing_key))
            .await
    }

    /// Publishes `message` to its own exchange and routing key, falling back
    /// to the configured exchange when the message names none.
    ///
    /// Makes up to `publish_attempts` attempts. A disconnected manager is
    /// given `publish_reconnect_wait` per attempt to come back, and failures
    /// that mean the connection is gone kick off reconnection.
    pub async fn publish_with_options(&self, mut message: Message) -> Result<()> {
        let settings = &self.inner.settings;
        let attempts = settings.publish_attempts.max(1);
        let backoff = settings.publish_backoff();

        if message.message_id.is_none() {
            message.message_id = Some(Uuid::new_v4().to_string());
        }
        if message.timestamp.is_none() {
            message.timestamp = Some(Utc::now());
        }

        let mut last_error = None;
        for attempt in 0..attempts {
            let is_final = attempt + 1 == attempts;

            if !self.is_connected() {
                self.reconnect_if_stale();
            }
            if !self.wait_for_connection(settings.publish_reconnect_wait()).await {
                warn!(
                    attempt = attempt + 1,
                    attempts, "Not connected for publishing, gave up waiting"
                );
                if is_final {
                    return Err(RabbitMQError::NotConnected);
                }
                continue;
            }

            match self.try_publish(&message).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        attempt = attempt + 1,
                        attempts,
                        error = %e,
                        "Failed to publish message"
                    );
                    last_error = Some(e);
                }
            }

            if !is_final {
                sleep(backoff.delay(attempt)).await;
            }
        }

        Err(last_error.unwrap_or(RabbitMQError::NotConnected))
    }

    async fn try_publish(&self, message: &Message) -> Result<()> {
        let channel = self.get_channel()?;
        let exchange = match &message.exchange {
            Some(exchange) => exchange.clone(),
            None => self.get_exchange().0,
        };

        match channel
            .publish(&exchange, &message.routing_key, message)
            .await
        {
            Ok(Confirm::Nack) => Err(RabbitMQError::PublishError(format!(
                "broker nacked message for exchange '{}' routing key '{}'",
                exchange, message.routing_key
            ))),
            Ok(_) => {
                debug!(
                    exchange = %exchange,
                    routing_key = %message.routing_key,
                    "Message published"
                );
                Ok(())
            }
            Err(e) => {
                if is_connection_lost(&e) {
                    self.trigger_reconnect();
                }
                Err(RabbitMQError::PublishError(e.to_string()))
            }
        }
    }
}
