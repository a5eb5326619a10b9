// src/rabbitmq/topology.rs

use lapin::types::FieldTable;
use tracing::info;

use super::amqp_client::{ExchangeOptions, QueueOptions};
use super::connection::ConnectionManager;
use super::errors::{RabbitMQError, Result};

impl ConnectionManager {
    /// Declares an exchange on the current channel. Redeclaring with identical
    /// parameters is a no-op on the broker; conflicting parameters fail.
    pub async fn declare_exchange(
        &self,
        name: &str,
        kind: &str,
        options: ExchangeOptions,
        arguments: FieldTable,
    ) -> Result<()> {
        let channel = self.get_channel()?;
        channel
            .declare_exchange(name, kind, options, arguments)
            .await
            .map_err(|e| {
                RabbitMQError::TopologyError(format!("failed to declare exchange '{name}': {e}"))
            })?;
        info!(exchange = name, kind, "Declared exchange");
        Ok(())
    }

    /// Declares a queue and returns its name; pass an empty `name` to let the
    /// broker pick one.
    pub async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
        arguments: FieldTable,
    ) -> Result<String> {
        let channel = self.get_channel()?;
        let queue = channel
            .declare_queue(name, options, arguments)
            .await
            .map_err(|e| {
                RabbitMQError::TopologyError(format!("failed to declare queue '{name}': {e}"))
            })?;
        info!(queue = %queue, "Declared queue");
        Ok(queue)
    }

    pub async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<()> {
        let channel = self.get_channel()?;
        channel
            .bind_queue(queue, exchange, routing_key, arguments)
            .await
            .map_err(|e| {
                RabbitMQError::TopologyError(format!(
                    "failed to bind queue '{queue}' to exchange '{exchange}': {e}"
                ))
            })
    }
}
