// src/rabbitmq/mod.rs
// Resilient connection management for RabbitMQ

pub mod amqp_client;
pub mod connection;
pub mod errors;

// Further `impl ConnectionManager` blocks
mod consumer;
mod publisher;
mod reconnect;
mod topology;

mod backoff;

#[cfg(test)]
pub(crate) mod testing;

pub use amqp_client::{
    Acknowledge, AmqpChannel, AmqpConnection, Connector, DeliveryStream, ExchangeOptions,
    LapinConnector, QueueOptions,
};
pub use backoff::Backoff;
pub use connection::ConnectionManager;
pub use errors::{RabbitMQError, Result};
