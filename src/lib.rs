//! A RabbitMQ connection manager that keeps a single connection and channel
//! alive, reconnects with exponential backoff when the broker goes away, and
//! lets publishers and consumers ride through the outage.

pub mod config;
pub mod env;
pub mod message;
pub mod rabbitmq;

pub use config::{ConnectionConfig, ManagerSettings, RabbitConfig};
pub use message::{Delivery, DeliveryMode, Message};
pub use rabbitmq::{ConnectionManager, ExchangeOptions, QueueOptions, RabbitMQError, Result};
