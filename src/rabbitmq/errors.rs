// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    /// Dialing the broker or opening the channel failed.
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    /// No live channel exists right now.
    #[error("RabbitMQ is not connected")]
    NotConnected,

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    /// The broker rejected a publish, or the transport closed mid-publish.
    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    /// Exchange/queue declaration or binding failed.
    #[error("RabbitMQ topology error: {0}")]
    TopologyError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("Connection timeout: {0}")]
    TimeoutError(String),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl From<Elapsed> for RabbitMQError {
    fn from(_: Elapsed) -> Self {
        RabbitMQError::TimeoutError("Connection timed out".to_string())
    }
}

/// Whether a broker error means the channel or connection underneath is gone,
/// as opposed to a failure the same channel can recover from.
pub fn is_connection_lost(error: &LapinError) -> bool {
    matches!(
        error,
        LapinError::InvalidChannelState(_)
            | LapinError::InvalidConnectionState(_)
            | LapinError::IOError(_)
    )
}
