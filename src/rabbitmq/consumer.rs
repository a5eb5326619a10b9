// src/rabbitmq/consumer.rs

use futures::StreamExt;
use lapin::types::FieldTable;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::amqp_client::{DeliveryStream, ExchangeOptions, QueueOptions};
use super::connection::ConnectionManager;
use super::errors::{RabbitMQError, Result};
use crate::message::Delivery;

/// What a consume loop subscribes to.
#[derive(Debug, Clone)]
enum ConsumeTarget {
    Queue(String),
    Exchange {
        exchange: String,
        kind: String,
        queue: String,
        routing_key: String,
    },
}

enum ConsumerState {
    WaitConnection,
    OpenConsumer,
    Streaming(DeliveryStream),
}

/// Why streaming stopped.
enum StreamEnd {
    /// A newer connection was installed; the current subscription is stale.
    Reconnected,
    /// The broker-side stream ended or failed.
    Exhausted,
    /// Nobody is reading the output channel anymore.
    ReceiverGone,
}

impl ConnectionManager {
    /// Consumes the configured queue into `out` until the receiver is
    /// dropped, resubscribing after every reconnect. Deliveries are never
    /// acknowledged here; whoever reads `out` must ack or nack them.
    pub async fn consume_with_reconnect(&self, out: mpsc::Sender<Delivery>) -> Result<()> {
        let target = ConsumeTarget::Queue(self.inner.queue_name.clone());
        self.run_consumer(&target, out).await
    }

    /// Like [`ConnectionManager::consume_with_reconnect`], but first declares
    /// `exchange`, a durable `queue`, and a binding between them with
    /// `routing_key`, again on every resubscription.
    pub async fn consume_from_exchange(
        &self,
        exchange: &str,
        kind: &str,
        queue: &str,
        routing_key: &str,
        out: mpsc::Sender<Delivery>,
    ) -> Result<()> {
        let target = ConsumeTarget::Exchange {
            exchange: exchange.to_string(),
            kind: kind.to_string(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        self.run_consumer(&target, out).await
    }

    async fn run_consumer(&self, target: &ConsumeTarget, out: mpsc::Sender<Delivery>) -> Result<()> {
        let mut generation = self.subscribe();
        let mut state = ConsumerState::WaitConnection;

        loop {
            state = match state {
                ConsumerState::WaitConnection => {
                    if self.is_connected() {
                        generation.borrow_and_update();
                    } else {
                        self.reconnect_if_stale();
                        info!("Not connected, waiting for connection...");
                        tokio::select! {
                            _ = generation.changed() => {}
                            _ = out.closed() => return Ok(()),
                        }
                    }
                    ConsumerState::OpenConsumer
                }
                ConsumerState::OpenConsumer => match self.open_consumer(target).await {
                    Ok(deliveries) => ConsumerState::Streaming(deliveries),
                    Err(e) => {
                        warn!(error = %e, "Failed to start consuming");
                        // The broker closes the channel on 404/406 replies.
                        self.reconnect_if_stale();
                        tokio::select! {
                            _ = sleep(self.inner.settings.consumer_retry_delay()) => {}
                            _ = out.closed() => return Ok(()),
                        }
                        ConsumerState::WaitConnection
                    }
                },
                ConsumerState::Streaming(mut deliveries) => {
                    match forward(&mut deliveries, &out, &mut generation).await {
                        StreamEnd::ReceiverGone => {
                            info!("Delivery receiver dropped, consumer stopping");
                            return Ok(());
                        }
                        StreamEnd::Reconnected => {
                            info!("Connection replaced during consumption, resubscribing");
                        }
                        StreamEnd::Exhausted => {
                            info!("Delivery stream closed, waiting for reconnection");
                        }
                    }
                    ConsumerState::WaitConnection
                }
            };
        }
    }

    async fn open_consumer(&self, target: &ConsumeTarget) -> Result<DeliveryStream> {
        let channel = self.get_channel()?;

        let queue = match target {
            ConsumeTarget::Queue(queue) => queue.clone(),
            ConsumeTarget::Exchange {
                exchange,
                kind,
                queue,
                routing_key,
            } => {
                channel
                    .declare_exchange(exchange, kind, ExchangeOptions::durable(), FieldTable::default())
                    .await
                    .map_err(|e| {
                        RabbitMQError::TopologyError(format!(
                            "failed to declare exchange '{exchange}': {e}"
                        ))
                    })?;
                let queue = channel
                    .declare_queue(queue, QueueOptions::durable(), FieldTable::default())
                    .await
                    .map_err(|e| {
                        RabbitMQError::TopologyError(format!("failed to declare queue '{queue}': {e}"))
                    })?;
                channel
                    .bind_queue(&queue, exchange, routing_key, FieldTable::default())
                    .await
                    .map_err(|e| {
                        RabbitMQError::TopologyError(format!(
                            "failed to bind queue '{queue}' to '{exchange}': {e}"
                        ))
                    })?;
                debug!(exchange = %exchange, queue = %queue, routing_key = %routing_key, "Bound queue");
                queue
            }
        };

        let deliveries = channel
            .consume(&queue, &self.inner.consumer_tag)
            .await
            .map_err(|e| RabbitMQError::ConsumeError(format!("failed to consume '{queue}': {e}")))?;

        info!(queue = %queue, consumer_tag = %self.inner.consumer_tag, "Started consuming messages");
        Ok(deliveries)
    }
}

/// Moves deliveries from the broker into `out` until the stream ends, the
/// connection is replaced, or the receiver goes away. A delivery already
/// taken from the broker is dropped if a reconnect wins the race to `out`.
async fn forward(
    deliveries: &mut DeliveryStream,
    out: &mpsc::Sender<Delivery>,
    generation: &mut watch::Receiver<u64>,
) -> StreamEnd {
    loop {
        tokio::select! {
            next = deliveries.next() => match next {
                Some(Ok(delivery)) => {
                    tokio::select! {
                        sent = out.send(delivery) => {
                            if sent.is_err() {
                                return StreamEnd::ReceiverGone;
                            }
                        }
                        _ = generation.changed() => {
                            warn!("Connection lost during consumption, dropping in-flight delivery");
                            return StreamEnd::Reconnected;
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Delivery stream failed");
                    return StreamEnd::Exhausted;
                }
                None => return StreamEnd::Exhausted,
            },
            _ = generation.changed() => return StreamEnd::Reconnected,
            _ = out.closed() => return StreamEnd::ReceiverGone,
        }
    }
}
