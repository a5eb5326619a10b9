// src/rabbitmq/reconnect.rs

use tokio::time::sleep;
use tracing::{info, warn};

use super::connection::ConnectionManager;

impl ConnectionManager {
    /// Reconnection supervisor. Retries `connect` with exponential backoff
    /// until it succeeds; there is no attempt limit. Only ever started through
    /// `trigger_reconnect`, which keeps it to one instance per manager.
    pub(crate) async fn reconnect(self) {
        let backoff = self.inner.settings.reconnect_backoff();
        let mut attempt: u32 = 0;

        loop {
            info!(attempt = attempt + 1, "Attempting to reconnect to RabbitMQ");

            match self.establish(true).await {
                Ok(()) => {
                    // Installing the pair advanced the generation, which wakes
                    // every waiting publisher and consumer, and cleared the
                    // reconnecting flag.
                    info!(attempts = attempt + 1, "Successfully reconnected to RabbitMQ");
                    break;
                }
                Err(e) => {
                    let delay = backoff.delay(attempt);
                    warn!(error = %e, ?delay, "Reconnection failed, retrying");
                    sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }
}
