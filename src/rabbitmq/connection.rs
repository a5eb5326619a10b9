// src/rabbitmq/connection.rs
//
// Owns the live connection/channel pair and everything that decides whether
// it is usable. Publishing, consuming and topology live in sibling modules as
// further `impl ConnectionManager` blocks.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use lapin::types::FieldTable;
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::amqp_client::{AmqpChannel, AmqpConnection, Connector, ExchangeOptions, LapinConnector};
use super::errors::{RabbitMQError, Result};
use crate::config::{ConnectionConfig, ManagerSettings, RabbitConfig};

/// Cheap-to-clone handle to one managed broker connection. Clones share the
/// same connection, channel and reconnect state.
#[derive(Clone)]
pub struct ConnectionManager {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) url: String,
    pub(crate) queue_name: String,
    pub(crate) consumer_tag: String,
    pub(crate) settings: ManagerSettings,
    connector: Arc<dyn Connector>,
    state: RwLock<ConnectionState>,
    /// Bumped every time a new connection is installed. Waiters subscribe
    /// and are all woken together.
    generation: watch::Sender<u64>,
}

struct ConnectionState {
    connection: Option<Arc<dyn AmqpConnection>>,
    channel: Option<Arc<dyn AmqpChannel>>,
    reconnecting: bool,
    /// Dropping this stops the close monitor of the current connection.
    retire_monitor: Option<oneshot::Sender<()>>,
    exchange_name: String,
    exchange_type: String,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_connector(config, ManagerSettings::default(), Arc::new(LapinConnector::default()))
    }

    pub fn from_config(config: RabbitConfig) -> Self {
        Self::with_connector(
            config.connection,
            config.settings,
            Arc::new(LapinConnector::default()),
        )
    }

    pub fn with_connector(
        config: ConnectionConfig,
        settings: ManagerSettings,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                url: config.url,
                queue_name: config.queue_name,
                consumer_tag: config.consumer_tag,
                settings,
                connector,
                state: RwLock::new(ConnectionState {
                    connection: None,
                    channel: None,
                    reconnecting: false,
                    retire_monitor: None,
                    exchange_name: config.exchange_name,
                    exchange_type: config.exchange_type,
                }),
                generation,
            }),
        }
    }

    /// Opens a connection and channel, declares the configured exchange and
    /// starts watching the connection for unexpected closure.
    ///
    /// Calling this while already connected replaces the current pair with a
    /// fresh one; gate repeated calls with [`ConnectionManager::is_connected`].
    pub async fn connect(&self) -> Result<()> {
        self.establish(false).await
    }

    /// `connect` proper. The supervisor passes `ends_reconnect` so the
    /// reconnecting flag drops under the same lock that installs the new pair;
    /// a close monitor spawned for that pair can then always start a fresh
    /// supervisor.
    pub(crate) async fn establish(&self, ends_reconnect: bool) -> Result<()> {
        let settings = &self.inner.settings;
        let (exchange_name, exchange_type) = self.get_exchange();

        debug!(queue = %self.inner.queue_name, "Connecting to RabbitMQ");
        let connection = timeout(
            settings.connect_timeout(),
            self.inner.connector.connect(&self.inner.url),
        )
        .await
        .map_err(|_| {
            RabbitMQError::ConnectionError(format!(
                "timed out after {:?} dialing the broker",
                settings.connect_timeout()
            ))
        })?
        .map_err(|e| RabbitMQError::ConnectionError(format!("failed to connect: {e}")))?;

        let channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close().await;
                return Err(RabbitMQError::ConnectionError(format!(
                    "failed to open channel: {e}"
                )));
            }
        };

        if let Err(e) = self
            .prepare_channel(channel.as_ref(), &exchange_name, &exchange_type)
            .await
        {
            let _ = channel.close().await;
            let _ = connection.close().await;
            return Err(e);
        }

        let close_events = connection.close_events();
        let (retire_tx, retire_rx) = oneshot::channel();
        let replaced = {
            let mut state = self.write_state();
            if state.connection.as_ref().is_some_and(|c| !c.is_closed()) {
                warn!("Replacing a live RabbitMQ connection");
            }
            // Dropping the previous sender retires the previous monitor.
            state.retire_monitor = Some(retire_tx);
            if ends_reconnect {
                state.reconnecting = false;
            }
            (
                state.channel.replace(channel),
                state.connection.replace(connection),
            )
        };
        self.inner.generation.send_modify(|generation| *generation += 1);

        tokio::spawn(self.clone().monitor_connection(close_events, retire_rx));

        if let (old_channel, Some(old_connection)) = replaced {
            if let Some(old_channel) = old_channel {
                let _ = old_channel.close().await;
            }
            if let Err(e) = old_connection.close().await {
                debug!(error = %e, "Previous connection was already gone");
            }
        }

        info!("Connected to RabbitMQ");
        Ok(())
    }

    async fn prepare_channel(
        &self,
        channel: &dyn AmqpChannel,
        exchange_name: &str,
        exchange_type: &str,
    ) -> Result<()> {
        let settings = &self.inner.settings;
        if settings.prefetch_count > 0 {
            channel
                .qos(settings.prefetch_count)
                .await
                .map_err(|e| RabbitMQError::ChannelError(format!("failed to set prefetch: {e}")))?;
        }
        if settings.publisher_confirms {
            channel.enable_confirms().await.map_err(|e| {
                RabbitMQError::ChannelError(format!("failed to enable publisher confirms: {e}"))
            })?;
        }
        if !exchange_name.is_empty() {
            channel
                .declare_exchange(
                    exchange_name,
                    exchange_type,
                    ExchangeOptions::durable(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    RabbitMQError::TopologyError(format!(
                        "failed to declare exchange '{exchange_name}': {e}"
                    ))
                })?;
            info!(exchange = exchange_name, kind = exchange_type, "Declared exchange");
        }
        Ok(())
    }

    /// Closes the channel, then the connection. Returns the first teardown
    /// error; both handles are gone afterwards either way.
    pub async fn close(&self) -> Result<()> {
        let (channel, connection) = {
            let mut state = self.write_state();
            state.retire_monitor = None;
            (state.channel.take(), state.connection.take())
        };

        let mut first_error = None;
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                first_error = Some(RabbitMQError::ChannelError(format!(
                    "failed to close channel: {e}"
                )));
            }
        }
        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                first_error.get_or_insert(RabbitMQError::ConnectionError(format!(
                    "failed to close connection: {e}"
                )));
            }
        }

        info!("Closed RabbitMQ connection");
        first_error.map_or(Ok(()), Err)
    }

    /// True while the connection is up and its channel has not been closed by
    /// the broker.
    pub fn is_connected(&self) -> bool {
        let state = self.read_state();
        state.connection.as_ref().is_some_and(|c| !c.is_closed())
            && state.channel.as_ref().is_some_and(|c| c.is_open())
    }

    pub fn get_channel(&self) -> Result<Arc<dyn AmqpChannel>> {
        self.read_state()
            .channel
            .clone()
            .ok_or(RabbitMQError::NotConnected)
    }

    /// Changes the exchange used by publishes that don't name one, and the
    /// exchange declared on the next connect.
    pub fn set_exchange(&self, exchange_name: &str, exchange_type: &str) {
        let mut state = self.write_state();
        state.exchange_name = exchange_name.to_string();
        state.exchange_type = exchange_type.to_string();
    }

    /// Returns `(exchange_name, exchange_type)`.
    pub fn get_exchange(&self) -> (String, String) {
        let state = self.read_state();
        (state.exchange_name.clone(), state.exchange_type.clone())
    }

    pub fn is_reconnecting(&self) -> bool {
        self.read_state().reconnecting
    }

    pub fn queue_name(&self) -> &str {
        &self.inner.queue_name
    }

    pub fn consumer_tag(&self) -> &str {
        &self.inner.consumer_tag
    }

    /// Waits until the manager is connected or a reconnect is announced,
    /// for at most `limit`. Returns `false` on timeout.
    pub async fn wait_for_connection(&self, limit: Duration) -> bool {
        // Subscribe before checking so a reconnect in between is not missed.
        let mut generation = self.subscribe();
        if self.is_connected() {
            return true;
        }
        matches!(timeout(limit, generation.changed()).await, Ok(Ok(())))
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.generation.subscribe()
    }

    /// Starts the reconnection supervisor unless one is already running.
    /// Returns whether this call started it. Useful after a failed initial
    /// `connect` to keep retrying in the background.
    pub fn trigger_reconnect(&self) -> bool {
        {
            let mut state = self.write_state();
            if state.reconnecting {
                debug!("Reconnection already in progress");
                return false;
            }
            state.reconnecting = true;
        }

        tokio::spawn(self.clone().reconnect());
        true
    }

    /// Starts the supervisor when handles are installed but no longer usable,
    /// e.g. the broker closed the channel and left the connection up. Nothing
    /// happens after an explicit `close`.
    pub(crate) fn reconnect_if_stale(&self) -> bool {
        let stale = {
            let state = self.read_state();
            state.connection.is_some()
                && !(state.connection.as_ref().is_some_and(|c| !c.is_closed())
                    && state.channel.as_ref().is_some_and(|c| c.is_open()))
        };
        if stale {
            warn!("RabbitMQ channel is no longer usable");
        }
        stale && self.trigger_reconnect()
    }

    async fn monitor_connection(
        self,
        close_events: oneshot::Receiver<lapin::Error>,
        retired: oneshot::Receiver<()>,
    ) {
        tokio::select! {
            biased;
            _ = retired => debug!("Connection retired, close monitor exiting"),
            cause = close_events => {
                if let Ok(cause) = cause {
                    warn!(error = %cause, "RabbitMQ connection lost");
                    self.trigger_reconnect();
                }
            }
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, ConnectionState> {
        self.inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, ConnectionState> {
        self.inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
