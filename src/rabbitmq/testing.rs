// src/rabbitmq/testing.rs
//
// In-memory broker for unit tests. Routes through default, direct, topic,
// fanout and headers exchanges, buffers messages for queues without consumers,
// and can drop connections, close channels or fail publishes on demand.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{ChannelState, ConnectionState};
use tokio::sync::oneshot;

use super::amqp_client::{
    Acknowledge, AmqpChannel, AmqpConnection, Confirm, Connector, DeliveryStream, ExchangeOptions,
    QueueOptions,
};
use super::connection::ConnectionManager;
use crate::config::{ConnectionConfig, ManagerSettings};
use crate::message::{Delivery, Message};

pub(crate) fn manager(broker: &MockBroker, config: ConnectionConfig) -> ConnectionManager {
    manager_with_settings(broker, config, ManagerSettings::default())
}

pub(crate) fn manager_with_settings(
    broker: &MockBroker,
    config: ConnectionConfig,
    settings: ManagerSettings,
) -> ConnectionManager {
    ConnectionManager::with_connector(config, settings, Arc::new(broker.clone()))
}

/// Lets spawned tasks run without advancing a paused clock.
pub(crate) async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum PublishFault {
    /// The transport went away mid-publish.
    ConnectionLost,
    /// A failure that leaves the channel usable.
    Rejected,
    /// Publisher confirm came back negative.
    Nacked,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ExchangeRecord {
    pub kind: String,
    pub options: ExchangeOptions,
}

#[derive(Clone, Debug)]
pub(crate) struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub message: Message,
}

#[derive(Clone, Default)]
pub(crate) struct MockBroker {
    shared: Arc<Mutex<Shared>>,
}

#[derive(Default)]
struct Shared {
    unreachable: bool,
    fail_channel_opens: bool,
    fail_closes: bool,
    fail_consumes: usize,
    sever_next_connection: bool,
    connect_attempts: usize,
    links: Vec<Arc<Link>>,
    channels: Vec<Arc<AtomicBool>>,
    exchanges: HashMap<String, ExchangeRecord>,
    exchange_declarations: HashMap<String, usize>,
    queues: HashMap<String, QueueRecord>,
    bindings: Vec<Binding>,
    publish_attempts: usize,
    publish_fault: Option<(PublishFault, usize)>,
    published: Vec<PublishedMessage>,
    confirms_enabled: bool,
    next_delivery_tag: u64,
    acked: Vec<u64>,
    nacked: Vec<u64>,
}

#[derive(Default)]
struct QueueRecord {
    options: Option<QueueOptions>,
    buffered: VecDeque<(String, String, Message)>,
    consumers: Vec<(String, UnboundedSender<lapin::Result<Delivery>>)>,
}

struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
    arguments: FieldTable,
}

#[derive(Default)]
struct Link {
    closed: AtomicBool,
    /// Dies as soon as someone subscribes to its close events.
    severed: bool,
    close_tx: Mutex<Option<oneshot::Sender<lapin::Error>>>,
}

impl Link {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn closed_connection() -> lapin::Error {
    lapin::Error::InvalidConnectionState(ConnectionState::Closed)
}

fn closed_channel() -> lapin::Error {
    lapin::Error::InvalidChannelState(ChannelState::Closed)
}

fn connection_reset() -> lapin::Error {
    lapin::Error::IOError(Arc::new(io::Error::new(
        io::ErrorKind::ConnectionReset,
        "connection reset by broker",
    )))
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, Shared> {
        lock(&self.shared)
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state().unreachable = !reachable;
    }

    pub fn fail_channel_opens(&self, fail: bool) {
        self.state().fail_channel_opens = fail;
    }

    pub fn fail_closes(&self, fail: bool) {
        self.state().fail_closes = fail;
    }

    /// The next `count` publishes fail with `fault`.
    pub fn fail_publishes(&self, fault: PublishFault, count: usize) {
        self.state().publish_fault = Some((fault, count));
    }

    pub fn preexisting_exchange(&self, name: &str, kind: &str) {
        self.state().exchanges.insert(
            name.to_string(),
            ExchangeRecord {
                kind: kind.to_string(),
                options: ExchangeOptions::durable(),
            },
        );
    }

    /// Simulates the broker going away: every open connection is marked
    /// closed, reports a close cause, and loses its consumers.
    pub fn drop_connections(&self) {
        let mut state = self.state();
        for link in state.links.drain(..) {
            link.closed.store(true, Ordering::SeqCst);
            if let Some(tx) = lock(&link.close_tx).take() {
                let _ = tx.send(connection_reset());
            }
        }
        for queue in state.queues.values_mut() {
            queue.consumers.clear();
        }
    }

    /// Closes every channel the way a broker error reply does, leaving the
    /// connections up. Consumers on those channels see their streams end.
    pub fn close_channels(&self) {
        let mut state = self.state();
        for channel in state.channels.drain(..) {
            channel.store(true, Ordering::SeqCst);
        }
        for queue in state.queues.values_mut() {
            queue.consumers.clear();
        }
    }

    /// The next `count` consume requests fail and close their channel, like a
    /// 404 on basic.consume.
    pub fn fail_consumes(&self, count: usize) {
        self.state().fail_consumes = count;
    }

    /// The next connection opens fine but is reported lost as soon as its
    /// close events are watched.
    pub fn sever_next_connection(&self) {
        self.state().sever_next_connection = true;
    }

    /// Ends the delivery streams of every consumer on `queue`.
    pub fn cancel_consumers(&self, queue: &str) {
        if let Some(queue) = self.state().queues.get_mut(queue) {
            queue.consumers.clear();
        }
    }

    pub fn connect_attempts(&self) -> usize {
        self.state().connect_attempts
    }

    pub fn open_connections(&self) -> usize {
        self.state().links.iter().filter(|l| !l.is_closed()).count()
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeRecord> {
        self.state().exchanges.get(name).cloned()
    }

    pub fn exchange_declarations(&self, name: &str) -> usize {
        self.state()
            .exchange_declarations
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn queue_options(&self, name: &str) -> Option<QueueOptions> {
        self.state().queues.get(name).and_then(|q| q.options)
    }

    pub fn is_bound(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.state()
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.routing_key == routing_key)
    }

    /// Messages waiting in `queue` for a consumer.
    pub fn buffered(&self, queue: &str) -> Vec<Message> {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.buffered.iter().map(|(_, _, message)| message.clone()).collect())
            .unwrap_or_default()
    }

    pub fn consumer_tags(&self, queue: &str) -> Vec<String> {
        self.state()
            .queues
            .get(queue)
            .map(|q| {
                q.consumers
                    .iter()
                    .filter(|(_, tx)| !tx.is_closed())
                    .map(|(tag, _)| tag.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn publish_attempts(&self) -> usize {
        self.state().publish_attempts
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }

    pub fn confirms_enabled(&self) -> bool {
        self.state().confirms_enabled
    }

    pub fn acked(&self) -> Vec<u64> {
        self.state().acked.clone()
    }

    pub fn nacked(&self) -> Vec<u64> {
        self.state().nacked.clone()
    }
}

impl Shared {
    fn route(&self, exchange: &str, routing_key: &str, headers: &FieldTable) -> Vec<String> {
        if exchange.is_empty() {
            return vec![routing_key.to_string()];
        }
        let Some(record) = self.exchanges.get(exchange) else {
            return Vec::new();
        };
        self.bindings
            .iter()
            .filter(|b| {
                b.exchange == exchange
                    && match record.kind.as_str() {
                        "fanout" => true,
                        "topic" => topic_matches(&b.routing_key, routing_key),
                        "direct" => b.routing_key == routing_key,
                        "headers" => headers_match(&b.arguments, headers),
                        other => unreachable!("exchange kind {other} is rejected on declare"),
                    }
            })
            .map(|b| b.queue.clone())
            .collect()
    }

    fn enqueue(&mut self, shared: &Weak<Mutex<Shared>>, queue: &str, item: (String, String, Message)) {
        self.queues.entry(queue.to_string()).or_default().buffered.push_back(item);
        self.dispatch(shared, queue);
    }

    fn dispatch(&mut self, shared: &Weak<Mutex<Shared>>, queue: &str) {
        loop {
            let Some(record) = self.queues.get_mut(queue) else {
                return;
            };
            record.consumers.retain(|(_, tx)| !tx.is_closed());
            if record.consumers.is_empty() {
                return;
            }
            let Some((exchange, routing_key, message)) = record.buffered.pop_front() else {
                return;
            };

            self.next_delivery_tag += 1;
            let tag = self.next_delivery_tag;
            let acker = Arc::new(MockAcker {
                tag,
                shared: shared.clone(),
            });
            let delivery = Delivery::new(tag, exchange, routing_key, false, message, acker);
            if let Some((_, consumer)) = self.queues.get(queue).and_then(|q| q.consumers.first()) {
                let _ = consumer.unbounded_send(Ok(delivery));
            }
        }
    }
}

/// Headers exchange matching: every non `x-` binding argument must equal the
/// message header (`x-match: all`, the default), or at least one must
/// (`x-match: any`).
fn headers_match(arguments: &FieldTable, headers: &FieldTable) -> bool {
    let match_any = match arguments.inner().get(&ShortString::from("x-match")) {
        Some(AMQPValue::LongString(mode)) => mode.as_bytes() == b"any",
        Some(AMQPValue::ShortString(mode)) => mode.as_str() == "any",
        _ => false,
    };
    let mut wanted = arguments
        .inner()
        .iter()
        .filter(|(key, _)| !key.as_str().starts_with("x-"))
        .map(|(key, value)| headers.inner().get(key) == Some(value));

    if match_any {
        wanted.any(|matched| matched)
    } else {
        wanted.all(|matched| matched)
    }
}

/// AMQP topic matching: `*` is one word, `#` is zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(word), Some(part)) if word == part => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

#[async_trait]
impl Connector for MockBroker {
    async fn connect(&self, _url: &str) -> lapin::Result<Arc<dyn AmqpConnection>> {
        let mut state = self.state();
        state.connect_attempts += 1;
        if state.unreachable {
            return Err(lapin::Error::IOError(Arc::new(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            ))));
        }
        let link = Arc::new(Link {
            severed: std::mem::take(&mut state.sever_next_connection),
            ..Link::default()
        });
        state.links.push(link.clone());
        Ok(Arc::new(MockConnection {
            link,
            shared: self.shared.clone(),
        }))
    }
}

struct MockConnection {
    link: Arc<Link>,
    shared: Arc<Mutex<Shared>>,
}

#[async_trait]
impl AmqpConnection for MockConnection {
    async fn open_channel(&self) -> lapin::Result<Arc<dyn AmqpChannel>> {
        if self.link.is_closed() {
            return Err(closed_connection());
        }
        if lock(&self.shared).fail_channel_opens {
            return Err(lapin::Error::ChannelsLimitReached);
        }
        let closed = Arc::new(AtomicBool::new(false));
        lock(&self.shared).channels.push(closed.clone());
        Ok(Arc::new(MockChannel {
            link: self.link.clone(),
            closed,
            shared: self.shared.clone(),
        }))
    }

    fn close_events(&self) -> oneshot::Receiver<lapin::Error> {
        let (tx, rx) = oneshot::channel();
        if self.link.severed {
            self.link.closed.store(true, Ordering::SeqCst);
            let _ = tx.send(connection_reset());
        } else {
            *lock(&self.link.close_tx) = Some(tx);
        }
        rx
    }

    fn is_closed(&self) -> bool {
        self.link.is_closed()
    }

    async fn close(&self) -> lapin::Result<()> {
        // A real close is a broker round trip; let other tasks run meanwhile.
        tokio::task::yield_now().await;
        let was_closed = self.link.closed.swap(true, Ordering::SeqCst);
        lock(&self.link.close_tx).take();
        let mut state = lock(&self.shared);
        state.links.retain(|l| !Arc::ptr_eq(l, &self.link));
        if was_closed || state.fail_closes {
            return Err(lapin::Error::InvalidConnectionState(ConnectionState::Closing));
        }
        Ok(())
    }
}

struct MockChannel {
    link: Arc<Link>,
    closed: Arc<AtomicBool>,
    shared: Arc<Mutex<Shared>>,
}

impl MockChannel {
    fn usable(&self) -> lapin::Result<MutexGuard<'_, Shared>> {
        if self.link.is_closed() || self.closed.load(Ordering::SeqCst) {
            return Err(closed_channel());
        }
        Ok(lock(&self.shared))
    }

    /// Broker error replies close the channel they arrive on.
    fn fail(&self) -> lapin::Error {
        self.closed.store(true, Ordering::SeqCst);
        closed_channel()
    }
}

#[async_trait]
impl AmqpChannel for MockChannel {
    async fn qos(&self, _prefetch_count: u16) -> lapin::Result<()> {
        self.usable().map(|_| ())
    }

    async fn enable_confirms(&self) -> lapin::Result<()> {
        self.usable()?.confirms_enabled = true;
        Ok(())
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: &str,
        options: ExchangeOptions,
        _arguments: FieldTable,
    ) -> lapin::Result<()> {
        let mut state = self.usable()?;
        *state.exchange_declarations.entry(name.to_string()).or_default() += 1;
        if !matches!(kind, "direct" | "fanout" | "topic" | "headers") {
            return Err(self.fail());
        }

        let declared = ExchangeRecord {
            kind: kind.to_string(),
            options: ExchangeOptions {
                no_wait: false,
                ..options
            },
        };
        match state.exchanges.get(name) {
            Some(existing) if *existing != declared => Err(self.fail()),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), declared);
                Ok(())
            }
        }
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
        _arguments: FieldTable,
    ) -> lapin::Result<String> {
        let mut state = self.usable()?;
        let name = if name.is_empty() {
            format!("amq.gen-{}", uuid::Uuid::new_v4().simple())
        } else {
            name.to_string()
        };
        let declared = QueueOptions {
            no_wait: false,
            ..options
        };
        let record = state.queues.entry(name.clone()).or_default();
        match record.options {
            Some(existing) if existing != declared => Err(self.fail()),
            _ => {
                record.options = Some(declared);
                Ok(name)
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> lapin::Result<()> {
        let mut state = self.usable()?;
        if !state.exchanges.contains_key(exchange) || !state.queues.contains_key(queue) {
            return Err(self.fail());
        }
        let exists = state.bindings.iter().any(|b| {
            b.queue == queue
                && b.exchange == exchange
                && b.routing_key == routing_key
                && b.arguments == arguments
        });
        if !exists {
            state.bindings.push(Binding {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                arguments,
            });
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> lapin::Result<Confirm> {
        let mut state = self.usable()?;
        state.publish_attempts += 1;
        let attempt = state.publish_attempts;

        if let Some((fault, remaining)) = state.publish_fault.as_mut() {
            if *remaining > 0 {
                *remaining -= 1;
                return match fault {
                    PublishFault::ConnectionLost => Err(lapin::Error::IOError(Arc::new(
                        io::Error::new(
                            io::ErrorKind::ConnectionReset,
                            format!("connection reset on attempt {attempt}"),
                        ),
                    ))),
                    PublishFault::Rejected => Err(lapin::Error::InvalidChannel(attempt as u16)),
                    PublishFault::Nacked => Ok(Confirm::Nack),
                };
            }
        }

        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message: message.clone(),
        });
        let weak = Arc::downgrade(&self.shared);
        for queue in state.route(exchange, routing_key, &message.headers) {
            let item = (exchange.to_string(), routing_key.to_string(), message.clone());
            state.enqueue(&weak, &queue, item);
        }

        Ok(if state.confirms_enabled {
            Confirm::Ack
        } else {
            Confirm::NotRequested
        })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> lapin::Result<DeliveryStream> {
        let mut state = self.usable()?;
        if state.fail_consumes > 0 {
            state.fail_consumes -= 1;
            return Err(self.fail());
        }
        let (tx, rx) = unbounded();
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .consumers
            .push((consumer_tag.to_string(), tx));
        state.dispatch(&Arc::downgrade(&self.shared), queue);
        Ok(rx.boxed())
    }

    fn is_open(&self) -> bool {
        !self.link.is_closed() && !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> lapin::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        if lock(&self.shared).fail_closes {
            return Err(lapin::Error::InvalidChannelState(ChannelState::Closing));
        }
        Ok(())
    }
}

struct MockAcker {
    tag: u64,
    shared: Weak<Mutex<Shared>>,
}

impl MockAcker {
    fn record(&self, acked: bool) -> lapin::Result<()> {
        let shared = self.shared.upgrade().ok_or_else(closed_channel)?;
        let mut state = lock(&shared);
        if acked {
            state.acked.push(self.tag);
        } else {
            state.nacked.push(self.tag);
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledge for MockAcker {
    async fn ack(&self) -> lapin::Result<()> {
        self.record(true)
    }

    async fn nack(&self, _requeue: bool) -> lapin::Result<()> {
        self.record(false)
    }

    async fn reject(&self, _requeue: bool) -> lapin::Result<()> {
        self.record(false)
    }
}

#[cfg(test)]
mod tests {
    use super::topic_matches;

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("user.*", "user.created"));
        assert!(!topic_matches("user.*", "user.profile.updated"));
        assert!(topic_matches("user.#", "user.profile.updated"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("orders", "orders"));
        assert!(!topic_matches("orders", "invoices"));
    }
}
