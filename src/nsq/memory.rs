//! In-process nsqd / nsqlookupd emulation.
//!
//! Implements the `NsqClient` capability without any network I/O, for local
//! development and tests. The model follows nsqd closely enough for the broker
//! to be exercised end to end:
//!
//! - a topic copies every message to each of its channels
//! - consumers on the same channel share its messages
//! - a topic with no channels buffers messages until the first channel appears
//! - `#ephemeral` channels are deleted when their last client goes away
//! - `max_in_flight` bounds unresponded messages per consumer, across all of
//!   its nsqd connections
//! - failed deliveries are requeued until `max_attempts`
//! - a message left unresponded past `msg_timeout` is requeued
//!
//! The topology (nsqd and lookupd addresses) is fixed at build time.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::client::{ClientConfig, Consumer, MessageHandler, NsqClient, Producer, RawMessage};
use super::EPHEMERAL_SUFFIX;
use crate::broker::{BrokerError, CompletionSink, Result, Transaction};

/// Longest topic or channel name nsqd accepts.
const MAX_NAME_LENGTH: usize = 64;

/// nsqd's `--msg-timeout` default, used when the client leaves it unset.
const DEFAULT_MSG_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// nsqd model
// ============================================================================

#[derive(Debug, Clone)]
struct QueuedMessage {
    id: String,
    body: Vec<u8>,
    /// Completed delivery attempts.
    attempts: u16,
}

/// Sending and receiving ends of one channel's queue.
#[derive(Clone)]
struct ChannelEndpoint {
    sender: mpsc::UnboundedSender<QueuedMessage>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<QueuedMessage>>>,
}

struct ChannelQueue {
    endpoint: ChannelEndpoint,
    clients: usize,
}

impl ChannelQueue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            endpoint: ChannelEndpoint {
                sender,
                receiver: Arc::new(Mutex::new(receiver)),
            },
            clients: 0,
        }
    }
}

#[derive(Default)]
struct TopicState {
    channels: HashMap<String, ChannelQueue>,
    /// Messages published before any channel existed.
    backlog: Vec<QueuedMessage>,
}

struct Nsqd {
    address: String,
    topics: Mutex<HashMap<String, TopicState>>,
}

impl Nsqd {
    fn new(address: String) -> Self {
        Self {
            address,
            topics: Mutex::new(HashMap::new()),
        }
    }

    async fn put(&self, topic: &str, body: Vec<u8>) {
        let message = QueuedMessage {
            id: new_message_id(),
            body,
            attempts: 0,
        };

        let mut topics = self.topics.lock().await;
        let state = topics.entry(topic.to_string()).or_default();

        if state.channels.is_empty() {
            state.backlog.push(message);
            return;
        }

        for queue in state.channels.values() {
            // Receivers live as long as the channel entry, so this cannot fail.
            let _ = queue.endpoint.sender.send(message.clone());
        }
    }

    async fn attach(&self, topic: &str, channel: &str) -> ChannelEndpoint {
        let mut topics = self.topics.lock().await;
        let state = topics.entry(topic.to_string()).or_default();
        let first_channel = state.channels.is_empty();

        let queue = state
            .channels
            .entry(channel.to_string())
            .or_insert_with(ChannelQueue::new);

        if first_channel {
            for message in state.backlog.drain(..) {
                let _ = queue.endpoint.sender.send(message);
            }
        }

        queue.clients += 1;
        queue.endpoint.clone()
    }

    async fn detach(&self, topic: &str, channel: &str) {
        let mut topics = self.topics.lock().await;
        let Some(state) = topics.get_mut(topic) else {
            return;
        };

        let remove = match state.channels.get_mut(channel) {
            Some(queue) => {
                queue.clients = queue.clients.saturating_sub(1);
                queue.clients == 0 && channel.ends_with(EPHEMERAL_SUFFIX)
            }
            None => false,
        };

        if remove {
            state.channels.remove(channel);
            debug!(
                nsqd = %self.address,
                topic = %topic,
                channel = %channel,
                "Deleted ephemeral channel"
            );
        }
    }

    async fn channel_names(&self, topic: &str) -> Vec<String> {
        let topics = self.topics.lock().await;
        let mut names: Vec<String> = topics
            .get(topic)
            .map(|state| state.channels.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    async fn backlog_len(&self, topic: &str) -> usize {
        let topics = self.topics.lock().await;
        topics.get(topic).map(|state| state.backlog.len()).unwrap_or(0)
    }
}

fn new_message_id() -> String {
    Uuid::new_v4().simple().to_string()[..16].to_string()
}

/// nsqd accepts `[.a-zA-Z0-9_-]{1,64}` with an optional `#ephemeral` suffix.
fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return false;
    }
    let base = name.strip_suffix(EPHEMERAL_SUFFIX).unwrap_or(name);
    !base.is_empty()
        && base
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

// ============================================================================
// Cluster
// ============================================================================

#[derive(Default)]
struct Faults {
    ping: Mutex<HashSet<String>>,
    consumer: AtomicBool,
    /// Channels whose consumers fail to connect.
    channel: Mutex<HashSet<String>>,
    publish: AtomicBool,
}

#[derive(Default)]
struct Counters {
    producers_created: AtomicUsize,
    pings: AtomicUsize,
    consumers_created: AtomicUsize,
    finished: AtomicUsize,
    requeued: AtomicUsize,
    dropped: AtomicUsize,
    published: Mutex<HashMap<String, usize>>,
}

struct Cluster {
    nsqds: HashMap<String, Arc<Nsqd>>,
    lookupds: HashMap<String, Vec<String>>,
    faults: Faults,
    counters: Counters,
    consumers: Mutex<Vec<Arc<MemoryConsumer>>>,
}

impl Cluster {
    fn nsqd(&self, addr: &str) -> Result<Arc<Nsqd>> {
        self.nsqds
            .get(addr)
            .cloned()
            .ok_or_else(|| BrokerError::Connection(format!("dial tcp {}: connection refused", addr)))
    }

    async fn record_publish(&self, addr: &str) {
        *self
            .counters
            .published
            .lock()
            .await
            .entry(addr.to_string())
            .or_insert(0) += 1;
    }
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub producers_created: usize,
    pub pings: usize,
    pub consumers_created: usize,
    pub finished: usize,
    pub requeued: usize,
    pub dropped: usize,
}

/// Snapshot of one consumer handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerInfo {
    pub topic: String,
    pub channel: String,
    pub max_in_flight: usize,
    /// Worker count per installed handler.
    pub concurrency: Vec<usize>,
    pub nsqds: Vec<String>,
    pub lookupds: Vec<String>,
    pub stopped: bool,
}

/// Builder for `MemoryNsq`.
#[derive(Debug, Default)]
pub struct MemoryNsqBuilder {
    nsqds: Vec<String>,
    lookupds: Vec<(String, Vec<String>)>,
}

impl MemoryNsqBuilder {
    /// Add an nsqd reachable at `addr`.
    pub fn nsqd(mut self, addr: impl Into<String>) -> Self {
        self.nsqds.push(addr.into());
        self
    }

    /// Add a lookupd at `addr` that resolves to the given nsqd addresses.
    pub fn lookupd<I, S>(mut self, addr: impl Into<String>, nsqds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lookupds
            .push((addr.into(), nsqds.into_iter().map(Into::into).collect()));
        self
    }

    pub fn build(self) -> MemoryNsq {
        let nsqds = self
            .nsqds
            .into_iter()
            .map(|addr| (addr.clone(), Arc::new(Nsqd::new(addr))))
            .collect::<HashMap<_, _>>();

        info!(
            nsqds = nsqds.len(),
            lookupds = self.lookupds.len(),
            "In-memory NSQ cluster initialized"
        );

        MemoryNsq {
            cluster: Arc::new(Cluster {
                nsqds,
                lookupds: self.lookupds.into_iter().collect(),
                faults: Faults::default(),
                counters: Counters::default(),
                consumers: Mutex::new(Vec::new()),
            }),
        }
    }
}

/// In-process NSQ cluster implementing `NsqClient`.
///
/// Cloning shares the same cluster.
#[derive(Clone)]
pub struct MemoryNsq {
    cluster: Arc<Cluster>,
}

impl MemoryNsq {
    pub fn builder() -> MemoryNsqBuilder {
        MemoryNsqBuilder::default()
    }

    /// A single nsqd at the given address.
    pub fn single(addr: impl Into<String>) -> Self {
        Self::builder().nsqd(addr).build()
    }

    pub fn stats(&self) -> MemoryStats {
        let c = &self.cluster.counters;
        MemoryStats {
            producers_created: c.producers_created.load(Ordering::SeqCst),
            pings: c.pings.load(Ordering::SeqCst),
            consumers_created: c.consumers_created.load(Ordering::SeqCst),
            finished: c.finished.load(Ordering::SeqCst),
            requeued: c.requeued.load(Ordering::SeqCst),
            dropped: c.dropped.load(Ordering::SeqCst),
        }
    }

    /// Messages accepted by the nsqd at `addr`.
    pub async fn published_count(&self, addr: &str) -> usize {
        self.cluster
            .counters
            .published
            .lock()
            .await
            .get(addr)
            .copied()
            .unwrap_or(0)
    }

    /// Every consumer handle ever created, in creation order.
    pub async fn consumers(&self) -> Vec<ConsumerInfo> {
        let consumers = self.cluster.consumers.lock().await.clone();
        let mut infos = Vec::with_capacity(consumers.len());
        for consumer in consumers {
            infos.push(consumer.info().await);
        }
        infos
    }

    /// Channel names currently present for `topic` on one nsqd.
    pub async fn channels(&self, nsqd: &str, topic: &str) -> Vec<String> {
        match self.cluster.nsqds.get(nsqd) {
            Some(node) => node.channel_names(topic).await,
            None => Vec::new(),
        }
    }

    /// Messages waiting on a topic that has no channels yet.
    pub async fn backlog(&self, nsqd: &str, topic: &str) -> usize {
        match self.cluster.nsqds.get(nsqd) {
            Some(node) => node.backlog_len(topic).await,
            None => 0,
        }
    }

    /// Make pings to `addr` fail.
    pub async fn set_ping_failure(&self, addr: &str, fail: bool) {
        let mut ping = self.cluster.faults.ping.lock().await;
        if fail {
            ping.insert(addr.to_string());
        } else {
            ping.remove(addr);
        }
    }

    /// Make consumer creation fail.
    pub fn set_consumer_failure(&self, fail: bool) {
        self.cluster.faults.consumer.store(fail, Ordering::SeqCst);
    }

    /// Make consumers on `channel` fail to connect to nsqd or lookupd.
    pub async fn set_channel_failure(&self, channel: &str, fail: bool) {
        let mut channels = self.cluster.faults.channel.lock().await;
        if fail {
            channels.insert(channel.to_string());
        } else {
            channels.remove(channel);
        }
    }

    /// Make every publish fail.
    pub fn set_publish_failure(&self, fail: bool) {
        self.cluster.faults.publish.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl NsqClient for MemoryNsq {
    async fn new_producer(&self, addr: &str, config: &ClientConfig) -> Result<Arc<dyn Producer>> {
        config.validate()?;
        self.cluster
            .counters
            .producers_created
            .fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(MemoryProducer {
            address: addr.to_string(),
            cluster: Arc::clone(&self.cluster),
            stopped: AtomicBool::new(false),
        }))
    }

    async fn new_consumer(
        &self,
        topic: &str,
        channel: &str,
        config: &ClientConfig,
    ) -> Result<Arc<dyn Consumer>> {
        config.validate()?;

        if self.cluster.faults.consumer.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection(
                "consumer creation failed (injected)".to_string(),
            ));
        }
        if !is_valid_name(topic) {
            return Err(BrokerError::Subscribe(format!("invalid topic name '{}'", topic)));
        }
        if !is_valid_name(channel) {
            return Err(BrokerError::Subscribe(format!(
                "invalid channel name '{}'",
                channel
            )));
        }

        let consumer = Arc::new(MemoryConsumer::new(
            topic,
            channel,
            config,
            Arc::clone(&self.cluster),
        ));

        self.cluster
            .counters
            .consumers_created
            .fetch_add(1, Ordering::SeqCst);
        self.cluster.consumers.lock().await.push(Arc::clone(&consumer));

        Ok(consumer)
    }
}

// ============================================================================
// Producer
// ============================================================================

struct MemoryProducer {
    address: String,
    cluster: Arc<Cluster>,
    stopped: AtomicBool,
}

impl MemoryProducer {
    fn nsqd(&self) -> Result<Arc<Nsqd>> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection(format!(
                "producer for {} is stopped",
                self.address
            )));
        }
        self.cluster.nsqd(&self.address)
    }

    /// Resolve the target nsqd and reject the publish up front if it cannot
    /// be accepted.
    fn accept(&self, topic: &str) -> Result<Arc<Nsqd>> {
        let nsqd = self
            .nsqd()
            .map_err(|e| BrokerError::Publish(e.to_string()))?;

        if !is_valid_name(topic) {
            return Err(BrokerError::Publish(format!(
                "E_BAD_TOPIC invalid topic name '{}'",
                topic
            )));
        }
        if self.cluster.faults.publish.load(Ordering::SeqCst) {
            return Err(BrokerError::Publish(
                "E_PUB_FAILED publish failed (injected)".to_string(),
            ));
        }
        Ok(nsqd)
    }
}

/// Put a message once accepted, after an optional delay.
async fn deliver(cluster: Arc<Cluster>, nsqd: Arc<Nsqd>, topic: String, body: Vec<u8>, delay: Option<Duration>) {
    cluster.record_publish(&nsqd.address).await;
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    nsqd.put(&topic, body).await;
}

#[async_trait]
impl Producer for MemoryProducer {
    fn address(&self) -> &str {
        &self.address
    }

    async fn ping(&self) -> Result<()> {
        self.cluster.counters.pings.fetch_add(1, Ordering::SeqCst);
        self.nsqd()?;

        if self.cluster.faults.ping.lock().await.contains(&self.address) {
            return Err(BrokerError::Connection(format!(
                "ping to {} failed (injected)",
                self.address
            )));
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, body: Vec<u8>) -> Result<()> {
        let nsqd = self.accept(topic)?;
        deliver(Arc::clone(&self.cluster), nsqd, topic.to_string(), body, None).await;
        Ok(())
    }

    async fn publish_async(&self, topic: &str, body: Vec<u8>, done: CompletionSink) -> Result<()> {
        let accepted = self.accept(topic);
        let cluster = Arc::clone(&self.cluster);
        let topic = topic.to_string();

        tokio::spawn(async move {
            let result = match accepted {
                Ok(nsqd) => {
                    deliver(cluster, nsqd, topic.clone(), body, None).await;
                    Ok(())
                }
                Err(e) => Err(e),
            };
            let _ = done.send(Transaction { topic, result });
        });
        Ok(())
    }

    async fn deferred_publish(&self, topic: &str, delay: Duration, body: Vec<u8>) -> Result<()> {
        let nsqd = self.accept(topic)?;
        tokio::spawn(deliver(
            Arc::clone(&self.cluster),
            nsqd,
            topic.to_string(),
            body,
            Some(delay),
        ));
        Ok(())
    }

    async fn deferred_publish_async(
        &self,
        topic: &str,
        delay: Duration,
        body: Vec<u8>,
        done: CompletionSink,
    ) -> Result<()> {
        let accepted = self.accept(topic);
        let cluster = Arc::clone(&self.cluster);
        let topic = topic.to_string();

        tokio::spawn(async move {
            match accepted {
                Ok(nsqd) => {
                    let _ = done.send(Transaction {
                        topic: topic.clone(),
                        result: Ok(()),
                    });
                    deliver(cluster, nsqd, topic, body, Some(delay)).await;
                }
                Err(e) => {
                    let _ = done.send(Transaction {
                        topic,
                        result: Err(e),
                    });
                }
            }
        });
        Ok(())
    }

    async fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            debug!(nsqd = %self.address, "Producer stopped");
        }
    }
}

// ============================================================================
// Consumer
// ============================================================================

/// A message read off a connection, holding one in-flight slot.
struct Delivery {
    queued: QueuedMessage,
    permit: OwnedSemaphorePermit,
    requeue_to: mpsc::UnboundedSender<QueuedMessage>,
}

/// One consumer's attachment to one nsqd channel.
struct Connection {
    nsqd: Arc<Nsqd>,
    shutdown: watch::Sender<bool>,
}

#[derive(Default)]
struct Links {
    nsqds: HashMap<String, Connection>,
    /// nsqds connected explicitly rather than through a lookupd.
    direct: HashSet<String>,
    lookupds: HashMap<String, Vec<String>>,
    workers_started: bool,
    stopped: bool,
}

struct MemoryConsumer {
    topic: String,
    channel: String,
    config: ClientConfig,
    cluster: Arc<Cluster>,
    in_flight: Arc<Semaphore>,
    handlers: Mutex<Vec<(MessageHandler, usize)>>,
    links: Mutex<Links>,
    /// Every connection reader feeds this queue; the handler workers drain it.
    deliveries: mpsc::UnboundedSender<Delivery>,
    pending: Arc<Mutex<mpsc::UnboundedReceiver<Delivery>>>,
    /// Stops the handler workers.
    shutdown: watch::Sender<bool>,
}

impl MemoryConsumer {
    fn new(topic: &str, channel: &str, config: &ClientConfig, cluster: Arc<Cluster>) -> Self {
        let (deliveries, pending) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        Self {
            topic: topic.to_string(),
            channel: channel.to_string(),
            config: config.clone(),
            cluster,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight)),
            handlers: Mutex::new(Vec::new()),
            links: Mutex::new(Links::default()),
            deliveries,
            pending: Arc::new(Mutex::new(pending)),
            shutdown,
        }
    }

    async fn info(&self) -> ConsumerInfo {
        let concurrency = self.handlers.lock().await.iter().map(|(_, n)| *n).collect();
        let links = self.links.lock().await;

        let mut nsqds: Vec<String> = links.nsqds.keys().cloned().collect();
        nsqds.sort();
        let mut lookupds: Vec<String> = links.lookupds.keys().cloned().collect();
        lookupds.sort();

        ConsumerInfo {
            topic: self.topic.clone(),
            channel: self.channel.clone(),
            max_in_flight: self.config.max_in_flight,
            concurrency,
            nsqds,
            lookupds,
            stopped: links.stopped,
        }
    }

    async fn ensure_connectable(&self, links: &Links) -> Result<Vec<(MessageHandler, usize)>> {
        if links.stopped {
            return Err(BrokerError::Connection(format!(
                "consumer {}/{} is stopped",
                self.topic, self.channel
            )));
        }
        if self.cluster.faults.channel.lock().await.contains(&self.channel) {
            return Err(BrokerError::Connection(format!(
                "connecting {}/{} failed (injected)",
                self.topic, self.channel
            )));
        }
        let handlers = self.handlers.lock().await.clone();
        if handlers.is_empty() {
            return Err(BrokerError::Connection(format!(
                "no handlers installed for {}/{}",
                self.topic, self.channel
            )));
        }
        Ok(handlers)
    }

    fn msg_timeout(&self) -> Duration {
        if self.config.msg_timeout.is_zero() {
            DEFAULT_MSG_TIMEOUT
        } else {
            self.config.msg_timeout
        }
    }

    /// Spawn the handler workers once, however many nsqds the consumer reads.
    fn start_workers(&self, links: &mut Links, handlers: &[(MessageHandler, usize)]) {
        if links.workers_started {
            return;
        }
        links.workers_started = true;

        let mut workers = 0;
        for (handler, concurrency) in handlers {
            for _ in 0..*concurrency {
                let worker = Worker {
                    pending: Arc::clone(&self.pending),
                    handler: Arc::clone(handler),
                    shutdown: self.shutdown.subscribe(),
                    cluster: Arc::clone(&self.cluster),
                    requeue_delay: self.config.default_requeue_delay,
                    max_attempts: self.config.max_attempts,
                    msg_timeout: self.msg_timeout(),
                };
                tokio::spawn(worker.run());
                workers += 1;
            }
        }

        debug!(
            topic = %self.topic,
            channel = %self.channel,
            workers,
            "Handler workers started"
        );
    }

    async fn open(&self, links: &mut Links, addr: &str) -> Result<()> {
        if links.nsqds.contains_key(addr) {
            return Ok(());
        }

        let nsqd = self.cluster.nsqd(addr)?;
        let endpoint = nsqd.attach(&self.topic, &self.channel).await;
        let (shutdown, _) = watch::channel(false);

        let reader = Reader {
            endpoint,
            in_flight: Arc::clone(&self.in_flight),
            deliveries: self.deliveries.clone(),
            shutdown: shutdown.subscribe(),
        };
        tokio::spawn(reader.run());

        links.nsqds.insert(addr.to_string(), Connection { nsqd, shutdown });

        debug!(
            nsqd = %addr,
            topic = %self.topic,
            channel = %self.channel,
            "Consumer connected to nsqd"
        );
        Ok(())
    }

    async fn close(&self, addr: &str, connection: Connection) {
        connection.shutdown.send_replace(true);
        connection.nsqd.detach(&self.topic, &self.channel).await;
        debug!(
            nsqd = %addr,
            topic = %self.topic,
            channel = %self.channel,
            "Consumer disconnected from nsqd"
        );
    }

    fn still_referenced(links: &Links, addr: &str) -> bool {
        links.direct.contains(addr) || links.lookupds.values().any(|nsqds| nsqds.iter().any(|a| a == addr))
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn add_concurrent_handlers(&self, handler: MessageHandler, concurrency: usize) {
        self.handlers.lock().await.push((handler, concurrency));
    }

    async fn connect_to_nsqds(&self, addrs: &[String]) -> Result<()> {
        let mut links = self.links.lock().await;
        let handlers = self.ensure_connectable(&links).await?;
        self.start_workers(&mut links, &handlers);

        for addr in addrs {
            self.open(&mut links, addr).await?;
            links.direct.insert(addr.clone());
        }
        Ok(())
    }

    async fn connect_to_lookupds(&self, addrs: &[String]) -> Result<()> {
        let mut links = self.links.lock().await;
        let handlers = self.ensure_connectable(&links).await?;
        self.start_workers(&mut links, &handlers);

        for addr in addrs {
            if links.lookupds.contains_key(addr) {
                continue;
            }
            let nsqds = self.cluster.lookupds.get(addr).cloned().ok_or_else(|| {
                BrokerError::Connection(format!("lookupd {} unreachable", addr))
            })?;

            for nsqd in &nsqds {
                self.open(&mut links, nsqd).await?;
            }
            debug!(lookupd = %addr, nsqds = ?nsqds, "Consumer resolved nsqds via lookupd");
            links.lookupds.insert(addr.clone(), nsqds);
        }
        Ok(())
    }

    async fn disconnect_from_nsqd(&self, addr: &str) -> Result<()> {
        let mut links = self.links.lock().await;
        let connection = links
            .nsqds
            .remove(addr)
            .ok_or_else(|| BrokerError::Connection(format!("not connected to nsqd {}", addr)))?;
        links.direct.remove(addr);
        drop(links);

        self.close(addr, connection).await;
        Ok(())
    }

    async fn disconnect_from_lookupd(&self, addr: &str) -> Result<()> {
        let mut links = self.links.lock().await;
        let nsqds = links
            .lookupds
            .remove(addr)
            .ok_or_else(|| BrokerError::Connection(format!("not connected to lookupd {}", addr)))?;

        let mut closing = Vec::new();
        for nsqd in nsqds {
            if Self::still_referenced(&links, &nsqd) {
                continue;
            }
            if let Some(connection) = links.nsqds.remove(&nsqd) {
                closing.push((nsqd, connection));
            }
        }
        drop(links);

        for (nsqd, connection) in closing {
            self.close(&nsqd, connection).await;
        }
        Ok(())
    }

    async fn stop(&self) {
        let mut links = self.links.lock().await;
        if links.stopped {
            return;
        }
        links.stopped = true;
        links.direct.clear();
        links.lookupds.clear();
        let connections: Vec<(String, Connection)> = links.nsqds.drain().collect();
        drop(links);

        for (addr, connection) in connections {
            self.close(&addr, connection).await;
        }
        self.shutdown.send_replace(true);

        // Hand back whatever was read but never reached a worker.
        let mut pending = self.pending.lock().await;
        let mut returned = 0;
        while let Ok(delivery) = pending.try_recv() {
            let _ = delivery.requeue_to.send(delivery.queued);
            returned += 1;
        }
        drop(pending);

        info!(topic = %self.topic, channel = %self.channel, returned, "Consumer stopped");
    }
}

/// Reads one connection's channel into the consumer's delivery queue.
///
/// A slot in the in-flight window is taken only once a message is in hand,
/// so an idle nsqd never holds slots another nsqd could use.
struct Reader {
    endpoint: ChannelEndpoint,
    in_flight: Arc<Semaphore>,
    deliveries: mpsc::UnboundedSender<Delivery>,
    shutdown: watch::Receiver<bool>,
}

impl Reader {
    async fn run(mut self) {
        let receiver = Arc::clone(&self.endpoint.receiver);
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let queued = tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                queued = async { receiver.lock().await.recv().await } => match queued {
                    Some(queued) => queued,
                    None => break,
                },
            };

            let permit = tokio::select! {
                biased;
                _ = self.shutdown.changed() => None,
                permit = Arc::clone(&self.in_flight).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                let _ = self.endpoint.sender.send(queued);
                break;
            };

            let delivery = Delivery {
                queued,
                permit,
                requeue_to: self.endpoint.sender.clone(),
            };
            if let Err(unsent) = self.deliveries.send(delivery) {
                let _ = self.endpoint.sender.send(unsent.0.queued);
                break;
            }
        }
    }
}

/// One handler loop, shared across every connection of the consumer.
struct Worker {
    pending: Arc<Mutex<mpsc::UnboundedReceiver<Delivery>>>,
    handler: MessageHandler,
    shutdown: watch::Receiver<bool>,
    cluster: Arc<Cluster>,
    requeue_delay: Duration,
    max_attempts: u16,
    msg_timeout: Duration,
}

impl Worker {
    async fn run(mut self) {
        let pending = Arc::clone(&self.pending);
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let delivery = tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                delivery = async { pending.lock().await.recv().await } => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            let message = Arc::new(MemoryMessage {
                id: delivery.queued.id,
                body: delivery.queued.body,
                attempts: delivery.queued.attempts.saturating_add(1),
                auto_response_disabled: AtomicBool::new(false),
                responded: AtomicBool::new(false),
                response: Notify::new(),
                permit: Mutex::new(Some(delivery.permit)),
                requeue_to: delivery.requeue_to,
                requeue_delay: self.requeue_delay,
                max_attempts: self.max_attempts,
                cluster: Arc::clone(&self.cluster),
            });
            expire_after(&message, self.msg_timeout);

            let result = (self.handler)(Arc::clone(&message) as Arc<dyn RawMessage>).await;

            if message.is_auto_response_disabled() {
                if let Err(e) = result {
                    debug!(id = %message.id, error = %e, "Handler failed; response left to handler");
                }
                continue;
            }

            match result {
                Ok(()) => message.finish().await,
                Err(e) => {
                    warn!(id = %message.id, attempts = message.attempts, error = %e, "Handler failed, requeueing");
                    message.requeue(None).await;
                }
            }
        }
    }
}

/// Requeue `message` if nothing responds to it within `timeout`, as nsqd does.
fn expire_after(message: &Arc<MemoryMessage>, timeout: Duration) {
    let message = Arc::clone(message);
    tokio::spawn(async move {
        tokio::select! {
            _ = message.response.notified() => {}
            _ = tokio::time::sleep(timeout) => {
                if !message.responded.load(Ordering::SeqCst) {
                    warn!(id = %message.id, timeout = ?timeout, "Message timed out in flight, requeueing");
                    message.requeue(Some(Duration::ZERO)).await;
                }
            }
        }
    });
}

struct MemoryMessage {
    id: String,
    body: Vec<u8>,
    attempts: u16,
    auto_response_disabled: AtomicBool,
    responded: AtomicBool,
    response: Notify,
    /// Released once the message is finished, requeued or timed out.
    permit: Mutex<Option<OwnedSemaphorePermit>>,
    requeue_to: mpsc::UnboundedSender<QueuedMessage>,
    requeue_delay: Duration,
    max_attempts: u16,
    cluster: Arc<Cluster>,
}

impl MemoryMessage {
    async fn respond(&self) -> bool {
        if self.responded.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.permit.lock().await.take();
        self.response.notify_one();
        true
    }
}

#[async_trait]
impl RawMessage for MemoryMessage {
    fn id(&self) -> &str {
        &self.id
    }

    fn body(&self) -> &[u8] {
        &self.body
    }

    fn attempts(&self) -> u16 {
        self.attempts
    }

    fn disable_auto_response(&self) {
        self.auto_response_disabled.store(true, Ordering::SeqCst);
    }

    fn is_auto_response_disabled(&self) -> bool {
        self.auto_response_disabled.load(Ordering::SeqCst)
    }

    async fn finish(&self) {
        if self.respond().await {
            self.cluster.counters.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn requeue(&self, delay: Option<Duration>) {
        if !self.respond().await {
            return;
        }

        if self.max_attempts > 0 && self.attempts >= self.max_attempts {
            error!(
                id = %self.id,
                attempts = self.attempts,
                "Message exceeded max attempts, dropping"
            );
            self.cluster.counters.dropped.fetch_add(1, Ordering::SeqCst);
            return;
        }

        self.cluster.counters.requeued.fetch_add(1, Ordering::SeqCst);
        let queued = QueuedMessage {
            id: self.id.clone(),
            body: self.body.clone(),
            attempts: self.attempts,
        };
        let delay = delay.unwrap_or(self.requeue_delay);
        let sender = self.requeue_to.clone();

        if delay.is_zero() {
            let _ = sender.send(queued);
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = sender.send(queued);
            });
        }
    }
}
