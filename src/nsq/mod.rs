//! NSQ broker.
//!
//! Publishes through one producer per configured nsqd, chosen at random per
//! message, and consumes through one consumer per subscription. Consumers
//! attach via nsqlookupd when discovery addresses are configured, otherwise
//! directly to every nsqd.
//!
//! Subscriptions outlive disconnects: `disconnect` stops their consumers and
//! the next `connect` re-creates them with the same topic, channel, handler
//! and concurrency.
//!
//! The queue client itself sits behind `client::NsqClient`. `MemoryNsq`
//! (feature `memory`) is an in-process implementation for tests and local
//! runs.

use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub mod client;
#[cfg(feature = "memory")]
pub mod memory;
mod pool;
mod publisher;
mod subscription;


pub use client::{ClientConfig, Consumer, MessageHandler, NsqClient, Producer, RawMessage};
#[cfg(feature = "memory")]
pub use memory::MemoryNsq;
pub use subscription::{NsqPublication, NsqSubscriber};

use crate::broker::{
    Broker, BrokerConstructor, BrokerError, BrokerOptions, BrokerRegistry, Envelope, Handler,
    PublishOptions, Result, SubscribeOptions, Subscriber,
};
use pool::{ConnectionState, Topology};
use subscription::{dispatch_shim, resolve_channel, SubscriptionRecord};

/// nsqd TCP address used when none is configured.
pub const DEFAULT_NSQD_ADDR: &str = "127.0.0.1:4150";

/// Channel suffix nsqd treats as non-durable.
pub const EPHEMERAL_SUFFIX: &str = "#ephemeral";

/// Registry name.
pub const BROKER_NAME: &str = "nsq";

/// Register the NSQ broker under `"nsq"`, building brokers on `client`.
pub fn register(registry: &mut BrokerRegistry, client: Arc<dyn NsqClient>) {
    let constructor: BrokerConstructor = Arc::new(move |options| {
        let broker = NsqBroker::new(options, Arc::clone(&client))?;
        Ok(Box::new(broker) as Box<dyn Broker>)
    });
    registry.register(BROKER_NAME, constructor);
}

/// NSQ implementation of `Broker`.
pub struct NsqBroker {
    options: BrokerOptions,
    client: Arc<dyn NsqClient>,
    state: Arc<Mutex<ConnectionState>>,
}

impl NsqBroker {
    /// Build a disconnected broker.
    ///
    /// Client tuning overrides in `options.client_opts` are applied and
    /// validated here, so a bad override fails construction.
    pub fn new(options: BrokerOptions, client: Arc<dyn NsqClient>) -> Result<Self> {
        let config = client_config(&options)?;
        let topology = Topology::from_options(&options);

        info!(
            nsqds = ?topology.nsqd_tcp_addrs,
            lookupds = ?topology.lookupd_http_addrs,
            codec = options.codec.name(),
            "NSQ broker created"
        );

        Ok(Self {
            options,
            client,
            state: Arc::new(Mutex::new(ConnectionState::new(topology, config))),
        })
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.running
    }

    /// Live producers; zero while disconnected.
    pub async fn producer_count(&self) -> usize {
        self.state.lock().await.producers.len()
    }

    /// Registered subscriptions, attached or not.
    pub async fn subscription_count(&self) -> usize {
        self.state.lock().await.subscriptions.len()
    }
}

fn client_config(options: &BrokerOptions) -> Result<ClientConfig> {
    let mut config = ClientConfig::new();
    config.apply(&options.client_opts)?;
    config.validate()?;
    Ok(config)
}

#[async_trait]
impl Broker for NsqBroker {
    async fn init(&mut self, options: BrokerOptions) -> Result<()> {
        let config = client_config(&options)?;

        {
            let mut state = self.state.lock().await;
            if state.running {
                return Err(BrokerError::InvalidOption(
                    "cannot re-initialize a connected broker".to_string(),
                ));
            }
            state.topology = Topology::from_options(&options);
            state.config = config;
        }

        debug!(options = ?options, "NSQ broker re-initialized");
        self.options = options;
        Ok(())
    }

    fn options(&self) -> &BrokerOptions {
        &self.options
    }

    fn address(&self) -> String {
        let topology = Topology::from_options(&self.options);
        let index = rand::rng().random_range(0..topology.nsqd_tcp_addrs.len());
        topology.nsqd_tcp_addrs[index].clone()
    }

    async fn connect(&self) -> Result<()> {
        self.state.lock().await.connect(self.client.as_ref()).await
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.lock().await.disconnect().await
    }

    #[tracing::instrument(name = "broker.publish", skip_all, fields(topic = %topic))]
    async fn publish(
        &self,
        topic: &str,
        message: &Envelope,
        options: PublishOptions,
    ) -> Result<()> {
        let producer = {
            let state = self.state.lock().await;
            publisher::select_producer(&state)?
        };

        let body = self.options.codec.marshal(message)?;
        publisher::send(producer.as_ref(), topic, body, options).await
    }

    #[tracing::instrument(name = "broker.subscribe", skip_all, fields(topic = %topic))]
    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn Handler>,
        options: SubscribeOptions,
    ) -> Result<Box<dyn Subscriber>> {
        let (concurrency, max_in_flight) = options.resolve_concurrency();
        if concurrency == 0 {
            return Err(BrokerError::InvalidOption(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if max_in_flight == 0 {
            return Err(BrokerError::InvalidOption(
                "max_in_flight must be at least 1".to_string(),
            ));
        }

        let channel = resolve_channel(&options);
        let shim = dispatch_shim(
            topic.to_string(),
            Arc::clone(&self.options.codec),
            handler,
            options.auto_ack,
        );
        let record = SubscriptionRecord::new(
            topic,
            channel.clone(),
            options.clone(),
            shim,
            concurrency,
            max_in_flight,
        );
        let id = record.id;

        let attached = {
            let mut state = self.state.lock().await;
            state.add_subscription(self.client.as_ref(), record).await?;
            state.running
        };

        info!(
            channel = %channel,
            concurrency,
            max_in_flight,
            attached,
            "Subscribed"
        );

        Ok(Box::new(NsqSubscriber::new(
            id,
            topic.to_string(),
            channel,
            options,
            Arc::clone(&self.state),
        )))
    }

    fn name(&self) -> &'static str {
        BROKER_NAME
    }
}
