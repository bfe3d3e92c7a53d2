//! Subscription records, the dispatch shim and the caller-facing handles.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::client::{ClientConfig, Consumer, MessageHandler, NsqClient, RawMessage};
use super::pool::{ConnectionState, Topology};
use super::EPHEMERAL_SUFFIX;
use crate::broker::{
    Codec, Envelope, Handler, Publication, Result, SubscribeOptions, Subscriber,
};

/// Caller-supplied queue name, or a fresh ephemeral channel.
pub(crate) fn resolve_channel(options: &SubscribeOptions) -> String {
    match options.queue_name() {
        Some(queue) => queue.to_string(),
        None => ephemeral_channel(),
    }
}

pub(crate) fn ephemeral_channel() -> String {
    format!("{}{}", Uuid::new_v4(), EPHEMERAL_SUFFIX)
}

/// Everything needed to (re)create a subscription's consumer.
pub(crate) struct SubscriptionRecord {
    pub id: Uuid,
    pub topic: String,
    pub channel: String,
    pub options: SubscribeOptions,
    pub handler: MessageHandler,
    pub concurrency: usize,
    pub max_in_flight: usize,
    /// Consumer handle with the shim installed. Opened at subscribe time,
    /// discarded on disconnect and reopened by the next connect.
    pub consumer: Option<Arc<dyn Consumer>>,
    /// Whether `consumer` is connected to the topology.
    pub attached: bool,
}

impl SubscriptionRecord {
    pub fn new(
        topic: impl Into<String>,
        channel: impl Into<String>,
        options: SubscribeOptions,
        handler: MessageHandler,
        concurrency: usize,
        max_in_flight: usize,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            channel: channel.into(),
            options,
            handler,
            concurrency,
            max_in_flight,
            consumer: None,
            attached: false,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Create the consumer handle and install the shim, unless one is open.
    ///
    /// The client validates topic, channel and tuning here, so a bad
    /// subscription fails before it is ever recorded.
    pub async fn open(
        &mut self,
        client: &dyn NsqClient,
        config: &ClientConfig,
    ) -> Result<Arc<dyn Consumer>> {
        if let Some(consumer) = &self.consumer {
            return Ok(Arc::clone(consumer));
        }

        let mut config = config.clone();
        config.max_in_flight = self.max_in_flight;

        let consumer = client.new_consumer(&self.topic, &self.channel, &config).await?;
        consumer
            .add_concurrent_handlers(Arc::clone(&self.handler), self.concurrency)
            .await;

        debug!(topic = %self.topic, channel = %self.channel, "Consumer opened");
        self.consumer = Some(Arc::clone(&consumer));
        Ok(consumer)
    }

    /// Connect the consumer to the topology, opening it first if needed.
    ///
    /// On failure the consumer is stopped and dropped from the record.
    pub async fn attach(
        &mut self,
        client: &dyn NsqClient,
        topology: &Topology,
        config: &ClientConfig,
    ) -> Result<()> {
        let consumer = self.open(client, config).await?;

        if let Err(e) = topology.attach(consumer.as_ref()).await {
            consumer.stop().await;
            self.consumer = None;
            return Err(e);
        }

        info!(
            topic = %self.topic,
            channel = %self.channel,
            concurrency = self.concurrency,
            max_in_flight = self.max_in_flight,
            "Subscription attached"
        );
        self.attached = true;
        Ok(())
    }

    /// Stop the consumer, if any, and release its addresses.
    pub async fn detach(&mut self, topology: &Topology) {
        let Some(consumer) = self.consumer.take() else {
            return;
        };

        consumer.stop().await;
        if std::mem::take(&mut self.attached) {
            topology.detach(consumer.as_ref()).await;
        }
        debug!(topic = %self.topic, channel = %self.channel, "Subscription detached");
    }
}

/// Build the per-delivery callback: decode, wrap, call the handler.
///
/// Decode failures go back to the client as handler failures so its requeue
/// policy applies. Auto-response is only disabled once the message decoded.
pub(crate) fn dispatch_shim(
    topic: String,
    codec: Arc<dyn Codec>,
    handler: Arc<dyn Handler>,
    auto_ack: bool,
) -> MessageHandler {
    Arc::new(move |raw: Arc<dyn RawMessage>| -> BoxFuture<'static, Result<()>> {
        let topic = topic.clone();
        let codec = Arc::clone(&codec);
        let handler = Arc::clone(&handler);

        Box::pin(async move {
            let message = match codec.unmarshal(raw.body()) {
                Ok(message) => message,
                Err(e) => {
                    warn!(topic = %topic, id = %raw.id(), error = %e, "Failed to decode message");
                    return Err(e);
                }
            };

            if !auto_ack {
                raw.disable_auto_response();
            }

            debug!(topic = %topic, id = %raw.id(), attempts = raw.attempts(), "Dispatching message");

            let publication: Arc<dyn Publication> = Arc::new(NsqPublication {
                topic,
                message,
                raw,
            });
            handler.handle(publication).await
        })
    })
}

/// One delivery: the decoded envelope plus the raw message it came from.
pub struct NsqPublication {
    topic: String,
    message: Envelope,
    raw: Arc<dyn RawMessage>,
}

impl NsqPublication {
    /// nsqd message id.
    pub fn id(&self) -> &str {
        self.raw.id()
    }

    /// Delivery attempt, starting at 1.
    pub fn attempts(&self) -> u16 {
        self.raw.attempts()
    }
}

#[async_trait]
impl Publication for NsqPublication {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn message(&self) -> &Envelope {
        &self.message
    }

    async fn ack(&self) -> Result<()> {
        self.raw.finish().await;
        Ok(())
    }
}

/// Handle returned from `NsqBroker::subscribe`.
pub struct NsqSubscriber {
    id: Uuid,
    topic: String,
    channel: String,
    options: SubscribeOptions,
    state: Arc<Mutex<ConnectionState>>,
}

impl NsqSubscriber {
    pub(crate) fn new(
        id: Uuid,
        topic: String,
        channel: String,
        options: SubscribeOptions,
        state: Arc<Mutex<ConnectionState>>,
    ) -> Self {
        Self {
            id,
            topic,
            channel,
            options,
            state,
        }
    }

    /// Resolved channel name.
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl Subscriber for NsqSubscriber {
    fn options(&self) -> &SubscribeOptions {
        &self.options
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    /// Stop the consumer and remove the record, so a later connect does not
    /// bring it back. Repeated calls succeed without effect.
    async fn unsubscribe(&self) -> Result<()> {
        let removed = self.state.lock().await.remove_subscription(self.id).await;
        if removed {
            info!(topic = %self.topic, channel = %self.channel, "Unsubscribed");
        }
        Ok(())
    }
}
