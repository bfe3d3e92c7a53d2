//! Typed options for connect, publish and subscribe.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::{Codec, JsonCodec, Result};

/// Default number of concurrent handler invocations per subscription.
pub const DEFAULT_CONCURRENT_HANDLERS: usize = 1;

// ============================================================================
// Broker (connect) options
// ============================================================================

/// Options a broker is constructed or re-initialized with.
#[derive(Clone)]
pub struct BrokerOptions {
    /// Producer target addresses. Empty entries are ignored.
    pub addrs: Vec<String>,
    /// Envelope codec.
    pub codec: Arc<dyn Codec>,
    /// Discovery (nsqlookupd HTTP) addresses. When non-empty, consumers
    /// attach through discovery instead of the producer addresses.
    pub lookupd_addrs: Vec<String>,
    /// Free-form `key=value` client tuning overrides.
    pub client_opts: Vec<String>,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            addrs: Vec::new(),
            codec: Arc::new(JsonCodec),
            lookupd_addrs: Vec::new(),
            client_opts: Vec::new(),
        }
    }
}

impl fmt::Debug for BrokerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerOptions")
            .field("addrs", &self.addrs)
            .field("codec", &self.codec.name())
            .field("lookupd_addrs", &self.lookupd_addrs)
            .field("client_opts", &self.client_opts)
            .finish()
    }
}

impl BrokerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_addrs<I, S>(mut self, addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.addrs = addrs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_lookupd_addrs<I, S>(mut self, addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lookupd_addrs = addrs.into_iter().map(Into::into).collect();
        self
    }

    /// Add a client tuning override, e.g. `max_attempts=10`.
    pub fn with_client_opt(mut self, opt: impl Into<String>) -> Self {
        self.client_opts.push(opt.into());
        self
    }
}

// ============================================================================
// Publish options
// ============================================================================

/// Outcome of an asynchronous publish.
#[derive(Debug)]
pub struct Transaction {
    pub topic: String,
    pub result: Result<()>,
}

/// Where asynchronous publish outcomes are reported.
pub type CompletionSink = mpsc::UnboundedSender<Transaction>;

/// Per-publish options.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// If set, publish returns without waiting for the queue acknowledgement
    /// and the outcome is sent here.
    pub completion: Option<CompletionSink>,
    /// If set and non-zero, the message becomes visible after this delay.
    pub delay: Option<Duration>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn asynchronous(mut self, sink: CompletionSink) -> Self {
        self.completion = Some(sink);
        self
    }

    pub fn deferred(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Delay to apply, if any. A zero delay means immediate delivery.
    pub fn effective_delay(&self) -> Option<Duration> {
        self.delay.filter(|d| !d.is_zero())
    }
}

// ============================================================================
// Subscribe options
// ============================================================================

/// Per-subscribe options.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Channel (consumer group) name. When absent an ephemeral channel is used.
    pub queue: Option<String>,
    /// When true the client acknowledges on handler success; when false the
    /// handler must call `Publication::ack`.
    pub auto_ack: bool,
    /// Concurrent deliveries to this handler.
    pub concurrency: Option<usize>,
    /// Prefetch window. Defaults to the concurrency.
    pub max_in_flight: Option<usize>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            queue: None,
            auto_ack: true,
            concurrency: None,
            max_in_flight: None,
        }
    }
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = Some(max_in_flight);
        self
    }

    /// Resolve `(concurrency, max_in_flight)`.
    ///
    /// Max-in-flight follows the concurrency unless set explicitly.
    pub fn resolve_concurrency(&self) -> (usize, usize) {
        let concurrency = self.concurrency.unwrap_or(DEFAULT_CONCURRENT_HANDLERS);
        let max_in_flight = self.max_in_flight.unwrap_or(concurrency);
        (concurrency, max_in_flight)
    }

    /// Caller-supplied queue name, ignoring empty strings.
    pub fn queue_name(&self) -> Option<&str> {
        self.queue.as_deref().filter(|q| !q.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_concurrency_defaults() {
        assert_eq!(SubscribeOptions::default().resolve_concurrency(), (1, 1));
    }

    #[test]
    fn test_max_in_flight_follows_concurrency() {
        let opts = SubscribeOptions::new().with_concurrency(4);
        assert_eq!(opts.resolve_concurrency(), (4, 4));
    }

    #[test]
    fn test_max_in_flight_override() {
        let opts = SubscribeOptions::new()
            .with_concurrency(4)
            .with_max_in_flight(32);
        assert_eq!(opts.resolve_concurrency(), (4, 32));

        let opts = SubscribeOptions::new().with_max_in_flight(8);
        assert_eq!(opts.resolve_concurrency(), (1, 8));
    }

    #[test]
    fn test_auto_ack_default_true() {
        assert!(SubscribeOptions::default().auto_ack);
        assert!(!SubscribeOptions::new().with_auto_ack(false).auto_ack);
    }

    #[test]
    fn test_empty_queue_is_absent() {
        assert_eq!(SubscribeOptions::new().with_queue("").queue_name(), None);
        assert_eq!(
            SubscribeOptions::new().with_queue("billing").queue_name(),
            Some("billing")
        );
    }

    #[test]
    fn test_zero_delay_is_immediate() {
        assert_eq!(
            PublishOptions::new().deferred(Duration::ZERO).effective_delay(),
            None
        );
        assert_eq!(
            PublishOptions::new()
                .deferred(Duration::from_secs(2))
                .effective_delay(),
            Some(Duration::from_secs(2))
        );
    }

    #[test]
    fn test_broker_options_debug_shows_codec_name() {
        let opts = BrokerOptions::new().with_addrs(["127.0.0.1:4150"]);
        let debug = format!("{:?}", opts);
        assert!(debug.contains("json"));
        assert!(debug.contains("127.0.0.1:4150"));
    }
}
