//! Queue client capability consumed by the NSQ broker.
//!
//! The broker never speaks the nsqd wire protocol itself. It drives an
//! `NsqClient` that hands out producer and consumer handles, and receives
//! deliveries as `RawMessage`s through a `MessageHandler`.
//!
//! Handles are shared across tasks: a producer may serve concurrent publishes
//! and a consumer dispatches to its handlers from client-managed workers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::broker::{BrokerError, CompletionSink, Result};

/// Per-delivery callback installed on a consumer.
///
/// An `Err` return makes the client requeue the message (unless the handler
/// disabled auto-response).
pub type MessageHandler =
    Arc<dyn Fn(Arc<dyn RawMessage>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Factory for producer and consumer handles.
#[async_trait]
pub trait NsqClient: Send + Sync {
    /// Create a producer for one nsqd TCP address. Does not dial.
    async fn new_producer(&self, addr: &str, config: &ClientConfig) -> Result<Arc<dyn Producer>>;

    /// Create a consumer for `(topic, channel)`. Does not dial.
    async fn new_consumer(
        &self,
        topic: &str,
        channel: &str,
        config: &ClientConfig,
    ) -> Result<Arc<dyn Consumer>>;
}

/// Publishing handle bound to one nsqd.
#[async_trait]
pub trait Producer: Send + Sync {
    fn address(&self) -> &str;

    /// Round-trip liveness check.
    async fn ping(&self) -> Result<()>;

    async fn publish(&self, topic: &str, body: Vec<u8>) -> Result<()>;

    /// Publish without waiting for the nsqd response; the outcome goes to `done`.
    async fn publish_async(&self, topic: &str, body: Vec<u8>, done: CompletionSink) -> Result<()>;

    async fn deferred_publish(&self, topic: &str, delay: Duration, body: Vec<u8>) -> Result<()>;

    async fn deferred_publish_async(
        &self,
        topic: &str,
        delay: Duration,
        body: Vec<u8>,
        done: CompletionSink,
    ) -> Result<()>;

    async fn stop(&self);
}

/// Consuming handle for one `(topic, channel)`.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Install `handler` with `concurrency` workers per connection.
    async fn add_concurrent_handlers(&self, handler: MessageHandler, concurrency: usize);

    async fn connect_to_nsqds(&self, addrs: &[String]) -> Result<()>;

    async fn connect_to_lookupds(&self, addrs: &[String]) -> Result<()>;

    async fn disconnect_from_nsqd(&self, addr: &str) -> Result<()>;

    async fn disconnect_from_lookupd(&self, addr: &str) -> Result<()>;

    async fn stop(&self);
}

/// A message as delivered by the client.
#[async_trait]
pub trait RawMessage: Send + Sync {
    fn id(&self) -> &str;

    fn body(&self) -> &[u8];

    /// Delivery attempt, starting at 1.
    fn attempts(&self) -> u16;

    /// Stop the client from finishing/requeueing this message after the
    /// handler returns.
    fn disable_auto_response(&self);

    fn is_auto_response_disabled(&self) -> bool;

    /// Mark processed.
    async fn finish(&self);

    /// Return to the channel for redelivery after `delay`.
    async fn requeue(&self, delay: Option<Duration>);
}

// ============================================================================
// Client tuning
// ============================================================================

/// Client tuning parameters shared by producers and consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub dial_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub lookupd_poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub default_requeue_delay: Duration,
    pub max_requeue_delay: Duration,
    pub max_backoff_duration: Duration,
    /// Server-side message timeout; zero means the nsqd default.
    pub msg_timeout: Duration,
    pub output_buffer_timeout: Duration,
    /// Deliveries after which a failing message is dropped; zero is unlimited.
    pub max_attempts: u16,
    pub max_in_flight: usize,
    pub output_buffer_size: usize,
    pub client_id: String,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(1),
            lookupd_poll_interval: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            default_requeue_delay: Duration::from_secs(90),
            max_requeue_delay: Duration::from_secs(15 * 60),
            max_backoff_duration: Duration::from_secs(2 * 60),
            msg_timeout: Duration::ZERO,
            output_buffer_timeout: Duration::from_millis(250),
            max_attempts: 5,
            max_in_flight: 1,
            output_buffer_size: 16 * 1024,
            client_id: String::new(),
            user_agent: concat!("nsq-broker/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a `key=value` override.
    pub fn set(&mut self, opt: &str) -> Result<()> {
        let (key, value) = opt
            .split_once('=')
            .ok_or_else(|| invalid(format!("expected key=value, got '{}'", opt)))?;
        self.set_option(key.trim(), value.trim())
    }

    /// Apply a single named override.
    pub fn set_option(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "dial_timeout" => self.dial_timeout = parse_duration(key, value)?,
            "read_timeout" => self.read_timeout = parse_duration(key, value)?,
            "write_timeout" => self.write_timeout = parse_duration(key, value)?,
            "lookupd_poll_interval" => self.lookupd_poll_interval = parse_duration(key, value)?,
            "heartbeat_interval" => self.heartbeat_interval = parse_duration(key, value)?,
            "default_requeue_delay" => self.default_requeue_delay = parse_duration(key, value)?,
            "max_requeue_delay" => self.max_requeue_delay = parse_duration(key, value)?,
            "max_backoff_duration" => self.max_backoff_duration = parse_duration(key, value)?,
            "msg_timeout" => self.msg_timeout = parse_duration(key, value)?,
            "output_buffer_timeout" => self.output_buffer_timeout = parse_duration(key, value)?,
            "max_attempts" => self.max_attempts = parse_number(key, value)?,
            "max_in_flight" => self.max_in_flight = parse_number(key, value)?,
            "output_buffer_size" => self.output_buffer_size = parse_number(key, value)?,
            "client_id" => self.client_id = value.to_string(),
            "user_agent" => self.user_agent = value.to_string(),
            _ => return Err(invalid(format!("unknown client option '{}'", key))),
        }
        Ok(())
    }

    /// Apply every `key=value` override in order, stopping at the first error.
    pub fn apply<S: AsRef<str>>(&mut self, opts: &[S]) -> Result<()> {
        for opt in opts {
            self.set(opt.as_ref())?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval >= self.read_timeout {
            return Err(invalid(format!(
                "heartbeat_interval ({:?}) must be less than read_timeout ({:?})",
                self.heartbeat_interval, self.read_timeout
            )));
        }
        if self.default_requeue_delay > self.max_requeue_delay {
            return Err(invalid(format!(
                "default_requeue_delay ({:?}) exceeds max_requeue_delay ({:?})",
                self.default_requeue_delay, self.max_requeue_delay
            )));
        }
        Ok(())
    }
}

fn invalid(message: String) -> BrokerError {
    BrokerError::InvalidOption(message)
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| invalid(format!("{}: '{}' is not a valid number", key, value)))
}

/// Parse `1500ms`, `2s`, `5m`, `1h`, `250us`, `10ns`.
fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);

    let amount: u64 = digits
        .parse()
        .map_err(|_| invalid(format!("{}: '{}' is not a valid duration", key, value)))?;

    let seconds = |multiplier: u64| {
        amount
            .checked_mul(multiplier)
            .map(Duration::from_secs)
            .ok_or_else(|| invalid(format!("{}: '{}' is out of range", key, value)))
    };

    match unit {
        "ns" => Ok(Duration::from_nanos(amount)),
        "us" | "µs" => Ok(Duration::from_micros(amount)),
        "ms" => Ok(Duration::from_millis(amount)),
        "s" => Ok(Duration::from_secs(amount)),
        "m" => seconds(60),
        "h" => seconds(60 * 60),
        _ => Err(invalid(format!(
            "{}: '{}' has no recognised unit (ns, us, ms, s, m, h)",
            key, value
        ))),
    }
}
