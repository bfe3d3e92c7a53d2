//! Broker-agnostic publish/subscribe surface.
//!
//! This module contains:
//! - `Broker` trait: connection lifecycle, publish and subscribe
//! - `Handler` trait: for processing deliveries
//! - `Publication` / `Subscriber` traits handed to callers
//! - Typed options for connect, publish and subscribe
//! - The `Envelope` message unit and its `Codec`
//! - `BrokerRegistry`: explicit name -> constructor map

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

pub mod codec;
pub mod message;
pub mod options;
pub mod registry;

// Re-exports
pub use codec::{Codec, JsonCodec};
pub use message::Envelope;
pub use options::{BrokerOptions, CompletionSink, PublishOptions, SubscribeOptions, Transaction};
pub use registry::{BrokerConstructor, BrokerRegistry};

// ============================================================================
// Traits
// ============================================================================

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur during broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Broker is not connected: no producers available")]
    NotConnected,

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Invalid option: {0}")]
    InvalidOption(String),

    #[error("Unknown broker '{0}'")]
    UnknownBroker(String),
}

/// A single delivery handed to a subscription handler.
#[async_trait]
pub trait Publication: Send + Sync {
    /// Topic the message was delivered on.
    fn topic(&self) -> &str;

    /// The decoded message.
    fn message(&self) -> &Envelope;

    /// Mark the underlying message as processed.
    ///
    /// Only meaningful when the subscription disabled auto-acknowledge.
    async fn ack(&self) -> Result<()>;
}

/// Handler for processing deliveries from a subscription.
///
/// The returned error is handed back to the queue client unchanged, which
/// decides whether to requeue.
pub trait Handler: Send + Sync {
    fn handle(&self, publication: Arc<dyn Publication>) -> BoxFuture<'static, Result<()>>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Arc<dyn Publication>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn handle(&self, publication: Arc<dyn Publication>) -> BoxFuture<'static, Result<()>> {
        Box::pin(self(publication))
    }
}

/// Handle returned by `Broker::subscribe`.
#[async_trait]
pub trait Subscriber: Send + Sync {
    fn options(&self) -> &SubscribeOptions;

    fn topic(&self) -> &str;

    /// Stop consuming and forget the subscription.
    async fn unsubscribe(&self) -> Result<()>;
}

/// Uniform publish/subscribe facade over a message queue.
///
/// Implementations:
/// - `NsqBroker`: nsqd producers plus nsqd/nsqlookupd consumers
#[async_trait]
pub trait Broker: Send + Sync {
    /// Re-apply options. Rejected while connected.
    async fn init(&mut self, options: BrokerOptions) -> Result<()>;

    fn options(&self) -> &BrokerOptions;

    /// One of the configured broker addresses, chosen at random.
    fn address(&self) -> String;

    /// Establish producer connections and attach registered subscriptions.
    ///
    /// Idempotent while connected.
    async fn connect(&self) -> Result<()>;

    /// Tear down every producer and consumer connection.
    ///
    /// Subscriptions stay registered and are re-attached by the next `connect`.
    async fn disconnect(&self) -> Result<()>;

    async fn publish(
        &self,
        topic: &str,
        message: &Envelope,
        options: PublishOptions,
    ) -> Result<()>;

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn Handler>,
        options: SubscribeOptions,
    ) -> Result<Box<dyn Subscriber>>;

    /// Short broker name, e.g. "nsq".
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticPublication {
        message: Envelope,
    }

    #[async_trait]
    impl Publication for StaticPublication {
        fn topic(&self) -> &str {
            "orders"
        }

        fn message(&self) -> &Envelope {
            &self.message
        }

        async fn ack(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_closure_handler() {
        let handler = |p: Arc<dyn Publication>| async move {
            if p.message().body == b"bad" {
                return Err(BrokerError::Handler("rejected".to_string()));
            }
            Ok(())
        };

        let good: Arc<dyn Publication> = Arc::new(StaticPublication {
            message: Envelope::new(b"ok".to_vec()),
        });
        let bad: Arc<dyn Publication> = Arc::new(StaticPublication {
            message: Envelope::new(b"bad".to_vec()),
        });

        assert!(handler.handle(good).await.is_ok());
        assert!(matches!(
            handler.handle(bad).await,
            Err(BrokerError::Handler(_))
        ));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            BrokerError::NotConnected.to_string(),
            "Broker is not connected: no producers available"
        );
        assert_eq!(
            BrokerError::UnknownBroker("kafka".to_string()).to_string(),
            "Unknown broker 'kafka'"
        );
    }
}
