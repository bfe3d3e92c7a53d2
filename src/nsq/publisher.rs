//! Producer selection and publish dispatch.

use std::sync::Arc;

use rand::Rng;
use tracing::debug;

use super::client::Producer;
use super::pool::ConnectionState;
use crate::broker::{BrokerError, PublishOptions, Result};

/// Pick a producer uniformly at random.
///
/// Fails with `NotConnected` rather than indexing an empty pool.
pub(crate) fn select_producer(state: &ConnectionState) -> Result<Arc<dyn Producer>> {
    if !state.running || state.producers.is_empty() {
        return Err(BrokerError::NotConnected);
    }
    let index = rand::rng().random_range(0..state.producers.len());
    Ok(Arc::clone(&state.producers[index]))
}

/// Send through the producer operation matching the options.
pub(crate) async fn send(
    producer: &dyn Producer,
    topic: &str,
    body: Vec<u8>,
    options: PublishOptions,
) -> Result<()> {
    let delay = options.effective_delay();

    debug!(
        nsqd = %producer.address(),
        topic = %topic,
        bytes = body.len(),
        asynchronous = options.completion.is_some(),
        delay = ?delay,
        "Publishing"
    );

    match (options.completion, delay) {
        (Some(done), Some(delay)) => producer.deferred_publish_async(topic, delay, body, done).await,
        (Some(done), None) => producer.publish_async(topic, body, done).await,
        (None, Some(delay)) => producer.deferred_publish(topic, delay, body).await,
        (None, None) => producer.publish(topic, body).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{CompletionSink, Transaction};
    use crate::nsq::client::ClientConfig;
    use crate::nsq::pool::Topology;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Producer that records which operation was used.
    #[derive(Default)]
    struct RecordingProducer {
        calls: Mutex<Vec<&'static str>>,
    }

    impl RecordingProducer {
        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: &'static str) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl Producer for RecordingProducer {
        fn address(&self) -> &str {
            "127.0.0.1:4150"
        }
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
        async fn publish(&self, _topic: &str, _body: Vec<u8>) -> Result<()> {
            self.record("publish");
            Ok(())
        }
        async fn publish_async(&self, topic: &str, _body: Vec<u8>, done: CompletionSink) -> Result<()> {
            self.record("publish_async");
            let _ = done.send(Transaction { topic: topic.to_string(), result: Ok(()) });
            Ok(())
        }
        async fn deferred_publish(&self, _topic: &str, _delay: Duration, _body: Vec<u8>) -> Result<()> {
            self.record("deferred_publish");
            Ok(())
        }
        async fn deferred_publish_async(
            &self,
            _topic: &str,
            _delay: Duration,
            _body: Vec<u8>,
            _done: CompletionSink,
        ) -> Result<()> {
            self.record("deferred_publish_async");
            Ok(())
        }
        async fn stop(&self) {}
    }

    #[tokio::test]
    async fn test_send_dispatches_each_variant() {
        let producer = RecordingProducer::default();
        let (done, mut outcomes) = mpsc::unbounded_channel();
        let delay = Duration::from_millis(500);

        send(&producer, "orders", vec![], PublishOptions::new()).await.unwrap();
        send(&producer, "orders", vec![], PublishOptions::new().asynchronous(done.clone()))
            .await
            .unwrap();
        send(&producer, "orders", vec![], PublishOptions::new().deferred(delay))
            .await
            .unwrap();
        send(
            &producer,
            "orders",
            vec![],
            PublishOptions::new().asynchronous(done).deferred(delay),
        )
        .await
        .unwrap();

        assert_eq!(
            producer.calls(),
            vec!["publish", "publish_async", "deferred_publish", "deferred_publish_async"]
        );
        assert_eq!(outcomes.recv().await.unwrap().topic, "orders");
    }

    #[tokio::test]
    async fn test_zero_delay_is_plain_publish() {
        let producer = RecordingProducer::default();
        send(&producer, "orders", vec![], PublishOptions::new().deferred(Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(producer.calls(), vec!["publish"]);
    }

    #[test]
    fn test_select_producer_empty_pool() {
        let options = crate::broker::BrokerOptions::default();
        let mut state = ConnectionState::new(Topology::from_options(&options), ClientConfig::new());
        assert!(matches!(select_producer(&state), Err(BrokerError::NotConnected)));

        // Running with no producers is still rejected.
        state.running = true;
        assert!(matches!(select_producer(&state), Err(BrokerError::NotConnected)));
    }

    #[test]
    fn test_select_producer_from_pool() {
        let options = crate::broker::BrokerOptions::default();
        let mut state = ConnectionState::new(Topology::from_options(&options), ClientConfig::new());
        state.producers.push(Arc::new(RecordingProducer::default()));
        state.running = true;

        for _ in 0..10 {
            assert_eq!(select_producer(&state).unwrap().address(), "127.0.0.1:4150");
        }
    }
}
