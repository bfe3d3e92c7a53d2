//! Bootstrap utilities for broker binaries.

use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::broker::{Broker, Result};
use crate::config::LOG_ENV_VAR;

/// Initialize tracing with the NSQ_BROKER_LOG environment variable.
///
/// Defaults to "info" level if NSQ_BROKER_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Connect a broker, retrying with exponential backoff.
///
/// Returns the last error once `max_attempts` connects have failed.
pub async fn connect_with_retry(broker: &dyn Broker, max_attempts: u32) -> Result<()> {
    const INITIAL_DELAY: Duration = Duration::from_millis(100);
    const MAX_DELAY: Duration = Duration::from_secs(5);

    let mut delay = INITIAL_DELAY;
    let mut attempt = 0;

    loop {
        attempt += 1;
        match broker.connect().await {
            Ok(()) => {
                info!(broker = broker.name(), attempt, "Broker connected");
                return Ok(());
            }
            Err(e) if attempt < max_attempts => {
                warn!(
                    broker = broker.name(),
                    attempt,
                    max_attempts,
                    error = %e,
                    retry_in = ?delay,
                    "Broker connect failed, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, MAX_DELAY);
            }
            Err(e) => {
                error!(broker = broker.name(), attempts = attempt, error = %e, "Broker connect failed");
                return Err(e);
            }
        }
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use crate::broker::{BrokerError, BrokerOptions};
    use crate::nsq::{MemoryNsq, NsqBroker};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_connect_with_retry_succeeds() {
        let nsq = MemoryNsq::single("127.0.0.1:4150");
        let broker = NsqBroker::new(BrokerOptions::default(), Arc::new(nsq)).unwrap();

        connect_with_retry(&broker, 3).await.unwrap();
        assert!(broker.is_connected().await);
    }

    #[tokio::test]
    async fn test_connect_with_retry_gives_up() {
        let nsq = MemoryNsq::single("127.0.0.1:4150");
        nsq.set_ping_failure("127.0.0.1:4150", true).await;
        let broker = NsqBroker::new(BrokerOptions::default(), Arc::new(nsq.clone())).unwrap();

        let result = connect_with_retry(&broker, 2).await;

        assert!(matches!(result, Err(BrokerError::Connection(_))));
        assert_eq!(nsq.stats().pings, 2);
    }
}
