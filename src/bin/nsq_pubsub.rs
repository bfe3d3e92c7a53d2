//! nsq-pubsub: publish messages to a topic and print what a subscriber receives.
//!
//! Runs against the in-process NSQ cluster, seeded with the configured nsqd
//! and lookupd addresses.
//!
//! Usage: nsq-pubsub <topic> [message...]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info};

use nsq_broker::broker::{
    BrokerError, BrokerRegistry, Envelope, Publication, PublishOptions, SubscribeOptions,
};
use nsq_broker::config::Config;
use nsq_broker::nsq::{self, MemoryNsq, DEFAULT_NSQD_ADDR};
use nsq_broker::utils::bootstrap::{connect_with_retry, init_tracing};

const CONNECT_ATTEMPTS: u32 = 5;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

fn memory_cluster(config: &Config) -> MemoryNsq {
    let mut nsqds: Vec<String> = config
        .broker
        .addrs
        .iter()
        .filter(|a| !a.is_empty())
        .cloned()
        .collect();
    if nsqds.is_empty() {
        nsqds.push(DEFAULT_NSQD_ADDR.to_string());
    }

    let mut builder = MemoryNsq::builder();
    for addr in &nsqds {
        builder = builder.nsqd(addr.clone());
    }
    for lookupd in &config.broker.lookupd_addrs {
        builder = builder.lookupd(lookupd.clone(), nsqds.iter().cloned());
    }
    builder.build()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut args = std::env::args().skip(1);
    let Some(topic) = args.next() else {
        eprintln!("usage: nsq-pubsub <topic> [message...]");
        std::process::exit(2);
    };
    let messages: Vec<String> = args.collect();

    let config = Config::load().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    let options = config.broker_options()?;

    let mut registry = BrokerRegistry::new();
    nsq::register(&mut registry, Arc::new(memory_cluster(&config)));
    let broker = registry.build(&config.broker.name, options)?;

    info!(broker = broker.name(), address = %broker.address(), topic = %topic, "Starting");

    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
    let handler = move |p: Arc<dyn Publication>| {
        let tx = tx.clone();
        async move {
            tx.send(p.message().clone())
                .map_err(|e| BrokerError::Handler(e.to_string()))
        }
    };
    let subscriber = broker
        .subscribe(&topic, Arc::new(handler), SubscribeOptions::new())
        .await?;

    connect_with_retry(broker.as_ref(), CONNECT_ATTEMPTS).await?;

    for message in &messages {
        broker
            .publish(&topic, &Envelope::new(message.as_bytes()), PublishOptions::new())
            .await?;
    }

    for _ in 0..messages.len() {
        match tokio::time::timeout(DRAIN_TIMEOUT, rx.recv()).await {
            Ok(Some(envelope)) => println!("{}: {}", topic, String::from_utf8_lossy(&envelope.body)),
            _ => {
                error!("Timed out waiting for deliveries");
                break;
            }
        }
    }

    subscriber.unsubscribe().await?;
    broker.disconnect().await?;
    info!("Done");
    Ok(())
}
