//! Connection pool.
//!
//! `ConnectionState` owns the running flag, the live producers and every
//! subscription record. The broker keeps it behind one mutex and holds that
//! mutex for a whole connect, disconnect, subscribe or unsubscribe, so no
//! caller can observe `running` without producers.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::client::{ClientConfig, Consumer, NsqClient, Producer};
use super::subscription::SubscriptionRecord;
use super::DEFAULT_NSQD_ADDR;
use crate::broker::{BrokerOptions, Result};

/// Where producers connect and consumers attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Topology {
    pub nsqd_tcp_addrs: Vec<String>,
    pub lookupd_http_addrs: Vec<String>,
}

impl Topology {
    /// Empty addresses are dropped; with no nsqd left the local default is used.
    pub fn from_options(options: &BrokerOptions) -> Self {
        let mut nsqd_tcp_addrs: Vec<String> = options
            .addrs
            .iter()
            .filter(|addr| !addr.is_empty())
            .cloned()
            .collect();

        if nsqd_tcp_addrs.is_empty() {
            nsqd_tcp_addrs.push(DEFAULT_NSQD_ADDR.to_string());
        }

        let lookupd_http_addrs = options
            .lookupd_addrs
            .iter()
            .filter(|addr| !addr.is_empty())
            .cloned()
            .collect();

        Self {
            nsqd_tcp_addrs,
            lookupd_http_addrs,
        }
    }

    pub fn uses_lookupd(&self) -> bool {
        !self.lookupd_http_addrs.is_empty()
    }

    /// Attach a consumer through lookupd when configured, else directly.
    pub async fn attach(&self, consumer: &dyn Consumer) -> Result<()> {
        if self.uses_lookupd() {
            consumer.connect_to_lookupds(&self.lookupd_http_addrs).await
        } else {
            consumer.connect_to_nsqds(&self.nsqd_tcp_addrs).await
        }
    }

    /// Release every address the consumer was attached through.
    ///
    /// Best effort: failures are logged and skipped.
    pub async fn detach(&self, consumer: &dyn Consumer) {
        if self.uses_lookupd() {
            for addr in &self.lookupd_http_addrs {
                if let Err(e) = consumer.disconnect_from_lookupd(addr).await {
                    debug!(lookupd = %addr, error = %e, "Ignoring lookupd disconnect failure");
                }
            }
        } else {
            for addr in &self.nsqd_tcp_addrs {
                if let Err(e) = consumer.disconnect_from_nsqd(addr).await {
                    debug!(nsqd = %addr, error = %e, "Ignoring nsqd disconnect failure");
                }
            }
        }
    }
}

pub(crate) struct ConnectionState {
    pub running: bool,
    pub producers: Vec<Arc<dyn Producer>>,
    pub subscriptions: Vec<SubscriptionRecord>,
    pub topology: Topology,
    pub config: ClientConfig,
}

impl ConnectionState {
    pub fn new(topology: Topology, config: ClientConfig) -> Self {
        Self {
            running: false,
            producers: Vec::new(),
            subscriptions: Vec::new(),
            topology,
            config,
        }
    }

    /// Open and ping one producer per nsqd, then attach every subscription
    /// that is not attached yet.
    ///
    /// All or nothing: on failure everything opened by this call is torn down.
    pub async fn connect(&mut self, client: &dyn NsqClient) -> Result<()> {
        if self.running {
            debug!("Already connected");
            return Ok(());
        }

        let mut producers: Vec<Arc<dyn Producer>> =
            Vec::with_capacity(self.topology.nsqd_tcp_addrs.len());

        for addr in &self.topology.nsqd_tcp_addrs {
            match open_producer(client, addr, &self.config).await {
                Ok(producer) => producers.push(producer),
                Err(e) => {
                    warn!(nsqd = %addr, error = %e, "Producer connection failed");
                    stop_producers(&producers).await;
                    return Err(e);
                }
            }
        }

        let mut attached: Vec<usize> = Vec::new();
        for index in 0..self.subscriptions.len() {
            if self.subscriptions[index].is_attached() {
                continue;
            }

            let result = self.subscriptions[index]
                .attach(client, &self.topology, &self.config)
                .await;

            if let Err(e) = result {
                warn!(
                    topic = %self.subscriptions[index].topic,
                    channel = %self.subscriptions[index].channel,
                    error = %e,
                    "Subscription attach failed"
                );
                for i in attached {
                    self.subscriptions[i].detach(&self.topology).await;
                }
                stop_producers(&producers).await;
                return Err(e);
            }
            attached.push(index);
        }

        self.producers = producers;
        self.running = true;

        info!(
            producers = self.producers.len(),
            subscriptions = self.subscriptions.len(),
            lookupd = self.topology.uses_lookupd(),
            "Connected to NSQ"
        );
        Ok(())
    }

    /// Stop every producer and consumer. Records are kept for the next connect.
    pub async fn disconnect(&mut self) -> Result<()> {
        if !self.running {
            debug!("Already disconnected");
            return Ok(());
        }

        stop_producers(&self.producers).await;

        for record in &mut self.subscriptions {
            record.detach(&self.topology).await;
        }

        self.producers.clear();
        self.running = false;

        info!(
            subscriptions = self.subscriptions.len(),
            "Disconnected from NSQ"
        );
        Ok(())
    }

    /// Register a subscription. Its consumer is opened straight away and
    /// attached too when connected; nothing is recorded if either fails.
    pub async fn add_subscription(
        &mut self,
        client: &dyn NsqClient,
        mut record: SubscriptionRecord,
    ) -> Result<()> {
        if self.running {
            record.attach(client, &self.topology, &self.config).await?;
        } else {
            record.open(client, &self.config).await?;
        }
        self.subscriptions.push(record);
        Ok(())
    }

    /// Drop a subscription, detaching its consumer. Returns whether it existed.
    pub async fn remove_subscription(&mut self, id: Uuid) -> bool {
        let Some(position) = self.subscriptions.iter().position(|r| r.id == id) else {
            return false;
        };

        let mut record = self.subscriptions.remove(position);
        record.detach(&self.topology).await;
        true
    }
}

async fn open_producer(
    client: &dyn NsqClient,
    addr: &str,
    config: &ClientConfig,
) -> Result<Arc<dyn Producer>> {
    let producer = client.new_producer(addr, config).await?;

    if let Err(e) = producer.ping().await {
        producer.stop().await;
        return Err(e);
    }

    debug!(nsqd = %addr, "Producer connected");
    Ok(producer)
}

async fn stop_producers(producers: &[Arc<dyn Producer>]) {
    for producer in producers {
        producer.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_defaults_nsqd() {
        let topology = Topology::from_options(&BrokerOptions::default());
        assert_eq!(topology.nsqd_tcp_addrs, vec![DEFAULT_NSQD_ADDR]);
        assert!(!topology.uses_lookupd());
    }

    #[test]
    fn test_topology_drops_empty_addresses() {
        let options = BrokerOptions::new()
            .with_addrs(["", "10.0.0.1:4150", ""])
            .with_lookupd_addrs(["", "10.0.0.9:4161"]);
        let topology = Topology::from_options(&options);

        assert_eq!(topology.nsqd_tcp_addrs, vec!["10.0.0.1:4150"]);
        assert_eq!(topology.lookupd_http_addrs, vec!["10.0.0.9:4161"]);
        assert!(topology.uses_lookupd());
    }

    #[test]
    fn test_topology_only_empty_addresses_falls_back() {
        let options = BrokerOptions::new().with_addrs([""]);
        let topology = Topology::from_options(&options);
        assert_eq!(topology.nsqd_tcp_addrs, vec![DEFAULT_NSQD_ADDR]);
    }
}
