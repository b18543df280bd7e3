//! # Bus Adapter
//!
//! Thin capability over the MQTT client: connect, publish, subscribe, and
//! inbound dispatch. The adapter owns all session concerns: QoS mapping,
//! the connect timeout, and reconnection with bounded exponential backoff
//! (1 s doubling up to 120 s). Pre-registered subscriptions are re-established
//! on every reconnect.
//!
//! The transfer core talks to the bus through [`BusPublisher`], so tests can
//! substitute an in-memory implementation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, QoS};
use tokio::sync::{mpsc, watch};

use crate::config::BusConfig;
use crate::error::{Error, Result};

/// How long `wait_connected` callers typically wait for the session.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(120);

/// A raw message delivered by the bus.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Full topic the message arrived on.
    pub topic: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

/// Publish capability handed to the sender and receiver state machines.
#[async_trait]
pub trait BusPublisher: Send + Sync {
    /// Publish `payload` to `topic` at the given QoS (0, 1 or 2).
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: u8) -> Result<()>;
}

/// Map a numeric QoS to the client's level, rejecting anything outside 0-2.
pub fn qos_level(qos: u8) -> Result<QoS> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(Error::InvalidQos(other)),
    }
}

/// MQTT-backed bus adapter.
///
/// Constructed with [`MqttBus::start`], which spawns the network event loop.
/// Inbound publishes are pushed to the channel supplied at construction; the
/// core never registers callbacks after the fact.
#[derive(Clone)]
pub struct MqttBus {
    client: AsyncClient,
    connected: watch::Receiver<bool>,
    subscriptions: Arc<Mutex<Vec<(String, QoS)>>>,
    published: Arc<AtomicU64>,
    broker: String,
}

impl MqttBus {
    /// Spawn the event loop and return the adapter handle.
    ///
    /// `client_id` is passed explicitly so subscriber connections can use
    /// [`BusConfig::subscriber_client_id`]. The adapter keeps polling (and
    /// backing off) until dropped or [`MqttBus::disconnect`] is called, so a
    /// failed first connect does not kill a long-running receiver.
    pub fn start(
        config: &BusConfig,
        client_id: &str,
        inbound: mpsc::UnboundedSender<InboundMessage>,
    ) -> Self {
        let mut options = MqttOptions::new(
            client_id.to_string(),
            config.broker_host.clone(),
            config.broker_port,
        );
        options.set_keep_alive(Duration::from_secs(config.keepalive_secs));
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user.clone(), pass.clone());
        }

        let (client, mut event_loop) = AsyncClient::new(options, 64);
        let (connected_tx, connected_rx) = watch::channel(false);
        let subscriptions: Arc<Mutex<Vec<(String, QoS)>>> = Arc::new(Mutex::new(Vec::new()));
        let broker = format!("{}:{}", config.broker_host, config.broker_port);

        let loop_client = client.clone();
        let loop_subscriptions = Arc::clone(&subscriptions);
        let loop_broker = broker.clone();
        tokio::spawn(async move {
            let mut backoff = BACKOFF_MIN;
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            tracing::info!(broker = loop_broker.as_str(), "Connected to broker");
                            backoff = BACKOFF_MIN;
                            let _ = connected_tx.send(true);
                            let filters: Vec<(String, QoS)> =
                                loop_subscriptions.lock().unwrap().clone();
                            for (filter, qos) in filters {
                                if let Err(e) = loop_client.subscribe(filter.clone(), qos).await {
                                    tracing::warn!(
                                        filter = filter.as_str(),
                                        error = %e,
                                        "Failed to re-subscribe after reconnect"
                                    );
                                }
                            }
                        } else {
                            tracing::error!(
                                broker = loop_broker.as_str(),
                                code = ?ack.code,
                                "Broker refused connection"
                            );
                            let _ = connected_tx.send(false);
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let message = InboundMessage {
                            topic: publish.topic.clone(),
                            payload: publish.payload.to_vec(),
                        };
                        if inbound.send(message).is_err() {
                            // Receiver side is gone; stop driving the session.
                            let _ = loop_client.disconnect().await;
                            return;
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        tracing::info!(broker = loop_broker.as_str(), "Broker closed the session");
                        let _ = connected_tx.send(false);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = connected_tx.send(false);
                        tracing::warn!(
                            broker = loop_broker.as_str(),
                            error = %e,
                            backoff_secs = backoff.as_secs(),
                            "Connection lost, reconnecting after backoff"
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(BACKOFF_MAX);
                    }
                }
            }
        });

        Self {
            client,
            connected: connected_rx,
            subscriptions,
            published: Arc::new(AtomicU64::new(0)),
            broker,
        }
    }

    /// Block until the session is established, up to `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let mut connected = self.connected.clone();
        tokio::time::timeout(timeout, connected.wait_for(|up| *up))
            .await
            .map_err(|_| Error::ConnectTimeout(self.broker.clone()))?
            .map_err(|_| Error::ConnectTimeout(self.broker.clone()))?;
        Ok(())
    }

    /// Whether the session is currently established.
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Register a subscription. It is (re-)established on every reconnect;
    /// `filter` may contain the single-level wildcard `+`.
    pub async fn subscribe(&self, filter: &str, qos: u8) -> Result<()> {
        let level = qos_level(qos)?;
        self.subscriptions
            .lock()
            .unwrap()
            .push((filter.to_string(), level));
        self.client
            .subscribe(filter.to_string(), level)
            .await
            .map_err(|e| Error::SubscribeFailed(e.to_string()))?;
        tracing::info!(filter = filter, qos = qos, "Subscribed");
        Ok(())
    }

    /// Messages published so far on this handle.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Close the session.
    pub async fn disconnect(&self) {
        tracing::info!(
            broker = self.broker.as_str(),
            published = self.published_count(),
            "Disconnecting from broker"
        );
        let _ = self.client.disconnect().await;
    }
}

#[async_trait]
impl BusPublisher for MqttBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: u8) -> Result<()> {
        let level = qos_level(qos)?;
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        self.client
            .publish(topic.to_string(), level, false, payload)
            .await
            .map_err(|e| Error::PublishFailed(e.to_string()))?;
        self.published.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(topic = topic, "Published");
        Ok(())
    }
}

// ============================================================================
// TEST DOUBLE
// ============================================================================

#[cfg(test)]
pub mod testing {
    //! In-memory [`BusPublisher`] recording every publication.

    use super::*;

    /// Records publications instead of sending them anywhere.
    #[derive(Default)]
    pub struct MemoryBus {
        records: Mutex<Vec<(String, Vec<u8>, u8)>>,
        fail_next: Mutex<usize>,
    }

    impl MemoryBus {
        /// New empty bus.
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Make the next `n` publishes fail.
        pub fn fail_next(&self, n: usize) {
            *self.fail_next.lock().unwrap() = n;
        }

        /// Snapshot of all recorded publications.
        pub fn published(&self) -> Vec<(String, Vec<u8>, u8)> {
            self.records.lock().unwrap().clone()
        }

        /// Drain and return recorded publications.
        pub fn take(&self) -> Vec<(String, Vec<u8>, u8)> {
            std::mem::take(&mut self.records.lock().unwrap())
        }

        /// Publications whose topic ends with `suffix`.
        pub fn on_topic_suffix(&self, suffix: &str) -> Vec<Vec<u8>> {
            self.records
                .lock()
                .unwrap()
                .iter()
                .filter(|(topic, _, _)| topic.ends_with(suffix))
                .map(|(_, payload, _)| payload.clone())
                .collect()
        }
    }

    #[async_trait]
    impl BusPublisher for MemoryBus {
        async fn publish(&self, topic: &str, payload: Vec<u8>, qos: u8) -> Result<()> {
            qos_level(qos)?;
            {
                let mut fail = self.fail_next.lock().unwrap();
                if *fail > 0 {
                    *fail -= 1;
                    return Err(Error::PublishFailed("simulated failure".to_string()));
                }
            }
            self.records
                .lock()
                .unwrap()
                .push((topic.to_string(), payload, qos));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_mapping() {
        assert_eq!(qos_level(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(qos_level(1).unwrap(), QoS::AtLeastOnce);
        assert_eq!(qos_level(2).unwrap(), QoS::ExactlyOnce);
        assert!(matches!(qos_level(3), Err(Error::InvalidQos(3))));
    }

    #[tokio::test]
    async fn test_publish_requires_session() {
        let config = BusConfig {
            broker_host: "127.0.0.1".to_string(),
            broker_port: 1, // nothing listening
            ..BusConfig::default()
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let bus = MqttBus::start(&config, "test_client", tx);

        assert!(!bus.is_connected());
        let result = bus.publish("orca/iot/file/f-1/meta", b"{}".to_vec(), 1).await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_wait_connected_times_out() {
        let config = BusConfig {
            broker_host: "127.0.0.1".to_string(),
            broker_port: 1,
            ..BusConfig::default()
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let bus = MqttBus::start(&config, "test_client", tx);

        let result = bus.wait_connected(Duration::from_millis(100)).await;
        assert!(matches!(result, Err(Error::ConnectTimeout(_))));
    }

    #[tokio::test]
    async fn test_memory_bus_records_and_fails() {
        use testing::MemoryBus;

        let bus = MemoryBus::new();
        bus.publish("a/b", b"1".to_vec(), 1).await.unwrap();
        bus.fail_next(1);
        assert!(bus.publish("a/b", b"2".to_vec(), 1).await.is_err());
        bus.publish("a/c", b"3".to_vec(), 0).await.unwrap();

        let records = bus.published();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0, "a/b");
        assert_eq!(records[1].2, 0);
        assert_eq!(bus.on_topic_suffix("/c").len(), 1);
    }
}
