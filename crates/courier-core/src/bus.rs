//! Publish/subscribe bus shared between backend instances.
//!
//! The [`Bus`] trait is the seam to the external transport. [`InMemoryBus`]
//! implements it inside one process on top of tokio broadcast channels, which
//! is enough for single-node deployments and tests.

use async_trait::async_trait;
use bytes::Bytes;
use courier_protocol::ProtocolError;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Maximum topic name length.
pub const MAX_TOPIC_LENGTH: usize = 256;

/// Default per-topic buffer.
const DEFAULT_TOPIC_CAPACITY: usize = 1024;

/// Bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// Invalid topic name.
    #[error("Invalid topic: {0}")]
    InvalidTopic(&'static str),

    /// The bus is no longer reachable.
    #[error("Bus closed")]
    Closed,

    /// Payload could not be encoded.
    #[error("Encoding error: {0}")]
    Encode(#[from] ProtocolError),

    /// Backend-specific failure.
    #[error("Bus backend error: {0}")]
    Backend(String),
}

/// A payload received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// A live subscription to one or more topics.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next message. Returns `None` once the bus has gone away.
    async fn next(&mut self) -> Option<BusMessage>;
}

/// A publish/subscribe transport.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish a payload to a topic.
    ///
    /// Returns the number of subscribers the backend reports, if it knows.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<usize, BusError>;

    /// Subscribe to a set of topics.
    async fn subscribe(&self, topics: &[String]) -> Result<Box<dyn Subscription>, BusError>;
}

/// Validate a topic name.
///
/// # Errors
///
/// Returns an error message if the topic name is invalid.
pub fn validate_topic(name: &str) -> Result<(), BusError> {
    if name.is_empty() {
        return Err(BusError::InvalidTopic("Topic name cannot be empty"));
    }
    if name.len() > MAX_TOPIC_LENGTH {
        return Err(BusError::InvalidTopic("Topic name too long"));
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err(BusError::InvalidTopic("Topic name contains invalid characters"));
    }
    Ok(())
}

/// Process-local bus.
pub struct InMemoryBus {
    topics: DashMap<String, broadcast::Sender<BusMessage>>,
    capacity: usize,
}

impl InMemoryBus {
    /// Create a bus with the default per-topic buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    /// Create a bus with a specific per-topic buffer.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Drop every topic, ending all subscriptions.
    pub fn close(&self) {
        self.topics.clear();
        debug!("In-memory bus closed");
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .value()
            .clone()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for InMemoryBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<usize, BusError> {
        validate_topic(topic)?;

        let Some(sender) = self.topics.get(topic).map(|s| s.value().clone()) else {
            trace!(topic, "Publish to topic without subscribers");
            return Ok(0);
        };

        let message = BusMessage {
            topic: topic.to_string(),
            payload,
        };
        Ok(sender.send(message).unwrap_or_default())
    }

    async fn subscribe(&self, topics: &[String]) -> Result<Box<dyn Subscription>, BusError> {
        for topic in topics {
            validate_topic(topic)?;
        }

        let (tx, rx) = mpsc::channel(self.capacity);
        let mut tasks = Vec::with_capacity(topics.len());

        for topic in topics {
            let mut receiver = self.sender(topic).subscribe();
            let tx = tx.clone();
            let topic = topic.clone();

            tasks.push(tokio::spawn(async move {
                loop {
                    match receiver.recv().await {
                        Ok(message) => {
                            if tx.send(message).await.is_err() {
                                break; // Subscription dropped
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(topic = %topic, skipped, "Bus subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }

        debug!(?topics, "Subscribed to bus topics");
        Ok(Box::new(InMemorySubscription { rx, tasks }))
    }
}

/// Subscription handed out by [`InMemoryBus`].
struct InMemorySubscription {
    rx: mpsc::Receiver<BusMessage>,
    tasks: Vec<JoinHandle<()>>,
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn next(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

impl Drop for InMemorySubscription {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topics(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe(&topics(&["a", "b"])).await.unwrap();

        assert_eq!(bus.publish("b", Bytes::from_static(b"hi")).await.unwrap(), 1);

        let message = sub.next().await.unwrap();
        assert_eq!(message.topic, "b");
        assert_eq!(&message.payload[..], b"hi");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = InMemoryBus::new();
        assert_eq!(bus.publish("nobody", Bytes::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_topics_rejected() {
        let bus = InMemoryBus::new();
        assert!(matches!(
            bus.publish("", Bytes::new()).await,
            Err(BusError::InvalidTopic(_))
        ));
        assert!(bus.subscribe(&topics(&["bad\ntopic"])).await.is_err());
        assert!(validate_topic(&"t".repeat(MAX_TOPIC_LENGTH + 1)).is_err());
        assert!(validate_topic("im:message").is_ok());
    }

    #[tokio::test]
    async fn test_close_ends_subscription() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe(&topics(&["a"])).await.unwrap();

        bus.close();
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_per_topic_order_preserved() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe(&topics(&["a"])).await.unwrap();

        for i in 0..10u8 {
            bus.publish("a", Bytes::from(vec![i])).await.unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(sub.next().await.unwrap().payload[..], [i]);
        }
    }
}
