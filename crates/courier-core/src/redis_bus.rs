//! Redis pub/sub backend for the [`Bus`] trait.
//!
//! Publishing goes through one multiplexed connection shared by all callers.
//! Every subscription opens its own pub/sub connection; when that connection
//! drops the subscription ends and is not re-established.

use crate::bus::{validate_topic, Bus, BusError, BusMessage, Subscription};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Buffered messages per subscription.
const SUBSCRIPTION_BUFFER: usize = 1024;

impl From<redis::RedisError> for BusError {
    fn from(e: redis::RedisError) -> Self {
        BusError::Backend(e.to_string())
    }
}

/// Bus backed by a Redis server.
pub struct RedisBus {
    client: redis::Client,
    publisher: MultiplexedConnection,
}

impl RedisBus {
    /// Connect to the server at `url` (`redis://host:port/db`).
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url)?;
        let publisher = client.get_multiplexed_async_connection().await?;
        info!(url, "Connected to Redis bus");
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<usize, BusError> {
        validate_topic(topic)?;

        let mut conn = self.publisher.clone();
        let receivers: usize = conn.publish(topic, payload.to_vec()).await?;
        Ok(receivers)
    }

    async fn subscribe(&self, topics: &[String]) -> Result<Box<dyn Subscription>, BusError> {
        for topic in topics {
            validate_topic(topic)?;
        }

        let mut pubsub = self.client.get_async_pubsub().await?;
        for topic in topics {
            pubsub.subscribe(topic.as_str()).await?;
        }

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let task = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let message = BusMessage {
                    topic: msg.get_channel_name().to_string(),
                    payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
                };
                if tx.send(message).await.is_err() {
                    return; // Subscription dropped
                }
            }
            warn!("Redis subscription connection lost");
        });

        debug!(?topics, "Subscribed to Redis channels");
        Ok(Box::new(RedisSubscription { rx, task }))
    }
}

struct RedisSubscription {
    rx: mpsc::Receiver<BusMessage>,
    task: JoinHandle<()>,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

impl Drop for RedisSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}
