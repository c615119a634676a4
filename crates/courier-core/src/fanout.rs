//! Cross-instance fanout.
//!
//! The bridge connects the local [`Registry`] to the shared [`Bus`]. Events
//! published by any instance arrive on the bus and are delivered to whichever
//! recipients hold a session here; local presence changes go the other way.

use crate::bus::{Bus, BusError, BusMessage};
use crate::directory::GroupDirectory;
use crate::registry::{PresenceChange, Registry};
use crate::telemetry;
use courier_protocol::{codec, Envelope, Event, MessageEventData, OnlineStatusData, UserId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Remote presence channel capacity.
const REMOTE_PRESENCE_CAPACITY: usize = 1024;

/// Bus topic names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Topics {
    /// Direct messages.
    pub direct: String,
    /// Group messages.
    pub group: String,
    /// Presence changes.
    pub presence: String,
}

impl Topics {
    /// Every topic the bridge subscribes to.
    #[must_use]
    pub fn all(&self) -> Vec<String> {
        vec![
            self.direct.clone(),
            self.group.clone(),
            self.presence.clone(),
        ]
    }
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            direct: "im:message".to_string(),
            group: "im:group:message".to_string(),
            presence: "im:online:status".to_string(),
        }
    }
}

/// Bridge between the bus and the local registry.
pub struct FanoutBridge {
    registry: Arc<Registry>,
    bus: Arc<dyn Bus>,
    directory: Arc<dyn GroupDirectory>,
    topics: Topics,
    remote_presence: broadcast::Sender<OnlineStatusData>,
}

impl FanoutBridge {
    /// Create a bridge.
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        bus: Arc<dyn Bus>,
        directory: Arc<dyn GroupDirectory>,
        topics: Topics,
    ) -> Self {
        let (remote_presence, _) = broadcast::channel(REMOTE_PRESENCE_CAPACITY);
        Self {
            registry,
            bus,
            directory,
            topics,
            remote_presence,
        }
    }

    /// Get the configured topics.
    #[must_use]
    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    /// Presence changes observed on the bus, from every instance.
    #[must_use]
    pub fn subscribe_remote_presence(&self) -> broadcast::Receiver<OnlineStatusData> {
        self.remote_presence.subscribe()
    }

    /// Run until cancelled or until the bus subscription ends.
    ///
    /// # Errors
    ///
    /// Returns an error if subscribing fails or the bus goes away.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), BusError> {
        let mut presence = self.registry.subscribe_presence();
        let mut subscription = self.bus.subscribe(&self.topics.all()).await?;

        info!(topics = ?self.topics.all(), "Fanout bridge started");

        loop {
            tokio::select! {
                // Pending presence is published before honoring cancellation
                biased;

                change = presence.recv() => match change {
                    Ok(change) => {
                        if let Err(e) = self.publish_presence(change).await {
                            warn!(
                                user_id = change.user_id,
                                error = %e,
                                "Failed to publish presence"
                            );
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Presence publisher lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },

                _ = cancel.cancelled() => {
                    info!("Fanout bridge stopped");
                    return Ok(());
                }

                message = subscription.next() => match message {
                    Some(message) => {
                        self.handle_bus_message(&message).await;
                    }
                    None => {
                        warn!("Bus subscription ended");
                        return Err(BusError::Closed);
                    }
                },
            }
        }
    }

    /// Deliver one bus payload to local sessions.
    ///
    /// Returns the number of local sessions it was handed to. Payloads that
    /// cannot be decoded, or that do not belong on their topic, are dropped.
    pub async fn handle_bus_message(&self, message: &BusMessage) -> usize {
        let (envelope, event) = match codec::decode(&message.payload)
            .and_then(|envelope| Event::from_envelope(&envelope).map(|event| (envelope, event)))
        {
            Ok(decoded) => decoded,
            Err(e) => {
                discard(&message.topic, &e.to_string());
                return 0;
            }
        };

        let topic = message.topic.as_str();
        if topic == self.topics.direct {
            match event {
                Event::Message(data) if data.to_user_id > 0 => {
                    usize::from(self.registry.send_envelope_to_user(data.to_user_id, &envelope))
                }
                other => {
                    discard(topic, &format!("unexpected {} event", other.kind()));
                    0
                }
            }
        } else if topic == self.topics.group {
            match event {
                Event::Message(data) | Event::GroupMessage(data) if data.is_group() => {
                    self.deliver_to_group(&data, &envelope).await
                }
                other => {
                    discard(topic, &format!("unexpected {} event", other.kind()));
                    0
                }
            }
        } else if topic == self.topics.presence {
            match event {
                Event::FriendOnline(status) | Event::FriendOffline(status) => {
                    debug!(
                        user_id = status.user_id,
                        online = status.online,
                        "Remote presence change"
                    );
                    // Nobody listening is fine
                    let _ = self.remote_presence.send(status);
                    0
                }
                other => {
                    discard(topic, &format!("unexpected {} event", other.kind()));
                    0
                }
            }
        } else {
            discard(topic, "unknown topic");
            0
        }
    }

    async fn deliver_to_group(&self, data: &MessageEventData, envelope: &Envelope) -> usize {
        let members = match self.directory.members(data.group_id).await {
            Ok(members) => members,
            Err(e) => {
                warn!(group_id = data.group_id, error = %e, "Group lookup failed");
                return 0;
            }
        };

        let recipients: Vec<UserId> = members
            .into_iter()
            .filter(|user_id| *user_id != data.from_user_id)
            .collect();

        let delivered = self.registry.send_envelope_to_users(&recipients, envelope);
        debug!(
            group_id = data.group_id,
            members = recipients.len(),
            delivered,
            "Group message delivered"
        );
        delivered
    }

    /// Publish an envelope to a topic.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or publishing fails.
    pub async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<usize, BusError> {
        let payload = codec::encode(envelope)?;
        self.bus.publish(topic, payload).await
    }

    /// Publish a chat message to the direct or group topic.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or publishing fails.
    pub async fn publish_message(&self, message: &MessageEventData) -> Result<usize, BusError> {
        let (topic, event) = if message.is_group() {
            (&self.topics.group, Event::GroupMessage(message.clone()))
        } else {
            (&self.topics.direct, Event::Message(message.clone()))
        };

        let mut envelope = event.into_envelope()?;
        if message.id > 0 {
            envelope = envelope.with_msg_id(message.id.to_string());
        }
        self.publish(topic, &envelope).await
    }

    /// Publish a local presence change.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or publishing fails.
    pub async fn publish_presence(&self, change: PresenceChange) -> Result<usize, BusError> {
        let envelope = change.into_event().into_envelope()?;
        self.publish(&self.topics.presence, &envelope).await
    }
}

fn discard(topic: &str, reason: &str) {
    metrics::counter!(telemetry::names::BUS_DISCARDED_TOTAL).increment(1);
    warn!(topic, reason, "Discarding bus payload");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::directory::InMemoryGroupDirectory;
    use crate::session::{OutboundQueue, Session};
    use bytes::Bytes;
    use courier_protocol::EventKind;
    use std::time::Duration;

    struct Fixture {
        registry: Arc<Registry>,
        bus: Arc<InMemoryBus>,
        directory: Arc<InMemoryGroupDirectory>,
        bridge: Arc<FanoutBridge>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(Registry::new());
        let bus = Arc::new(InMemoryBus::new());
        let directory = Arc::new(InMemoryGroupDirectory::new());
        let bridge = Arc::new(FanoutBridge::new(
            registry.clone(),
            bus.clone(),
            directory.clone(),
            Topics::default(),
        ));
        Fixture {
            registry,
            bus,
            directory,
            bridge,
        }
    }

    fn online(registry: &Registry, user_id: UserId) -> (Arc<Session>, OutboundQueue) {
        let (session, queue) = Session::new(user_id, 16);
        registry.register(session.clone());
        (session, queue)
    }

    fn direct(from: UserId, to: UserId, content: &str) -> MessageEventData {
        MessageEventData {
            id: 42,
            from_user_id: from,
            to_user_id: to,
            group_id: 0,
            msg_type: 1,
            content: content.to_string(),
            created_at: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    fn bus_message(topic: &str, envelope: &Envelope) -> BusMessage {
        BusMessage {
            topic: topic.to_string(),
            payload: codec::encode(envelope).unwrap(),
        }
    }

    async fn wait_for_subscribers(bus: &InMemoryBus, topic: &str) {
        // Empty payloads are discarded by the bridge
        while bus.publish(topic, Bytes::new()).await.unwrap() == 0 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_direct_message_delivered_only_when_registered() {
        let f = fixture();
        let (session, mut queue) = online(&f.registry, 5);

        let envelope = Event::Message(direct(1, 5, "hi")).into_envelope().unwrap();
        let delivered = f
            .bridge
            .handle_bus_message(&bus_message("im:message", &envelope))
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(session.pending(), 1);

        let received = codec::decode(&queue.try_recv().unwrap()).unwrap();
        assert_eq!(received.kind(), EventKind::Message);
        assert_eq!(received.data["content"], "hi");

        let elsewhere = Event::Message(direct(1, 6, "hi")).into_envelope().unwrap();
        let delivered = f
            .bridge
            .handle_bus_message(&bus_message("im:message", &elsewhere))
            .await;
        assert_eq!(delivered, 0);
        assert_eq!(session.pending(), 0);
    }

    #[tokio::test]
    async fn test_group_message_excludes_sender() {
        let f = fixture();
        f.directory.set_members(10, [1, 2, 3]);
        let (sender, _q1) = online(&f.registry, 1);
        let (member, _q2) = online(&f.registry, 2);

        let message = MessageEventData {
            group_id: 10,
            to_user_id: 0,
            ..direct(1, 0, "hello group")
        };
        let envelope = Event::GroupMessage(message).into_envelope().unwrap();

        let delivered = f
            .bridge
            .handle_bus_message(&bus_message("im:group:message", &envelope))
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(sender.pending(), 0);
        assert_eq!(member.pending(), 1);
    }

    #[tokio::test]
    async fn test_group_message_for_unknown_group() {
        let f = fixture();
        let (member, _q) = online(&f.registry, 2);

        let message = MessageEventData {
            group_id: 99,
            ..direct(1, 0, "nobody")
        };
        let envelope = Event::Message(message).into_envelope().unwrap();

        let delivered = f
            .bridge
            .handle_bus_message(&bus_message("im:group:message", &envelope))
            .await;
        assert_eq!(delivered, 0);
        assert_eq!(member.pending(), 0);
    }

    #[tokio::test]
    async fn test_malformed_payloads_discarded() {
        let f = fixture();
        let (session, _q) = online(&f.registry, 5);

        let garbage = BusMessage {
            topic: "im:message".to_string(),
            payload: Bytes::from_static(b"{not json"),
        };
        assert_eq!(f.bridge.handle_bus_message(&garbage).await, 0);

        // Right shape, wrong topic
        let presence = Event::presence(5, true).into_envelope().unwrap();
        assert_eq!(
            f.bridge
                .handle_bus_message(&bus_message("im:message", &presence))
                .await,
            0
        );

        let envelope = Event::Message(direct(1, 5, "hi")).into_envelope().unwrap();
        assert_eq!(
            f.bridge
                .handle_bus_message(&bus_message("elsewhere", &envelope))
                .await,
            0
        );
        assert_eq!(session.pending(), 0);
    }

    #[tokio::test]
    async fn test_remote_presence_forwarded() {
        let f = fixture();
        let mut remote = f.bridge.subscribe_remote_presence();

        let envelope = Event::presence(8, false).into_envelope().unwrap();
        f.bridge
            .handle_bus_message(&bus_message("im:online:status", &envelope))
            .await;

        assert_eq!(
            remote.try_recv().unwrap(),
            OnlineStatusData {
                user_id: 8,
                online: false
            }
        );
    }

    #[tokio::test]
    async fn test_publish_message_crosses_instances() {
        let f = fixture();
        let (_session, mut queue) = online(&f.registry, 5);

        let cancel = CancellationToken::new();
        let running = {
            let bridge = f.bridge.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { bridge.run(cancel).await })
        };
        wait_for_subscribers(&f.bus, "im:message").await;

        // A second instance on the same bus, with nobody online
        let other = FanoutBridge::new(
            Arc::new(Registry::new()),
            f.bus.clone(),
            f.directory.clone(),
            Topics::default(),
        );
        assert_eq!(other.publish_message(&direct(1, 5, "across")).await.unwrap(), 1);

        let frame = tokio::time::timeout(Duration::from_secs(5), queue.recv())
            .await
            .unwrap()
            .unwrap();
        let envelope = codec::decode(&frame).unwrap();
        assert_eq!(envelope.msg_id.as_deref(), Some("42"));
        assert_eq!(envelope.data["content"], "across");

        cancel.cancel();
        assert!(running.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_local_presence_published() {
        let f = fixture();
        let mut watcher = f
            .bus
            .subscribe(&["im:online:status".to_string()])
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let running = {
            let bridge = f.bridge.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { bridge.run(cancel).await })
        };
        wait_for_subscribers(&f.bus, "im:message").await;

        let (_session, _q) = online(&f.registry, 3);

        let message = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let message = watcher.next().await.unwrap();
                if !message.payload.is_empty() {
                    return message;
                }
            }
        })
        .await
        .unwrap();
        let envelope = codec::decode(&message.payload).unwrap();
        assert_eq!(envelope.kind(), EventKind::FriendOnline);
        assert_eq!(envelope.data["user_id"], 3);

        cancel.cancel();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_fails_when_bus_closes() {
        let f = fixture();
        let running = {
            let bridge = f.bridge.clone();
            tokio::spawn(async move { bridge.run(CancellationToken::new()).await })
        };
        wait_for_subscribers(&f.bus, "im:message").await;

        f.bus.close();
        assert!(matches!(running.await.unwrap(), Err(BusError::Closed)));
    }
}
