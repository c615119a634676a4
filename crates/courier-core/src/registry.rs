//! The authoritative instance-local map from user to live session.
//!
//! At most one session is registered per user. Registering a second session
//! for the same user closes the first one before the entry is replaced, and
//! unregistering only removes an entry that still holds the exact session
//! being unregistered.

use crate::session::Session;
use crate::telemetry;
use bytes::Bytes;
use courier_protocol::{codec, Envelope, Event, EventKind, UserId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

/// Presence channel capacity.
const PRESENCE_CAPACITY: usize = 1024;

/// A user went online or offline on this instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceChange {
    pub user_id: UserId,
    pub online: bool,
}

impl PresenceChange {
    /// The `friend_online` / `friend_offline` event for this change.
    #[must_use]
    pub fn into_event(self) -> Event {
        Event::presence(self.user_id, self.online)
    }
}

/// The session registry.
pub struct Registry {
    /// Live sessions indexed by user.
    sessions: DashMap<UserId, Arc<Session>>,
    /// Local presence notifications.
    presence: broadcast::Sender<PresenceChange>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        let (presence, _) = broadcast::channel(PRESENCE_CAPACITY);
        Self {
            sessions: DashMap::new(),
            presence,
        }
    }

    /// Install `session` as the current session for its user.
    ///
    /// Any previous session for the user is closed before the entry is
    /// replaced and is returned.
    pub fn register(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        let user_id = session.user_id();

        // Presence is published under the entry lock so that the order of
        // changes for one user matches the order of map updates
        let replaced = match self.sessions.entry(user_id) {
            Entry::Occupied(mut entry) => {
                if entry.get().id() == session.id() {
                    return None;
                }
                entry.get().close();
                let previous = entry.insert(session.clone());
                self.notify(PresenceChange {
                    user_id,
                    online: true,
                });
                Some(previous)
            }
            Entry::Vacant(entry) => {
                let _guard = entry.insert(session.clone());
                self.notify(PresenceChange {
                    user_id,
                    online: true,
                });
                None
            }
        };

        if let Some(previous) = &replaced {
            metrics::counter!(telemetry::names::SESSIONS_REPLACED_TOTAL).increment(1);
            info!(
                user_id,
                session = %session.id(),
                replaced = %previous.id(),
                "Session replaced"
            );
        } else {
            info!(user_id, session = %session.id(), "Session registered");
        }

        replaced
    }

    /// Remove `session` if it is still the current session for its user.
    ///
    /// Returns `true` if the entry was removed.
    pub fn unregister(&self, session: &Session) -> bool {
        let user_id = session.user_id();
        let removed = match self.sessions.entry(user_id) {
            Entry::Occupied(entry) if entry.get().id() == session.id() => {
                self.notify(PresenceChange {
                    user_id,
                    online: false,
                });
                entry.remove();
                true
            }
            _ => false,
        };

        if removed {
            info!(user_id, session = %session.id(), "Session unregistered");
        } else {
            trace!(user_id, session = %session.id(), "Unregister ignored, session not current");
        }

        removed
    }

    /// Get the current session for a user.
    #[must_use]
    pub fn get(&self, user_id: UserId) -> Option<Arc<Session>> {
        self.sessions.get(&user_id).map(|entry| entry.value().clone())
    }

    /// Check whether a user has a live session here.
    #[must_use]
    pub fn is_online(&self, user_id: UserId) -> bool {
        self.sessions.contains_key(&user_id)
    }

    /// Snapshot of online user ids.
    #[must_use]
    pub fn online_user_ids(&self) -> Vec<UserId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// Number of online users.
    #[must_use]
    pub fn online_count(&self) -> usize {
        self.sessions.len()
    }

    /// Snapshot of registered sessions.
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Send an event to a user.
    ///
    /// Returns `false` if the user has no session here. A frame dropped on a
    /// full queue still counts as delivered.
    pub fn send_to_user(
        &self,
        user_id: UserId,
        event: impl Into<EventKind>,
        data: Value,
    ) -> bool {
        self.send_envelope_to_user(user_id, &Envelope::new(event, data))
    }

    /// Send a prepared envelope to a user.
    pub fn send_envelope_to_user(&self, user_id: UserId, envelope: &Envelope) -> bool {
        let Some(session) = self.get(user_id) else {
            debug!(user_id, event = %envelope.event, "User not online here");
            return false;
        };
        session.send_envelope(envelope);
        true
    }

    /// Send an event to each user independently.
    ///
    /// Returns how many of them had a session here.
    pub fn send_to_users(
        &self,
        user_ids: &[UserId],
        event: impl Into<EventKind>,
        data: Value,
    ) -> usize {
        self.send_envelope_to_users(user_ids, &Envelope::new(event, data))
    }

    /// Send a prepared envelope to each user independently.
    pub fn send_envelope_to_users(&self, user_ids: &[UserId], envelope: &Envelope) -> usize {
        let Some(frame) = encode(envelope) else {
            return 0;
        };

        let mut delivered = 0;
        for session in user_ids.iter().filter_map(|user_id| self.get(*user_id)) {
            session.enqueue(frame.clone());
            delivered += 1;
        }
        delivered
    }

    /// Send an event to every registered session.
    ///
    /// Sessions registering while the broadcast runs may or may not see it.
    pub fn broadcast(&self, event: impl Into<EventKind>, data: Value) -> usize {
        let envelope = Envelope::new(event, data);
        let Some(frame) = encode(&envelope) else {
            return 0;
        };

        let sessions = self.sessions();
        for session in &sessions {
            session.enqueue(frame.clone());
        }

        debug!(event = %envelope.event, recipients = sessions.len(), "Broadcast");
        sessions.len()
    }

    /// Subscribe to local presence changes.
    #[must_use]
    pub fn subscribe_presence(&self) -> broadcast::Receiver<PresenceChange> {
        self.presence.subscribe()
    }

    /// Close and remove every session.
    ///
    /// Returns the number of sessions closed.
    pub fn shutdown(&self) -> usize {
        let user_ids = self.online_user_ids();
        let mut closed = 0;

        for user_id in user_ids {
            if let Entry::Occupied(entry) = self.sessions.entry(user_id) {
                self.notify(PresenceChange {
                    user_id,
                    online: false,
                });
                entry.remove().close();
                closed += 1;
            }
        }

        info!(closed, "Registry shut down");
        closed
    }

    fn notify(&self, change: PresenceChange) {
        // No receivers is fine; presence is best-effort
        if self.presence.send(change).is_err() {
            trace!(user_id = change.user_id, "No presence subscribers");
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn encode(envelope: &Envelope) -> Option<Bytes> {
    match codec::encode(envelope) {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!(event = %envelope.event, error = %e, "Failed to encode envelope");
            None
        }
    }
}
