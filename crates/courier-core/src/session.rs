//! A live connection bound to exactly one user.
//!
//! A [`Session`] is the shared handle: producers enqueue encoded envelopes
//! into its bounded outbound queue and any party may close it. The matching
//! [`OutboundQueue`] is owned by whoever drains it, normally the write flow
//! spawned in [`crate::connection`].

use bytes::Bytes;
use courier_protocol::{codec, Envelope, EventKind, UserId};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::telemetry;

/// Default outbound queue capacity.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Opaque session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-session timing and sizing.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bounded outbound queue capacity.
    pub outbound_capacity: usize,
    /// Interval between transport liveness probes sent by the write flow.
    pub ping_interval: Duration,
    /// Read deadline, extended on every liveness acknowledgment.
    pub pong_wait: Duration,
    /// Deadline for a single transport write.
    pub write_wait: Duration,
    /// Inbound frames larger than this are discarded as malformed.
    pub max_message_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            ping_interval: Duration::from_secs(30),
            pong_wait: Duration::from_secs(60),
            write_wait: Duration::from_secs(10),
            max_message_size: 64 * 1024,
        }
    }
}

/// Session lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    /// Closed, but the connection flows have not finished yet.
    Closing,
    Closed,
}

/// Result of enqueuing an outbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Appended to the outbound queue.
    Queued,
    /// Queue was full; the frame was discarded.
    Dropped,
    /// Session is no longer open; the frame was discarded.
    Closed,
}

struct Lifecycle {
    state: SessionState,
    outbound: Option<mpsc::Sender<Bytes>>,
    attached: bool,
}

/// One live connection for one user.
pub struct Session {
    id: SessionId,
    user_id: UserId,
    lifecycle: Mutex<Lifecycle>,
    last_ping: RwLock<Instant>,
    shutdown: CancellationToken,
    dropped: AtomicU64,
}

/// Receiving end of a session's outbound queue.
pub struct OutboundQueue {
    rx: mpsc::Receiver<Bytes>,
}

impl OutboundQueue {
    /// Wait for the next frame. Returns `None` once the session is closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Take the next frame without waiting.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }
}

impl Session {
    /// Create an open session and its outbound queue.
    #[must_use]
    pub fn new(user_id: UserId, capacity: usize) -> (Arc<Self>, OutboundQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let session = Arc::new(Self {
            id: SessionId::new(),
            user_id,
            lifecycle: Mutex::new(Lifecycle {
                state: SessionState::Open,
                outbound: Some(tx),
                attached: false,
            }),
            last_ping: RwLock::new(Instant::now()),
            shutdown: CancellationToken::new(),
            dropped: AtomicU64::new(0),
        });
        (session, OutboundQueue { rx })
    }

    /// Get the session identifier.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Get the owning user.
    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Get the lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.lifecycle.lock().state
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() != SessionState::Open
    }

    /// Enqueue an event for this session's client.
    ///
    /// Never blocks: a full queue drops the frame.
    pub fn send_message(&self, event: impl Into<EventKind>, data: Value) -> SendStatus {
        self.send_envelope(&Envelope::new(event, data))
    }

    /// Enqueue a prepared envelope.
    pub fn send_envelope(&self, envelope: &Envelope) -> SendStatus {
        match codec::encode(envelope) {
            Ok(frame) => self.enqueue(frame),
            Err(e) => {
                warn!(
                    session = %self.id,
                    user_id = self.user_id,
                    error = %e,
                    "Failed to encode envelope"
                );
                SendStatus::Dropped
            }
        }
    }

    /// Enqueue an already encoded frame.
    pub fn enqueue(&self, frame: Bytes) -> SendStatus {
        let lifecycle = self.lifecycle.lock();
        let Some(tx) = lifecycle.outbound.as_ref() else {
            return SendStatus::Closed;
        };

        match tx.try_send(frame) {
            Ok(()) => SendStatus::Queued,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(telemetry::names::OUTBOUND_DROPPED_TOTAL).increment(1);
                warn!(
                    session = %self.id,
                    user_id = self.user_id,
                    "Outbound queue full, dropping frame"
                );
                SendStatus::Dropped
            }
            Err(TrySendError::Closed(_)) => SendStatus::Closed,
        }
    }

    /// Number of frames waiting in the outbound queue.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.lifecycle
            .lock()
            .outbound
            .as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }

    /// Number of frames dropped because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Close the session.
    ///
    /// Idempotent: the outbound queue is closed and the connection is told to
    /// shut down exactly once. Returns `true` for the call that closed it.
    pub fn close(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != SessionState::Open {
            return false;
        }

        lifecycle.state = if lifecycle.attached {
            SessionState::Closing
        } else {
            SessionState::Closed
        };
        lifecycle.outbound = None;
        self.shutdown.cancel();

        debug!(session = %self.id, user_id = self.user_id, "Session closed");
        true
    }

    /// Wait until the session is closed.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await;
    }

    /// Record a liveness acknowledgment.
    pub fn update_last_ping(&self) {
        *self.last_ping.write() = Instant::now();
    }

    /// Time of the last liveness acknowledgment.
    #[must_use]
    pub fn last_ping(&self) -> Instant {
        *self.last_ping.read()
    }

    /// How long the session has gone without a liveness acknowledgment.
    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_ping())
    }

    /// Whether the last acknowledgment is within `timeout`.
    #[must_use]
    pub fn is_alive(&self, timeout: Duration) -> bool {
        self.idle_for(Instant::now()) <= timeout
    }

    /// Mark that connection flows are running for this session.
    pub(crate) fn attach(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == SessionState::Open {
            lifecycle.attached = true;
        }
    }

    /// Mark that the connection flows have finished.
    pub(crate) fn mark_terminated(&self) {
        self.close();
        self.lifecycle.lock().state = SessionState::Closed;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_send_message_enqueues_envelope() {
        let (session, mut queue) = Session::new(7, 4);

        assert_eq!(
            session.send_message(EventKind::Ping, Value::Null),
            SendStatus::Queued
        );
        assert_eq!(session.pending(), 1);

        let frame = queue.try_recv().unwrap();
        let envelope = codec::decode(&frame).unwrap();
        assert_eq!(envelope.event, "ping");
        assert_eq!(session.pending(), 0);
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let (session, mut queue) = Session::new(1, 2);

        for i in 0..5 {
            session.send_message("message", json!({ "n": i }));
        }

        assert_eq!(session.pending(), 2);
        assert_eq!(session.dropped(), 3);

        // FIFO for what was kept
        let first = codec::decode(&queue.try_recv().unwrap()).unwrap();
        let second = codec::decode(&queue.try_recv().unwrap()).unwrap();
        assert_eq!(first.data, json!({ "n": 0 }));
        assert_eq!(second.data, json!({ "n": 1 }));
        assert!(queue.try_recv().is_none());
    }

    #[test]
    fn test_close_is_idempotent() {
        let (session, _queue) = Session::new(1, 4);

        assert!(session.close());
        assert!(!session.close());
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(
            session.send_message(EventKind::Pong, Value::Null),
            SendStatus::Closed
        );
    }

    #[test]
    fn test_close_ends_outbound_queue() {
        let (session, mut queue) = Session::new(1, 4);
        session.send_message(EventKind::Ping, Value::Null);
        session.close();

        // Already buffered frames remain readable, then the queue ends
        assert!(queue.try_recv().is_some());
        assert!(queue.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_close_single_effect() {
        let (session, _queue) = Session::new(1, 4);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let session = session.clone();
                tokio::spawn(async move { session.close() })
            })
            .collect();

        let mut closers = 0;
        for handle in handles {
            if handle.await.unwrap() {
                closers += 1;
            }
        }

        assert_eq!(closers, 1);
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_closed_future_resolves() {
        let (session, _queue) = Session::new(1, 4);
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.closed().await })
        };

        session.close();
        waiter.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_ping_tracking() {
        let (session, _queue) = Session::new(1, 4);

        tokio::time::advance(Duration::from_secs(45)).await;
        assert_eq!(session.idle_for(Instant::now()), Duration::from_secs(45));
        assert!(!session.is_alive(Duration::from_secs(30)));

        session.update_last_ping();
        assert!(session.is_alive(Duration::from_secs(30)));
        assert_eq!(session.idle_for(Instant::now()), Duration::ZERO);
    }

    #[test]
    fn test_attached_session_closes_through_closing() {
        let (session, _queue) = Session::new(1, 4);
        session.attach();

        session.close();
        assert_eq!(session.state(), SessionState::Closing);

        session.mark_terminated();
        assert_eq!(session.state(), SessionState::Closed);
    }
}
