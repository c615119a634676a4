//! Application-level liveness sweep.
//!
//! The monitor is a coarse second line of defense behind the per-session
//! read deadline: it evicts sessions whose last liveness acknowledgment is
//! older than the dead threshold, even if the transport is still open.

use crate::registry::Registry;
use crate::session::Session;
use crate::telemetry;
use courier_protocol::UserId;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Heartbeat monitor configuration.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// Sessions idle for longer than this are evicted.
    pub dead_threshold: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            dead_threshold: Duration::from_secs(90),
        }
    }
}

/// Periodic sweep over the registry.
pub struct HeartbeatMonitor {
    registry: Arc<Registry>,
    config: HeartbeatConfig,
}

impl HeartbeatMonitor {
    /// Create a monitor for `registry`.
    #[must_use]
    pub fn new(registry: Arc<Registry>, config: HeartbeatConfig) -> Self {
        Self { registry, config }
    }

    /// Run one sweep, evicting dead sessions.
    ///
    /// Returns the users whose sessions were evicted.
    pub fn sweep(&self) -> Vec<UserId> {
        let now = Instant::now();
        let mut evicted = Vec::new();

        for session in self.registry.sessions() {
            let idle = session.idle_for(now);
            if idle <= self.config.dead_threshold {
                continue;
            }

            if self.evict(&session, idle) {
                evicted.push(session.user_id());
            }
        }

        if !evicted.is_empty() {
            debug!(count = evicted.len(), "Heartbeat sweep evicted sessions");
        }
        evicted
    }

    /// Close a dead session, counting it only if it was still registered.
    ///
    /// A session replaced between the snapshot and this call is closed
    /// already and is not an eviction.
    fn evict(&self, session: &Session, idle: Duration) -> bool {
        let removed = self.registry.unregister(session);
        session.close();
        if !removed {
            debug!(
                user_id = session.user_id(),
                session = %session.id(),
                "Dead session already replaced"
            );
            return false;
        }

        warn!(
            user_id = session.user_id(),
            session = %session.id(),
            idle_secs = idle.as_secs(),
            "Dead connection evicted"
        );
        metrics::counter!(telemetry::names::HEARTBEAT_EVICTIONS_TOTAL).increment(1);
        true
    }

    /// Sweep on every interval until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.config.interval, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = self.config.interval.as_secs(),
            dead_threshold_secs = self.config.dead_threshold.as_secs(),
            "Heartbeat monitor started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep();
                }
            }
        }

        info!("Heartbeat monitor stopped");
    }
}
