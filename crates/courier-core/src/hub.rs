//! Process-level composition.
//!
//! The [`Hub`] owns the registry, the heartbeat monitor, the fanout bridge
//! and the shared cancellation signal. It is built once at startup, accepts
//! authenticated connections through [`Hub::serve_connection`] and tears
//! everything down in [`Hub::shutdown`].

use crate::bus::Bus;
use crate::connection;
use crate::directory::GroupDirectory;
use crate::fanout::{FanoutBridge, Topics};
use crate::handler::{EventHandler, LoggingHandler};
use crate::heartbeat::{HeartbeatConfig, HeartbeatMonitor};
use crate::registry::Registry;
use crate::session::{Session, SessionConfig};
use courier_protocol::UserId;
use courier_transport::{BoxedSink, BoxedSource};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Hub configuration.
#[derive(Debug, Clone, Default)]
pub struct HubConfig {
    pub session: SessionConfig,
    pub heartbeat: HeartbeatConfig,
    pub topics: Topics,
}

/// The presence and delivery core of one backend instance.
pub struct Hub {
    config: HubConfig,
    registry: Arc<Registry>,
    bridge: Arc<FanoutBridge>,
    handler: Arc<dyn EventHandler>,
    cancel: CancellationToken,
    /// Stopped after the final sweep so offline notices still reach the bus.
    fanout_cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Hub {
    /// Create a hub. Background loops do not run until [`Hub::start`].
    #[must_use]
    pub fn new(
        config: HubConfig,
        bus: Arc<dyn Bus>,
        directory: Arc<dyn GroupDirectory>,
    ) -> Self {
        let registry = Arc::new(Registry::new());
        let bridge = Arc::new(FanoutBridge::new(
            registry.clone(),
            bus,
            directory,
            config.topics.clone(),
        ));

        Self {
            config,
            registry,
            bridge,
            handler: Arc::new(LoggingHandler),
            cancel: CancellationToken::new(),
            fanout_cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Replace the inbound event handler.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler = handler;
        self
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    #[must_use]
    pub fn bridge(&self) -> &Arc<FanoutBridge> {
        &self.bridge
    }

    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Spawn the heartbeat monitor and the fanout bridge.
    pub fn start(&self) {
        let monitor = HeartbeatMonitor::new(self.registry.clone(), self.config.heartbeat.clone());
        let heartbeat = tokio::spawn(monitor.run(self.cancel.child_token()));

        let bridge = self.bridge.clone();
        let cancel = self.fanout_cancel.clone();
        let fanout = tokio::spawn(async move {
            if let Err(e) = bridge.run(cancel).await {
                error!(error = %e, "Fanout bridge exited");
            }
        });

        self.tasks.lock().extend([heartbeat, fanout]);
        info!("Hub started");
    }

    /// Serve an authenticated connection for `user_id`.
    ///
    /// Registers a new session, replacing any existing one for the user, and
    /// returns once the connection has ended and the session is closed.
    pub async fn serve_connection(&self, user_id: UserId, sink: BoxedSink, source: BoxedSource) {
        if self.cancel.is_cancelled() {
            warn!(user_id, "Hub shutting down, rejecting connection");
            return;
        }

        let (session, queue) = Session::new(user_id, self.config.session.outbound_capacity);
        self.registry.register(session.clone());

        // Lost the race with shutdown's sweep
        if self.cancel.is_cancelled() {
            self.registry.unregister(&session);
            session.close();
        }

        connection::run(
            session,
            queue,
            sink,
            source,
            self.registry.clone(),
            self.handler.clone(),
            self.config.session.clone(),
        )
        .await;
    }

    /// Stop background loops and close every session.
    ///
    /// Returns the number of sessions closed.
    pub async fn shutdown(&self) -> usize {
        self.cancel.cancel();
        let closed = self.registry.shutdown();
        self.fanout_cancel.cancel();

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task failed");
            }
        }

        info!(closed, "Hub shut down");
        closed
    }
}
