//! Application hook for inbound client events.
//!
//! Liveness events (`ping`/`pong`) are consumed by the read flow itself;
//! everything else a client sends is handed to an [`EventHandler`].

use async_trait::async_trait;
use courier_protocol::Event;
use tracing::{info, warn};

use crate::session::Session;

/// Receives decoded application events from clients.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, session: &Session, event: Event);
}

/// Default handler: messages are sent through the HTTP API, so inbound
/// chat events are only logged.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

#[async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, session: &Session, event: Event) {
        match event {
            Event::Other { event, .. } => {
                warn!(user_id = session.user_id(), event = %event, "Unknown event type");
            }
            known => {
                info!(user_id = session.user_id(), event = %known.kind(), "Received client event");
            }
        }
    }
}
