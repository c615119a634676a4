//! Per-connection read and write flows.
//!
//! Each attached session runs two concurrent flows. The read flow owns the
//! inbound half of the transport and the read deadline; the write flow owns
//! the outbound half, drains the session queue and emits liveness probes.
//! Whichever flow ends first closes the session, which ends the other.

use crate::handler::EventHandler;
use crate::registry::Registry;
use crate::session::{OutboundQueue, Session, SessionConfig};
use crate::telemetry;
use courier_protocol::{codec, Event, EventKind};
use courier_transport::{BoxedSink, BoxedSource, Inbound};
use serde_json::Value;
use std::sync::Arc;
use tokio::time::{interval_at, timeout, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Drive a registered session until its connection ends.
///
/// On return the session is closed, no longer registered and both flows
/// have finished.
pub(crate) async fn run(
    session: Arc<Session>,
    queue: OutboundQueue,
    sink: BoxedSink,
    source: BoxedSource,
    registry: Arc<Registry>,
    handler: Arc<dyn EventHandler>,
    config: SessionConfig,
) {
    session.attach();
    debug!(user_id = session.user_id(), session = %session.id(), "Connection flows started");

    let writer = tokio::spawn(write_flow(
        session.clone(),
        queue,
        sink,
        registry.clone(),
        config.clone(),
    ));

    read_flow(&session, source, &registry, handler.as_ref(), &config).await;

    if let Err(e) = writer.await {
        warn!(session = %session.id(), error = %e, "Write flow panicked");
        registry.unregister(&session);
    }

    session.mark_terminated();
    debug!(user_id = session.user_id(), session = %session.id(), "Connection flows finished");
}

async fn read_flow(
    session: &Session,
    mut source: BoxedSource,
    registry: &Registry,
    handler: &dyn EventHandler,
    config: &SessionConfig,
) {
    let mut deadline = Instant::now() + config.pong_wait;

    loop {
        let frame = tokio::select! {
            _ = session.closed() => break,
            received = timeout_at(deadline, source.recv()) => match received {
                Ok(Ok(Some(frame))) => frame,
                Ok(Ok(None)) => {
                    debug!(user_id = session.user_id(), "Connection closed by peer");
                    break;
                }
                Ok(Err(e)) => {
                    debug!(user_id = session.user_id(), error = %e, "Read failed");
                    break;
                }
                Err(_) => {
                    warn!(
                        user_id = session.user_id(),
                        session = %session.id(),
                        "Read deadline exceeded"
                    );
                    break;
                }
            },
        };

        let acknowledged = match frame {
            Inbound::Pong(_) => {
                session.update_last_ping();
                true
            }
            // axum and tungstenite queue the pong reply on their own
            Inbound::Ping(_) => false,
            Inbound::Close => {
                debug!(user_id = session.user_id(), "Close frame received");
                break;
            }
            Inbound::Text(text) => dispatch(session, text.as_bytes(), handler, config).await,
            Inbound::Binary(data) => dispatch(session, &data, handler, config).await,
        };

        if acknowledged {
            deadline = Instant::now() + config.pong_wait;
        }
    }

    registry.unregister(session);
    session.close();
}

/// Handle one application frame. Returns `true` for a liveness event.
async fn dispatch(
    session: &Session,
    data: &[u8],
    handler: &dyn EventHandler,
    config: &SessionConfig,
) -> bool {
    let event = match codec::decode_limited(data, config.max_message_size)
        .and_then(|envelope| Event::from_envelope(&envelope))
    {
        Ok(event) => event,
        Err(e) => {
            metrics::counter!(telemetry::names::INBOUND_DISCARDED_TOTAL).increment(1);
            warn!(user_id = session.user_id(), error = %e, "Discarding malformed frame");
            return false;
        }
    };

    match event {
        Event::Ping => {
            session.update_last_ping();
            session.send_message(EventKind::Pong, Value::Null);
            true
        }
        Event::Pong => {
            session.update_last_ping();
            true
        }
        event => {
            handler.handle(session, event).await;
            false
        }
    }
}

async fn write_flow(
    session: Arc<Session>,
    mut queue: OutboundQueue,
    mut sink: BoxedSink,
    registry: Arc<Registry>,
    config: SessionConfig,
) {
    let mut ticker = interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            frame = queue.recv() => {
                // Queue ends once the session is closed and drained
                let Some(frame) = frame else { break };
                match timeout(config.write_wait, sink.send_text(frame)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(user_id = session.user_id(), error = %e, "Write failed");
                        break;
                    }
                    Err(_) => {
                        warn!(
                            user_id = session.user_id(),
                            session = %session.id(),
                            "Write deadline exceeded"
                        );
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                match timeout(config.write_wait, sink.send_ping()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(user_id = session.user_id(), error = %e, "Ping failed");
                        break;
                    }
                    Err(_) => {
                        warn!(
                            user_id = session.user_id(),
                            session = %session.id(),
                            "Ping deadline exceeded"
                        );
                        break;
                    }
                }
            }
        }
    }

    if let Ok(Err(e)) = timeout(config.write_wait, sink.close()).await {
        debug!(user_id = session.user_id(), error = %e, "Close failed");
    }

    registry.unregister(&session);
    session.close();
}
