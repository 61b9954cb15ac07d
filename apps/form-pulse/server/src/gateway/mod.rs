//! Transport-agnostic core of the WebSocket gateway.
//!
//! The gateway owns every piece of per-connection state: outbound queues,
//! sessions and active-user membership. Only read-only snapshots cross into
//! the metrics aggregator.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use form_pulse_core::{ClientEvent, ConnectionId, ServerEvent};
use futures_util::FutureExt;
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregator::MetricsAggregator;
use crate::broadcast::{Broadcaster, Outbound};
use crate::error::HandlerError;
use crate::presence::ActiveUserSet;
use crate::session::SessionStore;

mod ingest;
mod lifecycle;

const DEFAULT_OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Depth of each connection's outbound queue. Broadcasts to a full queue
    /// are dropped.
    pub outbound_buffer: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
        }
    }
}

/// Returned by [`FormGateway::connect`]; the receiver feeds the socket writer.
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub receiver: mpsc::Receiver<Outbound>,
}

struct ConnectionEntry {
    sender: mpsc::Sender<Outbound>,
    watching: HashSet<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStats {
    pub connections: usize,
    pub live_sessions: usize,
    pub rooms: Vec<RoomStats>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStats {
    pub form_type: String,
    pub subscribers: usize,
    pub active_users: usize,
}

#[derive(Clone)]
pub struct FormGateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    aggregator: MetricsAggregator,
    broadcaster: Broadcaster,
    sessions: SessionStore,
    active_users: ActiveUserSet,
    connections: DashMap<ConnectionId, ConnectionEntry>,
    config: GatewayConfig,
}

impl FormGateway {
    pub fn new(aggregator: MetricsAggregator, config: GatewayConfig) -> Self {
        let active_users = ActiveUserSet::new();
        let broadcaster = Broadcaster::new(aggregator.clone(), active_users.clone());
        Self {
            inner: Arc::new(GatewayInner {
                aggregator,
                broadcaster,
                sessions: SessionStore::new(),
                active_users,
                connections: DashMap::new(),
                config,
            }),
        }
    }

    pub fn aggregator(&self) -> &MetricsAggregator {
        &self.inner.aggregator
    }

    pub fn connect(&self) -> ConnectionHandle {
        let id = Uuid::new_v4();
        let (sender, receiver) = mpsc::channel(self.inner.config.outbound_buffer.max(1));
        self.inner.connections.insert(
            id,
            ConnectionEntry {
                sender,
                watching: HashSet::new(),
            },
        );
        counter!("form_pulse_connections_total", 1);
        gauge!(
            "form_pulse_connections_active",
            self.inner.connections.len() as f64
        );
        debug!(connection_id = %id, "connection registered");
        ConnectionHandle { id, receiver }
    }

    /// Decode one text frame and dispatch it. Invalid frames are dropped and
    /// reported to the sender.
    pub async fn handle_frame(&self, connection_id: ConnectionId, text: &str) {
        match ClientEvent::parse(text) {
            Ok(event) => self.dispatch(connection_id, event).await,
            Err(err) => {
                counter!(
                    "form_pulse_validation_failures_total",
                    1,
                    "reason" => err.metric_label()
                );
                warn!(connection_id = %connection_id, error = %err, "dropping invalid client event");
                self.notify(connection_id, ServerEvent::error(err.to_string()));
            }
        }
    }

    /// Binary frames carry the same JSON as text frames. Anything that is not
    /// UTF-8 is dropped and reported to the sender.
    pub async fn handle_binary_frame(&self, connection_id: ConnectionId, bytes: &[u8]) {
        match std::str::from_utf8(bytes) {
            Ok(text) => self.handle_frame(connection_id, text).await,
            Err(err) => {
                counter!(
                    "form_pulse_validation_failures_total",
                    1,
                    "reason" => "non_utf8"
                );
                warn!(connection_id = %connection_id, error = %err, "dropping non-utf8 binary frame");
                self.notify(
                    connection_id,
                    ServerEvent::error("binary frame is not valid UTF-8"),
                );
            }
        }
    }

    /// Run the handler for `event`, converting any failure (including a
    /// panic) into an `error` event for this connection alone.
    pub async fn dispatch(&self, connection_id: ConnectionId, event: ClientEvent) {
        let event_name = event.name();
        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.route(connection_id, event))
            .catch_unwind()
            .await;
        histogram!(
            "form_pulse_event_duration_ms",
            started.elapsed().as_secs_f64() * 1000.0,
            "event" => event_name
        );

        let message = match outcome {
            Ok(Ok(())) => {
                counter!(
                    "form_pulse_events_total",
                    1,
                    "event" => event_name,
                    "outcome" => "ok"
                );
                return;
            }
            Ok(Err(err)) => {
                counter!(
                    "form_pulse_events_total",
                    1,
                    "event" => event_name,
                    "outcome" => err.metric_label()
                );
                warn!(
                    connection_id = %connection_id,
                    event = event_name,
                    error = %err,
                    "event handler failed"
                );
                format!("Failed to process {event_name}: {err}")
            }
            Err(_) => {
                counter!(
                    "form_pulse_events_total",
                    1,
                    "event" => event_name,
                    "outcome" => "panic"
                );
                error!(
                    connection_id = %connection_id,
                    event = event_name,
                    "event handler panicked"
                );
                format!("Failed to process {event_name}: internal error")
            }
        };
        self.notify(connection_id, ServerEvent::error(message));
    }

    async fn route(
        &self,
        connection_id: ConnectionId,
        event: ClientEvent,
    ) -> Result<(), HandlerError> {
        match event {
            ClientEvent::JoinForm(form_type) => self.join_form(connection_id, form_type).await,
            ClientEvent::LeaveForm(form_type) => self.leave_form(connection_id, form_type).await,
            ClientEvent::WatchForm(form_type) => self.watch_form(connection_id, form_type),
            ClientEvent::UnwatchForm(form_type) => self.unwatch_form(connection_id, form_type),
            ClientEvent::FormView(payload) => self.record_form_view(connection_id, payload).await,
            ClientEvent::FormStart(payload) => {
                self.record_form_start(connection_id, payload).await
            }
            ClientEvent::FieldInteraction(payload) => {
                self.record_field_interaction(connection_id, payload).await
            }
            ClientEvent::FormCompletion(payload) => {
                self.record_form_completion(connection_id, payload).await
            }
        }
    }

    /// Queue an event for one connection. Returns `false` if it could not be
    /// queued.
    pub fn notify(&self, connection_id: ConnectionId, event: ServerEvent) -> bool {
        let Some(sender) = self.sender(connection_id) else {
            return false;
        };
        match sender.try_send(Arc::new(event)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(connection_id = %connection_id, "outbound queue full; notification dropped");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn active_users(&self, form_type: &str) -> usize {
        self.inner.active_users.count(form_type)
    }

    pub fn live_sessions(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn stats(&self) -> GatewayStats {
        let mut rooms: Vec<RoomStats> = self
            .inner
            .broadcaster
            .room_sizes()
            .into_iter()
            .map(|(form_type, subscribers)| RoomStats {
                active_users: self.inner.active_users.count(&form_type),
                form_type,
                subscribers,
            })
            .collect();
        rooms.sort_by(|a, b| a.form_type.cmp(&b.form_type));
        GatewayStats {
            connections: self.inner.connections.len(),
            live_sessions: self.inner.sessions.len(),
            rooms,
        }
    }

    fn sender(&self, connection_id: ConnectionId) -> Option<mpsc::Sender<Outbound>> {
        self.inner
            .connections
            .get(&connection_id)
            .map(|entry| entry.sender.clone())
    }

    fn is_watching(&self, connection_id: ConnectionId, form_type: &str) -> bool {
        self.inner
            .connections
            .get(&connection_id)
            .map(|entry| entry.watching.contains(form_type))
            .unwrap_or(false)
    }

    fn log_connection_closed(&self, connection_id: ConnectionId, forms: usize) {
        gauge!(
            "form_pulse_connections_active",
            self.inner.connections.len() as f64
        );
        info!(connection_id = %connection_id, forms, "connection closed");
    }
}
