use chrono::Utc;
use form_pulse_core::{ActiveUsers, ConnectionId, ServerEvent, SessionSummary};
use metrics::{counter, gauge, histogram};
use tracing::{debug, info, warn};

use super::FormGateway;
use crate::aggregator::MetricsAggregator;
use crate::error::HandlerError;
use crate::session::Session;

impl FormGateway {
    pub(super) async fn join_form(
        &self,
        connection_id: ConnectionId,
        form_type: String,
    ) -> Result<(), HandlerError> {
        let sender = self
            .sender(connection_id)
            .ok_or(HandlerError::UnknownConnection(connection_id))?;
        let opened = self
            .inner
            .sessions
            .open(connection_id, &form_type, Utc::now());
        let count = self.inner.active_users.add(&form_type, connection_id);
        self.inner
            .broadcaster
            .subscribe(&form_type, connection_id, sender);

        record_active_users(&form_type, count);
        info!(
            connection_id = %connection_id,
            form_type = %form_type,
            active_users = count,
            new_session = opened,
            "joined form"
        );
        self.inner.broadcaster.broadcast_active_users(&form_type);
        Ok(())
    }

    /// Leaving a form that was never joined changes nothing.
    pub(super) async fn leave_form(
        &self,
        connection_id: ConnectionId,
        form_type: String,
    ) -> Result<(), HandlerError> {
        let remaining = self.inner.active_users.remove(&form_type, connection_id);
        let session = self.inner.sessions.close(connection_id, &form_type);
        if remaining.is_none() && session.is_none() {
            debug!(connection_id = %connection_id, form_type = %form_type, "leave for unjoined form ignored");
            return Ok(());
        }
        if !self.is_watching(connection_id, &form_type) {
            self.inner.broadcaster.unsubscribe(&form_type, connection_id);
        }

        if let Some(count) = remaining {
            record_active_users(&form_type, count);
            self.inner.broadcaster.broadcast_active_users(&form_type);
        }
        info!(connection_id = %connection_id, form_type = %form_type, "left form");
        self.finalize_detached(session.into_iter().collect()).await;
        Ok(())
    }

    /// Subscribe to a form's room without counting as an active user.
    pub(super) fn watch_form(
        &self,
        connection_id: ConnectionId,
        form_type: String,
    ) -> Result<(), HandlerError> {
        let sender = {
            let mut entry = self
                .inner
                .connections
                .get_mut(&connection_id)
                .ok_or(HandlerError::UnknownConnection(connection_id))?;
            entry.watching.insert(form_type.clone());
            entry.sender.clone()
        };
        self.inner
            .broadcaster
            .subscribe(&form_type, connection_id, sender);
        debug!(connection_id = %connection_id, form_type = %form_type, "watching form");

        let count = self.inner.active_users.count(&form_type);
        self.notify(
            connection_id,
            ServerEvent::ActiveUsers(ActiveUsers { form_type, count }),
        );
        Ok(())
    }

    /// A connection that also joined the form keeps receiving broadcasts.
    pub(super) fn unwatch_form(
        &self,
        connection_id: ConnectionId,
        form_type: String,
    ) -> Result<(), HandlerError> {
        if let Some(mut entry) = self.inner.connections.get_mut(&connection_id) {
            entry.watching.remove(&form_type);
        }
        if !self.inner.active_users.contains(&form_type, connection_id) {
            self.inner.broadcaster.unsubscribe(&form_type, connection_id);
        }
        debug!(connection_id = %connection_id, form_type = %form_type, "stopped watching form");
        Ok(())
    }

    /// Tear down everything owned by a connection. Idempotent.
    pub async fn disconnect(&self, connection_id: ConnectionId) {
        let registered = self.inner.connections.remove(&connection_id).is_some();
        let forms = self.inner.active_users.remove_everywhere(connection_id);
        self.inner.broadcaster.unsubscribe_all(connection_id);
        let sessions = self.inner.sessions.close_all(connection_id);

        for form_type in &forms {
            record_active_users(form_type, self.inner.active_users.count(form_type));
            self.inner.broadcaster.broadcast_active_users(form_type);
        }
        if registered {
            self.log_connection_closed(connection_id, forms.len());
        }
        self.finalize_detached(sessions).await;
    }

    /// Persist closed sessions on a separate task so that dropping the
    /// caller cannot abandon a half-written summary.
    async fn finalize_detached(&self, sessions: Vec<Session>) {
        if sessions.is_empty() {
            return;
        }
        let aggregator = self.inner.aggregator.clone();
        let broadcaster = self.inner.broadcaster.clone();
        let task = tokio::spawn(async move {
            for session in sessions {
                finalize_session(&aggregator, &session).await;
                broadcaster
                    .broadcast_metrics_update(&session.form_type)
                    .await;
            }
        });
        if let Err(err) = task.await {
            warn!(error = %err, "session finalization task failed");
        }
    }
}

/// Summarize a closed session and write it to the store. Store failures are
/// logged per step; the summary is not retried as a whole.
async fn finalize_session(
    aggregator: &MetricsAggregator,
    session: &Session,
) -> SessionSummary {
    let total_fields = aggregator.total_fields(&session.form_type).await;
    let summary = session.finalize(Utc::now(), total_fields);
    let failures = aggregator
        .record_session(&summary, &session.transitions())
        .await;

    histogram!(
        "form_pulse_session_duration_ms",
        summary.duration_ms as f64,
        "form_type" => summary.form_type.clone()
    );
    if failures.is_empty() {
        info!(
            connection_id = %summary.connection_id,
            form_type = %summary.form_type,
            duration_ms = summary.duration_ms,
            interactions = summary.interaction_count,
            completion_rate = summary.completion_rate,
            "session finalized"
        );
    } else {
        counter!(
            "form_pulse_session_finalize_failures_total",
            failures.len() as u64
        );
        for err in &failures {
            warn!(
                connection_id = %summary.connection_id,
                form_type = %summary.form_type,
                error = %err,
                "session summary write failed"
            );
        }
    }
    summary
}

fn record_active_users(form_type: &str, count: usize) {
    gauge!(
        "form_pulse_active_users",
        count as f64,
        "form_type" => form_type.to_string()
    );
}
