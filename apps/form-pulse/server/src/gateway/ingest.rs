use chrono::Utc;
use form_pulse_core::{CompletionRecord, ConnectionId, FieldInteraction, FormCompletion, FormRef};
use metrics::histogram;
use serde_json::json;
use tracing::debug;

use super::FormGateway;
use crate::error::HandlerError;

impl FormGateway {
    pub(super) async fn record_form_view(
        &self,
        connection_id: ConnectionId,
        payload: FormRef,
    ) -> Result<(), HandlerError> {
        let views = self
            .inner
            .aggregator
            .record_view(&payload.form_type, Some(connection_id))
            .await?;
        debug!(connection_id = %connection_id, form_type = %payload.form_type, views, "form viewed");
        self.inner
            .broadcaster
            .broadcast_metrics_update(&payload.form_type)
            .await;
        Ok(())
    }

    pub(super) async fn record_form_start(
        &self,
        connection_id: ConnectionId,
        payload: FormRef,
    ) -> Result<(), HandlerError> {
        let starts = self
            .inner
            .aggregator
            .record_start(&payload.form_type, Some(connection_id))
            .await?;
        debug!(connection_id = %connection_id, form_type = %payload.form_type, starts, "form started");
        self.inner
            .broadcaster
            .broadcast_metrics_update(&payload.form_type)
            .await;
        Ok(())
    }

    /// The session is updated before the store write and is not rolled back
    /// if that write fails.
    pub(super) async fn record_field_interaction(
        &self,
        connection_id: ConnectionId,
        payload: FieldInteraction,
    ) -> Result<(), HandlerError> {
        let value_length = payload.value_length();
        let tracked = self
            .inner
            .sessions
            .with_session_mut(connection_id, &payload.form_type, |session| {
                session.record_interaction(
                    &payload.field_name,
                    payload.is_valid,
                    value_length,
                    Utc::now(),
                )
            })
            .is_some();
        if let Some(duration) = payload.duration {
            histogram!(
                "form_pulse_field_duration_ms",
                duration,
                "form_type" => payload.form_type.clone()
            );
        }

        self.inner
            .aggregator
            .record_field_interaction(&payload.form_type, &payload.field_name, payload.is_valid)
            .await?;
        debug!(
            connection_id = %connection_id,
            form_type = %payload.form_type,
            field = %payload.field_name,
            valid = payload.is_valid,
            tracked,
            "field interaction recorded"
        );
        self.inner
            .broadcaster
            .broadcast_metrics_update(&payload.form_type)
            .await;
        Ok(())
    }

    /// Submitted form data is stored with the completion but never broadcast.
    pub(super) async fn record_form_completion(
        &self,
        connection_id: ConnectionId,
        payload: FormCompletion,
    ) -> Result<(), HandlerError> {
        let FormCompletion {
            form_type,
            completion_time,
            form_data,
        } = payload;
        let record = CompletionRecord {
            timestamp: Utc::now(),
            completion_time_ms: completion_time.round() as u64,
            form_data,
            session_snapshot: self.inner.sessions.snapshot(connection_id, &form_type),
        };
        let outcome = self
            .inner
            .aggregator
            .record_completion(&form_type, Some(connection_id), &record)
            .await?;
        debug!(
            connection_id = %connection_id,
            form_type = %form_type,
            completed = outcome.completed,
            average_ms = outcome.average_completion_time_ms,
            "form completed"
        );

        self.inner
            .broadcaster
            .broadcast_metrics_update(&form_type)
            .await;
        self.inner.broadcaster.broadcast_activity(
            &form_type,
            "form_completed",
            json!({
                "connectionId": connection_id,
                "completionTime": record.completion_time_ms,
                "completed": outcome.completed,
                "averageCompletionTime": outcome.average_completion_time_ms,
            }),
        );
        Ok(())
    }
}
