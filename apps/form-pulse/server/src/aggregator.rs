//! Durable cross-session metrics, keyed per form type.
//!
//! Counters use the store's atomic primitives. Running averages are a plain
//! read-then-write: two writers racing on the same form can leave a slightly
//! stale average behind, which is acceptable for this telemetry.
//!
//! Reads are fail-soft and degrade to zero values. Writes surface
//! [`AggregatorError`] once the retry budget is spent.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use form_pulse_core::{
    BehaviorEntry, CompletionRecord, ConnectionId, FormMetricsSnapshot, SessionSummary,
    RECENT_BEHAVIOR_CAP, RECENT_SESSIONS_CAP,
};
use metrics::counter;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::retry::{RetryExhausted, RetryPolicy};
use crate::store::{MetricsStore, StoreError, StoreResult};

#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("store write `{op}` failed after {attempts} attempt(s): {source}")]
    WriteFailed {
        op: &'static str,
        attempts: u32,
        source: StoreError,
    },
    #[error("failed to encode {what}: {source}")]
    Encode {
        what: &'static str,
        source: serde_json::Error,
    },
}

/// Result of recording a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionOutcome {
    pub completed: u64,
    pub average_completion_time_ms: u64,
}

#[derive(Clone)]
pub struct MetricsAggregator {
    store: Arc<dyn MetricsStore>,
    retry: RetryPolicy,
}

impl MetricsAggregator {
    pub fn new(store: Arc<dyn MetricsStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub async fn record_view(
        &self,
        form_type: &str,
        connection_id: Option<ConnectionId>,
    ) -> Result<u64, AggregatorError> {
        let views = self.incr("incr_views", &views_key(form_type)).await?;
        self.log_behavior(form_type, "form_view", connection_id, Value::Null)
            .await?;
        Ok(views)
    }

    pub async fn record_start(
        &self,
        form_type: &str,
        connection_id: Option<ConnectionId>,
    ) -> Result<u64, AggregatorError> {
        let starts = self.incr("incr_starts", &starts_key(form_type)).await?;
        self.log_behavior(form_type, "form_start", connection_id, Value::Null)
            .await?;
        Ok(starts)
    }

    pub async fn record_field_interaction(
        &self,
        form_type: &str,
        field_name: &str,
        is_valid: bool,
    ) -> Result<(), AggregatorError> {
        self.hincr(
            "hincr_field_interactions",
            &field_interactions_key(form_type),
            field_name,
        )
        .await?;
        if !is_valid {
            self.hincr("hincr_field_errors", &field_errors_key(form_type), field_name)
                .await?;
        }
        Ok(())
    }

    /// Append the completion, bump `completed`, then fold the completion time
    /// into the running mean using the incremented count as the weight.
    pub async fn record_completion(
        &self,
        form_type: &str,
        connection_id: Option<ConnectionId>,
        record: &CompletionRecord,
    ) -> Result<CompletionOutcome, AggregatorError> {
        let encoded = encode("completion record", record)?;
        let key = completions_key(form_type);
        self.write("push_completion", || self.store.push(&key, encoded.clone()))
            .await?;

        let completed = self.incr("incr_completed", &completed_key(form_type)).await?;
        let average_completion_time_ms = self
            .update_running_average(
                &avg_completion_key(form_type),
                completed,
                record.completion_time_ms,
            )
            .await?;

        self.log_behavior(
            form_type,
            "form_completion",
            connection_id,
            serde_json::json!({ "completionTimeMs": record.completion_time_ms }),
        )
        .await?;

        Ok(CompletionOutcome {
            completed,
            average_completion_time_ms,
        })
    }

    /// Persist a finalized session. Every step is attempted even when an
    /// earlier one fails; the failures are returned for logging.
    pub async fn record_session(
        &self,
        summary: &SessionSummary,
        transitions: &[(String, String)],
    ) -> Vec<AggregatorError> {
        let form_type = summary.form_type.as_str();
        let mut failures = Vec::new();

        match encode("session summary", summary) {
            Ok(encoded) => {
                let key = recent_sessions_key(form_type);
                if let Err(err) = self
                    .write("push_recent_session", || {
                        self.store
                            .push_capped(&key, encoded.clone(), RECENT_SESSIONS_CAP)
                    })
                    .await
                {
                    failures.push(err);
                }
            }
            Err(err) => failures.push(err),
        }

        let duration_result = async {
            let recorded = self
                .incr("incr_session_count", &session_count_key(form_type))
                .await?;
            self.update_running_average(
                &avg_session_duration_key(form_type),
                recorded,
                summary.duration_ms,
            )
            .await
        }
        .await;
        if let Err(err) = duration_result {
            failures.push(err);
        }

        let transitions_key = field_transitions_key(form_type);
        for (from, to) in transitions {
            let field = format!("{from}:{to}");
            if let Err(err) = self
                .hincr("hincr_field_transition", &transitions_key, &field)
                .await
            {
                failures.push(err);
            }
        }

        failures
    }

    /// Total number of fields on the form, `0` when unknown or unreadable.
    pub async fn total_fields(&self, form_type: &str) -> u64 {
        let key = total_fields_key(form_type);
        match self.read("get_total_fields", || self.store.get(&key)).await {
            Ok(raw) => parse_count(raw.as_deref()),
            Err(err) => {
                warn!(form_type, error = %err, "failed to read total field count; using 0");
                0
            }
        }
    }

    pub async fn set_total_fields(
        &self,
        form_type: &str,
        total_fields: u64,
    ) -> Result<(), AggregatorError> {
        let key = total_fields_key(form_type);
        let value = total_fields.to_string();
        self.write("set_total_fields", || self.store.set(&key, value.clone()))
            .await
    }

    /// Current snapshot for `form_type`. Never fails: if any read cannot be
    /// served the documented zero snapshot is returned instead.
    pub async fn snapshot(&self, form_type: &str) -> FormMetricsSnapshot {
        match self.try_snapshot(form_type).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                counter!("form_pulse_snapshot_fallbacks_total", 1);
                warn!(form_type, error = %err, "metrics read failed; serving zero snapshot");
                FormMetricsSnapshot::default()
            }
        }
    }

    pub async fn ping(&self) -> StoreResult<()> {
        self.store.ping().await
    }

    async fn try_snapshot(&self, form_type: &str) -> StoreResult<FormMetricsSnapshot> {
        let views = self.read_count(&views_key(form_type)).await?;
        let starts = self.read_count(&starts_key(form_type)).await?;
        let completed = self.read_count(&completed_key(form_type)).await?;
        let average_completion_time_ms =
            self.read_count(&avg_completion_key(form_type)).await?;
        let average_session_duration_ms =
            self.read_count(&avg_session_duration_key(form_type)).await?;
        let field_interactions = self
            .read_hash(&field_interactions_key(form_type))
            .await?;
        let field_errors = self.read_hash(&field_errors_key(form_type)).await?;
        let field_transitions = self.read_hash(&field_transitions_key(form_type)).await?;
        let recent_sessions = self
            .read_list::<SessionSummary>(&recent_sessions_key(form_type), RECENT_SESSIONS_CAP)
            .await?;
        let recent_behavior = self
            .read_list::<BehaviorEntry>(&behavior_key(form_type), RECENT_BEHAVIOR_CAP)
            .await?;

        Ok(FormMetricsSnapshot {
            views,
            starts,
            completed,
            average_completion_time_ms,
            average_session_duration_ms,
            field_interactions,
            field_errors,
            field_transitions,
            recent_sessions,
            recent_behavior,
        })
    }

    async fn read_count(&self, key: &str) -> StoreResult<u64> {
        let raw = self.read("get", || self.store.get(key)).await?;
        Ok(parse_count(raw.as_deref()))
    }

    async fn read_hash(&self, key: &str) -> StoreResult<BTreeMap<String, u64>> {
        let raw: HashMap<String, i64> = self.read("hgetall", || self.store.hgetall(key)).await?;
        Ok(raw
            .into_iter()
            .map(|(field, count)| (field, count.max(0) as u64))
            .collect())
    }

    async fn read_list<T: DeserializeOwned>(&self, key: &str, limit: usize) -> StoreResult<Vec<T>> {
        let raw = self
            .read("lrange", || self.store.lrange(key, limit))
            .await?;
        Ok(raw
            .iter()
            .filter_map(|entry| match serde_json::from_str(entry) {
                Ok(value) => Some(value),
                Err(err) => {
                    warn!(key, error = %err, "skipping undecodable list entry");
                    None
                }
            })
            .collect())
    }

    /// `round((current * (n - 1) + value) / n)`. The current average is part
    /// of the write: if it cannot be read the stored average is left alone and
    /// the operation fails.
    async fn update_running_average(
        &self,
        key: &str,
        count: u64,
        value: u64,
    ) -> Result<u64, AggregatorError> {
        let raw = self.write("get_average", || self.store.get(key)).await?;
        let current = parse_count(raw.as_deref());
        let next = running_average(current, count, value);
        let encoded = next.to_string();
        self.write("set_average", || self.store.set(key, encoded.clone()))
            .await?;
        Ok(next)
    }

    async fn log_behavior(
        &self,
        form_type: &str,
        kind: &str,
        connection_id: Option<ConnectionId>,
        details: Value,
    ) -> Result<(), AggregatorError> {
        let entry = BehaviorEntry {
            kind: kind.to_string(),
            form_type: form_type.to_string(),
            timestamp: Utc::now(),
            connection_id,
            details,
        };
        let encoded = encode("behavior entry", &entry)?;
        let key = behavior_key(form_type);
        self.write("push_behavior", || {
            self.store
                .push_capped(&key, encoded.clone(), RECENT_BEHAVIOR_CAP)
        })
        .await
    }

    async fn incr(&self, op: &'static str, key: &str) -> Result<u64, AggregatorError> {
        let value = self.write(op, || self.store.incr(key, 1)).await?;
        Ok(value.max(0) as u64)
    }

    async fn hincr(
        &self,
        op: &'static str,
        key: &str,
        field: &str,
    ) -> Result<i64, AggregatorError> {
        self.write(op, || self.store.hincr(key, field, 1)).await
    }

    async fn write<T, F, Fut>(&self, op: &'static str, call: F) -> Result<T, AggregatorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        self.retry.run(op, call).await.map_err(|exhausted| {
            let RetryExhausted { attempts, source } = exhausted;
            counter!("form_pulse_store_write_failures_total", 1, "op" => op);
            warn!(op, attempts, error = %source, "store write failed");
            AggregatorError::WriteFailed {
                op,
                attempts,
                source,
            }
        })
    }

    async fn read<T, F, Fut>(&self, op: &'static str, call: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        self.retry
            .run(op, call)
            .await
            .map_err(|exhausted| exhausted.source)
    }
}

/// Incremental mean where `count` already includes the new value.
pub fn running_average(current: u64, count: u64, value: u64) -> u64 {
    if count <= 1 {
        return value;
    }
    let n = count as f64;
    ((current as f64 * (n - 1.0) + value as f64) / n).round() as u64
}

/// Share of interactions on each field that were valid, clamped to `[0, 1]`.
pub fn field_completion_rates(snapshot: &FormMetricsSnapshot) -> BTreeMap<String, f64> {
    snapshot
        .field_interactions
        .iter()
        .filter(|(_, interactions)| **interactions > 0)
        .map(|(field, interactions)| {
            let errors = snapshot.field_errors.get(field).copied().unwrap_or(0);
            let valid = interactions.saturating_sub(errors) as f64;
            (field.clone(), (valid / *interactions as f64).clamp(0.0, 1.0))
        })
        .collect()
}

fn parse_count(raw: Option<&str>) -> u64 {
    raw.and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite() && *value > 0.0)
        .map(|value| value.round() as u64)
        .unwrap_or(0)
}

fn encode<T: Serialize>(what: &'static str, value: &T) -> Result<String, AggregatorError> {
    serde_json::to_string(value).map_err(|source| AggregatorError::Encode { what, source })
}

fn views_key(form_type: &str) -> String {
    format!("form:{}:views", form_type)
}

fn starts_key(form_type: &str) -> String {
    format!("form:{}:starts", form_type)
}

fn completed_key(form_type: &str) -> String {
    format!("form:{}:completed", form_type)
}

fn completions_key(form_type: &str) -> String {
    format!("form:{}:completions", form_type)
}

fn avg_completion_key(form_type: &str) -> String {
    format!("form:{}:avg_completion_time", form_type)
}

fn session_count_key(form_type: &str) -> String {
    format!("form:{}:session_count", form_type)
}

fn avg_session_duration_key(form_type: &str) -> String {
    format!("form:{}:avg_session_duration", form_type)
}

fn field_interactions_key(form_type: &str) -> String {
    format!("form:{}:field_interactions", form_type)
}

fn field_errors_key(form_type: &str) -> String {
    format!("form:{}:field_errors", form_type)
}

fn field_transitions_key(form_type: &str) -> String {
    format!("form:{}:field_transitions", form_type)
}

fn recent_sessions_key(form_type: &str) -> String {
    format!("form:{}:recent_sessions", form_type)
}

fn behavior_key(form_type: &str) -> String {
    format!("form:{}:behavior", form_type)
}

fn total_fields_key(form_type: &str) -> String {
    format!("form:{}:total_fields", form_type)
}
