use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub const RECENT_SESSIONS_CAP: usize = 10;
pub const RECENT_BEHAVIOR_CAP: usize = 50;

/// Durable aggregate view of every recorded interaction for one form type.
///
/// A store that cannot be read yields `FormMetricsSnapshot::default()`, which
/// serializes to all-zero counters and empty collections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FormMetricsSnapshot {
    pub views: u64,
    pub starts: u64,
    pub completed: u64,
    #[serde(rename = "averageCompletionTime")]
    pub average_completion_time_ms: u64,
    #[serde(rename = "averageSessionDuration")]
    pub average_session_duration_ms: u64,
    pub field_interactions: BTreeMap<String, u64>,
    pub field_errors: BTreeMap<String, u64>,
    /// Keyed `"from:to"`.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub field_transitions: BTreeMap<String, u64>,
    /// Newest first, at most [`RECENT_SESSIONS_CAP`] entries.
    pub recent_sessions: Vec<SessionSummary>,
    /// Newest first, at most [`RECENT_BEHAVIOR_CAP`] entries.
    pub recent_behavior: Vec<BehaviorEntry>,
}

/// Finalized record of a session, written when the connection leaves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub connection_id: Uuid,
    pub form_type: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub interaction_count: usize,
    pub completed_fields: Vec<String>,
    pub total_fields: u64,
    pub completion_rate: f64,
}

/// In-flight view of a session attached to completion records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub connection_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub interaction_count: usize,
    pub completed_fields: Vec<String>,
}

/// Lightweight behavior-log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BehaviorEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub form_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRecord {
    pub timestamp: DateTime<Utc>,
    pub completion_time_ms: u64,
    pub form_data: Map<String, Value>,
    #[serde(default)]
    pub session_snapshot: Option<SessionSnapshot>,
}

/// Body of the one-shot analytics fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormAnalyticsResponse {
    pub form_type: String,
    pub metrics: FormMetricsSnapshot,
    #[serde(default)]
    pub field_completion_rates: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldCountRequest {
    pub total_fields: u64,
}
