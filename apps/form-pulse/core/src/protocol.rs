use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::snapshot::FormMetricsSnapshot;

pub const FORM_TYPE_MAX_LEN: usize = 128;
pub const FIELD_NAME_MAX_LEN: usize = 256;

/// Messages sent from a browser (or dashboard) to the gateway.
///
/// Frames are adjacently tagged: `{"event": "form_view", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Start tracking a session for the form and join its room.
    JoinForm(String),
    /// Finalize the session for the form and leave its room.
    LeaveForm(String),
    /// Receive broadcasts for the form without counting as an active user.
    WatchForm(String),
    UnwatchForm(String),
    FormView(FormRef),
    FormStart(FormRef),
    FieldInteraction(FieldInteraction),
    FormCompletion(FormCompletion),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormRef {
    pub form_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldInteraction {
    pub form_type: String,
    pub field_name: String,
    pub is_valid: bool,
    /// Raw field value. Only its length is ever retained.
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

impl FieldInteraction {
    /// Length of the submitted value, or `None` when nothing was submitted.
    pub fn value_length(&self) -> Option<usize> {
        match &self.value {
            Value::Null => None,
            Value::String(s) => Some(s.chars().count()),
            Value::Array(items) => Some(items.len()),
            Value::Object(map) => Some(map.len()),
            Value::Bool(b) => Some(b.to_string().len()),
            Value::Number(n) => Some(n.to_string().len()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormCompletion {
    pub form_type: String,
    /// Milliseconds the user needed to complete the form.
    pub completion_time: f64,
    #[serde(default)]
    pub form_data: Map<String, Value>,
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("invalid message format: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("formType must not be empty")]
    EmptyFormType,
    #[error("formType exceeds 128 characters")]
    FormTypeTooLong,
    #[error("formType contains whitespace or control characters")]
    InvalidFormType,
    #[error("fieldName must not be empty")]
    EmptyFieldName,
    #[error("fieldName exceeds 256 characters")]
    FieldNameTooLong,
    #[error("fieldName must not contain ':'")]
    InvalidFieldName,
    #[error("completionTime must be a finite, non-negative number")]
    InvalidCompletionTime,
    #[error("duration must be a finite, non-negative number")]
    InvalidDuration,
}

impl ValidationError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            ValidationError::Malformed(_) => "malformed",
            ValidationError::EmptyFormType
            | ValidationError::FormTypeTooLong
            | ValidationError::InvalidFormType => "form_type",
            ValidationError::EmptyFieldName
            | ValidationError::FieldNameTooLong
            | ValidationError::InvalidFieldName => "field_name",
            ValidationError::InvalidCompletionTime => "completion_time",
            ValidationError::InvalidDuration => "duration",
        }
    }
}

impl ClientEvent {
    /// Decode and validate a text frame. Nothing is returned unless every
    /// payload rule holds.
    pub fn parse(text: &str) -> Result<Self, ValidationError> {
        let event: ClientEvent = serde_json::from_str(text)?;
        event.validate()?;
        Ok(event)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_form_type(self.form_type())?;
        match self {
            ClientEvent::FieldInteraction(payload) => {
                validate_field_name(&payload.field_name)?;
                if let Some(duration) = payload.duration {
                    if !duration.is_finite() || duration < 0.0 {
                        return Err(ValidationError::InvalidDuration);
                    }
                }
            }
            ClientEvent::FormCompletion(payload) => {
                if !payload.completion_time.is_finite() || payload.completion_time < 0.0 {
                    return Err(ValidationError::InvalidCompletionTime);
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub fn form_type(&self) -> &str {
        match self {
            ClientEvent::JoinForm(form_type)
            | ClientEvent::LeaveForm(form_type)
            | ClientEvent::WatchForm(form_type)
            | ClientEvent::UnwatchForm(form_type) => form_type,
            ClientEvent::FormView(payload) | ClientEvent::FormStart(payload) => {
                &payload.form_type
            }
            ClientEvent::FieldInteraction(payload) => &payload.form_type,
            ClientEvent::FormCompletion(payload) => &payload.form_type,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinForm(_) => "join_form",
            ClientEvent::LeaveForm(_) => "leave_form",
            ClientEvent::WatchForm(_) => "watch_form",
            ClientEvent::UnwatchForm(_) => "unwatch_form",
            ClientEvent::FormView(_) => "form_view",
            ClientEvent::FormStart(_) => "form_start",
            ClientEvent::FieldInteraction(_) => "field_interaction",
            ClientEvent::FormCompletion(_) => "form_completion",
        }
    }
}

/// Rules shared by every event and the HTTP routes keyed by form type.
pub fn validate_form_type(form_type: &str) -> Result<(), ValidationError> {
    if form_type.is_empty() {
        return Err(ValidationError::EmptyFormType);
    }
    if form_type.chars().count() > FORM_TYPE_MAX_LEN {
        return Err(ValidationError::FormTypeTooLong);
    }
    if form_type
        .chars()
        .any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(ValidationError::InvalidFormType);
    }
    Ok(())
}

fn validate_field_name(field_name: &str) -> Result<(), ValidationError> {
    if field_name.trim().is_empty() {
        return Err(ValidationError::EmptyFieldName);
    }
    if field_name.chars().count() > FIELD_NAME_MAX_LEN {
        return Err(ValidationError::FieldNameTooLong);
    }
    // ':' separates the two halves of a transition key.
    if field_name.contains(':') {
        return Err(ValidationError::InvalidFieldName);
    }
    Ok(())
}

/// Messages pushed from the gateway to connected clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    AnalyticsUpdate(AnalyticsUpdate),
    FormActivity(FormActivity),
    ActiveUsers(ActiveUsers),
    Error(ErrorNotice),
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error(ErrorNotice {
            message: message.into(),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::AnalyticsUpdate(_) => "analytics_update",
            ServerEvent::FormActivity(_) => "form_activity",
            ServerEvent::ActiveUsers(_) => "active_users",
            ServerEvent::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsUpdate {
    pub form_type: String,
    pub metrics: FormMetricsSnapshot,
}

/// A single non-aggregated event for live activity feeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormActivity {
    pub form_type: String,
    pub activity_type: String,
    #[serde(default)]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveUsers {
    pub form_type: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub message: String,
}
