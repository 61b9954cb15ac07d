//! Shared primitives for the Form Pulse analytics service.
//!
//! The server, the subscription client and any tooling talk through the
//! message shapes defined here so that the wire format lives in one place.

mod protocol;
mod snapshot;

pub use protocol::{
    ActiveUsers, AnalyticsUpdate, ClientEvent, ErrorNotice, FieldInteraction, FormActivity,
    FormCompletion, FormRef, ServerEvent, ValidationError, FIELD_NAME_MAX_LEN,
    FORM_TYPE_MAX_LEN, validate_form_type,
};
pub use snapshot::{
    BehaviorEntry, CompletionRecord, FieldCountRequest, FormAnalyticsResponse,
    FormMetricsSnapshot, SessionSnapshot, SessionSummary, RECENT_BEHAVIOR_CAP,
    RECENT_SESSIONS_CAP,
};

/// Identifier assigned by the gateway to every accepted connection.
pub type ConnectionId = uuid::Uuid;
