use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use form_pulse_core::{ConnectionId, SessionSnapshot, SessionSummary};

/// One entry in a session's interaction log. The submitted value itself is
/// never kept, only its length.
#[derive(Debug, Clone, PartialEq)]
pub struct InteractionRecord {
    pub field_name: String,
    pub timestamp: DateTime<Utc>,
    pub is_valid: bool,
    pub value_length: Option<usize>,
}

/// Ephemeral state for one connection working through one form.
#[derive(Debug, Clone)]
pub struct Session {
    pub connection_id: ConnectionId,
    pub form_type: String,
    pub start_time: DateTime<Utc>,
    pub interactions: Vec<InteractionRecord>,
    pub completed_fields: BTreeSet<String>,
    pub last_activity: DateTime<Utc>,
}

impl Session {
    pub fn new(connection_id: ConnectionId, form_type: String, now: DateTime<Utc>) -> Self {
        Self {
            connection_id,
            form_type,
            start_time: now,
            interactions: Vec::new(),
            completed_fields: BTreeSet::new(),
            last_activity: now,
        }
    }

    pub fn record_interaction(
        &mut self,
        field_name: &str,
        is_valid: bool,
        value_length: Option<usize>,
        now: DateTime<Utc>,
    ) {
        self.interactions.push(InteractionRecord {
            field_name: field_name.to_string(),
            timestamp: now,
            is_valid,
            value_length,
        });
        if is_valid {
            self.completed_fields.insert(field_name.to_string());
        }
        self.last_activity = now;
    }

    /// Consecutive `(from, to)` field pairs in interaction order.
    pub fn transitions(&self) -> Vec<(String, String)> {
        self.interactions
            .windows(2)
            .map(|pair| (pair[0].field_name.clone(), pair[1].field_name.clone()))
            .collect()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            connection_id: self.connection_id,
            start_time: self.start_time,
            last_activity: self.last_activity,
            interaction_count: self.interactions.len(),
            completed_fields: self.completed_fields.iter().cloned().collect(),
        }
    }

    pub fn finalize(&self, now: DateTime<Utc>, total_fields: u64) -> SessionSummary {
        let duration_ms = now
            .signed_duration_since(self.start_time)
            .num_milliseconds()
            .max(0) as u64;
        SessionSummary {
            connection_id: self.connection_id,
            form_type: self.form_type.clone(),
            start_time: self.start_time,
            end_time: now,
            duration_ms,
            interaction_count: self.interactions.len(),
            completed_fields: self.completed_fields.iter().cloned().collect(),
            total_fields,
            completion_rate: completion_rate(self.completed_fields.len(), total_fields),
        }
    }
}

/// `completed / total` clamped to `[0, 1]`; an unknown total yields `0`.
pub fn completion_rate(completed: usize, total_fields: u64) -> f64 {
    if total_fields == 0 {
        return 0.0;
    }
    (completed as f64 / total_fields as f64).clamp(0.0, 1.0)
}

/// Arena of live sessions indexed by connection. Each connection only ever
/// touches its own slot, so entries are never contended across connections.
#[derive(Clone, Default)]
pub struct SessionStore {
    sessions: Arc<DashMap<ConnectionId, HashMap<String, Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session unless one is already live for this form. Returns
    /// whether a new session was created.
    pub fn open(&self, connection_id: ConnectionId, form_type: &str, now: DateTime<Utc>) -> bool {
        let mut slot = self.sessions.entry(connection_id).or_default();
        if slot.contains_key(form_type) {
            return false;
        }
        slot.insert(
            form_type.to_string(),
            Session::new(connection_id, form_type.to_string(), now),
        );
        true
    }

    pub fn with_session_mut<R>(
        &self,
        connection_id: ConnectionId,
        form_type: &str,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Option<R> {
        let mut slot = self.sessions.get_mut(&connection_id)?;
        slot.get_mut(form_type).map(f)
    }

    pub fn snapshot(&self, connection_id: ConnectionId, form_type: &str) -> Option<SessionSnapshot> {
        let slot = self.sessions.get(&connection_id)?;
        slot.get(form_type).map(Session::snapshot)
    }

    pub fn close(&self, connection_id: ConnectionId, form_type: &str) -> Option<Session> {
        let mut remove_slot = false;
        let session = self.sessions.get_mut(&connection_id).and_then(|mut slot| {
            let session = slot.remove(form_type);
            remove_slot = slot.is_empty();
            session
        });
        if remove_slot {
            self.sessions
                .remove_if(&connection_id, |_, slot| slot.is_empty());
        }
        session
    }

    pub fn close_all(&self, connection_id: ConnectionId) -> Vec<Session> {
        self.sessions
            .remove(&connection_id)
            .map(|(_, slot)| slot.into_values().collect())
            .unwrap_or_default()
    }

    /// Number of live sessions across all connections.
    pub fn len(&self) -> usize {
        self.sessions.iter().map(|slot| slot.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    #[test]
    fn valid_interactions_mark_fields_completed() {
        let now = Utc::now();
        let mut session = Session::new(Uuid::new_v4(), "intake".into(), now);
        session.record_interaction("email", false, Some(3), now);
        assert!(session.completed_fields.is_empty());
        session.record_interaction("email", true, Some(12), now);
        session.record_interaction("name", true, None, now);
        assert_eq!(session.interactions.len(), 3);
        assert!(session.completed_fields.contains("email"));
        assert!(session
            .completed_fields
            .iter()
            .all(|field| session.interactions.iter().any(|i| &i.field_name == field)));
    }

    #[test]
    fn transitions_follow_interaction_order() {
        let now = Utc::now();
        let mut session = Session::new(Uuid::new_v4(), "intake".into(), now);
        assert!(session.transitions().is_empty());
        for field in ["name", "email", "email", "phone"] {
            session.record_interaction(field, true, None, now);
        }
        assert_eq!(
            session.transitions(),
            vec![
                ("name".to_string(), "email".to_string()),
                ("email".to_string(), "email".to_string()),
                ("email".to_string(), "phone".to_string()),
            ]
        );
    }

    #[test]
    fn finalize_guards_unknown_field_count() {
        let start = Utc::now();
        let mut session = Session::new(Uuid::new_v4(), "intake".into(), start);
        session.record_interaction("email", true, Some(5), start);
        let summary = session.finalize(start + Duration::milliseconds(2500), 0);
        assert_eq!(summary.duration_ms, 2500);
        assert_eq!(summary.completion_rate, 0.0);
        assert_eq!(summary.completed_fields, vec!["email".to_string()]);
    }

    #[test]
    fn completion_rate_is_clamped() {
        assert_eq!(completion_rate(3, 0), 0.0);
        assert_eq!(completion_rate(1, 4), 0.25);
        assert_eq!(completion_rate(9, 4), 1.0);
    }

    #[test]
    fn store_keeps_one_session_per_form() {
        let store = SessionStore::new();
        let conn = Uuid::new_v4();
        let now = Utc::now();
        assert!(store.open(conn, "intake", now));
        store.with_session_mut(conn, "intake", |s| s.record_interaction("email", true, None, now));
        assert!(!store.open(conn, "intake", now));
        assert_eq!(
            store.snapshot(conn, "intake").map(|s| s.interaction_count),
            Some(1)
        );
        assert!(store.open(conn, "other", now));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn close_removes_sessions() {
        let store = SessionStore::new();
        let conn = Uuid::new_v4();
        let now = Utc::now();
        store.open(conn, "intake", now);
        store.open(conn, "other", now);
        assert!(store.close(conn, "missing").is_none());
        assert!(store.close(conn, "intake").is_some());
        assert!(store.close(conn, "intake").is_none());
        assert_eq!(store.close_all(conn).len(), 1);
        assert!(store.is_empty());
        assert!(store.close_all(conn).is_empty());
    }
}
