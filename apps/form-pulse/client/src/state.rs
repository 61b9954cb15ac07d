use std::collections::VecDeque;

use form_pulse_core::{FormActivity, FormMetricsSnapshot, ServerEvent};
use serde_json::{Map, Value};
use tracing::warn;

/// Newest activity entries kept for display.
pub const ACTIVITY_FEED_CAP: usize = 10;

const TRANSITIONS_KEY: &str = "fieldTransitions";

/// Local view of one form's analytics, reconciled from pushed events and
/// one-shot fetches.
///
/// Every update is filtered by form type: events for any other form leave
/// the state untouched.
#[derive(Debug, Clone)]
pub struct AnalyticsState {
    form_type: String,
    metrics: Map<String, Value>,
    activity: VecDeque<FormActivity>,
    active_users: Option<usize>,
    last_error: Option<String>,
}

impl AnalyticsState {
    pub fn new(form_type: impl Into<String>) -> Self {
        Self {
            form_type: form_type.into(),
            metrics: Map::new(),
            activity: VecDeque::with_capacity(ACTIVITY_FEED_CAP),
            active_users: None,
            last_error: None,
        }
    }

    pub fn form_type(&self) -> &str {
        &self.form_type
    }

    /// Fold one pushed event into the state. Returns whether anything changed.
    pub fn apply(&mut self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::AnalyticsUpdate(update) if update.form_type == self.form_type => {
                self.merge_metrics(&update.metrics);
                true
            }
            ServerEvent::FormActivity(activity) if activity.form_type == self.form_type => {
                self.activity.push_front(activity.clone());
                self.activity.truncate(ACTIVITY_FEED_CAP);
                true
            }
            ServerEvent::ActiveUsers(users) if users.form_type == self.form_type => {
                self.active_users = Some(users.count);
                true
            }
            ServerEvent::Error(notice) => {
                self.last_error = Some(notice.message.clone());
                true
            }
            _ => false,
        }
    }

    /// Shallow merge: every top-level key present in `metrics` replaces the
    /// local value. Transitions are left out of the wire form when empty, so
    /// their absence clears the local copy.
    pub fn merge_metrics(&mut self, metrics: &FormMetricsSnapshot) {
        match serde_json::to_value(metrics) {
            Ok(Value::Object(incoming)) => {
                if !incoming.contains_key(TRANSITIONS_KEY) {
                    self.metrics.remove(TRANSITIONS_KEY);
                }
                self.metrics.extend(incoming);
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "failed to encode metrics for merge"),
        }
    }

    /// Merged metrics, or `None` before the first update arrives.
    pub fn metrics(&self) -> Option<FormMetricsSnapshot> {
        if self.metrics.is_empty() {
            return None;
        }
        serde_json::from_value(Value::Object(self.metrics.clone())).ok()
    }

    pub fn metrics_json(&self) -> &Map<String, Value> {
        &self.metrics
    }

    /// Newest first.
    pub fn activity(&self) -> impl Iterator<Item = &FormActivity> {
        self.activity.iter()
    }

    pub fn active_users(&self) -> Option<usize> {
        self.active_users
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use form_pulse_core::{ActiveUsers, AnalyticsUpdate};
    use std::collections::BTreeMap;

    fn update(form_type: &str, views: u64) -> ServerEvent {
        ServerEvent::AnalyticsUpdate(AnalyticsUpdate {
            form_type: form_type.to_string(),
            metrics: FormMetricsSnapshot {
                views,
                ..FormMetricsSnapshot::default()
            },
        })
    }

    fn activity(form_type: &str, n: u64) -> ServerEvent {
        ServerEvent::FormActivity(FormActivity {
            form_type: form_type.to_string(),
            activity_type: "form_completed".to_string(),
            data: serde_json::json!({ "completed": n }),
            timestamp: "2024-01-01T00:00:00Z".parse().unwrap(),
        })
    }

    #[test]
    fn updates_for_other_forms_are_ignored() {
        let mut state = AnalyticsState::new("intake");
        assert!(state.apply(&update("intake", 3)));
        let before = state.metrics_json().clone();

        assert!(!state.apply(&update("other_form", 99)));
        assert!(!state.apply(&activity("other_form", 1)));
        assert!(!state.apply(&ServerEvent::ActiveUsers(ActiveUsers {
            form_type: "other_form".into(),
            count: 7,
        })));

        assert_eq!(state.metrics_json(), &before);
        assert_eq!(state.metrics().unwrap().views, 3);
        assert_eq!(state.activity().count(), 0);
        assert_eq!(state.active_users(), None);
    }

    #[test]
    fn zero_snapshot_clears_every_metric() {
        let mut state = AnalyticsState::new("intake");
        state.merge_metrics(&FormMetricsSnapshot {
            views: 5,
            field_transitions: BTreeMap::from([("name:email".to_string(), 2)]),
            ..FormMetricsSnapshot::default()
        });
        assert_eq!(
            state.metrics().unwrap().field_transitions.get("name:email"),
            Some(&2)
        );

        state.merge_metrics(&FormMetricsSnapshot::default());
        assert!(!state.metrics_json().contains_key("fieldTransitions"));
        assert_eq!(state.metrics().unwrap(), FormMetricsSnapshot::default());
    }

    #[test]
    fn activity_feed_is_newest_first_and_capped() {
        let mut state = AnalyticsState::new("intake");
        for n in 0..15 {
            state.apply(&activity("intake", n));
        }
        let completed: Vec<u64> = state
            .activity()
            .map(|entry| entry.data["completed"].as_u64().unwrap())
            .collect();
        assert_eq!(completed, (5..15).rev().collect::<Vec<_>>());
    }

    #[test]
    fn errors_are_recorded() {
        let mut state = AnalyticsState::new("intake");
        assert!(state.metrics().is_none());
        state.apply(&ServerEvent::error("Failed to process form_view"));
        assert_eq!(state.last_error(), Some("Failed to process form_view"));
    }
}
