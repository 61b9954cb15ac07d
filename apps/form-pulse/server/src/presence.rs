use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use form_pulse_core::ConnectionId;

/// Connected connection ids per form type. Derived state only; it is rebuilt
/// from scratch whenever the process restarts.
#[derive(Clone, Default)]
pub struct ActiveUserSet {
    forms: Arc<DashMap<String, HashSet<ConnectionId>>>,
}

impl ActiveUserSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the connection, returning the new count for the form.
    pub fn add(&self, form_type: &str, connection_id: ConnectionId) -> usize {
        let mut members = self.forms.entry(form_type.to_string()).or_default();
        members.insert(connection_id);
        members.len()
    }

    /// Remove the connection. `None` when it was not a member.
    pub fn remove(&self, form_type: &str, connection_id: ConnectionId) -> Option<usize> {
        let remaining = {
            let mut members = self.forms.get_mut(form_type)?;
            if !members.remove(&connection_id) {
                return None;
            }
            members.len()
        };
        if remaining == 0 {
            self.forms.remove_if(form_type, |_, members| members.is_empty());
        }
        Some(remaining)
    }

    /// Remove the connection from every form it belongs to, returning the
    /// affected form types.
    pub fn remove_everywhere(&self, connection_id: ConnectionId) -> Vec<String> {
        let forms: Vec<String> = self
            .forms
            .iter()
            .filter(|entry| entry.value().contains(&connection_id))
            .map(|entry| entry.key().clone())
            .collect();
        forms
            .into_iter()
            .filter(|form_type| self.remove(form_type, connection_id).is_some())
            .collect()
    }

    pub fn count(&self, form_type: &str) -> usize {
        self.forms
            .get(form_type)
            .map(|members| members.len())
            .unwrap_or(0)
    }

    pub fn contains(&self, form_type: &str, connection_id: ConnectionId) -> bool {
        self.forms
            .get(form_type)
            .map(|members| members.contains(&connection_id))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn joins_minus_leaves() {
        let set = ActiveUserSet::new();
        let ids: Vec<_> = (0..5).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            set.add("intake", *id);
        }
        for id in &ids[..2] {
            assert!(set.remove("intake", *id).is_some());
        }
        assert_eq!(set.count("intake"), 3);
    }

    #[test]
    fn removing_a_stranger_is_a_no_op() {
        let set = ActiveUserSet::new();
        let member = Uuid::new_v4();
        set.add("intake", member);
        assert_eq!(set.remove("intake", Uuid::new_v4()), None);
        assert_eq!(set.remove("never", member), None);
        assert_eq!(set.count("intake"), 1);
        assert_eq!(set.count("never"), 0);
    }

    #[test]
    fn duplicate_joins_count_once() {
        let set = ActiveUserSet::new();
        let id = Uuid::new_v4();
        assert_eq!(set.add("intake", id), 1);
        assert_eq!(set.add("intake", id), 1);
    }

    #[test]
    fn remove_everywhere_reports_forms() {
        let set = ActiveUserSet::new();
        let id = Uuid::new_v4();
        let other = Uuid::new_v4();
        set.add("intake", id);
        set.add("billing", id);
        set.add("billing", other);
        let mut forms = set.remove_everywhere(id);
        forms.sort();
        assert_eq!(forms, vec!["billing".to_string(), "intake".to_string()]);
        assert_eq!(set.count("intake"), 0);
        assert_eq!(set.count("billing"), 1);
        assert!(!set.contains("billing", id));
    }
}
