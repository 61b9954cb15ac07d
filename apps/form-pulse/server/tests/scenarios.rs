use std::sync::Arc;

use form_pulse_core::{FormMetricsSnapshot, ServerEvent};
use form_pulse_server::aggregator::MetricsAggregator;
use form_pulse_server::broadcast::Outbound;
use form_pulse_server::gateway::{ConnectionHandle, FormGateway, GatewayConfig};
use form_pulse_server::retry::RetryPolicy;
use form_pulse_server::store::MemoryStore;
use serde_json::json;

struct Harness {
    store: Arc<MemoryStore>,
    gateway: FormGateway,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let aggregator = MetricsAggregator::new(store.clone(), RetryPolicy::none());
        let gateway = FormGateway::new(aggregator, GatewayConfig::default());
        Self { store, gateway }
    }

    async fn send(&self, conn: &ConnectionHandle, event: &str, data: serde_json::Value) {
        let frame = json!({ "event": event, "data": data }).to_string();
        self.gateway.handle_frame(conn.id, &frame).await;
    }

    async fn snapshot(&self, form_type: &str) -> FormMetricsSnapshot {
        self.gateway.aggregator().snapshot(form_type).await
    }
}

fn drain(conn: &mut ConnectionHandle) -> Vec<Outbound> {
    let mut events = Vec::new();
    while let Ok(event) = conn.receiver.try_recv() {
        events.push(event);
    }
    events
}

fn error_count(events: &[Outbound]) -> usize {
    events
        .iter()
        .filter(|event| matches!(event.as_ref(), ServerEvent::Error(_)))
        .count()
}

#[tokio::test]
async fn views_only_ever_grow() {
    let harness = Harness::new();
    let conn = harness.gateway.connect();
    let mut previous = 0;
    for _ in 0..5 {
        harness
            .send(&conn, "form_view", json!({ "formType": "intake" }))
            .await;
        let views = harness.snapshot("intake").await.views;
        assert_eq!(views, previous + 1);
        previous = views;
    }
}

#[tokio::test]
async fn recent_sessions_stay_bounded_and_newest_first() {
    let harness = Harness::new();
    let mut ids = Vec::new();
    for _ in 0..14 {
        let conn = harness.gateway.connect();
        harness.send(&conn, "join_form", json!("intake")).await;
        harness.send(&conn, "leave_form", json!("intake")).await;
        ids.push(conn.id);
        assert!(harness.snapshot("intake").await.recent_sessions.len() <= 10);
    }

    let recent: Vec<_> = harness
        .snapshot("intake")
        .await
        .recent_sessions
        .iter()
        .map(|session| session.connection_id)
        .collect();
    let expected: Vec<_> = ids.iter().rev().take(10).copied().collect();
    assert_eq!(recent, expected);
}

#[tokio::test]
async fn completion_rate_without_field_count_is_zero() {
    let harness = Harness::new();
    let conn = harness.gateway.connect();
    harness.send(&conn, "join_form", json!("intake")).await;
    harness
        .send(
            &conn,
            "field_interaction",
            json!({ "formType": "intake", "fieldName": "email", "isValid": true }),
        )
        .await;
    harness.send(&conn, "leave_form", json!("intake")).await;

    let sessions = harness.snapshot("intake").await.recent_sessions;
    assert_eq!(sessions[0].total_fields, 0);
    assert_eq!(sessions[0].completion_rate, 0.0);
}

#[tokio::test]
async fn completion_rate_is_clamped_against_field_count() {
    let harness = Harness::new();
    harness
        .gateway
        .aggregator()
        .set_total_fields("intake", 1)
        .await
        .unwrap();
    let conn = harness.gateway.connect();
    harness.send(&conn, "join_form", json!("intake")).await;
    for field in ["name", "email"] {
        harness
            .send(
                &conn,
                "field_interaction",
                json!({ "formType": "intake", "fieldName": field, "isValid": true }),
            )
            .await;
    }
    harness.send(&conn, "leave_form", json!("intake")).await;

    let sessions = harness.snapshot("intake").await.recent_sessions;
    assert_eq!(sessions[0].completion_rate, 1.0);
}

#[tokio::test]
async fn failures_stay_on_the_originating_connection() {
    let harness = Harness::new();
    let mut a = harness.gateway.connect();
    let mut b = harness.gateway.connect();
    harness.send(&a, "join_form", json!("intake")).await;
    harness.send(&b, "join_form", json!("intake")).await;
    harness
        .send(
            &b,
            "field_interaction",
            json!({ "formType": "intake", "fieldName": "name", "isValid": true }),
        )
        .await;
    drain(&mut a);
    drain(&mut b);

    harness.store.fail_next_writes(1);
    harness
        .send(
            &a,
            "field_interaction",
            json!({ "formType": "intake", "fieldName": "email", "isValid": false }),
        )
        .await;
    harness.gateway.handle_frame(a.id, "{\"event\":").await;

    assert_eq!(error_count(&drain(&mut a)), 2);
    assert_eq!(error_count(&drain(&mut b)), 0);

    let snapshot = harness.snapshot("intake").await;
    assert_eq!(snapshot.field_interactions.get("name"), Some(&1));
    assert_eq!(snapshot.field_interactions.get("email"), None);

    harness.send(&b, "leave_form", json!("intake")).await;
    let sessions = harness.snapshot("intake").await.recent_sessions;
    assert_eq!(sessions[0].connection_id, b.id);
    assert_eq!(sessions[0].interaction_count, 1);
    assert_eq!(sessions[0].completed_fields, vec!["name".to_string()]);
}

#[tokio::test]
async fn leaving_an_unjoined_form_is_harmless() {
    let harness = Harness::new();
    let mut conn = harness.gateway.connect();
    harness.send(&conn, "leave_form", json!("intake")).await;
    harness.send(&conn, "leave_form", json!("intake")).await;

    assert!(drain(&mut conn).is_empty());
    assert_eq!(harness.gateway.active_users("intake"), 0);
    assert_eq!(harness.snapshot("intake").await, FormMetricsSnapshot::default());
}

#[tokio::test]
async fn active_users_equal_joins_minus_leaves() {
    let harness = Harness::new();
    let conns: Vec<_> = (0..6).map(|_| harness.gateway.connect()).collect();
    for conn in &conns {
        harness.send(conn, "join_form", json!("intake")).await;
    }
    for conn in &conns[..4] {
        harness.send(conn, "leave_form", json!("intake")).await;
    }
    assert_eq!(harness.gateway.active_users("intake"), 2);

    harness.gateway.disconnect(conns[4].id).await;
    assert_eq!(harness.gateway.active_users("intake"), 1);
}

#[tokio::test]
async fn join_interact_leave_records_the_session() {
    let harness = Harness::new();
    let conn = harness.gateway.connect();
    let before = harness.snapshot("intake").await;

    harness.send(&conn, "join_form", json!("intake")).await;
    harness
        .send(
            &conn,
            "field_interaction",
            json!({ "formType": "intake", "fieldName": "email", "isValid": true, "value": "me@example.com" }),
        )
        .await;
    harness.send(&conn, "leave_form", json!("intake")).await;

    let after = harness.snapshot("intake").await;
    assert_eq!(after.field_interactions.get("email"), Some(&1));
    assert_eq!(
        after.field_errors.get("email"),
        before.field_errors.get("email")
    );
    assert_eq!(after.recent_sessions.len(), before.recent_sessions.len() + 1);
    assert!(after.recent_sessions[0]
        .completed_fields
        .contains(&"email".to_string()));
}

#[tokio::test]
async fn completion_updates_count_and_weighted_average() {
    let harness = Harness::new();
    let mut a = harness.gateway.connect();
    let mut b = harness.gateway.connect();
    harness.send(&a, "join_form", json!("intake")).await;
    harness.send(&b, "join_form", json!("intake")).await;
    harness
        .send(
            &b,
            "form_completion",
            json!({ "formType": "intake", "completionTime": 3000, "formData": {} }),
        )
        .await;
    let before = harness.snapshot("intake").await;
    drain(&mut a);
    drain(&mut b);

    harness
        .send(
            &a,
            "form_completion",
            json!({ "formType": "intake", "completionTime": 5000, "formData": { "ssn": "secret" } }),
        )
        .await;

    let after = harness.snapshot("intake").await;
    assert_eq!(after.completed, before.completed + 1);
    assert_eq!(after.average_completion_time_ms, 4000);

    let activity = drain(&mut b)
        .into_iter()
        .find_map(|event| match event.as_ref() {
            ServerEvent::FormActivity(activity) => Some(activity.clone()),
            _ => None,
        })
        .expect("observer receives the completion activity");
    assert_eq!(activity.activity_type, "form_completed");
    assert_eq!(activity.data["averageCompletionTime"], 4000);
    assert_eq!(activity.data["completed"], 2);
    assert!(activity.data.get("formData").is_none());
}

#[tokio::test]
async fn unreachable_store_serves_the_zero_snapshot() {
    let harness = Harness::new();
    let conn = harness.gateway.connect();
    harness
        .send(&conn, "form_view", json!({ "formType": "intake" }))
        .await;
    harness.store.set_available(false);

    let snapshot = harness.snapshot("intake").await;
    assert_eq!(
        serde_json::to_value(&snapshot).unwrap(),
        json!({
            "views": 0,
            "starts": 0,
            "completed": 0,
            "averageCompletionTime": 0,
            "averageSessionDuration": 0,
            "fieldInteractions": {},
            "fieldErrors": {},
            "recentSessions": [],
            "recentBehavior": []
        })
    );
}
