use std::sync::Arc;
use std::time::Duration;

use form_pulse_client::{AnalyticsState, FormAnalyticsSubscription};
use form_pulse_server::aggregator::MetricsAggregator;
use form_pulse_server::gateway::{FormGateway, GatewayConfig};
use form_pulse_server::http::{router, AppState};
use form_pulse_server::retry::RetryPolicy;
use form_pulse_server::store::MemoryStore;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::time::{sleep, timeout};

async fn spawn_server() -> (String, FormGateway) {
    let store = Arc::new(MemoryStore::new());
    let aggregator = MetricsAggregator::new(store, RetryPolicy::none());
    let gateway = FormGateway::new(aggregator, GatewayConfig::default());
    let app = router(AppState {
        gateway: gateway.clone(),
        metrics: PrometheusBuilder::new().build_recorder().handle(),
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), gateway)
}

async fn wait_for_watchers(gateway: &FormGateway, form_type: &str, expected: usize) {
    timeout(Duration::from_secs(5), async {
        loop {
            let subscribers = gateway
                .stats()
                .rooms
                .iter()
                .find(|room| room.form_type == form_type)
                .map(|room| room.subscribers)
                .unwrap_or(0);
            if subscribers == expected {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("room membership settles");
}

async fn wait_for_state(
    subscription: &mut FormAnalyticsSubscription,
    done: impl Fn(&AnalyticsState) -> bool,
) -> AnalyticsState {
    timeout(Duration::from_secs(5), async {
        loop {
            let state = subscription.state();
            if done(&state) {
                return state;
            }
            subscription.changed().await.unwrap();
        }
    })
    .await
    .expect("state reaches the expected shape")
}

#[tokio::test]
async fn subscription_primes_and_follows_pushed_updates() {
    let (base_url, gateway) = spawn_server().await;
    let user = gateway.connect();
    gateway
        .handle_frame(user.id, r#"{"event":"form_view","data":{"formType":"intake"}}"#)
        .await;

    let mut subscription = FormAnalyticsSubscription::connect(&base_url, "intake")
        .await
        .unwrap();
    assert_eq!(subscription.state().metrics().unwrap().views, 1);
    wait_for_watchers(&gateway, "intake", 1).await;
    assert_eq!(gateway.active_users("intake"), 0);

    gateway
        .handle_frame(user.id, r#"{"event":"join_form","data":"intake"}"#)
        .await;
    gateway
        .handle_frame(user.id, r#"{"event":"form_view","data":{"formType":"other_form"}}"#)
        .await;
    gateway
        .handle_frame(
            user.id,
            r#"{"event":"form_completion","data":{"formType":"intake","completionTime":1200,"formData":{}}}"#,
        )
        .await;

    let state = wait_for_state(&mut subscription, |state| {
        state.activity().count() == 1
            && state.metrics().map(|m| m.completed) == Some(1)
            && state.active_users() == Some(1)
    })
    .await;
    let metrics = state.metrics().unwrap();
    assert_eq!(metrics.views, 1);
    assert_eq!(metrics.average_completion_time_ms, 1200);
    assert_eq!(
        state.activity().next().unwrap().activity_type,
        "form_completed"
    );

    let refreshed = subscription.refresh_analytics().await.unwrap();
    assert_eq!(refreshed.metrics.completed, 1);

    subscription.close().await;
    wait_for_watchers(&gateway, "intake", 1).await;
    assert_eq!(gateway.active_users("intake"), 1);
}

#[tokio::test]
async fn dropping_the_subscription_unwatches() {
    let (base_url, gateway) = spawn_server().await;
    let subscription = FormAnalyticsSubscription::connect(&base_url, "billing")
        .await
        .unwrap();
    wait_for_watchers(&gateway, "billing", 1).await;

    drop(subscription);
    wait_for_watchers(&gateway, "billing", 0).await;
}
