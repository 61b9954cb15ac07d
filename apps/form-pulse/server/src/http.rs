use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use form_pulse_core::{validate_form_type, FieldCountRequest, FormAnalyticsResponse};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::aggregator::field_completion_rates;
use crate::gateway::FormGateway;
use crate::ws::ws_handler;

#[derive(Clone)]
pub struct AppState {
    pub gateway: FormGateway,
    pub metrics: PrometheusHandle,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(ws_handler))
        .route("/api/analytics/:form_type", get(analytics_handler))
        .route("/api/forms/:form_type/fields", put(field_count_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> Response {
    match state.gateway.aggregator().ping().await {
        Ok(()) => Json(json!({ "status": "ok" })).into_response(),
        Err(err) => {
            warn!(error = %err, "health check could not reach the store");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded", "store": err.to_string() })),
            )
                .into_response()
        }
    }
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.gateway.stats())
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

/// One-shot snapshot fetch. Serves the zero snapshot when the store is down.
async fn analytics_handler(
    State(state): State<AppState>,
    Path(form_type): Path<String>,
) -> Response {
    if let Err(err) = validate_form_type(&form_type) {
        return bad_request(err.to_string());
    }
    let metrics = state.gateway.aggregator().snapshot(&form_type).await;
    let field_completion_rates = field_completion_rates(&metrics);
    Json(FormAnalyticsResponse {
        form_type,
        metrics,
        field_completion_rates,
    })
    .into_response()
}

async fn field_count_handler(
    State(state): State<AppState>,
    Path(form_type): Path<String>,
    Json(request): Json<FieldCountRequest>,
) -> Response {
    if let Err(err) = validate_form_type(&form_type) {
        return bad_request(err.to_string());
    }
    match state
        .gateway
        .aggregator()
        .set_total_fields(&form_type, request.total_fields)
        .await
    {
        Ok(()) => {
            info!(form_type = %form_type, total_fields = request.total_fields, "field count updated");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => {
            warn!(form_type = %form_type, error = %err, "failed to store field count");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}
