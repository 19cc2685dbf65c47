//! Admin HTTP API.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/healthz` | Liveness |
//! | GET | `/api/v1/resources` | All resources with their scale state |
//! | GET | `/api/v1/resources/{name}` | One resource |
//! | GET | `/metrics` | Prometheus exposition |

use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};

use zeroscale_metrics::render_prometheus;
use zeroscale_state::Registry;

#[derive(Clone)]
pub struct AdminState {
    pub registry: Registry,
}

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

pub fn build_router(registry: Registry) -> Router {
    let state = AdminState { registry };

    let api_routes = Router::new()
        .route("/resources", get(list_resources))
        .route("/resources/{name}", get(get_resource))
        .with_state(state.clone());

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api/v1", api_routes)
        .route("/metrics", get(prometheus_metrics).with_state(state))
}

/// GET /healthz
async fn healthz() -> &'static str {
    "ok"
}

/// GET /api/v1/resources
async fn list_resources(State(state): State<AdminState>) -> impl IntoResponse {
    ApiResponse::ok(state.registry.snapshot().await)
}

/// GET /api/v1/resources/{name}
async fn get_resource(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.registry.snapshot_of(&name).await {
        Some(snapshot) => ApiResponse::ok(snapshot).into_response(),
        None => error_response("resource not found", StatusCode::NOT_FOUND).into_response(),
    }
}

/// GET /metrics
async fn prometheus_metrics(State(state): State<AdminState>) -> impl IntoResponse {
    let snapshots = state.registry.snapshot().await;
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        render_prometheus(&snapshots),
    )
}
