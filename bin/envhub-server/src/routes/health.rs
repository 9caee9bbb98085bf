//! Health / heartbeat endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use utoipa::OpenApi;

use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(get_health))]
pub struct HealthApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(get_health))
}

/// Heartbeat endpoint.
///
/// Returns `{"status": "ok", "version": "...", "mode": "...", "builds_in_flight": n}`.
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Server is healthy", body = Value)
    )
)]
pub async fn get_health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status":  "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "mode":    state.orchestrator.mode().to_string(),
        "builds_in_flight": state.orchestrator.builds_in_flight(),
    }))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::test_app;
    use envhub_core::BuilderMode;

    #[tokio::test]
    async fn health_reports_status_and_version() {
        let (_app, state, _builder) = test_app(BuilderMode::Direct).await;
        let Json(body) = get_health(State(state)).await;
        assert_eq!(body["status"], "ok");
        assert!(!body["version"].as_str().unwrap_or("").is_empty());
        assert_eq!(body["mode"], "direct");
        assert_eq!(body["builds_in_flight"], 0);
    }
}
