//! Axum router construction.
//!
//! [`build`] assembles the complete application router under the configured
//! service prefix:
//! - `health` heartbeat
//! - `api/environments` and `api/environments/{id}/logs` (behind the optional
//!   API token)
//! - `api-docs/openapi.json` (disable with `ENVHUB_ENABLE_API_DOCS=false`)

pub mod doc;
mod environments;
mod health;
mod logs;

use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum::routing::get;

use crate::middleware::{auth, cors, trace};
use crate::state::AppState;

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .merge(environments::router())
        .merge(logs::router())
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::check_api_token,
        ));

    let mut service = Router::new().merge(health::router()).merge(api);
    if state.config.enable_api_docs {
        service = service.route("/api-docs/openapi.json", get(doc::openapi_json));
    }

    // Nesting at "/" is not allowed; the root prefix is a plain merge.
    let prefix = state.config.service_prefix.trim_end_matches('/');
    let app = if prefix.is_empty() {
        service
    } else {
        Router::new().nest(prefix, service)
    };

    app
        // Outermost layers execute first on the way in.
        .layer(cors::cors_layer(&state.config))
        .layer(middleware::from_fn(trace::trace_middleware))
        .with_state(state)
}
