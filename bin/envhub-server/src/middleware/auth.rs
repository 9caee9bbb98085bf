use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, header};
use axum::middleware::Next;
use axum::response::Response;
use tracing::debug;

use crate::error::ServerError;
use crate::state::AppState;

fn provided_token(req: &Request<Body>) -> Option<&str> {
    let value = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("token "))
        .map(str::trim)
}

/// Gate API routes behind `ENVHUB_API_TOKEN` when it is configured.
pub async fn check_api_token(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ServerError> {
    if let Some(expected) = state.config.api_token.as_deref() {
        if provided_token(&req) != Some(expected) {
            debug!(path = %req.uri().path(), "rejected request without a valid api token");
            return Err(ServerError::Unauthorized);
        }
    }
    Ok(next.run(req).await)
}

#[cfg(test)]
mod test {
    use axum::http::StatusCode;
    use envhub_core::BuilderMode;
    use tower::ServiceExt;

    use super::*;
    use crate::config::Config;
    use crate::testing::test_app_with;

    fn list(auth: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri("/api/environments");
        if let Some(auth) = auth {
            builder = builder.header(header::AUTHORIZATION, auth);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn token_is_required_when_configured() {
        let config = Config {
            api_token: Some("s3cret".into()),
            ..Config::default()
        };
        let (app, _state, _builder) = test_app_with(BuilderMode::Direct, config).await;

        let response = app.clone().oneshot(list(None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app.clone().oneshot(list(Some("Bearer wrong"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app.clone().oneshot(list(Some("Bearer s3cret"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.oneshot(list(Some("token s3cret"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn health_stays_open() {
        let config = Config {
            api_token: Some("s3cret".into()),
            ..Config::default()
        };
        let (app, _state, _builder) = test_app_with(BuilderMode::Direct, config).await;
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
