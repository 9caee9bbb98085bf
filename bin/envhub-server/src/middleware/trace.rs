use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::{HeaderValue, header};
use axum::middleware::Next;
use axum::response::Response;
use http_body_util::BodyExt;
use tracing::{Instrument, info, info_span};
use uuid::Uuid;

pub static X_TRACE_ID: &str = "x-trace-id";

const MAX_LOGGED_BODY: usize = 1024;

/// Wraps each request in an `http_request` span keyed by a trace id, logs
/// small JSON request bodies and the response status. Response bodies pass
/// through untouched so event streams are not buffered.
pub async fn trace_middleware(req: Request<Body>, next: Next) -> Response {
    let start_time = Instant::now();

    let trace_id = req
        .headers()
        .get(X_TRACE_ID)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::new_v4);

    let span = info_span!(
        "http_request",
        trace_id = %trace_id,
        method = %req.method(),
        path = %req.uri().path(),
    );

    async move {
        info!("→ request started");
        let (parts, body) = req.into_parts();
        let body = log_request_body(&parts.headers, body).await;
        let mut req = Request::from_parts(parts, body);

        let header_value = HeaderValue::from_str(&trace_id.to_string()).ok();
        if let Some(value) = header_value.clone() {
            req.headers_mut().insert(X_TRACE_ID, value);
        }

        let mut response = next.run(req).await;
        if let Some(value) = header_value {
            response.headers_mut().insert(X_TRACE_ID, value);
        }

        info!(
            status = response.status().as_u16(),
            latency_ms = start_time.elapsed().as_millis(),
            "← response started"
        );
        response
    }
    .instrument(span)
    .await
}

async fn log_request_body(headers: &header::HeaderMap, body: Body) -> Body {
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("application/json"));
    if !is_json {
        return body;
    }

    let bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => Bytes::new(),
    };
    if bytes.len() < MAX_LOGGED_BODY {
        if let Ok(text) = std::str::from_utf8(&bytes) {
            info!(body = %redact(text), "request body");
        }
    } else {
        info!(size = bytes.len(), "request body [skipped]");
    }
    Body::from(bytes)
}

/// Hide `password` values before a body reaches the log.
fn redact(text: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(serde_json::Value::Object(mut map)) => {
            if let Some(v) = map.get_mut("password") {
                *v = serde_json::Value::String("<redacted>".to_owned());
            }
            serde_json::Value::Object(map).to_string()
        }
        _ => text.to_owned(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn passwords_are_redacted() {
        let out = redact(r#"{"repo":"r","username":"u","password":"hunter2"}"#);
        assert!(!out.contains("hunter2"));
        assert!(out.contains("\"username\":\"u\""));
        assert_eq!(redact("not json"), "not json");
    }
}
