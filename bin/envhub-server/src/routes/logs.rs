//! Live build log streaming over Server-Sent Events.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::sse::{Event, Sse};
use axum::routing::get;
use axum::Router;
use futures::{Stream, StreamExt};
use tracing::{debug, info};
use utoipa::OpenApi;
use uuid::Uuid;

use crate::error::ServerError;
use crate::state::AppState;
use crate::tail::{LogFrame, LogPhase};

#[derive(OpenApi)]
#[openapi(paths(stream_logs), components(schemas(LogFrame, LogPhase)))]
pub struct LogsApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/api/environments/{id}/logs", get(stream_logs))
}

/// Logs when a client's stream goes away, whatever the reason.
struct StreamSession {
    uid: Uuid,
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        debug!(uid = %self.uid, "log stream closed");
    }
}

#[utoipa::path(
    get,
    path = "/api/environments/{id}/logs",
    tag = "environments",
    params(
        ("id" = String, Path, description = "Build uid")
    ),
    responses(
        (status = 200, description = "Stream of `data: {phase, message}` events", body = LogFrame, content_type = "text/event-stream"),
        (status = 400, description = "Malformed uid"),
        (status = 404, description = "Unknown uid"),
    )
)]
pub async fn stream_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ServerError> {
    let uid = Uuid::parse_str(&id)
        .map_err(|_| ServerError::BadRequest("Badly formed hexadecimal UUID string".to_owned()))?;
    let frames = state.log_tail.open(uid).await?;
    info!(%uid, "log stream opened");

    let session = StreamSession { uid };
    Ok(Sse::new(frames.map(move |frame| {
        let _session = &session;
        Event::default().json_data(&frame)
    })))
}
