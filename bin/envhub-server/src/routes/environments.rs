//! Environment (build) management endpoints.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::routing::get;
use axum::{Json, Router};
use envhub_core::BuildForm;
use tracing::info;
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::schemas::environment::{
    CreateEnvironmentRequest, CreateEnvironmentResponse, DeleteEnvironmentRequest, EnvironmentView,
    StatusResponse,
};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(list_environments, create_environment, delete_environment),
    components(schemas(
        CreateEnvironmentRequest,
        CreateEnvironmentResponse,
        DeleteEnvironmentRequest,
        EnvironmentView,
        StatusResponse
    ))
)]
pub struct EnvironmentsApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route(
        "/api/environments",
        get(list_environments)
            .post(create_environment)
            .delete(delete_environment),
    )
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ServerError> {
    payload
        .map(|Json(body)| body)
        .map_err(|e| ServerError::BadRequest(e.body_text()))
}

#[utoipa::path(
    get,
    path = "/api/environments",
    tag = "environments",
    responses(
        (status = 200, description = "Build records, then runtime-only images", body = [EnvironmentView]),
        (status = 500, description = "Store error"),
    )
)]
pub async fn list_environments(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<EnvironmentView>>, ServerError> {
    let records = state.orchestrator.records().await?;
    let mut views: Vec<EnvironmentView> = records.iter().map(EnvironmentView::from).collect();

    let known: HashSet<String> = views.iter().map(|v| v.name.clone()).collect();
    views.extend(
        state
            .orchestrator
            .runtime_environments()
            .await
            .into_iter()
            .filter(|d| !known.contains(&d.image_name))
            .map(EnvironmentView::from),
    );
    Ok(Json(views))
}

#[utoipa::path(
    post,
    path = "/api/environments",
    tag = "environments",
    request_body = CreateEnvironmentRequest,
    responses(
        (status = 200, description = "Build accepted", body = CreateEnvironmentResponse),
        (status = 400, description = "Invalid request"),
        (status = 500, description = "Store error, or missing provider in delegated mode"),
    )
)]
pub async fn create_environment(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateEnvironmentRequest>, JsonRejection>,
) -> Result<Json<CreateEnvironmentResponse>, ServerError> {
    let req = json_body(payload)?;
    let uid = state.orchestrator.submit(BuildForm::from(req)).await?;
    Ok(Json(CreateEnvironmentResponse {
        uid: uid.to_string(),
        status: "ok".to_owned(),
    }))
}

#[utoipa::path(
    delete,
    path = "/api/environments",
    tag = "environments",
    request_body = DeleteEnvironmentRequest,
    responses(
        (status = 200, description = "Environment deleted", body = StatusResponse),
        (status = 404, description = "Unknown environment"),
        (status = 500, description = "Runtime or store error"),
    )
)]
pub async fn delete_environment(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<DeleteEnvironmentRequest>, JsonRejection>,
) -> Result<Json<StatusResponse>, ServerError> {
    let req = json_body(payload)?;
    state.orchestrator.delete(&req.name).await?;
    info!(name = %req.name, "delete request served");
    Ok(Json(StatusResponse::ok()))
}
