use axum::Json;
use utoipa::OpenApi;

use crate::routes::{environments, health, logs};

#[derive(OpenApi)]
#[openapi(info(
    title = "envhub-server",
    description = "Build container environments from Git repositories and follow their logs",
    contact(name = "envhub", url = "https://github.com/envhub/envhub")
))]
pub struct ApiDoc;

pub fn get_docs() -> utoipa::openapi::OpenApi {
    let mut root = ApiDoc::openapi();
    root.merge(health::HealthApi::openapi());
    root.merge(environments::EnvironmentsApi::openapi());
    root.merge(logs::LogsApi::openapi());
    root
}

pub async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(get_docs())
}
