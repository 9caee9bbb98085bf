use std::collections::BTreeMap;

use envhub_core::{BuildForm, GitCredentials, ImageDescriptor, ImageMeta};
use serde::{Deserialize, Deserializer, Serialize};
use utoipa::ToSchema;

use crate::entities::ImageRecord;

/// Accepts `"2"`, `2` or `2.5`; anything else is kept as text and rejected
/// later by validation.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct CreateEnvironmentRequest {
    /// Git repository URL.
    #[serde(default)]
    pub repo: String,
    /// Branch, tag or commit; empty means `HEAD`.
    #[serde(default, rename = "ref")]
    pub git_ref: String,
    /// Environment name, `[a-z0-9-_]+`. Derived from the repo when empty.
    #[serde(default)]
    pub name: String,
    /// Memory limit in GB.
    #[serde(default, deserialize_with = "string_or_number")]
    #[schema(value_type = Option<String>)]
    pub memory: Option<String>,
    /// CPU limit in cores.
    #[serde(default, deserialize_with = "string_or_number")]
    #[schema(value_type = Option<String>)]
    pub cpu: Option<String>,
    /// Repository provider for delegated builds (`gh`, `gl`, `git`, ...).
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl From<CreateEnvironmentRequest> for BuildForm {
    fn from(req: CreateEnvironmentRequest) -> Self {
        BuildForm {
            credentials: GitCredentials::from_parts(req.username, req.password),
            repo: req.repo,
            git_ref: req.git_ref,
            name: req.name,
            memory: req.memory,
            cpu: req.cpu,
            provider: req.provider,
            node_selector: req.node_selector,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CreateEnvironmentResponse {
    pub uid: String,
    pub status: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct DeleteEnvironmentRequest {
    /// A build uid, or an image name.
    pub name: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_owned(),
        }
    }
}

/// One entry of the environment listing.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct EnvironmentView {
    /// `None` for images found only on the container runtime.
    pub uid: Option<String>,
    pub name: String,
    pub status: String,
    pub display_name: String,
    pub repo: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub cpu_limit: String,
    pub mem_limit: String,
    pub node_selector: BTreeMap<String, String>,
}

impl From<&ImageRecord> for EnvironmentView {
    fn from(record: &ImageRecord) -> Self {
        let ImageMeta {
            display_name,
            repo,
            git_ref,
            cpu_limit,
            mem_limit,
            node_selector,
        } = record.image_meta.clone();
        Self {
            uid: Some(record.uid.to_string()),
            name: record.name.clone(),
            status: record.status.to_string(),
            display_name,
            repo,
            git_ref,
            cpu_limit,
            mem_limit,
            node_selector,
        }
    }
}

impl From<ImageDescriptor> for EnvironmentView {
    fn from(d: ImageDescriptor) -> Self {
        Self {
            uid: None,
            name: d.image_name,
            status: d.status.to_string(),
            display_name: d.display_name,
            repo: d.repo,
            git_ref: d.git_ref,
            cpu_limit: d.cpu_limit,
            mem_limit: d.mem_limit,
            node_selector: BTreeMap::new(),
        }
    }
}
