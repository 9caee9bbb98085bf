use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::error::CoreError;

/// Lifecycle of a build record. Only `Building -> Built` and
/// `Building -> Failed` are legal transitions.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BuildStatus {
    Building,
    Built,
    Failed,
}

impl BuildStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, BuildStatus::Building)
    }
}

/// Phase carried by a builder event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildPhase {
    Log,
    Built,
    Failed,
    /// Anything else a builder reports ("fetching", "waiting", ...). Ignored.
    Unknown(String),
}

impl BuildPhase {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "log" => BuildPhase::Log,
            "ready" | "built" => BuildPhase::Built,
            "failed" => BuildPhase::Failed,
            other => BuildPhase::Unknown(other.to_owned()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(default)]
    phase: String,
    #[serde(default)]
    message: String,
    #[serde(default, rename = "imageName")]
    image_name: Option<String>,
}

/// One event produced by a builder while it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildEvent {
    pub phase: BuildPhase,
    pub message: String,
    pub image_name: Option<String>,
}

impl BuildEvent {
    pub fn log(message: impl Into<String>) -> Self {
        Self {
            phase: BuildPhase::Log,
            message: message.into(),
            image_name: None,
        }
    }

    pub fn built(image_name: Option<String>) -> Self {
        Self {
            phase: BuildPhase::Built,
            message: String::new(),
            image_name,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            phase: BuildPhase::Failed,
            message: message.into(),
            image_name: None,
        }
    }

    /// Decode a `{"phase": .., "message": .., "imageName": ..}` payload.
    pub fn from_json(payload: &str) -> Result<Self, CoreError> {
        let raw: RawEvent = serde_json::from_str(payload)?;
        Ok(Self {
            phase: BuildPhase::parse(&raw.phase),
            message: raw.message,
            image_name: raw.image_name.filter(|n| !n.is_empty()),
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, BuildPhase::Built | BuildPhase::Failed)
    }
}

/// Metadata persisted alongside a build record, exactly as submitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMeta {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default, rename = "ref")]
    pub git_ref: String,
    #[serde(default)]
    pub cpu_limit: String,
    #[serde(default)]
    pub mem_limit: String,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
}

/// Where a runtime descriptor came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DescriptorStatus {
    /// A finished image found in the local image store.
    Built,
    /// A builder container that is still running.
    Building,
}

/// An environment discovered directly from the container runtime via labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDescriptor {
    pub repo: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub image_name: String,
    pub display_name: String,
    pub mem_limit: String,
    pub cpu_limit: String,
    pub status: DescriptorStatus,
}

/// Git credentials forwarded to the builder. Never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct GitCredentials {
    pub username: String,
    pub password: String,
}

impl GitCredentials {
    /// Returns credentials only when both halves are non-empty.
    pub fn from_parts(username: Option<String>, password: Option<String>) -> Option<Self> {
        match (username, password) {
            (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
                Some(Self { username, password })
            }
            _ => None,
        }
    }

    /// Value of the `GIT_CREDENTIAL_ENV` variable understood by repo2docker.
    pub fn to_env_value(&self) -> String {
        format!("username={}\npassword={}", self.username, self.password)
    }
}

impl fmt::Debug for GitCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}
