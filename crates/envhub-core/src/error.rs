//! Error types shared by the runtime client, the launcher and the builder
//! strategies.

use thiserror::Error;

/// Failures talking to the container runtime or to a delegated build service.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The Docker daemon could not be reached at all.
    #[error("cannot connect to the container runtime: {0}")]
    RuntimeUnavailable(String),

    /// The Docker daemon answered with an error.
    #[error("container runtime error: {0}")]
    Runtime(String),

    /// Starting the builder container failed; nothing is retried.
    #[error("launch failed: {0}")]
    LaunchFailed(String),

    /// The delegated build service could not be reached or answered non-2xx.
    #[error("delegated build service error: {0}")]
    Delegated(String),

    /// A builder event payload was not valid JSON of the expected shape.
    #[error("malformed build event: {0}")]
    MalformedEvent(#[from] serde_json::Error),
}

impl CoreError {
    /// Wrap any error raised while launching a build into [`CoreError::LaunchFailed`].
    pub fn launch(err: impl std::fmt::Display) -> Self {
        CoreError::LaunchFailed(err.to_string())
    }
}

impl From<bollard::errors::Error> for CoreError {
    fn from(err: bollard::errors::Error) -> Self {
        let message = err.to_string();
        match &err {
            bollard::errors::Error::DockerResponseServerError { .. } => CoreError::Runtime(message),
            _ if message.contains("Connection refused")
                || message.contains("No such file or directory") =>
            {
                CoreError::RuntimeUnavailable(message)
            }
            _ => CoreError::Runtime(message),
        }
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        CoreError::Delegated(err.to_string())
    }
}

/// Returns `true` when a bollard error is the daemon's "no such object" answer.
pub(crate) fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}
