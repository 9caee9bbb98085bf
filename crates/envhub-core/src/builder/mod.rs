//! Build strategies.
//!
//! An [`ImageBuilder`] turns a validated [`BuildSpec`] into an ordered stream
//! of [`BuildEvent`]s. [`DirectBuilder`] runs repo2docker containers on the
//! local runtime; [`DelegatedBuilder`] hands the build to a BinderHub
//! instance and relays its event stream.

mod delegated;
mod direct;
pub mod sse;

pub use delegated::DelegatedBuilder;
pub use direct::DirectBuilder;

use async_trait::async_trait;
use futures::stream::BoxStream;
use strum::{AsRefStr, Display};
use uuid::Uuid;

use crate::error::CoreError;
use crate::types::{BuildEvent, ImageDescriptor};
use crate::validate::BuildSpec;

pub type BuildEventStream = BoxStream<'static, Result<BuildEvent, CoreError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum BuilderMode {
    Direct,
    Delegated,
}

#[async_trait]
pub trait ImageBuilder: Send + Sync + 'static {
    fn mode(&self) -> BuilderMode;

    /// Delegated builds are keyed by repository provider.
    fn requires_provider(&self) -> bool {
        self.mode() == BuilderMode::Delegated
    }

    /// Start a build and return its event stream. An `Err` here means the
    /// build never started.
    async fn build(&self, uid: Uuid, spec: &BuildSpec) -> Result<BuildEventStream, CoreError>;

    /// Remove a produced image. `Ok(false)` when there was nothing to remove.
    async fn remove_image(&self, name: &str) -> Result<bool, CoreError>;

    /// Images and in-progress builds visible on the runtime itself.
    async fn list_runtime(&self) -> Result<Vec<ImageDescriptor>, CoreError> {
        Ok(Vec::new())
    }
}
