//! Core of envhub: turning Git repositories into container images.
//!
//! - [`validate`] checks incoming build requests.
//! - [`launcher`] computes names, labels and the repo2docker command line and
//!   starts builder containers.
//! - [`docker`] discovers labelled images and builder containers.
//! - [`builder`] exposes the direct and delegated build strategies behind a
//!   single [`builder::ImageBuilder`] trait.

pub mod builder;
pub mod docker;
pub mod error;
pub mod launcher;
pub mod types;
pub mod validate;

pub use builder::{BuildEventStream, BuilderMode, DelegatedBuilder, DirectBuilder, ImageBuilder};
pub use docker::RegistryClient;
pub use error::CoreError;
pub use launcher::{BuildLauncher, LaunchPlan};
pub use types::{
    BuildEvent, BuildPhase, BuildStatus, DescriptorStatus, GitCredentials, ImageDescriptor,
    ImageMeta,
};
pub use validate::{BuildForm, BuildSpec, ValidationError};
