//! Docker access: label-filtered discovery of images and builder containers,
//! plus the container plumbing the direct builder needs.

pub mod labels;
mod text;

use std::collections::HashMap;

use bollard::Docker;
use bollard::models::HostConfig;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use tracing::{debug, warn};

use crate::error::{CoreError, is_not_found};
use crate::launcher::LaunchPlan;
use crate::types::ImageDescriptor;
use text::LogText;

/// Process-wide handle on the container runtime, created once at startup.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    docker: Docker,
}

fn label_filter(extra: &[(&str, &str)]) -> HashMap<String, Vec<String>> {
    let mut filters = HashMap::new();
    filters.insert("label".to_string(), vec![labels::REF.to_string()]);
    for (key, value) in extra {
        filters.insert(key.to_string(), vec![value.to_string()]);
    }
    filters
}

impl RegistryClient {
    /// Connect through the local socket (or `DOCKER_HOST`).
    pub fn connect() -> Result<Self, CoreError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| CoreError::RuntimeUnavailable(e.to_string()))?;
        Ok(Self { docker })
    }

    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Finished images carrying our labels.
    pub async fn list_images(&self) -> Result<Vec<ImageDescriptor>, CoreError> {
        #[allow(deprecated)]
        let options = bollard::image::ListImagesOptions::<String> {
            filters: label_filter(&[("dangling", "false")]),
            ..Default::default()
        };
        #[allow(deprecated)]
        let images = self.docker.list_images(Some(options)).await?;
        Ok(images
            .iter()
            .filter_map(|image| labels::image_descriptor(&image.labels))
            .collect())
    }

    /// Builder containers that are still running.
    pub async fn list_containers(&self) -> Result<Vec<ImageDescriptor>, CoreError> {
        #[allow(deprecated)]
        let options = bollard::container::ListContainersOptions::<String> {
            filters: label_filter(&[]),
            ..Default::default()
        };
        #[allow(deprecated)]
        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers
            .iter()
            .filter_map(|c| c.labels.as_ref().and_then(labels::container_descriptor))
            .collect())
    }

    /// Built images followed by in-progress builds.
    pub async fn list_environments(&self) -> Result<Vec<ImageDescriptor>, CoreError> {
        let mut all = self.list_images().await?;
        all.extend(self.list_containers().await?);
        Ok(all)
    }

    /// Remove an image by name. Returns `Ok(false)` when it does not exist.
    pub async fn remove_image(&self, name: &str) -> Result<bool, CoreError> {
        match self
            .docker
            .remove_image(
                name,
                None::<bollard::query_parameters::RemoveImageOptions>,
                None,
            )
            .await
        {
            Ok(_) => {
                debug!(image = name, "image removed");
                Ok(true)
            }
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Create and start the container described by `plan`.
    pub async fn run_container(&self, plan: &LaunchPlan) -> Result<(), CoreError> {
        #[allow(deprecated)]
        let options = bollard::container::CreateContainerOptions {
            name: plan.container_name.clone(),
            platform: None,
        };
        #[allow(deprecated)]
        let config = bollard::container::Config {
            image: Some(plan.builder_image.clone()),
            cmd: Some(plan.cmd.clone()),
            labels: Some(plan.labels.clone()),
            env: (!plan.env.is_empty()).then(|| plan.env.clone()),
            tty: Some(false),
            attach_stdout: Some(false),
            attach_stderr: Some(false),
            open_stdin: Some(false),
            host_config: Some(HostConfig {
                binds: Some(plan.binds.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };
        #[allow(deprecated)]
        self.docker.create_container(Some(options), config).await?;
        let started = self
            .docker
            .start_container(
                &plan.container_name,
                None::<bollard::query_parameters::StartContainerOptions>,
            )
            .await;
        if let Err(e) = started {
            if let Err(cleanup) = self.remove_container(&plan.container_name).await {
                warn!(container = %plan.container_name, error = %cleanup, "failed to remove unstarted builder container");
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Follow a container's stdout/stderr until it exits.
    pub fn follow_logs(&self, container: &str) -> BoxStream<'static, Result<String, CoreError>> {
        let options = bollard::query_parameters::LogsOptions {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let frames = self.docker.logs(container, Some(options)).boxed();
        stream::unfold(
            (frames, LogText::default(), false),
            |(mut frames, mut text, done)| async move {
                if done {
                    return None;
                }
                loop {
                    match frames.next().await {
                        Some(Ok(frame)) => {
                            let chunk = text.push(frame);
                            if !chunk.is_empty() {
                                return Some((Ok(chunk), (frames, text, false)));
                            }
                        }
                        Some(Err(e)) => return Some((Err(CoreError::from(e)), (frames, text, true))),
                        None => {
                            let rest = text.finish();
                            return (!rest.is_empty()).then_some((Ok(rest), (frames, text, true)));
                        }
                    }
                }
            },
        )
        .boxed()
    }

    /// Wait for a container to stop and return its exit code.
    pub async fn wait_exit(&self, container: &str) -> Result<i64, CoreError> {
        let mut wait = self
            .docker
            .wait_container(container, None::<bollard::query_parameters::WaitContainerOptions>);
        match wait.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => Err(CoreError::Runtime(format!(
                "wait on container {container} ended without a status"
            ))),
        }
    }

    /// Force-remove a container, ignoring containers that are already gone.
    pub async fn remove_container(&self, container: &str) -> Result<(), CoreError> {
        let options = bollard::query_parameters::RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(container, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => {
                warn!(container, "builder container already removed");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
