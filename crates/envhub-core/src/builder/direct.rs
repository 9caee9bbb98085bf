use async_trait::async_trait;
use futures::channel::oneshot;
use futures::stream::BoxStream;
use futures::{StreamExt, future, stream};
use tracing::{info, warn};
use uuid::Uuid;

use super::{BuildEventStream, BuilderMode, ImageBuilder};
use crate::docker::RegistryClient;
use crate::error::CoreError;
use crate::launcher::BuildLauncher;
use crate::types::{BuildEvent, ImageDescriptor};
use crate::validate::BuildSpec;

/// Runs repo2docker in a container on the local Docker daemon.
///
/// The event stream is the container's followed output as `log` events,
/// closed by a single terminal event derived from the exit code.
#[derive(Debug, Clone)]
pub struct DirectBuilder {
    launcher: BuildLauncher,
}

impl DirectBuilder {
    pub fn new(launcher: BuildLauncher) -> Self {
        Self { launcher }
    }
}

/// Terminal event for a builder container that exited with `code`.
pub fn exit_event(code: i64, image_name: String) -> BuildEvent {
    match code {
        0 => BuildEvent::built(Some(image_name)),
        code => BuildEvent::failed(format!("builder exited with status {code}\n")),
    }
}

/// Wait for the builder to exit, then remove it. Runs on its own task so the
/// container is cleaned up even when nobody reads the event stream.
fn reap(
    registry: RegistryClient,
    uid: Uuid,
    container: String,
) -> oneshot::Receiver<Result<i64, CoreError>> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let exit = registry.wait_exit(&container).await;
        if let Err(e) = registry.remove_container(&container).await {
            warn!(%uid, container = %container, error = %e, "failed to remove builder container");
        }
        // The reader may be gone already.
        let _ = tx.send(exit);
    });
    rx
}

/// Log chunks as `log` events, then one terminal event from the exit code.
/// A failing log stream is logged and cut short; the exit code still decides.
pub fn compose_events(
    uid: Uuid,
    logs: BoxStream<'static, Result<String, CoreError>>,
    exit: oneshot::Receiver<Result<i64, CoreError>>,
    image_name: String,
) -> BuildEventStream {
    let logs = logs
        .take_while(move |chunk| {
            if let Err(e) = chunk {
                warn!(%uid, error = %e, "builder log stream failed; waiting for exit");
            }
            future::ready(chunk.is_ok())
        })
        .filter_map(|chunk| future::ready(chunk.ok().map(BuildEvent::log)));

    let outcome = stream::once(async move {
        let code = exit
            .await
            .map_err(|_| CoreError::Runtime("builder wait task ended early".into()))??;
        if code == 0 {
            info!(%uid, image = %image_name, "build finished");
        }
        Ok::<_, CoreError>(exit_event(code, image_name))
    });

    logs.map(Ok).chain(outcome).boxed()
}

#[async_trait]
impl ImageBuilder for DirectBuilder {
    fn mode(&self) -> BuilderMode {
        BuilderMode::Direct
    }

    async fn build(&self, uid: Uuid, spec: &BuildSpec) -> Result<BuildEventStream, CoreError> {
        let plan = self.launcher.launch(uid, spec).await?;
        let registry = self.launcher.registry().clone();

        let logs = registry.follow_logs(&plan.container_name);
        let exit = reap(registry, uid, plan.container_name);
        Ok(compose_events(uid, logs, exit, plan.image_name))
    }

    async fn remove_image(&self, name: &str) -> Result<bool, CoreError> {
        self.launcher.registry().remove_image(name).await
    }

    async fn list_runtime(&self) -> Result<Vec<ImageDescriptor>, CoreError> {
        self.launcher.registry().list_environments().await
    }
}
