//! Build orchestration.
//!
//! [`BuildOrchestrator::submit`] validates a request, creates a `building`
//! record and returns immediately; a background task then drives the
//! builder's event stream and folds it into the record. That task is the only
//! writer of a record's log and status.

use std::sync::Arc;
use std::time::Duration;

use envhub_core::{
    BuildEventStream, BuildForm, BuildPhase, BuildSpec, BuildStatus, BuilderMode, ImageBuilder,
    ImageDescriptor,
};
use futures::StreamExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::entities::{ImageRecord, ImageStore, SqliteStore};
use crate::error::ServerError;
use crate::state::{InFlightGuard, TaskManager};

pub struct BuildOrchestrator {
    store: Arc<SqliteStore>,
    builder: Arc<dyn ImageBuilder>,
    tasks: Arc<TaskManager>,
    idle_timeout: Option<Duration>,
}

impl std::fmt::Debug for BuildOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildOrchestrator")
            .field("mode", &self.builder.mode())
            .field("tasks", &self.tasks)
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

/// How a consumption loop ended.
#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Terminal,
    RecordGone,
    StreamEnded,
    Idle,
    StoreFailed,
}

/// The background half of one build.
struct BuildRun {
    uid: Uuid,
    store: Arc<SqliteStore>,
    builder: Arc<dyn ImageBuilder>,
    idle_timeout: Option<Duration>,
}

impl BuildRun {
    async fn execute(self, spec: BuildSpec, _guard: InFlightGuard) {
        let mut events = match self.builder.build(self.uid, &spec).await {
            Ok(events) => events,
            Err(e) => {
                error!(uid = %self.uid, error = %e, "build launch failed");
                self.fail(&format!("{e}\n")).await;
                return;
            }
        };

        match self.consume(&mut events).await {
            Outcome::Terminal | Outcome::StoreFailed => {}
            Outcome::RecordGone => {
                info!(uid = %self.uid, "record removed during build; no longer following it");
            }
            Outcome::StreamEnded if self.idle_timeout.is_none() => {
                warn!(uid = %self.uid, "build stream ended without a terminal event; record left building");
            }
            Outcome::StreamEnded => {
                self.fail("Build stream ended without a result.\n").await;
            }
            Outcome::Idle => {
                self.fail("Build produced no output within the idle timeout.\n").await;
            }
        }
    }

    async fn next_event(&self, events: &mut BuildEventStream) -> Option<Option<envhub_core::BuildEvent>> {
        let next = match self.idle_timeout {
            Some(window) => tokio::time::timeout(window, events.next()).await.ok()?,
            None => events.next().await,
        };
        Some(match next {
            Some(Ok(event)) => Some(event),
            Some(Err(e)) => {
                warn!(uid = %self.uid, error = %e, "build event stream failed");
                None
            }
            None => None,
        })
    }

    async fn consume(&self, events: &mut BuildEventStream) -> Outcome {
        loop {
            let event = match self.next_event(events).await {
                None => return Outcome::Idle,
                Some(None) => return Outcome::StreamEnded,
                Some(Some(event)) => event,
            };
            let applied = match &event.phase {
                BuildPhase::Log if event.message.is_empty() => continue,
                BuildPhase::Log => self.store.append_log(self.uid, &event.message).await,
                BuildPhase::Built => {
                    self.finish(&event.message, BuildStatus::Built, event.image_name.as_deref())
                        .await
                }
                BuildPhase::Failed => self.finish(&event.message, BuildStatus::Failed, None).await,
                BuildPhase::Unknown(phase) => {
                    debug!(uid = %self.uid, phase = %phase, "ignoring build event");
                    continue;
                }
            };
            match applied {
                Ok(true) if event.is_terminal() => {
                    info!(uid = %self.uid, phase = ?event.phase, image = ?event.image_name, "build finished");
                    return Outcome::Terminal;
                }
                Ok(true) => {}
                Ok(false) => return Outcome::RecordGone,
                Err(e) => {
                    error!(uid = %self.uid, error = %e, "failed to persist build progress");
                    return Outcome::StoreFailed;
                }
            }
        }
    }

    async fn finish(&self, message: &str, status: BuildStatus, name: Option<&str>) -> Result<bool, sqlx::Error> {
        if !message.is_empty() && !self.store.append_log(self.uid, message).await? {
            return Ok(false);
        }
        self.store.finish_build(self.uid, status, name).await
    }

    async fn fail(&self, reason: &str) {
        match self.finish(reason, BuildStatus::Failed, None).await {
            Ok(true) => info!(uid = %self.uid, reason = reason.trim_end(), "build marked failed"),
            Ok(false) => debug!(uid = %self.uid, "record gone or already finished"),
            Err(e) => error!(uid = %self.uid, error = %e, "failed to mark build failed"),
        }
    }
}

impl BuildOrchestrator {
    pub fn new(
        store: Arc<SqliteStore>,
        builder: Arc<dyn ImageBuilder>,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            store,
            builder,
            tasks: Arc::new(TaskManager::new()),
            idle_timeout,
        }
    }

    pub fn mode(&self) -> BuilderMode {
        self.builder.mode()
    }

    pub fn builds_in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Accept a build: validate, record it as `building`, start it in the
    /// background and return its uid.
    pub async fn submit(&self, form: BuildForm) -> Result<Uuid, ServerError> {
        let spec = form.validate(self.builder.requires_provider())?;

        let uid = Uuid::new_v4();
        self.store
            .insert_image(ImageRecord::building(uid, spec.image_name(), spec.meta()))
            .await?;
        let guard = self
            .tasks
            .register(uid)
            .ok_or_else(|| ServerError::Internal(format!("build {uid} already has a consumer")))?;
        info!(%uid, repo = %spec.repo, git_ref = %spec.checkout_ref(), mode = %self.mode(), "build accepted");

        let run = BuildRun {
            uid,
            store: Arc::clone(&self.store),
            builder: Arc::clone(&self.builder),
            idle_timeout: self.idle_timeout,
        };
        tokio::spawn(run.execute(spec, guard));
        Ok(uid)
    }

    /// Delete by record uid, by record name, or (plain mode) by image name.
    ///
    /// Deleting never cancels a running builder.
    pub async fn delete(&self, name: &str) -> Result<(), ServerError> {
        let record = match Uuid::parse_str(name) {
            Ok(uid) => self.store.get_image(uid).await?,
            Err(_) => None,
        };
        let record = match record {
            Some(record) => Some(record),
            None => self.store.find_image_by_name(name).await?,
        };

        if let Some(record) = record {
            return self.delete_record(record).await;
        }

        if self.builder.remove_image(name).await? {
            info!(image = name, "image removed");
            Ok(())
        } else {
            Err(ServerError::NotFound(format!("environment {name} not found")))
        }
    }

    async fn delete_record(&self, record: ImageRecord) -> Result<(), ServerError> {
        let removed = self.builder.remove_image(&record.name).await?;
        debug!(uid = %record.uid, image = %record.name, removed, "image removal attempted");
        if !self.store.delete_image(record.uid).await? {
            return Err(ServerError::NotFound(format!("environment {} not found", record.uid)));
        }
        info!(uid = %record.uid, image = %record.name, "environment deleted");
        Ok(())
    }

    /// All records, newest first.
    pub async fn records(&self) -> Result<Vec<ImageRecord>, ServerError> {
        Ok(self.store.list_images().await?)
    }

    /// Images and builds the runtime knows about, best-effort.
    pub async fn runtime_environments(&self) -> Vec<ImageDescriptor> {
        self.builder.list_runtime().await.unwrap_or_else(|e| {
            warn!(error = %e, "could not list runtime environments");
            Vec::new()
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{ScriptedBuilder, wait_for};
    use envhub_core::{BuildEvent, CoreError};
    use tracing_test::traced_test;

    fn form() -> BuildForm {
        BuildForm {
            repo: "https://github.com/org/proj".into(),
            git_ref: "main".into(),
            name: "proj".into(),
            memory: Some(String::new()),
            cpu: Some(String::new()),
            ..Default::default()
        }
    }

    async fn setup(mode: BuilderMode, idle: Option<Duration>) -> (Arc<SqliteStore>, Arc<ScriptedBuilder>, BuildOrchestrator) {
        let store = Arc::new(SqliteStore::memory().await);
        let builder = ScriptedBuilder::new(mode);
        let orchestrator = BuildOrchestrator::new(Arc::clone(&store), builder.clone(), idle);
        (store, builder, orchestrator)
    }

    fn terminal(r: Option<&ImageRecord>) -> bool {
        r.is_some_and(|r| r.status.is_terminal())
    }

    #[tokio::test]
    async fn accepts_before_the_build_completes() {
        let (store, builder, orchestrator) = setup(BuilderMode::Direct, None).await;
        let tx = builder.expect_build();

        let uid = orchestrator.submit(form()).await.unwrap();
        let record = store.get_image(uid).await.unwrap().unwrap();
        assert_eq!(record.status, BuildStatus::Building);
        assert_eq!(record.name, "proj:main");

        tx.unbounded_send(Ok(BuildEvent::log("Step 1/3\n"))).unwrap();
        tx.unbounded_send(Ok(BuildEvent::log("Step 2/3\n"))).unwrap();
        tx.unbounded_send(Ok(BuildEvent::built(Some("proj:main".into())))).unwrap();

        let record = wait_for(&store, uid, terminal).await.unwrap();
        assert_eq!(record.status, BuildStatus::Built);
        assert_eq!(record.log, "Step 1/3\nStep 2/3\n");
        wait_for(&store, uid, |_| orchestrator.builds_in_flight() == 0).await;
    }

    #[tokio::test]
    async fn success_renames_and_ignores_later_events() {
        let (store, builder, orchestrator) = setup(BuilderMode::Delegated, None).await;
        builder.script(vec![
            BuildEvent::log("fetching\n"),
            BuildEvent {
                phase: BuildPhase::Unknown("waiting".into()),
                message: "queued\n".into(),
                image_name: None,
            },
            BuildEvent::built(Some("registry/org-proj:abc123".into())),
            BuildEvent::log("after terminal\n"),
            BuildEvent::failed("too late"),
        ]);
        let uid = orchestrator
            .submit(BuildForm {
                provider: Some("gh".into()),
                ..form()
            })
            .await
            .unwrap();

        let record = wait_for(&store, uid, terminal).await.unwrap();
        assert_eq!(record.status, BuildStatus::Built);
        assert_eq!(record.name, "registry/org-proj:abc123");
        assert_eq!(record.log, "fetching\n");
    }

    #[tokio::test]
    async fn non_terminal_error_phase_is_ignored() {
        let (store, builder, orchestrator) = setup(BuilderMode::Delegated, None).await;
        builder.script(vec![
            BuildEvent::log("one\n"),
            BuildEvent::from_json(r#"{"phase":"error","message":"transient\n"}"#).unwrap(),
            BuildEvent::log("two\n"),
            BuildEvent::built(None),
        ]);
        let uid = orchestrator
            .submit(BuildForm {
                provider: Some("gh".into()),
                ..form()
            })
            .await
            .unwrap();

        let record = wait_for(&store, uid, terminal).await.unwrap();
        assert_eq!(record.status, BuildStatus::Built);
        assert_eq!(record.log, "one\ntwo\n");
    }

    #[tokio::test]
    async fn failure_is_terminal() {
        let (store, builder, orchestrator) = setup(BuilderMode::Direct, None).await;
        builder.script(vec![
            BuildEvent::log("Step 1\n"),
            BuildEvent::failed("builder exited with status 1\n"),
        ]);
        let uid = orchestrator.submit(form()).await.unwrap();
        let record = wait_for(&store, uid, terminal).await.unwrap();
        assert_eq!(record.status, BuildStatus::Failed);
        assert_eq!(record.name, "proj:main");
        assert_eq!(record.log, "Step 1\nbuilder exited with status 1\n");
    }

    #[tokio::test]
    async fn validation_failures_leave_no_record() {
        let (store, _builder, orchestrator) = setup(BuilderMode::Direct, None).await;
        let err = orchestrator
            .submit(BuildForm {
                memory: Some("abcde".into()),
                ..form()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::BadRequest(ref m) if m.contains("must be a number")));
        assert!(store.list_images().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_provider_in_delegated_mode_is_internal() {
        let (_store, _builder, orchestrator) = setup(BuilderMode::Delegated, None).await;
        let err = orchestrator.submit(form()).await.unwrap_err();
        assert!(matches!(err, ServerError::Internal(_)));
    }

    #[tokio::test]
    async fn silent_disconnect_leaves_record_building() {
        let (store, builder, orchestrator) = setup(BuilderMode::Direct, None).await;
        let tx = builder.expect_build();
        let uid = orchestrator.submit(form()).await.unwrap();
        tx.unbounded_send(Ok(BuildEvent::log("partial\n"))).unwrap();
        tx.unbounded_send(Err(CoreError::Delegated("connection reset".into())))
            .unwrap();
        drop(tx);

        wait_for(&store, uid, |_| orchestrator.builds_in_flight() == 0).await;
        let record = store.get_image(uid).await.unwrap().unwrap();
        assert_eq!(record.status, BuildStatus::Building);
        assert_eq!(record.log, "partial\n");
    }

    #[tokio::test]
    async fn idle_timeout_fails_quiet_builds() {
        let (store, builder, orchestrator) =
            setup(BuilderMode::Direct, Some(Duration::from_millis(50))).await;
        let tx = builder.expect_build();
        let uid = orchestrator.submit(form()).await.unwrap();
        tx.unbounded_send(Ok(BuildEvent::log("started\n"))).unwrap();

        let record = wait_for(&store, uid, terminal).await.unwrap();
        assert_eq!(record.status, BuildStatus::Failed);
        assert!(record.log.starts_with("started\n"));
        assert!(record.log.contains("idle timeout"));
        drop(tx);
    }

    #[tokio::test]
    async fn launch_failure_marks_record_failed() {
        let (store, _builder, orchestrator) = setup(BuilderMode::Direct, None).await;
        let uid = orchestrator.submit(form()).await.unwrap();
        let record = wait_for(&store, uid, terminal).await.unwrap();
        assert_eq!(record.status, BuildStatus::Failed);
        assert!(record.log.contains("launch failed"));
    }

    #[tokio::test]
    #[traced_test]
    async fn delete_by_uid_is_idempotent() {
        let (store, builder, orchestrator) = setup(BuilderMode::Direct, None).await;
        builder.script(vec![BuildEvent::built(None)]);
        let uid = orchestrator.submit(form()).await.unwrap();
        wait_for(&store, uid, terminal).await;
        builder.add_image("proj:main");

        orchestrator.delete(&uid.to_string()).await.unwrap();
        assert!(store.get_image(uid).await.unwrap().is_none());
        assert_eq!(builder.removed.lock().unwrap().as_slice(), ["proj:main"]);
        assert!(logs_contain("environment deleted"));

        let err = orchestrator.delete(&uid.to_string()).await.unwrap_err();
        assert!(matches!(err, ServerError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_falls_back_to_plain_image_names() {
        let (_store, builder, orchestrator) = setup(BuilderMode::Direct, None).await;
        builder.add_image("legacy:HEAD");
        orchestrator.delete("legacy:HEAD").await.unwrap();
        assert!(matches!(
            orchestrator.delete("legacy:HEAD").await,
            Err(ServerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn deleting_a_running_build_stops_following_it() {
        let (store, builder, orchestrator) = setup(BuilderMode::Direct, None).await;
        let tx = builder.expect_build();
        let uid = orchestrator.submit(form()).await.unwrap();
        tx.unbounded_send(Ok(BuildEvent::log("one\n"))).unwrap();
        wait_for(&store, uid, |r| r.is_some_and(|r| !r.log.is_empty())).await;

        orchestrator.delete(&uid.to_string()).await.unwrap();
        tx.unbounded_send(Ok(BuildEvent::log("two\n"))).unwrap();
        wait_for(&store, uid, |_| orchestrator.builds_in_flight() == 0).await;
        assert!(store.get_image(uid).await.unwrap().is_none());
    }
}
