//! In-process builder and helpers shared by the server's unit tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use envhub_core::{
    BuildEvent, BuildEventStream, BuildSpec, BuilderMode, CoreError, ImageBuilder, ImageDescriptor,
};
use futures::StreamExt;
use futures::channel::mpsc;
use uuid::Uuid;

use crate::config::Config;
use crate::entities::{ImageRecord, ImageStore, SqliteStore};
use crate::state::AppState;

pub type EventSender = mpsc::UnboundedSender<Result<BuildEvent, CoreError>>;

/// A builder whose events are pushed by the test through a channel.
pub struct ScriptedBuilder {
    mode: BuilderMode,
    pending: Mutex<Vec<mpsc::UnboundedReceiver<Result<BuildEvent, CoreError>>>>,
    pub launched: Mutex<Vec<(Uuid, BuildSpec)>>,
    pub removed: Mutex<Vec<String>>,
    pub known_images: Mutex<Vec<String>>,
    pub runtime: Mutex<Vec<ImageDescriptor>>,
}

impl ScriptedBuilder {
    pub fn new(mode: BuilderMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            pending: Mutex::new(Vec::new()),
            launched: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            known_images: Mutex::new(Vec::new()),
            runtime: Mutex::new(Vec::new()),
        })
    }

    /// Queue the event channel for the next build and return its sender.
    pub fn expect_build(&self) -> EventSender {
        let (tx, rx) = mpsc::unbounded();
        self.pending.lock().unwrap().insert(0, rx);
        tx
    }

    /// Queue a build that emits `events` and then closes.
    pub fn script(&self, events: Vec<BuildEvent>) {
        let tx = self.expect_build();
        for event in events {
            tx.unbounded_send(Ok(event)).unwrap();
        }
    }

    pub fn add_image(&self, name: &str) {
        self.known_images.lock().unwrap().push(name.to_owned());
    }
}

#[async_trait]
impl ImageBuilder for ScriptedBuilder {
    fn mode(&self) -> BuilderMode {
        self.mode
    }

    async fn build(&self, uid: Uuid, spec: &BuildSpec) -> Result<BuildEventStream, CoreError> {
        let rx = self
            .pending
            .lock()
            .unwrap()
            .pop()
            .ok_or_else(|| CoreError::LaunchFailed("no scripted build".into()))?;
        self.launched.lock().unwrap().push((uid, spec.clone()));
        Ok(rx.boxed())
    }

    async fn remove_image(&self, name: &str) -> Result<bool, CoreError> {
        self.removed.lock().unwrap().push(name.to_owned());
        let mut images = self.known_images.lock().unwrap();
        let before = images.len();
        images.retain(|n| n != name);
        Ok(images.len() != before)
    }

    async fn list_runtime(&self) -> Result<Vec<ImageDescriptor>, CoreError> {
        Ok(self.runtime.lock().unwrap().clone())
    }
}

/// Poll the store until `done` holds for the record, or panic after 5s.
pub async fn wait_for(
    store: &SqliteStore,
    uid: Uuid,
    done: impl Fn(Option<&ImageRecord>) -> bool,
) -> Option<ImageRecord> {
    for _ in 0..500 {
        let record = store.get_image(uid).await.unwrap();
        if done(record.as_ref()) {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("record {uid} never reached the expected state");
}

/// Router over an in-memory store and a scripted builder.
pub async fn test_app(mode: BuilderMode) -> (axum::Router, Arc<AppState>, Arc<ScriptedBuilder>) {
    test_app_with(mode, Config {
        log_poll_interval: Duration::from_millis(10),
        ..Config::default()
    })
    .await
}

pub async fn test_app_with(
    mode: BuilderMode,
    config: Config,
) -> (axum::Router, Arc<AppState>, Arc<ScriptedBuilder>) {
    let builder = ScriptedBuilder::new(mode);
    let state = Arc::new(AppState::new(config, SqliteStore::memory().await, builder.clone()));
    (crate::routes::build(Arc::clone(&state)), state, builder)
}
