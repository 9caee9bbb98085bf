//! Read-side log tailing.
//!
//! A tail session polls one build record at a fixed interval and yields the
//! log growth it observes. It never talks to the builder, so any number of
//! viewers can follow the same build, and dropping a session has no effect on
//! the build itself.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use envhub_core::BuildStatus;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use serde::Serialize;
use strum::Display;
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::entities::{ImageRecord, ImageStore, SqliteStore};
use crate::error::ServerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, ToSchema)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LogPhase {
    Log,
    Built,
    Error,
}

/// One server-sent event on a log stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct LogFrame {
    pub phase: LogPhase,
    pub message: String,
}

impl LogFrame {
    fn log(message: impl Into<String>) -> Self {
        Self {
            phase: LogPhase::Log,
            message: message.into(),
        }
    }
}

fn terminal_phase(status: BuildStatus) -> Option<LogPhase> {
    match status {
        BuildStatus::Building => None,
        BuildStatus::Built => Some(LogPhase::Built),
        BuildStatus::Failed => Some(LogPhase::Error),
    }
}

#[derive(Debug, Clone)]
pub struct LogTail {
    store: Arc<SqliteStore>,
    poll_interval: Duration,
    timeout: Duration,
}

struct TailState {
    store: Arc<SqliteStore>,
    uid: Uuid,
    offset: usize,
    interval: Duration,
    polls_left: u64,
    pending: VecDeque<LogFrame>,
    done: bool,
}

impl TailState {
    fn observe(&mut self, record: ImageRecord) {
        if let Some(grown) = record.log.get(self.offset..).filter(|s| !s.is_empty()) {
            self.pending.push_back(LogFrame::log(grown));
            self.offset = record.log.len();
        }
        if let Some(phase) = terminal_phase(record.status) {
            self.pending.push_back(LogFrame {
                phase,
                message: String::new(),
            });
            self.done = true;
        }
    }

    async fn step(mut self) -> Option<(LogFrame, Self)> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Some((frame, self));
            }
            if self.done {
                return None;
            }
            if self.polls_left == 0 {
                info!(uid = %self.uid, "log stream reached its time limit");
                return None;
            }
            tokio::time::sleep(self.interval).await;
            self.polls_left -= 1;
            match self.store.get_image(self.uid).await {
                Ok(Some(record)) => self.observe(record),
                Ok(None) => {
                    debug!(uid = %self.uid, "record deleted while streaming");
                    return None;
                }
                Err(e) => {
                    warn!(uid = %self.uid, error = %e, "log stream poll failed");
                    return None;
                }
            }
        }
    }
}

impl LogTail {
    pub fn new(store: Arc<SqliteStore>, poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            store,
            poll_interval,
            timeout,
        }
    }

    fn max_polls(&self) -> u64 {
        let interval = self.poll_interval.as_millis().max(1);
        (self.timeout.as_millis() / interval).max(1) as u64
    }

    /// Open a tail session on `uid`.
    ///
    /// A finished build yields a single frame with the full log and its
    /// terminal phase. A running build yields the log so far, then each
    /// observed growth, then an empty terminal frame once the build ends.
    pub async fn open(&self, uid: Uuid) -> Result<BoxStream<'static, LogFrame>, ServerError> {
        let record = self
            .store
            .get_image(uid)
            .await?
            .ok_or_else(|| ServerError::NotFound(format!("environment {uid} not found")))?;

        if let Some(phase) = terminal_phase(record.status) {
            let frame = LogFrame {
                phase,
                message: record.log,
            };
            return Ok(stream::once(async move { frame }).boxed());
        }

        let state = TailState {
            store: Arc::clone(&self.store),
            uid,
            offset: record.log.len(),
            interval: self.poll_interval,
            polls_left: self.max_polls(),
            pending: VecDeque::from([LogFrame::log(record.log)]),
            done: false,
        };
        Ok(stream::unfold(state, TailState::step).boxed())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use envhub_core::ImageMeta;

    async fn building(store: &SqliteStore) -> Uuid {
        let uid = Uuid::new_v4();
        store
            .insert_image(ImageRecord::building(uid, "proj:main".into(), ImageMeta::default()))
            .await
            .unwrap();
        uid
    }

    fn tail(store: &Arc<SqliteStore>, timeout: Duration) -> LogTail {
        LogTail::new(Arc::clone(store), Duration::from_millis(10), timeout)
    }

    #[tokio::test]
    async fn unknown_uid_is_not_found() {
        let store = Arc::new(SqliteStore::memory().await);
        let err = tail(&store, Duration::from_secs(1))
            .open(Uuid::new_v4())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ServerError::NotFound(_)));
    }

    #[tokio::test]
    async fn finished_build_yields_one_frame() {
        let store = Arc::new(SqliteStore::memory().await);
        let uid = building(&store).await;
        store.append_log(uid, "Step 1\n").await.unwrap();
        store.finish_build(uid, BuildStatus::Failed, None).await.unwrap();

        let frames: Vec<_> = tail(&store, Duration::from_secs(1))
            .open(uid)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(
            frames,
            vec![LogFrame {
                phase: LogPhase::Error,
                message: "Step 1\n".into()
            }]
        );
    }

    #[tokio::test]
    async fn running_build_streams_growth_then_terminal() {
        let store = Arc::new(SqliteStore::memory().await);
        let uid = building(&store).await;
        store.append_log(uid, "a\n").await.unwrap();

        let mut frames = tail(&store, Duration::from_secs(5)).open(uid).await.unwrap();
        assert_eq!(frames.next().await, Some(LogFrame::log("a\n")));

        store.append_log(uid, "b\n").await.unwrap();
        assert_eq!(frames.next().await, Some(LogFrame::log("b\n")));

        store.append_log(uid, "c\n").await.unwrap();
        store
            .finish_build(uid, BuildStatus::Built, Some("reg/proj:abc"))
            .await
            .unwrap();
        assert_eq!(frames.next().await, Some(LogFrame::log("c\n")));
        assert_eq!(
            frames.next().await,
            Some(LogFrame {
                phase: LogPhase::Built,
                message: String::new()
            })
        );
        assert_eq!(frames.next().await, None);
    }

    #[tokio::test]
    async fn stream_ends_at_the_time_limit() {
        let store = Arc::new(SqliteStore::memory().await);
        let uid = building(&store).await;
        let frames: Vec<_> = tail(&store, Duration::from_millis(50))
            .open(uid)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(frames, vec![LogFrame::log("")]);
    }

    #[tokio::test]
    async fn stream_ends_when_record_is_deleted() {
        let store = Arc::new(SqliteStore::memory().await);
        let uid = building(&store).await;
        let mut frames = tail(&store, Duration::from_secs(5)).open(uid).await.unwrap();
        assert!(frames.next().await.is_some());
        store.delete_image(uid).await.unwrap();
        assert_eq!(frames.next().await, None);
    }

    #[tokio::test]
    async fn concurrent_readers_agree() {
        let store = Arc::new(SqliteStore::memory().await);
        let uid = building(&store).await;
        let reader = tail(&store, Duration::from_secs(5));
        let first = reader.open(uid).await.unwrap();
        let second = reader.open(uid).await.unwrap();

        let writer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                for i in 0..5 {
                    store.append_log(uid, &format!("line {i}\n")).await.unwrap();
                    tokio::time::sleep(Duration::from_millis(7)).await;
                }
                store.finish_build(uid, BuildStatus::Built, None).await.unwrap();
            })
        };

        let (a, b): (Vec<LogFrame>, Vec<LogFrame>) = tokio::join!(first.collect(), second.collect());
        writer.await.unwrap();

        let fold = |frames: &[LogFrame]| -> (String, LogPhase) {
            let text = frames
                .iter()
                .filter(|f| f.phase == LogPhase::Log)
                .map(|f| f.message.as_str())
                .collect();
            (text, frames.last().unwrap().phase)
        };
        let expected: String = (0..5).map(|i| format!("line {i}\n")).collect();
        assert_eq!(fold(&a), (expected.clone(), LogPhase::Built));
        assert_eq!(fold(&b), (expected, LogPhase::Built));
    }
}
