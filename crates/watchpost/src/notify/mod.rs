//! Outbound notifications
//!
//! A [`NotificationSink`] delivers alerts somewhere (log, webhook, email).
//! The engine never talks to a sink directly: it hands frames and finished
//! episodes to the [`Dispatcher`], which encodes artifacts and calls the
//! sink on tracked background tasks. Failures are logged there and never
//! reach the capture loop.

pub mod email;
pub mod webhook;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::recording::{ArtifactStore, Episode};
use crate::{EncodeError, Frame, NotifyError};

pub use email::{EmailConfig, EmailSink};
pub use webhook::{WebhookConfig, WebhookSink};

/// Destination for alarm notifications
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Motion just triggered the alarm
    async fn send_alert(&self, snapshot: &Path, at: DateTime<Local>) -> Result<(), NotifyError>;

    /// A recording session finished. `snapshot` is `None` when it could
    /// not be written; the clip is delivered anyway.
    async fn send_episode(&self, snapshot: Option<&Path>, clip: &Path) -> Result<(), NotifyError>;

    /// The most recent motion snapshot, on request
    async fn send_last_frame(&self, snapshot: &Path) -> Result<(), NotifyError>;
}

/// Writes notifications to the log only
#[derive(Debug, Default, Clone)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn send_alert(&self, snapshot: &Path, at: DateTime<Local>) -> Result<(), NotifyError> {
        warn!(
            at = %at.format("%Y-%m-%d %H:%M:%S"),
            snapshot = %snapshot.display(),
            "Motion detected"
        );
        Ok(())
    }

    async fn send_episode(&self, snapshot: Option<&Path>, clip: &Path) -> Result<(), NotifyError> {
        info!(
            snapshot = ?snapshot,
            clip = %clip.display(),
            "Security event recorded"
        );
        Ok(())
    }

    async fn send_last_frame(&self, snapshot: &Path) -> Result<(), NotifyError> {
        info!(snapshot = %snapshot.display(), "Last detected motion");
        Ok(())
    }
}

/// Sends every notification to each inner sink
pub struct FanoutSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }

    fn collect(&self, results: Vec<(&str, Result<(), NotifyError>)>) -> Result<(), NotifyError> {
        let mut failed = Vec::new();
        for (name, result) in results {
            if let Err(e) = result {
                warn!(sink = name, "Notification failed: {}", e);
                failed.push(name.to_string());
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(NotifyError::Rejected(format!(
                "{} of {} sinks failed: {}",
                failed.len(),
                self.sinks.len(),
                failed.join(", ")
            )))
        }
    }
}

#[async_trait]
impl NotificationSink for FanoutSink {
    fn name(&self) -> &str {
        "fanout"
    }

    async fn send_alert(&self, snapshot: &Path, at: DateTime<Local>) -> Result<(), NotifyError> {
        let mut results = Vec::with_capacity(self.sinks.len());
        for sink in &self.sinks {
            results.push((sink.name(), sink.send_alert(snapshot, at).await));
        }
        self.collect(results)
    }

    async fn send_episode(&self, snapshot: Option<&Path>, clip: &Path) -> Result<(), NotifyError> {
        let mut results = Vec::with_capacity(self.sinks.len());
        for sink in &self.sinks {
            results.push((sink.name(), sink.send_episode(snapshot, clip).await));
        }
        self.collect(results)
    }

    async fn send_last_frame(&self, snapshot: &Path) -> Result<(), NotifyError> {
        let mut results = Vec::with_capacity(self.sinks.len());
        for sink in &self.sinks {
            results.push((sink.name(), sink.send_last_frame(snapshot).await));
        }
        self.collect(results)
    }
}

/// A notification as delivered to a [`MemorySink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Alert { snapshot: PathBuf, at: DateTime<Local> },
    Episode { snapshot: Option<PathBuf>, clip: PathBuf },
    LastFrame { snapshot: PathBuf },
}

/// Keeps delivered notifications in memory (embedding and tests)
#[derive(Debug, Default)]
pub struct MemorySink {
    sent: Mutex<Vec<Notification>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything delivered so far, in order
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn push(&self, notification: Notification) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(notification);
        }
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn send_alert(&self, snapshot: &Path, at: DateTime<Local>) -> Result<(), NotifyError> {
        self.push(Notification::Alert {
            snapshot: snapshot.to_path_buf(),
            at,
        });
        Ok(())
    }

    async fn send_episode(&self, snapshot: Option<&Path>, clip: &Path) -> Result<(), NotifyError> {
        self.push(Notification::Episode {
            snapshot: snapshot.map(Path::to_path_buf),
            clip: clip.to_path_buf(),
        });
        Ok(())
    }

    async fn send_last_frame(&self, snapshot: &Path) -> Result<(), NotifyError> {
        self.push(Notification::LastFrame {
            snapshot: snapshot.to_path_buf(),
        });
        Ok(())
    }
}

/// Handle to the pending snapshot of a trigger
pub type SnapshotTask = JoinHandle<Option<PathBuf>>;

/// Runs artifact encoding and sink calls as tracked, fire-and-forget tasks
#[derive(Clone)]
pub struct Dispatcher {
    sink: Arc<dyn NotificationSink>,
    artifacts: Arc<ArtifactStore>,
    tracker: TaskTracker,
}

impl Dispatcher {
    pub fn new(
        sink: Arc<dyn NotificationSink>,
        artifacts: Arc<ArtifactStore>,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            sink,
            artifacts,
            tracker,
        }
    }

    /// Write the trigger snapshot and send the immediate alert.
    ///
    /// The returned task resolves to the snapshot path once it is on disk
    /// (or `None` if encoding failed), so the episode can reuse it.
    pub fn alert(&self, frame: Frame, at: DateTime<Local>) -> SnapshotTask {
        let sink = self.sink.clone();
        let artifacts = self.artifacts.clone();

        self.tracker.spawn(async move {
            let path = match write_snapshot(artifacts, frame, at).await {
                Ok(path) => path,
                Err(e) => {
                    error!("Failed to write snapshot: {}", e);
                    return None;
                }
            };

            match sink.send_alert(&path, at).await {
                Ok(()) => debug!(sink = sink.name(), "Alert delivered"),
                Err(e) => error!(sink = sink.name(), "Failed to send alert: {}", e),
            }
            Some(path)
        })
    }

    /// Encode the episode clip and send it with the trigger snapshot.
    ///
    /// `snapshot` is the task returned by [`Dispatcher::alert`] for this
    /// episode; without one the snapshot is written here. A missing
    /// snapshot does not hold back the clip.
    pub fn episode(&self, episode: Episode, snapshot: Option<SnapshotTask>) -> JoinHandle<()> {
        let sink = self.sink.clone();
        let artifacts = self.artifacts.clone();

        self.tracker.spawn(async move {
            let snapshot_path = match snapshot {
                Some(task) => task.await.ok().flatten(),
                None => write_snapshot(artifacts.clone(), episode.snapshot.clone(), episode.started_at)
                    .await
                    .map_err(|e| error!("Failed to write snapshot: {}", e))
                    .ok(),
            };

            let started_at = episode.started_at;
            let frames = episode.frames;
            let clip = tokio::task::spawn_blocking({
                let artifacts = artifacts.clone();
                move || artifacts.write_clip(&frames, &started_at)
            })
            .await
            .map_err(|e| EncodeError::Task(e.to_string()))
            .and_then(|result| result);

            let clip_path = match clip {
                Ok(path) => path,
                Err(e) => {
                    error!("Failed to write clip: {}", e);
                    return;
                }
            };

            if snapshot_path.is_none() {
                warn!(clip = %clip_path.display(), "Episode snapshot missing, sending clip alone");
            }

            match sink.send_episode(snapshot_path.as_deref(), &clip_path).await {
                Ok(()) => info!(sink = sink.name(), "Episode delivered"),
                Err(e) => error!(sink = sink.name(), "Failed to send episode: {}", e),
            }
        })
    }

    /// Send the most recent snapshot. Returns its path, or `None` when no
    /// snapshot has been written yet.
    pub fn last_frame(&self) -> Option<PathBuf> {
        let path = self.artifacts.last_snapshot()?;
        let sink = self.sink.clone();
        let task_path = path.clone();

        self.tracker.spawn(async move {
            if let Err(e) = sink.send_last_frame(&task_path).await {
                error!(sink = sink.name(), "Failed to send last frame: {}", e);
            }
        });
        Some(path)
    }
}

async fn write_snapshot(
    artifacts: Arc<ArtifactStore>,
    frame: Frame,
    at: DateTime<Local>,
) -> Result<PathBuf, EncodeError> {
    tokio::task::spawn_blocking(move || artifacts.write_snapshot(&frame, &at))
        .await
        .map_err(|e| EncodeError::Task(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::ArtifactConfig;
    use crate::Resolution;
    use bytes::Bytes;

    struct FailingSink;

    #[async_trait]
    impl NotificationSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        async fn send_alert(&self, _: &Path, _: DateTime<Local>) -> Result<(), NotifyError> {
            Err(NotifyError::Rejected("down".into()))
        }

        async fn send_episode(&self, _: Option<&Path>, _: &Path) -> Result<(), NotifyError> {
            Err(NotifyError::Rejected("down".into()))
        }

        async fn send_last_frame(&self, _: &Path) -> Result<(), NotifyError> {
            Err(NotifyError::Rejected("down".into()))
        }
    }

    fn frame(value: u8) -> Frame {
        let res = Resolution::new(16, 12);
        Frame::rgb(res, Bytes::from(vec![value; res.rgb_len()])).unwrap()
    }

    fn dispatcher(dir: &Path, sink: Arc<dyn NotificationSink>) -> (Dispatcher, TaskTracker) {
        let artifacts = ArtifactStore::new(ArtifactConfig {
            dir: dir.to_path_buf(),
            ..Default::default()
        })
        .unwrap();
        let tracker = TaskTracker::new();
        (
            Dispatcher::new(sink, Arc::new(artifacts), tracker.clone()),
            tracker,
        )
    }

    fn episode(at: DateTime<Local>) -> Episode {
        Episode {
            snapshot: frame(200),
            started_at: at,
            frames: vec![frame(1), frame(2), frame(3)],
            dropped: 0,
        }
    }

    #[tokio::test]
    async fn alert_then_episode_share_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemorySink::new());
        let (dispatcher, _tracker) = dispatcher(dir.path(), sink.clone());
        let at = Local::now();

        let snapshot = dispatcher.alert(frame(200), at);
        dispatcher
            .episode(episode(at), Some(snapshot))
            .await
            .unwrap();

        let sent = sink.sent();
        assert_eq!(sent.len(), 2);
        let Notification::Alert { snapshot: alert_snap, .. } = &sent[0] else {
            panic!("expected alert first, got {:?}", sent[0]);
        };
        let Notification::Episode { snapshot, clip } = &sent[1] else {
            panic!("expected episode, got {:?}", sent[1]);
        };
        assert_eq!(snapshot.as_ref(), Some(alert_snap));
        assert!(alert_snap.exists());
        assert!(clip.exists());
    }

    #[tokio::test]
    async fn episode_without_alert_writes_its_own_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemorySink::new());
        let (dispatcher, _tracker) = dispatcher(dir.path(), sink.clone());

        dispatcher.episode(episode(Local::now()), None).await.unwrap();
        assert!(matches!(sink.sent().as_slice(), [Notification::Episode { .. }]));
    }

    #[tokio::test]
    async fn episode_without_snapshot_still_delivers_clip() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemorySink::new());
        let (dispatcher, _tracker) = dispatcher(dir.path(), sink.clone());

        // The trigger's snapshot task came back empty
        let failed: SnapshotTask = tokio::spawn(async { None });
        dispatcher
            .episode(episode(Local::now()), Some(failed))
            .await
            .unwrap();

        let sent = sink.sent();
        let [Notification::Episode { snapshot: None, clip }] = sent.as_slice() else {
            panic!("expected a clip-only episode, got {:?}", sent);
        };
        assert!(clip.exists());
    }

    #[tokio::test]
    async fn empty_episode_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemorySink::new());
        let (dispatcher, _tracker) = dispatcher(dir.path(), sink.clone());

        let mut ep = episode(Local::now());
        ep.frames.clear();
        dispatcher.episode(ep, None).await.unwrap();
        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn sink_failures_stay_in_the_task() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, tracker) = dispatcher(dir.path(), Arc::new(FailingSink));
        let at = Local::now();

        let path = dispatcher.alert(frame(9), at).await.unwrap();
        assert!(path.is_some());
        dispatcher.episode(episode(at), None).await.unwrap();

        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn last_frame_needs_a_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemorySink::new());
        let (dispatcher, tracker) = dispatcher(dir.path(), sink.clone());
        assert!(dispatcher.last_frame().is_none());

        let written = dispatcher.alert(frame(5), Local::now()).await.unwrap().unwrap();
        assert_eq!(dispatcher.last_frame(), Some(written.clone()));

        tracker.close();
        tracker.wait().await;
        assert_eq!(
            sink.sent().last(),
            Some(&Notification::LastFrame { snapshot: written })
        );
    }

    #[tokio::test]
    async fn fanout_reports_partial_failure() {
        let memory = Arc::new(MemorySink::new());
        let fanout = FanoutSink::new(vec![memory.clone(), Arc::new(FailingSink)]);

        let err = fanout
            .send_last_frame(Path::new("/tmp/x.jpg"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("1 of 2"));
        assert_eq!(memory.sent().len(), 1);
    }
}
