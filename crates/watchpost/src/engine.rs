//! The alarm engine
//!
//! A single task owns every piece of alarm state: the frame source, the
//! baseline, the state machine, and the open recording session. It
//! interleaves capture ticks with requests from [`EngineHandle`]s, so each
//! tick and each request is applied as one unit and readers never observe
//! a half-updated state. Encoding and notification leave the task through
//! the [`Dispatcher`].

use chrono::{DateTime, Local, Timelike};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alarm::{AlarmState, AlarmStateMachine, AlarmStatus, CycleOutcome, TRIGGER_THRESHOLD};
use crate::capture::{FrameSource, ReleasedSource};
use crate::motion::{Baseline, DetectorConfig, MotionDetector, Region};
use crate::notify::{Dispatcher, SnapshotTask};
use crate::recording::{Recorder, RecorderConfig};
use crate::signal::AlarmSignal;
use crate::{CaptureError, DetectError, EngineError, Frame, Schedule, Settings};

/// Default capture cycle
pub const DEFAULT_CYCLE: Duration = Duration::from_millis(30);

/// Engine tuning
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capture/detect period
    pub cycle: Duration,
    pub detector: DetectorConfig,
    pub recorder: RecorderConfig,
    /// Debounce count that must be exceeded to trigger
    pub trigger_threshold: u32,
    /// Pending requests before handles wait
    pub request_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cycle: DEFAULT_CYCLE,
            detector: DetectorConfig::default(),
            recorder: RecorderConfig::default(),
            trigger_threshold: TRIGGER_THRESHOLD,
            request_buffer: 32,
        }
    }
}

/// Latest processed frame, for a display
#[derive(Debug, Clone)]
pub struct Preview {
    pub frame: Frame,
    /// Motion score, when detection ran this cycle
    pub score: Option<u64>,
    pub motion: bool,
    /// Regions to highlight (only with highlight or preview mode on)
    pub regions: Vec<Region>,
    pub state: AlarmState,
}

/// Answer to a status request
#[derive(Debug, Clone)]
pub struct EngineStatus {
    /// Wall-clock time the status was taken
    pub now: DateTime<Local>,
    pub alarm: AlarmStatus,
    pub counter: u32,
    pub recording: bool,
    pub source: String,
}

enum Request {
    Arm(oneshot::Sender<Result<(), EngineError>>),
    Disarm(oneshot::Sender<()>),
    Reset(oneshot::Sender<bool>),
    Status(oneshot::Sender<EngineStatus>),
    Schedule(oneshot::Sender<Schedule>),
    Settings(oneshot::Sender<Settings>),
    LastFrame(oneshot::Sender<Option<PathBuf>>),
    ApplySettings(Box<Settings>, oneshot::Sender<()>),
    ReplaceSource(Box<dyn FrameSource>, oneshot::Sender<()>),
    ReleaseSource(oneshot::Sender<()>),
}

/// Cloneable handle for talking to a running [`Engine`]
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Request>,
    preview: watch::Receiver<Option<Arc<Preview>>>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| EngineError::Closed)?;
        rx.await.map_err(|_| EngineError::Closed)
    }

    /// Arm, re-seeding the baseline from a fresh frame
    pub async fn arm(&self) -> Result<(), EngineError> {
        self.request(Request::Arm).await?
    }

    pub async fn disarm(&self) -> Result<(), EngineError> {
        self.request(Request::Disarm).await
    }

    /// Clear a triggered alarm. Returns whether the alarm was triggered.
    pub async fn reset(&self) -> Result<bool, EngineError> {
        self.request(Request::Reset).await
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.request(Request::Status).await
    }

    pub async fn schedule(&self) -> Result<Schedule, EngineError> {
        self.request(Request::Schedule).await
    }

    /// Settings the engine is currently running with
    pub async fn settings(&self) -> Result<Settings, EngineError> {
        self.request(Request::Settings).await
    }

    /// Dispatch the most recent snapshot. `None` if there is none yet.
    pub async fn send_last_frame(&self) -> Result<Option<PathBuf>, EngineError> {
        self.request(Request::LastFrame).await
    }

    /// Apply new settings at the next request boundary.
    ///
    /// Resolution and camera changes need a new source; see
    /// [`EngineHandle::replace_source`].
    pub async fn apply_settings(&self, settings: Settings) -> Result<(), EngineError> {
        self.request(|tx| Request::ApplySettings(Box::new(settings), tx))
            .await
    }

    /// Swap the frame source; the baseline is re-seeded on the next cycle
    pub async fn replace_source<S>(&self, source: S) -> Result<(), EngineError>
    where
        S: FrameSource + 'static,
    {
        self.request(|tx| Request::ReplaceSource(Box::new(source), tx))
            .await
    }

    /// Drop the current source and wait until it is gone.
    ///
    /// Frees the capture device so it can be reopened with other settings.
    /// Captures fail until [`EngineHandle::replace_source`] installs a new
    /// source.
    pub async fn release_source(&self) -> Result<(), EngineError> {
        self.request(Request::ReleaseSource).await
    }

    /// Latest processed frame; `None` until the first capture
    pub fn subscribe_preview(&self) -> watch::Receiver<Option<Arc<Preview>>> {
        self.preview.clone()
    }
}

/// Owner of all alarm state; run it with [`Engine::run`]
pub struct Engine {
    config: EngineConfig,
    settings: Settings,
    source: Box<dyn FrameSource>,
    detector: MotionDetector,
    alarm: AlarmStateMachine,
    baseline: Option<Baseline>,
    recorder: Recorder,
    pending_snapshot: Option<SnapshotTask>,
    dispatcher: Dispatcher,
    signal: Arc<dyn AlarmSignal>,
    requests: mpsc::Receiver<Request>,
    preview_tx: watch::Sender<Option<Arc<Preview>>>,
    capture_failing: bool,
}

impl Engine {
    pub fn new<S>(
        config: EngineConfig,
        settings: Settings,
        source: S,
        dispatcher: Dispatcher,
        signal: Arc<dyn AlarmSignal>,
    ) -> (Self, EngineHandle)
    where
        S: FrameSource + 'static,
    {
        let (tx, requests) = mpsc::channel(config.request_buffer.max(1));
        let (preview_tx, preview) = watch::channel(None);

        let engine = Self {
            detector: MotionDetector::new(config.detector.clone()),
            alarm: AlarmStateMachine::with_threshold(config.trigger_threshold),
            recorder: Recorder::new(config.recorder.clone()),
            config,
            settings,
            source: Box::new(source),
            baseline: None,
            pending_snapshot: None,
            dispatcher,
            signal,
            requests,
            preview_tx,
            capture_failing: false,
        };

        (engine, EngineHandle { tx, preview })
    }

    /// Run until `cancel` fires
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.cycle);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut requests_open = true;

        info!(
            source = %self.source.describe(),
            cycle_ms = self.config.cycle.as_millis() as u64,
            sensitivity = self.settings.sensitivity,
            "Engine started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Engine shutting down");
                    break;
                }

                request = self.requests.recv(), if requests_open => match request {
                    Some(request) => self.handle(request),
                    None => {
                        debug!("All engine handles dropped");
                        requests_open = false;
                    }
                },

                _ = interval.tick() => self.cycle().await,
            }
        }

        self.shutdown();
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::Arm(reply) => {
                let _ = reply.send(self.arm());
            }
            Request::Disarm(reply) => {
                self.disarm();
                let _ = reply.send(());
            }
            Request::Reset(reply) => {
                let _ = reply.send(self.reset());
            }
            Request::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Request::Schedule(reply) => {
                let _ = reply.send(self.settings.schedule);
            }
            Request::Settings(reply) => {
                let _ = reply.send(self.settings.clone());
            }
            Request::LastFrame(reply) => {
                let path = self.dispatcher.last_frame();
                if path.is_none() {
                    info!("No motion frame recorded yet");
                }
                let _ = reply.send(path);
            }
            Request::ApplySettings(settings, reply) => {
                self.apply_settings(*settings);
                let _ = reply.send(());
            }
            Request::ReplaceSource(source, reply) => {
                info!(
                    old = %self.source.describe(),
                    new = %source.describe(),
                    "Frame source replaced"
                );
                let old = std::mem::replace(&mut self.source, source);
                self.baseline = None;
                self.capture_failing = false;
                retire(old, None);
                let _ = reply.send(());
            }
            Request::ReleaseSource(reply) => {
                let placeholder: Box<dyn FrameSource> =
                    Box::new(ReleasedSource::new(self.source.resolution()));
                let old = std::mem::replace(&mut self.source, placeholder);
                info!(source = %old.describe(), "Frame source released");
                self.baseline = None;
                // Captures fail quietly until a new source arrives
                self.capture_failing = true;
                retire(old, Some(reply));
            }
        }
    }

    fn arm(&mut self) -> Result<(), EngineError> {
        let frame = self.source.capture().map_err(|e| {
            warn!("Cannot arm: {}", e);
            e
        })?;
        let baseline = self
            .detector
            .baseline(&frame)
            .map_err(|e| CaptureError::Malformed(e.to_string()))?;

        if self.alarm.arm() == AlarmState::Triggered {
            self.signal.stop();
        }
        self.baseline = Some(baseline);
        info!("System armed");
        Ok(())
    }

    fn disarm(&mut self) {
        let previous = self.alarm.disarm();
        self.signal.stop();
        self.flush_recording();
        if previous.is_armed() {
            info!("System disarmed");
        } else {
            debug!("Disarm requested while already disarmed");
        }
    }

    fn reset(&mut self) -> bool {
        let reset = self.alarm.reset();
        if reset {
            self.signal.stop();
            info!("Alarm reset");
        } else {
            debug!(state = %self.alarm.state(), "Reset ignored, alarm not triggered");
        }
        reset
    }

    fn status(&self) -> EngineStatus {
        let now = Local::now();
        EngineStatus {
            now,
            alarm: self.alarm.status(&self.settings.schedule, now.hour() as u8),
            counter: self.alarm.counter(),
            recording: self.recorder.is_recording(),
            source: self.source.describe(),
        }
    }

    fn apply_settings(&mut self, settings: Settings) {
        if settings.resolution != self.settings.resolution
            || settings.camera_index != self.settings.camera_index
        {
            info!(
                resolution = %settings.resolution,
                camera = settings.camera_index,
                "Capture settings changed, source must be replaced to take effect"
            );
        }
        if settings.preview_mode != self.settings.preview_mode {
            info!(enabled = settings.preview_mode, "Preview mode changed");
        }
        info!(
            sensitivity = settings.sensitivity,
            arm = settings.schedule.arm,
            disarm = settings.schedule.disarm,
            highlight = settings.show_motion_highlight,
            "Settings applied"
        );
        self.settings = settings;
    }

    async fn cycle(&mut self) {
        let frame = match self.source.capture() {
            Ok(frame) => {
                if self.capture_failing {
                    info!("Capture recovered");
                    self.capture_failing = false;
                }
                frame
            }
            Err(e) => {
                if !self.capture_failing {
                    warn!("Skipping cycles, capture failed: {}", e);
                    self.capture_failing = true;
                }
                return;
            }
        };

        let detecting = self.alarm.state().is_armed() || self.settings.preview_mode;
        if !detecting {
            self.baseline = None;
            self.publish(frame, None, false, Vec::new());
            return;
        }

        let Some(baseline) = self.baseline.take() else {
            self.reseed(&frame);
            self.publish(frame, None, false, Vec::new());
            return;
        };

        let with_regions = self.settings.show_motion_highlight || self.settings.preview_mode;
        let detector = self.detector.clone();
        let current = frame.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let result = detector.detect(&current, &baseline, with_regions);
            (result, baseline)
        })
        .await;

        let detection = match outcome {
            Ok((Ok(detection), _)) => detection,
            Ok((Err(DetectError::MismatchedBaseline { baseline, frame: got }), _)) => {
                warn!(%baseline, frame = %got, "Baseline does not match frame, re-seeding");
                self.reseed(&frame);
                return;
            }
            Ok((Err(e), baseline)) => {
                warn!("Detection skipped: {}", e);
                self.baseline = Some(baseline);
                return;
            }
            Err(e) => {
                warn!("Detection task failed: {}", e);
                return;
            }
        };

        let motion = detection.exceeds(self.settings.sensitivity);
        self.baseline = Some(detection.baseline);
        if motion {
            debug!(
                score = detection.score,
                counter = self.alarm.counter(),
                "Motion above sensitivity"
            );
        }

        let now = Instant::now();
        if self.alarm.on_cycle(motion) == CycleOutcome::Triggered {
            self.on_trigger(&frame, now);
        }

        if let Some(episode) = self.recorder.observe(frame.clone(), motion, now) {
            self.dispatcher
                .episode(episode, self.pending_snapshot.take());
        }

        self.publish(frame, Some(detection.score), motion, detection.regions);
    }

    fn on_trigger(&mut self, frame: &Frame, now: Instant) {
        let at = Local::now();
        warn!(
            at = %at.format("%Y-%m-%d %H:%M:%S"),
            counter = self.alarm.counter(),
            "Alarm triggered"
        );
        self.signal.start();

        if self.recorder.open(frame.clone(), at, now) {
            self.pending_snapshot = Some(self.dispatcher.alert(frame.clone(), at));
        }
    }

    fn reseed(&mut self, frame: &Frame) {
        match self.detector.baseline(frame) {
            Ok(baseline) => {
                debug!(resolution = %frame.resolution(), "Baseline seeded");
                self.baseline = Some(baseline);
            }
            Err(e) => warn!("Cannot seed baseline: {}", e),
        }
    }

    fn flush_recording(&mut self) {
        if let Some(episode) = self.recorder.flush() {
            self.dispatcher
                .episode(episode, self.pending_snapshot.take());
        }
    }

    fn publish(&self, frame: Frame, score: Option<u64>, motion: bool, regions: Vec<Region>) {
        self.preview_tx.send_replace(Some(Arc::new(Preview {
            frame,
            score,
            motion,
            regions,
            state: self.alarm.state(),
        })));
    }

    fn shutdown(&mut self) {
        self.flush_recording();
        self.signal.stop();
        info!(source = %self.source.describe(), "Engine stopped, releasing source");
    }
}

/// Drop a source on the blocking pool; device sources wait for their
/// capture process to exit. `done` fires once it is gone.
fn retire(source: Box<dyn FrameSource>, done: Option<oneshot::Sender<()>>) {
    let dropped = tokio::task::spawn_blocking(move || drop(source));
    if let Some(done) = done {
        tokio::spawn(async move {
            if let Err(e) = dropped.await {
                warn!("Releasing frame source failed: {}", e);
            }
            let _ = done.send(());
        });
    }
}
