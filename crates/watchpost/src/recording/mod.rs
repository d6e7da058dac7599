//! Motion episode recording
//!
//! A [`Recorder`] holds at most one open session. The session starts when
//! the alarm triggers, collects every processed frame, and closes once the
//! scene has been quiet for the configured window. The finished
//! [`Episode`] is handed back to the engine, which passes it to
//! [`ArtifactStore`] for encoding on a background task.

pub mod artifacts;

use chrono::{DateTime, Local};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::Frame;

pub use artifacts::{ArtifactConfig, ArtifactStore};

/// Quiet time after the last motion before a session closes
pub const QUIET_WINDOW: Duration = Duration::from_secs(1);

/// Frames kept per session (about two minutes at the default cycle rate)
pub const MAX_CLIP_FRAMES: usize = 3600;

/// Pixel bytes kept per session (about 290 frames at 640x480)
pub const MAX_CLIP_BYTES: usize = 256 * 1024 * 1024;

/// Recorder configuration.
///
/// A session stops buffering at whichever limit it reaches first.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub quiet_window: Duration,
    pub max_clip_frames: usize,
    pub max_clip_bytes: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            quiet_window: QUIET_WINDOW,
            max_clip_frames: MAX_CLIP_FRAMES,
            max_clip_bytes: MAX_CLIP_BYTES,
        }
    }
}

/// A finished recording session
#[derive(Debug, Clone)]
pub struct Episode {
    /// Frame captured at trigger time
    pub snapshot: Frame,
    /// Wall-clock trigger time, used to name artifacts
    pub started_at: DateTime<Local>,
    /// Frames in capture order
    pub frames: Vec<Frame>,
    /// Frames discarded after the session hit its frame or byte limit
    pub dropped: usize,
}

struct Session {
    snapshot: Frame,
    started_at: DateTime<Local>,
    opened: Instant,
    last_motion: Instant,
    frames: Vec<Frame>,
    bytes: usize,
    dropped: usize,
}

impl Session {
    fn finish(self) -> Episode {
        Episode {
            snapshot: self.snapshot,
            started_at: self.started_at,
            frames: self.frames,
            dropped: self.dropped,
        }
    }
}

/// Owner of the (single) open recording session
pub struct Recorder {
    config: RecorderConfig,
    session: Option<Session>,
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new(RecorderConfig::default())
    }
}

impl Recorder {
    pub fn new(config: RecorderConfig) -> Self {
        Self {
            config,
            session: None,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_some()
    }

    /// Start a session for a trigger.
    ///
    /// Returns `false` when a session is already open: the trigger is
    /// absorbed into it and only its motion time is refreshed.
    pub fn open(&mut self, snapshot: Frame, started_at: DateTime<Local>, now: Instant) -> bool {
        if let Some(session) = self.session.as_mut() {
            session.last_motion = now;
            debug!("Trigger absorbed by open recording session");
            return false;
        }

        info!(started_at = %started_at.format("%H:%M:%S"), "Recording started");
        self.session = Some(Session {
            snapshot,
            started_at,
            opened: now,
            last_motion: now,
            frames: Vec::new(),
            bytes: 0,
            dropped: 0,
        });
        true
    }

    /// Add one processed frame to the open session.
    ///
    /// Returns the finished episode when this cycle saw no motion and the
    /// quiet window has elapsed since the last motion.
    pub fn observe(&mut self, frame: Frame, motion: bool, now: Instant) -> Option<Episode> {
        let max_frames = self.config.max_clip_frames;
        let max_bytes = self.config.max_clip_bytes;
        let session = self.session.as_mut()?;

        let len = frame.pixels().len();
        if session.frames.len() < max_frames && session.bytes + len <= max_bytes {
            session.bytes += len;
            session.frames.push(frame);
        } else {
            if session.dropped == 0 {
                warn!(
                    max_frames,
                    max_bytes,
                    buffered = session.bytes,
                    "Recording reached its size limit, dropping further frames"
                );
            }
            session.dropped += 1;
        }

        if motion {
            session.last_motion = now;
            return None;
        }

        if now.duration_since(session.last_motion) < self.config.quiet_window {
            return None;
        }

        self.close("quiet")
    }

    /// Close the open session immediately (used on disarm)
    pub fn flush(&mut self) -> Option<Episode> {
        self.close("flushed")
    }

    fn close(&mut self, reason: &'static str) -> Option<Episode> {
        let session = self.session.take()?;
        info!(
            reason,
            frames = session.frames.len(),
            bytes = session.bytes,
            dropped = session.dropped,
            duration_ms = session.last_motion.duration_since(session.opened).as_millis() as u64,
            "Recording finished"
        );
        Some(session.finish())
    }
}
