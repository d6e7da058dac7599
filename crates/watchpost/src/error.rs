//! Error types for each stage of the pipeline.
//!
//! Every per-cycle and per-request error is recovered locally by the
//! engine or server; only startup failures reach `main`.

use std::path::PathBuf;
use thiserror::Error;

use crate::Resolution;

/// Failure to obtain a frame from a source.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// The device produced no frame (or only a stale one) this cycle.
    #[error("capture unavailable: {0}")]
    Unavailable(String),

    /// A buffer that does not describe a valid frame.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// The capture device could not be opened.
    #[error("failed to open capture device: {0}")]
    Open(#[source] std::io::Error),
}

/// Failure comparing a frame against the baseline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DetectError {
    /// Frame and baseline come from different resolutions; re-seed.
    #[error("baseline was taken at {baseline}, frame is {frame}")]
    MismatchedBaseline {
        baseline: Resolution,
        frame: Resolution,
    },

    /// The frame buffer could not be viewed as an image.
    #[error("frame buffer does not match its resolution")]
    Unreadable,
}

/// Failure writing a snapshot or clip artifact.
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("artifact I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("nothing to encode: {0}")]
    Empty(&'static str),

    #[error("encoder task failed: {0}")]
    Task(String),
}

/// Failure delivering a notification. Logged, never propagated to the engine.
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("HTTP delivery failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("SMTP delivery failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    #[error("failed to read artifact {path:?}: {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("notification rejected: {0}")]
    Rejected(String),
}

/// Failure reported by the engine to a handle.
#[derive(Error, Debug)]
pub enum EngineError {
    /// No frame was available to seed the baseline; state unchanged.
    #[error("could not capture a frame to seed the baseline: {0}")]
    CaptureUnavailable(#[from] CaptureError),

    /// The engine task has stopped.
    #[error("engine is not running")]
    Closed,
}

/// Invalid settings or settings file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("settings I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid setting: {0}")]
    Invalid(String),
}
