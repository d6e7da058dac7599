//! Watchpost - motion-triggered camera alarm engine
//!
//! The crate is organised leaves first:
//!
//! - **Core types**: [`Frame`], [`Resolution`], [`Settings`], error taxonomy
//! - **`capture`**: frame sources (ffmpeg-backed device, synthetic test source)
//! - **`motion`**: baseline/diff motion detector
//! - **`alarm`**: arming state machine with debounce and schedule lookup
//! - **`recording`**: episode buffer and snapshot/clip artifacts
//! - **`notify`**: notification sinks and the fire-and-forget dispatcher
//! - **`signal`**: audible alarm signal
//! - **`engine`**: the single task that owns all alarm state
//! - **`command`** / **`server`**: plain-text command protocol over TCP

mod config;
mod error;
mod frame;

pub use config::{
    Schedule, ScheduleAction, ScheduleChange, Settings, SettingsStore, DEFAULT_SENSITIVITY,
};
pub use error::{CaptureError, ConfigError, DetectError, EncodeError, EngineError, NotifyError};
pub use frame::{Frame, Resolution};

pub mod alarm;
pub mod capture;
pub mod command;
pub mod engine;
pub mod motion;
pub mod notify;
pub mod recording;
pub mod server;
pub mod signal;
