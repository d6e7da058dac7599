//! Frame sources
//!
//! A [`FrameSource`] hands the engine the most recent frame on demand. The
//! engine owns exactly one source at a time and can swap it at runtime
//! (camera change, resolution change).
//!
//! - [`DeviceSource`]: V4L2 camera read through an `ffmpeg` child process
//! - [`SyntheticSource`]: generated frames for development and tests
//! - [`ReleasedSource`]: stand-in while the device is handed back

pub mod video;

#[cfg(feature = "test-source")]
pub mod test_source;

use crate::{CaptureError, Frame, Resolution};

/// Something that can produce frames on demand.
///
/// `capture` must not block for longer than it takes to copy out an
/// already-available frame; sources that talk to hardware do the blocking
/// reads on their own thread.
pub trait FrameSource: Send {
    /// Resolution frames are delivered at
    fn resolution(&self) -> Resolution;

    /// Return the latest frame, or `CaptureError::Unavailable` if there is
    /// none right now.
    fn capture(&mut self) -> Result<Frame, CaptureError>;

    /// Short description for logs
    fn describe(&self) -> String;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn resolution(&self) -> Resolution {
        (**self).resolution()
    }

    fn capture(&mut self) -> Result<Frame, CaptureError> {
        (**self).capture()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Holds the engine's place after its source was released.
///
/// Every capture fails until a real source is installed again.
#[derive(Debug, Clone)]
pub struct ReleasedSource {
    resolution: Resolution,
}

impl ReleasedSource {
    pub fn new(resolution: Resolution) -> Self {
        Self { resolution }
    }
}

impl FrameSource for ReleasedSource {
    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn capture(&mut self) -> Result<Frame, CaptureError> {
        Err(CaptureError::Unavailable("source released".to_string()))
    }

    fn describe(&self) -> String {
        format!("released ({})", self.resolution)
    }
}

pub use video::{device_path, list_devices, DeviceSource, VideoCaptureConfig};

#[cfg(feature = "test-source")]
pub use test_source::{SyntheticControl, SyntheticSource};
