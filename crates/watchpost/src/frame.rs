//! Frame types for captured video

use bytes::Bytes;
use image::{ImageBuffer, Rgb};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::CaptureError;

/// Frame dimensions in pixels.
///
/// Serialized as a `[width, height]` pair, the shape `settings.json` uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[u32; 2]", into = "[u32; 2]")]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Total number of pixels
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Size in bytes of one packed RGB24 frame at this resolution
    pub fn rgb_len(&self) -> usize {
        self.pixels() as usize * 3
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::new(640, 480)
    }
}

impl From<[u32; 2]> for Resolution {
    fn from([width, height]: [u32; 2]) -> Self {
        Self { width, height }
    }
}

impl From<Resolution> for [u32; 2] {
    fn from(r: Resolution) -> Self {
        [r.width, r.height]
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A single captured video frame.
///
/// Pixels are packed RGB24, row-major, `width * height * 3` bytes. The
/// payload is reference counted so a frame can be handed to the recorder,
/// the preview channel and an encoder task without copying.
#[derive(Debug, Clone)]
pub struct Frame {
    resolution: Resolution,
    timestamp_us: u64,
    pixels: Bytes,
}

impl Frame {
    /// Wrap a packed RGB24 buffer, checking its length against the resolution.
    pub fn rgb(resolution: Resolution, pixels: Bytes) -> Result<Self, CaptureError> {
        if resolution.width == 0 || resolution.height == 0 {
            return Err(CaptureError::Malformed(format!(
                "zero-sized resolution {}",
                resolution
            )));
        }
        if pixels.len() != resolution.rgb_len() {
            return Err(CaptureError::Malformed(format!(
                "expected {} bytes for {}, got {}",
                resolution.rgb_len(),
                resolution,
                pixels.len()
            )));
        }
        Ok(Self {
            resolution,
            timestamp_us: now_us(),
            pixels,
        })
    }

    /// Set the timestamp and return self (builder pattern)
    pub fn with_timestamp(mut self, timestamp_us: u64) -> Self {
        self.timestamp_us = timestamp_us;
        self
    }

    /// Frame dimensions
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Capture time in microseconds since the Unix epoch
    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }

    /// Packed RGB24 pixels
    pub fn pixels(&self) -> &Bytes {
        &self.pixels
    }

    /// Borrow the pixels as an image view without copying.
    ///
    /// Returns `None` only if the buffer no longer matches the resolution,
    /// which `Frame::rgb` rules out.
    pub fn as_image(&self) -> Option<ImageBuffer<Rgb<u8>, &[u8]>> {
        ImageBuffer::from_raw(
            self.resolution.width,
            self.resolution.height,
            self.pixels.as_ref(),
        )
    }
}

/// Current wall-clock time in microseconds since the Unix epoch
pub(crate) fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
