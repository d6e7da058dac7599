//! Synthetic frame source (no camera hardware)
//!
//! Produces a flat grey scene. When motion is switched on, a bright block
//! hops between two positions on every capture so consecutive frames differ.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::FrameSource;
use crate::{CaptureError, Frame, Resolution};

const BACKGROUND: u8 = 96;
const BLOCK: u8 = 240;

#[derive(Debug)]
struct ControlState {
    motion: AtomicBool,
    available: AtomicBool,
    released: AtomicBool,
    captures: AtomicU64,
}

/// Remote control for a [`SyntheticSource`] that has been handed to the engine
#[derive(Debug, Clone)]
pub struct SyntheticControl {
    state: Arc<ControlState>,
}

impl SyntheticControl {
    /// Turn the moving block on or off
    pub fn set_motion(&self, motion: bool) {
        self.state.motion.store(motion, Ordering::Relaxed);
    }

    /// Simulate the device dropping out
    pub fn set_available(&self, available: bool) {
        self.state.available.store(available, Ordering::Relaxed);
    }

    /// Number of frames produced so far
    pub fn captures(&self) -> u64 {
        self.state.captures.load(Ordering::Relaxed)
    }

    /// Whether the source has been dropped
    pub fn is_released(&self) -> bool {
        self.state.released.load(Ordering::Acquire)
    }
}

/// Generated frames at a fixed resolution
pub struct SyntheticSource {
    resolution: Resolution,
    state: Arc<ControlState>,
}

impl SyntheticSource {
    pub fn new(resolution: Resolution) -> (Self, SyntheticControl) {
        let state = Arc::new(ControlState {
            motion: AtomicBool::new(false),
            available: AtomicBool::new(true),
            released: AtomicBool::new(false),
            captures: AtomicU64::new(0),
        });
        let source = Self {
            resolution,
            state: state.clone(),
        };
        (source, SyntheticControl { state })
    }

    fn render(&self, n: u64, motion: bool) -> Vec<u8> {
        let Resolution { width, height } = self.resolution;
        let mut data = vec![BACKGROUND; self.resolution.rgb_len()];
        if !motion {
            return data;
        }

        let block_w = (width / 4).max(1);
        let block_h = (height / 4).max(1);
        let x0 = if n % 2 == 0 { width / 8 } else { width * 5 / 8 };
        let y0 = height / 8;

        for y in y0..(y0 + block_h).min(height) {
            for x in x0..(x0 + block_w).min(width) {
                let i = ((y * width + x) * 3) as usize;
                data[i..i + 3].copy_from_slice(&[BLOCK, BLOCK, BLOCK]);
            }
        }
        data
    }
}

impl FrameSource for SyntheticSource {
    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn capture(&mut self) -> Result<Frame, CaptureError> {
        if !self.state.available.load(Ordering::Relaxed) {
            return Err(CaptureError::Unavailable(
                "synthetic source switched off".to_string(),
            ));
        }
        let n = self.state.captures.fetch_add(1, Ordering::Relaxed);
        let motion = self.state.motion.load(Ordering::Relaxed);
        Frame::rgb(self.resolution, Bytes::from(self.render(n, motion)))
    }

    fn describe(&self) -> String {
        format!("synthetic ({})", self.resolution)
    }
}

impl Drop for SyntheticSource {
    fn drop(&mut self) {
        self.state.released.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn still_scene_repeats() {
        let (mut source, _control) = SyntheticSource::new(Resolution::new(16, 8));
        let a = source.capture().unwrap();
        let b = source.capture().unwrap();
        assert_eq!(a.pixels(), b.pixels());
    }

    #[test]
    fn motion_changes_consecutive_frames() {
        let (mut source, control) = SyntheticSource::new(Resolution::new(16, 8));
        control.set_motion(true);
        let a = source.capture().unwrap();
        let b = source.capture().unwrap();
        assert_ne!(a.pixels(), b.pixels());
        assert_eq!(control.captures(), 2);
    }

    #[test]
    fn unavailable_source_errors() {
        let (mut source, control) = SyntheticSource::new(Resolution::new(16, 8));
        control.set_available(false);
        assert!(matches!(
            source.capture(),
            Err(CaptureError::Unavailable(_))
        ));
        control.set_available(true);
        assert!(source.capture().is_ok());
    }
}
