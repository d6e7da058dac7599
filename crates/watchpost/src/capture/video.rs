//! Camera capture through ffmpeg
//!
//! Spawns `ffmpeg` reading a V4L2 device and writing raw RGB24 frames to
//! stdout. A blocking reader task slices stdout into frames and publishes
//! the newest one on a watch channel, so `capture()` never waits on the
//! device.

use bytes::Bytes;
use std::io::{ErrorKind, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

use super::FrameSource;
use crate::frame::now_us;
use crate::{CaptureError, Frame, Resolution};

/// Highest device index probed by [`list_devices`]
const MAX_DEVICE_INDEX: u32 = 10;

/// Path of the V4L2 device node for a camera index
pub fn device_path(index: u32) -> PathBuf {
    PathBuf::from(format!("/dev/video{}", index))
}

/// Camera indices whose device node exists
pub fn list_devices() -> Vec<u32> {
    (0..MAX_DEVICE_INDEX)
        .filter(|i| device_path(*i).exists())
        .collect()
}

/// Device capture configuration
#[derive(Debug, Clone)]
pub struct VideoCaptureConfig {
    /// Camera index (`/dev/video{index}`)
    pub device_index: u32,
    /// Output resolution; ffmpeg scales if the device negotiates another
    pub resolution: Resolution,
    /// Requested device frame rate
    pub fps: u32,
    /// Frames older than this are treated as unavailable
    pub stale_after: Duration,
    /// ffmpeg executable
    pub program: String,
}

impl Default for VideoCaptureConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            resolution: Resolution::default(),
            fps: 30,
            stale_after: Duration::from_secs(2),
            program: "ffmpeg".to_string(),
        }
    }
}

impl VideoCaptureConfig {
    pub fn for_device(device_index: u32, resolution: Resolution) -> Self {
        Self {
            device_index,
            resolution,
            ..Default::default()
        }
    }

    fn args(&self) -> Vec<String> {
        let size = format!("{}x{}", self.resolution.width, self.resolution.height);
        vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-f".to_string(),
            "v4l2".to_string(),
            "-framerate".to_string(),
            self.fps.to_string(),
            "-video_size".to_string(),
            size.clone(),
            "-i".to_string(),
            device_path(self.device_index).display().to_string(),
            "-f".to_string(),
            "rawvideo".to_string(),
            "-pix_fmt".to_string(),
            "rgb24".to_string(),
            "-s".to_string(),
            size,
            "-".to_string(), // Output to stdout
        ]
    }
}

/// Handle to a running device capture process
pub struct DeviceSource {
    child: Option<Child>,
    config: VideoCaptureConfig,
    latest: watch::Receiver<Option<Frame>>,
}

impl DeviceSource {
    /// Start capturing from the configured device.
    ///
    /// Must be called from within a tokio runtime; the stdout reader runs
    /// on the blocking pool.
    pub fn open(config: VideoCaptureConfig) -> Result<Self, CaptureError> {
        let args = config.args();
        info!(
            "Starting {} for {}: {} @ {}fps",
            config.program,
            device_path(config.device_index).display(),
            config.resolution,
            config.fps
        );
        debug!("{} args: {:?}", config.program, args);

        let mut child = Command::new(&config.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(CaptureError::Open)?;

        let stdout = child.stdout.take().ok_or_else(|| {
            CaptureError::Unavailable(format!("no stdout from {}", config.program))
        })?;

        let (tx, latest) = watch::channel(None);
        let resolution = config.resolution;
        tokio::task::spawn_blocking(move || {
            read_frames(stdout, tx, resolution);
        });

        Ok(Self {
            child: Some(child),
            config,
            latest,
        })
    }

    /// Wait until the first frame arrives, failing after `timeout`.
    pub async fn wait_for_first_frame(&mut self, timeout: Duration) -> Result<(), CaptureError> {
        let waited = tokio::time::timeout(timeout, self.latest.wait_for(|f| f.is_some())).await;
        match waited {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(CaptureError::Unavailable(
                "capture process exited before producing a frame".to_string(),
            )),
            Err(_) => Err(CaptureError::Unavailable(format!(
                "no frame within {:.1}s",
                timeout.as_secs_f64()
            ))),
        }
    }

    /// Stop capture and clean up
    pub fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            info!(
                "Stopping capture on {}",
                device_path(self.config.device_index).display()
            );
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl FrameSource for DeviceSource {
    fn resolution(&self) -> Resolution {
        self.config.resolution
    }

    fn capture(&mut self) -> Result<Frame, CaptureError> {
        if self.latest.has_changed().is_err() {
            return Err(CaptureError::Unavailable(
                "capture process has exited".to_string(),
            ));
        }

        let frame = self
            .latest
            .borrow_and_update()
            .clone()
            .ok_or_else(|| CaptureError::Unavailable("no frame received yet".to_string()))?;

        let age_us = now_us().saturating_sub(frame.timestamp_us());
        if age_us > self.config.stale_after.as_micros() as u64 {
            return Err(CaptureError::Unavailable(format!(
                "latest frame is {:.1}s old",
                age_us as f64 / 1_000_000.0
            )));
        }

        Ok(frame)
    }

    fn describe(&self) -> String {
        format!(
            "{} ({})",
            device_path(self.config.device_index).display(),
            self.config.resolution
        )
    }
}

impl Drop for DeviceSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Slice a raw RGB24 stream into frames and publish the newest one
fn read_frames<R: Read>(mut reader: R, tx: watch::Sender<Option<Frame>>, resolution: Resolution) {
    let frame_len = resolution.rgb_len();
    let mut frame_count = 0u64;

    loop {
        let mut buf = vec![0u8; frame_len];
        match reader.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                info!("Capture stream ended (EOF)");
                break;
            }
            Err(e) => {
                error!("Error reading capture stream: {}", e);
                break;
            }
        }

        let frame = match Frame::rgb(resolution, Bytes::from(buf)) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Dropping capture frame: {}", e);
                continue;
            }
        };

        frame_count += 1;
        if frame_count % 300 == 0 {
            debug!("Capture: {} frames read", frame_count);
        }

        if tx.send(Some(frame)).is_err() {
            info!("Frame receiver dropped, stopping capture reader");
            break;
        }
    }

    info!("Capture reader finished after {} frames", frame_count);
}
