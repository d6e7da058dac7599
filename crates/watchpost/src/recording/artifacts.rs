//! Snapshot and clip files
//!
//! Snapshots are JPEG, clips are looping animated GIF at a fixed frame
//! rate. Both are named from the trigger time
//! (`motion_YYYYmmdd_HHMMSS.{jpg,gif}`). Encoding is blocking and meant to
//! run on the blocking pool.

use chrono::{DateTime, Local};
use image::codecs::gif::{GifEncoder, Repeat};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{Delay, ExtendedColorType, Frame as GifFrame, RgbImage};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{EncodeError, Frame};

/// Artifact output configuration
#[derive(Debug, Clone)]
pub struct ArtifactConfig {
    /// Directory snapshots and clips are written to
    pub dir: PathBuf,
    /// Clip playback rate
    pub clip_fps: u32,
    /// Clips wider than this are scaled down (0 keeps source width)
    pub clip_width: u32,
    /// GIF quantizer speed, 1 (best) to 30 (fastest)
    pub gif_speed: i32,
    pub jpeg_quality: u8,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            clip_fps: 20,
            clip_width: 500,
            gif_speed: 30,
            jpeg_quality: 90,
        }
    }
}

/// Writes artifacts and remembers the newest snapshot
#[derive(Debug)]
pub struct ArtifactStore {
    config: ArtifactConfig,
    last_snapshot: Mutex<Option<PathBuf>>,
}

impl ArtifactStore {
    /// Create the store, making the output directory if needed
    pub fn new(config: ArtifactConfig) -> Result<Self, EncodeError> {
        fs::create_dir_all(&config.dir).map_err(|source| EncodeError::Io {
            path: config.dir.clone(),
            source,
        })?;
        info!("Artifacts will be written to {:?}", config.dir);
        Ok(Self {
            config,
            last_snapshot: Mutex::new(None),
        })
    }

    pub fn snapshot_path(&self, at: &DateTime<Local>) -> PathBuf {
        self.config
            .dir
            .join(format!("motion_{}.jpg", at.format("%Y%m%d_%H%M%S")))
    }

    pub fn clip_path(&self, at: &DateTime<Local>) -> PathBuf {
        self.config
            .dir
            .join(format!("motion_{}.gif", at.format("%Y%m%d_%H%M%S")))
    }

    /// Most recent snapshot written successfully
    pub fn last_snapshot(&self) -> Option<PathBuf> {
        self.last_snapshot
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
    }

    /// Encode `frame` as the snapshot for `at`
    pub fn write_snapshot(&self, frame: &Frame, at: &DateTime<Local>) -> Result<PathBuf, EncodeError> {
        let path = self.snapshot_path(at);
        let res = frame.resolution();

        let mut writer = create(&path)?;
        JpegEncoder::new_with_quality(&mut writer, self.config.jpeg_quality).encode(
            frame.pixels(),
            res.width,
            res.height,
            ExtendedColorType::Rgb8,
        )?;
        finish(writer, &path)?;

        debug!("Snapshot written to {:?}", path);
        if let Ok(mut last) = self.last_snapshot.lock() {
            *last = Some(path.clone());
        }
        Ok(path)
    }

    /// Encode `frames` as the looping clip for `at`.
    ///
    /// Frames whose resolution differs from the first one (source swapped
    /// mid-episode) are skipped.
    pub fn write_clip(&self, frames: &[Frame], at: &DateTime<Local>) -> Result<PathBuf, EncodeError> {
        let first = frames.first().ok_or(EncodeError::Empty("clip has no frames"))?;
        let res = first.resolution();
        let path = self.clip_path(at);

        let target = if self.config.clip_width > 0 && res.width > self.config.clip_width {
            let height =
                (res.height as u64 * self.config.clip_width as u64 / res.width as u64).max(1);
            Some((self.config.clip_width, height as u32))
        } else {
            None
        };

        let delay = Delay::from_numer_denom_ms(1000, self.config.clip_fps.max(1));
        let mut writer = create(&path)?;
        let mut skipped = 0usize;
        {
            let mut encoder = GifEncoder::new_with_speed(&mut writer, self.config.gif_speed);
            encoder.set_repeat(Repeat::Infinite)?;

            for frame in frames {
                if frame.resolution() != res {
                    skipped += 1;
                    continue;
                }
                let Some(rgb) = RgbImage::from_raw(res.width, res.height, frame.pixels().to_vec())
                else {
                    skipped += 1;
                    continue;
                };
                let rgb = match target {
                    Some((w, h)) => imageops::resize(&rgb, w, h, FilterType::Triangle),
                    None => rgb,
                };
                let rgba = image::DynamicImage::ImageRgb8(rgb).into_rgba8();
                encoder.encode_frame(GifFrame::from_parts(rgba, 0, 0, delay))?;
            }
        }
        finish(writer, &path)?;

        if skipped > 0 {
            warn!(skipped, "Clip frames with a different resolution were skipped");
        }
        info!(
            frames = frames.len() - skipped,
            fps = self.config.clip_fps,
            "Clip written to {:?}",
            path
        );
        Ok(path)
    }
}

fn create(path: &Path) -> Result<BufWriter<File>, EncodeError> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(|source| EncodeError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn finish(mut writer: BufWriter<File>, path: &Path) -> Result<(), EncodeError> {
    writer.flush().map_err(|source| EncodeError::Io {
        path: path.to_path_buf(),
        source,
    })
}
