//! Frame-difference motion detector
//!
//! Each frame is resized to a fixed working width, converted to intensity
//! and blurred. The score is the sum of the binary-thresholded absolute
//! difference against the baseline (255 per changed pixel). The detector
//! keeps no memory of its own: the processed frame is handed back as the
//! next baseline and the caller stores it.

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};
use imageproc::region_labelling::{connected_components, Connectivity};
use std::collections::HashMap;

use crate::{DetectError, Frame, Resolution};

/// Width frames are scaled to before comparison
pub const WORKING_WIDTH: u32 = 500;
/// Intensity difference a pixel must exceed to count as changed
pub const PIXEL_THRESHOLD: u8 = 25;
/// Minimum changed-pixel area for a reported region
pub const MIN_REGION_AREA: u32 = 500;
/// Gaussian sigma matching a 5x5 kernel
pub const BLUR_SIGMA: f32 = 1.1;

/// Value a changed pixel contributes to the score
const CHANGED: u8 = 255;

/// Detector tuning
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Width frames are resized to (aspect ratio preserved)
    pub working_width: u32,
    /// Gaussian blur sigma; 0 disables blurring
    pub blur_sigma: f32,
    /// Per-pixel intensity cutoff
    pub pixel_threshold: u8,
    /// Minimum region area in working-image pixels
    pub min_region_area: u32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            working_width: WORKING_WIDTH,
            blur_sigma: BLUR_SIGMA,
            pixel_threshold: PIXEL_THRESHOLD,
            min_region_area: MIN_REGION_AREA,
        }
    }
}

/// Processed reference frame
#[derive(Debug, Clone)]
pub struct Baseline {
    source: Resolution,
    image: GrayImage,
}

impl Baseline {
    /// Resolution of the frame this baseline was derived from
    pub fn source_resolution(&self) -> Resolution {
        self.source
    }

    /// Dimensions of the processed image
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// Axis-aligned box around a changed area, in source-frame pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Changed pixels in the working image
    pub area: u32,
}

/// Result of comparing one frame against the baseline
#[derive(Debug, Clone)]
pub struct Detection {
    /// Sum of thresholded differences
    pub score: u64,
    /// Changed regions; empty unless requested
    pub regions: Vec<Region>,
    /// The processed current frame, to become the next baseline
    pub baseline: Baseline,
}

impl Detection {
    /// Whether this cycle counts as motion (strictly above sensitivity)
    pub fn exceeds(&self, sensitivity: u64) -> bool {
        self.score > sensitivity
    }
}

/// Stateless comparator between a frame and a baseline
#[derive(Debug, Clone, Default)]
pub struct MotionDetector {
    config: DetectorConfig,
}

impl MotionDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    /// Build a baseline from a frame (used when arming and when re-seeding)
    pub fn baseline(&self, frame: &Frame) -> Result<Baseline, DetectError> {
        Ok(Baseline {
            source: frame.resolution(),
            image: self.preprocess(frame)?,
        })
    }

    /// Compare `frame` against `baseline`.
    ///
    /// Regions are only extracted when `with_regions` is set; the score does
    /// not depend on them.
    pub fn detect(
        &self,
        frame: &Frame,
        baseline: &Baseline,
        with_regions: bool,
    ) -> Result<Detection, DetectError> {
        if frame.resolution() != baseline.source {
            return Err(DetectError::MismatchedBaseline {
                baseline: baseline.source,
                frame: frame.resolution(),
            });
        }

        let current = self.preprocess(frame)?;
        if current.dimensions() != baseline.image.dimensions() {
            return Err(DetectError::MismatchedBaseline {
                baseline: baseline.source,
                frame: frame.resolution(),
            });
        }

        let (score, mask) = threshold_diff(&current, &baseline.image, self.config.pixel_threshold);

        let regions = if with_regions && score > 0 {
            extract_regions(&mask, self.config.min_region_area, frame.resolution())
        } else {
            Vec::new()
        };

        Ok(Detection {
            score,
            regions,
            baseline: Baseline {
                source: frame.resolution(),
                image: current,
            },
        })
    }

    fn preprocess(&self, frame: &Frame) -> Result<GrayImage, DetectError> {
        let view = frame.as_image().ok_or(DetectError::Unreadable)?;
        let gray = imageops::grayscale(&view);

        let (w, h) = working_size(frame.resolution(), self.config.working_width);
        let resized = if (w, h) == gray.dimensions() {
            gray
        } else {
            imageops::resize(&gray, w, h, FilterType::Triangle)
        };

        if self.config.blur_sigma > 0.0 {
            Ok(imageproc::filter::gaussian_blur_f32(
                &resized,
                self.config.blur_sigma,
            ))
        } else {
            Ok(resized)
        }
    }
}

/// Working-image size for a source resolution
fn working_size(source: Resolution, working_width: u32) -> (u32, u32) {
    if working_width == 0 || source.width == working_width {
        return (source.width, source.height);
    }
    let height = (source.height as u64 * working_width as u64 / source.width as u64).max(1);
    (working_width, height as u32)
}

/// Absolute difference, binary threshold, and sum
fn threshold_diff(current: &GrayImage, baseline: &GrayImage, cutoff: u8) -> (u64, GrayImage) {
    let (w, h) = current.dimensions();
    let mut mask = GrayImage::new(w, h);
    let mut score = 0u64;

    for ((out, a), b) in mask
        .pixels_mut()
        .zip(current.pixels())
        .zip(baseline.pixels())
    {
        if a.0[0].abs_diff(b.0[0]) > cutoff {
            *out = Luma([CHANGED]);
            score += CHANGED as u64;
        }
    }

    (score, mask)
}

#[derive(Debug, Clone, Copy)]
struct Bounds {
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
    area: u32,
}

/// Connected components of the mask above `min_area`, scaled to `source`
fn extract_regions(mask: &GrayImage, min_area: u32, source: Resolution) -> Vec<Region> {
    let labels = connected_components(mask, Connectivity::Eight, Luma([0u8]));

    let mut bounds: HashMap<u32, Bounds> = HashMap::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let label = label.0[0];
        if label == 0 {
            continue;
        }
        bounds
            .entry(label)
            .and_modify(|b| {
                b.min_x = b.min_x.min(x);
                b.min_y = b.min_y.min(y);
                b.max_x = b.max_x.max(x);
                b.max_y = b.max_y.max(y);
                b.area += 1;
            })
            .or_insert(Bounds {
                min_x: x,
                min_y: y,
                max_x: x,
                max_y: y,
                area: 1,
            });
    }

    let (mask_w, mask_h) = mask.dimensions();
    let sx = source.width as f64 / mask_w as f64;
    let sy = source.height as f64 / mask_h as f64;

    let mut regions: Vec<Region> = bounds
        .into_values()
        .filter(|b| b.area > min_area)
        .map(|b| Region {
            x: (b.min_x as f64 * sx) as u32,
            y: (b.min_y as f64 * sy) as u32,
            width: (((b.max_x - b.min_x + 1) as f64) * sx).round() as u32,
            height: (((b.max_y - b.min_y + 1) as f64) * sy).round() as u32,
            area: b.area,
        })
        .collect();

    regions.sort_by(|a, b| b.area.cmp(&a.area));
    regions
}
