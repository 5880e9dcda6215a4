//! Semi-Global Matching stereo disparity engine
//!
//! Turns a rectified left/right grayscale pair into a per-pixel disparity map
//! by aggregating matching costs along up to 16 one-dimensional paths with a
//! dynamic-programming recurrence, then selecting and validating the winning
//! disparity per pixel. Optional post-passes refine the winner to sub-pixel
//! precision and extract a per-pixel confidence score. A hierarchical
//! mutual-information variant bootstraps a data-driven cost model across an
//! image pyramid.

use image::GrayImage;

pub mod aggregation;
pub mod census;
pub mod config;
pub mod cost;
pub mod mutual_information;
pub mod parallel;
pub mod pipeline;
pub mod pyramid;
pub mod selector;
pub mod tensor;

pub use aggregation::*;
pub use config::*;
pub use cost::*;
pub use mutual_information::*;
pub use pipeline::*;
pub use pyramid::*;
pub use selector::*;
pub use tensor::*;

pub type Result<T> = std::result::Result<T, SgmError>;

#[derive(Debug, thiserror::Error)]
pub enum SgmError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),
}

/// Integer disparity output. One `u8` per pixel holding a disparity index in
/// `[0, disparity_range)` where index 0 corresponds to `disparity_min`, or
/// the sentinel `disparity_range` for pixels with no valid match.
#[derive(Debug, Clone)]
pub struct DisparityImage {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
    pub disparity_min: usize,
    pub disparity_range: usize,
}

impl DisparityImage {
    pub fn new(width: usize, height: usize, disparity_min: usize, disparity_range: usize) -> Self {
        Self {
            data: vec![disparity_range as u8; width * height],
            width,
            height,
            disparity_min,
            disparity_range,
        }
    }

    /// Sentinel value marking a pixel with no valid disparity.
    #[inline]
    pub fn invalid(&self) -> u8 {
        self.disparity_range as u8
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.width + x]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: u8) {
        self.data[y * self.width + x] = value;
    }

    #[inline]
    pub fn is_valid(&self, x: usize, y: usize) -> bool {
        self.get(x, y) < self.disparity_range as u8
    }

    /// Fraction of pixels holding a valid disparity.
    pub fn valid_fraction(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        let valid = self
            .data
            .iter()
            .filter(|&&d| d < self.disparity_range as u8)
            .count();
        valid as f32 / self.data.len() as f32
    }

    /// Convert to a grayscale image for visualization. Valid disparities are
    /// stretched over the full gray range, invalid pixels map to 0.
    pub fn to_image(&self) -> GrayImage {
        let mut img = GrayImage::new(self.width as u32, self.height as u32);
        let range = self.disparity_range.max(1) as f32;

        for y in 0..self.height {
            for x in 0..self.width {
                let d = self.get(x, y);
                let gray = if d < self.disparity_range as u8 {
                    (d as f32 / range * 255.0) as u8
                } else {
                    0
                };
                img.put_pixel(x as u32, y as u32, image::Luma([gray]));
            }
        }

        img
    }
}

/// Sub-pixel refined disparity. One `f32` per pixel holding a disparity
/// index relative to `disparity_min`; `NaN` marks invalid pixels.
#[derive(Debug, Clone)]
pub struct DisparityMap {
    pub data: Vec<f32>,
    pub width: usize,
    pub height: usize,
    pub disparity_min: usize,
    pub disparity_range: usize,
}

impl DisparityMap {
    pub fn new(width: usize, height: usize, disparity_min: usize, disparity_range: usize) -> Self {
        Self {
            data: vec![f32::NAN; width * height],
            width,
            height,
            disparity_min,
            disparity_range,
        }
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: f32) {
        self.data[y * self.width + x] = value;
    }

    /// Absolute disparity in pixels, with the minimum-disparity offset folded
    /// back in. `None` for invalid pixels.
    pub fn absolute(&self, x: usize, y: usize) -> Option<f32> {
        let v = self.get(x, y);
        if v.is_nan() {
            None
        } else {
            Some(v + self.disparity_min as f32)
        }
    }
}

/// Per-pixel confidence score: the aggregated cost at the winning disparity,
/// `NaN` where no valid disparity was found. Lower is better.
#[derive(Debug, Clone)]
pub struct ScoreMap {
    pub data: Vec<f32>,
    pub width: usize,
    pub height: usize,
}

impl ScoreMap {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            data: vec![f32::NAN; width * height],
            width,
            height,
        }
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }
}
