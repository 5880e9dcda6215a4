//! Matching-cost volume builders.
//!
//! Each builder fills the cost tensor with a per-pixel, per-disparity match
//! cost in `[0, MAX_COST]`. The aggregation and selection stages make no
//! assumption about how the cost was computed, only that lower is better and
//! that entries whose right-image column falls outside the image are set to
//! `MAX_COST`.

use image::GrayImage;
use rayon::prelude::*;
use wide::f32x8;

use crate::census::{census_transform_5x5, hamming, CENSUS_BITS_5X5};
use crate::tensor::{CostTensor, MAX_COST};
use crate::{Result, SgmError};

/// Strategy interface for filling the cost tensor. Implementations are
/// interchangeable and selected at pipeline construction time.
pub trait CostVolumeBuilder {
    /// Sets the disparity search window.
    fn configure(&mut self, disparity_min: usize, disparity_range: usize);

    /// Fills every `(y, x, d)` entry of `out`, reshaping it to match the
    /// input images and the configured window.
    fn process(&mut self, left: &GrayImage, right: &GrayImage, out: &mut CostTensor)
        -> Result<()>;
}

/// Validates that the rectified pair has equal, non-zero dimensions.
pub(crate) fn check_input_pair(left: &GrayImage, right: &GrayImage) -> Result<(usize, usize)> {
    if left.width() != right.width() || left.height() != right.height() {
        return Err(SgmError::DimensionMismatch(format!(
            "left and right images must have the same shape, got {}x{} and {}x{}",
            left.width(),
            left.height(),
            right.width(),
            right.height()
        )));
    }
    if left.width() == 0 || left.height() == 0 {
        return Err(SgmError::DimensionMismatch(
            "input images must be non-empty".to_string(),
        ));
    }
    Ok((left.width() as usize, left.height() as usize))
}

/// Per-pixel absolute intensity difference, scaled to `[0, MAX_COST]`.
/// The cheapest cost and a reasonable default for well-exposed pairs.
#[derive(Debug, Default)]
pub struct AbsoluteDifferenceCost {
    disparity_min: usize,
    disparity_range: usize,
}

impl AbsoluteDifferenceCost {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CostVolumeBuilder for AbsoluteDifferenceCost {
    fn configure(&mut self, disparity_min: usize, disparity_range: usize) {
        self.disparity_min = disparity_min;
        self.disparity_range = disparity_range;
    }

    fn process(
        &mut self,
        left: &GrayImage,
        right: &GrayImage,
        out: &mut CostTensor,
    ) -> Result<()> {
        let (width, height) = check_input_pair(left, right)?;
        out.reshape(width, height, self.disparity_min, self.disparity_range);

        let left_data = left.as_raw();
        let right_data = right.as_raw();
        let disparity_min = self.disparity_min;
        let disparity_range = self.disparity_range;
        let row_stride = width * disparity_range;

        out.data_mut()
            .par_chunks_mut(row_stride)
            .enumerate()
            .for_each(|(y, row)| {
                for x in 0..width {
                    let local = (x + 1).saturating_sub(disparity_min).min(disparity_range);
                    let slice = &mut row[x * disparity_range..(x + 1) * disparity_range];
                    let l = left_data[y * width + x] as i32;
                    for (d, cell) in slice.iter_mut().enumerate().take(local) {
                        let r = right_data[y * width + x - d - disparity_min] as i32;
                        *cell = ((l - r).unsigned_abs() * MAX_COST as u32 / 255) as u16;
                    }
                    for cell in slice.iter_mut().skip(local) {
                        *cell = MAX_COST;
                    }
                }
            });

        Ok(())
    }
}

/// Census-transform cost: Hamming distance between 5x5 census codes, scaled
/// to `[0, MAX_COST]`. Robust to gain and bias differences between cameras.
#[derive(Debug, Default)]
pub struct CensusCost {
    disparity_min: usize,
    disparity_range: usize,
    left_codes: Vec<u32>,
    right_codes: Vec<u32>,
}

impl CensusCost {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CostVolumeBuilder for CensusCost {
    fn configure(&mut self, disparity_min: usize, disparity_range: usize) {
        self.disparity_min = disparity_min;
        self.disparity_range = disparity_range;
    }

    fn process(
        &mut self,
        left: &GrayImage,
        right: &GrayImage,
        out: &mut CostTensor,
    ) -> Result<()> {
        let (width, height) = check_input_pair(left, right)?;
        out.reshape(width, height, self.disparity_min, self.disparity_range);

        self.left_codes = census_transform_5x5(left);
        self.right_codes = census_transform_5x5(right);

        let left_codes = &self.left_codes;
        let right_codes = &self.right_codes;
        let disparity_min = self.disparity_min;
        let disparity_range = self.disparity_range;
        let row_stride = width * disparity_range;

        out.data_mut()
            .par_chunks_mut(row_stride)
            .enumerate()
            .for_each(|(y, row)| {
                for x in 0..width {
                    let local = (x + 1).saturating_sub(disparity_min).min(disparity_range);
                    let slice = &mut row[x * disparity_range..(x + 1) * disparity_range];
                    let code = left_codes[y * width + x];
                    for (d, cell) in slice.iter_mut().enumerate().take(local) {
                        let other = right_codes[y * width + x - d - disparity_min];
                        *cell = (hamming(code, other) * MAX_COST as u32 / CENSUS_BITS_5X5) as u16;
                    }
                    for cell in slice.iter_mut().skip(local) {
                        *cell = MAX_COST;
                    }
                }
            });

        Ok(())
    }
}

/// Window SAD cost: mean absolute difference over a square block, scaled to
/// `[0, MAX_COST]`. The interior uses 8-lane SIMD over each window row.
#[derive(Debug)]
pub struct BlockSadCost {
    pub radius: usize,
    disparity_min: usize,
    disparity_range: usize,
}

impl Default for BlockSadCost {
    fn default() -> Self {
        Self {
            radius: 4,
            disparity_min: 0,
            disparity_range: 0,
        }
    }
}

impl BlockSadCost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_radius(mut self, radius: usize) -> Self {
        self.radius = radius;
        self
    }

    /// SAD over the window centered at `(x, y)` in the left image and
    /// `(x - disparity, y)` in the right. Both windows fully in-bounds.
    fn sad_inner(
        &self,
        left: &[u8],
        right: &[u8],
        width: usize,
        x: usize,
        y: usize,
        disparity: usize,
    ) -> f32 {
        let radius = self.radius as i32;
        let mut total = f32x8::ZERO;
        let mut tail = 0.0f32;

        for dy in -radius..=radius {
            let row = ((y as i32 + dy) as usize) * width;
            let lx0 = x - self.radius;
            let rx0 = x - disparity - self.radius;
            let span = 2 * self.radius + 1;

            let mut i = 0usize;
            while i + 8 <= span {
                let l = &left[row + lx0 + i..row + lx0 + i + 8];
                let r = &right[row + rx0 + i..row + rx0 + i + 8];
                let lv = f32x8::from([
                    l[0] as f32, l[1] as f32, l[2] as f32, l[3] as f32, l[4] as f32, l[5] as f32,
                    l[6] as f32, l[7] as f32,
                ]);
                let rv = f32x8::from([
                    r[0] as f32, r[1] as f32, r[2] as f32, r[3] as f32, r[4] as f32, r[5] as f32,
                    r[6] as f32, r[7] as f32,
                ]);
                total += (lv - rv).abs();
                i += 8;
            }
            for j in i..span {
                tail += (left[row + lx0 + j] as f32 - right[row + rx0 + j] as f32).abs();
            }
        }

        total.reduce_add() + tail
    }

    /// Scalar fallback near image borders; samples are clamped inside the
    /// image the same way the census transform clamps its window.
    fn sad_border(
        &self,
        left: &[u8],
        right: &[u8],
        width: usize,
        height: usize,
        x: usize,
        y: usize,
        disparity: usize,
    ) -> f32 {
        let radius = self.radius as i32;
        let mut total = 0.0f32;

        for dy in -radius..=radius {
            let sy = (y as i32 + dy).clamp(0, height as i32 - 1) as usize;
            for dx in -radius..=radius {
                let lx = (x as i32 + dx).clamp(0, width as i32 - 1) as usize;
                let rx = (x as i32 - disparity as i32 + dx).clamp(0, width as i32 - 1) as usize;
                total += (left[sy * width + lx] as f32 - right[sy * width + rx] as f32).abs();
            }
        }

        total
    }
}

impl CostVolumeBuilder for BlockSadCost {
    fn configure(&mut self, disparity_min: usize, disparity_range: usize) {
        self.disparity_min = disparity_min;
        self.disparity_range = disparity_range;
    }

    fn process(
        &mut self,
        left: &GrayImage,
        right: &GrayImage,
        out: &mut CostTensor,
    ) -> Result<()> {
        let (width, height) = check_input_pair(left, right)?;
        out.reshape(width, height, self.disparity_min, self.disparity_range);

        let left_data = left.as_raw();
        let right_data = right.as_raw();
        let radius = self.radius;
        let disparity_min = self.disparity_min;
        let disparity_range = self.disparity_range;
        let row_stride = width * disparity_range;
        let window_pixels = ((2 * radius + 1) * (2 * radius + 1)) as f32;
        let scale = MAX_COST as f32 / (255.0 * window_pixels);

        out.data_mut()
            .par_chunks_mut(row_stride)
            .enumerate()
            .for_each(|(y, row)| {
                let inner_y = y >= radius && y + radius < height;
                for x in 0..width {
                    let local = (x + 1).saturating_sub(disparity_min).min(disparity_range);
                    let slice = &mut row[x * disparity_range..(x + 1) * disparity_range];
                    for (d, cell) in slice.iter_mut().enumerate().take(local) {
                        let disparity = d + disparity_min;
                        let sad = if inner_y
                            && x >= disparity + radius
                            && x + radius < width
                        {
                            self.sad_inner(left_data, right_data, width, x, y, disparity)
                        } else {
                            self.sad_border(
                                left_data, right_data, width, height, x, y, disparity,
                            )
                        };
                        *cell = ((sad * scale) as u16).min(MAX_COST);
                    }
                    for cell in slice.iter_mut().skip(local) {
                        *cell = MAX_COST;
                    }
                }
            });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn shifted_pair(width: u32, height: u32, shift: u32) -> (GrayImage, GrayImage) {
        let mut left = GrayImage::new(width, height);
        let mut right = GrayImage::new(width, height);
        for y in 0..height {
            for x in 0..width {
                let v = |col: u32| ((col * 31 + y * 17) % 200 + 20) as u8;
                left.put_pixel(x, y, Luma([v(x)]));
                // right image content is the left shifted right->left by `shift`
                right.put_pixel(x, y, Luma([v(x + shift)]));
            }
        }
        (left, right)
    }

    #[test]
    fn test_rejects_mismatched_shapes() {
        let a = GrayImage::new(10, 10);
        let b = GrayImage::new(12, 10);
        let mut builder = AbsoluteDifferenceCost::new();
        builder.configure(0, 8);
        let mut out = CostTensor::new();
        assert!(builder.process(&a, &b, &mut out).is_err());
    }

    #[test]
    fn test_absolute_difference_zero_at_true_disparity() {
        // left(x) == right(x - 3)
        let (left, right) = shifted_pair(30, 6, 3);
        let mut builder = AbsoluteDifferenceCost::new();
        builder.configure(0, 8);
        let mut out = CostTensor::new();
        builder.process(&left, &right, &mut out).unwrap();

        for x in 8..30 {
            assert_eq!(out.get(x, 3, 3), 0, "x={x}");
        }
        // Out-of-range entries are pinned at the ceiling
        assert_eq!(out.get(1, 3, 5), MAX_COST);
    }

    #[test]
    fn test_all_builders_bounded_by_max_cost() {
        let (left, right) = shifted_pair(40, 12, 2);
        let mut out = CostTensor::new();

        let mut ad = AbsoluteDifferenceCost::new();
        ad.configure(2, 10);
        ad.process(&left, &right, &mut out).unwrap();
        assert!(out.data().iter().all(|&c| c <= MAX_COST));

        let mut census = CensusCost::new();
        census.configure(2, 10);
        census.process(&left, &right, &mut out).unwrap();
        assert!(out.data().iter().all(|&c| c <= MAX_COST));

        let mut sad = BlockSadCost::new().with_radius(4);
        sad.configure(2, 10);
        sad.process(&left, &right, &mut out).unwrap();
        assert!(out.data().iter().all(|&c| c <= MAX_COST));
    }

    #[test]
    fn test_census_prefers_true_disparity() {
        let (left, right) = shifted_pair(40, 16, 4);
        let mut builder = CensusCost::new();
        builder.configure(0, 8);
        let mut out = CostTensor::new();
        builder.process(&left, &right, &mut out).unwrap();

        // Away from borders the true disparity has the lowest census cost
        for x in 12..34 {
            let slice = out.pixel(x, 8);
            let best = slice
                .iter()
                .enumerate()
                .min_by_key(|&(_, &c)| c)
                .map(|(d, _)| d)
                .unwrap();
            assert_eq!(best, 4, "x={x}");
        }
    }

    #[test]
    fn test_block_sad_inner_matches_border_path() {
        let (left, right) = shifted_pair(40, 16, 2);
        let builder = BlockSadCost::new().with_radius(4);

        // A pixel far from every border is valid for both code paths
        let inner = builder.sad_inner(left.as_raw(), right.as_raw(), 40, 20, 8, 2);
        let border = builder.sad_border(left.as_raw(), right.as_raw(), 40, 16, 20, 8, 2);
        assert_eq!(inner, border);
    }
}
