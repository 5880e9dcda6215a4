//! Reduces the aggregated cost tensor to one disparity per pixel, with
//! validation gates for gross errors, occlusions and low-texture regions,
//! plus the optional sub-pixel and confidence post-passes.

use rayon::prelude::*;

use crate::tensor::CostTensor;
use crate::{DisparityImage, DisparityMap, Result, ScoreMap, SgmError};

/// Winner-take-all disparity selection over the aggregated tensor.
///
/// Rows are independent: each output row only reads its own row's slice of
/// the aggregated tensor, so the row-parallel and single-threaded paths
/// produce identical output.
#[derive(Debug, Clone)]
pub struct DisparitySelector {
    /// Winning aggregated costs above this are rejected. `u16::MAX`
    /// disables the gate.
    pub max_error: u16,
    /// Maximum disagreement tolerated when re-matching from the right
    /// image's perspective. Negative disables the check.
    pub right_to_left_tolerance: i32,
    /// Required relative margin between best and second-best cost. Zero
    /// disables the gate.
    pub texture_threshold: f32,
    pub use_parallel: bool,
}

impl Default for DisparitySelector {
    fn default() -> Self {
        Self {
            max_error: u16::MAX,
            right_to_left_tolerance: 1,
            texture_threshold: 0.15,
            use_parallel: true,
        }
    }
}

impl DisparitySelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects the winning disparity for every pixel of `aggregated`,
    /// writing indices (or the invalid sentinel) into `out`. `cost` is the
    /// tensor `aggregated` was built from and fixes the expected shape.
    pub fn select(
        &self,
        cost: &CostTensor,
        aggregated: &CostTensor,
        out: &mut DisparityImage,
    ) -> Result<()> {
        if !cost.same_shape(aggregated) {
            return Err(SgmError::DimensionMismatch(format!(
                "aggregated tensor {}x{}x{} does not match cost tensor {}x{}x{}",
                aggregated.width,
                aggregated.height,
                aggregated.disparity_range,
                cost.width,
                cost.height,
                cost.disparity_range
            )));
        }

        let width = aggregated.width;
        if out.width == width
            && out.height == aggregated.height
            && out.disparity_min == aggregated.disparity_min
            && out.disparity_range == aggregated.disparity_range
        {
            // Same shape as last inference, reset in place
            let invalid = out.invalid();
            out.data.fill(invalid);
        } else {
            *out = DisparityImage::new(
                width,
                aggregated.height,
                aggregated.disparity_min,
                aggregated.disparity_range,
            );
        }

        if self.use_parallel {
            out.data
                .par_chunks_mut(width)
                .enumerate()
                .for_each(|(y, row)| self.select_row(aggregated, y, row));
        } else {
            for (y, row) in out.data.chunks_mut(width).enumerate() {
                self.select_row(aggregated, y, row);
            }
        }

        Ok(())
    }

    fn select_row(&self, aggregated: &CostTensor, y: usize, row: &mut [u8]) {
        let invalid = aggregated.disparity_range as u8;
        for (x, out) in row.iter_mut().enumerate() {
            *out = self.select_pixel(aggregated, x, y).unwrap_or(invalid);
        }
    }

    /// Winner for one pixel, `None` when any gate rejects it.
    fn select_pixel(&self, aggregated: &CostTensor, x: usize, y: usize) -> Option<u8> {
        let local = aggregated.local_range_left(x);
        if local == 0 {
            // Left of the minimum disparity no candidate is reachable
            return None;
        }

        let scores = &aggregated.pixel(x, y)[..local];
        let (best_d, &best_cost) = scores
            .iter()
            .enumerate()
            .min_by_key(|&(_, &v)| v)?;

        if best_cost > self.max_error {
            return None;
        }

        if self.right_to_left_tolerance >= 0 {
            let right_x = x - best_d - aggregated.disparity_min;
            let from_right = self.select_right_to_left(aggregated, right_x, y);
            let diff = (from_right as i32 - best_d as i32).abs();
            if diff > self.right_to_left_tolerance {
                return None;
            }
        }

        if self.texture_threshold > 0.0 && local > 3 {
            // Best cost among candidates outside the winner's neighborhood
            let mut second = u16::MAX;
            for (d, &v) in scores.iter().enumerate() {
                if d + 1 >= best_d && d <= best_d + 1 {
                    continue;
                }
                second = second.min(v);
            }
            if (second as f32 - best_cost as f32) <= self.texture_threshold * best_cost as f32 {
                return None;
            }
        }

        Some(best_d as u8)
    }

    /// Arg-min from the right image's perspective: for right column
    /// `right_x`, every disparity candidate `d` matches left column
    /// `right_x + d + disparity_min`.
    fn select_right_to_left(&self, aggregated: &CostTensor, right_x: usize, y: usize) -> usize {
        let mut best_d = 0usize;
        let mut best_cost = u16::MAX;
        for d in 0..aggregated.disparity_range {
            let left_x = right_x + d + aggregated.disparity_min;
            if left_x >= aggregated.width {
                break;
            }
            let v = aggregated.get(left_x, y, d);
            if v < best_cost {
                best_cost = v;
                best_d = d;
            }
        }
        best_d
    }
}

/// Refines each valid winning disparity to sub-pixel precision by fitting a
/// parabola through the aggregated costs of the winner and its two
/// neighbors. Winners at either end of the local range pass through
/// unrefined; invalid pixels become `NaN`.
pub fn subpixel_refine(aggregated: &CostTensor, disparity: &DisparityImage) -> DisparityMap {
    let mut out = DisparityMap::new(
        disparity.width,
        disparity.height,
        disparity.disparity_min,
        disparity.disparity_range,
    );

    for y in 0..disparity.height {
        for x in 0..disparity.width {
            if !disparity.is_valid(x, y) {
                continue;
            }
            let d = disparity.get(x, y) as usize;
            let local = aggregated.local_range_left(x);
            let value = if d == 0 || d + 1 >= local {
                d as f32
            } else {
                let scores = aggregated.pixel(x, y);
                let c0 = scores[d - 1] as f32;
                let c1 = scores[d] as f32;
                let c2 = scores[d + 1] as f32;
                let denominator = 2.0 * (c0 - 2.0 * c1 + c2);
                if denominator.abs() <= f32::EPSILON {
                    // Flat fit, keep the integer winner
                    d as f32
                } else {
                    let offset = ((c0 - c2) / denominator).clamp(-0.5, 0.5);
                    d as f32 + offset
                }
            };
            out.set(x, y, value);
        }
    }

    out
}

/// Copies out the aggregated cost at each winning disparity as a per-pixel
/// confidence score. Invalid pixels become `NaN`.
pub fn extract_score(aggregated: &CostTensor, disparity: &DisparityImage) -> ScoreMap {
    let mut out = ScoreMap::new(disparity.width, disparity.height);

    for y in 0..disparity.height {
        for x in 0..disparity.width {
            if !disparity.is_valid(x, y) {
                continue;
            }
            let d = disparity.get(x, y) as usize;
            out.data[y * disparity.width + x] = aggregated.get(x, y, d) as f32;
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::MAX_COST;

    /// Tensor with every pixel's disparity slice set from a closure.
    fn tensor_from(
        width: usize,
        height: usize,
        min: usize,
        range: usize,
        mut f: impl FnMut(usize, usize, usize) -> u16,
    ) -> CostTensor {
        let mut t = CostTensor::new();
        t.reshape(width, height, min, range);
        for y in 0..height {
            for x in 0..width {
                let px = t.pixel_mut(x, y);
                for d in 0..range {
                    px[d] = f(x, y, d);
                }
            }
        }
        t
    }

    fn permissive() -> DisparitySelector {
        DisparitySelector {
            max_error: u16::MAX,
            right_to_left_tolerance: -1,
            texture_threshold: 0.0,
            use_parallel: false,
        }
    }

    #[test]
    fn test_argmin_and_min_disparity_border() {
        let winner = 3usize;
        let aggregated = tensor_from(20, 6, 2, 8, |_, _, d| if d == winner { 10 } else { 900 });
        let cost = aggregated.clone();

        let selector = permissive();
        let mut out = DisparityImage::new(1, 1, 0, 1);
        selector.select(&cost, &aggregated, &mut out).unwrap();

        // Columns left of disparity_min cannot match anything
        for x in 0..2 {
            assert!(!out.is_valid(x, 3));
        }
        // Shrunken local range: the winner only becomes reachable once the
        // range includes it
        assert_eq!(out.get(2, 3), 0); // local range 1, only d=0 exists
        for x in 6..20 {
            assert_eq!(out.get(x, 3), winner as u8);
        }
    }

    #[test]
    fn test_max_error_gate() {
        let aggregated = tensor_from(10, 4, 0, 6, |_, _, d| if d == 2 { 500 } else { 800 });
        let cost = aggregated.clone();

        let mut selector = permissive();
        selector.max_error = 499;
        let mut out = DisparityImage::new(1, 1, 0, 1);
        selector.select(&cost, &aggregated, &mut out).unwrap();
        assert!(!out.is_valid(8, 2));

        selector.max_error = 500;
        selector.select(&cost, &aggregated, &mut out).unwrap();
        assert_eq!(out.get(8, 2), 2);
    }

    #[test]
    fn test_right_to_left_rejection() {
        // From the left pixel at x=12 disparity 4 wins. From the right
        // image's column 8 the cheapest candidate is elsewhere, far beyond
        // the tolerance.
        let aggregated = tensor_from(20, 3, 0, 8, |x, _, d| {
            if x == 12 && d == 4 {
                50
            } else if x == 8 && d == 0 {
                // right column 8 prefers d=0 (left column 8)
                10
            } else {
                600
            }
        });
        let cost = aggregated.clone();

        let mut selector = permissive();
        selector.right_to_left_tolerance = 1;
        let mut out = DisparityImage::new(1, 1, 0, 1);
        selector.select(&cost, &aggregated, &mut out).unwrap();
        assert!(!out.is_valid(12, 1), "inconsistent match must be rejected");

        // Disabling the check accepts the left winner again
        selector.right_to_left_tolerance = -1;
        selector.select(&cost, &aggregated, &mut out).unwrap();
        assert_eq!(out.get(12, 1), 4);
    }

    #[test]
    fn test_texture_gate_rejects_ambiguous() {
        // Two nearly equal minima far apart: ambiguous, low-texture
        let aggregated = tensor_from(16, 3, 0, 8, |_, _, d| match d {
            2 => 100,
            6 => 104,
            _ => 600,
        });
        let cost = aggregated.clone();

        let mut selector = permissive();
        selector.texture_threshold = 0.1;
        let mut out = DisparityImage::new(1, 1, 0, 1);
        selector.select(&cost, &aggregated, &mut out).unwrap();
        assert!(!out.is_valid(10, 1));

        // A clear margin passes
        let aggregated = tensor_from(16, 3, 0, 8, |_, _, d| if d == 2 { 100 } else { 600 });
        selector.select(&aggregated.clone(), &aggregated, &mut out).unwrap();
        assert_eq!(out.get(10, 1), 2);
    }

    #[test]
    fn test_row_parallel_matches_sequential() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(97);
        let aggregated = tensor_from(33, 21, 1, 11, |_, _, _| rng.gen_range(0..=MAX_COST));
        let cost = aggregated.clone();

        let mut selector = DisparitySelector::new();
        selector.use_parallel = false;
        let mut seq = DisparityImage::new(1, 1, 0, 1);
        selector.select(&cost, &aggregated, &mut seq).unwrap();

        selector.use_parallel = true;
        let mut par = DisparityImage::new(1, 1, 0, 1);
        selector.select(&cost, &aggregated, &mut par).unwrap();

        assert_eq!(seq.data, par.data);
    }

    #[test]
    fn test_select_reuses_matching_buffer() {
        let aggregated = tensor_from(14, 5, 0, 6, |x, y, d| ((x + y + d) % 7) as u16);
        let cost = aggregated.clone();
        let selector = permissive();

        let mut out = DisparityImage::new(1, 1, 0, 1);
        selector.select(&cost, &aggregated, &mut out).unwrap();
        let first = out.data.clone();
        let allocation = out.data.as_ptr();

        // Stale contents must not leak into the next inference
        out.data.fill(5);
        selector.select(&cost, &aggregated, &mut out).unwrap();
        assert_eq!(out.data, first);
        assert_eq!(out.data.as_ptr(), allocation, "buffer was reallocated");
    }

    #[test]
    fn test_subpixel_parabola() {
        // Three samples around the winner whose parabola fit has its
        // minimum a quarter pixel above d = 3
        let aggregated = tensor_from(12, 3, 0, 8, |_, _, d| match d {
            2 => 13,
            3 => 1,
            4 => 5,
            _ => 900,
        });

        let mut disparity = DisparityImage::new(12, 3, 0, 8);
        disparity.set(8, 1, 3);
        disparity.set(9, 1, 0); // boundary winner passes through
        let refined = subpixel_refine(&aggregated, &disparity);

        let expected = 3.0 + (13.0 - 5.0) / (2.0 * (13.0 - 2.0 + 5.0));
        assert!((refined.get(8, 1) - expected).abs() < 1e-6);
        assert_eq!(refined.get(9, 1), 0.0);
        assert!(refined.get(5, 1).is_nan());
    }

    #[test]
    fn test_extract_score() {
        let aggregated = tensor_from(10, 3, 0, 6, |_, _, d| (d as u16 + 1) * 7);
        let mut disparity = DisparityImage::new(10, 3, 0, 6);
        disparity.set(4, 2, 3);

        let score = extract_score(&aggregated, &disparity);
        assert_eq!(score.get(4, 2), 28.0);
        assert!(score.get(5, 2).is_nan());
    }
}
