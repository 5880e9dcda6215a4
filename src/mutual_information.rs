//! Mutual-information cost model for SGM.
//!
//! Mutual information between two images is `MI(L,R) = H_L + H_R - H_LR`,
//! where `H` is an entropy term computed from intensity histograms. Given a
//! disparity map, corresponding pixels vote into a joint intensity
//! histogram; smoothed (Parzen) entropies derived from it yield a per
//! intensity-pair matching cost. The model is estimated from a disparity
//! map and then used to score the next, finer disparity search, which is
//! what the hierarchical pipeline iterates on.

use image::GrayImage;
use rand::Rng;

use crate::cost::{check_input_pair, CostVolumeBuilder};
use crate::tensor::{CostTensor, MAX_COST};
use crate::{DisparityImage, Result, SgmError};

/// Floor added inside logarithms so empty histogram bins stay finite.
const LOG_EPS: f32 = 1e-8;

/// Estimates and evaluates the mutual-information cost between intensity
/// pairs. Usage: initialize with [`diagonal_histogram`](Self::diagonal_histogram)
/// (or a disparity map via [`process`](Self::process) followed by
/// [`precompute_scaled_cost`](Self::precompute_scaled_cost)), then read
/// costs through [`cost_scaled`](Self::cost_scaled) or use the
/// [`CostVolumeBuilder`] impl.
pub struct StereoMutualInformation {
    /// Number of distinct gray levels, 256 for 8-bit input.
    gray_levels: usize,
    smooth_kernel: Vec<f32>,

    // Joint histogram of corresponding left/right intensities
    hist_joint: Vec<u32>,
    total_pairs: f32,

    // Probabilities are written here first, then overwritten by entropies
    entropy_joint: Vec<f32>,
    entropy_left: Vec<f32>,
    entropy_right: Vec<f32>,

    scratch: Vec<f32>,

    // Cost LUT scaled to [0, max_cost]
    scaled_cost: Vec<u16>,

    // Search window for the CostVolumeBuilder impl
    disparity_min: usize,
    disparity_range: usize,
}

impl StereoMutualInformation {
    pub fn new() -> Self {
        let mut s = Self {
            gray_levels: 0,
            smooth_kernel: Vec::new(),
            hist_joint: Vec::new(),
            total_pairs: 0.0,
            entropy_joint: Vec::new(),
            entropy_left: Vec::new(),
            entropy_right: Vec::new(),
            scratch: Vec::new(),
            scaled_cost: Vec::new(),
            disparity_min: 0,
            disparity_range: 0,
        };
        s.configure_histogram(256);
        s.configure_smoothing(1);
        s
    }

    /// Number of possible gray values, typically 256 for 8-bit images.
    pub fn configure_histogram(&mut self, gray_levels: usize) {
        self.gray_levels = gray_levels;
        self.hist_joint = vec![0; gray_levels * gray_levels];
        self.entropy_joint = vec![0.0; gray_levels * gray_levels];
        self.entropy_left = vec![0.0; gray_levels];
        self.entropy_right = vec![0.0; gray_levels];
        self.scratch = vec![0.0; gray_levels * gray_levels];
        self.scaled_cost = vec![0; gray_levels * gray_levels];
    }

    /// Gaussian smoothing radius applied to the histograms before taking
    /// logarithms. The reference uses a radius of 3; 1 works well for 8-bit
    /// input.
    pub fn configure_smoothing(&mut self, radius: usize) {
        self.smooth_kernel = gaussian_kernel(radius);
    }

    /// Fills the cost LUT with random values. Only works on simplistic
    /// scenes; kept as the baseline the diagonal prior is measured against.
    pub fn random_histogram<R: Rng>(&mut self, rng: &mut R, max_cost: u16) {
        for v in self.scaled_cost.iter_mut() {
            *v = rng.gen_range(0..=max_cost);
        }
    }

    /// Diagonal prior: pixels of similar intensity are assumed to
    /// correspond. `scale_left_to_right` is the expected intensity ratio
    /// between the images; 1.0 is almost always right.
    pub fn diagonal_histogram(&mut self, scale_left_to_right: f64, max_cost: u16) {
        let n = self.gray_levels;
        let cost_low = max_cost / 20;
        let cost_high = max_cost / 3;
        for left in 0..n {
            let matching =
                ((left as f64 * scale_left_to_right).round().max(0.0) as usize).min(n - 1);
            for right in 0..n {
                self.scaled_cost[left * n + right] =
                    if right == matching { cost_low } else { cost_high };
            }
        }
    }

    /// Re-estimates the entropy terms from a disparity map. Pixels carrying
    /// the invalid sentinel are skipped. Call
    /// [`precompute_scaled_cost`](Self::precompute_scaled_cost) afterwards to
    /// refresh the LUT.
    pub fn process(
        &mut self,
        left: &GrayImage,
        right: &GrayImage,
        disparity: &DisparityImage,
    ) -> Result<()> {
        let (width, height) = check_input_pair(left, right)?;
        if disparity.width != width || disparity.height != height {
            return Err(SgmError::DimensionMismatch(format!(
                "disparity map shape {}x{} does not match images {}x{}",
                disparity.width, disparity.height, width, height
            )));
        }

        self.compute_joint_histogram(left, right, disparity);
        if self.total_pairs == 0.0 {
            return Err(SgmError::InvalidConfiguration(
                "disparity map has no valid pixels to estimate the model from".to_string(),
            ));
        }
        self.compute_probabilities();
        self.compute_entropy();
        Ok(())
    }

    fn compute_joint_histogram(
        &mut self,
        left: &GrayImage,
        right: &GrayImage,
        disparity: &DisparityImage,
    ) {
        self.hist_joint.fill(0);
        let n = self.gray_levels;
        let width = disparity.width;
        let invalid = disparity.invalid();
        let left_data = left.as_raw();
        let right_data = right.as_raw();
        let mut total = 0u32;

        for (idx, &d) in disparity.data.iter().enumerate() {
            if d >= invalid {
                continue;
            }
            let x = idx % width;
            let full = d as usize + disparity.disparity_min;
            // A valid disparity never references a column left of the image
            debug_assert!(full <= x);
            let l = left_data[idx] as usize;
            let r = right_data[idx - full] as usize;
            self.hist_joint[l * n + r] += 1;
            total += 1;
        }

        self.total_pairs = total as f32;
    }

    fn compute_probabilities(&mut self) {
        let n = self.gray_levels;
        let total = self.total_pairs;

        for (p, &h) in self.entropy_joint.iter_mut().zip(self.hist_joint.iter()) {
            *p = h as f32 / total;
        }

        // Marginals are the row and column sums of the joint probability
        self.entropy_right.fill(0.0);
        for left in 0..n {
            let row = &self.entropy_joint[left * n..(left + 1) * n];
            let mut sum = 0.0f32;
            for (right, &p) in row.iter().enumerate() {
                sum += p;
                self.entropy_right[right] += p;
            }
            self.entropy_left[left] = sum;
        }
    }

    fn compute_entropy(&mut self) {
        let n = self.gray_levels;
        let total = self.total_pairs;

        // Joint entropy: -(1/n) * log(P smoothed) smoothed again, a Parzen
        // estimate of the true distribution
        smooth_2d(&self.smooth_kernel, &mut self.entropy_joint, &mut self.scratch, n);
        for v in self.entropy_joint.iter_mut() {
            *v = (*v + LOG_EPS).ln();
        }
        smooth_2d(&self.smooth_kernel, &mut self.entropy_joint, &mut self.scratch, n);
        for v in self.entropy_joint.iter_mut() {
            *v /= -total;
        }

        for marginal in [&mut self.entropy_left, &mut self.entropy_right] {
            let work = &mut self.scratch[..n];
            smooth_1d(&self.smooth_kernel, marginal, work);
            for v in work.iter_mut() {
                *v = (*v + LOG_EPS).ln();
            }
            smooth_1d(&self.smooth_kernel, work, marginal);
            for v in marginal.iter_mut() {
                *v /= -total;
            }
        }
    }

    /// Raw mutual-information cost for an intensity pair. Lower is a better
    /// match. Valid after [`process`](Self::process).
    pub fn cost(&self, left_value: usize, right_value: usize) -> f32 {
        self.entropy_joint[left_value * self.gray_levels + right_value]
            - self.entropy_left[left_value]
            - self.entropy_right[right_value]
    }

    /// LUT lookup of the cost scaled to `[0, max_cost]`.
    #[inline]
    pub fn cost_scaled(&self, left_value: usize, right_value: usize) -> u16 {
        self.scaled_cost[left_value * self.gray_levels + right_value]
    }

    /// Rescales the raw costs into a `[0, max_cost]` lookup table.
    pub fn precompute_scaled_cost(&mut self, max_cost: u16) {
        let n = self.gray_levels;

        let mut min_value = f32::MAX;
        let mut max_value = f32::MIN;
        for left in 0..n {
            for right in 0..n {
                let v = self.cost(left, right);
                min_value = min_value.min(v);
                max_value = max_value.max(v);
            }
        }
        let range = max_value - min_value;
        if range <= 0.0 {
            self.scaled_cost.fill(0);
            return;
        }

        for left in 0..n {
            for right in 0..n {
                let v = self.cost(left, right);
                self.scaled_cost[left * n + right] =
                    (max_cost as f32 * (v - min_value) / range) as u16;
            }
        }
    }
}

impl Default for StereoMutualInformation {
    fn default() -> Self {
        Self::new()
    }
}

impl CostVolumeBuilder for StereoMutualInformation {
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

        for y in 0..height {
            for x in 0..width {
                let local = out.local_range_left(x);
                let l = left_data[y * width + x] as usize;
                let base = out.index(x, y);
                for d in 0..local {
                    let r = right_data[y * width + x - d - disparity_min] as usize;
                    out.data_mut()[base + d] = self.cost_scaled(l, r);
                }
                for d in local..disparity_range {
                    out.data_mut()[base + d] = MAX_COST;
                }
            }
        }

        Ok(())
    }
}

/// Normalized Gaussian kernel for the given radius, sigma derived from the
/// radius the way the usual kernel factories do it.
fn gaussian_kernel(radius: usize) -> Vec<f32> {
    let sigma = (2 * radius + 1) as f32 / 6.0;
    let mut kernel = Vec::with_capacity(2 * radius + 1);
    let mut sum = 0.0f32;
    for i in 0..=2 * radius {
        let d = i as f32 - radius as f32;
        let v = (-d * d / (2.0 * sigma * sigma)).exp();
        kernel.push(v);
        sum += v;
    }
    for v in kernel.iter_mut() {
        *v /= sum;
    }
    kernel
}

/// 1-D convolution that renormalizes the kernel where it hangs off the ends,
/// so border bins are not attenuated.
fn smooth_1d(kernel: &[f32], src: &[f32], dst: &mut [f32]) {
    let radius = kernel.len() / 2;
    let n = src.len();
    for (i, out) in dst.iter_mut().enumerate().take(n) {
        let mut acc = 0.0f32;
        let mut weight = 0.0f32;
        for (k, &w) in kernel.iter().enumerate() {
            let j = i as i64 + k as i64 - radius as i64;
            if j < 0 || j >= n as i64 {
                continue;
            }
            acc += w * src[j as usize];
            weight += w;
        }
        *out = acc / weight;
    }
}

/// Separable smoothing of an `n x n` buffer in place, `scratch` same size.
fn smooth_2d(kernel: &[f32], data: &mut [f32], scratch: &mut [f32], n: usize) {
    // Horizontal pass into scratch
    for row in 0..n {
        let src = &data[row * n..(row + 1) * n];
        let dst = &mut scratch[row * n..(row + 1) * n];
        smooth_1d(kernel, src, dst);
    }
    // Vertical pass back into data, one column at a time
    let mut column = vec![0.0f32; n];
    let mut smoothed = vec![0.0f32; n];
    for col in 0..n {
        for row in 0..n {
            column[row] = scratch[row * n + col];
        }
        smooth_1d(kernel, &column, &mut smoothed);
        for row in 0..n {
            data[row * n + col] = smoothed[row];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_diagonal_prior_prefers_matching_intensity() {
        let mut mi = StereoMutualInformation::new();
        mi.diagonal_histogram(1.0, MAX_COST);

        assert!(mi.cost_scaled(100, 100) < mi.cost_scaled(100, 140));
        assert!(mi.cost_scaled(0, 0) < mi.cost_scaled(0, 255));
        assert!(mi.scaled_cost.iter().all(|&c| c <= MAX_COST));
    }

    #[test]
    fn test_random_histogram_bounded() {
        let mut mi = StereoMutualInformation::new();
        let mut rng = StdRng::seed_from_u64(234);
        mi.random_histogram(&mut rng, MAX_COST);
        assert!(mi.scaled_cost.iter().all(|&c| c <= MAX_COST));
    }

    #[test]
    fn test_estimated_model_matches_translation() {
        // Left and right differ by a pure 2-pixel shift, disparity known
        let width = 60usize;
        let height = 40usize;
        let mut left = GrayImage::new(width as u32, height as u32);
        let mut right = GrayImage::new(width as u32, height as u32);
        for y in 0..height as u32 {
            for x in 0..width as u32 {
                let v = |c: u32| (((c * 37 + y * 11) % 230) + 10) as u8;
                left.put_pixel(x, y, Luma([v(x)]));
                right.put_pixel(x, y, Luma([v(x + 2)]));
            }
        }

        let mut disparity = DisparityImage::new(width, height, 0, 8);
        for y in 0..height {
            for x in 2..width {
                disparity.set(x, y, 2);
            }
        }

        let mut mi = StereoMutualInformation::new();
        mi.process(&left, &right, &disparity).unwrap();
        mi.precompute_scaled_cost(MAX_COST);

        // Observed pairs are identical intensities, so the diagonal must be
        // much cheaper than distant off-diagonal entries
        let mut diag = 0u64;
        let mut off = 0u64;
        let mut count = 0u64;
        for v in (20..200).step_by(10) {
            diag += mi.cost_scaled(v, v) as u64;
            off += mi.cost_scaled(v, (v + 97) % 240) as u64;
            count += 1;
        }
        assert!(diag / count < off / count);
    }

    #[test]
    fn test_process_rejects_empty_disparity() {
        let left = GrayImage::from_pixel(10, 10, Luma([50]));
        let right = GrayImage::from_pixel(10, 10, Luma([50]));
        let disparity = DisparityImage::new(10, 10, 0, 8); // all invalid

        let mut mi = StereoMutualInformation::new();
        assert!(mi.process(&left, &right, &disparity).is_err());
    }

    #[test]
    fn test_builder_fills_out_of_range_with_max_cost() {
        let left = GrayImage::from_pixel(12, 6, Luma([80]));
        let right = GrayImage::from_pixel(12, 6, Luma([80]));

        let mut mi = StereoMutualInformation::new();
        mi.diagonal_histogram(1.0, MAX_COST);
        mi.configure(2, 6);

        let mut out = CostTensor::new();
        CostVolumeBuilder::process(&mut mi, &left, &right, &mut out).unwrap();

        // Column 1 is left of disparity_min, no candidate is reachable
        assert!(out.pixel(1, 3).iter().all(|&c| c == MAX_COST));
        // Interior column: reachable candidates use the LUT
        assert_eq!(out.get(8, 3, 0), mi.cost_scaled(80, 80));
    }
}
