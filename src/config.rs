//! Tunable parameters for the SGM pipeline.

use crate::tensor::MAX_COST;
use crate::{Result, SgmError};

/// Number of aggregation directions. The sets are nested: each larger count
/// adds directions to the previous set, so increasing the count strictly
/// improves smoothness at proportional cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SgmPaths {
    P1,
    P2,
    P4,
    P8,
    P16,
}

impl SgmPaths {
    pub fn count(self) -> usize {
        match self {
            SgmPaths::P1 => 1,
            SgmPaths::P2 => 2,
            SgmPaths::P4 => 4,
            SgmPaths::P8 => 8,
            SgmPaths::P16 => 16,
        }
    }

    pub fn from_count(count: usize) -> Option<Self> {
        match count {
            1 => Some(SgmPaths::P1),
            2 => Some(SgmPaths::P2),
            4 => Some(SgmPaths::P4),
            8 => Some(SgmPaths::P8),
            16 => Some(SgmPaths::P16),
            _ => None,
        }
    }
}

/// Configuration for one SGM inference.
#[derive(Debug, Clone)]
pub struct SgmConfig {
    /// Smallest disparity considered. Index 0 of the disparity axis maps to
    /// this value.
    pub disparity_min: usize,
    /// Number of disparity candidates searched per pixel.
    pub disparity_range: usize,
    /// Penalty for a disparity change of one between neighboring path steps.
    pub penalty1: u16,
    /// Penalty for larger disparity changes. Must exceed `penalty1`.
    pub penalty2: u16,
    /// Number of aggregation directions.
    pub paths: SgmPaths,
    /// Winning aggregated costs above this are rejected. `u16::MAX` disables
    /// the gate.
    pub max_error: u16,
    /// Maximum disagreement tolerated by the right-to-left consistency
    /// check. Negative disables the check.
    pub right_to_left_tolerance: i32,
    /// Relative margin required between the best and second-best aggregated
    /// cost. Zero disables the gate.
    pub texture_threshold: f32,
    /// Distribute work across the rayon pool. The sequential path produces
    /// bit-identical output.
    pub use_parallel: bool,
    /// Run the sub-pixel/score post-pass.
    pub subpixel: bool,
}

impl Default for SgmConfig {
    fn default() -> Self {
        Self {
            disparity_min: 0,
            disparity_range: 64,
            penalty1: 200,
            penalty2: 2000,
            paths: SgmPaths::P8,
            max_error: u16::MAX,
            right_to_left_tolerance: 1,
            texture_threshold: 0.15,
            use_parallel: true,
            subpixel: true,
        }
    }
}

impl SgmConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_disparity_window(mut self, min: usize, range: usize) -> Self {
        self.disparity_min = min;
        self.disparity_range = range;
        self
    }

    pub fn with_penalties(mut self, penalty1: u16, penalty2: u16) -> Self {
        self.penalty1 = penalty1;
        self.penalty2 = penalty2;
        self
    }

    pub fn with_paths(mut self, paths: SgmPaths) -> Self {
        self.paths = paths;
        self
    }

    /// Rejects caller errors before any processing begins.
    pub fn validate(&self) -> Result<()> {
        if self.disparity_range == 0 {
            return Err(SgmError::InvalidConfiguration(
                "disparity_range must be at least 1".to_string(),
            ));
        }
        // The invalid sentinel is disparity_range itself and must fit in u8
        if self.disparity_range > 255 {
            return Err(SgmError::InvalidConfiguration(format!(
                "disparity_range must be at most 255 so the invalid sentinel fits \
                 in 8 bits, got {}",
                self.disparity_range
            )));
        }
        if self.penalty1 == 0 || self.penalty2 <= self.penalty1 {
            return Err(SgmError::InvalidConfiguration(format!(
                "penalties must satisfy 0 < penalty1 < penalty2, got {} and {}",
                self.penalty1, self.penalty2
            )));
        }
        if self.penalty2 > MAX_COST {
            return Err(SgmError::InvalidConfiguration(format!(
                "penalty2 must be at most {} to keep 16 path sums below 16 bits, got {}",
                MAX_COST, self.penalty2
            )));
        }
        if !self.texture_threshold.is_finite() || self.texture_threshold < 0.0 {
            return Err(SgmError::InvalidConfiguration(format!(
                "texture_threshold must be a non-negative finite value, got {}",
                self.texture_threshold
            )));
        }
        Ok(())
    }
}
