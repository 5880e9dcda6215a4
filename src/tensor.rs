//! Cost tensor storage shared by the cost builders, path aggregation and
//! disparity selection stages.

/// Upper bound for any single matching cost. An 11-bit ceiling leaves enough
/// headroom in a `u16` for the path recurrence (cost plus penalty after the
/// per-step minimum subtraction) and for summing 16 path contributions.
pub const MAX_COST: u16 = 2047;

/// 3-D cost tensor `C[y][x][d]` with 16-bit unsigned entries. Row-major with
/// the disparity index innermost, so the per-pixel disparity slice is
/// contiguous. Index 0 of the disparity axis corresponds to `disparity_min`.
#[derive(Debug, Clone)]
pub struct CostTensor {
    pub width: usize,
    pub height: usize,
    pub disparity_min: usize,
    pub disparity_range: usize,
    data: Vec<u16>,
}

impl CostTensor {
    pub fn new() -> Self {
        Self {
            width: 0,
            height: 0,
            disparity_min: 0,
            disparity_range: 0,
            data: Vec::new(),
        }
    }

    /// Resizes the tensor. Storage is only reallocated when the total size
    /// changes, so reshaping to the same configuration between inferences is
    /// allocation-free. Contents are left stale; callers overwrite every
    /// entry they read.
    pub fn reshape(
        &mut self,
        width: usize,
        height: usize,
        disparity_min: usize,
        disparity_range: usize,
    ) {
        self.width = width;
        self.height = height;
        self.disparity_min = disparity_min;
        self.disparity_range = disparity_range;
        self.data.resize(width * height * disparity_range, 0);
    }

    /// Matches another tensor's shape and disparity window.
    pub fn reshape_like(&mut self, other: &CostTensor) {
        self.reshape(
            other.width,
            other.height,
            other.disparity_min,
            other.disparity_range,
        );
    }

    pub fn fill(&mut self, value: u16) {
        self.data.fill(value);
    }

    pub fn same_shape(&self, other: &CostTensor) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.disparity_min == other.disparity_min
            && self.disparity_range == other.disparity_range
    }

    /// Index of `(x, y, d=0)` in the backing slice.
    #[inline]
    pub fn index(&self, x: usize, y: usize) -> usize {
        (y * self.width + x) * self.disparity_range
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize, d: usize) -> u16 {
        self.data[self.index(x, y) + d]
    }

    /// Contiguous disparity slice for one pixel.
    #[inline]
    pub fn pixel(&self, x: usize, y: usize) -> &[u16] {
        let i = self.index(x, y);
        &self.data[i..i + self.disparity_range]
    }

    #[inline]
    pub fn pixel_mut(&mut self, x: usize, y: usize) -> &mut [u16] {
        let i = self.index(x, y);
        let range = self.disparity_range;
        &mut self.data[i..i + range]
    }

    pub fn data(&self) -> &[u16] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u16] {
        &mut self.data
    }

    /// Number of disparity candidates at column `x` whose right-image column
    /// `x - (d + disparity_min)` stays inside the image. Shrinks to zero near
    /// the left border; every stage uses this to avoid out-of-bounds reads.
    #[inline]
    pub fn local_range_left(&self, x: usize) -> usize {
        (x + 1)
            .saturating_sub(self.disparity_min)
            .min(self.disparity_range)
    }
}

impl Default for CostTensor {
    fn default() -> Self {
        Self::new()
    }
}

/// Subtracts the minimum of `row` from every entry and returns that minimum.
///
/// This is the single implementation of the minimum-subtraction
/// normalization used by the path recurrence; keeping it in one place avoids
/// repeating the unsigned-underflow reasoning at every call site.
#[inline]
pub fn subtract_min(row: &mut [u16]) -> u16 {
    let mut min = u16::MAX;
    for &v in row.iter() {
        if v < min {
            min = v;
        }
    }
    if min == u16::MAX {
        return 0;
    }
    for v in row.iter_mut() {
        *v -= min;
    }
    min
}
