//! Multi-directional dynamic-programming cost aggregation, the step that
//! makes SGM what it is.
//!
//! For each configured direction every border-starting trajectory is scored
//! with the path recurrence
//!
//! ```text
//! Lr(p,d) = C(p,d) + min( Lr(p-r,d),
//!                         Lr(p-r,d-1) + penalty1,
//!                         Lr(p-r,d+1) + penalty1,
//!                         penalty2 ) - min_k Lr(p-r,k)
//! ```
//!
//! and the per-path result is summed into the aggregated tensor. The
//! `min_k` subtraction deviates from the published formula: applied
//! literally the published recurrence lets path costs grow without bound
//! over long paths, which overflows 16-bit accumulators once many paths are
//! summed. Subtracting the row minimum after every step keeps each path
//! value inside `[0, MAX_COST + penalty2]` and preserves the arg-min.

use rayon::prelude::*;

use crate::config::SgmPaths;
use crate::tensor::{subtract_min, CostTensor, MAX_COST};
use crate::{Result, SgmError};

/// All 16 aggregation directions, ordered so the first `n` entries form the
/// nested 1/2/4/8/16 direction sets.
const DIRECTIONS: [(i32, i32); 16] = [
    (1, 0),
    (-1, 0),
    (0, 1),
    (0, -1),
    (1, 1),
    (-1, -1),
    (-1, 1),
    (1, -1),
    (1, 2),
    (2, 1),
    (2, -1),
    (1, -2),
    (-1, -2),
    (-2, -1),
    (-2, 1),
    (-1, 2),
];

/// One 1-D scan line through the tensor: a border starting pixel and a
/// constant step.
#[derive(Debug, Clone, Copy)]
struct Trajectory {
    x0: usize,
    y0: usize,
    dx: i32,
    dy: i32,
}

/// Sums path costs along 1 to 16 directions into an aggregated tensor the
/// same shape as the input cost tensor. Directions run sequentially;
/// trajectories within one direction run in parallel, each worker owning a
/// private scratch buffer.
pub struct PathAggregator {
    pub paths: SgmPaths,
    pub penalty1: u16,
    pub penalty2: u16,
    pub use_parallel: bool,

    aggregated: CostTensor,
    trajectories: Vec<Trajectory>,
    // Scratch for the sequential path, reused across directions
    scratch: Vec<u16>,
}

impl Default for PathAggregator {
    fn default() -> Self {
        Self {
            paths: SgmPaths::P8,
            penalty1: 200,
            penalty2: 2000,
            use_parallel: true,
            aggregated: CostTensor::new(),
            trajectories: Vec::new(),
            scratch: Vec::new(),
        }
    }
}

impl PathAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Aggregates `cost` over the configured directions. The result is
    /// available through [`aggregated`](Self::aggregated) until the next
    /// call.
    pub fn process(&mut self, cost: &CostTensor) -> Result<()> {
        if cost.disparity_range == 0 {
            return Err(SgmError::InvalidConfiguration(
                "cost tensor has an empty disparity range".to_string(),
            ));
        }
        if self.penalty2 > MAX_COST {
            return Err(SgmError::InvalidConfiguration(format!(
                "penalty2 {} exceeds MAX_COST {}",
                self.penalty2, MAX_COST
            )));
        }

        self.aggregated.reshape_like(cost);
        self.aggregated.fill(0);

        for &(dx, dy) in &DIRECTIONS[..self.paths.count()] {
            self.score_direction(cost, dx, dy);
        }

        Ok(())
    }

    pub fn aggregated(&self) -> &CostTensor {
        &self.aggregated
    }

    /// Scores every trajectory of one direction and adds the results into
    /// the aggregated tensor.
    ///
    /// Concurrency note: trajectories of a single direction visit disjoint
    /// pixels, so their additions into the aggregated tensor need no
    /// synchronization as long as work is partitioned by trajectory.
    fn score_direction(&mut self, cost: &CostTensor, dx: i32, dy: i32) {
        self.make_trajectories(cost, dx, dy);
        if self.trajectories.is_empty() {
            return;
        }

        let scratch_len = cost.width.max(cost.height) * cost.disparity_range;
        let penalty1 = self.penalty1;
        let penalty2 = self.penalty2;

        if self.use_parallel {
            let data = self.aggregated.data_mut();
            let writer = DisjointWriter {
                ptr: data.as_mut_ptr(),
                len: data.len(),
            };
            self.trajectories.par_iter().for_each_init(
                || vec![0u16; scratch_len],
                |work, &t| {
                    let length = score_path(cost, penalty1, penalty2, t, work);
                    // SAFETY: no two trajectories of this direction share a
                    // pixel, so all writes through `writer` are disjoint.
                    unsafe { accumulate_shared(&writer, cost, t, length, work) };
                },
            );
        } else {
            if self.scratch.len() != scratch_len {
                self.scratch = vec![0; scratch_len];
            }
            let mut work = std::mem::take(&mut self.scratch);
            for &t in &self.trajectories {
                let length = score_path(cost, penalty1, penalty2, t, &mut work);
                accumulate(self.aggregated.data_mut(), cost, t, length, &work);
            }
            self.scratch = work;
        }
    }

    /// Enumerates the border-starting trajectories of one direction so that
    /// every pixel in the effective region (columns at or right of
    /// `disparity_min`) lies on exactly one of them. Directions with a step
    /// component of 2 seed two border rows/columns, otherwise pixels of the
    /// other parity would never be visited.
    fn make_trajectories(&mut self, cost: &CostTensor, dx: i32, dy: i32) {
        self.trajectories.clear();

        let x_min = cost.disparity_min;
        let x_max = cost.width;
        let height = cost.height;
        if x_min >= x_max || height == 0 {
            return;
        }

        let seed_x = dx.unsigned_abs() as usize;
        let seed_y = dy.unsigned_abs() as usize;

        if dx > 0 {
            for x0 in x_min..(x_min + seed_x).min(x_max) {
                for y0 in 0..height {
                    self.trajectories.push(Trajectory { x0, y0, dx, dy });
                }
            }
        } else if dx < 0 {
            for x0 in x_max.saturating_sub(seed_x).max(x_min)..x_max {
                for y0 in 0..height {
                    self.trajectories.push(Trajectory { x0, y0, dx, dy });
                }
            }
        }

        if dy != 0 {
            // Columns already covered by the vertical seeds are excluded
            let lo = if dx > 0 {
                (x_min + seed_x).min(x_max)
            } else {
                x_min
            };
            let hi = if dx < 0 {
                x_max.saturating_sub(seed_x).max(x_min)
            } else {
                x_max
            };
            let rows: Vec<usize> = if dy > 0 {
                (0..seed_y.min(height)).collect()
            } else {
                (height.saturating_sub(seed_y)..height).collect()
            };
            for y0 in rows {
                for x0 in lo..hi {
                    self.trajectories.push(Trajectory { x0, y0, dx, dy });
                }
            }
        }
    }
}

/// Steps along an axis before the coordinate leaves `[lo, hi)`.
#[inline]
fn axis_steps(t0: usize, step: i32, lo: usize, hi: usize) -> usize {
    if step > 0 {
        let s = step as usize;
        (hi - t0 + s - 1) / s
    } else if step < 0 {
        let s = (-step) as usize;
        (t0 - lo + s) / s
    } else {
        usize::MAX
    }
}

fn path_length(cost: &CostTensor, t: Trajectory) -> usize {
    let px = axis_steps(t.x0, t.dx, cost.disparity_min, cost.width);
    let py = axis_steps(t.y0, t.dy, 0, cost.height);
    px.min(py)
}

/// Runs the path recurrence over one trajectory, writing row `i` of the
/// path's cost into `work[i * disparity_range ..]`. Returns the path length.
fn score_path(
    cost: &CostTensor,
    penalty1: u16,
    penalty2: u16,
    t: Trajectory,
    work: &mut [u16],
) -> usize {
    let len_d = cost.disparity_range;
    let length = path_length(cost, t);

    // Base case: no previous step, the path cost is the raw matching cost
    {
        let local = cost.local_range_left(t.x0);
        let src = cost.pixel(t.x0, t.y0);
        work[..local].copy_from_slice(&src[..local]);
        subtract_min(&mut work[..local]);
        pad_upper_entries(&mut work[..len_d], local);
    }

    let mut x = t.x0;
    let mut y = t.y0;
    for i in 1..length {
        x = (x as i64 + t.dx as i64) as usize;
        y = (y as i64 + t.dy as i64) as usize;
        let local = cost.local_range_left(x);
        let cost_px = cost.pixel(x, y);

        let (head, tail) = work.split_at_mut(i * len_d);
        let prev = &head[(i - 1) * len_d..];
        let cur = &mut tail[..len_d];

        // d = 0 border: the d-1 neighbor does not exist
        {
            let above = if local > 1 { prev[1] + penalty1 } else { MAX_COST };
            let m = prev[0].min(above).min(penalty2);
            cur[0] = cost_px[0] + m;
        }

        // Interior disparities, no bounds checks needed
        for d in 1..local.saturating_sub(1) {
            let a = prev[d];
            let b = prev[d - 1] + penalty1;
            let c = prev[d + 1] + penalty1;
            let m = a.min(b).min(c).min(penalty2);
            cur[d] = cost_px[d] + m;
        }

        // d = local-1 border: the d+1 neighbor is outside the local range
        if local > 1 {
            let d = local - 1;
            let below = prev[d - 1] + penalty1;
            let m = prev[d].min(below).min(MAX_COST).min(penalty2);
            cur[d] = cost_px[d] + m;
        }

        subtract_min(&mut cur[..local]);
        pad_upper_entries(cur, local);
    }

    length
}

/// When the local disparity range grows along the path (columns near the
/// left border), the next step reads "the previous column's last index"
/// past what was just computed. Duplicating the last computed entry keeps
/// those reads off uninitialized scratch; two entries cover the step-2
/// directions where the range can grow by two per step.
#[inline]
fn pad_upper_entries(row: &mut [u16], local: usize) {
    if local == 0 {
        return;
    }
    let value = row[local - 1];
    let end = (local + 2).min(row.len());
    for v in row.iter_mut().take(end).skip(local) {
        *v = value;
    }
}

/// Adds one scored path onto the aggregated tensor.
fn accumulate(aggregated: &mut [u16], cost: &CostTensor, t: Trajectory, length: usize, work: &[u16]) {
    let len_d = cost.disparity_range;
    let mut x = t.x0;
    let mut y = t.y0;
    for i in 0..length {
        let local = cost.local_range_left(x);
        let base = cost.index(x, y);
        let row = &work[i * len_d..i * len_d + local];
        for (d, &v) in row.iter().enumerate() {
            aggregated[base + d] = aggregated[base + d].saturating_add(v);
        }
        x = (x as i64 + t.dx as i64) as usize;
        y = (y as i64 + t.dy as i64) as usize;
    }
}

/// Shared view of the aggregated tensor used for trajectory-parallel
/// accumulation. Sound only while writes from different trajectories are
/// guaranteed disjoint.
struct DisjointWriter {
    ptr: *mut u16,
    len: usize,
}

unsafe impl Send for DisjointWriter {}
unsafe impl Sync for DisjointWriter {}

/// # Safety
/// Every `(x, y)` visited by `t` must be owned exclusively by this call.
unsafe fn accumulate_shared(
    writer: &DisjointWriter,
    cost: &CostTensor,
    t: Trajectory,
    length: usize,
    work: &[u16],
) {
    let len_d = cost.disparity_range;
    let mut x = t.x0;
    let mut y = t.y0;
    for i in 0..length {
        let local = cost.local_range_left(x);
        let base = cost.index(x, y);
        debug_assert!(base + local <= writer.len);
        let row = &work[i * len_d..i * len_d + local];
        for (d, &v) in row.iter().enumerate() {
            let cell = writer.ptr.add(base + d);
            *cell = (*cell).saturating_add(v);
        }
        x = (x as i64 + t.dx as i64) as usize;
        y = (y as i64 + t.dy as i64) as usize;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::{AbsoluteDifferenceCost, CostVolumeBuilder};
    use image::{GrayImage, Luma};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Every direction's trajectories must cover every effective pixel
    /// exactly once, including the knight-move directions.
    #[test]
    fn test_trajectories_cover_each_pixel_once() {
        let mut cost = CostTensor::new();
        cost.reshape(13, 9, 2, 4);

        let mut alg = PathAggregator::new();
        for &(dx, dy) in DIRECTIONS.iter() {
            alg.make_trajectories(&cost, dx, dy);
            let mut visits = vec![0u32; 13 * 9];
            for &t in &alg.trajectories {
                let length = path_length(&cost, t);
                let mut x = t.x0;
                let mut y = t.y0;
                for _ in 0..length {
                    visits[y * 13 + x] += 1;
                    x = (x as i64 + t.dx as i64) as usize;
                    y = (y as i64 + t.dy as i64) as usize;
                }
            }
            for y in 0..9 {
                for x in 0..13 {
                    let expected = if x >= 2 { 1 } else { 0 };
                    assert_eq!(
                        visits[y * 13 + x],
                        expected,
                        "direction ({dx},{dy}) pixel ({x},{y})"
                    );
                }
            }
        }
    }

    fn step_pair(width: u32, height: u32, step_x: u32, disparity: u32) -> (GrayImage, GrayImage) {
        let mut left = GrayImage::new(width, height);
        let mut right = GrayImage::new(width, height);
        for y in 0..height {
            for x in 0..width {
                let lv = if x >= step_x { 100 } else { 0 };
                let rv = if x + disparity >= step_x { 100 } else { 0 };
                left.put_pixel(x, y, Luma([lv]));
                right.put_pixel(x, y, Luma([rv]));
            }
        }
        (left, right)
    }

    /// A step edge shifted by a known disparity must win the arg-min at
    /// every interior pixel. Axis-aligned path sets only; diagonal paths
    /// give noisier answers near the border.
    #[test]
    fn test_step_edge_recovers_disparity() {
        let expected = 5usize;
        let (left, right) = step_pair(40, 30, 22, expected as u32);

        let mut builder = AbsoluteDifferenceCost::new();
        builder.configure(0, 20);
        let mut cost = CostTensor::new();
        builder.process(&left, &right, &mut cost).unwrap();

        for paths in [SgmPaths::P2, SgmPaths::P4] {
            let mut alg = PathAggregator::new();
            alg.paths = paths;
            alg.use_parallel = false;
            alg.process(&cost).unwrap();
            let aggregated = alg.aggregated();

            for y in 0..30 {
                for x in expected..(40 - expected) {
                    let local = aggregated.local_range_left(x);
                    let best = aggregated.pixel(x, y)[..local]
                        .iter()
                        .enumerate()
                        .min_by_key(|&(_, &v)| v)
                        .map(|(d, _)| d)
                        .unwrap();
                    assert_eq!(best, expected, "paths {:?} pixel ({x},{y})", paths);
                }
            }
        }
    }

    fn random_cost(width: usize, height: usize, min: usize, range: usize) -> CostTensor {
        let mut rng = StdRng::seed_from_u64(234);
        let mut cost = CostTensor::new();
        cost.reshape(width, height, min, range);
        for v in cost.data_mut().iter_mut() {
            *v = rng.gen_range(0..=MAX_COST);
        }
        cost
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let cost = random_cost(31, 23, 3, 10);

        for paths in [SgmPaths::P1, SgmPaths::P4, SgmPaths::P8, SgmPaths::P16] {
            let mut seq = PathAggregator::new();
            seq.paths = paths;
            seq.use_parallel = false;
            seq.process(&cost).unwrap();

            let mut par = PathAggregator::new();
            par.paths = paths;
            par.use_parallel = true;
            par.process(&cost).unwrap();

            assert_eq!(
                seq.aggregated().data(),
                par.aggregated().data(),
                "paths {:?}",
                paths
            );
        }
    }

    #[test]
    fn test_repeated_runs_are_identical() {
        let cost = random_cost(25, 18, 0, 8);

        let mut alg = PathAggregator::new();
        alg.process(&cost).unwrap();
        let first = alg.aggregated().data().to_vec();
        alg.process(&cost).unwrap();
        assert_eq!(first, alg.aggregated().data());
    }

    /// Raising the penalties never shrinks the aggregated margin of a
    /// non-zero disparity over the true one.
    #[test]
    fn test_penalty_monotonicity() {
        let mut cost = CostTensor::new();
        cost.reshape(20, 10, 0, 8);
        for y in 0..10 {
            for x in 0..20 {
                let local = cost.local_range_left(x);
                let px = cost.pixel_mut(x, y);
                for d in 0..8 {
                    px[d] = if d == 0 && d < local { 0 } else { MAX_COST };
                }
            }
        }

        let margins = |p1: u16, p2: u16| -> Vec<i64> {
            let mut alg = PathAggregator::new();
            alg.paths = SgmPaths::P4;
            alg.penalty1 = p1;
            alg.penalty2 = p2;
            alg.use_parallel = false;
            alg.process(&cost).unwrap();
            let a = alg.aggregated();
            let mut out = Vec::new();
            for y in 0..10 {
                for x in 0..20 {
                    let local = a.local_range_left(x);
                    let px = a.pixel(x, y);
                    for d in 1..local {
                        out.push(px[d] as i64 - px[0] as i64);
                    }
                }
            }
            out
        };

        let low = margins(50, 500);
        let high = margins(200, 2000);
        for (&lo, &hi) in low.iter().zip(high.iter()) {
            assert!(hi >= lo, "margin shrank: {lo} -> {hi}");
        }
    }

    /// The per-step normalization keeps path costs from drifting upward:
    /// uniform input cost yields an all-zero aggregated tensor no matter how
    /// long the paths are or how many directions run.
    #[test]
    fn test_normalization_cancels_uniform_cost() {
        let mut cost = CostTensor::new();
        cost.reshape(64, 48, 0, 6);
        for v in cost.data_mut().iter_mut() {
            *v = MAX_COST;
        }

        let mut alg = PathAggregator::new();
        alg.paths = SgmPaths::P16;
        alg.penalty2 = MAX_COST;
        alg.use_parallel = false;
        alg.process(&cost).unwrap();

        assert!(alg.aggregated().data().iter().all(|&v| v == 0));
    }
}
