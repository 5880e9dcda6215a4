//! Discrete image pyramid with nearest-neighbor 2x downsampling, used by
//! the hierarchical mutual-information pipeline.

use image::GrayImage;
use rayon::prelude::*;

/// Pyramid of progressively halved images. Level 0 is the full-resolution
/// input; each level halves both dimensions (rounding up, so no level ever
/// becomes empty).
#[derive(Debug, Clone)]
pub struct ImagePyramid {
    levels: Vec<GrayImage>,
}

impl ImagePyramid {
    pub fn build(src: &GrayImage, num_levels: usize) -> Self {
        let mut levels = Vec::with_capacity(num_levels.max(1));
        levels.push(src.clone());
        for i in 1..num_levels {
            let next = downsample_half(&levels[i - 1]);
            levels.push(next);
        }
        Self { levels }
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn level(&self, index: usize) -> &GrayImage {
        &self.levels[index]
    }

    /// Downsampling factor of a level relative to the original image.
    pub fn scale(&self, index: usize) -> usize {
        1 << index
    }
}

/// Halves both dimensions by keeping every second pixel.
pub fn downsample_half(src: &GrayImage) -> GrayImage {
    let src_width = src.width() as usize;
    let dst_width = src_width.div_ceil(2);
    let dst_height = (src.height() as usize).div_ceil(2);
    let src_data = src.as_raw();

    let mut data = vec![0u8; dst_width * dst_height];
    data.par_chunks_mut(dst_width)
        .enumerate()
        .for_each(|(y, row)| {
            let src_row = &src_data[(y * 2) * src_width..];
            for (x, out) in row.iter_mut().enumerate() {
                *out = src_row[x * 2];
            }
        });

    GrayImage::from_raw(dst_width as u32, dst_height as u32, data)
        .expect("buffer sized from dimensions")
}

/// Number of pyramid levels that keeps the coarsest level's disparity range
/// at least `min_range` and its smaller image dimension at least 32 pixels.
pub fn suggested_levels(
    width: usize,
    height: usize,
    disparity_range: usize,
    min_range: usize,
) -> usize {
    let mut levels = 1usize;
    loop {
        let scale = 1usize << levels;
        if disparity_range / scale < min_range
            || width / scale < 32
            || height / scale < 32
        {
            return levels;
        }
        levels += 1;
    }
}
