//! Census transform: encodes each pixel's 5x5 neighborhood as a bit string
//! recording which neighbors are brighter than the center. Matching census
//! codes with a Hamming distance is robust to radiometric differences
//! between the two cameras.

use image::GrayImage;
use rayon::prelude::*;

/// Bits produced per pixel by [`census_transform_5x5`]: the 5x5 window minus
/// its center.
pub const CENSUS_BITS_5X5: u32 = 24;

/// Computes the 5x5 census code for every pixel. Samples outside the image
/// are clamped to the nearest border pixel.
pub fn census_transform_5x5(src: &GrayImage) -> Vec<u32> {
    let width = src.width() as usize;
    let height = src.height() as usize;
    let data = src.as_raw();

    let mut codes = vec![0u32; width * height];

    codes
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, code) in row.iter_mut().enumerate() {
                *code = census_code(data, width, height, x, y);
            }
        });

    codes
}

#[inline]
fn census_code(data: &[u8], width: usize, height: usize, x: usize, y: usize) -> u32 {
    let center = data[y * width + x];
    let mut code = 0u32;

    for dy in -2i32..=2 {
        let sy = (y as i32 + dy).clamp(0, height as i32 - 1) as usize;
        for dx in -2i32..=2 {
            if dx == 0 && dy == 0 {
                continue;
            }
            let sx = (x as i32 + dx).clamp(0, width as i32 - 1) as usize;
            code <<= 1;
            if data[sy * width + sx] > center {
                code |= 1;
            }
        }
    }

    code
}

/// Hamming distance between two census codes.
#[inline]
pub fn hamming(a: u32, b: u32) -> u32 {
    (a ^ b).count_ones()
}
