use super::PixelBuffer;
use crate::error::{Error, Result};

/// Mean squared error over every channel of two equally sized buffers.
pub fn pixel_diff(a: &PixelBuffer, b: &PixelBuffer) -> Result<f64> {
    if a.dimensions() != b.dimensions() {
        let (found_x, found_y) = b.dimensions();
        return Err(Error::SizeMismatch {
            path: Default::default(),
            expected: a.width(),
            found_x,
            found_y,
        });
    }

    let (a, b) = (a.as_raw(), b.as_raw());
    if a.is_empty() {
        return Ok(0.0);
    }

    let sum: u64 = a
        .iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let d = x as i64 - y as i64;
            (d * d) as u64
        })
        .sum();
    Ok(sum as f64 / a.len() as f64)
}

/// Lowest score between `a` and each quarter turn of `b`.
pub fn min_rotated_diff<K>(kernel: &K, a: &PixelBuffer, b: &PixelBuffer) -> Result<f64>
where
    K: super::Kernel + ?Sized,
{
    let mut best = kernel.pixel_diff(a, b)?;
    let mut turned = b.clone();
    for _ in 0..3 {
        if best == 0.0 {
            break;
        }
        turned = kernel.rotate90(&turned);
        // Non-square buffers change shape when turned.
        if turned.dimensions() != a.dimensions() {
            continue;
        }
        best = best.min(kernel.pixel_diff(a, &turned)?);
    }
    Ok(best)
}
