use image::imageops;
use sha2::{Digest, Sha256};

use super::PixelBuffer;
use crate::error::{Error, Result};

/// SHA-256 hex digests of a buffer rotated by 0, 90, 180 and 270 degrees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationHashes(pub [String; 4]);

impl RotationHashes {
    pub fn rot0(&self) -> &str {
        &self.0[0]
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|h| h.as_str())
    }
}

/// Quantize pixel values by `shift` bits: right for positive values, left
/// (truncating) for negative ones.
fn quantize(bytes: &[u8], shift: i8) -> Vec<u8> {
    match shift {
        0 => bytes.to_vec(),
        s if s > 0 => bytes.iter().map(|b| b >> s).collect(),
        s => {
            let s = s.unsigned_abs();
            bytes.iter().map(|b| b.wrapping_shl(s as u32)).collect()
        }
    }
}

fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn hash_rotations(buffer: &PixelBuffer, shift: i8) -> Result<RotationHashes> {
    if !(-7..=7).contains(&shift) {
        return Err(Error::Hash(format!("shift {} outside [-7, 7]", shift)));
    }
    if buffer.width() == 0 || buffer.height() == 0 {
        return Err(Error::Hash("cannot hash an empty buffer".to_string()));
    }

    let quantized = PixelBuffer::from_raw(buffer.width(), buffer.height(), quantize(buffer.as_raw(), shift))
        .ok_or_else(|| Error::Hash("quantized buffer has the wrong length".to_string()))?;

    let rot90 = imageops::rotate90(&quantized);
    let rot180 = imageops::rotate180(&quantized);
    let rot270 = imageops::rotate270(&quantized);

    Ok(RotationHashes([
        digest(quantized.as_raw()),
        digest(rot90.as_raw()),
        digest(rot180.as_raw()),
        digest(rot270.as_raw()),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn gradient(size: u32) -> PixelBuffer {
        PixelBuffer::from_fn(size, size, |x, y| Rgb([(x * 16) as u8, (y * 16) as u8, 7]))
    }

    #[test]
    fn test_rotated_copy_shares_a_hash() {
        let img = gradient(8);
        let rotated = imageops::rotate90(&img);

        let original = hash_rotations(&img, 4).unwrap();
        let turned = hash_rotations(&rotated, 4).unwrap();

        assert_ne!(original.rot0(), turned.rot0());
        assert!(original.iter().any(|h| h == turned.rot0()));
    }

    #[test]
    fn test_shift_absorbs_small_noise() {
        let img = gradient(8);
        let mut noisy = img.clone();
        noisy.get_pixel_mut(3, 3).0[2] = 9;

        assert_eq!(
            hash_rotations(&img, 4).unwrap().rot0(),
            hash_rotations(&noisy, 4).unwrap().rot0()
        );
        assert_ne!(
            hash_rotations(&img, 0).unwrap().rot0(),
            hash_rotations(&noisy, 0).unwrap().rot0()
        );
    }

    #[test]
    fn test_negative_shift_truncates() {
        assert_eq!(quantize(&[0b1000_0001, 3], -1), vec![0b0000_0010, 6]);
        assert_eq!(quantize(&[0b1111_0000], 4), vec![0b0000_1111]);
    }

    #[test]
    fn test_out_of_range_shift() {
        assert!(matches!(hash_rotations(&gradient(4), 8), Err(Error::Hash(_))));
    }
}
