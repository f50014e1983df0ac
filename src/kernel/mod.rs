//! Image fingerprint kernel: decode, resize, hash and diff primitives.
//!
//! Everything here is a pure function over pixel buffers or a single file.
//! The scheduler reaches these through the [`Kernel`] trait so a different
//! implementation (or a wrapper that counts calls) can be swapped in.

pub mod diff;
pub mod hashing;
pub mod plot;
pub mod thumbnails;

use image::imageops::FilterType;
use image::RgbImage;
use std::path::Path;

use crate::error::{Error, Result};

pub use hashing::RotationHashes;
pub use plot::reserve_filename;
pub use thumbnails::ThumbnailStore;

/// Square 8-bit RGB buffer of `target_size x target_size` pixels.
pub type PixelBuffer = RgbImage;

/// A decoded image: the comparison buffer plus the original dimensions.
#[derive(Debug, Clone)]
pub struct Decoded {
    pub pixels: PixelBuffer,
    pub width: u32,
    pub height: u32,
}

pub trait Kernel: Send + Sync {
    fn decode_and_resize(&self, path: &Path, target_size: u32) -> Result<Decoded> {
        decode_and_resize(path, target_size)
    }

    /// Load a stored thumbnail, resizing it only when `allow_resize` is set.
    fn load_thumbnail(&self, path: &Path, target_size: u32, allow_resize: bool) -> Result<PixelBuffer> {
        thumbnails::load_thumbnail(path, target_size, allow_resize)
    }

    fn rotate90(&self, buffer: &PixelBuffer) -> PixelBuffer {
        image::imageops::rotate90(buffer)
    }

    fn hash_rotations(&self, buffer: &PixelBuffer, shift: i8) -> Result<RotationHashes> {
        hashing::hash_rotations(buffer, shift)
    }

    fn pixel_diff(&self, a: &PixelBuffer, b: &PixelBuffer) -> Result<f64> {
        diff::pixel_diff(a, b)
    }

    fn store_thumbnail(&self, buffer: &PixelBuffer, path: &Path) -> Result<()> {
        thumbnails::store_thumbnail(buffer, path)
    }

    fn make_diff_plot(&self, a: &PixelBuffer, b: &PixelBuffer, score: f64, path: &Path) -> Result<()> {
        plot::make_diff_plot(a, b, score, path)
    }
}

/// CPU kernel backed by the `image` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageKernel;

impl Kernel for ImageKernel {}

pub fn decode_and_resize(path: &Path, target_size: u32) -> Result<Decoded> {
    let img = image::open(path).map_err(|e| Error::Decode {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let (width, height) = (img.width(), img.height());
    if width == 0 || height == 0 {
        return Err(Error::Decode {
            path: path.to_path_buf(),
            message: "image has no pixels".to_string(),
        });
    }

    let pixels = img
        .resize_exact(target_size, target_size, FilterType::Triangle)
        .to_rgb8();
    Ok(Decoded {
        pixels,
        width,
        height,
    })
}


#[cfg(test)]
mod tests {
    use super::testing::write_png;
    use super::*;

    #[test]
    fn test_decode_keeps_original_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "wide.png", 40, 20, 80);

        let decoded = ImageKernel.decode_and_resize(&path, 16).unwrap();
        assert_eq!((decoded.width, decoded.height), (40, 20));
        assert_eq!(decoded.pixels.dimensions(), (16, 16));
    }

    #[test]
    fn test_decode_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"not an image").unwrap();

        match ImageKernel.decode_and_resize(&path, 16) {
            Err(Error::Decode { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected decode error, got {:?}", other.map(|d| d.width)),
        }
    }
}
