use image::{GenericImage, Rgb, RgbImage};
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::PixelBuffer;
use crate::error::{Error, Result};

/// Attempts made by [`reserve_filename`] before giving up.
pub const MAX_FILENAME_ATTEMPTS: usize = 1000;

const GAP: u32 = 2;

/// Claim a free `stem.png`, `stem_1.png`, ... in `dir` by creating the file
/// exclusively. The file is left empty for the caller to overwrite.
pub fn reserve_filename(dir: &Path, stem: &str, attempts: usize) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;

    for attempt in 0..attempts {
        let name = if attempt == 0 {
            format!("{}.png", stem)
        } else {
            format!("{}_{}.png", stem, attempt)
        };
        let candidate = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }

    Err(Error::FilenameExhausted {
        stem: stem.to_string(),
        attempts,
    })
}

/// Write `a`, `b` and their per-pixel absolute difference side by side.
/// The difference panel is stretched so the largest deviation is white.
pub fn make_diff_plot(a: &PixelBuffer, b: &PixelBuffer, score: f64, path: &Path) -> Result<()> {
    let (w, h) = a.dimensions();
    if b.dimensions() != (w, h) {
        return Err(Error::SizeMismatch {
            path: path.to_path_buf(),
            expected: w,
            found_x: b.width(),
            found_y: b.height(),
        });
    }

    let mut delta = RgbImage::new(w, h);
    let mut peak = 1u8;
    for (x, y, pa) in a.enumerate_pixels() {
        let pb = b.get_pixel(x, y);
        let d = Rgb([
            pa[0].abs_diff(pb[0]),
            pa[1].abs_diff(pb[1]),
            pa[2].abs_diff(pb[2]),
        ]);
        peak = peak.max(d[0]).max(d[1]).max(d[2]);
        delta.put_pixel(x, y, d);
    }
    for px in delta.pixels_mut() {
        for c in px.0.iter_mut() {
            *c = ((*c as u32 * 255) / peak as u32) as u8;
        }
    }

    let mut canvas = RgbImage::from_pixel(w * 3 + GAP * 2, h, Rgb([255, 255, 255]));
    canvas.copy_from(a, 0, 0)?;
    canvas.copy_from(b, w + GAP, 0)?;
    canvas.copy_from(&delta, (w + GAP) * 2, 0)?;
    canvas.save(path)?;

    debug!(path = %path.display(), score, "Wrote diff plot");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reservation_skips_taken_names() {
        let dir = tempfile::tempdir().unwrap();
        let first = reserve_filename(dir.path(), "0_1", 3).unwrap();
        let second = reserve_filename(dir.path(), "0_1", 3).unwrap();
        assert!(first.ends_with("0_1.png"));
        assert!(second.ends_with("0_1_1.png"));
    }

    #[test]
    fn test_reservation_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        reserve_filename(dir.path(), "x", 2).unwrap();
        reserve_filename(dir.path(), "x", 2).unwrap();
        assert!(matches!(
            reserve_filename(dir.path(), "x", 2),
            Err(Error::FilenameExhausted { attempts: 2, .. })
        ));
    }

    #[test]
    fn test_plot_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plot.png");
        let a = PixelBuffer::from_pixel(4, 4, Rgb([0, 0, 0]));
        let b = PixelBuffer::from_pixel(4, 4, Rgb([0, 50, 0]));

        make_diff_plot(&a, &b, 833.3, &path).unwrap();
        let plot = image::open(&path).unwrap().to_rgb8();
        assert_eq!(plot.dimensions(), (4 * 3 + GAP * 2, 4));
        assert_eq!(plot.get_pixel(4 * 2 + GAP * 2, 0), &Rgb([0, 255, 0]));
    }
}
