use image::imageops::FilterType;
use std::fs;
use std::path::{Path, PathBuf};

use super::PixelBuffer;
use crate::db::Side;
use crate::error::{Error, Result};

/// Where preprocessing writes comparison thumbnails.
#[derive(Debug, Clone)]
pub struct ThumbnailStore {
    dir: PathBuf,
}

impl ThumbnailStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// One file per image, named after its side and key.
    pub fn path_for(&self, side: Side, key: i64) -> PathBuf {
        self.dir.join(format!("{}_{:08}.png", side.tag(), key))
    }
}

pub fn store_thumbnail(buffer: &PixelBuffer, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    buffer.save(path)?;
    Ok(())
}

pub fn load_thumbnail(path: &Path, target_size: u32, allow_resize: bool) -> Result<PixelBuffer> {
    let img = image::open(path).map_err(|e| Error::Decode {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    if img.width() == target_size && img.height() == target_size {
        return Ok(img.to_rgb8());
    }
    if !allow_resize {
        return Err(Error::SizeMismatch {
            path: path.to_path_buf(),
            expected: target_size,
            found_x: img.width(),
            found_y: img.height(),
        });
    }
    Ok(img
        .resize_exact(target_size, target_size, FilterType::Triangle)
        .to_rgb8())
}
