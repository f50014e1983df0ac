//! Decoded image buffers for the blocks currently being compared.

use rayon::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::db::ImageRecord;
use crate::error::Result;
use crate::kernel::{Kernel, PixelBuffer};

/// A decoded buffer, or the message of the error that prevented it.
pub type CachedBuffer = std::result::Result<Arc<PixelBuffer>, String>;

/// Turns an image into its comparison buffer, preferring the thumbnail the
/// store recorded for it.
pub struct ImageLoader<K: Kernel> {
    kernel: Arc<K>,
    target_size: u32,
    use_thumbnails: bool,
    allow_resize: bool,
}

impl<K: Kernel> ImageLoader<K> {
    pub fn new(kernel: Arc<K>, target_size: u32, use_thumbnails: bool, allow_resize: bool) -> Self {
        Self {
            kernel,
            target_size,
            use_thumbnails,
            allow_resize,
        }
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// `thumbnail` must come from the store ([`ImageRecord::stored_thumbnail`]);
    /// without one the original is decoded.
    pub fn load(&self, path: &Path, thumbnail: Option<&Path>) -> Result<PixelBuffer> {
        match thumbnail {
            Some(thumb) if self.use_thumbnails => {
                self.kernel
                    .load_thumbnail(thumb, self.target_size, self.allow_resize)
            }
            _ => Ok(self.kernel.decode_and_resize(path, self.target_size)?.pixels),
        }
    }

    /// An image that failed preprocessing is not read again: its stored
    /// error is returned instead.
    pub fn load_record(&self, image: &ImageRecord) -> std::result::Result<PixelBuffer, String> {
        if let Some(failure) = image.failure() {
            return Err(failure.to_string());
        }
        self.load(&image.path, image.stored_thumbnail())
            .map_err(|e| e.to_string())
    }
}

impl<K: Kernel> Clone for ImageLoader<K> {
    fn clone(&self) -> Self {
        Self {
            kernel: self.kernel.clone(),
            target_size: self.target_size,
            use_thumbnails: self.use_thumbnails,
            allow_resize: self.allow_resize,
        }
    }
}

/// Buffers for one block, keyed by image key. In the single-directory
/// layout rows and columns are the same images and share one map, so a key
/// on the diagonal is decoded once.
#[derive(Debug, Default)]
pub struct BlockCache {
    rows: HashMap<i64, CachedBuffer>,
    cols: Option<HashMap<i64, CachedBuffer>>,
}

impl BlockCache {
    /// Decode `row_keys` and `col_keys` in parallel. Entries already present
    /// in `reuse` (row buffers of the previous block in the same band) are
    /// shared instead of decoded again.
    pub fn build<K: Kernel>(
        loader: &ImageLoader<K>,
        images_a: &[ImageRecord],
        images_b: Option<&[ImageRecord]>,
        row_keys: &[i64],
        col_keys: &[i64],
        reuse: &HashMap<i64, CachedBuffer>,
    ) -> Self {
        match images_b {
            None => {
                let mut keys: Vec<i64> = row_keys.iter().chain(col_keys).copied().collect();
                keys.sort_unstable();
                keys.dedup();
                Self {
                    rows: decode_all(loader, images_a, &keys, reuse),
                    cols: None,
                }
            }
            Some(images_b) => Self {
                rows: decode_all(loader, images_a, row_keys, reuse),
                cols: Some(decode_all(loader, images_b, col_keys, &HashMap::new())),
            },
        }
    }

    pub fn row(&self, key: i64) -> Option<&CachedBuffer> {
        self.rows.get(&key)
    }

    pub fn col(&self, key: i64) -> Option<&CachedBuffer> {
        self.cols.as_ref().unwrap_or(&self.rows).get(&key)
    }

    pub fn is_shared(&self) -> bool {
        self.cols.is_none()
    }

    /// Distinct buffers held.
    pub fn len(&self) -> usize {
        self.rows.len() + self.cols.as_ref().map_or(0, |c| c.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row entries, for reuse by the next block of the band.
    pub fn rows_for(&self, keys: &[i64]) -> HashMap<i64, CachedBuffer> {
        keys.iter()
            .filter_map(|k| self.rows.get(k).map(|b| (*k, b.clone())))
            .collect()
    }
}

fn decode_all<K: Kernel>(
    loader: &ImageLoader<K>,
    images: &[ImageRecord],
    keys: &[i64],
    reuse: &HashMap<i64, CachedBuffer>,
) -> HashMap<i64, CachedBuffer> {
    let mut buffers: HashMap<i64, CachedBuffer> = HashMap::with_capacity(keys.len());
    let missing: Vec<i64> = keys
        .iter()
        .copied()
        .filter(|k| match reuse.get(k) {
            Some(buffer) => {
                buffers.insert(*k, buffer.clone());
                false
            }
            None => true,
        })
        .collect();

    let decoded: Vec<(i64, CachedBuffer)> = missing
        .par_iter()
        .map(|&key| {
            let buffer = match images.get(key as usize) {
                Some(image) => loader.load_record(image).map(Arc::new),
                None => Err(format!("no image with key {}", key)),
            };
            (key, buffer)
        })
        .collect();
    buffers.extend(decoded);
    buffers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ImageStatus, Side};
    use crate::kernel::testing::{write_png, CountingKernel};
    use crate::kernel::ThumbnailStore;
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;

    fn record(side: Side, key: i64, path: PathBuf) -> ImageRecord {
        ImageRecord {
            key,
            side,
            filename: String::new(),
            path,
            status: ImageStatus::Done,
            px: None,
            py: None,
            hashes: [None; 4],
            thumbnail: None,
            error: None,
        }
    }

    fn images(dir: &std::path::Path, side: Side, n: i64) -> Vec<ImageRecord> {
        (0..n)
            .map(|k| {
                let name = format!("{}{}.png", side.tag(), k);
                record(side, k, write_png(dir, &name, 10, 10, (k * 30) as u8))
            })
            .collect()
    }

    #[test]
    fn test_diagonal_decodes_each_key_once() {
        let dir = tempfile::tempdir().unwrap();
        let a = images(dir.path(), Side::A, 4);
        let kernel = Arc::new(CountingKernel::default());
        let loader = ImageLoader::new(kernel.clone(), 8, true, false);

        let cache = BlockCache::build(&loader, &a, None, &[0, 1, 2], &[1, 2, 3], &HashMap::new());
        assert!(cache.is_shared());
        assert_eq!(cache.len(), 4);
        assert_eq!(kernel.decodes.load(Ordering::SeqCst), 4);
        assert!(Arc::ptr_eq(
            cache.row(2).unwrap().as_ref().unwrap(),
            cache.col(2).unwrap().as_ref().unwrap()
        ));
    }

    #[test]
    fn test_rows_reused_across_band() {
        let dir = tempfile::tempdir().unwrap();
        let a = images(dir.path(), Side::A, 2);
        let b = images(dir.path(), Side::B, 3);
        let kernel = Arc::new(CountingKernel::default());
        let loader = ImageLoader::new(kernel.clone(), 8, true, false);

        let first = BlockCache::build(&loader, &a, Some(&b), &[0, 1], &[0, 1], &HashMap::new());
        assert_eq!(kernel.decodes.load(Ordering::SeqCst), 4);

        let reuse = first.rows_for(&[0, 1]);
        let second = BlockCache::build(&loader, &a, Some(&b), &[0, 1], &[2], &reuse);
        assert_eq!(kernel.decodes.load(Ordering::SeqCst), 5);
        assert!(second.col(0).is_none());
        assert!(second.col(2).unwrap().is_ok());
    }

    #[test]
    fn test_failed_decode_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("broken.png");
        std::fs::write(&broken, b"nope").unwrap();
        let a = vec![record(Side::A, 0, broken)];
        let loader = ImageLoader::new(Arc::new(CountingKernel::default()), 8, true, false);

        let cache = BlockCache::build(&loader, &a, None, &[0], &[], &HashMap::new());
        assert!(cache.row(0).unwrap().as_ref().unwrap_err().contains("broken.png"));
    }

    #[test]
    fn test_loader_uses_only_recorded_thumbnails() {
        let dir = tempfile::tempdir().unwrap();
        let thumbs = ThumbnailStore::new(dir.path().join("thumbs"));
        let original = write_png(dir.path(), "big.png", 40, 40, 10);
        let thumb = PixelBuffer::from_pixel(8, 8, image::Rgb([9, 9, 9]));
        let thumb_path = thumbs.path_for(Side::A, 0);
        crate::kernel::thumbnails::store_thumbnail(&thumb, &thumb_path).unwrap();

        let kernel = Arc::new(CountingKernel::default());
        let loader = ImageLoader::new(kernel.clone(), 8, true, false);

        let mut recorded = record(Side::A, 0, original.clone());
        recorded.thumbnail = Some(thumb_path.clone());
        assert_eq!(loader.load_record(&recorded).unwrap(), thumb);
        assert_eq!(kernel.decodes.load(Ordering::SeqCst), 0);

        // A file at the thumbnail path that the store never recorded is ignored.
        let unrecorded = record(Side::A, 0, original.clone());
        assert_ne!(loader.load_record(&unrecorded).unwrap(), thumb);
        assert_eq!(kernel.decodes.load(Ordering::SeqCst), 1);

        // Same for an image whose preprocessing did not finish.
        let mut pending = recorded.clone();
        pending.status = ImageStatus::Pending;
        loader.load_record(&pending).unwrap();
        assert_eq!(kernel.decodes.load(Ordering::SeqCst), 2);

        let off = ImageLoader::new(kernel.clone(), 8, false, false);
        off.load_record(&recorded).unwrap();
        assert_eq!(kernel.decodes.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_failed_image_returns_stored_error() {
        let dir = tempfile::tempdir().unwrap();
        let thumbs = ThumbnailStore::new(dir.path().join("thumbs"));
        let thumb_path = thumbs.path_for(Side::A, 0);
        crate::kernel::thumbnails::store_thumbnail(&PixelBuffer::new(8, 8), &thumb_path).unwrap();

        let mut failed = record(Side::A, 0, write_png(dir.path(), "a.png", 10, 10, 1));
        failed.status = ImageStatus::Error;
        failed.thumbnail = Some(thumb_path);
        failed.error = Some("failed to decode a.png".into());

        let kernel = Arc::new(CountingKernel::default());
        let loader = ImageLoader::new(kernel.clone(), 8, true, false);
        let cache = BlockCache::build(&loader, &[failed], None, &[0], &[], &HashMap::new());
        assert_eq!(cache.row(0).unwrap().as_ref().unwrap_err(), "failed to decode a.png");
        assert_eq!(kernel.decodes.load(Ordering::SeqCst), 0);
    }
}
