//! Image records (`directory` table).

use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::Database;
use crate::error::{Error, Result};

/// Which indexed directory an image belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Side {
    A,
    B,
}

impl Side {
    pub fn as_i64(&self) -> i64 {
        match self {
            Side::A => 0,
            Side::B => 1,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        if value == 0 {
            Side::A
        } else {
            Side::B
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Side::A => "a",
            Side::B => "b",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageStatus {
    Pending,
    InProgress,
    Done,
    Error,
}

impl ImageStatus {
    pub fn as_i64(&self) -> i64 {
        match self {
            ImageStatus::Pending => 0,
            ImageStatus::InProgress => 1,
            ImageStatus::Done => 2,
            ImageStatus::Error => 3,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(ImageStatus::Pending),
            1 => Some(ImageStatus::InProgress),
            2 => Some(ImageStatus::Done),
            3 => Some(ImageStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub key: i64,
    pub side: Side,
    pub path: PathBuf,
    pub filename: String,
    pub status: ImageStatus,
    pub px: Option<u32>,
    pub py: Option<u32>,
    /// Hash bucket keys for the 0/90/180/270 degree rotations.
    pub hashes: [Option<i64>; 4],
    pub thumbnail: Option<PathBuf>,
    pub error: Option<String>,
}

impl ImageRecord {
    /// The thumbnail this store wrote while fingerprinting the image. Only
    /// done images have one.
    pub fn stored_thumbnail(&self) -> Option<&Path> {
        match self.status {
            ImageStatus::Done => self.thumbnail.as_deref(),
            _ => None,
        }
    }

    /// Why preprocessing failed, for images in the error state.
    pub fn failure(&self) -> Option<&str> {
        match self.status {
            ImageStatus::Error => Some(self.error.as_deref().unwrap_or("image failed preprocessing")),
            _ => None,
        }
    }
}

const IMAGE_COLUMNS: &str = "key, dir_b, path, filename, status, px, py, \
     hash_0, hash_90, hash_180, hash_270, thumb_path, error";

fn row_to_image(row: &Row) -> rusqlite::Result<ImageRecord> {
    let status: i64 = row.get(4)?;
    Ok(ImageRecord {
        key: row.get(0)?,
        side: Side::from_i64(row.get(1)?),
        path: PathBuf::from(row.get::<_, String>(2)?),
        filename: row.get(3)?,
        status: ImageStatus::from_i64(status).ok_or_else(|| {
            rusqlite::Error::IntegralValueOutOfRange(4, status)
        })?,
        px: row.get(5)?,
        py: row.get(6)?,
        hashes: [row.get(7)?, row.get(8)?, row.get(9)?, row.get(10)?],
        thumbnail: row.get::<_, Option<String>>(11)?.map(PathBuf::from),
        error: row.get(12)?,
    })
}

impl Database {
    /// Append images to `side`, continuing its dense key sequence.
    pub fn insert_images(&self, side: Side, paths: &[PathBuf]) -> Result<usize> {
        let mut next_key = self.image_count(side)?;
        let mut stmt = self.conn.prepare(
            "INSERT OR IGNORE INTO directory (key, dir_b, path, filename, status)
             VALUES (?, ?, ?, ?, 0)",
        )?;

        let mut inserted = 0;
        for path in paths {
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let changed = stmt.execute(params![
                next_key,
                side.as_i64(),
                path.to_string_lossy().as_ref(),
                filename
            ])?;
            if changed > 0 {
                next_key += 1;
                inserted += changed;
            }
        }
        Ok(inserted)
    }

    pub fn image_count(&self, side: Side) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM directory WHERE dir_b = ?",
            [side.as_i64()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn count_images_with_status(&self, status: ImageStatus) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM directory WHERE status = ?",
            [status.as_i64()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Images left in progress by an interrupted run start over.
    pub fn reset_in_progress_images(&self) -> Result<usize> {
        let changed = self.conn.execute(
            "UPDATE directory SET status = 0 WHERE status = 1",
            [],
        )?;
        Ok(changed)
    }

    /// Claim up to `limit` pending images after `cursor`, flipping them to
    /// in progress. Returns them in (side, key) order.
    pub fn claim_pending_images(
        &self,
        cursor: Option<(Side, i64)>,
        limit: usize,
    ) -> Result<Vec<ImageRecord>> {
        let (after_side, after_key) = cursor
            .map(|(side, key)| (side.as_i64(), key))
            .unwrap_or((-1, -1));

        let sql = format!(
            "SELECT {} FROM directory
             WHERE status = 0 AND (dir_b > ?1 OR (dir_b = ?1 AND key > ?2))
             ORDER BY dir_b, key
             LIMIT ?3",
            IMAGE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut images: Vec<ImageRecord> = stmt
            .query_map(params![after_side, after_key, limit as i64], row_to_image)?
            .collect::<rusqlite::Result<_>>()?;

        let mut claim = self
            .conn
            .prepare("UPDATE directory SET status = 1 WHERE dir_b = ? AND key = ? AND status = 0")?;
        for image in &mut images {
            claim.execute(params![image.side.as_i64(), image.key])?;
            image.status = ImageStatus::InProgress;
        }
        Ok(images)
    }

    /// Record a fingerprint and mark the image done. `thumbnail` is the file
    /// this run wrote for it, if any.
    pub fn complete_image(
        &self,
        side: Side,
        key: i64,
        px: u32,
        py: u32,
        hashes: Option<[i64; 4]>,
        thumbnail: Option<&Path>,
    ) -> Result<()> {
        let [h0, h90, h180, h270] = match hashes {
            Some(h) => h.map(Some),
            None => [None; 4],
        };
        let thumbnail = thumbnail.map(|p| p.to_string_lossy().into_owned());
        let changed = self.conn.execute(
            "UPDATE directory
             SET status = 2, px = ?, py = ?, hash_0 = ?, hash_90 = ?, hash_180 = ?, hash_270 = ?,
                 thumb_path = ?, error = NULL
             WHERE dir_b = ? AND key = ? AND status = 1",
            params![px, py, h0, h90, h180, h270, thumbnail, side.as_i64(), key],
        )?;
        if changed == 0 {
            return Err(Error::Integrity(format!(
                "image {}:{} completed while not in progress",
                side.tag(),
                key
            )));
        }
        Ok(())
    }

    pub fn fail_image(&self, side: Side, key: i64, message: &str) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE directory SET status = 3, thumb_path = NULL, error = ?
             WHERE dir_b = ? AND key = ? AND status = 1",
            params![message, side.as_i64(), key],
        )?;
        if changed == 0 {
            return Err(Error::Integrity(format!(
                "image {}:{} failed while not in progress",
                side.tag(),
                key
            )));
        }
        Ok(())
    }

    pub fn get_image(&self, side: Side, key: i64) -> Result<Option<ImageRecord>> {
        let sql = format!(
            "SELECT {} FROM directory WHERE dir_b = ? AND key = ?",
            IMAGE_COLUMNS
        );
        let image = self
            .conn
            .query_row(&sql, params![side.as_i64(), key], row_to_image)
            .optional()?;
        Ok(image)
    }

    /// All images of `side`, indexed by key.
    pub fn load_images(&self, side: Side) -> Result<Vec<ImageRecord>> {
        let sql = format!(
            "SELECT {} FROM directory WHERE dir_b = ? ORDER BY key",
            IMAGE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let images: Vec<ImageRecord> = stmt
            .query_map([side.as_i64()], row_to_image)?
            .collect::<rusqlite::Result<_>>()?;

        if let Some((index, image)) = images
            .iter()
            .enumerate()
            .find(|(index, image)| image.key != *index as i64)
        {
            return Err(Error::Integrity(format!(
                "keys of side {} are not dense: expected {}, found {}",
                side.tag(),
                index,
                image.key
            )));
        }
        Ok(images)
    }

    /// Send every failed image back to the queue, together with the pairs
    /// that failed because of it. Returns (images, pairs) requeued.
    pub fn requeue_failed_images(&self) -> Result<(usize, usize)> {
        let side_b = if self.is_cross_store()? { Side::B } else { Side::A };
        let tx = self.conn.unchecked_transaction()?;

        let pairs = self.conn.execute(
            "UPDATE dif_table SET status = -1, dif = -1, error = NULL
             WHERE status = 2 AND (
                 key_a IN (SELECT key FROM directory WHERE dir_b = 0 AND status = 3)
                 OR key_b IN (SELECT key FROM directory WHERE dir_b = ?1 AND status = 3)
             )",
            [side_b.as_i64()],
        )?;

        let failed: Vec<(i64, i64)> = {
            let mut stmt = self
                .conn
                .prepare("SELECT dir_b, key FROM directory WHERE status = 3")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        for &(dir_b, key) in &failed {
            self.reset_image(Side::from_i64(dir_b), key)?;
        }

        tx.commit()?;
        Ok((failed.len(), pairs))
    }

    /// Drop an image's fingerprint and queue it again, releasing its hash
    /// bucket references.
    pub fn reset_image(&self, side: Side, key: i64) -> Result<()> {
        let Some(image) = self.get_image(side, key)? else {
            return Ok(());
        };
        self.conn.execute(
            "UPDATE directory
             SET status = 0, px = NULL, py = NULL,
                 hash_0 = NULL, hash_90 = NULL, hash_180 = NULL, hash_270 = NULL,
                 thumb_path = NULL, error = NULL
             WHERE dir_b = ? AND key = ?",
            params![side.as_i64(), key],
        )?;
        for bucket in image.hashes.into_iter().flatten() {
            self.release_hash(bucket)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn paths(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(|n| PathBuf::from(format!("/img/{}", n))).collect()
    }

    #[test]
    fn test_keys_are_dense_per_side() {
        let db = store();
        db.insert_images(Side::A, &paths(&["a.png", "b.png"])).unwrap();
        db.insert_images(Side::B, &paths(&["c.png"])).unwrap();
        db.insert_images(Side::A, &paths(&["b.png", "d.png"])).unwrap();

        let a = db.load_images(Side::A).unwrap();
        assert_eq!(a.len(), 3);
        assert_eq!(a[2].filename, "d.png");
        assert_eq!(db.load_images(Side::B).unwrap()[0].key, 0);
        assert!(db.is_cross_store().unwrap());
    }

    #[test]
    fn test_claim_moves_cursor_and_status() {
        let db = store();
        db.insert_images(Side::A, &paths(&["1.png", "2.png", "3.png"])).unwrap();

        let first = db.claim_pending_images(None, 2).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(db.count_images_with_status(ImageStatus::InProgress).unwrap(), 2);

        let cursor = first.last().map(|i| (i.side, i.key));
        let second = db.claim_pending_images(cursor, 10).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].key, 2);
        assert!(db.claim_pending_images(None, 10).unwrap().is_empty());
    }

    #[test]
    fn test_transitions_are_guarded() {
        let db = store();
        db.insert_images(Side::A, &paths(&["1.png"])).unwrap();

        // Pending images cannot complete without being claimed.
        assert!(matches!(
            db.complete_image(Side::A, 0, 10, 10, None, None),
            Err(Error::Integrity(_))
        ));

        db.claim_pending_images(None, 1).unwrap();
        db.fail_image(Side::A, 0, "corrupt").unwrap();
        let image = db.get_image(Side::A, 0).unwrap().unwrap();
        assert_eq!(image.status, ImageStatus::Error);
        assert_eq!(image.error.as_deref(), Some("corrupt"));

        assert_eq!(image.failure(), Some("corrupt"));

        assert_eq!(db.requeue_failed_images().unwrap(), (1, 0));
        assert_eq!(db.count_images_with_status(ImageStatus::Pending).unwrap(), 1);
    }

    #[test]
    fn test_requeue_reopens_failed_pairs() {
        use crate::db::PairStatus;

        let db = store();
        db.insert_images(Side::A, &paths(&["1.png", "2.png", "3.png"])).unwrap();
        db.claim_pending_images(None, 3).unwrap();
        db.complete_image(Side::A, 0, 8, 8, None, None).unwrap();
        db.fail_image(Side::A, 1, "missing").unwrap();
        db.complete_image(Side::A, 2, 8, 8, None, None).unwrap();

        db.insert_block_pairs(0, [(0, 1), (0, 2), (1, 2)]).unwrap();
        let pending = db.unscheduled_pairs_in_block(0).unwrap();
        let keys: Vec<i64> = pending.iter().map(|p| p.key).collect();
        db.mark_pairs_processing(&keys).unwrap();
        for pair in &pending {
            if pair.key_a == 1 || pair.key_b == 1 {
                db.finish_pair(pair.key, PairStatus::Error, -1.0, Some("missing")).unwrap();
            } else {
                db.finish_pair(pair.key, PairStatus::Success, 12.5, None).unwrap();
            }
        }

        assert_eq!(db.requeue_failed_images().unwrap(), (1, 2));
        for (a, b) in [(0, 1), (1, 2)] {
            let pair = db.get_pair(a, b).unwrap().unwrap();
            assert_eq!(pair.status, PairStatus::Unscheduled);
            assert_eq!(pair.dif, -1.0);
            assert_eq!(pair.error, None);
        }
        assert_eq!(db.get_pair(0, 2).unwrap().unwrap().status, PairStatus::Success);
        let image = db.get_image(Side::A, 1).unwrap().unwrap();
        assert_eq!(image.status, ImageStatus::Pending);
        assert_eq!(image.failure(), None);
    }

    #[test]
    fn test_in_progress_reset_on_restart() {
        let db = store();
        db.insert_images(Side::A, &paths(&["1.png", "2.png"])).unwrap();
        db.claim_pending_images(None, 2).unwrap();

        assert_eq!(db.reset_in_progress_images().unwrap(), 2);
        assert_eq!(db.count_images_with_status(ImageStatus::Pending).unwrap(), 2);
    }

    #[test]
    fn test_reset_image_releases_hashes() {
        let db = store();
        db.insert_images(Side::A, &paths(&["1.png"])).unwrap();
        db.claim_pending_images(None, 1).unwrap();

        let buckets = ["h0", "h90", "h180", "h270"].map(|h| db.upsert_hash(h).unwrap());
        db.complete_image(Side::A, 0, 8, 8, Some(buckets), Some(Path::new("/thumbs/a_00000000.png")))
            .unwrap();
        let done = db.get_image(Side::A, 0).unwrap().unwrap();
        assert_eq!(done.stored_thumbnail(), Some(Path::new("/thumbs/a_00000000.png")));
        assert_eq!(db.hash_count("h0").unwrap(), Some(1));

        db.reset_image(Side::A, 0).unwrap();
        let image = db.get_image(Side::A, 0).unwrap().unwrap();
        assert_eq!(image.status, ImageStatus::Pending);
        assert_eq!(image.hashes, [None; 4]);
        assert_eq!(image.thumbnail, None);
        assert_eq!(db.hash_count("h0").unwrap(), None);
    }
}
