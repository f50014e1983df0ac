//! Pair records (`dif_table`) and the below-threshold match cursor.

use rusqlite::{params, OptionalExtension, Row};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use super::Database;
use crate::error::{Error, Result};

/// Score stored for pairs whose difference was never computed.
pub const DIF_NOT_COMPUTED: f64 = -1.0;

const PAGE_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PairStatus {
    Unscheduled,
    Processing,
    Success,
    Error,
    SkippedHash,
    SkippedAspect,
}

impl PairStatus {
    pub fn as_i64(&self) -> i64 {
        match self {
            PairStatus::Unscheduled => -1,
            PairStatus::Processing => 0,
            PairStatus::Success => 1,
            PairStatus::Error => 2,
            PairStatus::SkippedHash => 3,
            PairStatus::SkippedAspect => 4,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            -1 => Some(PairStatus::Unscheduled),
            0 => Some(PairStatus::Processing),
            1 => Some(PairStatus::Success),
            2 => Some(PairStatus::Error),
            3 => Some(PairStatus::SkippedHash),
            4 => Some(PairStatus::SkippedAspect),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PairStatus::Unscheduled | PairStatus::Processing)
    }
}

#[derive(Debug, Clone)]
pub struct PairRecord {
    pub key: i64,
    pub key_a: i64,
    pub key_b: i64,
    pub status: PairStatus,
    pub dif: f64,
    pub error: Option<String>,
    pub block_id: Option<i64>,
}

/// A pair waiting to be scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingPair {
    pub key: i64,
    pub key_a: i64,
    pub key_b: i64,
}

/// A pair considered a duplicate.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedPair {
    pub key: i64,
    pub key_a: i64,
    pub key_b: i64,
    pub path_a: PathBuf,
    pub path_b: PathBuf,
    pub dif: f64,
    /// True when joined by identical rotation hashes rather than a score.
    pub by_hash: bool,
}

fn row_to_pair(row: &Row) -> rusqlite::Result<PairRecord> {
    let status: i64 = row.get(3)?;
    Ok(PairRecord {
        key: row.get(0)?,
        key_a: row.get(1)?,
        key_b: row.get(2)?,
        status: PairStatus::from_i64(status)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(3, status))?,
        dif: row.get(4)?,
        error: row.get(5)?,
        block_id: row.get(6)?,
    })
}

impl Database {
    /// Pairs left processing by an interrupted run are scheduled again.
    pub fn reset_processing_pairs(&self) -> Result<usize> {
        let changed = self.conn.execute(
            "UPDATE dif_table SET status = -1 WHERE status = 0",
            [],
        )?;
        Ok(changed)
    }

    /// Create the pairs of a block. Existing pairs are kept; unscheduled ones
    /// move to `block_id`, terminal ones keep the block that resolved them.
    pub fn insert_block_pairs<I>(&self, block_id: i64, pairs: I) -> Result<usize>
    where
        I: IntoIterator<Item = (i64, i64)>,
    {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO dif_table (key_a, key_b, block_id) VALUES (?, ?, ?)
             ON CONFLICT(key_a, key_b) DO UPDATE SET block_id = excluded.block_id
             WHERE dif_table.status = -1",
        )?;
        let mut touched = 0;
        for (key_a, key_b) in pairs {
            touched += stmt.execute(params![key_a, key_b, block_id])?;
        }
        Ok(touched)
    }

    pub fn unscheduled_pairs_in_block(&self, block_id: i64) -> Result<Vec<PendingPair>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT key, key_a, key_b FROM dif_table
             WHERE block_id = ? AND status = -1
             ORDER BY key_a, key_b",
        )?;
        let pairs = stmt
            .query_map([block_id], |row| {
                Ok(PendingPair {
                    key: row.get(0)?,
                    key_a: row.get(1)?,
                    key_b: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(pairs)
    }

    pub fn mark_pairs_processing(&self, keys: &[i64]) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare_cached("UPDATE dif_table SET status = 0 WHERE key = ? AND status = -1")?;
        for key in keys {
            if stmt.execute([key])? == 0 {
                return Err(Error::Integrity(format!(
                    "pair {} dispatched while not unscheduled",
                    key
                )));
            }
        }
        Ok(())
    }

    /// Record the outcome of a dispatched pair. A pair is resolved exactly
    /// once, so resolving one that is not processing is an integrity error.
    pub fn finish_pair(
        &self,
        key: i64,
        status: PairStatus,
        dif: f64,
        error: Option<&str>,
    ) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            "UPDATE dif_table SET status = ?, dif = ?, error = ? WHERE key = ? AND status = 0",
        )?;
        if stmt.execute(params![status.as_i64(), dif, error, key])? == 0 {
            return Err(Error::Integrity(format!(
                "pair {} resolved while not processing",
                key
            )));
        }
        Ok(())
    }

    /// Resolve a pair without dispatching it.
    pub fn resolve_unscheduled_pair(
        &self,
        key: i64,
        status: PairStatus,
        dif: f64,
        error: Option<&str>,
    ) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            "UPDATE dif_table SET status = ?, dif = ?, error = ? WHERE key = ? AND status = -1",
        )?;
        if stmt.execute(params![status.as_i64(), dif, error, key])? == 0 {
            return Err(Error::Integrity(format!(
                "pair {} short-circuited while not unscheduled",
                key
            )));
        }
        Ok(())
    }

    /// First block id not used by any earlier run.
    pub fn next_block_id(&self) -> Result<i64> {
        let next = self.conn.query_row(
            "SELECT COALESCE(MAX(block_id), -1) + 1 FROM dif_table",
            [],
            |row| row.get(0),
        )?;
        Ok(next)
    }

    /// Pairs of a block that are not yet terminal.
    pub fn count_open_pairs_in_block(&self, block_id: i64) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM dif_table WHERE block_id = ? AND status IN (-1, 0)",
            [block_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Number of terminal pairs per row key.
    pub fn terminal_counts_by_row(&self) -> Result<HashMap<i64, i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT key_a, COUNT(*) FROM dif_table WHERE status > 0 GROUP BY key_a",
        )?;
        let counts = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(counts)
    }

    pub fn count_pairs(&self) -> Result<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM dif_table", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn count_pairs_with_status(&self, status: PairStatus) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM dif_table WHERE status = ?",
            [status.as_i64()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn get_pair(&self, key_a: i64, key_b: i64) -> Result<Option<PairRecord>> {
        let pair = self
            .conn
            .query_row(
                "SELECT key, key_a, key_b, status, dif, error, block_id
                 FROM dif_table WHERE key_a = ? AND key_b = ?",
                params![key_a, key_b],
                row_to_pair,
            )
            .optional()?;
        Ok(pair)
    }

    pub fn all_pairs(&self) -> Result<Vec<PairRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT key, key_a, key_b, status, dif, error, block_id
             FROM dif_table ORDER BY key_a, key_b",
        )?;
        let pairs = stmt
            .query_map([], row_to_pair)?
            .collect::<rusqlite::Result<_>>()?;
        Ok(pairs)
    }

    /// One page of matches with a pair key greater than `after_key`.
    pub fn pairs_below(
        &self,
        threshold: f64,
        after_key: i64,
        limit: usize,
    ) -> Result<Vec<MatchedPair>> {
        let side_b = if self.is_cross_store()? { 1 } else { 0 };
        let mut stmt = self.conn.prepare_cached(
            "SELECT d.key, d.key_a, d.key_b, a.path, b.path, d.dif, d.status
             FROM dif_table d
             JOIN directory a ON a.dir_b = 0 AND a.key = d.key_a
             JOIN directory b ON b.dir_b = ?1 AND b.key = d.key_b
             WHERE d.key > ?2
               AND ((d.status = 1 AND d.dif <= ?3) OR d.status = 3)
             ORDER BY d.key
             LIMIT ?4",
        )?;
        let pairs = stmt
            .query_map(
                params![side_b, after_key, threshold, limit as i64],
                |row| {
                    Ok(MatchedPair {
                        key: row.get(0)?,
                        key_a: row.get(1)?,
                        key_b: row.get(2)?,
                        path_a: PathBuf::from(row.get::<_, String>(3)?),
                        path_b: PathBuf::from(row.get::<_, String>(4)?),
                        dif: row.get(5)?,
                        by_hash: row.get::<_, i64>(6)? == PairStatus::SkippedHash.as_i64(),
                    })
                },
            )?
            .collect::<rusqlite::Result<_>>()?;
        Ok(pairs)
    }

    /// Lazily walk every match at or below `threshold`, starting after
    /// `after_key` (pass the cursor's last position to resume).
    pub fn iterate_pairs_below(&self, threshold: f64, after_key: Option<i64>) -> PairCursor<'_> {
        PairCursor {
            db: self,
            threshold,
            after: after_key.unwrap_or(-1),
            page: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Delete computed pairs scoring above `threshold`.
    pub fn prune_pairs_above(&self, threshold: f64) -> Result<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM dif_table WHERE status = 1 AND dif > ?",
            [threshold],
        )?;
        Ok(deleted)
    }
}

/// Paged iterator over matches. Each page is a fresh query, so the store may
/// be written between pages.
pub struct PairCursor<'a> {
    db: &'a Database,
    threshold: f64,
    after: i64,
    page: VecDeque<MatchedPair>,
    exhausted: bool,
}

impl PairCursor<'_> {
    /// Key of the last pair yielded; resume from here.
    pub fn position(&self) -> Option<i64> {
        (self.after >= 0).then_some(self.after)
    }
}

impl Iterator for PairCursor<'_> {
    type Item = Result<MatchedPair>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.exhausted {
            match self.db.pairs_below(self.threshold, self.after, PAGE_SIZE) {
                Ok(page) => {
                    self.exhausted = page.len() < PAGE_SIZE;
                    self.page.extend(page);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }

        let pair = self.page.pop_front()?;
        self.after = pair.key;
        Some(Ok(pair))
    }
}
