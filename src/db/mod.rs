//! Persistent progress store.
//!
//! The coordinator owns the only connection. Workers never touch the store;
//! their results are written here in periodic transactions, so a crash loses
//! at most one commit interval of work, which the resume rules recompute.

mod schema;
pub mod hashes;
pub mod images;
pub mod pairs;
pub mod plots;
pub mod runs;
pub mod similarity;

use rusqlite::Connection;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::Result;

pub use images::{ImageRecord, ImageStatus, Side};
pub use pairs::{MatchedPair, PairCursor, PairRecord, PairStatus, PendingPair};
pub use runs::{RunPhase, RunRecord, RunStatus};
pub use schema::{MIGRATIONS, SCHEMA, SCHEMA_VERSION};
pub use similarity::{DuplicateGroup, GroupMember};

pub struct Database {
    pub(crate) conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.configure_pragmas()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.configure_pragmas()?;
        Ok(db)
    }

    fn configure_pragmas(&self) -> Result<()> {
        // journal_mode returns a row, so it cannot go through execute_batch.
        let _: String = self
            .conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        self.conn.execute_batch(
            "PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    pub fn initialize(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;
        self.conn.execute_batch(SCHEMA)?;
        // A fresh store (version 0) already has every column.
        if version > 0 {
            self.run_migrations(version)?;
        }
        self.conn
            .execute_batch(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))?;
        debug!("SQLite schema initialized (version {})", SCHEMA_VERSION);
        Ok(())
    }

    fn run_migrations(&self, from: i64) -> Result<()> {
        for (version, migration) in MIGRATIONS.iter().filter(|(v, _)| *v > from) {
            self.conn.execute_batch(migration)?;
            debug!(version, "Store migrated");
        }
        Ok(())
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Open a write transaction unless one is already open.
    pub fn begin(&self) -> Result<()> {
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN IMMEDIATE")?;
        }
        Ok(())
    }

    /// Commit the open transaction, if any.
    pub fn commit(&self) -> Result<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    /// Whether the two-directory (cross product) layout is in use.
    pub fn is_cross_store(&self) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM directory WHERE dir_b = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

/// Groups store writes into transactions committed at a fixed interval.
pub struct PeriodicCommit {
    interval: Duration,
    last: Instant,
    commits: usize,
}

impl PeriodicCommit {
    /// Starts a transaction on `db` right away.
    pub fn start(db: &Database, interval: Duration) -> Result<Self> {
        db.begin()?;
        Ok(Self {
            interval,
            last: Instant::now(),
            commits: 0,
        })
    }

    /// Commit and reopen when the interval has elapsed.
    pub fn tick(&mut self, db: &Database) -> Result<bool> {
        if self.last.elapsed() < self.interval {
            return Ok(false);
        }
        self.flush(db)?;
        Ok(true)
    }

    pub fn flush(&mut self, db: &Database) -> Result<()> {
        db.commit()?;
        db.begin()?;
        self.last = Instant::now();
        self.commits += 1;
        Ok(())
    }

    pub fn finish(self, db: &Database) -> Result<usize> {
        db.commit()?;
        Ok(self.commits + 1)
    }

    pub fn commits(&self) -> usize {
        self.commits
    }
}
