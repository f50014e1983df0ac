//! Reserved diff-plot filenames.

use rusqlite::{params, OptionalExtension};
use std::path::{Path, PathBuf};

use super::Database;
use crate::error::Result;

impl Database {
    /// Record the plot written for a pair. Returns false if `path` was
    /// already taken by another pair.
    pub fn record_plot(&self, key_a: i64, key_b: i64, path: &Path) -> Result<bool> {
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO plots (key_a, key_b, path) VALUES (?, ?, ?)",
            params![key_a, key_b, path.to_string_lossy().as_ref()],
        )?;
        Ok(changed > 0)
    }

    pub fn is_plot_reserved(&self, path: &Path) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT key FROM plots WHERE path = ?",
                [path.to_string_lossy().as_ref()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn plot_for(&self, key_a: i64, key_b: i64) -> Result<Option<PathBuf>> {
        let path: Option<String> = self
            .conn
            .query_row(
                "SELECT path FROM plots WHERE key_a = ? AND key_b = ? ORDER BY key LIMIT 1",
                params![key_a, key_b],
                |row| row.get(0),
            )
            .optional()?;
        Ok(path.map(PathBuf::from))
    }

    pub fn plot_count(&self) -> Result<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM plots", [], |row| row.get(0))?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_are_unique() {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();

        let path = Path::new("/plots/a_b.png");
        assert!(db.record_plot(0, 1, path).unwrap());
        assert!(!db.record_plot(0, 2, path).unwrap());
        assert!(db.is_plot_reserved(path).unwrap());

        assert_eq!(db.plot_for(0, 1).unwrap(), Some(path.to_path_buf()));
        assert_eq!(db.plot_for(0, 2).unwrap(), None);
        assert_eq!(db.plot_count().unwrap(), 1);
    }
}
