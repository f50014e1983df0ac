//! Hash buckets: reference-counted rotation hashes shared across images.

use rusqlite::OptionalExtension;

use super::Database;
use crate::error::Result;

impl Database {
    /// Insert `hash` or bump its count; returns the bucket key.
    pub fn upsert_hash(&self, hash: &str) -> Result<i64> {
        let key = self.conn.query_row(
            "INSERT INTO hash_table (hash, count) VALUES (?, 1)
             ON CONFLICT(hash) DO UPDATE SET count = count + 1
             RETURNING key",
            [hash],
            |row| row.get(0),
        )?;
        Ok(key)
    }

    /// Drop one reference to a bucket, deleting it once unused.
    pub fn release_hash(&self, key: i64) -> Result<()> {
        self.conn
            .execute("UPDATE hash_table SET count = count - 1 WHERE key = ?", [key])?;
        self.conn.execute(
            "DELETE FROM hash_table WHERE key = ? AND count <= 0",
            [key],
        )?;
        Ok(())
    }

    pub fn hash_count(&self, hash: &str) -> Result<Option<i64>> {
        let count = self
            .conn
            .query_row(
                "SELECT count FROM hash_table WHERE hash = ?",
                [hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count)
    }

    /// Buckets referenced by more than one image rotation.
    pub fn shared_hash_buckets(&self) -> Result<Vec<(String, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT hash, count FROM hash_table WHERE count > 1 ORDER BY count DESC, key",
        )?;
        let buckets = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(buckets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_reuses_bucket() {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();

        let first = db.upsert_hash("abc").unwrap();
        let second = db.upsert_hash("abc").unwrap();
        let other = db.upsert_hash("def").unwrap();

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(db.hash_count("abc").unwrap(), Some(2));
        assert_eq!(db.shared_hash_buckets().unwrap(), vec![("abc".to_string(), 2)]);
    }

    #[test]
    fn test_release_decrements_then_deletes() {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();

        let key = db.upsert_hash("abc").unwrap();
        db.upsert_hash("abc").unwrap();

        db.release_hash(key).unwrap();
        assert_eq!(db.hash_count("abc").unwrap(), Some(1));
        db.release_hash(key).unwrap();
        assert_eq!(db.hash_count("abc").unwrap(), None);
    }
}
