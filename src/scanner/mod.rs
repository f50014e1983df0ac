//! Directory indexer: fills the image table the two passes work from.

pub mod discovery;

use tracing::{info, warn};

use crate::config::Config;
use crate::db::{Database, Side};
use crate::error::{Error, Result};

pub use discovery::discover_images;

#[derive(Debug, Clone, Default)]
pub struct IndexSummary {
    pub found_a: usize,
    pub found_b: usize,
    pub inserted: usize,
    /// The store was already indexed and was left as is.
    pub skipped: bool,
}

/// Index `dir_a` (and `dir_b`) into the store, assigning dense keys in path
/// order. A store that already holds images is resumed, not re-indexed.
pub fn index_directories(db: &Database, config: &Config) -> Result<IndexSummary> {
    let existing_a = db.image_count(Side::A)?;
    let existing_b = db.image_count(Side::B)?;
    if existing_a + existing_b > 0 {
        if config.is_cross() != (existing_b > 0) {
            return Err(Error::Config(format!(
                "store was indexed {} a second directory but the configuration {}",
                if existing_b > 0 { "with" } else { "without" },
                if config.is_cross() { "names one" } else { "does not" }
            )));
        }
        info!(a = existing_a, b = existing_b, "Store already indexed, resuming");
        return Ok(IndexSummary {
            found_a: existing_a as usize,
            found_b: existing_b as usize,
            inserted: 0,
            skipped: true,
        });
    }

    let dirs = &config.directories;
    let dir_a = dirs
        .dir_a
        .as_ref()
        .ok_or_else(|| Error::Config("directories.dir_a is not set".into()))?;

    let paths_a = discover_images(dir_a, &dirs.extensions, dirs.recursive)?;
    let paths_b = match &dirs.dir_b {
        Some(dir_b) => discover_images(dir_b, &dirs.extensions, dirs.recursive)?,
        None => Vec::new(),
    };
    if dirs.dir_b.is_some() && paths_b.is_empty() {
        warn!("Second directory holds no images; nothing will be compared");
    }

    db.begin()?;
    let inserted = db.insert_images(Side::A, &paths_a)? + db.insert_images(Side::B, &paths_b)?;
    db.commit()?;

    info!(
        dir_a = %dir_a.display(),
        found_a = paths_a.len(),
        found_b = paths_b.len(),
        inserted,
        "Indexing finished"
    );
    Ok(IndexSummary {
        found_a: paths_a.len(),
        found_b: paths_b.len(),
        inserted,
        skipped: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::testing::write_png;

    fn config_for(a: &std::path::Path, b: Option<&std::path::Path>) -> Config {
        let mut config = Config::default();
        config.directories.dir_a = Some(a.to_path_buf());
        config.directories.dir_b = b.map(|p| p.to_path_buf());
        config
    }

    #[test]
    fn test_index_assigns_dense_keys_in_path_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        std::fs::create_dir(&a).unwrap();
        write_png(&a, "zebra.png", 4, 4, 1);
        write_png(&a, "apple.png", 4, 4, 2);
        std::fs::write(a.join("notes.txt"), b"hi").unwrap();

        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        let summary = index_directories(&db, &config_for(&a, None)).unwrap();

        assert_eq!(summary.inserted, 2);
        assert!(!summary.skipped);
        let images = db.load_images(Side::A).unwrap();
        assert_eq!(images[0].filename, "apple.png");
        assert_eq!(images[1].key, 1);
        assert!(!db.is_cross_store().unwrap());
    }

    #[test]
    fn test_second_index_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = (dir.path().join("a"), dir.path().join("b"));
        std::fs::create_dir(&a).unwrap();
        std::fs::create_dir(&b).unwrap();
        write_png(&a, "x.png", 4, 4, 1);
        write_png(&b, "y.png", 4, 4, 1);

        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        let config = config_for(&a, Some(&b));
        index_directories(&db, &config).unwrap();
        assert!(db.is_cross_store().unwrap());

        write_png(&a, "late.png", 4, 4, 1);
        let again = index_directories(&db, &config).unwrap();
        assert!(again.skipped);
        assert_eq!(db.image_count(Side::A).unwrap(), 1);

        let single = config_for(&a, None);
        assert!(matches!(index_directories(&db, &single), Err(Error::Config(_))));
    }

    #[test]
    fn test_dir_a_required() {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        assert!(index_directories(&db, &Config::default()).is_err());
    }
}
