use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// Image files under `directory` whose extension is in `extensions`
/// (case-insensitive), sorted by path.
pub fn discover_images(directory: &Path, extensions: &[String], recursive: bool) -> Result<Vec<PathBuf>> {
    if !directory.is_dir() {
        return Err(Error::Config(format!(
            "{} is not a directory",
            directory.display()
        )));
    }

    let mut walker = WalkDir::new(directory).follow_links(false);
    if !recursive {
        walker = walker.max_depth(1);
    }

    let mut images = Vec::new();
    for entry in walker.into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if let Some(ext) = path.extension() {
            let ext_lower = ext.to_string_lossy().to_lowercase();
            if extensions.iter().any(|e| e.to_lowercase() == ext_lower) {
                images.push(path.to_path_buf());
            }
        }
    }

    // Keys are assigned in this order, so it has to be stable.
    images.sort();

    Ok(images)
}
