use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::db::{Database, DuplicateGroup, MatchedPair};
use crate::error::{Error, Result};

/// Export format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExportFormat::Json => "JSON",
            ExportFormat::Csv => "CSV",
        }
    }

    /// Guess the format from a file extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            _ => Err(Error::Config(format!(
                "cannot tell export format of {} (use .csv or .json)",
                path.display()
            ))),
        }
    }
}

/// A matched pair as written out.
#[derive(Debug, Serialize)]
pub struct ExportedPair {
    pub key_a: i64,
    pub key_b: i64,
    pub path_a: String,
    pub path_b: String,
    pub dif: f64,
    pub by_hash: bool,
}

impl From<MatchedPair> for ExportedPair {
    fn from(pair: MatchedPair) -> Self {
        Self {
            key_a: pair.key_a,
            key_b: pair.key_b,
            path_a: pair.path_a.to_string_lossy().to_string(),
            path_b: pair.path_b.to_string_lossy().to_string(),
            dif: pair.dif,
            by_hash: pair.by_hash,
        }
    }
}

/// Write every pair scoring at or below `threshold`. Returns the count.
pub fn export_pairs(db: &Database, threshold: f64, output_path: &Path, format: ExportFormat) -> Result<usize> {
    let pairs = db
        .iterate_pairs_below(threshold, None)
        .map(|p| p.map(ExportedPair::from))
        .collect::<Result<Vec<_>>>()?;

    match format {
        ExportFormat::Json => write_json(&pairs, output_path)?,
        ExportFormat::Csv => {
            let mut wtr = csv::Writer::from_path(output_path)?;
            wtr.write_record(["key_a", "key_b", "path_a", "path_b", "dif", "by_hash"])?;
            for pair in &pairs {
                wtr.write_record([
                    pair.key_a.to_string(),
                    pair.key_b.to_string(),
                    pair.path_a.clone(),
                    pair.path_b.clone(),
                    pair.dif.to_string(),
                    pair.by_hash.to_string(),
                ])?;
            }
            wtr.flush()?;
        }
    }

    Ok(pairs.len())
}

/// Write the duplicate groups at `threshold`, one CSV row per member.
/// Returns the number of groups.
pub fn export_clusters(db: &Database, threshold: f64, output_path: &Path, format: ExportFormat) -> Result<usize> {
    let groups = db.build_clusters(threshold)?;

    match format {
        ExportFormat::Json => write_json(&groups, output_path)?,
        ExportFormat::Csv => write_clusters_csv(&groups, output_path)?,
    }

    Ok(groups.len())
}

fn write_json<T: Serialize>(items: &[T], output_path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(items)?;
    let mut file = File::create(output_path)?;
    file.write_all(json.as_bytes())?;
    Ok(())
}

fn write_clusters_csv(groups: &[DuplicateGroup], output_path: &Path) -> Result<()> {
    let mut wtr = csv::Writer::from_path(output_path)?;
    wtr.write_record(["group", "side", "key", "path", "best_dif", "hash_matches"])?;
    for group in groups {
        for member in &group.members {
            wtr.write_record([
                group.id.to_string(),
                member.side.tag().to_string(),
                member.key.to_string(),
                member.path.to_string_lossy().to_string(),
                group.best_dif.to_string(),
                group.hash_matches.to_string(),
            ])?;
        }
    }
    wtr.flush()?;
    Ok(())
}
