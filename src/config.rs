use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Largest column batch a single job may carry.
pub const MAX_BLOCK_COLUMNS: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub directories: DirectoryConfig,

    #[serde(default)]
    pub preprocess: PreprocessConfig,

    #[serde(default)]
    pub compare: CompareConfig,

    #[serde(default)]
    pub workers: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default)]
    pub dir_a: Option<PathBuf>,

    /// When set, pairs are the full cross product A x B instead of the upper
    /// triangle of A.
    #[serde(default)]
    pub dir_b: Option<PathBuf>,

    #[serde(default = "default_image_extensions")]
    pub extensions: Vec<String>,

    #[serde(default = "default_true")]
    pub recursive: bool,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            dir_a: None,
            dir_b: None,
            extensions: default_image_extensions(),
            recursive: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessConfig {
    #[serde(default = "default_true")]
    pub compute_hash: bool,

    #[serde(default = "default_true")]
    pub compute_thumbnail: bool,

    /// Bit shift applied to pixel values before hashing, in [-7, 7].
    /// Zero means only byte-identical thumbnails hash alike.
    #[serde(default = "default_shift_amount")]
    pub shift_amount: i8,

    /// Edge length of the square comparison buffer.
    #[serde(default = "default_target_size")]
    pub target_size: u32,

    /// Defaults to a directory next to the store, see [`Config::thumb_dir`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumb_dir: Option<PathBuf>,

    /// Items per list-batch job once the pending workload is large enough.
    #[serde(default = "default_preprocess_batch_size")]
    pub batch_size: usize,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            compute_hash: true,
            compute_thumbnail: true,
            shift_amount: default_shift_amount(),
            target_size: default_target_size(),
            thumb_dir: None,
            batch_size: default_preprocess_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Sweep for small inputs, blocked otherwise.
    #[default]
    Auto,
    Sweep,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompareConfig {
    #[serde(default)]
    pub match_by_hash: bool,

    #[serde(default)]
    pub match_by_aspect: bool,

    /// Pairs scoring at or below this are duplicates.
    #[serde(default = "default_diff_threshold")]
    pub diff_threshold: f64,

    /// Send one job per (row, column batch) instead of one per pair.
    #[serde(default = "default_true")]
    pub batch: bool,

    /// Take the minimum score over the four rotations of the second image.
    #[serde(default = "default_true")]
    pub rotate: bool,

    /// Write a diff visualisation for every match. Requires `batch = false`.
    #[serde(default)]
    pub plot: bool,

    #[serde(default = "default_plot_dir")]
    pub plot_dir: PathBuf,

    /// Compare stored thumbnails instead of decoding the originals.
    #[serde(default = "default_true")]
    pub use_thumbnails: bool,

    /// Resize thumbnails whose size differs from `target_size` instead of
    /// failing the pair.
    #[serde(default)]
    pub allow_resize: bool,

    #[serde(default)]
    pub strategy: Strategy,

    #[serde(default = "default_block_columns")]
    pub block_columns: usize,

    /// Upper bound on block caches held at once.
    #[serde(default = "default_max_live_blocks")]
    pub max_live_blocks: usize,
}

impl Default for CompareConfig {
    fn default() -> Self {
        Self {
            match_by_hash: false,
            match_by_aspect: false,
            diff_threshold: default_diff_threshold(),
            batch: true,
            rotate: true,
            plot: false,
            plot_dir: default_plot_dir(),
            use_thumbnails: true,
            allow_resize: false,
            strategy: Strategy::Auto,
            block_columns: default_block_columns(),
            max_live_blocks: default_max_live_blocks(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_count")]
    pub count: usize,

    /// Receive timeout used by workers and the coordinator.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// A worker that sees no job for this long exits on its own.
    #[serde(default = "default_worker_idle_timeout_secs")]
    pub worker_idle_timeout_secs: u64,

    /// The coordinator aborts when neither enqueue nor dequeue progressed
    /// for this long.
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,

    #[serde(default = "default_commit_interval_ms")]
    pub commit_interval_ms: u64,

    /// Jobs submitted but not yet answered, per worker.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn worker_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_idle_timeout_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.commit_interval_ms)
    }

    pub fn in_flight_limit(&self) -> usize {
        self.count.max(1) * self.max_in_flight.max(1)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            poll_interval_ms: default_poll_interval_ms(),
            worker_idle_timeout_secs: default_worker_idle_timeout_secs(),
            stall_timeout_secs: default_stall_timeout_secs(),
            commit_interval_ms: default_commit_interval_ms(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("diffscan")
        .join("diffscan.db")
}

fn default_image_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png", "gif", "webp", "bmp", "tif", "tiff"]
        .iter()
        .map(|e| e.to_string())
        .collect()
}

fn default_shift_amount() -> i8 {
    4
}

fn default_target_size() -> u32 {
    64
}

fn default_preprocess_batch_size() -> usize {
    16
}

fn default_diff_threshold() -> f64 {
    200.0
}

fn default_plot_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("diffscan/plots")
}

fn default_block_columns() -> usize {
    MAX_BLOCK_COLUMNS
}

fn default_max_live_blocks() -> usize {
    4
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_worker_idle_timeout_secs() -> u64 {
    120
}

fn default_stall_timeout_secs() -> u64 {
    300
}

fn default_commit_interval_ms() -> u64 {
    1000
}

fn default_max_in_flight() -> usize {
    4
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            directories: DirectoryConfig::default(),
            preprocess: PreprocessConfig::default(),
            compare: CompareConfig::default(),
            workers: WorkerConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("diffscan")
    }

    fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("DIFFSCAN_CONFIG") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Where preprocessing writes thumbnails. Unless configured this sits
    /// beside the store (`photos.db` -> `photos.thumbs/`), so two stores
    /// never share files.
    pub fn thumb_dir(&self) -> PathBuf {
        match &self.preprocess.thumb_dir {
            Some(dir) => dir.clone(),
            None => self.db_path.with_extension("thumbs"),
        }
    }

    /// Whether pairs span two directories (rectangular matrix).
    pub fn is_cross(&self) -> bool {
        self.directories.dir_b.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        if !(-7..=7).contains(&self.preprocess.shift_amount) {
            return Err(Error::Config(format!(
                "shift_amount must be within [-7, 7], got {}",
                self.preprocess.shift_amount
            )));
        }
        if self.preprocess.target_size == 0 {
            return Err(Error::Config("target_size must be positive".into()));
        }
        if self.workers.count == 0 {
            return Err(Error::Config("at least one worker is required".into()));
        }
        if self.compare.batch && self.compare.plot {
            return Err(Error::Config(
                "plotting needs item-level dispatch; disable compare.batch to plot".into(),
            ));
        }
        if self.compare.block_columns == 0 || self.compare.block_columns > MAX_BLOCK_COLUMNS {
            return Err(Error::Config(format!(
                "block_columns must be within [1, {}]",
                MAX_BLOCK_COLUMNS
            )));
        }
        if self.compare.diff_threshold < 0.0 {
            return Err(Error::Config("diff_threshold must not be negative".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(!config.is_cross());
    }

    #[test]
    fn test_shift_out_of_range() {
        let mut config = Config::default();
        config.preprocess.shift_amount = 8;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        config.preprocess.shift_amount = -7;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_batch_and_plot_are_exclusive() {
        let mut config = Config::default();
        config.compare.plot = true;
        assert!(config.validate().is_err());
        config.compare.batch = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [compare]
            match_by_aspect = true
            strategy = "sweep"

            [workers]
            count = 3
            "#,
        )
        .unwrap();
        assert!(config.compare.match_by_aspect);
        assert_eq!(config.compare.strategy, Strategy::Sweep);
        assert_eq!(config.workers.count, 3);
        assert_eq!(config.preprocess.target_size, 64);
        assert_eq!(config.compare.block_columns, MAX_BLOCK_COLUMNS);
    }

    #[test]
    fn test_thumb_dir_follows_store() {
        let mut config = Config::default();
        config.db_path = PathBuf::from("/data/one.db");
        assert_eq!(config.thumb_dir(), PathBuf::from("/data/one.thumbs"));

        let mut other = config.clone();
        other.db_path = PathBuf::from("/data/two.db");
        assert_ne!(config.thumb_dir(), other.thumb_dir());

        config.preprocess.thumb_dir = Some(PathBuf::from("/cache/thumbs"));
        assert_eq!(config.thumb_dir(), PathBuf::from("/cache/thumbs"));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");
        let mut config = Config::default();
        config.directories.dir_b = Some(PathBuf::from("/photos/b"));
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert!(loaded.is_cross());
    }
}
