//! Error taxonomy shared by the pipeline, the scheduler and the store.
//!
//! Per-image and per-pair failures (`Decode`, `SizeMismatch`, `Hash`) are
//! recorded on the affected record and never abort a run. `Integrity`,
//! `FatalWorkerLoss` and a coordinator-level `QueueTimeout` abort it.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to decode {path}: {message}")]
    Decode { path: PathBuf, message: String },

    #[error("thumbnail {path} is {found_x}x{found_y}, expected {expected}x{expected}")]
    SizeMismatch {
        path: PathBuf,
        expected: u32,
        found_x: u32,
        found_y: u32,
    },

    #[error("hashing failed: {0}")]
    Hash(String),

    #[error("queue timeout: {0}")]
    QueueTimeout(String),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("all {workers} workers exited before the work was done")]
    FatalWorkerLoss { workers: usize },

    #[error("not ready: {0}")]
    NotReady(String),

    #[error("no free filename for {stem} after {attempts} attempts")]
    FilenameExhausted { stem: String, attempts: usize },

    #[error("run interrupted")]
    Interrupted,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("config write error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

impl Error {
    /// Whether the error must abort the whole run rather than be recorded on
    /// a single image or pair.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::Decode { .. } | Error::SizeMismatch { .. } | Error::Hash(_) | Error::Image(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_errors_are_not_fatal() {
        let decode = Error::Decode {
            path: PathBuf::from("/a.png"),
            message: "truncated".into(),
        };
        assert!(!decode.is_fatal());
        assert!(!Error::Hash("bad".into()).is_fatal());
    }

    #[test]
    fn test_run_errors_are_fatal() {
        assert!(Error::FatalWorkerLoss { workers: 4 }.is_fatal());
        assert!(Error::Integrity("dup".into()).is_fatal());
        assert!(Error::QueueTimeout("stalled".into()).is_fatal());
    }

    #[test]
    fn test_size_mismatch_message() {
        let err = Error::SizeMismatch {
            path: PathBuf::from("t.png"),
            expected: 64,
            found_x: 32,
            found_y: 64,
        };
        assert_eq!(err.to_string(), "thumbnail t.png is 32x64, expected 64x64");
    }
}
