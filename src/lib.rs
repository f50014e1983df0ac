//! Resumable near-duplicate image finder.
//!
//! Images are indexed into a SQLite store, fingerprinted once (rotation
//! hashes, dimensions, thumbnail) and then compared pairwise by a block
//! scheduler feeding a pool of worker threads. Every per-image and per-pair
//! state change is persisted, so an interrupted run resumes where it left off.

pub mod compare;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod export;
pub mod kernel;
pub mod logging;
pub mod preprocess;
pub mod scanner;
pub mod shutdown;
pub mod tasks;

pub use config::Config;
pub use engine::{DiffEngine, PreprocessOptions, SecondPassOptions, StoreStatus};
pub use error::{Error, Result};
pub use shutdown::Shutdown;
