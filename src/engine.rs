//! Entry points for callers driving a whole scan: index, preprocess,
//! compare, then query the matches.

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::compare::{CompareSummary, Comparer};
use crate::config::Config;
use crate::db::{Database, DuplicateGroup, ImageStatus, PairCursor, PairStatus, RunPhase, RunRecord, RunStatus, Side};
use crate::error::{Error, Result};
use crate::kernel::{ImageKernel, Kernel};
use crate::preprocess::{PreprocessSummary, Preprocessor};
use crate::scanner::{self, IndexSummary};
use crate::shutdown::Shutdown;
use crate::tasks::ProgressReporter;

/// Overrides for one preprocessing run.
#[derive(Debug, Clone, Copy)]
pub struct PreprocessOptions {
    pub compute_hash: bool,
    pub compute_thumbnail: bool,
    pub shift_amount: i8,
    pub worker_count: usize,
}

impl PreprocessOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            compute_hash: config.preprocess.compute_hash,
            compute_thumbnail: config.preprocess.compute_thumbnail,
            shift_amount: config.preprocess.shift_amount,
            worker_count: config.workers.count,
        }
    }
}

/// Overrides for one comparison run.
#[derive(Debug, Clone, Copy)]
pub struct SecondPassOptions {
    pub match_by_hash: bool,
    pub match_by_aspect: bool,
    pub diff_threshold: f64,
    pub worker_count: usize,
    pub batch: bool,
}

impl SecondPassOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            match_by_hash: config.compare.match_by_hash,
            match_by_aspect: config.compare.match_by_aspect,
            diff_threshold: config.compare.diff_threshold,
            worker_count: config.workers.count,
            batch: config.compare.batch,
        }
    }
}

/// Counts for the `status` report.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub images_a: i64,
    pub images_b: i64,
    pub images_pending: i64,
    pub images_done: i64,
    pub images_failed: i64,
    pub pairs: i64,
    pub pairs_open: i64,
    pub pairs_success: i64,
    pub pairs_failed: i64,
    pub pairs_skipped_hash: i64,
    pub pairs_skipped_aspect: i64,
    pub plots: i64,
}

pub struct DiffEngine<K: Kernel = ImageKernel> {
    db: Database,
    config: Config,
    kernel: Arc<K>,
    shutdown: Shutdown,
}

impl DiffEngine<ImageKernel> {
    /// Open (creating if needed) the store at `config.db_path`.
    pub fn open(config: Config, shutdown: Shutdown) -> Result<Self> {
        config.validate()?;
        let db = Database::open(&config.db_path)?;
        db.initialize()?;
        Ok(Self::with_kernel(db, config, Arc::new(ImageKernel), shutdown))
    }
}

impl<K: Kernel + 'static> DiffEngine<K> {
    pub fn with_kernel(db: Database, config: Config, kernel: Arc<K>, shutdown: Shutdown) -> Self {
        Self {
            db,
            config,
            kernel,
            shutdown,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn index(&self) -> Result<IndexSummary> {
        let run = self.db.start_run(RunPhase::Index)?;
        let result = scanner::index_directories(&self.db, &self.config);
        match &result {
            Ok(summary) => self.db.finish_run(
                run,
                RunStatus::Completed,
                summary.inserted as i64,
                0,
                summary.skipped.then_some("already indexed"),
            )?,
            Err(e) => self.record_failure(run, e),
        }
        result
    }

    pub fn run_preprocessing(
        &self,
        options: PreprocessOptions,
        reporter: &mut dyn ProgressReporter,
    ) -> Result<PreprocessSummary> {
        let mut config = self.config.clone();
        config.preprocess.compute_hash = options.compute_hash;
        config.preprocess.compute_thumbnail = options.compute_thumbnail;
        config.preprocess.shift_amount = options.shift_amount;
        config.workers.count = options.worker_count;
        config.validate()?;

        let run = self.db.start_run(RunPhase::Preprocess)?;
        let result = Preprocessor::new(&self.db, &config, self.kernel.clone(), self.shutdown.clone())
            .run(reporter);
        match result {
            Ok(summary) => {
                let status = if summary.interrupted {
                    RunStatus::Interrupted
                } else {
                    RunStatus::Completed
                };
                self.db.finish_run(run, status, summary.done as i64, summary.failed as i64, None)?;
                if summary.interrupted {
                    return Err(Error::Interrupted);
                }
                Ok(summary)
            }
            Err(e) => {
                self.record_failure(run, &e);
                Err(e)
            }
        }
    }

    pub fn run_second_pass(
        &self,
        options: SecondPassOptions,
        reporter: &mut dyn ProgressReporter,
    ) -> Result<CompareSummary> {
        let mut config = self.config.clone();
        config.compare.match_by_hash = options.match_by_hash;
        config.compare.match_by_aspect = options.match_by_aspect;
        config.compare.diff_threshold = options.diff_threshold;
        config.compare.batch = options.batch;
        config.workers.count = options.worker_count;
        config.validate()?;

        let run = self.db.start_run(RunPhase::Compare)?;
        let result = Comparer::new(&self.db, &config, self.kernel.clone(), self.shutdown.clone())
            .run(reporter);
        match result {
            Ok(summary) => {
                let status = if summary.interrupted {
                    RunStatus::Interrupted
                } else {
                    RunStatus::Completed
                };
                let skipped = summary.skipped_hash + summary.skipped_aspect;
                let message = summary.mode.map(|m| format!("{} ({} skipped)", m.as_str(), skipped));
                self.db.finish_run(
                    run,
                    status,
                    summary.resolved() as i64,
                    summary.failed as i64,
                    message.as_deref(),
                )?;
                if summary.interrupted {
                    return Err(Error::Interrupted);
                }
                Ok(summary)
            }
            Err(e) => {
                self.record_failure(run, &e);
                Err(e)
            }
        }
    }

    fn record_failure(&self, run: i64, error: &Error) {
        if let Err(e) = self
            .db
            .finish_run(run, RunStatus::Failed, 0, 0, Some(&error.to_string()))
        {
            warn!(run, error = %e, "Could not record failed run");
        }
    }

    /// Matches at or below `threshold`, resumable from a previous cursor's
    /// position.
    pub fn iterate_pairs_below(&self, threshold: f64, after_key: Option<i64>) -> PairCursor<'_> {
        self.db.iterate_pairs_below(threshold, after_key)
    }

    pub fn clusters(&self, threshold: f64) -> Result<Vec<DuplicateGroup>> {
        self.db.build_clusters(threshold)
    }

    /// Delete computed pairs above `threshold`. Refused while pairs are
    /// still open, since pruned pairs would be compared again.
    pub fn prune(&self, threshold: f64) -> Result<usize> {
        let open = self.db.count_pairs_with_status(PairStatus::Unscheduled)?
            + self.db.count_pairs_with_status(PairStatus::Processing)?;
        if open > 0 {
            return Err(Error::NotReady(format!("{} pairs are still open", open)));
        }
        let deleted = self.db.prune_pairs_above(threshold)?;
        info!(deleted, threshold, "Pruned non-matching pairs");
        Ok(deleted)
    }

    /// Move failed images back to pending for the next preprocessing run,
    /// reopening the pairs they failed. Returns (images, pairs).
    pub fn requeue_failed(&self) -> Result<(usize, usize)> {
        let (images, pairs) = self.db.requeue_failed_images()?;
        info!(images, pairs, "Failed images requeued");
        Ok((images, pairs))
    }

    pub fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        self.db.recent_runs(limit)
    }

    pub fn status(&self) -> Result<StoreStatus> {
        let db = &self.db;
        let pairs = |status| db.count_pairs_with_status(status);
        Ok(StoreStatus {
            images_a: db.image_count(Side::A)?,
            images_b: db.image_count(Side::B)?,
            images_pending: db.count_images_with_status(ImageStatus::Pending)?
                + db.count_images_with_status(ImageStatus::InProgress)?,
            images_done: db.count_images_with_status(ImageStatus::Done)?,
            images_failed: db.count_images_with_status(ImageStatus::Error)?,
            pairs: db.count_pairs()?,
            pairs_open: pairs(PairStatus::Unscheduled)? + pairs(PairStatus::Processing)?,
            pairs_success: pairs(PairStatus::Success)?,
            pairs_failed: pairs(PairStatus::Error)?,
            pairs_skipped_hash: pairs(PairStatus::SkippedHash)?,
            pairs_skipped_aspect: pairs(PairStatus::SkippedAspect)?,
            plots: db.plot_count()?,
        })
    }
}
