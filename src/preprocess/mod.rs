//! Preprocessing pipeline: fingerprints every pending image.
//!
//! The coordinator claims pending rows through a cursor (flipping them to in
//! progress), hands them to the worker pool one at a time or in list batches,
//! and writes each fingerprint or error back to the store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db::{Database, ImageRecord, PeriodicCommit, RunPhase, Side};
use crate::error::{Error, Result};
use crate::kernel::{Kernel, RotationHashes, ThumbnailStore};
use crate::shutdown::Shutdown;
use crate::tasks::{Job, PoolSettings, ProgressReporter, TaskProgress, Worker, WorkerEvent, WorkerPool};

#[derive(Debug, Clone)]
pub struct PreprocessItem {
    pub side: Side,
    pub key: i64,
    pub path: PathBuf,
    pub thumb_path: Option<PathBuf>,
}

/// One image, or a list batch of images, for a single worker.
#[derive(Debug)]
pub struct PreprocessJob(pub Vec<PreprocessItem>);

impl Job for PreprocessJob {
    type Ticket = Vec<(Side, i64)>;

    fn ticket(&self) -> Self::Ticket {
        self.0.iter().map(|item| (item.side, item.key)).collect()
    }
}

#[derive(Debug, Clone)]
pub struct Fingerprint {
    pub width: u32,
    pub height: u32,
    pub hashes: Option<RotationHashes>,
    /// Set once the thumbnail file has been written.
    pub thumbnail: Option<PathBuf>,
}

#[derive(Debug)]
pub struct PreprocessOutcome {
    pub side: Side,
    pub key: i64,
    pub result: Result<Fingerprint>,
}

/// Flags and sizes a preprocessing worker needs.
#[derive(Debug, Clone, Copy)]
pub struct FingerprintSettings {
    pub compute_hash: bool,
    pub compute_thumbnail: bool,
    pub shift_amount: i8,
    pub target_size: u32,
}

impl FingerprintSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            compute_hash: config.preprocess.compute_hash,
            compute_thumbnail: config.preprocess.compute_thumbnail,
            shift_amount: config.preprocess.shift_amount,
            target_size: config.preprocess.target_size,
        }
    }
}

pub struct PreprocessWorker<K: Kernel> {
    kernel: Arc<K>,
    settings: FingerprintSettings,
}

impl<K: Kernel> PreprocessWorker<K> {
    pub fn new(kernel: Arc<K>, settings: FingerprintSettings) -> Self {
        Self { kernel, settings }
    }

    fn fingerprint(&self, item: &PreprocessItem) -> Result<Fingerprint> {
        let decoded = self
            .kernel
            .decode_and_resize(&item.path, self.settings.target_size)?;

        let hashes = if self.settings.compute_hash {
            Some(
                self.kernel
                    .hash_rotations(&decoded.pixels, self.settings.shift_amount)?,
            )
        } else {
            None
        };

        if let Some(thumb_path) = &item.thumb_path {
            self.kernel.store_thumbnail(&decoded.pixels, thumb_path)?;
        }

        Ok(Fingerprint {
            width: decoded.width,
            height: decoded.height,
            hashes,
            thumbnail: item.thumb_path.clone(),
        })
    }
}

impl<K: Kernel + 'static> Worker for PreprocessWorker<K> {
    type Job = PreprocessJob;
    type Output = Vec<PreprocessOutcome>;

    fn handle(&mut self, job: PreprocessJob) -> Vec<PreprocessOutcome> {
        job.0
            .iter()
            .map(|item| PreprocessOutcome {
                side: item.side,
                key: item.key,
                result: self.fingerprint(item),
            })
            .collect()
    }
}

#[derive(Debug, Default, Clone)]
pub struct PreprocessSummary {
    pub done: usize,
    pub failed: usize,
    pub jobs: usize,
    pub interrupted: bool,
}

/// Drives one preprocessing run against the store.
pub struct Preprocessor<'a, K: Kernel> {
    db: &'a Database,
    config: &'a Config,
    kernel: Arc<K>,
    shutdown: Shutdown,
}

impl<'a, K: Kernel + 'static> Preprocessor<'a, K> {
    pub fn new(db: &'a Database, config: &'a Config, kernel: Arc<K>, shutdown: Shutdown) -> Self {
        Self {
            db,
            config,
            kernel,
            shutdown,
        }
    }

    pub fn run(&self, reporter: &mut dyn ProgressReporter) -> Result<PreprocessSummary> {
        let settings = FingerprintSettings::from_config(self.config);
        if settings.compute_hash && settings.shift_amount == 0 {
            warn!("shift_amount is 0: hashes will only match byte-identical thumbnails");
        }

        let reset = self.db.reset_in_progress_images()?;
        if reset > 0 {
            info!(count = reset, "Reset images left in progress by an earlier run");
        }

        let total = self
            .db
            .count_images_with_status(crate::db::ImageStatus::Pending)? as usize;
        let mut summary = PreprocessSummary::default();
        let mut progress = TaskProgress::new(RunPhase::Preprocess, total);
        if total == 0 {
            debug!("No pending images");
            reporter.finished(&progress);
            return Ok(summary);
        }

        let workers = &self.config.workers;
        let pool_settings = PoolSettings::from_config(workers);
        let kernel = self.kernel.clone();
        let mut pool = WorkerPool::spawn(pool_settings, self.shutdown.clone(), move |_| {
            PreprocessWorker::new(kernel.clone(), settings)
        })?;

        let thumbs = ThumbnailStore::new(self.config.thumb_dir());
        let batch_size = self.config.preprocess.batch_size.max(1);
        let in_flight_limit = workers.in_flight_limit();
        let started = Instant::now();

        info!(
            total,
            workers = pool.worker_count(),
            batch_size,
            "Preprocessing started"
        );

        let mut commit = PeriodicCommit::start(self.db, workers.commit_interval())?;
        let mut cursor: Option<(Side, i64)> = None;
        let mut claimed = 0usize;
        let mut in_flight = 0usize;
        let mut exhausted = false;
        let mut closing = false;
        let mut last_progress = Instant::now();

        loop {
            let stopping = self.shutdown.is_stopping();

            while !stopping && !exhausted && in_flight < in_flight_limit {
                // List batches only pay off while every worker can get one.
                let remaining = total.saturating_sub(claimed);
                let size = if remaining >= pool.worker_count() * batch_size {
                    batch_size
                } else {
                    1
                };
                let images = self.db.claim_pending_images(cursor, size)?;
                let Some(last) = images.last() else {
                    exhausted = true;
                    break;
                };
                cursor = Some((last.side, last.key));
                claimed += images.len();

                let items = images
                    .into_iter()
                    .map(|image| self.item_for(image, &thumbs, settings))
                    .collect();
                pool.submit(PreprocessJob(items))?;
                in_flight += 1;
                summary.jobs += 1;
                last_progress = Instant::now();
            }

            if (exhausted || stopping) && in_flight == 0 && !closing {
                for _ in 0..pool.alive() {
                    pool.close_one()?;
                }
                closing = true;
            }
            if pool.alive() == 0 {
                break;
            }

            match pool.recv(workers.poll_interval()) {
                Some(WorkerEvent::Done { output, .. }) => {
                    in_flight -= 1;
                    last_progress = Instant::now();
                    for outcome in output {
                        self.apply(outcome, &mut summary)?;
                    }
                }
                Some(WorkerEvent::Panicked { worker, ticket, message }) => {
                    in_flight -= 1;
                    last_progress = Instant::now();
                    error!(worker, %message, "Preprocessing worker panicked");
                    for (side, key) in ticket {
                        self.db.fail_image(side, key, &message)?;
                        summary.failed += 1;
                    }
                }
                Some(WorkerEvent::TimedOut { worker }) => {
                    warn!(worker, "Preprocessing worker timed out while idle");
                }
                Some(_) => {}
                None => {}
            }

            progress.current = summary.done + summary.failed;
            progress.failed = summary.failed;
            reporter.report(&progress);
            commit.tick(self.db)?;

            if last_progress.elapsed() > workers.stall_timeout() {
                commit.finish(self.db)?;
                return Err(Error::QueueTimeout(format!(
                    "preprocessing made no progress for {:?} ({} jobs in flight, {} workers alive)",
                    workers.stall_timeout(),
                    in_flight,
                    pool.alive()
                )));
            }
        }

        commit.finish(self.db)?;
        pool.join();

        summary.interrupted = self.shutdown.is_stopping();
        let unfinished = !exhausted || in_flight > 0;
        if unfinished && !summary.interrupted {
            return Err(Error::FatalWorkerLoss {
                workers: self.config.workers.count,
            });
        }

        reporter.finished(&progress);
        info!(
            done = summary.done,
            failed = summary.failed,
            jobs = summary.jobs,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Preprocessing finished"
        );
        Ok(summary)
    }

    fn item_for(
        &self,
        image: ImageRecord,
        thumbs: &ThumbnailStore,
        settings: FingerprintSettings,
    ) -> PreprocessItem {
        PreprocessItem {
            side: image.side,
            key: image.key,
            thumb_path: settings
                .compute_thumbnail
                .then(|| thumbs.path_for(image.side, image.key)),
            path: image.path,
        }
    }

    fn apply(&self, outcome: PreprocessOutcome, summary: &mut PreprocessSummary) -> Result<()> {
        match outcome.result {
            Ok(fingerprint) => {
                let buckets = match &fingerprint.hashes {
                    Some(hashes) => Some(self.upsert_rotations(hashes)?),
                    None => None,
                };
                self.db.complete_image(
                    outcome.side,
                    outcome.key,
                    fingerprint.width,
                    fingerprint.height,
                    buckets,
                    fingerprint.thumbnail.as_deref(),
                )?;
                summary.done += 1;
            }
            Err(e) => {
                // Unreadable files are routine; anything else is worth a warning.
                if e.is_fatal() {
                    warn!(side = outcome.side.tag(), key = outcome.key, error = %e, "Image failed");
                } else {
                    debug!(side = outcome.side.tag(), key = outcome.key, error = %e, "Image failed");
                }
                self.db.fail_image(outcome.side, outcome.key, &e.to_string())?;
                summary.failed += 1;
            }
        }
        Ok(())
    }

    /// Upsert all four rotation hashes, releasing the ones already taken if
    /// a later one fails.
    fn upsert_rotations(&self, hashes: &RotationHashes) -> Result<[i64; 4]> {
        let mut buckets = [0i64; 4];
        for (i, hash) in hashes.iter().enumerate() {
            match self.db.upsert_hash(hash) {
                Ok(key) => buckets[i] = key,
                Err(e) => {
                    for &taken in &buckets[..i] {
                        self.db.release_hash(taken)?;
                    }
                    return Err(e);
                }
            }
        }
        Ok(buckets)
    }
}
