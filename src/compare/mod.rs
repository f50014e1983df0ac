//! Pairwise comparison scheduler.
//!
//! Walks the comparison matrix block by block (see [`plan`]), settles what
//! the pre-checks can settle, decodes the rest into a [`cache::BlockCache`]
//! and queues row jobs for the worker pool, submitting them only while fewer
//! than `workers.in_flight_limit()` are unanswered. The coordinator is the only
//! writer: workers return scores and the coordinator records them, holding
//! each block's cache until every one of its pairs is terminal.

pub mod cache;
pub mod plan;
pub mod precheck;
pub mod worker;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{Config, Strategy};
use crate::db::{Database, ImageRecord, ImageStatus, PairStatus, PendingPair, PeriodicCommit, RunPhase, Side};
use crate::db::pairs::DIF_NOT_COMPUTED;
use crate::error::{Error, Result};
use crate::kernel::Kernel;
use crate::shutdown::Shutdown;
use crate::tasks::{PoolSettings, ProgressReporter, TaskProgress, WorkerEvent, WorkerPool};

use cache::{BlockCache, CachedBuffer, ImageLoader};
use plan::{expected_pairs, Block, BlockPlanner, PlanStep};
use precheck::{Precheck, Verdict};
use worker::{CompareItem, CompareJob, CompareSettings, CompareWorker, Operand, PairOutcome, PlotSettings};

/// How comparison jobs are shaped, resolved once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Blocked walk, one job per row and column window, decoded buffers.
    BatchCached,
    /// Blocked walk, one job per pair, decoded buffers.
    ItemCached,
    /// Row sweep, one job per row and column window, workers decode.
    BatchPaths,
    /// Row sweep, one job per pair, workers decode.
    ItemPaths,
}

impl DispatchMode {
    pub fn resolve(strategy: Strategy, batch: bool, rows: usize, workers: usize) -> Self {
        let sweep = match strategy {
            Strategy::Sweep => true,
            Strategy::Blocked => false,
            Strategy::Auto => rows < workers,
        };
        match (sweep, batch) {
            (false, true) => DispatchMode::BatchCached,
            (false, false) => DispatchMode::ItemCached,
            (true, true) => DispatchMode::BatchPaths,
            (true, false) => DispatchMode::ItemPaths,
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, DispatchMode::BatchCached | DispatchMode::ItemCached)
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, DispatchMode::BatchCached | DispatchMode::BatchPaths)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchMode::BatchCached => "batch-cached",
            DispatchMode::ItemCached => "item-cached",
            DispatchMode::BatchPaths => "batch-paths",
            DispatchMode::ItemPaths => "item-paths",
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct CompareSummary {
    pub mode: Option<DispatchMode>,
    pub compared: usize,
    pub failed: usize,
    pub skipped_hash: usize,
    pub skipped_aspect: usize,
    pub jobs: usize,
    /// Blocks planned, including ones the store had already resolved.
    pub blocks: usize,
    /// Blocks that had jobs submitted and so held a cache.
    pub blocks_dispatched: usize,
    pub blocks_released: usize,
    pub peak_live_blocks: usize,
    pub peak_in_flight: usize,
    pub interrupted: bool,
}

impl CompareSummary {
    pub fn resolved(&self) -> usize {
        self.compared + self.failed + self.skipped_hash + self.skipped_aspect
    }
}

/// A block with jobs still out.
struct LiveBlock {
    block: Block,
    /// Unresolved dispatched pairs per row.
    remaining: HashMap<i64, usize>,
    outstanding: usize,
    cache: Option<BlockCache>,
}

impl LiveBlock {
    fn resolve(&mut self, key_a: i64) {
        if let Some(left) = self.remaining.get_mut(&key_a) {
            *left = left.saturating_sub(1);
            if *left == 0 {
                self.remaining.remove(&key_a);
            }
        }
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    fn is_complete(&self) -> bool {
        self.outstanding == 0
    }
}

/// Drives one comparison run against the store.
pub struct Comparer<'a, K: Kernel> {
    db: &'a Database,
    config: &'a Config,
    kernel: Arc<K>,
    shutdown: Shutdown,
}

impl<'a, K: Kernel + 'static> Comparer<'a, K> {
    pub fn new(db: &'a Database, config: &'a Config, kernel: Arc<K>, shutdown: Shutdown) -> Self {
        Self {
            db,
            config,
            kernel,
            shutdown,
        }
    }

    pub fn run(&self, reporter: &mut dyn ProgressReporter) -> Result<CompareSummary> {
        let unfinished = self.db.count_images_with_status(ImageStatus::Pending)?
            + self.db.count_images_with_status(ImageStatus::InProgress)?;
        if unfinished > 0 {
            return Err(Error::NotReady(format!(
                "{} images have not been preprocessed",
                unfinished
            )));
        }

        let reset = self.db.reset_processing_pairs()?;
        if reset > 0 {
            info!(count = reset, "Rescheduling pairs left processing by an earlier run");
        }

        let cross = self.db.is_cross_store()?;
        let images_a = self.db.load_images(Side::A)?;
        let images_b = if cross {
            Some(self.db.load_images(Side::B)?)
        } else {
            None
        };
        let rows = images_a.len() as i64;
        let cols = images_b.as_ref().map_or(rows, |b| b.len() as i64);

        // Resume from the first row that still has unresolved pairs.
        let terminal = self.db.terminal_counts_by_row()?;
        let start_row = (0..rows)
            .find(|&a| terminal.get(&a).copied().unwrap_or(0) < expected_pairs(a, rows, cols, cross))
            .unwrap_or(rows);
        let total: i64 = (0..rows).map(|a| expected_pairs(a, rows, cols, cross)).sum();
        let already: i64 = terminal.values().sum();

        let workers = self.config.workers.count.max(1);
        let mode = DispatchMode::resolve(
            self.config.compare.strategy,
            self.config.compare.batch,
            rows as usize,
            workers,
        );

        let summary = CompareSummary {
            mode: Some(mode),
            ..Default::default()
        };
        let mut progress = TaskProgress::new(RunPhase::Compare, total as usize);
        progress.current = already as usize;

        if start_row >= rows {
            info!(pairs = already, "Every pair is already resolved");
            reporter.finished(&progress);
            return Ok(summary);
        }

        info!(
            rows,
            cols,
            cross,
            start_row,
            mode = mode.as_str(),
            workers,
            "Comparison started"
        );

        let compare = &self.config.compare;
        let loader = ImageLoader::new(
            self.kernel.clone(),
            self.config.preprocess.target_size,
            compare.use_thumbnails,
            compare.allow_resize,
        );
        let settings = CompareSettings {
            rotate: compare.rotate,
            plot: (compare.plot && !mode.is_batch()).then(|| PlotSettings {
                dir: compare.plot_dir.clone(),
                threshold: compare.diff_threshold,
            }),
        };
        let worker_loader = loader.clone();
        let pool = WorkerPool::spawn(
            PoolSettings::from_config(&self.config.workers),
            self.shutdown.clone(),
            move |_| CompareWorker::new(worker_loader.clone(), settings.clone()),
        )?;

        let band_height = if mode.is_cached() { workers } else { 1 };
        let planner = BlockPlanner::new(
            rows,
            cols,
            cross,
            workers,
            band_height,
            compare.block_columns,
            start_row,
        )
        .with_first_id(self.db.next_block_id()?);

        let mut pass = Pass {
            db: self.db,
            config: self.config,
            shutdown: &self.shutdown,
            images_a: &images_a,
            images_b: images_b.as_deref(),
            cross,
            mode,
            loader,
            precheck: Precheck {
                match_by_hash: compare.match_by_hash,
                match_by_aspect: compare.match_by_aspect,
                rotate: compare.rotate,
            },
            pool,
            planner,
            live: VecDeque::new(),
            backlog: VecDeque::new(),
            band_rows: None,
            in_flight: 0,
            closes_sent: 0,
            summary,
        };

        let started = Instant::now();
        let result = pass.drive(reporter, &mut progress);
        let Pass { pool, mut summary, .. } = pass;
        match result {
            Ok(()) => pool.join(),
            // Stuck workers cannot be joined; their threads are left behind.
            Err(e) => {
                error!(error = %e, "Comparison aborted");
                if let Err(commit_err) = self.db.commit() {
                    warn!(error = %commit_err, "Could not commit results before aborting");
                }
                return Err(e);
            }
        }

        summary.interrupted = self.shutdown.is_stopping();
        reporter.finished(&progress);
        info!(
            compared = summary.compared,
            failed = summary.failed,
            skipped_hash = summary.skipped_hash,
            skipped_aspect = summary.skipped_aspect,
            blocks = summary.blocks,
            jobs = summary.jobs,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Comparison finished"
        );
        Ok(summary)
    }
}

/// Mutable state of one comparison run, owned by the coordinator.
struct Pass<'r, K: Kernel + 'static> {
    db: &'r Database,
    config: &'r Config,
    shutdown: &'r Shutdown,
    images_a: &'r [ImageRecord],
    images_b: Option<&'r [ImageRecord]>,
    cross: bool,
    mode: DispatchMode,
    loader: ImageLoader<K>,
    precheck: Precheck,
    pool: WorkerPool<CompareWorker<K>>,
    planner: BlockPlanner,
    live: VecDeque<LiveBlock>,
    /// Jobs of live blocks not yet handed to the pool.
    backlog: VecDeque<CompareJob>,
    /// Row buffers of the current band, shared by its blocks.
    band_rows: Option<(Range<i64>, HashMap<i64, CachedBuffer>)>,
    in_flight: usize,
    closes_sent: usize,
    summary: CompareSummary,
}

impl<K: Kernel + 'static> Pass<'_, K> {
    fn drive(&mut self, reporter: &mut dyn ProgressReporter, progress: &mut TaskProgress) -> Result<()> {
        let config = self.config;
        let workers = &config.workers;
        let max_live = config.compare.max_live_blocks.max(1);
        let in_flight_limit = workers.in_flight_limit();
        let already = progress.current;

        let mut commit = PeriodicCommit::start(self.db, workers.commit_interval())?;
        let mut last_progress = Instant::now();

        loop {
            let stopping = self.shutdown.is_stopping();

            if !stopping {
                loop {
                    if self.submit_backlog(in_flight_limit)? > 0 {
                        last_progress = Instant::now();
                    }
                    // Closes must queue behind every job already planned.
                    if !self.backlog.is_empty()
                        || self.live.len() >= max_live
                        || self.in_flight >= in_flight_limit
                    {
                        break;
                    }
                    match self.planner.next_step() {
                        None => break,
                        Some(PlanStep::SlotsRetired(count)) => self.close_slots(count)?,
                        Some(PlanStep::Block(block)) => {
                            self.schedule(block)?;
                            last_progress = Instant::now();
                        }
                    }
                }
            } else if self.in_flight == 0 && self.closes_sent < self.pool.worker_count() {
                // Workers leave on their own once stopping; the sentinels
                // only wake the ones still polling.
                let missing = self.pool.worker_count() - self.closes_sent;
                for _ in 0..missing {
                    if self.pool.close_one().is_err() {
                        break;
                    }
                }
                self.closes_sent += missing;
            }

            if self.pool.alive() == 0 {
                break;
            }

            match self.pool.recv(workers.poll_interval()) {
                Some(WorkerEvent::Done { output, .. }) => {
                    self.in_flight -= 1;
                    last_progress = Instant::now();
                    for outcome in output {
                        self.ingest(outcome)?;
                    }
                }
                Some(WorkerEvent::Panicked {
                    worker,
                    ticket: (block_id, pairs),
                    message,
                }) => {
                    self.in_flight -= 1;
                    last_progress = Instant::now();
                    error!(worker, block_id, %message, "Comparison worker panicked");
                    for pair in pairs {
                        self.ingest(PairOutcome {
                            block_id,
                            pair,
                            result: Err(format!("worker panicked: {}", message)),
                            plot: None,
                        })?;
                    }
                }
                Some(WorkerEvent::TimedOut { worker }) => {
                    warn!(worker, "Comparison worker timed out while idle");
                }
                Some(_) | None => {}
            }

            self.release_completed()?;

            progress.current = already + self.summary.resolved();
            progress.failed = self.summary.failed;
            progress.skipped = self.summary.skipped_hash + self.summary.skipped_aspect;
            reporter.report(progress);
            commit.tick(self.db)?;

            if last_progress.elapsed() > workers.stall_timeout() {
                commit.finish(self.db)?;
                return Err(Error::QueueTimeout(format!(
                    "comparison made no progress for {:?} ({} jobs in flight, {} queued, {} live blocks, {} workers alive)",
                    workers.stall_timeout(),
                    self.in_flight,
                    self.backlog.len(),
                    self.live.len(),
                    self.pool.alive()
                )));
            }
        }

        self.release_completed()?;
        commit.finish(self.db)?;

        let unfinished = !self.planner.is_exhausted() || self.in_flight > 0 || !self.backlog.is_empty();
        if unfinished && !self.shutdown.is_stopping() {
            return Err(Error::FatalWorkerLoss {
                workers: self.pool.worker_count(),
            });
        }
        Ok(())
    }

    /// Hand queued jobs to the pool while the in-flight limit allows. Pairs
    /// turn processing only once their job is submitted, so a stop leaves
    /// the rest unscheduled.
    fn submit_backlog(&mut self, limit: usize) -> Result<usize> {
        let mut submitted = 0;
        while self.in_flight < limit {
            let Some(job) = self.backlog.pop_front() else {
                break;
            };
            let keys: Vec<i64> = job.items.iter().map(|item| item.pair.key).collect();
            self.db.mark_pairs_processing(&keys)?;
            self.pool.submit(job)?;
            self.in_flight += 1;
            self.summary.jobs += 1;
            submitted += 1;
        }
        self.summary.peak_in_flight = self.summary.peak_in_flight.max(self.in_flight);
        Ok(submitted)
    }

    fn close_slots(&mut self, count: usize) -> Result<()> {
        for _ in 0..count {
            self.pool.close_one()?;
        }
        self.closes_sent += count;
        debug!(count, watermark = self.planner.watermark(), "Slots retired");
        Ok(())
    }

    fn image_b(&self, key: i64) -> Option<&ImageRecord> {
        self.images_b.unwrap_or(self.images_a).get(key as usize)
    }

    fn side_b(&self) -> Side {
        if self.cross {
            Side::B
        } else {
            Side::A
        }
    }

    /// Materialize a block's pairs, settle what needs no kernel and queue
    /// the rest.
    fn schedule(&mut self, block: Block) -> Result<()> {
        self.summary.blocks += 1;
        self.db.insert_block_pairs(block.id, block.pairs(self.cross))?;
        let pending = self.db.unscheduled_pairs_in_block(block.id)?;
        if pending.is_empty() {
            debug!(block = block.id, "Block already resolved");
            return Ok(());
        }

        let mut to_compare = Vec::with_capacity(pending.len());
        for pair in pending {
            let a = self.images_a.get(pair.key_a as usize);
            let b = self.image_b(pair.key_b);
            // A failed image fails its pairs with its own error, unread.
            if let Some(failure) = a
                .and_then(ImageRecord::failure)
                .or_else(|| b.and_then(ImageRecord::failure))
            {
                let message = failure.to_string();
                self.db.resolve_unscheduled_pair(
                    pair.key,
                    PairStatus::Error,
                    DIF_NOT_COMPUTED,
                    Some(&message),
                )?;
                self.summary.failed += 1;
                continue;
            }
            let verdict = match (a, b) {
                (Some(a), Some(b)) if self.precheck.is_enabled() => self.precheck.check(a, b),
                _ => Verdict::Compare,
            };
            match verdict {
                Verdict::Compare => to_compare.push(pair),
                Verdict::SameHash => {
                    self.db
                        .resolve_unscheduled_pair(pair.key, PairStatus::SkippedHash, 0.0, None)?;
                    self.summary.skipped_hash += 1;
                }
                Verdict::AspectMismatch => {
                    self.db.resolve_unscheduled_pair(
                        pair.key,
                        PairStatus::SkippedAspect,
                        DIF_NOT_COMPUTED,
                        None,
                    )?;
                    self.summary.skipped_aspect += 1;
                }
            }
        }
        if to_compare.is_empty() {
            return Ok(());
        }

        let cache = if self.mode.is_cached() {
            Some(self.build_cache(&block, &to_compare))
        } else {
            None
        };

        // Pairs whose buffers failed to decode are settled here.
        let mut rows: BTreeMap<i64, Vec<(PendingPair, Operand)>> = BTreeMap::new();
        let mut row_operands: HashMap<i64, Operand> = HashMap::new();
        for pair in to_compare {
            let operands = match &cache {
                Some(cache) => cached_operands(cache, &pair),
                None => Ok(self.path_operands(&pair)),
            };
            match operands {
                Ok((a, b)) => {
                    row_operands.entry(pair.key_a).or_insert(a);
                    rows.entry(pair.key_a).or_default().push((pair, b));
                }
                Err(message) => {
                    self.db.resolve_unscheduled_pair(
                        pair.key,
                        PairStatus::Error,
                        DIF_NOT_COMPUTED,
                        Some(&message),
                    )?;
                    self.summary.failed += 1;
                }
            }
        }
        if rows.is_empty() {
            return Ok(());
        }

        let mut live = LiveBlock {
            block,
            remaining: HashMap::new(),
            outstanding: rows.values().map(Vec::len).sum(),
            cache,
        };
        let block_id = live.block.id;
        let mut jobs = Vec::new();
        for (key_a, items) in rows {
            live.remaining.insert(key_a, items.len());
            let Some(a) = row_operands.remove(&key_a) else {
                continue;
            };
            let items: Vec<CompareItem> = items
                .into_iter()
                .map(|(pair, b)| CompareItem { pair, b })
                .collect();
            if self.mode.is_batch() {
                jobs.push(CompareJob { block_id, a, items });
            } else {
                for item in items {
                    jobs.push(CompareJob {
                        block_id,
                        a: a.clone(),
                        items: vec![item],
                    });
                }
            }
        }

        debug!(
            block = block_id,
            rows = ?live.block.rows,
            cols = ?live.block.cols,
            pairs = live.outstanding,
            jobs = jobs.len(),
            cached = live.cache.as_ref().map_or(0, |c| c.len()),
            "Block scheduled"
        );

        self.backlog.extend(jobs);
        self.live.push_back(live);
        self.summary.blocks_dispatched += 1;
        self.summary.peak_live_blocks = self.summary.peak_live_blocks.max(self.live.len());
        Ok(())
    }

    fn build_cache(&mut self, block: &Block, pairs: &[PendingPair]) -> BlockCache {
        let mut row_keys: Vec<i64> = pairs.iter().map(|p| p.key_a).collect();
        row_keys.sort_unstable();
        row_keys.dedup();
        let mut col_keys: Vec<i64> = pairs.iter().map(|p| p.key_b).collect();
        col_keys.sort_unstable();
        col_keys.dedup();

        // A new band invalidates the shared row buffers.
        let same_band = matches!(&self.band_rows, Some((band, _)) if *band == block.rows);
        if !same_band {
            self.band_rows = Some((block.rows.clone(), HashMap::new()));
        }
        let empty = HashMap::new();
        let reuse = self.band_rows.as_ref().map_or(&empty, |(_, rows)| rows);

        let cache = BlockCache::build(
            &self.loader,
            self.images_a,
            self.images_b,
            &row_keys,
            &col_keys,
            reuse,
        );
        if let Some((_, rows)) = &mut self.band_rows {
            rows.extend(cache.rows_for(&row_keys));
        }
        cache
    }

    fn path_operands(&self, pair: &PendingPair) -> (Operand, Operand) {
        let operand = |side: Side, key: i64, image: Option<&ImageRecord>| Operand::Path {
            side,
            key,
            path: image.map(|i| i.path.clone()).unwrap_or_default(),
            thumbnail: image
                .and_then(ImageRecord::stored_thumbnail)
                .map(|p| p.to_path_buf()),
        };
        (
            operand(Side::A, pair.key_a, self.images_a.get(pair.key_a as usize)),
            operand(self.side_b(), pair.key_b, self.image_b(pair.key_b)),
        )
    }

    fn ingest(&mut self, outcome: PairOutcome) -> Result<()> {
        let pair = outcome.pair;
        match outcome.result {
            Ok(score) => {
                self.db.finish_pair(pair.key, PairStatus::Success, score, None)?;
                self.summary.compared += 1;
                if let Some(plot) = outcome.plot {
                    if !self.db.record_plot(pair.key_a, pair.key_b, &plot)? {
                        warn!(path = %plot.display(), "Plot path already recorded");
                    }
                }
            }
            Err(message) => {
                self.db.finish_pair(
                    pair.key,
                    PairStatus::Error,
                    DIF_NOT_COMPUTED,
                    Some(&message),
                )?;
                self.summary.failed += 1;
            }
        }

        match self.live.iter_mut().find(|b| b.block.id == outcome.block_id) {
            Some(live) => live.resolve(pair.key_a),
            None => {
                return Err(Error::Integrity(format!(
                    "result for pair {} names block {} which is not live",
                    pair.key, outcome.block_id
                )))
            }
        }
        Ok(())
    }

    /// Drop the caches of finished blocks, oldest first.
    fn release_completed(&mut self) -> Result<()> {
        while let Some(index) = self.live.iter().position(|b| b.is_complete()) {
            let Some(done) = self.live.remove(index) else {
                break;
            };
            let open = self.db.count_open_pairs_in_block(done.block.id)?;
            if open > 0 {
                return Err(Error::Integrity(format!(
                    "block {} completed with {} open pairs",
                    done.block.id, open
                )));
            }
            self.summary.blocks_released += 1;
            debug!(
                block = done.block.id,
                buffers = done.cache.as_ref().map_or(0, |c| c.len()),
                "Block released"
            );
        }
        Ok(())
    }
}

fn cached_operands(cache: &BlockCache, pair: &PendingPair) -> std::result::Result<(Operand, Operand), String> {
    let lookup = |entry: Option<&CachedBuffer>, key: i64| match entry {
        Some(Ok(buffer)) => Ok(Operand::Cached(buffer.clone())),
        Some(Err(message)) => Err(message.clone()),
        None => Err(format!("image {} missing from block cache", key)),
    };
    let a = lookup(cache.row(pair.key_a), pair.key_a)?;
    let b = lookup(cache.col(pair.key_b), pair.key_b)?;
    Ok((a, b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::PairRecord;
    use crate::kernel::testing::{write_png, CountingKernel};
    use crate::kernel::thumbnails::store_thumbnail;
    use crate::kernel::{ImageKernel, PixelBuffer, ThumbnailStore};
    use crate::preprocess::Preprocessor;
    use crate::tasks::NoProgress;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Raises a stop request from inside the `after`-th diff.
    struct StoppingKernel {
        shutdown: Shutdown,
        after: usize,
        diffs: AtomicUsize,
    }

    impl Kernel for StoppingKernel {
        fn pixel_diff(&self, a: &PixelBuffer, b: &PixelBuffer) -> Result<f64> {
            if self.diffs.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
                self.shutdown.signal();
            }
            crate::kernel::diff::pixel_diff(a, b)
        }
    }

    fn config(dir: &Path, workers: usize) -> Config {
        let mut config = Config::default();
        config.preprocess.thumb_dir = Some(dir.join("thumbs"));
        config.preprocess.target_size = 16;
        config.compare.plot_dir = dir.join("plots");
        config.compare.block_columns = 2;
        config.workers.count = workers;
        config.workers.poll_interval_ms = 5;
        config.workers.commit_interval_ms = 0;
        config
    }

    /// Index and preprocess `a` (and `b`), each given as (width, height).
    fn prepare(dir: &Path, config: &Config, a: &[(u32, u32)], b: &[(u32, u32)]) -> Database {
        let write = |prefix: &str, sizes: &[(u32, u32)]| -> Vec<PathBuf> {
            sizes
                .iter()
                .enumerate()
                .map(|(i, &(w, h))| {
                    write_png(dir, &format!("{}{}.png", prefix, i), w, h, (i as u8).wrapping_mul(47))
                })
                .collect()
        };
        let db = Database::open(&dir.join("store.db")).unwrap();
        db.initialize().unwrap();
        db.insert_images(Side::A, &write("a", a)).unwrap();
        if !b.is_empty() {
            db.insert_images(Side::B, &write("b", b)).unwrap();
        }
        Preprocessor::new(&db, config, Arc::new(ImageKernel), Shutdown::new())
            .run(&mut NoProgress)
            .unwrap();
        db
    }

    fn compare<K: Kernel + 'static>(db: &Database, config: &Config, kernel: Arc<K>) -> CompareSummary {
        Comparer::new(db, config, kernel, Shutdown::new())
            .run(&mut NoProgress)
            .unwrap()
    }

    fn scores(db: &Database) -> Vec<(i64, i64, i64, f64)> {
        let mut pairs: Vec<PairRecord> = db.all_pairs().unwrap();
        pairs.sort_by_key(|p| (p.key_a, p.key_b));
        pairs
            .into_iter()
            .map(|p| (p.key_a, p.key_b, p.status.as_i64(), p.dif))
            .collect()
    }

    #[test]
    fn test_dispatch_mode_resolution() {
        assert_eq!(DispatchMode::resolve(Strategy::Auto, true, 2, 4), DispatchMode::BatchPaths);
        assert_eq!(DispatchMode::resolve(Strategy::Auto, true, 40, 4), DispatchMode::BatchCached);
        assert_eq!(DispatchMode::resolve(Strategy::Sweep, false, 40, 4), DispatchMode::ItemPaths);
        assert_eq!(DispatchMode::resolve(Strategy::Blocked, false, 1, 4), DispatchMode::ItemCached);
        assert!(DispatchMode::ItemCached.is_cached());
        assert!(!DispatchMode::ItemCached.is_batch());
    }

    #[test]
    fn test_triangle_resolves_every_pair() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 2);
        config.compare.rotate = false;
        let db = prepare(dir.path(), &config, &[(20, 20); 5], &[]);

        let kernel = Arc::new(CountingKernel::default());
        let summary = compare(&db, &config, kernel.clone());

        assert_eq!(summary.compared, 10);
        assert_eq!(summary.failed, 0);
        assert_eq!(kernel.diffs(), 10);
        assert_eq!(db.count_pairs().unwrap(), 10);
        assert_eq!(db.count_pairs_with_status(PairStatus::Success).unwrap(), 10);
        assert!(db.all_pairs().unwrap().iter().all(|p| p.key_a < p.key_b));
        assert_eq!(summary.blocks_released, summary.blocks_dispatched);
        assert!(summary.peak_live_blocks <= config.compare.max_live_blocks);
    }

    #[test]
    fn test_cross_with_aspect_precheck() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 2);
        config.directories.dir_b = Some(dir.path().to_path_buf());
        config.compare.match_by_aspect = true;
        config.compare.rotate = false;
        let db = prepare(
            dir.path(),
            &config,
            &[(30, 20), (30, 20), (16, 16)],
            &[(20, 30), (30, 20), (40, 40), (40, 40)],
        );

        let kernel = Arc::new(CountingKernel::default());
        let summary = compare(&db, &config, kernel.clone());

        assert_eq!(db.count_pairs().unwrap(), 12);
        assert_eq!(summary.skipped_aspect, 8);
        assert_eq!(summary.compared, 4);
        assert_eq!(kernel.diffs(), 4);
        let skipped = db.get_pair(2, 0).unwrap().unwrap();
        assert_eq!(skipped.status, PairStatus::SkippedAspect);
        assert_eq!(skipped.dif, DIF_NOT_COMPUTED);
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 2);
        let db = prepare(dir.path(), &config, &[(20, 20); 4], &[]);

        compare(&db, &config, Arc::new(ImageKernel));
        let before = scores(&db);

        let kernel = Arc::new(CountingKernel::default());
        let summary = compare(&db, &config, kernel.clone());
        assert_eq!(summary.resolved(), 0);
        assert_eq!(kernel.diffs(), 0);
        assert_eq!(scores(&db), before);
    }

    #[test]
    fn test_pairs_left_processing_are_recomputed() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 2);
        config.compare.rotate = false;
        let db = prepare(dir.path(), &config, &[(20, 20); 5], &[]);
        compare(&db, &config, Arc::new(ImageKernel));
        let before = scores(&db);

        // As if the process died with row 1 dispatched.
        db.conn()
            .execute("UPDATE dif_table SET status = 0, dif = -1 WHERE key_a = 1", [])
            .unwrap();

        let kernel = Arc::new(CountingKernel::default());
        let summary = compare(&db, &config, kernel.clone());
        assert_eq!(summary.compared, 3);
        assert_eq!(kernel.diffs(), 3);
        assert_eq!(db.count_pairs_with_status(PairStatus::Processing).unwrap(), 0);
        assert_eq!(scores(&db), before);
    }

    #[test]
    fn test_modes_agree() {
        let sizes = [(20, 20), (24, 16), (16, 24), (20, 20), (18, 18), (20, 20)];
        let mut results = Vec::new();
        for (strategy, batch) in [
            (Strategy::Sweep, true),
            (Strategy::Sweep, false),
            (Strategy::Blocked, true),
            (Strategy::Blocked, false),
        ] {
            let dir = tempfile::tempdir().unwrap();
            let mut config = config(dir.path(), 3);
            config.compare.strategy = strategy;
            config.compare.batch = batch;
            let db = prepare(dir.path(), &config, &sizes, &[]);
            let summary = compare(&db, &config, Arc::new(ImageKernel));
            assert_eq!(summary.compared, 15);
            assert_eq!(summary.blocks_released, summary.blocks_dispatched);
            results.push(scores(&db));
        }
        assert!(results.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_unreadable_image_fails_its_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 2);
        config.compare.use_thumbnails = false;
        config.compare.strategy = Strategy::Blocked;
        let db = prepare(dir.path(), &config, &[(20, 20); 3], &[]);
        // Gone after preprocessing.
        std::fs::remove_file(dir.path().join("a0.png")).unwrap();

        let summary = compare(&db, &config, Arc::new(ImageKernel));
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.compared, 1);
        let failed = db.get_pair(0, 2).unwrap().unwrap();
        assert_eq!(failed.status, PairStatus::Error);
        assert!(failed.error.unwrap().contains("a0.png"));
    }

    #[test]
    fn test_not_ready_before_preprocessing() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        db.insert_images(Side::A, &[write_png(dir.path(), "x.png", 8, 8, 1)]).unwrap();
        let result = Comparer::new(&db, &config(dir.path(), 1), Arc::new(ImageKernel), Shutdown::new())
            .run(&mut NoProgress);
        assert!(matches!(result, Err(Error::NotReady(_))));
    }

    #[test]
    fn test_stop_before_start_submits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 2);
        let db = prepare(dir.path(), &config, &[(20, 20); 4], &[]);

        let shutdown = Shutdown::new();
        shutdown.signal();
        let summary = Comparer::new(&db, &config, Arc::new(ImageKernel), shutdown)
            .run(&mut NoProgress)
            .unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.jobs, 0);
        assert_eq!(db.count_pairs_with_status(PairStatus::Processing).unwrap(), 0);
    }

    #[test]
    fn test_failed_image_ignores_leftover_thumbnail() {
        for strategy in [Strategy::Blocked, Strategy::Sweep] {
            let dir = tempfile::tempdir().unwrap();
            let mut config = config(dir.path(), 2);
            config.compare.rotate = false;
            config.compare.strategy = strategy;

            // A file already sitting where image 0's thumbnail would go.
            let leftover = ThumbnailStore::new(dir.path().join("thumbs")).path_for(Side::A, 0);
            store_thumbnail(&PixelBuffer::new(16, 16), &leftover).unwrap();
            let broken = dir.path().join("a0.png");
            std::fs::write(&broken, b"garbage").unwrap();
            let paths = vec![
                broken,
                write_png(dir.path(), "a1.png", 20, 20, 40),
                write_png(dir.path(), "a2.png", 20, 20, 90),
            ];

            let db = Database::open(&dir.path().join("store.db")).unwrap();
            db.initialize().unwrap();
            db.insert_images(Side::A, &paths).unwrap();
            Preprocessor::new(&db, &config, Arc::new(ImageKernel), Shutdown::new())
                .run(&mut NoProgress)
                .unwrap();
            let image = db.get_image(Side::A, 0).unwrap().unwrap();
            assert_eq!(image.status, ImageStatus::Error);

            let kernel = Arc::new(CountingKernel::default());
            let summary = compare(&db, &config, kernel.clone());
            assert_eq!((summary.compared, summary.failed), (1, 2));
            assert_eq!(kernel.diffs(), 1);
            for key_b in [1, 2] {
                let pair = db.get_pair(0, key_b).unwrap().unwrap();
                assert_eq!(pair.status, PairStatus::Error);
                assert_eq!(pair.dif, DIF_NOT_COMPUTED);
                assert_eq!(pair.error, image.error);
            }
        }
    }

    #[test]
    fn test_interrupt_mid_run_resumes_to_same_scores() {
        let sizes = [(20, 20); 8];
        let setup = |dir: &Path| {
            let mut config = config(dir, 2);
            config.compare.rotate = false;
            config.compare.strategy = Strategy::Sweep;
            config.compare.batch = false;
            config.workers.max_in_flight = 1;
            config
        };

        let reference_dir = tempfile::tempdir().unwrap();
        let reference_config = setup(reference_dir.path());
        let reference_db = prepare(reference_dir.path(), &reference_config, &sizes, &[]);
        compare(&reference_db, &reference_config, Arc::new(ImageKernel));
        let reference = scores(&reference_db);
        assert_eq!(reference.len(), 28);

        let dir = tempfile::tempdir().unwrap();
        let config = setup(dir.path());
        let db = prepare(dir.path(), &config, &sizes, &[]);
        let shutdown = Shutdown::new();
        let kernel = Arc::new(StoppingKernel {
            shutdown: shutdown.clone(),
            after: 3,
            diffs: AtomicUsize::new(0),
        });
        let stopped = Comparer::new(&db, &config, kernel, shutdown)
            .run(&mut NoProgress)
            .unwrap();

        assert!(stopped.interrupted);
        assert!(stopped.compared >= 3 && stopped.compared < 28);
        // Every submitted job was answered before the run returned.
        assert_eq!(stopped.jobs, stopped.compared);
        assert_eq!(db.count_pairs_with_status(PairStatus::Processing).unwrap(), 0);

        let resumed = compare(&db, &config, Arc::new(ImageKernel));
        assert!(!resumed.interrupted);
        assert_eq!(stopped.compared + resumed.compared, 28);
        assert_eq!(scores(&db), reference);
    }

    #[test]
    fn test_in_flight_limit_holds_within_a_block() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 2);
        config.compare.rotate = false;
        config.compare.strategy = Strategy::Blocked;
        config.compare.batch = false;
        config.compare.block_columns = 10;
        config.workers.max_in_flight = 1;
        let db = prepare(dir.path(), &config, &[(20, 20); 12], &[]);

        let kernel = Arc::new(CountingKernel::default());
        let summary = compare(&db, &config, kernel.clone());
        assert_eq!(summary.compared, 66);
        assert_eq!(summary.jobs, 66);
        assert!(summary.peak_in_flight >= 1);
        assert!(summary.peak_in_flight <= config.workers.in_flight_limit());
        assert_eq!(db.count_pairs_with_status(PairStatus::Processing).unwrap(), 0);
    }
}
