//! Comparison jobs and the worker that scores them.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

use super::cache::ImageLoader;
use crate::db::{PendingPair, Side};
use crate::kernel::diff::min_rotated_diff;
use crate::kernel::plot::MAX_FILENAME_ATTEMPTS;
use crate::kernel::{reserve_filename, Kernel, PixelBuffer};
use crate::tasks::{Job, Worker};

/// An image as handed to a worker: already decoded by the coordinator, or a
/// file the worker decodes itself.
#[derive(Debug, Clone)]
pub enum Operand {
    Cached(Arc<PixelBuffer>),
    Path {
        side: Side,
        key: i64,
        path: PathBuf,
        /// The store's recorded thumbnail, if any.
        thumbnail: Option<PathBuf>,
    },
}

#[derive(Debug, Clone)]
pub struct CompareItem {
    pub pair: PendingPair,
    pub b: Operand,
}

/// One row image against one or more column images. Item jobs carry a
/// single column.
#[derive(Debug)]
pub struct CompareJob {
    pub block_id: i64,
    pub a: Operand,
    pub items: Vec<CompareItem>,
}

impl Job for CompareJob {
    type Ticket = (i64, Vec<PendingPair>);

    fn ticket(&self) -> Self::Ticket {
        (self.block_id, self.items.iter().map(|i| i.pair).collect())
    }
}

#[derive(Debug)]
pub struct PairOutcome {
    pub block_id: i64,
    pub pair: PendingPair,
    pub result: std::result::Result<f64, String>,
    pub plot: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct PlotSettings {
    pub dir: PathBuf,
    pub threshold: f64,
}

#[derive(Debug, Clone)]
pub struct CompareSettings {
    pub rotate: bool,
    /// Set only for item-level dispatch.
    pub plot: Option<PlotSettings>,
}

/// Last decoded operand, reused when the next job names the same image.
type Memo = Option<((Side, i64), Arc<PixelBuffer>)>;

pub struct CompareWorker<K: Kernel> {
    loader: ImageLoader<K>,
    settings: CompareSettings,
    memo_a: Memo,
    memo_b: Memo,
}

impl<K: Kernel> CompareWorker<K> {
    pub fn new(loader: ImageLoader<K>, settings: CompareSettings) -> Self {
        Self {
            loader,
            settings,
            memo_a: None,
            memo_b: None,
        }
    }

    fn resolve(
        loader: &ImageLoader<K>,
        memo: &mut Memo,
        operand: &Operand,
    ) -> std::result::Result<Arc<PixelBuffer>, String> {
        match operand {
            Operand::Cached(buffer) => Ok(buffer.clone()),
            Operand::Path {
                side,
                key,
                path,
                thumbnail,
            } => {
                if let Some((id, buffer)) = memo {
                    if *id == (*side, *key) {
                        return Ok(buffer.clone());
                    }
                }
                let buffer = Arc::new(
                    loader
                        .load(path, thumbnail.as_deref())
                        .map_err(|e| e.to_string())?,
                );
                *memo = Some(((*side, *key), buffer.clone()));
                Ok(buffer)
            }
        }
    }

    fn score(&self, a: &PixelBuffer, b: &PixelBuffer) -> std::result::Result<f64, String> {
        let kernel = self.loader.kernel();
        let score = if self.settings.rotate {
            min_rotated_diff(kernel, a, b)
        } else {
            kernel.pixel_diff(a, b)
        };
        score.map_err(|e| e.to_string())
    }

    fn plot(&self, pair: &PendingPair, a: &PixelBuffer, b: &PixelBuffer, score: f64) -> Option<PathBuf> {
        let settings = self.settings.plot.as_ref()?;
        if score > settings.threshold {
            return None;
        }
        let stem = format!("{}_{}", pair.key_a, pair.key_b);
        let written = reserve_filename(&settings.dir, &stem, MAX_FILENAME_ATTEMPTS).and_then(|path| {
            self.loader.kernel().make_diff_plot(a, b, score, &path)?;
            Ok(path)
        });
        match written {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(key_a = pair.key_a, key_b = pair.key_b, error = %e, "Could not write diff plot");
                None
            }
        }
    }
}

impl<K: Kernel + 'static> Worker for CompareWorker<K> {
    type Job = CompareJob;
    type Output = Vec<PairOutcome>;

    fn handle(&mut self, job: CompareJob) -> Vec<PairOutcome> {
        let a = Self::resolve(&self.loader, &mut self.memo_a, &job.a);

        let mut outcomes = Vec::with_capacity(job.items.len());
        for item in &job.items {
            let mut plot = None;
            // A row image that failed to load fails every pair of the job.
            let result = match &a {
                Err(message) => Err(message.clone()),
                Ok(a) => Self::resolve(&self.loader, &mut self.memo_b, &item.b).and_then(|b| {
                    let score = self.score(a, &b)?;
                    plot = self.plot(&item.pair, a, &b, score);
                    Ok(score)
                }),
            };
            outcomes.push(PairOutcome {
                block_id: job.block_id,
                pair: item.pair,
                result,
                plot,
            });
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::testing::{write_png, CountingKernel};
    use std::sync::atomic::Ordering;

    fn pair(key: i64, key_a: i64, key_b: i64) -> PendingPair {
        PendingPair { key, key_a, key_b }
    }

    fn path_operand(side: Side, key: i64, path: &std::path::Path) -> Operand {
        Operand::Path {
            side,
            key,
            path: path.to_path_buf(),
            thumbnail: None,
        }
    }

    #[test]
    fn test_memo_skips_repeated_decodes() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_png(dir.path(), "a.png", 12, 12, 10);
        let b = write_png(dir.path(), "b.png", 12, 12, 200);

        let kernel = Arc::new(CountingKernel::default());
        let loader = ImageLoader::new(kernel.clone(), 8, true, false);
        let mut worker = CompareWorker::new(loader, CompareSettings { rotate: false, plot: None });

        for key in 0..3 {
            let job = CompareJob {
                block_id: 0,
                a: path_operand(Side::A, 0, &a),
                items: vec![CompareItem {
                    pair: pair(key, 0, 1),
                    b: path_operand(Side::A, 1, &b),
                }],
            };
            let out = worker.handle(job);
            assert!(out[0].result.as_ref().unwrap() > &0.0);
        }
        assert_eq!(kernel.decodes.load(Ordering::SeqCst), 2);
        assert_eq!(kernel.diffs(), 3);
    }

    #[test]
    fn test_row_failure_fans_out() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("broken.png");
        std::fs::write(&broken, b"nope").unwrap();
        let b = write_png(dir.path(), "b.png", 12, 12, 200);

        let kernel = Arc::new(CountingKernel::default());
        let mut worker = CompareWorker::new(
            ImageLoader::new(kernel.clone(), 8, true, false),
            CompareSettings { rotate: true, plot: None },
        );
        let job = CompareJob {
            block_id: 3,
            a: path_operand(Side::A, 0, &broken),
            items: (1..4)
                .map(|k| CompareItem {
                    pair: pair(k, 0, k),
                    b: path_operand(Side::A, k, &b),
                })
                .collect(),
        };

        let out = worker.handle(job);
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|o| o.block_id == 3));
        assert!(out.iter().all(|o| o.result.as_ref().unwrap_err().contains("broken.png")));
        assert_eq!(kernel.diffs(), 0);
    }

    #[test]
    fn test_cached_rotation_and_plot() {
        let dir = tempfile::tempdir().unwrap();
        let a = PixelBuffer::from_fn(8, 8, |x, _| image::Rgb([(x * 30) as u8, 0, 0]));
        let b = image::imageops::rotate90(&a);

        let kernel = Arc::new(CountingKernel::default());
        let mut worker = CompareWorker::new(
            ImageLoader::new(kernel, 8, true, false),
            CompareSettings {
                rotate: true,
                plot: Some(PlotSettings {
                    dir: dir.path().join("plots"),
                    threshold: 1.0,
                }),
            },
        );
        let out = worker.handle(CompareJob {
            block_id: 0,
            a: Operand::Cached(Arc::new(a)),
            items: vec![CompareItem {
                pair: pair(7, 2, 5),
                b: Operand::Cached(Arc::new(b)),
            }],
        });

        assert_eq!(out[0].result, Ok(0.0));
        let plot = out[0].plot.as_ref().unwrap();
        assert!(plot.ends_with("2_5.png"));
        assert!(image::open(plot).is_ok());
    }
}
