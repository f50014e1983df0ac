//! Decomposition of the comparison matrix into scheduling blocks.
//!
//! Rows are claimed in bands, lowest key first, from a single watermark, so
//! no row is ever owned twice. Each of the `slots` worker slots owns one row
//! of the current band; a band is streamed as column windows of at most
//! `width` keys, one block per window. When a band runs out of windows the
//! watermark advances and every slot takes the next row. A slot that finds
//! no row left is retired, which the coordinator answers with one close
//! sentinel; over a whole run exactly `slots` slots are retired.

use std::ops::Range;

/// A rectangular piece of the matrix. In the triangular layout only cells
/// with `key_b > key_a` belong to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub id: i64,
    pub rows: Range<i64>,
    pub cols: Range<i64>,
}

impl Block {
    /// Every (key_a, key_b) cell the block covers.
    pub fn pairs(&self, cross: bool) -> impl Iterator<Item = (i64, i64)> + '_ {
        self.rows.clone().flat_map(move |a| {
            let start = if cross {
                self.cols.start
            } else {
                self.cols.start.max(a + 1)
            };
            (start..self.cols.end).map(move |b| (a, b))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanStep {
    Block(Block),
    /// This many slots found no row left to own.
    SlotsRetired(usize),
}

/// Number of pairs row `key_a` takes part in.
pub fn expected_pairs(key_a: i64, rows: i64, cols: i64, cross: bool) -> i64 {
    if cross {
        cols
    } else {
        (rows - key_a - 1).max(0)
    }
}

#[derive(Debug)]
pub struct BlockPlanner {
    rows: i64,
    cols: i64,
    cross: bool,
    slots: usize,
    band_height: usize,
    width: i64,
    /// Lowest row not yet claimed by any slot.
    watermark: i64,
    band: Option<Range<i64>>,
    next_col: i64,
    next_id: i64,
    retired: usize,
}

impl BlockPlanner {
    /// `band_height` rows are claimed at a time (one per slot when blocking,
    /// one when sweeping). Rows below `start_row` are already finished.
    pub fn new(
        rows: i64,
        cols: i64,
        cross: bool,
        slots: usize,
        band_height: usize,
        width: usize,
        start_row: i64,
    ) -> Self {
        Self {
            rows,
            cols,
            cross,
            slots: slots.max(1),
            band_height: band_height.clamp(1, slots.max(1)),
            width: width.max(1) as i64,
            watermark: start_row.clamp(0, rows.max(0)),
            band: None,
            next_col: 0,
            next_id: 0,
            retired: 0,
        }
    }

    /// Number blocks from `id` on, keeping ids unique across runs.
    pub fn with_first_id(mut self, id: i64) -> Self {
        self.next_id = id;
        self
    }

    pub fn is_exhausted(&self) -> bool {
        self.retired == self.slots
    }

    pub fn watermark(&self) -> i64 {
        self.watermark
    }

    fn column_start(&self, band: &Range<i64>) -> i64 {
        if self.cross {
            0
        } else {
            band.start + 1
        }
    }

    fn retire(&mut self, count: usize) -> Option<PlanStep> {
        let count = count.min(self.slots - self.retired);
        if count == 0 {
            return None;
        }
        self.retired += count;
        Some(PlanStep::SlotsRetired(count))
    }

    /// Claim the next band. Slots beyond the rows left are retired.
    fn claim_band(&mut self) -> Option<PlanStep> {
        let left = (self.rows - self.watermark).max(0) as usize;
        let height = left.min(self.band_height);
        if height == 0 {
            return self.retire(self.slots);
        }

        let band = self.watermark..self.watermark + height as i64;
        self.watermark = band.end;
        self.next_col = self.column_start(&band);
        self.band = Some(band);

        // Surplus slots can never own a row again once the rows run out.
        if self.band_height == self.slots && height < self.slots {
            return self.retire(self.slots - height);
        }
        None
    }

    pub fn next_step(&mut self) -> Option<PlanStep> {
        loop {
            if self.is_exhausted() {
                return None;
            }

            let Some(band) = self.band.clone() else {
                if let Some(step) = self.claim_band() {
                    return Some(step);
                }
                continue;
            };

            if self.next_col >= self.cols {
                self.band = None;
                continue;
            }

            let cols = self.next_col..(self.next_col + self.width).min(self.cols);
            self.next_col = cols.end;
            let block = Block {
                id: self.next_id,
                rows: band,
                cols,
            };
            self.next_id += 1;
            return Some(PlanStep::Block(block));
        }
    }
}
