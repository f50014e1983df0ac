//! Cheap checks that settle a pair without running the diff kernel.

use crate::db::ImageRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Compare,
    /// B's upright hash equals one of A's rotation hashes.
    SameHash,
    /// Dimensions differ in both orientations.
    AspectMismatch,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Precheck {
    pub match_by_hash: bool,
    pub match_by_aspect: bool,
    pub rotate: bool,
}

impl Precheck {
    pub fn is_enabled(&self) -> bool {
        self.match_by_hash || self.match_by_aspect
    }

    pub fn check(&self, a: &ImageRecord, b: &ImageRecord) -> Verdict {
        if self.match_by_hash && self.same_hash(a, b) {
            return Verdict::SameHash;
        }
        if self.match_by_aspect && !aspect_compatible(a, b) {
            return Verdict::AspectMismatch;
        }
        Verdict::Compare
    }

    fn same_hash(&self, a: &ImageRecord, b: &ImageRecord) -> bool {
        let Some(b0) = b.hashes[0] else {
            return false;
        };
        // Equal hashes share a bucket, so bucket keys compare directly.
        let candidates = if self.rotate { &a.hashes[..] } else { &a.hashes[..1] };
        candidates.iter().flatten().any(|&h| h == b0)
    }
}

/// Equal dimensions in either orientation. Unknown dimensions never
/// rule a pair out.
pub fn aspect_compatible(a: &ImageRecord, b: &ImageRecord) -> bool {
    match (a.px, a.py, b.px, b.py) {
        (Some(ax), Some(ay), Some(bx), Some(by)) => (ax, ay) == (bx, by) || (ax, ay) == (by, bx),
        _ => true,
    }
}
