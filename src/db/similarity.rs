//! Duplicate clusters built from matching pairs.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use super::{Database, Side};
use crate::error::Result;

#[derive(Debug, Clone, Serialize)]
pub struct GroupMember {
    pub side: Side,
    pub key: i64,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateGroup {
    pub id: usize,
    pub members: Vec<GroupMember>,
    /// Lowest score of any pair inside the group.
    pub best_dif: f64,
    /// Number of pairs joined by an identical rotation hash.
    pub hash_matches: usize,
}

/// Disjoint sets over dense node indices.
struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new() -> Self {
        Self {
            parent: Vec::new(),
            rank: Vec::new(),
        }
    }

    fn add(&mut self) -> usize {
        let id = self.parent.len();
        self.parent.push(id);
        self.rank.push(0);
        id
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

impl Database {
    /// Join every matching pair (score at or below `threshold`, or identical
    /// hash) into connected groups, largest first.
    pub fn build_clusters(&self, threshold: f64) -> Result<Vec<DuplicateGroup>> {
        let side_b = if self.is_cross_store()? { Side::B } else { Side::A };

        let mut sets = UnionFind::new();
        let mut nodes: HashMap<(Side, i64), usize> = HashMap::new();
        let mut members: Vec<GroupMember> = Vec::new();
        let mut edges: Vec<(usize, f64, bool)> = Vec::new();

        for pair in self.iterate_pairs_below(threshold, None) {
            let pair = pair?;
            let mut node = |side: Side, key: i64, path: &PathBuf| {
                *nodes.entry((side, key)).or_insert_with(|| {
                    members.push(GroupMember {
                        side,
                        key,
                        path: path.clone(),
                    });
                    sets.add()
                })
            };
            let a = node(Side::A, pair.key_a, &pair.path_a);
            let b = node(side_b, pair.key_b, &pair.path_b);
            sets.union(a, b);
            edges.push((a, pair.dif, pair.by_hash));
        }

        let mut grouped: BTreeMap<usize, DuplicateGroup> = BTreeMap::new();
        for (index, member) in members.into_iter().enumerate() {
            let root = sets.find(index);
            grouped
                .entry(root)
                .or_insert_with(|| DuplicateGroup {
                    id: 0,
                    members: Vec::new(),
                    best_dif: f64::MAX,
                    hash_matches: 0,
                })
                .members
                .push(member);
        }
        for (node, dif, by_hash) in edges {
            let root = sets.find(node);
            if let Some(group) = grouped.get_mut(&root) {
                group.best_dif = group.best_dif.min(dif);
                if by_hash {
                    group.hash_matches += 1;
                }
            }
        }

        let mut groups: Vec<DuplicateGroup> = grouped.into_values().collect();
        groups.sort_by(|a, b| {
            b.members
                .len()
                .cmp(&a.members.len())
                .then_with(|| a.best_dif.total_cmp(&b.best_dif))
        });
        for (id, group) in groups.iter_mut().enumerate() {
            group.id = id + 1;
            group.members.sort_by(|a, b| (a.side, a.key).cmp(&(b.side, b.key)));
        }
        Ok(groups)
    }
}
