// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod compress;
mod extension;

pub use compress::CompressedAssembly;
pub use extension::Extended;

use crate::{
    clade::{forest_repr, Clade},
    context::Context,
    histogram::{LeafId, LeafPair},
    HashMap, HashSet,
};
use std::sync::Arc;

/// Upper bound on the score of any completion of a partial assembly
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Bound {
    /// Best attainable final score
    Reachable(f64),

    /// No completion can realize every remaining pair
    Unreachable,
}

impl Bound {
    #[must_use]
    pub fn score(self) -> Option<f64> {
        match self {
            Self::Reachable(score) => Some(score),
            Self::Unreachable => None,
        }
    }

    /// Whether this bound already falls short of `min`.
    #[must_use]
    pub fn below(self, min: f64) -> bool {
        match self {
            Self::Reachable(score) => score < min,
            Self::Unreachable => true,
        }
    }
}

/// A partial tree state: free-standing built clades plus the leaves not yet
/// placed, with the live subset of the constraint table and the accumulated
/// log-frequency score of all verified pairs.
///
/// Derived state (distances to root, accounted pairs, best case) is kept in
/// explicit memoized fields and invalidated when the assembly is extended.
#[derive(Clone)]
pub struct Assembly {
    ctx: Arc<Context>,

    /// Clade roots not yet connected to each other
    built_clades: Vec<Clade>,

    /// Leaves not in any built clade
    free_leaves: HashSet<LeafId>,

    /// Live constraint-table indices: neither consumed nor proven
    /// inconsistent yet
    constraint_idx: Vec<u32>,

    /// Cumulative log-frequency of verified pairs
    score: f64,

    distances_to_root: HashMap<LeafId, u32>,

    pairs_accounted_for: HashSet<LeafPair>,

    cached_best_case: Option<Bound>,
}

impl Assembly {
    /// The zeroth assembly: nothing built, every leaf free, every
    /// constraint live.
    #[must_use]
    pub fn seed(ctx: &Arc<Context>) -> Self {
        #[expect(clippy::cast_possible_truncation, reason = "table sizes are small")]
        let constraint_idx = (0..ctx.constraint_count() as u32).collect();

        Self {
            ctx: ctx.clone(),
            built_clades: vec![],
            free_leaves: ctx.leaves().collect(),
            constraint_idx,
            score: 0.0,
            distances_to_root: HashMap::default(),
            pairs_accounted_for: HashSet::default(),
            cached_best_case: None,
        }
    }

    #[must_use]
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    #[must_use]
    pub fn score(&self) -> f64 {
        self.score
    }

    #[must_use]
    pub fn built_clades(&self) -> &[Clade] {
        &self.built_clades
    }

    #[must_use]
    pub fn free_leaves(&self) -> &HashSet<LeafId> {
        &self.free_leaves
    }

    #[must_use]
    pub fn constraint_idx(&self) -> &[u32] {
        &self.constraint_idx
    }

    #[must_use]
    pub fn pairs_accounted_for(&self) -> &HashSet<LeafPair> {
        &self.pairs_accounted_for
    }

    #[must_use]
    pub fn distances_to_root(&self) -> &HashMap<LeafId, u32> {
        &self.distances_to_root
    }

    /// A single connected tree covering every leaf.
    #[must_use]
    pub fn complete(&self) -> bool {
        self.built_clades.len() == 1 && self.free_leaves.is_empty()
    }

    #[must_use]
    pub fn nodes_left_to_build(&self) -> u32 {
        #[expect(clippy::cast_possible_truncation, reason = "leaf counts are small")]
        let parts = (self.built_clades.len() + self.free_leaves.len()) as u32;
        parts.saturating_sub(1)
    }

    #[must_use]
    pub fn built_nodes_count(&self) -> u32 {
        self.ctx
            .total_nodes_to_build
            .saturating_sub(self.nodes_left_to_build())
    }

    /// Canonical representation of the current forest.
    #[must_use]
    pub fn forest_repr(&self) -> String {
        forest_repr(&self.built_clades)
    }

    /// Newick rendering of a complete assembly's single tree.
    #[must_use]
    pub fn newick(&self) -> Option<String> {
        if self.complete() {
            self.built_clades.first().map(|c| c.newick(&self.ctx))
        } else {
            None
        }
    }

    /// Upper bound on the score of any completion, memoized until the next
    /// extension.
    pub fn best_case(&mut self) -> Bound {
        if let Some(bound) = self.cached_best_case {
            return bound;
        }

        let bound = calculate_best_case(
            &self.ctx,
            &self.pairs_accounted_for,
            &self.distances_to_root,
            self.score,
        );
        self.cached_best_case = Some(bound);
        bound
    }

    /// Frontier ordering key; higher is better.
    ///
    /// Early on (under 40% of nodes built) favors diversity by scoring
    /// against the global optimum; later rewards assemblies that account
    /// for many pairs per built node.
    pub fn sort_key(&mut self) -> f64 {
        let total = f64::from(self.ctx.total_nodes_to_build.max(1));
        let built = f64::from(self.built_nodes_count());

        if built / total < 0.4 {
            #[expect(clippy::cast_precision_loss, reason = "pair counts are small")]
            let accounted = self.pairs_accounted_for.len().max(1) as f64;
            self.ctx.best_possible + self.score / accounted
        } else {
            match self.best_case() {
                Bound::Reachable(score) => score / built.max(1.0),
                Bound::Unreachable => f64::NEG_INFINITY,
            }
        }
    }

    pub(crate) fn invalidate(&mut self) {
        self.cached_best_case = None;
    }

    pub(crate) fn set_cached_best_case(&mut self, bound: Bound) {
        self.cached_best_case = Some(bound);
    }

    /// Recomputes the live constraint subset from the built clades, used
    /// after decoding a compressed assembly.
    ///
    /// Drops entries whose pair is contained in a single built clade, and
    /// sibling (`dist == 1`) entries involving any accounted-for leaf.
    pub(crate) fn rebuild_constraint_idx(&mut self) {
        let accounted: HashSet<LeafId> = self
            .pairs_accounted_for
            .iter()
            .flat_map(|p| {
                let (a, b) = p.leaves();
                [a, b]
            })
            .collect();

        #[expect(clippy::cast_possible_truncation, reason = "table sizes are small")]
        let live = (0..self.ctx.constraint_count() as u32).filter(|&i| {
            let c = self.ctx.constraint(i);
            let (a, b) = c.leaves.leaves();

            let intra_clade = self
                .built_clades
                .iter()
                .any(|clade| clade.contains(a) && clade.contains(b));
            if intra_clade {
                return false;
            }

            !(c.dist == 1 && (accounted.contains(&a) || accounted.contains(&b)))
        });

        self.constraint_idx = live.collect();
    }

    /// Every leaf is either free or in exactly one built clade.
    #[must_use]
    pub fn leaf_partition_holds(&self) -> bool {
        let mut seen: HashSet<LeafId> = self.free_leaves.clone();

        for clade in &self.built_clades {
            for &leaf in clade.leaves() {
                if !seen.insert(leaf) {
                    return false;
                }
            }
        }

        seen.len() == self.ctx.leaf_count()
    }
}

impl std::fmt::Debug for Assembly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Assembly")
            .field("clades", &self.built_clades.len())
            .field("free_leaves", &self.free_leaves.len())
            .field("score", &self.score)
            .field("nodes_left", &self.nodes_left_to_build())
            .finish()
    }
}

/// Best attainable final score given the pairs already accounted for:
/// every open pair is realized at the most frequent distance still
/// reachable, which is at least `dtr(a) + dtr(b) + 1` (leaves outside any
/// clade contribute 0).
pub(crate) fn calculate_best_case(
    ctx: &Context,
    pairs_accounted_for: &HashSet<LeafPair>,
    distances_to_root: &HashMap<LeafId, u32>,
    base_score: f64,
) -> Bound {
    let mut total = base_score;

    for bound in ctx.pair_bounds() {
        if pairs_accounted_for.contains(&bound.pair) {
            continue;
        }

        let (a, b) = bound.pair.leaves();
        let min_dist = distances_to_root.get(&a).copied().unwrap_or(0)
            + distances_to_root.get(&b).copied().unwrap_or(0)
            + 1;

        match bound.max_freq_at_or_beyond(min_dist) {
            Some(freq) => total += freq.ln(),
            None => return Bound::Unreachable,
        }
    }

    Bound::Reachable(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::histogram::PairHistogram;

    fn ctx(records: &[PairHistogram]) -> Arc<Context> {
        Arc::new(Context::from_histograms(records, 1.0, 0.01).expect("histograms should be valid"))
    }

    fn three_leaves() -> Arc<Context> {
        ctx(&[
            PairHistogram::new("a", "b", vec![(1, 0.9), (2, 0.1)]),
            PairHistogram::new("b", "c", vec![(1, 0.1), (2, 0.9)]),
            PairHistogram::new("a", "c", vec![(1, 0.1), (2, 0.9)]),
        ])
    }

    #[test]
    fn seed_state() {
        let ctx = three_leaves();
        let seed = Assembly::seed(&ctx);

        assert!(!seed.complete());
        assert_eq!(0.0, seed.score());
        assert_eq!(2, seed.nodes_left_to_build());
        assert_eq!(0, seed.built_nodes_count());
        assert_eq!(3, seed.free_leaves().len());
        assert_eq!(ctx.constraint_count(), seed.constraint_idx().len());
        assert!(seed.leaf_partition_holds());
        assert_eq!("[]", seed.forest_repr());
    }

    #[test]
    fn seed_best_case_is_best_possible() {
        let ctx = three_leaves();
        let mut seed = Assembly::seed(&ctx);

        // Nothing is built, so nothing constrains any pair: the bound is
        // every pair at its best frequency
        let expected = 0.9f64.ln() * 3.0;
        let bound = seed.best_case().score().expect("should be reachable");
        assert!((bound - expected).abs() < 1e-12);
        assert!((ctx.best_possible - expected).abs() < 1e-12);
    }

    #[test]
    fn unreachable_when_distances_conflict() {
        // b and c can only ever be at distance 1, but once both are at
        // depth 1 in different clades their joint distance is >= 3
        let ctx = ctx(&[
            PairHistogram::new("a", "b", vec![(1, 0.9)]),
            PairHistogram::new("c", "d", vec![(1, 0.9)]),
            PairHistogram::new("b", "c", vec![(1, 1.0)]),
        ]);

        let mut pairs = HashSet::default();
        let mut dtr = HashMap::default();
        let ab = LeafPair::new(LeafId::from_rank(1), LeafId::from_rank(2));
        let cd = LeafPair::new(LeafId::from_rank(3), LeafId::from_rank(4));
        pairs.insert(ab);
        pairs.insert(cd);
        for rank in 1..=4 {
            dtr.insert(LeafId::from_rank(rank), 1);
        }

        assert_eq!(
            Bound::Unreachable,
            calculate_best_case(&ctx, &pairs, &dtr, 0.0),
        );
    }
}
