// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    histogram::{LeafId, LeafPair, PairConstraint, PairHistogram},
    HashMap,
};

/// Per-pair distance histogram with a precomputed suffix-maximum over
/// frequencies, used to bound the best attainable score for a pair whose
/// final distance is still open.
#[derive(Clone, Debug)]
pub struct PairBound {
    pub pair: LeafPair,

    /// Distances, ascending
    dists: Vec<u32>,

    /// `suffix_max_freq[i]` = max frequency among `dists[i..]`
    suffix_max_freq: Vec<f64>,
}

impl PairBound {
    /// Returns the maximum frequency among histogram entries with
    /// `dist >= min_dist`, or `None` if no such entry exists.
    #[must_use]
    pub fn max_freq_at_or_beyond(&self, min_dist: u32) -> Option<f64> {
        let idx = self.dists.partition_point(|&d| d < min_dist);
        self.suffix_max_freq.get(idx).copied()
    }

    #[must_use]
    pub fn max_freq(&self) -> f64 {
        // Histograms are never empty (validated on construction)
        self.suffix_max_freq.first().copied().unwrap_or(0.0)
    }
}

/// Immutable per-run context, constructed once from the input histograms and
/// shared by reference with every assembly.
///
/// Holds the constraint table, the leaf name encoding (1-based ranks in
/// sorted order) and the verification histograms. Assemblies carry only
/// their mutable live subset of constraint indices.
pub struct Context {
    leaf_names: Vec<Box<str>>,

    constraints: Vec<PairConstraint>,

    histograms: HashMap<LeafPair, HashMap<u32, f64>>,

    /// One entry per input pair, sorted by pair, for deterministic
    /// best-case scans
    bounds: Vec<PairBound>,

    /// Minimum per-distance frequency for verifying derived distances
    pub absolute_freq_cutoff: f64,

    /// Internal nodes a finished topology needs (`leaf count - 1`)
    pub total_nodes_to_build: u32,

    /// Upper bound on any final score: every pair realized at its
    /// most frequent distance
    pub best_possible: f64,
}

impl Context {
    /// Builds the context from the input histograms.
    ///
    /// The constraint table takes, per pair, the shortest prefix of the
    /// frequency-sorted histogram whose cumulative frequency stays below
    /// `constraint_freq_cutoff`, then orders all entries by
    /// `(dist ascending, freq descending)`.
    ///
    /// # Errors
    ///
    /// Fails fast on malformed input (empty or degenerate pairs, non-positive
    /// distances are unrepresentable, frequencies outside `(0, 1]`,
    /// duplicate pairs).
    pub fn from_histograms(
        records: &[PairHistogram],
        constraint_freq_cutoff: f64,
        absolute_freq_cutoff: f64,
    ) -> crate::Result<Self> {
        use crate::Error::MalformedHistogram;

        if !(constraint_freq_cutoff > 0.0 && constraint_freq_cutoff <= 1.0) {
            return Err(MalformedHistogram("constraint_freq_cutoff outside (0, 1]"));
        }

        let mut leaf_names: Vec<Box<str>> = vec![];

        for record in records {
            if record.a.is_empty() || record.b.is_empty() {
                return Err(MalformedHistogram("empty leaf name"));
            }
            if record.a == record.b {
                return Err(MalformedHistogram("pair of identical leaves"));
            }
            if record.distances.is_empty() {
                return Err(MalformedHistogram("empty distance histogram"));
            }
            for &(dist, freq) in &record.distances {
                if dist == 0 {
                    return Err(MalformedHistogram("zero distance"));
                }
                if !(freq > 0.0 && freq <= 1.0) {
                    return Err(MalformedHistogram("frequency outside (0, 1]"));
                }
            }
            for name in [&record.a, &record.b] {
                if !leaf_names.iter().any(|n| **n == **name) {
                    leaf_names.push(name.as_str().into());
                }
            }
        }

        leaf_names.sort();

        let rank_of = |name: &str| -> LeafId {
            #[expect(
                clippy::expect_used,
                reason = "every record name was just inserted into leaf_names"
            )]
            let idx = leaf_names
                .binary_search_by(|n| (**n).cmp(name))
                .expect("leaf name should be known");

            #[expect(clippy::cast_possible_truncation, reason = "leaf counts are small")]
            let rank = idx as u32 + 1;

            LeafId::from_rank(rank)
        };

        let mut constraints: Vec<PairConstraint> = vec![];
        let mut histograms: HashMap<LeafPair, HashMap<u32, f64>> = HashMap::default();
        let mut bounds: Vec<PairBound> = vec![];
        let mut best_possible = 0.0;

        for record in records {
            let pair = LeafPair::new(rank_of(&record.a), rank_of(&record.b));

            if histograms.contains_key(&pair) {
                return Err(MalformedHistogram("duplicate leaf pair"));
            }

            // Most frequent distances first; ties broken by distance so the
            // constraint table does not depend on input entry order
            let mut by_freq = record.distances.clone();
            by_freq.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

            let mut cumulative = 0.0;
            for &(dist, freq) in &by_freq {
                if cumulative < constraint_freq_cutoff {
                    constraints.push(PairConstraint {
                        leaves: pair,
                        dist,
                        freq,
                    });
                }
                cumulative += freq;
            }

            let mut by_dist = record.distances.clone();
            by_dist.sort_by_key(|&(dist, _)| dist);

            if by_dist.windows(2).any(|w| matches!(w, [a, b] if a.0 == b.0)) {
                return Err(MalformedHistogram("duplicate distance in histogram"));
            }

            let dists = by_dist.iter().map(|&(d, _)| d).collect::<Vec<_>>();
            let mut suffix_max_freq = by_dist.iter().map(|&(_, f)| f).collect::<Vec<_>>();
            for i in (0..suffix_max_freq.len().saturating_sub(1)).rev() {
                #[expect(clippy::indexing_slicing, reason = "i + 1 < len by construction")]
                if suffix_max_freq[i + 1] > suffix_max_freq[i] {
                    suffix_max_freq[i] = suffix_max_freq[i + 1];
                }
            }

            let bound = PairBound {
                pair,
                dists,
                suffix_max_freq,
            };
            best_possible += bound.max_freq().ln();
            bounds.push(bound);

            histograms.insert(pair, by_dist.into_iter().collect());
        }

        bounds.sort_by_key(|b| b.pair);
        constraints.sort_by(|a, b| {
            a.dist
                .cmp(&b.dist)
                .then(b.freq.total_cmp(&a.freq))
                .then(a.leaves.cmp(&b.leaves))
        });

        #[expect(clippy::cast_possible_truncation, reason = "leaf counts are small")]
        let total_nodes_to_build = (leaf_names.len() as u32).saturating_sub(1);

        Ok(Self {
            leaf_names,
            constraints,
            histograms,
            bounds,
            absolute_freq_cutoff,
            total_nodes_to_build,
            best_possible,
        })
    }

    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.leaf_names.len()
    }

    /// All leaves, in rank order.
    pub fn leaves(&self) -> impl Iterator<Item = LeafId> + '_ {
        #[expect(clippy::cast_possible_truncation, reason = "leaf counts are small")]
        let count = self.leaf_names.len() as u32;

        (1..=count).map(LeafId::from_rank)
    }

    #[must_use]
    pub fn name_of(&self, leaf: LeafId) -> &str {
        self.leaf_names
            .get(leaf.index())
            .map_or("?", |n| n.as_ref())
    }

    #[must_use]
    pub fn rank_of(&self, name: &str) -> Option<LeafId> {
        let idx = self.leaf_names.binary_search_by(|n| (**n).cmp(name)).ok()?;

        #[expect(clippy::cast_possible_truncation, reason = "leaf counts are small")]
        let rank = idx as u32 + 1;

        Some(LeafId::from_rank(rank))
    }

    #[must_use]
    pub fn constraint(&self, idx: u32) -> &PairConstraint {
        #[expect(
            clippy::expect_used,
            reason = "constraint indices are created from this table and never invented"
        )]
        let constraint = self
            .constraints
            .get(idx as usize)
            .expect("constraint index should exist");

        constraint
    }

    #[must_use]
    pub fn constraint_count(&self) -> usize {
        self.constraints.len()
    }

    /// Frequency of `dist` for `pair`, `0.0` when unobserved.
    #[must_use]
    pub fn frequency(&self, pair: LeafPair, dist: u32) -> f64 {
        self.histograms
            .get(&pair)
            .and_then(|h| h.get(&dist))
            .copied()
            .unwrap_or(0.0)
    }

    #[must_use]
    pub fn pair_bounds(&self) -> &[PairBound] {
        &self.bounds
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("leaves", &self.leaf_names.len())
            .field("constraints", &self.constraints.len())
            .field("total_nodes_to_build", &self.total_nodes_to_build)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(a: &str, b: &str, distances: &[(u32, f64)]) -> PairHistogram {
        PairHistogram::new(a, b, distances.to_vec())
    }

    #[test]
    fn constraint_table_prefix_cutoff() -> crate::Result<()> {
        // 0.5 + 0.3 >= 0.7, so only the first two entries survive:
        // the prefix sums before each entry are 0.0 and 0.5
        let ctx = Context::from_histograms(
            &[record("a", "b", &[(1, 0.5), (2, 0.3), (3, 0.2)])],
            0.7,
            0.01,
        )?;

        assert_eq!(2, ctx.constraint_count());
        assert_eq!(1, ctx.constraint(0).dist);
        assert_eq!(2, ctx.constraint(1).dist);

        Ok(())
    }

    #[test]
    fn constraint_table_ordering() -> crate::Result<()> {
        let ctx = Context::from_histograms(
            &[
                record("a", "b", &[(2, 0.6), (1, 0.4)]),
                record("b", "c", &[(1, 0.9), (2, 0.1)]),
            ],
            1.0,
            0.01,
        )?;

        // (dist asc, freq desc)
        let table: Vec<(u32, f64)> = (0..ctx.constraint_count() as u32)
            .map(|i| (ctx.constraint(i).dist, ctx.constraint(i).freq))
            .collect();

        assert_eq!(vec![(1, 0.9), (1, 0.4), (2, 0.6), (2, 0.1)], table);

        Ok(())
    }

    #[test]
    fn leaf_ranks_sorted() -> crate::Result<()> {
        let ctx = Context::from_histograms(
            &[
                record("zebra", "ant", &[(1, 1.0)]),
                record("ant", "mole", &[(1, 1.0)]),
            ],
            1.0,
            0.01,
        )?;

        assert_eq!(3, ctx.leaf_count());
        assert_eq!("ant", ctx.name_of(LeafId::from_rank(1)));
        assert_eq!("mole", ctx.name_of(LeafId::from_rank(2)));
        assert_eq!("zebra", ctx.name_of(LeafId::from_rank(3)));
        assert_eq!(Some(LeafId::from_rank(3)), ctx.rank_of("zebra"));
        assert_eq!(None, ctx.rank_of("worm"));

        Ok(())
    }

    #[test]
    fn suffix_max_bound() -> crate::Result<()> {
        let ctx = Context::from_histograms(
            &[record("a", "b", &[(1, 0.2), (2, 0.5), (4, 0.3)])],
            1.0,
            0.01,
        )?;

        let bound = ctx.pair_bounds().first().expect("pair should be bounded");
        assert_eq!(Some(0.5), bound.max_freq_at_or_beyond(1));
        assert_eq!(Some(0.5), bound.max_freq_at_or_beyond(2));
        assert_eq!(Some(0.3), bound.max_freq_at_or_beyond(3));
        assert_eq!(Some(0.3), bound.max_freq_at_or_beyond(4));
        assert_eq!(None, bound.max_freq_at_or_beyond(5));

        Ok(())
    }

    #[test]
    fn rejects_malformed() {
        assert!(Context::from_histograms(&[record("a", "a", &[(1, 1.0)])], 0.9, 0.01).is_err());
        assert!(Context::from_histograms(&[record("a", "b", &[])], 0.9, 0.01).is_err());
        assert!(Context::from_histograms(&[record("a", "b", &[(0, 1.0)])], 0.9, 0.01).is_err());
        assert!(Context::from_histograms(&[record("a", "b", &[(1, 1.5)])], 0.9, 0.01).is_err());
        assert!(Context::from_histograms(
            &[
                record("a", "b", &[(1, 1.0)]),
                record("b", "a", &[(2, 1.0)]),
            ],
            0.9,
            0.01,
        )
        .is_err());
    }
}
