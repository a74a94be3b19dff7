// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{calculate_best_case, Assembly, Bound};
use crate::{
    clade::{forest_repr, Arena, Clade},
    context::Context,
    encountered::Encountered,
    histogram::{LeafId, LeafPair, PairConstraint},
    HashMap, HashSet,
};

/// Outcome of expanding an assembly by one step
pub enum Extended {
    /// No extension survived the filters; the assembly is returned so the
    /// caller can unrecord its canonical form
    DeadEnd(Box<Assembly>),

    /// One child per surviving extension; the last child reuses the
    /// parent's allocation
    Children(Vec<Assembly>),
}

/// A `dist == 1` constraint turning two free leaves into a fresh clade.
/// Admitted unconditionally during the scan; sibling conflicts are cleaned
/// up when the extension is materialized.
struct NewPairCandidate {
    idx: u32,
    pair: LeafPair,
    freq: f64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Target {
    /// A free leaf joins a built clade under a new root
    Attach { clade_idx: usize, leaf: LeafId },

    /// Two built clades join under a new root; `hi > lo`
    Join { hi: usize, lo: usize },
}

/// An attach or join candidate accumulating evidence from the constraint
/// scan: distances it implies, constraints found to agree or disagree, and
/// the partial score of everything verified so far.
struct PairwiseCandidate {
    target: Target,

    /// Implied pair distances not yet matched by a constraint
    unverified: HashMap<LeafPair, u32>,

    /// Pair -> index of the constraint that confirmed it
    consistent: HashMap<LeafPair, u32>,

    /// Constraints contradicting an implied distance
    inconsistent: Vec<u32>,

    verified: HashSet<LeafPair>,

    score: f64,
}

impl PairwiseCandidate {
    fn join(a: &Clade, b: &Clade, hi: usize, lo: usize) -> Self {
        // Joining puts both roots under a new one: every cross pair ends up
        // at the sum of its depths plus one
        let mut unverified = HashMap::default();
        for (la, da) in a.leaf_depths() {
            for (lb, db) in b.leaf_depths() {
                unverified.insert(LeafPair::new(la, lb), da + db + 1);
            }
        }

        Self {
            target: Target::Join { hi, lo },
            unverified,
            consistent: HashMap::default(),
            inconsistent: vec![],
            verified: HashSet::default(),
            score: 0.0,
        }
    }

    fn attach(clade: &Clade, clade_idx: usize, leaf: LeafId) -> Self {
        // The new leaf sits directly under the new root, so its distance to
        // every leaf of the clade is that leaf's current depth plus one
        let mut unverified = HashMap::default();
        for (l, d) in clade.leaf_depths() {
            unverified.insert(LeafPair::new(l, leaf), d + 1);
        }

        Self {
            target: Target::Attach { clade_idx, leaf },
            unverified,
            consistent: HashMap::default(),
            inconsistent: vec![],
            verified: HashSet::default(),
            score: 0.0,
        }
    }

    fn check_pair(&mut self, constraint: &PairConstraint, idx: u32) {
        if self.consistent.contains_key(&constraint.leaves) {
            // Pair already confirmed at a different distance
            self.inconsistent.push(idx);
        } else if self.unverified.get(&constraint.leaves) == Some(&constraint.dist) {
            self.consistent.insert(constraint.leaves, idx);
            self.unverified.remove(&constraint.leaves);
            self.verified.insert(constraint.leaves);
            self.score += constraint.freq.ln();
        } else {
            // Keep the pair in unverified: a later constraint for the same
            // pair may still match the implied distance
            self.inconsistent.push(idx);
        }
    }

    /// Resolves every still-implied distance against the histograms.
    ///
    /// Returns `false` when the candidate must be discarded: an implied
    /// distance is unobserved or too rare, or no constraint at all agreed
    /// with the candidate (it would pass purely on newly-verified
    /// distances, which is too weak).
    fn verify_remaining(&mut self, ctx: &Context) -> bool {
        let mut pending: Vec<LeafPair> = self.unverified.keys().copied().collect();
        pending.sort_unstable();

        for pair in pending {
            let Some(&dist) = self.unverified.get(&pair) else {
                continue;
            };

            let freq = ctx.frequency(pair, dist);
            if freq < ctx.absolute_freq_cutoff {
                return false;
            }

            self.score += freq.ln();
            self.unverified.remove(&pair);
            self.verified.insert(pair);
        }

        !self.consistent.is_empty()
    }
}

enum Candidate {
    NewPair(NewPairCandidate),
    Pairwise(PairwiseCandidate),
}

impl Candidate {
    fn score_delta(&self) -> f64 {
        match self {
            Self::NewPair(np) => np.freq.ln(),
            Self::Pairwise(pw) => pw.score,
        }
    }
}

/// A candidate that passed every filter, with the state computed on the way
struct Survivor {
    candidate: Candidate,
    clade: Clade,
    score_delta: f64,
    bound: Bound,
    distances_to_root: HashMap<LeafId, u32>,
    pairs_accounted_for: HashSet<LeafPair>,
}

impl Assembly {
    /// Expands this assembly by every one-step extension that survives
    /// deduplication and the score bounds.
    ///
    /// Scans the live constraints for candidate moves (new pair, attach,
    /// join), verifies the distances each candidate implies, filters
    /// against the encountered set and `min_score`, and materializes the
    /// survivors. The last survivor is built in place on the parent; the
    /// result is invariant under that optimization.
    pub fn generate_extensions(
        self,
        arena: &mut Arena,
        encountered: &dyn Encountered,
        min_score: Option<f64>,
    ) -> Extended {
        let (new_pairs, mut joins, mut attachments) = self.find_extensions();

        joins.retain_mut(|c| c.verify_remaining(&self.ctx));
        attachments.retain_mut(|c| c.verify_remaining(&self.ctx));

        let mut survivors: Vec<Survivor> = vec![];
        let candidates = new_pairs
            .into_iter()
            .map(Candidate::NewPair)
            .chain(joins.into_iter().map(Candidate::Pairwise))
            .chain(attachments.into_iter().map(Candidate::Pairwise));

        for candidate in candidates {
            if let Some(survivor) = self.filter_candidate(candidate, arena, encountered, min_score)
            {
                survivors.push(survivor);
            }
        }

        if survivors.is_empty() {
            return Extended::DeadEnd(Box::new(self));
        }

        let mut children = Vec::with_capacity(survivors.len());
        while survivors.len() > 1 {
            if let Some(survivor) = survivors.pop() {
                children.push(build_candidate(self.clone(), survivor));
            }
        }
        if let Some(survivor) = survivors.pop() {
            children.push(build_candidate(self, survivor));
        }

        Extended::Children(children)
    }

    /// Scans the live constraints in table order and buckets them into
    /// candidate moves.
    fn find_extensions(
        &self,
    ) -> (
        Vec<NewPairCandidate>,
        Vec<PairwiseCandidate>,
        Vec<PairwiseCandidate>,
    ) {
        let mut clade_of: HashMap<LeafId, usize> = HashMap::default();
        for (i, clade) in self.built_clades.iter().enumerate() {
            for &leaf in clade.leaves() {
                clade_of.insert(leaf, i);
            }
        }

        let mut new_pairs: Vec<NewPairCandidate> = vec![];
        let mut joins: Vec<PairwiseCandidate> = vec![];
        let mut attachments: Vec<PairwiseCandidate> = vec![];

        for &i in &self.constraint_idx {
            let constraint = *self.ctx.constraint(i);
            let (a, b) = constraint.leaves.leaves();

            if constraint.dist == 1 {
                // Two-leaf subtrees are the only way to satisfy a sibling
                // constraint
                new_pairs.push(NewPairCandidate {
                    idx: i,
                    pair: constraint.leaves,
                    freq: constraint.freq,
                });
                continue;
            }

            match (clade_of.get(&a).copied(), clade_of.get(&b).copied()) {
                // Neither leaf placed yet: nothing to check against
                (None, None) => {}

                // Both in the same clade: distance already determined
                (Some(x), Some(y)) if x == y => {}

                (Some(x), Some(y)) => {
                    let (hi, lo) = if x > y { (x, y) } else { (y, x) };
                    let target = Target::Join { hi, lo };

                    let pos = joins.iter().position(|c| c.target == target);
                    let bucket = match pos {
                        Some(pos) => joins.get_mut(pos),
                        None => {
                            joins.push(PairwiseCandidate::join(
                                self.clade_at(hi),
                                self.clade_at(lo),
                                hi,
                                lo,
                            ));
                            joins.last_mut()
                        }
                    };
                    if let Some(bucket) = bucket {
                        bucket.check_pair(&constraint, i);
                    }
                }

                (Some(x), None) | (None, Some(x)) => {
                    let leaf = if clade_of.contains_key(&a) { b } else { a };
                    let target = Target::Attach { clade_idx: x, leaf };

                    let pos = attachments.iter().position(|c| c.target == target);
                    let bucket = match pos {
                        Some(pos) => attachments.get_mut(pos),
                        None => {
                            attachments.push(PairwiseCandidate::attach(self.clade_at(x), x, leaf));
                            attachments.last_mut()
                        }
                    };
                    if let Some(bucket) = bucket {
                        bucket.check_pair(&constraint, i);
                    }
                }
            }
        }

        (new_pairs, joins, attachments)
    }

    fn clade_at(&self, idx: usize) -> &Clade {
        #[expect(
            clippy::expect_used,
            reason = "clade indices come from the clade_of map over built_clades"
        )]
        let clade = self.built_clades.get(idx).expect("clade index should exist");
        clade
    }

    /// Applies the three rejection filters to one candidate; survivors are
    /// recorded into the encountered set.
    fn filter_candidate(
        &self,
        candidate: Candidate,
        arena: &mut Arena,
        encountered: &dyn Encountered,
        min_score: Option<f64>,
    ) -> Option<Survivor> {
        let (clade, skipped) = self.materialize_clade(&candidate, arena);

        let retained = self
            .built_clades
            .iter()
            .enumerate()
            .filter(|(i, _)| !skipped.contains(i))
            .map(|(_, c)| c)
            .chain(std::iter::once(&clade));
        let repr = forest_repr(retained);

        if encountered.already_encountered(&repr) {
            log::trace!("extension dropped, already encountered: {repr}");
            return None;
        }

        let score_delta = candidate.score_delta();
        if let Some(min) = min_score {
            if self.score + score_delta < min {
                return None;
            }
        }

        let (distances_to_root, pairs_accounted_for) = self.project_extension(&candidate);
        let bound = calculate_best_case(
            &self.ctx,
            &pairs_accounted_for,
            &distances_to_root,
            self.score + score_delta,
        );
        match bound {
            Bound::Unreachable => return None,
            Bound::Reachable(score) => {
                if let Some(min) = min_score {
                    if score < min {
                        return None;
                    }
                }
            }
        }

        encountered.remember(&repr);

        Some(Survivor {
            candidate,
            clade,
            score_delta,
            bound,
            distances_to_root,
            pairs_accounted_for,
        })
    }

    /// Builds (or looks up) the clade a candidate creates and lists the
    /// built-clade indices it consumes.
    fn materialize_clade(&self, candidate: &Candidate, arena: &mut Arena) -> (Clade, Vec<usize>) {
        match candidate {
            Candidate::NewPair(np) => {
                let (a, b) = np.pair.leaves();
                (arena.pair(a, b), vec![])
            }
            Candidate::Pairwise(pw) => match pw.target {
                Target::Attach { clade_idx, leaf } => {
                    let leaf_clade = arena.leaf(leaf);
                    let clade = arena.join(vec![self.clade_at(clade_idx).clone(), leaf_clade]);
                    (clade, vec![clade_idx])
                }
                Target::Join { hi, lo } => {
                    let clade =
                        arena.join(vec![self.clade_at(hi).clone(), self.clade_at(lo).clone()]);
                    (clade, vec![hi, lo])
                }
            },
        }
    }

    /// Distances-to-root and accounted pairs as they would be after the
    /// candidate is applied.
    fn project_extension(
        &self,
        candidate: &Candidate,
    ) -> (HashMap<LeafId, u32>, HashSet<LeafPair>) {
        match candidate {
            Candidate::NewPair(np) => {
                let (a, b) = np.pair.leaves();

                let mut dtr = self.distances_to_root.clone();
                dtr.insert(a, 1);
                dtr.insert(b, 1);

                let mut pairs = self.pairs_accounted_for.clone();
                pairs.insert(np.pair);

                (dtr, pairs)
            }
            Candidate::Pairwise(pw) => {
                // Every leaf under the new root moves one edge further from
                // it; verified pairs cover exactly those leaves
                let mut dtr: HashMap<LeafId, u32> = HashMap::default();
                for pair in pw.consistent.keys().chain(pw.verified.iter()) {
                    let (a, b) = pair.leaves();
                    for leaf in [a, b] {
                        let depth = self.distances_to_root.get(&leaf).map_or(1, |d| d + 1);
                        dtr.insert(leaf, depth);
                    }
                }
                for (&leaf, &depth) in &self.distances_to_root {
                    dtr.entry(leaf).or_insert(depth);
                }

                let mut pairs = self.pairs_accounted_for.clone();
                pairs.extend(pw.verified.iter().copied());

                (dtr, pairs)
            }
        }
    }
}

/// Materializes one survivor into a child assembly.
fn build_candidate(mut asm: Assembly, survivor: Survivor) -> Assembly {
    match &survivor.candidate {
        Candidate::NewPair(np) => {
            let pair = np.pair;
            let consumed = np.idx;

            // Neither leaf can have another sibling, and no other distance
            // between them can hold any more
            asm.constraint_idx.retain(|&j| {
                if j == consumed {
                    return false;
                }
                let c = asm.ctx.constraint(j);
                if c.dist == 1 {
                    !(c.leaves.intersects(pair) && c.leaves != pair)
                } else {
                    c.leaves != pair
                }
            });

            let (a, b) = pair.leaves();
            asm.free_leaves.remove(&a);
            asm.free_leaves.remove(&b);
        }
        Candidate::Pairwise(pw) => {
            let consumed: HashSet<u32> = pw
                .consistent
                .values()
                .copied()
                .chain(pw.inconsistent.iter().copied())
                .collect();

            match pw.target {
                Target::Attach { clade_idx, leaf } => {
                    // The attached leaf is accounted for now, so its sibling
                    // constraints can never be satisfied
                    asm.constraint_idx.retain(|&j| {
                        if consumed.contains(&j) {
                            return false;
                        }
                        let c = asm.ctx.constraint(j);
                        !(c.dist == 1 && c.leaves.contains(leaf))
                    });

                    asm.built_clades.remove(clade_idx);
                    asm.free_leaves.remove(&leaf);
                }
                Target::Join { hi, lo } => {
                    asm.constraint_idx.retain(|&j| !consumed.contains(&j));

                    // hi > lo, so removing hi first keeps lo valid
                    asm.built_clades.remove(hi);
                    asm.built_clades.remove(lo);
                }
            }
        }
    }

    asm.built_clades.push(survivor.clade);
    asm.distances_to_root = survivor.distances_to_root;
    asm.pairs_accounted_for = survivor.pairs_accounted_for;
    asm.score += survivor.score_delta;
    asm.invalidate();
    asm.set_cached_best_case(survivor.bound);

    debug_assert!(asm.leaf_partition_holds());

    asm
}
