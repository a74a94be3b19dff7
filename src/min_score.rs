// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::{
    atomic::{
        AtomicU64,
        Ordering::{Acquire, Release},
    },
    Arc,
};

/// Thread-safe minimum-score cell.
///
/// Holds the score of the K-th best complete topology found so far, as f64
/// bits in an atomic word. Unset until K topologies have been accumulated.
/// Single writer (the coordinator), any number of readers; the stored value
/// is monotone non-decreasing. A reader acting on a stale value only
/// over-admits, which downstream filters correct.
#[derive(Clone, Debug)]
pub struct MinScoreCell(Arc<AtomicU64>);

impl Default for MinScoreCell {
    fn default() -> Self {
        Self(Arc::new(AtomicU64::new(f64::NEG_INFINITY.to_bits())))
    }
}

impl MinScoreCell {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current bound, `None` until the first `set`.
    #[must_use]
    pub fn get(&self) -> Option<f64> {
        let value = f64::from_bits(self.0.load(Acquire));

        if value == f64::NEG_INFINITY {
            None
        } else {
            Some(value)
        }
    }

    /// Whether K topologies have been accumulated anywhere in the cluster.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.get().is_some()
    }

    pub fn set(&self, score: f64) {
        debug_assert!(
            self.get().is_none_or(|prev| score >= prev),
            "min score is monotone non-decreasing",
        );
        self.0.store(score.to_bits(), Release);
    }
}
