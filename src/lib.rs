// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Parallel enumeration of the top-K highest-scoring phylogenetic tree
//! topologies consistent with a corpus of per-leaf-pair distance
//! histograms.
//!
//! ##### About
//!
//! The input is one distance histogram per leaf pair: how often the two
//! leaves were observed at each tree distance. From it, a constraint table
//! of `(pair, distance, frequency)` entries is built and explored by a
//! best-first branch-and-bound search over partial tree assemblies: free
//! leaves pair up into clades, clades absorb further leaves and join each
//! other, and every derived pairwise distance is verified against the
//! histograms, accumulating a log-frequency score.
//!
//! Work is spread across worker threads, each owning an in-memory frontier
//! that overflows to an on-disk spill FIFO; spilled work circulates back
//! through a shared queue, so any worker can pick it up. A shared
//! minimum-score bound (the K-th best complete topology so far) prunes the
//! search globally, and a shared set of canonical forest representations
//! keeps symmetric construction orders from being explored twice.
//!
//! Interrupted runs (deadline, terminator file, or explicit stop) write a
//! gzipped save archive of all unfinished work that a later run can resume
//! from.
//!
//! # Example usage
//!
//! ```
//! use topolenum::{Config, PairHistogram};
//!
//! // One distance histogram per leaf pair
//! let histograms = vec![
//!     PairHistogram::new("a", "b", vec![(1, 0.9), (2, 0.1)]),
//!     PairHistogram::new("b", "c", vec![(1, 0.1), (2, 0.9)]),
//!     PairHistogram::new("a", "c", vec![(1, 0.1), (2, 0.9)]),
//! ];
//!
//! let outcome = Config::new()
//!     .num_workers(1)
//!     .num_requested_topologies(10)
//!     .enumerate(&histograms)?;
//!
//! // `None` would mean the run was interrupted and saved instead
//! let topologies = outcome.topologies.expect("run to completion");
//!
//! for t in &topologies {
//!     println!("{:.5}\t{}", t.score, t.newick);
//! }
//! #
//! # assert_eq!("((a,b),c);", topologies[0].newick);
//! # Ok::<(), topolenum::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, clippy::cargo)]
#![warn(missing_docs)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::indexing_slicing)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]

#[doc(hidden)]
pub mod assembly;

mod checksum;

#[doc(hidden)]
pub mod clade;

#[doc(hidden)]
pub mod coding;

mod config;

#[doc(hidden)]
pub mod context;

mod coordinator;

#[doc(hidden)]
pub mod encountered;

mod error;

#[doc(hidden)]
pub mod event;

mod format_version;
mod histogram;

#[doc(hidden)]
pub mod min_score;

mod save;

#[doc(hidden)]
pub mod spill;

#[doc(hidden)]
pub mod stop_signal;

mod worker;
mod workspace;

/// Hash map that uses a fast non-cryptographic hasher
pub(crate) type HashMap<K, V> = std::collections::HashMap<K, V, rustc_hash::FxBuildHasher>;

/// Hash set that uses a fast non-cryptographic hasher
pub(crate) type HashSet<K> = std::collections::HashSet<K, rustc_hash::FxBuildHasher>;

#[doc(hidden)]
pub use {
    assembly::{Assembly, Bound, CompressedAssembly, Extended},
    checksum::Checksum,
    clade::{forest_repr, Arena, Clade},
    context::Context,
    encountered::{Encountered, LocalEncountered, SharedEncountered},
    format_version::FormatVersion,
    min_score::MinScoreCell,
};

pub use {
    config::{Config, ObserverFn},
    coordinator::{EnumerationStatus, Outcome, Topology},
    error::{Error, Result},
    histogram::{LeafId, LeafPair, PairConstraint, PairHistogram},
    stop_signal::StopSignal,
};
