// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coordinator::{self, EnumerationStatus, Outcome},
    histogram::PairHistogram,
    spill::SpillOptions,
    stop_signal::StopSignal,
    Error,
};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

/// Observer hook signature; called periodically with a progress snapshot
pub type ObserverFn = Box<dyn FnMut(&EnumerationStatus) + Send>;

/// Enumeration options
///
/// ```
/// use topolenum::{Config, PairHistogram};
///
/// let histograms = vec![
///     PairHistogram::new("a", "b", vec![(1, 0.9), (2, 0.1)]),
///     PairHistogram::new("b", "c", vec![(1, 0.1), (2, 0.9)]),
///     PairHistogram::new("a", "c", vec![(1, 0.1), (2, 0.9)]),
/// ];
///
/// let outcome = Config::new()
///     .num_workers(1)
///     .num_requested_topologies(1)
///     .enumerate(&histograms)?;
///
/// let topologies = outcome.topologies.expect("run was not interrupted");
/// assert_eq!("((a,b),c);", topologies[0].newick);
/// # Ok::<(), topolenum::Error>(())
/// ```
pub struct Config {
    /// Number of parallel workers
    pub num_workers: usize,

    /// K, the size of the final accepted list
    pub num_requested_topologies: usize,

    /// Cumulative-frequency cap per pair when building the constraint table
    pub constraint_freq_cutoff: f64,

    /// Per-distance minimum frequency for verifying derived distances
    pub absolute_freq_cutoff: f64,

    /// Per-worker in-memory frontier cap
    pub max_workspace_size: usize,

    /// Shared inbound queue capacity
    pub max_queue_size: usize,

    /// Per-spill-file rollover threshold, in GiB
    pub fifo_max_file_size_gb: f64,

    /// Spill-reload policy: topoff ratio above which any depth is accepted
    pub acceptance_ratio_param: f64,

    /// Spill-reload policy: interpolation stiffness
    pub acceptance_stiffness_param: f64,

    /// Archive prefix for saves written on interruption
    pub save_file_name: String,

    /// Archive to resume from
    pub restart_from: Option<PathBuf>,

    /// Soft stop after this much wall clock
    pub terminate_after: Option<Duration>,

    /// Soft stop when this file appears in the working directory
    pub terminator_file: PathBuf,

    /// Where workers place their spill workspaces; system temp dir when
    /// unset
    pub spill_dir: Option<PathBuf>,

    observer: Option<ObserverFn>,

    stop: StopSignal,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get(),
            num_requested_topologies: 1_000,
            constraint_freq_cutoff: 0.9,
            absolute_freq_cutoff: 0.01,
            max_workspace_size: 10_000,
            max_queue_size: 10_000,
            fifo_max_file_size_gb: 1.0,
            acceptance_ratio_param: 2.0,
            acceptance_stiffness_param: 1.0,
            save_file_name: "early_termination_save".into(),
            restart_from: None,
            terminate_after: None,
            terminator_file: "stop_enumeration".into(),
            spill_dir: None,
            observer: None,
            stop: StopSignal::default(),
        }
    }
}

impl Config {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    #[must_use]
    pub fn num_requested_topologies(mut self, k: usize) -> Self {
        self.num_requested_topologies = k;
        self
    }

    #[must_use]
    pub fn constraint_freq_cutoff(mut self, cutoff: f64) -> Self {
        self.constraint_freq_cutoff = cutoff;
        self
    }

    #[must_use]
    pub fn absolute_freq_cutoff(mut self, cutoff: f64) -> Self {
        self.absolute_freq_cutoff = cutoff;
        self
    }

    #[must_use]
    pub fn max_workspace_size(mut self, size: usize) -> Self {
        self.max_workspace_size = size;
        self
    }

    #[must_use]
    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    #[must_use]
    pub fn fifo_max_file_size_gb(mut self, gb: f64) -> Self {
        self.fifo_max_file_size_gb = gb;
        self
    }

    #[must_use]
    pub fn acceptance_ratio_param(mut self, accrp: f64) -> Self {
        self.acceptance_ratio_param = accrp;
        self
    }

    #[must_use]
    pub fn acceptance_stiffness_param(mut self, accsp: f64) -> Self {
        self.acceptance_stiffness_param = accsp;
        self
    }

    #[must_use]
    pub fn save_file_name(mut self, name: impl Into<String>) -> Self {
        self.save_file_name = name.into();
        self
    }

    #[must_use]
    pub fn restart_from(mut self, archive: impl Into<PathBuf>) -> Self {
        self.restart_from = Some(archive.into());
        self
    }

    #[must_use]
    pub fn terminate_after(mut self, limit: Duration) -> Self {
        self.terminate_after = Some(limit);
        self
    }

    #[must_use]
    pub fn terminator_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.terminator_file = path.into();
        self
    }

    #[must_use]
    pub fn spill_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spill_dir = Some(dir.into());
        self
    }

    /// Installs a progress observer, called periodically from the
    /// coordinating thread.
    #[must_use]
    pub fn observer(mut self, f: impl FnMut(&EnumerationStatus) + Send + 'static) -> Self {
        self.observer = Some(Box::new(f));
        self
    }

    /// Handle for requesting a soft stop from another thread.
    #[must_use]
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Runs the enumeration.
    ///
    /// Blocks until up to K topologies have been found (returned best
    /// first) or a stop trigger fires, in which case the save archive is
    /// written and `topologies` is `None`.
    ///
    /// # Errors
    ///
    /// Fails fast on malformed histograms or an unusable restart archive,
    /// and propagates I/O errors from the spill and save machinery.
    pub fn enumerate(self, histograms: &[PairHistogram]) -> crate::Result<Outcome> {
        coordinator::run(histograms, self)
    }

    pub(crate) fn validate(&self) -> crate::Result<()> {
        if !(self.constraint_freq_cutoff > 0.0 && self.constraint_freq_cutoff <= 1.0) {
            return Err(Error::InvalidConfig("constraint_freq_cutoff outside (0, 1]"));
        }
        if self.absolute_freq_cutoff < 0.0 {
            return Err(Error::InvalidConfig("negative absolute_freq_cutoff"));
        }
        if self.acceptance_ratio_param <= 0.1 {
            return Err(Error::InvalidConfig("acceptance_ratio_param must exceed 0.1"));
        }
        Ok(())
    }

    pub(crate) fn spill_options(&self) -> SpillOptions {
        #[expect(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            reason = "file size caps are positive and far below 2^63"
        )]
        let max_file_size = (self.fifo_max_file_size_gb * 1_024.0 * 1_024.0 * 1_024.0) as u64;

        SpillOptions {
            max_file_size,
            dir: self.spill_dir.clone(),
            ..SpillOptions::default()
        }
    }

    pub(crate) fn observe(&mut self, status: &EnumerationStatus) {
        if let Some(observer) = self.observer.as_mut() {
            observer(status);
        }
    }

    pub(crate) fn terminator_path(&self) -> &Path {
        &self.terminator_file
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("num_workers", &self.num_workers)
            .field("num_requested_topologies", &self.num_requested_topologies)
            .field("constraint_freq_cutoff", &self.constraint_freq_cutoff)
            .field("absolute_freq_cutoff", &self.absolute_freq_cutoff)
            .field("max_workspace_size", &self.max_workspace_size)
            .field("max_queue_size", &self.max_queue_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_knobs() {
        let config = Config::default();
        assert_eq!(1_000, config.num_requested_topologies);
        assert_eq!(0.9, config.constraint_freq_cutoff);
        assert_eq!(0.01, config.absolute_freq_cutoff);
        assert_eq!(10_000, config.max_workspace_size);
        assert_eq!(10_000, config.max_queue_size);
        assert_eq!(1.0, config.fifo_max_file_size_gb);
        assert_eq!(2.0, config.acceptance_ratio_param);
        assert_eq!(1.0, config.acceptance_stiffness_param);
        assert_eq!("early_termination_save", config.save_file_name);
        assert_eq!(Path::new("stop_enumeration"), config.terminator_path());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_degenerate_knobs() {
        assert!(Config::new()
            .constraint_freq_cutoff(0.0)
            .validate()
            .is_err());
        assert!(Config::new()
            .constraint_freq_cutoff(1.5)
            .validate()
            .is_err());
        assert!(Config::new().acceptance_ratio_param(0.05).validate().is_err());
    }

    #[test]
    fn spill_options_scale_gb() {
        let opts = Config::new().fifo_max_file_size_gb(0.5).spill_options();
        assert_eq!(512 * 1_024 * 1_024, opts.max_file_size);
    }
}
