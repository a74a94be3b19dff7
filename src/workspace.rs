// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    assembly::{Assembly, CompressedAssembly, Extended},
    clade::Arena,
    context::Context,
    encountered::Encountered,
    min_score::MinScoreCell,
    spill::SharedSpillFifo,
    stop_signal::StopSignal,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::{sync::Arc, time::Duration};

/// Spills accumulate in memory up to this many before being flushed
const PUSH_CACHE_LIMIT: usize = 100;

/// At most this many postponed reloads per topoff round
const POSTPONE_LIMIT: u32 = 100;

/// How long to block on an empty inbound queue before concluding the
/// cluster may be out of work
const INBOUND_RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// One message on the shared inbound assembly queue
pub(crate) enum InboundItem {
    Assembly(CompressedAssembly),

    /// A queue loader drained its FIFO and exited
    FifoDrained,
}

/// Whether an iteration found the cluster out of work
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Flow {
    Continue,
    Finished,
}

pub(crate) struct WorkspaceOptions {
    pub ctx: Arc<Context>,
    pub encountered: Arc<dyn Encountered>,
    pub min_score: MinScoreCell,
    pub inbound: Receiver<InboundItem>,
    pub scores: Sender<f64>,
    pub fifo: SharedSpillFifo,
    pub max_workspace_size: usize,
    pub acceptance_ratio_param: f64,
    pub acceptance_stiffness_param: f64,
}

/// Per-worker best-first frontier with overflow spill.
///
/// Each iteration expands a snapshot of the frontier, routes complete
/// children to the accepted list, merges the rest back in sorted order and
/// then rebalances: overflow beyond the adaptive cap is compressed into the
/// spill FIFO, a deficit is topped off from the shared inbound queue under
/// the acceptance controller.
pub(crate) struct Workspace {
    ctx: Arc<Context>,
    arena: Arena,

    frontier: Vec<Assembly>,
    new_assembly_cache: Vec<Assembly>,
    accepted: Vec<Assembly>,

    encountered: Arc<dyn Encountered>,
    min_score: MinScoreCell,
    inbound: Receiver<InboundItem>,
    scores: Sender<f64>,
    fifo: SharedSpillFifo,
    push_cache: Vec<CompressedAssembly>,

    max_workspace_size: usize,
    current_max: usize,

    iternum: u64,

    /// Starts at 1 to avoid division by zero in the acceptance ratio
    push_count: u64,
    topoff_count: u64,
    topoff_param1: f64,
    topoff_param2: f64,
    accrp: f64,
    accsp: f64,
}

impl Workspace {
    pub fn new(opts: WorkspaceOptions, seed: Option<Assembly>) -> Self {
        Self {
            ctx: opts.ctx,
            arena: Arena::new(),
            frontier: seed.into_iter().collect(),
            new_assembly_cache: vec![],
            accepted: vec![],
            encountered: opts.encountered,
            min_score: opts.min_score,
            inbound: opts.inbound,
            scores: opts.scores,
            fifo: opts.fifo,
            push_cache: vec![],
            max_workspace_size: opts.max_workspace_size,
            current_max: 10,
            iternum: 0,
            push_count: 1,
            topoff_count: 0,
            topoff_param1: 1.0,
            topoff_param2: 1.0,
            accrp: opts.acceptance_ratio_param,
            accsp: opts.acceptance_stiffness_param,
        }
    }

    pub fn arena_mut(&mut self) -> &mut Arena {
        &mut self.arena
    }

    pub fn frontier_len(&self) -> usize {
        self.frontier.len()
    }

    pub fn take_accepted(&mut self) -> Vec<Assembly> {
        std::mem::take(&mut self.accepted)
    }

    /// Places a seed assembly (rebuilt in this workspace's arena) on the
    /// frontier.
    pub fn admit_seed(&mut self, seed: Assembly) {
        self.frontier.push(seed);
    }

    /// Whether K complete topologies have been accumulated anywhere in the
    /// cluster.
    fn reached_requested_count(&self) -> bool {
        self.min_score.is_set()
    }

    /// Expands one snapshot of the frontier.
    pub fn iterate(&mut self, interrupt: &StopSignal) -> crate::Result<Flow> {
        self.iternum += 1;
        log::trace!(
            "Iteration {} starting with frontier of {}",
            self.iternum,
            self.frontier.len(),
        );

        let snapshot = std::mem::take(&mut self.frontier);
        let mut kept = Vec::with_capacity(snapshot.len());

        for mut assembly in snapshot {
            if interrupt.is_stopped() {
                kept.push(assembly);
                continue;
            }

            let min_score = self.min_score.get();

            if let Some(min) = min_score {
                if assembly.best_case().below(min) {
                    log::trace!("Abandoning assembly, best case below {min}");
                    self.encountered.forget(&assembly.forest_repr());
                    continue;
                }
            }

            match assembly.generate_extensions(&mut self.arena, &*self.encountered, min_score) {
                Extended::DeadEnd(dead) => {
                    log::trace!("Abandoning assembly, no extensions");
                    self.encountered.forget(&dead.forest_repr());
                }
                Extended::Children(mut children) => {
                    // The last child reuses the parent's allocation and
                    // inherits its frontier slot
                    let reused_parent = children.pop();

                    let incomplete: Vec<Assembly> = children
                        .into_iter()
                        .filter_map(|child| self.check_completion(child))
                        .collect();

                    if let Some(child) = reused_parent {
                        if let Some(child) = self.check_completion(child) {
                            kept.push(child);
                        }
                    }

                    self.cache_new_assemblies(incomplete)?;
                }
            }
        }

        self.frontier = kept;

        if interrupt.is_stopped() {
            self.prepare_to_terminate()?;
            Ok(Flow::Continue)
        } else {
            self.finalize()
        }
    }

    /// Routes a child: complete assemblies go to the accepted list (or are
    /// rejected against the current bound), incomplete ones are returned
    /// for the cache.
    fn check_completion(&mut self, assembly: Assembly) -> Option<Assembly> {
        if !assembly.complete() {
            return Some(assembly);
        }

        let min_score = self.min_score.get();

        if min_score.is_none_or(|min| assembly.score() > min) {
            log::debug!("Complete topology accepted at score {}", assembly.score());
            self.scores.send(assembly.score()).ok();
            self.accepted.push(assembly);
        } else {
            log::trace!("Complete topology rejected at score {}", assembly.score());
        }

        // The bound only ever rises; drop accepted entries it has passed
        if let Some(min) = min_score {
            self.accepted.retain(|a| a.score() >= min);
        }

        None
    }

    fn cache_new_assemblies(&mut self, new_assemblies: Vec<Assembly>) -> crate::Result<()> {
        self.new_assembly_cache.extend(new_assemblies);
        sort_by_key_desc(&mut self.new_assembly_cache);

        let cap = if self.reached_requested_count() {
            self.max_workspace_size
        } else {
            self.current_max
        };

        self.spill_overflow_from_cache(cap)
    }

    fn spill_overflow_from_cache(&mut self, cap: usize) -> crate::Result<()> {
        while self.new_assembly_cache.len() > cap {
            if let Some(worst) = self.new_assembly_cache.pop() {
                self.spill(worst)?;
            }
        }
        Ok(())
    }

    fn spill_overflow_from_frontier(&mut self, cap: usize) -> crate::Result<()> {
        while self.frontier.len() > cap {
            if let Some(worst) = self.frontier.pop() {
                self.spill(worst)?;
            }
        }
        Ok(())
    }

    fn spill(&mut self, mut assembly: Assembly) -> crate::Result<()> {
        self.push_cache.push(assembly.compress());
        if self.push_cache.len() > PUSH_CACHE_LIMIT {
            self.flush_push_cache()?;
        }
        self.push_count += 1;
        Ok(())
    }

    fn flush_push_cache(&mut self) -> crate::Result<()> {
        if self.push_cache.is_empty() {
            return Ok(());
        }

        self.fifo
            .push_all(self.push_cache.iter().map(CompressedAssembly::as_bytes))?;
        self.push_cache.clear();
        Ok(())
    }

    /// Merges the iteration's cache into the frontier, re-sorts, adapts
    /// the in-memory cap and rebalances against the FIFO.
    fn finalize(&mut self) -> crate::Result<Flow> {
        self.frontier.append(&mut self.new_assembly_cache);
        sort_by_key_desc(&mut self.frontier);

        let flow = if self.reached_requested_count() {
            // Shrink the in-memory frontier while spill reloads dominate
            // the intake
            let activity = (self.topoff_param1 / self.topoff_param2).max(0.02);

            #[expect(clippy::cast_precision_loss, reason = "workspace caps are small")]
            let shrunk = (self.max_workspace_size as f64 / (50.0 * activity)).max(10.0);

            #[expect(
                clippy::cast_possible_truncation,
                clippy::cast_sign_loss,
                reason = "clamped to the workspace cap"
            )]
            {
                self.current_max = self.max_workspace_size.min(shrunk as usize);
            }

            if self.frontier.is_empty() {
                let flow = self.top_off(self.current_max)?;
                self.topoff_param1 = 1.0;
                self.topoff_param2 += 5.0;
                flow
            } else {
                self.spill_overflow_from_frontier(self.max_workspace_size)?;
                let flow = if self.frontier.len() < self.max_workspace_size {
                    self.top_off(self.max_workspace_size)?
                } else {
                    Flow::Continue
                };
                self.topoff_param1 += 1.0;
                self.topoff_param2 = (self.topoff_param2 - 1.0).max(1.0);
                flow
            }
        } else {
            // Deep assemblies pending: favor depth-first with a tight cap
            let deep_work_pending = self
                .frontier
                .iter()
                .map(Assembly::nodes_left_to_build)
                .max()
                .is_none_or(|most| most > 3);

            self.current_max = if deep_work_pending {
                10
            } else {
                self.max_workspace_size.min(100)
            };

            self.spill_overflow_from_frontier(self.current_max)?;

            if self.frontier.len() < self.max_workspace_size {
                self.top_off(self.current_max)?
            } else {
                Flow::Continue
            }
        };

        self.flush_push_cache()?;
        Ok(flow)
    }

    /// Refills the frontier from the shared inbound queue up to `cap`.
    fn top_off(&mut self, cap: usize) -> crate::Result<Flow> {
        while self.frontier.len() < cap {
            let mut postponed = 0u32;
            let mut rejected: Vec<CompressedAssembly> = vec![];

            let flow = self.fill_from_queue(cap, &mut rejected, &mut postponed)?;

            self.fifo
                .push_all(rejected.iter().map(CompressedAssembly::as_bytes))?;

            if flow == Flow::Finished {
                return Ok(Flow::Finished);
            }
            if postponed < POSTPONE_LIMIT {
                break;
            }
        }
        Ok(Flow::Continue)
    }

    fn fill_from_queue(
        &mut self,
        cap: usize,
        rejected: &mut Vec<CompressedAssembly>,
        postponed: &mut u32,
    ) -> crate::Result<Flow> {
        while self.frontier.len() < cap && *postponed < POSTPONE_LIMIT {
            let item = match self.inbound.try_recv() {
                Ok(item) => item,
                Err(TryRecvError::Empty) => {
                    if !self.frontier.is_empty() {
                        break;
                    }

                    // Nothing at all to work on: block, then check whether
                    // the cluster still has data in flight
                    match self.inbound.recv_timeout(INBOUND_RECV_TIMEOUT) {
                        Ok(item) => item,
                        Err(RecvTimeoutError::Timeout) => {
                            if self.fifo.is_data_available() {
                                continue;
                            }
                            return Ok(Flow::Finished);
                        }
                        Err(RecvTimeoutError::Disconnected) => return Ok(Flow::Finished),
                    }
                }
                Err(TryRecvError::Disconnected) => {
                    if !self.frontier.is_empty() {
                        break;
                    }
                    return Ok(Flow::Finished);
                }
            };

            match item {
                InboundItem::FifoDrained => {}
                InboundItem::Assembly(compressed) => {
                    self.admit_reload(compressed, rejected, postponed)?;
                }
            }
        }

        Ok(Flow::Continue)
    }

    /// Acceptance controller for one spill reload.
    fn admit_reload(
        &mut self,
        compressed: CompressedAssembly,
        rejected: &mut Vec<CompressedAssembly>,
        postponed: &mut u32,
    ) -> crate::Result<()> {
        let min_score = self.min_score.get();

        if min_score.is_none_or(|min| compressed.best_case() > min) {
            self.topoff_count += 1;

            if f64::from(compressed.nodes_left()) <= self.acceptance_criterion() {
                let assembly = Assembly::uncompress(&compressed, &self.ctx, &mut self.arena)?;
                log::trace!("Topoff accepted at best case {}", compressed.best_case());
                self.frontier.push(assembly);
            } else {
                log::trace!("Topoff postponed, {} nodes left", compressed.nodes_left());
                *postponed += 1;
                rejected.push(compressed);
            }
        } else {
            let assembly = Assembly::uncompress(&compressed, &self.ctx, &mut self.arena)?;
            log::trace!("Topoff rejected at best case {}", compressed.best_case());
            self.encountered.forget(&assembly.forest_repr());
        }

        Ok(())
    }

    /// Reload depth threshold, on nodes left to build.
    ///
    /// A worker mostly reloading spill (high topoff ratio) accepts any
    /// depth; one mostly producing accepts only near-complete assemblies,
    /// with a power-curve interpolation in between.
    fn acceptance_criterion(&self) -> f64 {
        #[expect(clippy::cast_precision_loss, reason = "counters are far below 2^52")]
        let ratio = self.topoff_count as f64 / self.push_count as f64;
        let total = f64::from(self.ctx.total_nodes_to_build);

        if ratio > self.accrp {
            total
        } else if ratio < 0.1 {
            3.0
        } else {
            total - (total - 3.0) * ((self.accrp - ratio) / (self.accrp - 0.1)).powf(self.accsp)
        }
    }

    /// Drains the frontier and cache into the FIFO in compressed form so a
    /// save archive can pick the work up later.
    pub fn prepare_to_terminate(&mut self) -> crate::Result<()> {
        log::debug!(
            "Draining {} frontier assemblies to spill for termination",
            self.frontier.len() + self.new_assembly_cache.len(),
        );

        let mut cache = std::mem::take(&mut self.new_assembly_cache);
        self.frontier.append(&mut cache);

        while let Some(assembly) = self.frontier.pop() {
            self.spill(assembly)?;
            self.flush_push_cache()?;
        }
        Ok(())
    }
}

fn sort_by_key_desc(assemblies: &mut Vec<Assembly>) {
    let mut keyed: Vec<(f64, Assembly)> = assemblies
        .drain(..)
        .map(|mut a| (a.sort_key(), a))
        .collect();
    keyed.sort_by(|a, b| b.0.total_cmp(&a.0));
    assemblies.extend(keyed.into_iter().map(|(_, a)| a));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        context::Context, encountered::SharedEncountered, histogram::PairHistogram,
        spill::SpillOptions,
    };
    use test_log::test;

    struct Fixture {
        workspace: Workspace,
        inbound_tx: Option<Sender<InboundItem>>,
        scores_rx: Receiver<f64>,
    }

    fn fixture(records: &[PairHistogram], total_nodes_to_build: u32) -> Fixture {
        let ctx = Arc::new(
            Context::from_histograms(records, 1.0, 0.01).expect("histograms should be valid"),
        );
        assert_eq!(total_nodes_to_build, ctx.total_nodes_to_build);

        let fifo = SharedSpillFifo::new(SpillOptions {
            dir: None,
            ..SpillOptions::default()
        })
        .expect("fifo workspace should be creatable");
        fifo.start_out_end().expect("out end should start");
        fifo.start_in_end().expect("in end should start");

        let (inbound_tx, inbound_rx) = crossbeam_channel::bounded(64);
        let (scores_tx, scores_rx) = crossbeam_channel::unbounded();

        let workspace = Workspace::new(
            WorkspaceOptions {
                ctx: ctx.clone(),
                encountered: Arc::new(SharedEncountered::new()),
                min_score: MinScoreCell::new(),
                inbound: inbound_rx,
                scores: scores_tx,
                fifo,
                max_workspace_size: 100,
                acceptance_ratio_param: 2.0,
                acceptance_stiffness_param: 1.0,
            },
            Some(Assembly::seed(&ctx)),
        );

        Fixture {
            workspace,
            inbound_tx: Some(inbound_tx),
            scores_rx,
        }
    }

    fn three_leaves() -> Vec<PairHistogram> {
        vec![
            PairHistogram::new("a", "b", vec![(1, 0.9), (2, 0.1)]),
            PairHistogram::new("b", "c", vec![(1, 0.1), (2, 0.9)]),
            PairHistogram::new("a", "c", vec![(1, 0.1), (2, 0.9)]),
        ]
    }

    #[test]
    fn acceptance_criterion_boundaries() {
        let mut fx = fixture(&three_leaves(), 2);
        let total = 2.0;

        // ratio below 0.1: only near-complete assemblies get in
        fx.workspace.topoff_count = 0;
        fx.workspace.push_count = 100;
        assert_eq!(3.0, fx.workspace.acceptance_criterion());

        // ratio exactly 0.1: the interpolation lands on 3 as well
        fx.workspace.topoff_count = 10;
        fx.workspace.push_count = 100;
        assert!((fx.workspace.acceptance_criterion() - 3.0).abs() < 1e-12);

        // ratio exactly accrp: any depth is accepted
        fx.workspace.topoff_count = 200;
        fx.workspace.push_count = 100;
        assert!((fx.workspace.acceptance_criterion() - total).abs() < 1e-12);

        // ratio above accrp
        fx.workspace.topoff_count = 500;
        fx.workspace.push_count = 100;
        assert_eq!(total, fx.workspace.acceptance_criterion());

        // halfway up the interpolation range with stiffness 1 the
        // threshold is strictly between the extremes
        fx.workspace.topoff_count = 105;
        fx.workspace.push_count = 100;
        let mid = fx.workspace.acceptance_criterion();
        assert!(mid > 3.0 && mid < total);
    }

    #[test]
    fn iterate_finds_three_leaf_topologies() -> crate::Result<()> {
        let mut fx = fixture(&three_leaves(), 2);

        // No other workers: a dead inbound queue plus an empty frontier
        // means the work is done
        fx.inbound_tx.take();

        let interrupt = StopSignal::default();
        let mut finished = false;
        for _ in 0..32 {
            if fx.workspace.iterate(&interrupt)? == Flow::Finished {
                finished = true;
                break;
            }
        }
        assert!(finished, "search should run out of work");

        let accepted = fx.workspace.take_accepted();
        assert_eq!(3, accepted.len());
        for assembly in &accepted {
            assert!(assembly.complete());
        }

        let scores: Vec<f64> = fx.scores_rx.try_iter().collect();
        assert_eq!(3, scores.len());

        let best = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        assert!((best - 3.0 * 0.9f64.ln()).abs() < 1e-9);

        Ok(())
    }

    #[test]
    fn interrupt_drains_frontier_to_fifo() -> crate::Result<()> {
        let mut fx = fixture(&three_leaves(), 2);

        let interrupt = StopSignal::default();
        interrupt.send();

        assert_eq!(Flow::Continue, fx.workspace.iterate(&interrupt)?);
        assert_eq!(0, fx.workspace.frontier_len());

        // The seed was compressed into the FIFO; it comes back out intact
        let popped = fx
            .workspace
            .fifo
            .pop(Duration::from_millis(100))?
            .expect("seed should be spilled");
        let compressed = CompressedAssembly::from_bytes(popped)?;
        assert_eq!(2, compressed.nodes_left());

        Ok(())
    }

    #[test]
    fn reload_below_bound_is_dropped_and_forgotten() -> crate::Result<()> {
        let mut fx = fixture(&three_leaves(), 2);

        let ctx = fx.workspace.ctx.clone();
        let mut seed_child = {
            let enc = SharedEncountered::new();
            match Assembly::seed(&ctx).generate_extensions(
                fx.workspace.arena_mut(),
                &enc,
                None,
            ) {
                Extended::Children(mut children) => children.pop().expect("should expand"),
                Extended::DeadEnd(_) => panic!("seed should expand"),
            }
        };
        let compressed = seed_child.compress();
        fx.workspace.encountered.remember(&seed_child.forest_repr());

        // A bound above every best case rejects any reload
        fx.workspace.min_score.set(1.0);

        let mut rejected = vec![];
        let mut postponed = 0;
        fx.workspace
            .admit_reload(compressed, &mut rejected, &mut postponed)?;

        assert_eq!(0, fx.workspace.frontier_len() - 1); // only the seed remains
        assert!(rejected.is_empty());
        assert_eq!(0, postponed);
        assert!(!fx
            .workspace
            .encountered
            .already_encountered(&seed_child.forest_repr()));

        Ok(())
    }

    #[test]
    fn near_complete_reload_is_admitted() -> crate::Result<()> {
        let mut fx = fixture(&three_leaves(), 2);

        let ctx = fx.workspace.ctx.clone();
        let compressed = Assembly::seed(&ctx).compress();

        // Low topoff activity: only assemblies with <= 3 nodes left pass,
        // which a fresh 3-leaf seed (2 nodes) does
        fx.workspace.push_count = 100;
        let mut rejected = vec![];
        let mut postponed = 0;
        fx.workspace
            .admit_reload(compressed, &mut rejected, &mut postponed)?;
        assert_eq!(2, fx.workspace.frontier_len());
        assert_eq!(0, postponed);

        Ok(())
    }
}
