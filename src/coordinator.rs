// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    assembly::{Assembly, CompressedAssembly, Extended},
    clade::Arena,
    config::Config,
    context::Context,
    encountered::{Encountered, SharedEncountered},
    histogram::PairHistogram,
    min_score::MinScoreCell,
    save,
    worker::{self, WorkerHandle, WorkerOptions, WorkerResult},
    workspace::InboundItem,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::{
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

const SCORE_DRAIN_TIMEOUT: Duration = Duration::from_millis(50);
const OBSERVER_INTERVAL: Duration = Duration::from_secs(1);
const SAVE_QUEUE_QUIET_PERIOD: Duration = Duration::from_secs(5);
const RESULT_COLLECT_TIMEOUT: Duration = Duration::from_secs(60);

/// One enumerated topology
#[derive(Clone, Debug, PartialEq)]
pub struct Topology {
    /// Cumulative log-frequency of every leaf pair distance in the tree
    pub score: f64,

    /// Parenthesized rendering of the tree, terminated by `;`
    pub newick: String,
}

/// What an enumeration run produced
#[derive(Debug)]
pub struct Outcome {
    /// Up to K topologies, best first; `None` when the run was interrupted
    /// and a save archive was written instead
    pub topologies: Option<Vec<Topology>>,
}

/// Progress snapshot handed to the observer hook
#[derive(Clone, Debug)]
pub struct EnumerationStatus {
    /// Wall clock since the run started
    pub elapsed: Duration,

    /// Current worst accepted score once K topologies exist
    pub min_score: Option<f64>,

    /// Scores accumulated in the top-K window so far
    pub accepted_scores: usize,

    /// Workers currently idle for lack of work
    pub workers_finished: usize,
}

/// Seeds workers, broadcasts the minimum-score bound and collects results;
/// on a stop trigger writes the save archive instead.
pub(crate) fn run(records: &[PairHistogram], mut config: Config) -> crate::Result<Outcome> {
    config.validate()?;

    let ctx = Arc::new(Context::from_histograms(
        records,
        config.constraint_freq_cutoff,
        config.absolute_freq_cutoff,
    )?);

    if ctx.leaf_count() < 2 {
        log::debug!("Nothing to assemble from {} leaves", ctx.leaf_count());
        return Ok(Outcome {
            topologies: Some(vec![]),
        });
    }

    let k = config.num_requested_topologies;
    let num_workers = config.num_workers.max(1);

    let encountered = SharedEncountered::new();
    let min_score = MinScoreCell::new();
    let (inbound_tx, inbound_rx) = crossbeam_channel::bounded(config.max_queue_size);
    let (scores_tx, scores_rx) = crossbeam_channel::unbounded();
    let (results_tx, results_rx) = crossbeam_channel::unbounded();

    let mut window: Vec<f64> = vec![];
    let mut pre_accepted: Vec<Topology> = vec![];
    let mut seeds: Vec<CompressedAssembly> = vec![];
    let mut reloader: Option<JoinHandle<()>> = None;

    if let Some(archive) = config.restart_from.clone() {
        let state = save::read_archive(&archive, &ctx)?;
        log::info!(
            "Restarting from {archive:?}: {} unfinished, {} accepted, {} encountered",
            state.unfinished.len(),
            state.accepted.len(),
            state.encountered.len(),
        );

        encountered.preload(state.encountered);
        for topology in &state.accepted {
            update_window(&mut window, topology.score, k, &min_score);
        }
        pre_accepted = state.accepted;

        if state.unfinished.is_empty() {
            log::debug!("Archive holds no unfinished assemblies; returning its results");
            return Ok(Outcome {
                topologies: Some(finalize_results(pre_accepted, k)),
            });
        }

        reloader = Some(stream_into_queue(
            state.unfinished,
            &inbound_tx,
            config.max_queue_size,
        ));
    } else {
        let (fresh_seeds, completed) = expand_seeds(&ctx, &encountered, num_workers);

        for topology in &completed {
            update_window(&mut window, topology.score, k, &min_score);
        }
        pre_accepted = completed;

        if fresh_seeds.is_empty() {
            log::debug!("Input exhausted during seeding; no workers needed");
            return Ok(Outcome {
                topologies: Some(finalize_results(pre_accepted, k)),
            });
        }

        let (to_workers, surplus) = split_seeds(fresh_seeds, num_workers);
        seeds = to_workers;

        if !surplus.is_empty() {
            reloader = Some(stream_into_queue(surplus, &inbound_tx, config.max_queue_size));
        }
    }

    let mut workers: Vec<WorkerHandle> = vec![];
    let worker_count = if seeds.is_empty() {
        num_workers
    } else {
        seeds.len()
    };

    for id in 0..worker_count {
        workers.push(worker::spawn(WorkerOptions {
            id,
            ctx: ctx.clone(),
            seed: seeds.pop(),
            encountered: Arc::new(encountered.clone()),
            min_score: min_score.clone(),
            inbound_tx: inbound_tx.clone(),
            inbound_rx: inbound_rx.clone(),
            scores_tx: scores_tx.clone(),
            results_tx: results_tx.clone(),
            max_workspace_size: config.max_workspace_size,
            acceptance_ratio_param: config.acceptance_ratio_param,
            acceptance_stiffness_param: config.acceptance_stiffness_param,
            spill: config.spill_options(),
        })?);
    }
    drop(scores_tx);

    log::info!(
        "Enumerating with {} workers over {} leaves ({} constraints)",
        workers.len(),
        ctx.leaf_count(),
        ctx.constraint_count(),
    );

    let start = Instant::now();
    let mut last_observed: Option<Instant> = None;
    let mut stopped = false;

    loop {
        if workers.iter().all(|w| w.finished.is_set()) {
            break;
        }

        match scores_rx.recv_timeout(SCORE_DRAIN_TIMEOUT) {
            Ok(score) => update_window(&mut window, score, k, &min_score),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if last_observed.is_none_or(|at| at.elapsed() >= OBSERVER_INTERVAL) {
            last_observed = Some(Instant::now());
            config.observe(&EnumerationStatus {
                elapsed: start.elapsed(),
                min_score: min_score.get(),
                accepted_scores: window.len(),
                workers_finished: workers.iter().filter(|w| w.finished.is_set()).count(),
            });
        }

        if stop_requested(&config, start) {
            log::info!("Stop trigger observed; interrupting workers");
            stopped = true;
            for w in &workers {
                w.interrupt.send();
            }
            break;
        }
    }

    let mut save_error = None;
    let outcome = if stopped {
        if let Err(e) = write_save(
            &config,
            &ctx,
            &inbound_rx,
            &results_rx,
            &encountered,
            pre_accepted,
            workers.len(),
        ) {
            log::error!("Failed to write save archive: {e:?}");
            save_error = Some(e);
        }
        Outcome { topologies: None }
    } else {
        release_workers(&workers);
        let collected = collect_results(&results_rx, workers.len());

        let mut results = pre_accepted;
        results.extend(collected);
        Outcome {
            topologies: Some(finalize_results(results, k)),
        }
    };

    // Workers must be released even if the save failed, or they would
    // block on the shutdown flag forever
    release_workers(&workers);

    for w in workers {
        w.join.join().ok();
    }

    drop(inbound_rx);
    if let Some(reloader) = reloader {
        reloader.join().ok();
    }

    match save_error {
        Some(e) => Err(e),
        None => Ok(outcome),
    }
}

fn release_workers(workers: &[WorkerHandle]) {
    for w in workers {
        w.shutdown.set();
    }
}

/// Expands the zeroth assembly until there is at least one seed per worker
/// (or the search space is exhausted). Assemblies completing during seeding
/// are returned as finished topologies.
fn expand_seeds(
    ctx: &Arc<Context>,
    encountered: &SharedEncountered,
    num_workers: usize,
) -> (Vec<Assembly>, Vec<Topology>) {
    let mut arena = Arena::new();
    let mut frontier = vec![Assembly::seed(ctx)];
    let mut completed: Vec<Topology> = vec![];

    while !frontier.is_empty() && frontier.len() < num_workers {
        let mut next = vec![];

        for assembly in frontier {
            match assembly.generate_extensions(&mut arena, encountered, None) {
                Extended::DeadEnd(dead) => {
                    encountered.forget(&dead.forest_repr());
                }
                Extended::Children(children) => {
                    for child in children {
                        if child.complete() {
                            if let Some(newick) = child.newick() {
                                completed.push(Topology {
                                    score: child.score(),
                                    newick,
                                });
                            }
                        } else {
                            next.push(child);
                        }
                    }
                }
            }
        }

        frontier = next;
    }

    (frontier, completed)
}

/// Best seeds go to the workers, the rest into the inbound queue.
fn split_seeds(mut seeds: Vec<Assembly>, num_workers: usize) -> (Vec<CompressedAssembly>, Vec<CompressedAssembly>) {
    // Ascending, so the strongest seeds sit at the end (workers pop from
    // the back)
    let mut keyed: Vec<(f64, Assembly)> = seeds
        .drain(..)
        .map(|mut a| (a.sort_key(), a))
        .collect();
    keyed.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut compressed: Vec<CompressedAssembly> = keyed
        .into_iter()
        .map(|(_, mut a)| a.compress())
        .collect();

    let surplus_count = compressed.len().saturating_sub(num_workers);
    let surplus: Vec<CompressedAssembly> = compressed.drain(..surplus_count).collect();

    (compressed, surplus)
}

/// Pushes assemblies into the bounded inbound queue, spilling the tail into
/// a background thread once the queue is full (restart re-loader and seed
/// surplus both use this).
fn stream_into_queue(
    items: Vec<CompressedAssembly>,
    inbound_tx: &Sender<InboundItem>,
    max_queue_size: usize,
) -> JoinHandle<()> {
    let initial_batch = (max_queue_size / 10).max(1);
    let mut items = items.into_iter();

    for compressed in items.by_ref().take(initial_batch) {
        if inbound_tx.send(InboundItem::Assembly(compressed)).is_err() {
            break;
        }
    }

    let remaining: Vec<CompressedAssembly> = items.collect();
    let tx = inbound_tx.clone();

    std::thread::spawn(move || {
        for compressed in remaining {
            // A full queue back-pressures here; a closed one means the run
            // is over
            if tx.send(InboundItem::Assembly(compressed)).is_err() {
                break;
            }
        }
    })
}

/// Maintains the top-K score window; publishing the K-th best as the shared
/// minimum-score bound once the window is full.
fn update_window(window: &mut Vec<f64>, score: f64, k: usize, min_score: &MinScoreCell) {
    let admit = window.len() < k || window.last().is_none_or(|&worst| score > worst);
    if !admit {
        return;
    }

    window.push(score);
    window.sort_by(|a, b| b.total_cmp(a));
    window.truncate(k);

    if window.len() == k {
        if let Some(&kth) = window.last() {
            let stale = min_score.get().is_some_and(|current| kth <= current);
            if !stale {
                min_score.set(kth);
            }
        }
    }
}

fn stop_requested(config: &Config, start: Instant) -> bool {
    if config.stop_signal().is_stopped() {
        return true;
    }

    if let Some(limit) = config.terminate_after {
        if start.elapsed() >= limit {
            log::info!("Wall clock limit of {limit:?} reached");
            return true;
        }
    }

    let terminator = config.terminator_path();
    if terminator.exists() {
        if let Err(e) = std::fs::remove_file(terminator) {
            log::warn!("Failed to consume terminator file: {e:?}");
        }
        return true;
    }

    false
}

/// Collects worker result streams until every worker has sent its
/// `Finished` sentinel.
fn collect_results(results_rx: &Receiver<WorkerResult>, num_workers: usize) -> Vec<Topology> {
    let mut topologies = vec![];
    let mut finished = 0usize;

    while finished < num_workers {
        match results_rx.recv_timeout(RESULT_COLLECT_TIMEOUT) {
            Ok(WorkerResult::Topology(topology)) => topologies.push(topology),
            Ok(WorkerResult::Finished) => finished += 1,
            Err(_) => {
                log::error!(
                    "Gave up waiting for worker results ({finished}/{num_workers} finished)",
                );
                break;
            }
        }
    }

    topologies
}

fn finalize_results(mut results: Vec<Topology>, k: usize) -> Vec<Topology> {
    results.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.newick.cmp(&b.newick)));
    results.dedup_by(|a, b| a.newick == b.newick);
    results.truncate(k);
    results
}

/// Archives everything still in flight: the inbound queue (fed by workers
/// draining their frontiers through their FIFOs), the shared encountered
/// set, and every accepted topology.
fn write_save(
    config: &Config,
    ctx: &Context,
    inbound_rx: &Receiver<InboundItem>,
    results_rx: &Receiver<WorkerResult>,
    encountered: &SharedEncountered,
    pre_accepted: Vec<Topology>,
    num_workers: usize,
) -> crate::Result<()> {
    let mut unfinished: Vec<CompressedAssembly> = vec![];

    loop {
        match inbound_rx.try_recv() {
            Ok(InboundItem::Assembly(compressed)) => unfinished.push(compressed),
            Ok(InboundItem::FifoDrained) => {}
            Err(TryRecvError::Empty) => {
                // Workers may still be flushing through their FIFOs; only a
                // sustained quiet period means the drain is done
                match inbound_rx.recv_timeout(SAVE_QUEUE_QUIET_PERIOD) {
                    Ok(InboundItem::Assembly(compressed)) => unfinished.push(compressed),
                    Ok(InboundItem::FifoDrained) => {}
                    Err(_) => break,
                }
            }
            Err(TryRecvError::Disconnected) => break,
        }
    }

    let mut accepted = pre_accepted;
    accepted.extend(collect_results(results_rx, num_workers));
    accepted.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.newick.cmp(&b.newick)));
    accepted.dedup_by(|a, b| a.newick == b.newick);

    save::write_archive(
        &config.save_file_name,
        ctx,
        &unfinished,
        &encountered.snapshot(),
        &accepted,
    )?;

    Ok(())
}
