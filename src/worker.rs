// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    assembly::{Assembly, CompressedAssembly},
    context::Context,
    coordinator::Topology,
    encountered::Encountered,
    event::Event,
    min_score::MinScoreCell,
    spill::{SharedSpillFifo, SpillOptions},
    stop_signal::StopSignal,
    workspace::{Flow, InboundItem, Workspace, WorkspaceOptions},
};
use crossbeam_channel::{Receiver, SendTimeoutError, Sender};
use std::{sync::Arc, thread::JoinHandle, time::Duration};

const FIFO_POP_TIMEOUT: Duration = Duration::from_secs(1);
const QUEUE_FORWARD_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// One message on the results queue
pub(crate) enum WorkerResult {
    Topology(Topology),

    /// Terminates one worker's result stream
    Finished,
}

pub(crate) struct WorkerOptions {
    pub id: usize,
    pub ctx: Arc<Context>,
    pub seed: Option<CompressedAssembly>,
    pub encountered: Arc<dyn Encountered>,
    pub min_score: MinScoreCell,
    pub inbound_tx: Sender<InboundItem>,
    pub inbound_rx: Receiver<InboundItem>,
    pub scores_tx: Sender<f64>,
    pub results_tx: Sender<WorkerResult>,
    pub max_workspace_size: usize,
    pub acceptance_ratio_param: f64,
    pub acceptance_stiffness_param: f64,
    pub spill: SpillOptions,
}

/// Coordinator-side handle to one worker thread
pub(crate) struct WorkerHandle {
    pub interrupt: StopSignal,
    pub finished: Arc<Event>,
    pub shutdown: Arc<Event>,
    pub join: JoinHandle<()>,
}

/// Spawns one worker with its queue-loader helper.
pub(crate) fn spawn(opts: WorkerOptions) -> crate::Result<WorkerHandle> {
    let interrupt = StopSignal::default();
    let finished = Arc::new(Event::new());
    let shutdown = Arc::new(Event::new());

    let join = {
        let interrupt = interrupt.clone();
        let finished = finished.clone();
        let shutdown = shutdown.clone();

        std::thread::Builder::new()
            .name(format!("assembler-{:03}", opts.id))
            .spawn(move || worker_main(opts, &interrupt, &finished, &shutdown))?
    };

    Ok(WorkerHandle {
        interrupt,
        finished,
        shutdown,
        join,
    })
}

fn worker_main(opts: WorkerOptions, interrupt: &StopSignal, finished: &Event, shutdown: &Event) {
    let id = opts.id;
    let results_tx = opts.results_tx.clone();

    let mut results_emitted = false;
    if let Err(e) = run(opts, interrupt, finished, shutdown, &mut results_emitted) {
        log::error!("Worker {id} aborting: {e:?}");
    }

    if !results_emitted {
        results_tx.send(WorkerResult::Finished).ok();
    }
}

fn run(
    opts: WorkerOptions,
    interrupt: &StopSignal,
    finished: &Event,
    shutdown: &Event,
    results_emitted: &mut bool,
) -> crate::Result<()> {
    let fifo = SharedSpillFifo::new(opts.spill.clone())?;
    let close_fifo = StopSignal::default();

    let loader = {
        let fifo = fifo.clone();
        let close_fifo = close_fifo.clone();
        let inbound_tx = opts.inbound_tx.clone();

        std::thread::Builder::new()
            .name(format!("assembler-{:03}-queue-loader", opts.id))
            .spawn(move || queue_loader(&fifo, &close_fifo, &inbound_tx))
    }?;

    fifo.start_in_end()?;

    let mut workspace = Workspace::new(
        WorkspaceOptions {
            ctx: opts.ctx.clone(),
            encountered: opts.encountered.clone(),
            min_score: opts.min_score.clone(),
            inbound: opts.inbound_rx.clone(),
            scores: opts.scores_tx.clone(),
            fifo: fifo.clone(),
            max_workspace_size: opts.max_workspace_size,
            acceptance_ratio_param: opts.acceptance_ratio_param,
            acceptance_stiffness_param: opts.acceptance_stiffness_param,
        },
        None,
    );

    // The seed has to be rebuilt inside the workspace's own arena
    if let Some(compressed) = &opts.seed {
        match Assembly::uncompress(compressed, &opts.ctx, workspace.arena_mut()) {
            Ok(seed) => workspace.admit_seed(seed),
            Err(e) => {
                teardown(&fifo, &close_fifo, loader);
                return Err(e);
            }
        }
    }

    log::debug!("Worker {} starting", opts.id);

    let result = work_loop(
        &mut workspace,
        &fifo,
        interrupt,
        finished,
        shutdown,
        &opts.results_tx,
        results_emitted,
    );

    if !*results_emitted {
        emit_results(&mut workspace, &opts.results_tx);
        *results_emitted = true;
    }

    teardown(&fifo, &close_fifo, loader);
    log::debug!("Worker {} done", opts.id);
    result
}

fn work_loop(
    workspace: &mut Workspace,
    fifo: &SharedSpillFifo,
    interrupt: &StopSignal,
    finished: &Event,
    shutdown: &Event,
    results_tx: &Sender<WorkerResult>,
    results_emitted: &mut bool,
) -> crate::Result<()> {
    while !shutdown.is_set() {
        let flow = workspace.iterate(interrupt)?;

        if interrupt.is_stopped() {
            // Frontier is already drained to the FIFO; release the loader
            // so the spilled work reaches the coordinator's save
            fifo.set_data_available();
            emit_results(workspace, results_tx);
            *results_emitted = true;
            shutdown.wait();
            break;
        }

        match flow {
            Flow::Finished => {
                finished.set();
                if shutdown.wait_timeout(SHUTDOWN_GRACE) {
                    emit_results(workspace, results_tx);
                    *results_emitted = true;
                    break;
                }
            }
            Flow::Continue => {
                // Work arrived after the finished flag went up
                if finished.is_set() {
                    finished.clear();
                }
            }
        }
    }

    Ok(())
}

fn emit_results(workspace: &mut Workspace, results_tx: &Sender<WorkerResult>) {
    for assembly in workspace.take_accepted() {
        if let Some(newick) = assembly.newick() {
            results_tx
                .send(WorkerResult::Topology(Topology {
                    score: assembly.score(),
                    newick,
                }))
                .ok();
        }
    }
    results_tx.send(WorkerResult::Finished).ok();
}

fn teardown(fifo: &SharedSpillFifo, close_fifo: &StopSignal, loader: JoinHandle<()>) {
    close_fifo.send();

    if let Err(e) = fifo.close_in() {
        log::error!("Failed to close spill FIFO writing end: {e:?}");
    }
    if loader.join().is_err() {
        log::error!("Queue loader panicked");
    }
}

/// Consumer end of one worker's FIFO: forwards spilled assemblies into the
/// shared inbound queue so overflow from one worker can reach another.
fn queue_loader(fifo: &SharedSpillFifo, close_fifo: &StopSignal, inbound_tx: &Sender<InboundItem>) {
    if let Err(e) = fifo.start_out_end() {
        log::error!("Queue loader failed to start FIFO reading end: {e:?}");
        return;
    }

    'outer: while !close_fifo.is_stopped() {
        let payload = match fifo.pop(FIFO_POP_TIMEOUT) {
            Ok(Some(payload)) => payload,
            Ok(None) => continue,
            Err(e) => {
                log::error!("Queue loader failed to pop: {e:?}");
                break;
            }
        };

        let compressed = match CompressedAssembly::from_bytes(payload) {
            Ok(compressed) => compressed,
            Err(e) => {
                log::error!("Queue loader read a corrupt payload: {e:?}");
                break;
            }
        };

        let mut item = InboundItem::Assembly(compressed);
        loop {
            match inbound_tx.send_timeout(item, QUEUE_FORWARD_TIMEOUT) {
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(unsent)) => {
                    if close_fifo.is_stopped() {
                        break 'outer;
                    }
                    item = unsent;
                }
                Err(SendTimeoutError::Disconnected(_)) => break 'outer,
            }
        }
    }

    // Interrupted with the FIFO drained (or shutting down): let any worker
    // blocked on the queue know this stream is dry
    inbound_tx.try_send(InboundItem::FifoDrained).ok();

    if let Err(e) = fifo.close_out() {
        log::error!("Failed to close spill FIFO reading end: {e:?}");
    }
}
