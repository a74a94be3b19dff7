// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{SpillFile, SpillOptions};
use crate::event::Event;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering::Relaxed},
        Arc, Mutex, MutexGuard,
    },
    thread::JoinHandle,
    time::Duration,
};

const ROLLOVER_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_BATON_TIMEOUT: Duration = Duration::from_secs(30);
const SPOOLER_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// [`super::SpillFifo`] with the two ends held by different threads: a
/// single producer (the worker draining its frontier) and a single
/// consumer (its queue loader).
///
/// A mutex guards push and pop; a data-available event lets the consumer
/// block instead of spinning. Backing files are only ever created on the
/// consumer side: a spooler thread polls for rollover requests, creates
/// the next file and hands it back, with the producer blocking briefly on
/// that exchange.
///
/// Teardown runs in two steps so no push can race against directory
/// removal: the consumer discards the backing files first and passes a
/// baton; the producer waits on the baton, then removes the workspace
/// directory.
#[derive(Clone)]
pub struct SharedSpillFifo {
    inner: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    opts: SpillOptions,

    /// Set on push; cleared when a pop comes up empty
    data_available: Event,

    /// Baton, first leg: the producer has stopped pushing for good
    producer_released: Event,

    /// Baton, second leg: the consumer has discarded the backing files
    consumer_done: Event,

    /// Producer -> spooler: "create the next backing file"
    roll_req_tx: crossbeam_channel::Sender<()>,
    roll_req_rx: crossbeam_channel::Receiver<()>,

    /// Spooler -> producer: the created file
    roll_reply_tx: crossbeam_channel::Sender<SpillFile>,
    roll_reply_rx: crossbeam_channel::Receiver<SpillFile>,

    /// Consumer -> producer: the first backing file is ready
    first_file_tx: crossbeam_channel::Sender<()>,
    first_file_rx: crossbeam_channel::Receiver<()>,

    spooler_stop: AtomicBool,
}

struct State {
    workspace: Option<tempfile::TempDir>,

    /// Front = current read file, back = current write file
    files: VecDeque<SpillFile>,

    spooler: Option<JoinHandle<()>>,
}

impl SharedSpillFifo {
    pub fn new(opts: SpillOptions) -> crate::Result<Self> {
        let workspace = opts.create_workspace()?;
        log::debug!("Shared spill FIFO workspace at {:?}", workspace.path());

        let (roll_req_tx, roll_req_rx) = crossbeam_channel::bounded(1);
        let (roll_reply_tx, roll_reply_rx) = crossbeam_channel::bounded(1);
        let (first_file_tx, first_file_rx) = crossbeam_channel::bounded(1);

        Ok(Self {
            inner: Arc::new(Shared {
                state: Mutex::new(State {
                    workspace: Some(workspace),
                    files: VecDeque::new(),
                    spooler: None,
                }),
                opts,
                data_available: Event::new(),
                producer_released: Event::new(),
                consumer_done: Event::new(),
                roll_req_tx,
                roll_req_rx,
                roll_reply_tx,
                roll_reply_rx,
                first_file_tx,
                first_file_rx,
                spooler_stop: AtomicBool::new(false),
            }),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        let state = self.inner.state.lock().expect("lock is poisoned");
        state
    }

    /// Starts the reading end: creates the first backing file, hands its
    /// name to the writing end and starts the spooler thread.
    ///
    /// Must be called exactly once, from the consumer thread.
    pub fn start_out_end(&self) -> crate::Result<()> {
        let mut state = self.lock_state();

        let dir = state
            .workspace
            .as_ref()
            .map(|w| w.path().to_path_buf())
            .ok_or(crate::Error::SpoolerUnavailable)?;

        let first = SpillFile::create(&dir, 0)?;
        state.files.push_back(first);

        let spooler = {
            let shared = self.inner.clone();
            std::thread::spawn(move || spooler_loop(&shared, &dir))
        };
        state.spooler = Some(spooler);

        drop(state);

        self.inner.first_file_tx.send(()).ok();
        Ok(())
    }

    /// Starts the writing end once the reading end has created the first
    /// backing file.
    ///
    /// Must be called exactly once, from the producer thread.
    pub fn start_in_end(&self) -> crate::Result<()> {
        self.inner
            .first_file_rx
            .recv_timeout(ROLLOVER_EXCHANGE_TIMEOUT)
            .map_err(|_| crate::Error::SpoolerUnavailable)?;

        let mut state = self.lock_state();
        if let Some(file) = state.files.back_mut() {
            file.open_writer()?;
        }
        Ok(())
    }

    /// Whether the data-available flag is set (payloads may be pending).
    #[must_use]
    pub fn is_data_available(&self) -> bool {
        self.inner.data_available.is_set()
    }

    /// Sets the data-available flag without pushing, to release a consumer
    /// blocked in [`SharedSpillFifo::pop`] during shutdown.
    pub fn set_data_available(&self) {
        self.inner.data_available.set();
    }

    #[must_use]
    pub fn file_count(&self) -> usize {
        self.lock_state().files.len()
    }

    /// Appends one payload and flags data availability.
    pub fn push(&self, payload: &[u8]) -> crate::Result<()> {
        {
            let mut state = self.lock_state();
            self.push_locked(&mut state, payload)?;
        }
        self.inner.data_available.set();
        Ok(())
    }

    /// Appends a batch under a single lock acquisition.
    pub fn push_all<'a>(&self, payloads: impl IntoIterator<Item = &'a [u8]>) -> crate::Result<()> {
        {
            let mut state = self.lock_state();
            for payload in payloads {
                self.push_locked(&mut state, payload)?;
            }
        }
        self.inner.data_available.set();
        Ok(())
    }

    fn push_locked(&self, state: &mut State, payload: &[u8]) -> crate::Result<()> {
        let Some(file) = state.files.back_mut() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "reading end not started",
            )
            .into());
        };

        let needs_rollover =
            file.size(self.inner.opts.size_check_delay)? > self.inner.opts.max_file_size;

        if needs_rollover {
            // The next file has to come from the consumer side; block on
            // the spooler exchange
            self.inner
                .roll_req_tx
                .send(())
                .map_err(|_| crate::Error::SpoolerUnavailable)?;

            let mut fresh = self
                .inner
                .roll_reply_rx
                .recv_timeout(ROLLOVER_EXCHANGE_TIMEOUT)
                .map_err(|_| crate::Error::SpoolerUnavailable)?;

            if let Some(file) = state.files.back_mut() {
                file.close_writer()?;
            }
            fresh.open_writer()?;

            log::trace!("Shared spill FIFO rolled over to {:?}", fresh.path());
            state.files.push_back(fresh);
        }

        if let Some(file) = state.files.back_mut() {
            file.write_frame(payload)?;
        }
        Ok(())
    }

    /// Takes the oldest remaining payload, waiting up to `timeout` for the
    /// data-available flag.
    ///
    /// Returns `None` both for "no data yet" and after the stream ended;
    /// the caller disambiguates via the data-available flag and its own
    /// interrupt state.
    pub fn pop(&self, timeout: Duration) -> crate::Result<Option<Vec<u8>>> {
        if !self.inner.data_available.wait_timeout(timeout) {
            return Ok(None);
        }

        let popped = {
            let mut state = self.lock_state();
            Self::pop_locked(&mut state)?
        };

        if popped.is_none() {
            self.inner.data_available.clear();
        }
        Ok(popped)
    }

    fn pop_locked(state: &mut State) -> crate::Result<Option<Vec<u8>>> {
        let Some(file) = state.files.front_mut() else {
            return Ok(None);
        };

        if let Some(payload) = file.read_frame()? {
            return Ok(Some(payload));
        }

        if state.files.len() > 1 {
            if let Some(exhausted) = state.files.pop_front() {
                log::trace!(
                    "Shared spill FIFO dropping exhausted file {:?}",
                    exhausted.path(),
                );
                exhausted.discard()?;
            }

            if let Some(file) = state.files.front_mut() {
                return file.read_frame().map_err(Into::into);
            }
        }

        Ok(None)
    }

    /// Closes the reading end: stops the spooler, waits for the producer
    /// to stop pushing, discards the backing files and passes the baton.
    ///
    /// Must be called from the consumer thread, before the producer's
    /// [`SharedSpillFifo::close_in`] completes.
    pub fn close_out(&self) -> crate::Result<()> {
        self.inner.spooler_stop.store(true, Relaxed);
        let spooler = self.lock_state().spooler.take();
        if let Some(spooler) = spooler {
            spooler.join().ok();
        }

        if !self
            .inner
            .producer_released
            .wait_timeout(SHUTDOWN_BATON_TIMEOUT)
        {
            log::warn!("Spill FIFO producer did not release in time; discarding files anyway");
        }

        let mut result = Ok(());
        {
            let mut state = self.lock_state();
            while let Some(file) = state.files.pop_front() {
                if let Err(e) = file.discard() {
                    log::error!("Failed to discard spill file: {e:?}");
                    result = Err(e.into());
                }
            }
        }

        self.inner.consumer_done.set();
        result
    }

    /// Closes the writing end and, once the consumer has discarded the
    /// backing files, removes the workspace directory.
    ///
    /// Must be called from the producer thread.
    pub fn close_in(&self) -> crate::Result<()> {
        {
            let mut state = self.lock_state();
            if let Some(file) = state.files.back_mut() {
                file.close_writer()?;
            }
        }

        // Free a consumer blocked in pop so it can observe shutdown
        self.inner.data_available.set();
        self.inner.producer_released.set();

        if !self.inner.consumer_done.wait_timeout(SHUTDOWN_BATON_TIMEOUT) {
            log::warn!("Spill FIFO consumer did not close in time; removing workspace anyway");
        }

        let workspace = self.lock_state().workspace.take();
        if let Some(workspace) = workspace {
            workspace.close()?;
        }
        Ok(())
    }
}

/// Consumer-side helper: creates rollover files on request from the
/// producer and hands them back by handle.
fn spooler_loop(shared: &Shared, dir: &std::path::Path) {
    let mut next_seq = 1u32;

    while !shared.spooler_stop.load(Relaxed) {
        match shared.roll_req_rx.recv_timeout(SPOOLER_POLL_INTERVAL) {
            Ok(()) => match SpillFile::create(dir, next_seq) {
                Ok(file) => {
                    next_seq += 1;
                    if shared.roll_reply_tx.send(file).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    log::error!("Spooler failed to create spill file: {e:?}");
                    return;
                }
            },
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn shared_fifo(max_file_size: u64) -> crate::Result<SharedSpillFifo> {
        SharedSpillFifo::new(SpillOptions {
            max_file_size,
            size_check_delay: 0,
            dir: None,
        })
    }

    #[test]
    fn push_pop_same_thread_pair() -> crate::Result<()> {
        let fifo = shared_fifo(1_024 * 1_024)?;
        fifo.start_out_end()?;
        fifo.start_in_end()?;

        fifo.push(b"one")?;
        fifo.push(b"two")?;
        assert!(fifo.is_data_available());

        assert_eq!(Some(b"one".to_vec()), fifo.pop(Duration::from_millis(10))?);
        assert_eq!(Some(b"two".to_vec()), fifo.pop(Duration::from_millis(10))?);

        // Coming up empty clears the data-available flag
        assert_eq!(None, fifo.pop(Duration::from_millis(10))?);
        assert!(!fifo.is_data_available());

        let consumer = fifo.clone();
        let handle = std::thread::spawn(move || consumer.close_out());
        fifo.close_in()?;
        handle.join().expect("consumer should not panic")?;

        Ok(())
    }

    #[test]
    fn pop_blocks_until_push() -> crate::Result<()> {
        let fifo = shared_fifo(1_024 * 1_024)?;
        fifo.start_out_end()?;
        fifo.start_in_end()?;

        let consumer = fifo.clone();
        let handle =
            std::thread::spawn(move || -> crate::Result<Option<Vec<u8>>> {
                consumer.pop(Duration::from_secs(10))
            });

        std::thread::sleep(Duration::from_millis(30));
        fifo.push(b"wakeup")?;

        assert_eq!(
            Some(b"wakeup".to_vec()),
            handle.join().expect("consumer should not panic")?,
        );

        let consumer = fifo.clone();
        let handle = std::thread::spawn(move || consumer.close_out());
        fifo.close_in()?;
        handle.join().expect("consumer should not panic")?;

        Ok(())
    }

    #[test]
    fn cross_thread_rollover_preserves_order() -> crate::Result<()> {
        // Frames are 1 + 8 bytes; a 25-byte cap forces a rollover roughly
        // every third push, well over three rollovers for 64 payloads
        let fifo = shared_fifo(25)?;

        let workspace = {
            let state = fifo.lock_state();
            state
                .workspace
                .as_ref()
                .map(|w| w.path().to_path_buf())
                .expect("workspace should exist")
        };

        let consumer = fifo.clone();
        let consumer_handle = std::thread::spawn(move || -> crate::Result<Vec<u64>> {
            consumer.start_out_end()?;

            let mut seen = vec![];
            while seen.len() < 64 {
                if let Some(payload) = consumer.pop(Duration::from_millis(100))? {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(&payload);
                    seen.push(u64::from_le_bytes(buf));
                }
            }

            consumer.close_out()?;
            Ok(seen)
        });

        fifo.start_in_end()?;
        for i in 0..64u64 {
            fifo.push(&i.to_le_bytes())?;
        }
        fifo.close_in()?;

        let seen = consumer_handle.join().expect("consumer should not panic")?;
        assert_eq!((0..64).collect::<Vec<u64>>(), seen);

        assert!(!workspace.exists());

        Ok(())
    }
}
