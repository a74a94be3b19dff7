// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{SpillFile, SpillOptions};
use std::collections::VecDeque;

/// Single-producer, single-consumer on-disk FIFO of opaque binary payloads.
///
/// Lives in its own temporary workspace directory. Writes append to the
/// newest backing file and roll over to a fresh one once it outgrows
/// `max_file_size` (checked every `size_check_delay` writes); reads drain
/// the oldest file and advance through the spool, unlinking files as they
/// are exhausted.
///
/// `pop` returning `None` means "no data right now", not end of stream;
/// the caller is expected to know when the producer is done.
pub struct SpillFifo {
    workspace: tempfile::TempDir,
    opts: SpillOptions,

    /// Front = current read file, back = current write file; a single
    /// element serves as both
    files: VecDeque<SpillFile>,

    next_seq: u32,
    out_started: bool,
    in_started: bool,
}

impl SpillFifo {
    /// Sets up the workspace directory. Neither end is started yet.
    pub fn new(opts: SpillOptions) -> crate::Result<Self> {
        let workspace = opts.create_workspace()?;
        log::debug!("Spill FIFO workspace at {:?}", workspace.path());

        Ok(Self {
            workspace,
            opts,
            files: VecDeque::new(),
            next_seq: 0,
            out_started: false,
            in_started: false,
        })
    }

    /// Starts the reading end, creating the first backing file.
    ///
    /// Must be called exactly once, before [`SpillFifo::start_in_end`].
    pub fn start_out_end(&mut self) -> crate::Result<()> {
        debug_assert!(!self.out_started, "reading end started twice");

        let file = SpillFile::create(self.workspace.path(), self.next_seq)?;
        self.next_seq += 1;
        self.files.push_back(file);
        self.out_started = true;
        Ok(())
    }

    /// Starts the writing end on the file the reading end created.
    ///
    /// Must be called exactly once, after [`SpillFifo::start_out_end`].
    pub fn start_in_end(&mut self) -> crate::Result<()> {
        debug_assert!(self.out_started, "reading end must start first");
        debug_assert!(!self.in_started, "writing end started twice");

        if let Some(file) = self.files.back_mut() {
            file.open_writer()?;
        }
        self.in_started = true;
        Ok(())
    }

    /// Number of backing files currently on disk.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Appends one payload, rolling over to a fresh backing file when the
    /// current one has outgrown its cap.
    pub fn push(&mut self, payload: &[u8]) -> crate::Result<()> {
        self.maybe_roll_over()?;

        if let Some(file) = self.files.back_mut() {
            file.write_frame(payload)?;
        }
        Ok(())
    }

    fn maybe_roll_over(&mut self) -> crate::Result<()> {
        let Some(file) = self.files.back_mut() else {
            return Ok(());
        };

        if file.size(self.opts.size_check_delay)? > self.opts.max_file_size {
            file.close_writer()?;

            let mut fresh = SpillFile::create(self.workspace.path(), self.next_seq)?;
            self.next_seq += 1;
            fresh.open_writer()?;

            log::trace!("Spill FIFO rolled over to {:?}", fresh.path());
            self.files.push_back(fresh);
        }

        Ok(())
    }

    /// Takes the oldest remaining payload, or `None` if no data is visible
    /// right now.
    ///
    /// On end of the current read file, advances to the next spooled file
    /// (if any), unlinking the exhausted one.
    pub fn pop(&mut self) -> crate::Result<Option<Vec<u8>>> {
        let Some(file) = self.files.front_mut() else {
            return Ok(None);
        };

        if let Some(payload) = file.read_frame()? {
            return Ok(Some(payload));
        }

        // At EOF with another file spooled, the writer has moved on, so the
        // current read file is complete and safe to drop
        if self.files.len() > 1 {
            if let Some(exhausted) = self.files.pop_front() {
                log::trace!("Spill FIFO dropping exhausted file {:?}", exhausted.path());
                exhausted.discard()?;
            }

            if let Some(file) = self.files.front_mut() {
                return file.read_frame().map_err(Into::into);
            }
        }

        Ok(None)
    }

    /// Removes all remaining backing files and the workspace directory.
    pub fn close(mut self) -> crate::Result<()> {
        while let Some(file) = self.files.pop_front() {
            file.discard()?;
        }
        self.workspace.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn tiny_fifo(max_file_size: u64) -> crate::Result<SpillFifo> {
        let mut fifo = SpillFifo::new(SpillOptions {
            max_file_size,
            size_check_delay: 0,
            dir: None,
        })?;
        fifo.start_out_end()?;
        fifo.start_in_end()?;
        Ok(fifo)
    }

    #[test]
    fn fifo_order_preserved() -> crate::Result<()> {
        let mut fifo = tiny_fifo(1_024 * 1_024)?;

        for i in 0..50u32 {
            fifo.push(&i.to_le_bytes())?;
        }
        for i in 0..50u32 {
            assert_eq!(Some(i.to_le_bytes().to_vec()), fifo.pop()?);
        }
        assert_eq!(None, fifo.pop()?);

        fifo.close()
    }

    #[test]
    fn interleaved_push_pop() -> crate::Result<()> {
        let mut fifo = tiny_fifo(64)?;

        let mut next_push = 0u32;
        let mut next_pop = 0u32;
        while next_pop < 40 {
            if next_push < 40 {
                fifo.push(&next_push.to_le_bytes())?;
                next_push += 1;
                fifo.push(&next_push.to_le_bytes())?;
                next_push += 1;
            }

            if let Some(payload) = fifo.pop()? {
                assert_eq!(next_pop.to_le_bytes().to_vec(), payload);
                next_pop += 1;
            }
        }

        fifo.close()
    }

    #[test]
    fn rollover_file_lifecycle() -> crate::Result<()> {
        // Each frame is 1 length byte + 4 payload bytes; a cap of 17 bytes
        // holds 4 frames (20 bytes) before the size check trips
        let mut fifo = tiny_fifo(17)?;

        for i in 0..10u32 {
            fifo.push(&i.to_le_bytes())?;

            if i == 4 {
                assert_eq!(2, fifo.file_count());
            }
        }
        assert_eq!(3, fifo.file_count());

        for i in 0..10u32 {
            assert_eq!(Some(i.to_le_bytes().to_vec()), fifo.pop()?);

            // Exhausted files are only discarded once a read attempt hits
            // their EOF, so the first file goes at the fifth pop
            if i == 4 {
                assert_eq!(2, fifo.file_count());
            }
        }
        assert_eq!(1, fifo.file_count());

        let workspace = fifo.workspace.path().to_path_buf();
        fifo.close()?;
        assert!(!workspace.exists());

        Ok(())
    }

    #[test]
    fn rollover_on_every_push_when_cap_below_frame() -> crate::Result<()> {
        let mut fifo = tiny_fifo(1)?;

        for i in 0..10u32 {
            fifo.push(&[i as u8; 16])?;
        }
        assert!(fifo.file_count() >= 9);

        for i in 0..10u32 {
            assert_eq!(Some(vec![i as u8; 16]), fifo.pop()?);
        }
        assert_eq!(None, fifo.pop()?);
        assert_eq!(1, fifo.file_count());

        fifo.close()
    }

    #[test]
    fn pop_sees_data_written_after_eof_probe() -> crate::Result<()> {
        let mut fifo = tiny_fifo(1_024)?;

        assert_eq!(None, fifo.pop()?);
        fifo.push(b"later")?;
        assert_eq!(Some(b"later".to_vec()), fifo.pop()?);

        fifo.close()
    }
}
