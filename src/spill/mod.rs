// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod fifo;
pub mod shared;

pub use fifo::SpillFifo;
pub use shared::SharedSpillFifo;

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};
use varint_rs::{VarintReader, VarintWriter};

/// Spill FIFO tuning knobs
#[derive(Clone, Debug)]
pub struct SpillOptions {
    /// Rollover threshold per backing file, in bytes
    pub max_file_size: u64,

    /// How many writes may pass between on-disk size checks
    pub size_check_delay: u32,

    /// Where to create the FIFO workspace directory; system temp dir
    /// when `None`
    pub dir: Option<PathBuf>,
}

impl Default for SpillOptions {
    fn default() -> Self {
        Self {
            max_file_size: /* 1 GiB */ 1_024 * 1_024 * 1_024,
            size_check_delay: 100,
            dir: None,
        }
    }
}

impl SpillOptions {
    pub(crate) fn create_workspace(&self) -> std::io::Result<tempfile::TempDir> {
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix("fifo-workspace-");
            b
        };

        match &self.dir {
            Some(dir) => builder.tempdir_in(dir),
            None => builder.tempdir(),
        }
    }
}

pub(crate) fn spill_file_path(dir: &Path, seq: u32) -> PathBuf {
    dir.join(format!("spill-{seq:03}"))
}

/// One backing file of a spill FIFO, with independent read and write
/// handles and a lazily refreshed size estimate.
#[derive(Debug)]
pub(crate) struct SpillFile {
    path: PathBuf,
    writer: Option<File>,
    reader: File,
    cached_size: u64,
    accesses_since_size_check: u32,
}

impl SpillFile {
    /// Creates the backing file on disk and opens the reading handle.
    pub fn create(dir: &Path, seq: u32) -> std::io::Result<Self> {
        let path = spill_file_path(dir, seq);
        File::create(&path)?;
        let reader = File::open(&path)?;

        Ok(Self {
            path,
            writer: None,
            reader,
            cached_size: 0,
            accesses_since_size_check: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn open_writer(&mut self) -> std::io::Result<()> {
        debug_assert!(self.writer.is_none(), "writing end opened twice");
        self.writer = Some(OpenOptions::new().append(true).open(&self.path)?);
        Ok(())
    }

    /// On-disk size, refreshed at most every `check_delay` calls.
    pub fn size(&mut self, check_delay: u32) -> std::io::Result<u64> {
        if self.accesses_since_size_check >= check_delay {
            self.cached_size = std::fs::metadata(&self.path)?.len();
            self.accesses_since_size_check = 0;
        } else {
            self.accesses_since_size_check += 1;
        }
        Ok(self.cached_size)
    }

    /// Appends one length-delimited payload.
    pub fn write_frame(&mut self, payload: &[u8]) -> std::io::Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "writing end not started",
            ));
        };

        #[expect(clippy::cast_possible_truncation, reason = "payloads are far below 4 GiB")]
        writer.write_u32_varint(payload.len() as u32)?;
        writer.write_all(payload)?;
        writer.flush()
    }

    /// Reads the next length-delimited payload, or `None` at (possibly
    /// transient) end of file.
    ///
    /// The cursor is always restored on a short read. Besides covering
    /// partially visible frames, the seek-back also clears the sticky EOF
    /// state some platforms leave a handle in after reading at the end,
    /// which would otherwise make later reads return nothing even once the
    /// writing side has appended more data.
    pub fn read_frame(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        let pos = self.reader.stream_position()?;

        let result = Self::try_read_frame(&mut self.reader);
        match result {
            Ok(payload) => Ok(Some(payload)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                self.reader.seek(SeekFrom::Start(pos))?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn try_read_frame(reader: &mut File) -> std::io::Result<Vec<u8>> {
        let len = reader.read_u32_varint()? as usize;
        let mut payload = vec![0; len];
        reader.read_exact(&mut payload)?;
        Ok(payload)
    }

    pub fn close_writer(&mut self) -> std::io::Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }

    /// Closes both handles and unlinks the backing file.
    pub fn discard(mut self) -> std::io::Result<()> {
        self.close_writer()?;
        std::fs::remove_file(&self.path)
    }
}
