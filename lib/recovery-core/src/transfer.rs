// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Chunked copy from an image file into flash or EEPROM.
//!
//! A transfer moves one block per call to [`ChunkedWriter::step`]: the block
//! staged by the previous step (or by [`ChunkedWriter::prime`]) is written,
//! then the next one is read. This keeps each main-loop iteration short
//! enough for the watchdog and lets the screen show progress.
//!
//! The destination never receives more than the target's backstop, no matter
//! what the source holds. Flash is written in whole pages; a short final
//! block is padded with the erased value.

use drv_recovery_api::{
    CompletionReason, MemoryTarget, NvmWriter, Storage, StorageError,
};

use crate::config::{BoardConfig, BLOCK_LEN};
use crate::nvm::NvmLease;

/// Value of erased flash.
const ERASED: u8 = 0xFF;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Stage {
    Empty,
    /// Holds this many bytes of source data.
    Staged(usize),
}

/// The transfer buffer: [`BLOCK_LEN`] bytes plus whether they hold data not
/// yet written.
pub struct StagedBlock {
    buf: [u8; BLOCK_LEN],
    stage: Stage,
}

impl StagedBlock {
    pub const fn new() -> Self {
        Self {
            buf: [0; BLOCK_LEN],
            stage: Stage::Empty,
        }
    }

    /// Reads the next block from `file`, returning the number of bytes
    /// staged. Short reads are retried until the buffer is full or the file
    /// ends, so only the final block of a file is ever partial.
    pub fn fill<S: Storage>(
        &mut self,
        storage: &mut S,
        file: &mut S::File,
    ) -> Result<usize, StorageError> {
        self.stage = Stage::Empty;
        let mut len = 0;
        while len < BLOCK_LEN {
            let n = storage.read_block(file, &mut self.buf[len..])?;
            if n == 0 {
                break;
            }
            len += n.min(BLOCK_LEN - len);
        }
        if len > 0 {
            self.stage = Stage::Staged(len);
        }
        Ok(len)
    }

    pub fn data(&self) -> &[u8] {
        match self.stage {
            Stage::Empty => &[],
            Stage::Staged(len) => &self.buf[..len],
        }
    }

    pub fn drain(&mut self) {
        self.stage = Stage::Empty;
    }

    /// Returns the first `len` staged bytes padded with the erased value to a
    /// multiple of `page`.
    fn padded(&mut self, len: usize, page: usize) -> &[u8] {
        let end = len.next_multiple_of(page).min(BLOCK_LEN);
        self.buf[len..end].fill(ERASED);
        &self.buf[..end]
    }
}

impl Default for StagedBlock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TransferProgress {
    pub bytes_written: u32,
    pub total_size: u32,
    /// Whether the flash controller is unlocked.
    pub unlocked: bool,
}

impl TransferProgress {
    /// Percent complete, clamped to 100.
    pub fn percent(&self) -> u8 {
        if self.total_size == 0 {
            return 100;
        }
        let pct =
            u64::from(self.bytes_written) * 100 / u64::from(self.total_size);
        pct.min(100) as u8
    }
}

pub struct ChunkedWriter {
    target: MemoryTarget,
    destination: u32,
    backstop: u32,
    page_size: u32,
    written: u32,
    total: u32,
    block: StagedBlock,
}

impl ChunkedWriter {
    pub const fn new() -> Self {
        Self {
            target: MemoryTarget::Flash,
            destination: 0,
            backstop: 0,
            page_size: 1,
            written: 0,
            total: 0,
            block: StagedBlock::new(),
        }
    }

    /// Sets up a transfer of an image file of `file_size` bytes to
    /// `target`.
    pub fn begin(
        &mut self,
        target: MemoryTarget,
        file_size: u32,
        config: &BoardConfig,
    ) {
        self.target = target;
        self.destination = config.destination(target);
        self.backstop = config.backstop(target);
        self.page_size = config.flash.page_size.max(1);
        self.written = 0;
        self.total = file_size.saturating_sub(config.header_len(target));
        self.block.drain();
    }

    /// Stages the first block. `file` must be positioned at the payload.
    pub fn prime<S: Storage>(
        &mut self,
        storage: &mut S,
        file: &mut S::File,
    ) -> Result<usize, StorageError> {
        self.block.fill(storage, file)
    }

    /// The staged block, for checking the image signature before the
    /// first write.
    pub fn staged(&self) -> &[u8] {
        self.block.data()
    }

    /// Writes the staged block and stages the next one. Returns the reason
    /// the transfer is over, or `None` if there is more to do.
    pub fn step<S: Storage, W: NvmWriter>(
        &mut self,
        storage: &mut S,
        file: &mut S::File,
        nvm: &mut NvmLease<W>,
    ) -> Option<CompletionReason> {
        let remaining = self.backstop.saturating_sub(self.written);
        let len = self.block.data().len().min(remaining as usize);
        if len > 0 {
            let at = self.destination + self.written;
            let r = match self.target {
                MemoryTarget::Flash => {
                    let page = self.page_size as usize;
                    nvm.program_block(at, self.block.padded(len, page))
                }
                MemoryTarget::Eeprom => {
                    nvm.write_eeprom_block(at, &self.block.data()[..len])
                }
            };
            if let Err(e) = r {
                self.block.drain();
                return Some(CompletionReason::WriteFault(e));
            }
            self.written += len as u32;
        }
        self.block.drain();

        // Nothing past the backstop is read, let alone written.
        if self.written >= self.backstop {
            return Some(CompletionReason::Backstop);
        }

        match self.block.fill(storage, file) {
            Err(e) => Some(CompletionReason::ReadError(e)),
            Ok(0) => Some(CompletionReason::EndOfSource),
            Ok(_) => None,
        }
    }

    pub fn bytes_written(&self) -> u32 {
        self.written
    }

    pub fn total_size(&self) -> u32 {
        self.total
    }
}

impl Default for ChunkedWriter {
    fn default() -> Self {
        Self::new()
    }
}
