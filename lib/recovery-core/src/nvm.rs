// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ownership of the flash controller's unlocked state.

use drv_recovery_api::{NvmError, NvmWriter};
use ringbuf::*;

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Acquired,
    Released,
}

ringbuf!(Trace, 8, Trace::None);

/// Wraps the writer and tracks whether flash is unlocked.
///
/// Flash programming goes through the lease and is refused while locked.
/// Acquiring and releasing are idempotent, and dropping the lease relocks
/// the flash.
pub struct NvmLease<W: NvmWriter> {
    writer: W,
    unlocked: bool,
}

impl<W: NvmWriter> NvmLease<W> {
    /// Takes the writer, assuming flash is locked as it is out of reset.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            unlocked: false,
        }
    }

    pub fn acquire(&mut self) {
        if !self.unlocked {
            ringbuf_entry!(Trace::Acquired);
            self.writer.unlock();
            self.unlocked = true;
        }
    }

    pub fn release(&mut self) {
        if self.unlocked {
            ringbuf_entry!(Trace::Released);
            self.writer.lock();
            self.unlocked = false;
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked
    }

    pub fn program_block(
        &mut self,
        address: u32,
        data: &[u8],
    ) -> Result<(), NvmError> {
        if !self.unlocked {
            return Err(NvmError::Locked);
        }
        self.writer.program_block(address, data)
    }

    /// The EEPROM has no lock of its own and can be written at any time.
    pub fn write_eeprom_block(
        &mut self,
        offset: u32,
        data: &[u8],
    ) -> Result<(), NvmError> {
        self.writer.write_eeprom_block(offset, data)
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }
}

impl<W: NvmWriter> Drop for NvmLease<W> {
    fn drop(&mut self) {
        self.release();
    }
}
