// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use drv_recovery_api::{NvmError, NvmWriter};
use ringbuf::*;

use crate::eeprom::EepromWrite;

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Unlock,
    Lock,
    Erase(u8),
    ProgramFault { address: u32, err: NvmError },
    EepromFault { offset: u32, err: NvmError },
}

ringbuf!(Trace, 16, Trace::None);

// Each 1 MiB bank is four 16 KiB sectors, one 64 KiB sector and seven
// 128 KiB sectors. Parts with 2 MiB repeat the layout in a second bank.
const BANK_SIZE: u32 = 0x10_0000;
const SECTORS_PER_BANK: u32 = 12;
const SMALL_SECTOR: u32 = 0x4000;
const LARGE_SECTOR: u32 = 0x2_0000;

/// If `offset` (relative to the start of flash) is the first byte of a
/// sector, returns that sector's number.
pub fn sector_start(offset: u32) -> Option<u8> {
    let bank = offset / BANK_SIZE;
    let off = offset % BANK_SIZE;
    let local = match off {
        o if o < 4 * SMALL_SECTOR => {
            if o % SMALL_SECTOR != 0 {
                return None;
            }
            o / SMALL_SECTOR
        }
        o if o < LARGE_SECTOR => {
            if o != 4 * SMALL_SECTOR {
                return None;
            }
            4
        }
        o => {
            if o % LARGE_SECTOR != 0 {
                return None;
            }
            4 + o / LARGE_SECTOR
        }
    };
    u8::try_from(bank * SECTORS_PER_BANK + local).ok()
}

/// Register-level access to the flash controller.
pub trait FlashCtl {
    fn unlock(&mut self);
    fn lock(&mut self);
    fn is_locked(&self) -> bool;
    fn erase_sector(&mut self, sector: u8) -> Result<(), NvmError>;
    fn program_word(&mut self, address: u32, word: u32) -> Result<(), NvmError>;
}

/// Where flash lives and how it is programmed.
#[derive(Copy, Clone, Debug)]
pub struct FlashGeometry {
    pub base: u32,
    pub size: u32,
    /// Programming granularity in bytes; a multiple of 4.
    pub page_size: u32,
}

impl FlashGeometry {
    fn contains(&self, address: u32, len: u32) -> bool {
        let Some(end) = address.checked_add(len) else {
            return false;
        };
        address >= self.base && end <= self.base + self.size
    }
}

pub struct BoardNvm<F, E> {
    flash: F,
    eeprom: E,
    geometry: FlashGeometry,
}

impl<F: FlashCtl, E: EepromWrite> BoardNvm<F, E> {
    pub fn new(flash: F, eeprom: E, geometry: FlashGeometry) -> Self {
        Self {
            flash,
            eeprom,
            geometry,
        }
    }

    fn program_page(
        &mut self,
        address: u32,
        page: &[u8],
    ) -> Result<(), NvmError> {
        if let Some(sector) = sector_start(address - self.geometry.base) {
            ringbuf_entry!(Trace::Erase(sector));
            self.flash.erase_sector(sector)?;
        }
        for (i, word) in page.chunks_exact(4).enumerate() {
            let w = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            self.flash.program_word(address + 4 * i as u32, w)?;
        }
        Ok(())
    }
}

impl<F: FlashCtl, E: EepromWrite> NvmWriter for BoardNvm<F, E> {
    fn unlock(&mut self) {
        ringbuf_entry!(Trace::Unlock);
        self.flash.unlock();
    }

    fn lock(&mut self) {
        ringbuf_entry!(Trace::Lock);
        self.flash.lock();
    }

    fn program_block(
        &mut self,
        address: u32,
        data: &[u8],
    ) -> Result<(), NvmError> {
        if self.flash.is_locked() {
            return Err(NvmError::Locked);
        }
        let page = self.geometry.page_size;
        if address % page != 0 || data.len() as u32 % page != 0 {
            return Err(NvmError::Misaligned);
        }
        if !self.geometry.contains(address, data.len() as u32) {
            return Err(NvmError::OutOfRange);
        }

        for (i, chunk) in data.chunks(page as usize).enumerate() {
            let page_address = address + i as u32 * page;
            self.program_page(page_address, chunk).inspect_err(|&err| {
                ringbuf_entry!(Trace::ProgramFault {
                    address: page_address,
                    err
                });
            })?;
        }
        Ok(())
    }

    fn write_eeprom_block(
        &mut self,
        offset: u32,
        data: &[u8],
    ) -> Result<(), NvmError> {
        self.eeprom.write(offset, data).inspect_err(|&err| {
            ringbuf_entry!(Trace::EepromFault { offset, err });
        })
    }
}
