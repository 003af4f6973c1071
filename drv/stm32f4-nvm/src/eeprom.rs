// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! 24xx-series I2C EEPROM.
//!
//! These parts take a two-byte big-endian memory address followed by up to
//! one page of data. A write that crosses a page boundary wraps around
//! within the page, so we split writes at page boundaries ourselves. While
//! the part commits a page it does not acknowledge its bus address; we poll
//! for the acknowledge before starting the next page.

use drv_recovery_api::NvmError;
use embedded_hal::blocking::i2c::Write;

pub trait EepromWrite {
    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), NvmError>;
}

/// Stand-in for boards whose settings live on the SD card.
pub struct NoEeprom;

impl EepromWrite for NoEeprom {
    fn write(&mut self, _offset: u32, _data: &[u8]) -> Result<(), NvmError> {
        Err(NvmError::NoEeprom)
    }
}

/// Page size of the 24LC256/24AA256 parts fitted to the transmitters.
pub const PAGE_SIZE: usize = 64;

/// Upper bound on acknowledge polls after a page write. A page commit takes
/// at most 5 ms, and one poll is several bus transactions' worth of time at
/// 400 kHz.
const ACK_POLL_LIMIT: usize = 1000;

pub struct I2cEeprom<I2C> {
    bus: I2C,
    address: u8,
    size: u32,
}

impl<I2C: Write> I2cEeprom<I2C> {
    /// `address` is the 7-bit bus address; `size` the capacity in bytes.
    pub fn new(bus: I2C, address: u8, size: u32) -> Self {
        Self { bus, address, size }
    }

    pub fn release(self) -> I2C {
        self.bus
    }

    fn write_page(&mut self, offset: u32, data: &[u8]) -> Result<(), NvmError> {
        let mut buf = [0u8; 2 + PAGE_SIZE];
        buf[..2].copy_from_slice(&(offset as u16).to_be_bytes());
        buf[2..2 + data.len()].copy_from_slice(data);
        self.bus
            .write(self.address, &buf[..2 + data.len()])
            .map_err(|_| NvmError::Bus)?;
        self.wait_ready(offset)
    }

    fn wait_ready(&mut self, offset: u32) -> Result<(), NvmError> {
        let addr = (offset as u16).to_be_bytes();
        for _ in 0..ACK_POLL_LIMIT {
            if self.bus.write(self.address, &addr).is_ok() {
                return Ok(());
            }
        }
        Err(NvmError::Timeout)
    }
}

impl<I2C: Write> EepromWrite for I2cEeprom<I2C> {
    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), NvmError> {
        let end = offset
            .checked_add(data.len() as u32)
            .ok_or(NvmError::OutOfRange)?;
        if end > self.size {
            return Err(NvmError::OutOfRange);
        }

        let mut offset = offset;
        let mut rest = data;
        while !rest.is_empty() {
            let room = PAGE_SIZE - offset as usize % PAGE_SIZE;
            let (page, tail) = rest.split_at(room.min(rest.len()));
            self.write_page(offset, page)?;
            offset += page.len() as u32;
            rest = tail;
        }
        Ok(())
    }
}
