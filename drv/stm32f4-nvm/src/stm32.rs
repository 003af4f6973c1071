// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Register-level pieces for STM32F2/F4 parts.
//!
//! The F205 found in the older radios shares the flash, IWDG, RTC and RCC
//! register layout with the F407, so one PAC covers both.

use crate::flash::FlashCtl;
use drv_recovery_api::NvmError;
use stm32f4::stm32f407 as device;

const KEY1: u32 = 0x4567_0123;
const KEY2: u32 = 0xCDEF_89AB;

const CR_PG: u32 = 1 << 0;
const CR_SER: u32 = 1 << 1;
const CR_SNB_SHIFT: u32 = 3;
const CR_PSIZE_X32: u32 = 0b10 << 8;
const CR_STRT: u32 = 1 << 16;
const CR_LOCK: u32 = 1 << 31;

const SR_OPERR: u32 = 1 << 1;
const SR_WRPERR: u32 = 1 << 4;
const SR_PGAERR: u32 = 1 << 5;
const SR_PGPERR: u32 = 1 << 6;
const SR_PGSERR: u32 = 1 << 7;
const SR_BSY: u32 = 1 << 16;
const SR_ERRORS: u32 =
    SR_OPERR | SR_WRPERR | SR_PGAERR | SR_PGPERR | SR_PGSERR;

// A 128 KiB sector erase takes up to 2 s on these parts; this bounds the
// busy-wait well past that at 168 MHz.
const BUSY_LIMIT: u32 = 0x1000_0000;

pub struct Stm32Flash {
    regs: &'static device::flash::RegisterBlock,
}

impl Stm32Flash {
    pub fn new() -> Self {
        // Safety: the loader is the only code running, and the flash
        // controller is only touched through this struct.
        Self {
            regs: unsafe { &*device::FLASH::ptr() },
        }
    }

    fn wait_idle(&self) -> Result<(), NvmError> {
        for _ in 0..BUSY_LIMIT {
            let sr = self.regs.sr.read().bits();
            if sr & SR_BSY == 0 {
                if sr & SR_ERRORS != 0 {
                    // Errors are write-one-to-clear.
                    self.regs.sr.write(|w| unsafe { w.bits(sr & SR_ERRORS) });
                    return Err(if sr & SR_WRPERR != 0 {
                        NvmError::Locked
                    } else {
                        NvmError::ProgramFailed
                    });
                }
                return Ok(());
            }
        }
        Err(NvmError::Timeout)
    }

    fn clear_cr(&self, mask: u32) {
        self.regs
            .cr
            .modify(|r, w| unsafe { w.bits(r.bits() & !mask) });
    }
}

impl FlashCtl for Stm32Flash {
    fn unlock(&mut self) {
        if self.is_locked() {
            self.regs.keyr.write(|w| unsafe { w.bits(KEY1) });
            self.regs.keyr.write(|w| unsafe { w.bits(KEY2) });
        }
    }

    fn lock(&mut self) {
        self.regs
            .cr
            .modify(|r, w| unsafe { w.bits(r.bits() | CR_LOCK) });
    }

    fn is_locked(&self) -> bool {
        self.regs.cr.read().bits() & CR_LOCK != 0
    }

    fn erase_sector(&mut self, sector: u8) -> Result<(), NvmError> {
        self.wait_idle()?;
        // Second-bank sectors 12..=23 are encoded as 16..=27.
        let snb = u32::from(if sector >= 12 { sector + 4 } else { sector });
        self.regs.cr.write(|w| unsafe {
            w.bits(CR_PSIZE_X32 | CR_SER | (snb << CR_SNB_SHIFT))
        });
        self.regs
            .cr
            .modify(|r, w| unsafe { w.bits(r.bits() | CR_STRT) });
        let r = self.wait_idle().map_err(|e| match e {
            NvmError::ProgramFailed => NvmError::EraseFailed,
            e => e,
        });
        self.clear_cr(CR_SER | (0x1F << CR_SNB_SHIFT));
        r
    }

    fn program_word(
        &mut self,
        address: u32,
        word: u32,
    ) -> Result<(), NvmError> {
        self.wait_idle()?;
        self.regs
            .cr
            .write(|w| unsafe { w.bits(CR_PSIZE_X32 | CR_PG) });
        // Safety: the caller has range-checked `address` against flash.
        unsafe { core::ptr::write_volatile(address as *mut u32, word) };
        let r = self.wait_idle();
        self.clear_cr(CR_PG);
        r?;
        let readback =
            unsafe { core::ptr::read_volatile(address as *const u32) };
        if readback != word {
            return Err(NvmError::ProgramFailed);
        }
        Ok(())
    }
}

/// Reloads the independent watchdog.
pub fn feed_watchdog() {
    let iwdg = unsafe { &*device::IWDG::ptr() };
    iwdg.kr.write(|w| unsafe { w.bits(0xAAAA) });
}

/// Returns true if the last reset came from a watchdog or from software,
/// and clears the reset flags.
pub fn take_watchdog_or_software_reset() -> bool {
    let rcc = unsafe { &*device::RCC::ptr() };
    const CSR_SFTRSTF: u32 = 1 << 28;
    const CSR_IWDGRSTF: u32 = 1 << 29;
    const CSR_WWDGRSTF: u32 = 1 << 30;
    const CSR_RMVF: u32 = 1 << 24;
    let flags = CSR_SFTRSTF | CSR_IWDGRSTF | CSR_WWDGRSTF;
    let warm = rcc.csr.read().bits() & flags != 0;
    rcc.csr.modify(|r, w| unsafe { w.bits(r.bits() | CSR_RMVF) });
    warm
}

/// Writes `marker` into RTC backup register 0, which survives a system
/// reset.
pub fn write_backup_marker(marker: u32) {
    let rcc = unsafe { &*device::RCC::ptr() };
    let pwr = unsafe { &*device::PWR::ptr() };
    let rtc = unsafe { &*device::RTC::ptr() };
    const APB1ENR_PWREN: u32 = 1 << 28;
    const CR_DBP: u32 = 1 << 8;
    rcc.apb1enr
        .modify(|r, w| unsafe { w.bits(r.bits() | APB1ENR_PWREN) });
    pwr.cr.modify(|r, w| unsafe { w.bits(r.bits() | CR_DBP) });
    rtc.bkp0r.write(|w| unsafe { w.bits(marker) });
}

/// Hands control to the application whose vector table is at
/// `vector_table`.
///
/// # Safety
///
/// `vector_table` must point at a valid vector table, and every peripheral
/// the loader enabled must be back in its reset state.
pub unsafe fn start_application(vector_table: u32) -> ! {
    let scb = &*cortex_m::peripheral::SCB::PTR;
    scb.vtor.write(vector_table);
    cortex_m::asm::bootload(vector_table as *const u32)
}
