// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Non-volatile memory writer for STM32F2/F4 transmitters.
//!
//! [`BoardNvm`] implements the recovery loader's `NvmWriter` on top of two
//! smaller pieces: a [`FlashCtl`] that knows the flash controller's register
//! protocol, and an [`EepromWrite`] for the board's external EEPROM (or
//! [`NoEeprom`] on boards without one). Everything above the register level
//! builds and tests on the host; the register-level pieces are in the
//! `stm32` module, which only exists when building for the device.

#![cfg_attr(not(test), no_std)]

mod eeprom;
mod flash;

#[cfg(target_os = "none")]
pub mod stm32;

pub use eeprom::{EepromWrite, I2cEeprom, NoEeprom};
pub use flash::{sector_start, BoardNvm, FlashCtl, FlashGeometry};
