// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Board parameters.
//!
//! The values for the board being built come from `boards/<name>.toml` via
//! the build script and land in [`BOARD`]; the types are plain data so tests
//! can construct boards of their own.

use drv_recovery_api::{MemoryTarget, MenuItem};
use static_assertions::const_assert;

include!(concat!(env!("OUT_DIR"), "/board_config.rs"));

const_assert!(BLOCK_LEN % BOARD.flash.page_size as usize == 0);
const_assert!(NAMES_ON_SCREEN > 0);
const_assert!(BOARD.flash.bootloader_size < BOARD.flash.size);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BoardConfig {
    pub name: &'static str,
    pub flash: FlashConfig,
    pub eeprom: Option<EepromConfig>,
    pub signature: SignatureConfig,
    pub input: InputConfig,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FlashConfig {
    pub base: u32,
    pub size: u32,
    /// Space at the start of flash, and at the start of every firmware file,
    /// that holds this loader.
    pub bootloader_size: u32,
    pub page_size: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EepromConfig {
    pub size: u32,
    /// Expected first bytes of a native settings image.
    pub version: u8,
    pub header_len: u8,
    pub block_size: u8,
}

/// Masks for recognizing a Cortex-M vector table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SignatureConfig {
    pub stack_mask: u32,
    pub stack_base: u32,
    pub vector_mask: u32,
    pub vector_base: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct InputConfig {
    /// Trim combination that enters recovery at reset.
    pub boot_keys: u8,
    /// Encoder counts per detent, on boards with a rotary encoder.
    pub encoder_granularity: Option<i32>,
    /// Ticks to wait before polling removable storage.
    pub power_up_delay_ticks: u16,
    pub timing: KeyTiming,
}

/// Key hold durations, in ticks.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct KeyTiming {
    /// Hold time after which a long press is reported.
    pub long_delay: u8,
    /// Hold time after which auto-repeat starts.
    pub repeat_delay: u8,
    /// Ticks spent at each repeat rate before it doubles.
    pub repeat_trigger: u8,
}

impl BoardConfig {
    pub fn has_eeprom(&self) -> bool {
        self.eeprom.is_some()
    }

    /// Address of the application's vector table.
    pub fn app_start_address(&self) -> u32 {
        self.flash.base + self.flash.bootloader_size
    }

    /// Most bytes an application image may occupy.
    pub fn flash_backstop(&self) -> u32 {
        self.flash.size - self.flash.bootloader_size
    }

    pub fn backstop(&self, target: MemoryTarget) -> u32 {
        match target {
            MemoryTarget::Flash => self.flash_backstop(),
            MemoryTarget::Eeprom => self.eeprom.map_or(0, |e| e.size),
        }
    }

    /// Bytes at the start of an image file that are not written.
    pub fn header_len(&self, target: MemoryTarget) -> u32 {
        match target {
            MemoryTarget::Flash => self.flash.bootloader_size,
            MemoryTarget::Eeprom => 0,
        }
    }

    /// Where the first written byte goes: an absolute flash address, or an
    /// EEPROM offset.
    pub fn destination(&self, target: MemoryTarget) -> u32 {
        match target {
            MemoryTarget::Flash => self.app_start_address(),
            MemoryTarget::Eeprom => 0,
        }
    }

    pub fn menu(&self) -> heapless::Vec<MenuItem, 3> {
        let mut items = heapless::Vec::new();
        // Three pushes into a Vec of three cannot fail.
        let _ = items.push(MenuItem::Flash);
        if self.has_eeprom() {
            let _ = items.push(MenuItem::Eeprom);
        }
        let _ = items.push(MenuItem::Exit);
        items
    }
}
