// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Image signature checks.
//!
//! There is no integrity check on recovery images; we only make sure the
//! start of the file looks like the right kind of image for the target, so
//! that picking a settings backup when asked for firmware (or a random file)
//! is caught before anything is erased.

use drv_recovery_api::{MemoryTarget, ValidationVerdict};
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::config::{BoardConfig, EepromConfig, SignatureConfig};

/// Bytes of an image's start needed to check any signature.
pub const SIGNATURE_LEN: usize = 64;

/// The first three entries of a Cortex-M vector table.
#[derive(Copy, Clone, Debug, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
struct VectorTableHead {
    initial_sp: U32,
    reset: U32,
    nmi: U32,
}

/// Start of the native settings filesystem.
#[derive(Copy, Clone, Debug, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
struct EepromHeader {
    version: u8,
    header_len: u8,
    _free_list: u8,
    block_size: u8,
}

// Images from older firmware have no version byte, but always use 128-byte
// headers and blocks.
const LEGACY_EEPROM_SIZE: u8 = 0x80;

pub fn is_firmware_start(block: &[u8], sig: &SignatureConfig) -> bool {
    let Ok((head, _)) = VectorTableHead::read_from_prefix(block) else {
        return false;
    };
    let in_flash = |v: U32| v.get() & sig.vector_mask == sig.vector_base;
    head.initial_sp.get() & sig.stack_mask == sig.stack_base
        && in_flash(head.reset)
        && in_flash(head.nmi)
}

pub fn is_eeprom_start(block: &[u8], eeprom: &EepromConfig) -> bool {
    let Ok((head, _)) = EepromHeader::read_from_prefix(block) else {
        return false;
    };
    let native = head.version == eeprom.version
        && head.header_len == eeprom.header_len
        && head.block_size == eeprom.block_size;
    let legacy = head.header_len == LEGACY_EEPROM_SIZE
        && head.block_size == LEGACY_EEPROM_SIZE;
    native || legacy
}

/// Checks the first block of an image's payload (after any header the
/// target skips) against the signature for `target`.
pub fn check_image_start(
    target: MemoryTarget,
    block: &[u8],
    config: &BoardConfig,
) -> ValidationVerdict {
    let ok = match target {
        MemoryTarget::Flash => is_firmware_start(block, &config.signature),
        MemoryTarget::Eeprom => config
            .eeprom
            .as_ref()
            .is_some_and(|e| is_eeprom_start(block, e)),
    };
    if ok {
        ValidationVerdict::Valid
    } else {
        ValidationVerdict::Invalid
    }
}

/// Memoized verdict for the current selection.
///
/// The verdict survives leaving and re-entering the confirmation screen and
/// is only reset when a different file is selected.
#[derive(Copy, Clone, Debug, Default)]
pub struct VerdictCache {
    selection: Option<u32>,
    verdict: ValidationVerdict,
}

impl VerdictCache {
    /// Records `index` as the selection, resetting the verdict if it differs
    /// from the previous one.
    pub fn select(&mut self, index: u32) {
        if self.selection != Some(index) {
            self.selection = Some(index);
            self.verdict = ValidationVerdict::Unchecked;
        }
    }

    pub fn verdict(&self) -> ValidationVerdict {
        self.verdict
    }

    pub fn set(&mut self, verdict: ValidationVerdict) {
        self.verdict = verdict;
    }

    /// Forgets the selection, for when the listing it indexed is gone.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
