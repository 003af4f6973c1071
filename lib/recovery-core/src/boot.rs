// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! What happens between reset and the recovery screens.

use crate::config::BoardConfig;

/// Written to RTC backup register 0 before a reset requested from the
/// recovery screens, so the application skips its own power-on checks.
pub const SOFT_RESET_REQUEST: u32 = 0xCAFE_DEAD;

/// Loader version, found by the application and by host tools at a fixed
/// place in the image.
#[used]
#[cfg_attr(target_os = "none", link_section = ".version")]
pub static VERSION_MARKER: [u8; 6] = *b"BOOT10";

/// Busy-wait iterations for input lines to settle after a cold reset.
const SETTLE_SPINS: u32 = 150_000;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResetCause {
    /// Power-on or pin reset; the key lines may still be settling.
    Cold,
    /// Watchdog or software reset: the lines have been powered all along.
    WatchdogOrSoftware,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BootAction {
    /// Jump to the application whose vector table is at this address.
    StartApplication(u32),
    EnterRecovery,
}

/// Number of busy-wait iterations to spend before reading the boot keys.
pub fn settle_spins(cause: ResetCause) -> u32 {
    match cause {
        ResetCause::Cold => SETTLE_SPINS,
        ResetCause::WatchdogOrSoftware => 0,
    }
}

/// Waits for the key lines to settle, if the reset requires it.
pub fn settle_inputs(cause: ResetCause) {
    for _ in 0..settle_spins(cause) {
        core::hint::spin_loop();
    }
}

/// Decides from the held trim switches whether to enter recovery.
pub fn boot_decision(trims: u8, config: &BoardConfig) -> BootAction {
    if trims == config.input.boot_keys {
        BootAction::EnterRecovery
    } else {
        BootAction::StartApplication(config.app_start_address())
    }
}
