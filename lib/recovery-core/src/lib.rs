// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Firmware recovery loader core.
//!
//! Everything the loader does that is not register banging: deciding at
//! reset whether to start the application, turning key lines into events,
//! walking the user through picking an image, checking it, and copying it
//! into flash or EEPROM a block at a time. The hardware sits behind the
//! traits in [`drv_recovery_api`], so all of this runs in host tests.

#![cfg_attr(not(test), no_std)]

pub mod boot;
pub mod config;
pub mod controller;
pub mod event;
pub mod listing;
pub mod nvm;
pub mod sampler;
pub mod transfer;
pub mod validate;

pub use controller::{Iteration, RecoveryController, RecoverySession};
pub use drv_recovery_api as api;
