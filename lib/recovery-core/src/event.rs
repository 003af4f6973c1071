// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Input events and the tick-interrupt-to-main-loop channel.

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum Key {
    Enter = 0,
    Exit,
    Up,
    Down,
}

impl Key {
    pub const ALL: [Key; 4] = [Key::Enter, Key::Exit, Key::Up, Key::Down];

    pub fn line(self) -> KeyLines {
        match self {
            Key::Enter => KeyLines::ENTER,
            Key::Exit => KeyLines::EXIT,
            Key::Up => KeyLines::UP,
            Key::Down => KeyLines::DOWN,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum EventKind {
    /// Key went down.
    First = 0,
    /// Key is being held and auto-repeat fired.
    Repeat,
    /// Key has been held for the long-press time.
    Long,
    /// Key was released without a long press.
    Break,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Event {
    pub key: Key,
    pub kind: EventKind,
}

// Encoded events never use zero, which marks an empty slot.
const EVENT_VALID: u8 = 0x80;

impl Event {
    pub const fn new(key: Key, kind: EventKind) -> Self {
        Self { key, kind }
    }

    fn to_raw(self) -> u8 {
        EVENT_VALID | (self.kind as u8) << 2 | self.key as u8
    }

    fn from_raw(raw: u8) -> Option<Self> {
        if raw & EVENT_VALID == 0 {
            return None;
        }
        Some(Self {
            key: Key::from_u8(raw & 0b11)?,
            kind: EventKind::from_u8((raw >> 2) & 0b11)?,
        })
    }
}

bitflags::bitflags! {
    /// Raw key lines as read from the GPIOs, after inversion to active-high.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct KeyLines: u8 {
        const ENTER = 1 << 0;
        const EXIT = 1 << 1;
        const UP = 1 << 2;
        const DOWN = 1 << 3;
    }
}

/// One-slot mailbox from the tick interrupt to the main loop.
///
/// The interrupt posts events and raises the tick flag; the loop takes both.
/// A newer event overwrites one that has not been taken yet.
pub struct InputChannel {
    tick: AtomicBool,
    event: AtomicU8,
}

impl InputChannel {
    pub const fn new() -> Self {
        Self {
            tick: AtomicBool::new(false),
            event: AtomicU8::new(0),
        }
    }

    pub fn post(&self, event: Event) {
        self.event.store(event.to_raw(), Ordering::Release);
    }

    pub fn take(&self) -> Option<Event> {
        Event::from_raw(self.event.swap(0, Ordering::Acquire))
    }

    pub fn signal_tick(&self) {
        self.tick.store(true, Ordering::Release);
    }

    /// Returns true, once, for each tick signalled since the last call.
    pub fn take_tick(&self) -> bool {
        self.tick.swap(false, Ordering::AcqRel)
    }
}

impl Default for InputChannel {
    fn default() -> Self {
        Self::new()
    }
}
