// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tick-rate input sampling.
//!
//! Called from the 10 ms timer interrupt. Each key line goes through a small
//! debounce filter and a press/hold/release state machine; the rotary
//! encoder, where fitted, is turned into up/down presses one detent at a
//! time.

use crate::config::{InputConfig, KeyTiming};
use crate::event::{Event, EventKind, InputChannel, Key, KeyLines};

/// A key must read the same for this many consecutive ticks.
const FILTER_BITS: u32 = 2;
const FILTER_MASK: u8 = (1 << FILTER_BITS) - 1;

/// Initial auto-repeat period, in ticks. The period halves every
/// `repeat_trigger` ticks until it reaches one tick.
const FIRST_REPEAT_PERIOD: u8 = 16;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum KeyState {
    Off,
    /// Debounced down; the press is reported next tick.
    Start,
    /// Down, waiting for long-press and auto-repeat thresholds.
    RepeatDelay,
    /// Auto-repeating with the given period.
    Repeat(u8),
}

#[derive(Copy, Clone, Debug)]
pub struct KeyTracker {
    key: Key,
    vals: u8,
    state: KeyState,
    cnt: u8,
    long_fired: bool,
}

impl KeyTracker {
    pub const fn new(key: Key) -> Self {
        Self {
            key,
            vals: 0,
            state: KeyState::Off,
            cnt: 0,
            long_fired: false,
        }
    }

    /// Feeds one tick's worth of raw line state.
    ///
    /// A release is reported as `Break` unless a long press was reported
    /// during the same hold.
    pub fn input(
        &mut self,
        pressed: bool,
        timing: &KeyTiming,
    ) -> Option<Event> {
        self.vals = ((self.vals << 1) | pressed as u8) & FILTER_MASK;
        self.cnt = self.cnt.wrapping_add(1);

        if self.state != KeyState::Off && self.vals == 0 {
            let event =
                (!self.long_fired).then_some(self.event(EventKind::Break));
            self.state = KeyState::Off;
            self.cnt = 0;
            self.long_fired = false;
            return event;
        }

        match self.state {
            KeyState::Off => {
                if self.vals == FILTER_MASK {
                    self.state = KeyState::Start;
                    self.cnt = 0;
                }
                None
            }
            KeyState::Start => {
                self.state = KeyState::RepeatDelay;
                self.cnt = 0;
                Some(self.event(EventKind::First))
            }
            KeyState::RepeatDelay => {
                let mut event = None;
                if self.cnt == timing.long_delay {
                    self.long_fired = true;
                    event = Some(self.event(EventKind::Long));
                }
                if self.cnt == timing.repeat_delay {
                    self.state = KeyState::Repeat(FIRST_REPEAT_PERIOD);
                    self.cnt = 0;
                }
                event
            }
            KeyState::Repeat(period) => {
                if period > 1 && self.cnt >= timing.repeat_trigger {
                    self.state = KeyState::Repeat(period >> 1);
                    self.cnt = 0;
                    return None;
                }
                (self.cnt & (period - 1) == 0)
                    .then_some(self.event(EventKind::Repeat))
            }
        }
    }

    fn event(&self, kind: EventKind) -> Event {
        Event::new(self.key, kind)
    }
}

/// Turns an encoder count into one press per detent.
#[derive(Copy, Clone, Debug)]
pub struct Encoder {
    granularity: i32,
    previous: Option<i32>,
}

impl Encoder {
    pub const fn new(granularity: i32) -> Self {
        Self {
            granularity,
            previous: None,
        }
    }

    /// Feeds the current count. The first sample only sets the reference
    /// point.
    pub fn input(&mut self, count: i32) -> Option<Event> {
        // Floor division, so a detent is the same width on both sides of
        // zero.
        let value = count.div_euclid(self.granularity);
        let previous = self.previous.replace(value)?;
        let delta = value.wrapping_sub(previous);
        match delta {
            0 => None,
            d if d < 0 => Some(Event::new(Key::Up, EventKind::First)),
            _ => Some(Event::new(Key::Down, EventKind::First)),
        }
    }
}

pub struct InputSampler {
    keys: [KeyTracker; 4],
    encoder: Option<Encoder>,
    timing: KeyTiming,
}

impl InputSampler {
    pub fn new(config: &InputConfig) -> Self {
        Self {
            keys: Key::ALL.map(KeyTracker::new),
            encoder: config
                .encoder_granularity
                .filter(|&g| g > 0)
                .map(Encoder::new),
            timing: config.timing,
        }
    }

    /// Runs one tick of sampling, handing each event produced to `emit`:
    /// key events first, then at most one encoder event.
    pub fn sample(
        &mut self,
        lines: KeyLines,
        encoder_count: i32,
        mut emit: impl FnMut(Event),
    ) {
        for tracker in &mut self.keys {
            let pressed = lines.contains(tracker.key.line());
            if let Some(event) = tracker.input(pressed, &self.timing) {
                emit(event);
            }
        }
        if let Some(encoder) = &mut self.encoder {
            if let Some(event) = encoder.input(encoder_count) {
                emit(event);
            }
        }
    }

    /// The tick interrupt body: sample, post, then raise the tick flag.
    pub fn on_tick(
        &mut self,
        lines: KeyLines,
        encoder_count: i32,
        channel: &InputChannel,
    ) {
        self.sample(lines, encoder_count, |e| channel.post(e));
        channel.signal_tick();
    }
}
