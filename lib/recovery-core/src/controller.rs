// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The recovery state machine.
//!
//! [`RecoveryController`] owns every collaborator and the one
//! [`RecoverySession`], and is driven by [`RecoveryController::iterate`] from
//! the main loop. All state changes happen on a tick: the tick interrupt
//! samples the keys, posts at most one event into the [`InputChannel`] and
//! raises the tick flag, and the next iteration consumes both.
//!
//! Rules that hold in every state:
//!
//! - The watchdog is fed exactly once per iteration.
//! - A plugged USB cable preempts whatever is going on, and unplugging it
//!   returns to the start menu.
//! - A long press of Exit reboots.
//! - Flash is unlocked only in `UsbLink` and while flashing the application.
//! - The power button is ignored while flashing or connected over USB.

use drv_recovery_api::{
    CandidateFile, CompletionReason, Display, Frame, MemoryTarget, MenuItem,
    NvmWriter, Platform, RecoveryError, RecoveryState, Storage, StorageError,
    UsbBridge, ValidationVerdict, View,
};
use heapless::Vec;
use ringbuf::*;

use crate::config::{BoardConfig, NAMES_ON_SCREEN};
use crate::event::{Event, EventKind, InputChannel, Key};
use crate::listing::FileWindow;
use crate::nvm::NvmLease;
use crate::transfer::{ChunkedWriter, TransferProgress};
use crate::validate::{check_image_start, VerdictCache, SIGNATURE_LEN};

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Enter {
        from: RecoveryState,
        to: RecoveryState,
    },
    UsbPlugged,
    UsbUnplugged,
    DirectoryFailed(StorageError),
    Verdict {
        index: Option<u32>,
        verdict: ValidationVerdict,
    },
    ConfirmFailed(RecoveryError),
    TransferStarted {
        target: MemoryTarget,
        total: u32,
    },
    TransferDone {
        reason: CompletionReason,
        written: u32,
    },
    PowerOff,
    Reset,
}

ringbuf!(Trace, 32, Trace::None);

const ENTER: Event = Event::new(Key::Enter, EventKind::Break);
const EXIT: Event = Event::new(Key::Exit, EventKind::Break);
const LONG_ENTER: Event = Event::new(Key::Enter, EventKind::Long);
const LONG_EXIT: Event = Event::new(Key::Exit, EventKind::Long);

/// What the main loop should do after an iteration.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Iteration {
    Continue,
    /// The power button asked for power-off.
    PowerOff,
    /// The controller reached `Reboot`; the screen is blank and the soft
    /// reset marker is written.
    Reset,
}

/// Mutable state of one recovery session.
pub struct RecoverySession<Dir, File> {
    state: RecoveryState,
    menu: Vec<MenuItem, 3>,
    menu_cursor: usize,
    target: Option<MemoryTarget>,
    listing: Option<FileWindow<Dir, NAMES_ON_SCREEN>>,
    verdict: VerdictCache,
    dir_error: Option<StorageError>,
    /// The image being written, open only in `Flashing`.
    file: Option<File>,
    writer: ChunkedWriter,
    outcome: Option<CompletionReason>,
    power_up_ticks: u16,
}

impl<Dir, File> RecoverySession<Dir, File> {
    fn new(config: &BoardConfig) -> Self {
        Self {
            state: RecoveryState::Start,
            menu: config.menu(),
            menu_cursor: 0,
            target: None,
            listing: None,
            verdict: VerdictCache::default(),
            dir_error: None,
            file: None,
            writer: ChunkedWriter::new(),
            outcome: None,
            power_up_ticks: 0,
        }
    }

    fn discard_listing(&mut self) {
        self.listing = None;
        self.verdict.clear();
    }

    pub fn state(&self) -> RecoveryState {
        self.state
    }

    pub fn menu(&self) -> &[MenuItem] {
        &self.menu
    }

    pub fn menu_cursor(&self) -> usize {
        self.menu_cursor
    }

    pub fn target(&self) -> Option<MemoryTarget> {
        self.target
    }

    /// Names currently on screen in the file list.
    pub fn files(&self) -> &[CandidateFile] {
        match &self.listing {
            Some(window) => window.files(),
            None => &[],
        }
    }

    pub fn selected(&self) -> Option<&CandidateFile> {
        self.listing.as_ref().and_then(|w| w.selected())
    }

    pub fn verdict(&self) -> ValidationVerdict {
        self.verdict.verdict()
    }

    pub fn outcome(&self) -> Option<CompletionReason> {
        self.outcome
    }
}

pub struct RecoveryController<'a, S, W, U, D, P>
where
    S: Storage,
    W: NvmWriter,
{
    config: BoardConfig,
    input: &'a InputChannel,
    session: RecoverySession<S::Dir, S::File>,
    storage: S,
    nvm: NvmLease<W>,
    usb: U,
    display: D,
    platform: P,
}

impl<'a, S, W, U, D, P> RecoveryController<'a, S, W, U, D, P>
where
    S: Storage,
    W: NvmWriter,
    U: UsbBridge,
    D: Display,
    P: Platform,
{
    pub fn new(
        config: BoardConfig,
        input: &'a InputChannel,
        storage: S,
        writer: W,
        usb: U,
        display: D,
        platform: P,
    ) -> Self {
        Self {
            session: RecoverySession::new(&config),
            config,
            input,
            storage,
            nvm: NvmLease::new(writer),
            usb,
            display,
            platform,
        }
    }

    /// Waits for the power button that started us to be let go, so that
    /// the same press is not taken as a power-off request.
    pub fn prologue(&mut self) {
        while self.platform.power_button_pressed() {
            self.platform.feed_watchdog();
        }
    }

    pub fn run(mut self) -> ! {
        self.prologue();
        loop {
            match self.iterate() {
                Iteration::Continue => {}
                Iteration::PowerOff => self.platform.power_off(),
                Iteration::Reset => self.platform.system_reset(),
            }
        }
    }

    /// One pass of the main loop.
    pub fn iterate(&mut self) -> Iteration {
        self.platform.feed_watchdog();

        if self.input.take_tick() {
            self.tick();
        }

        let state = self.session.state;
        if !matches!(state, RecoveryState::Flashing | RecoveryState::UsbLink)
            && self.platform.power_off_requested()
        {
            ringbuf_entry!(Trace::PowerOff);
            return Iteration::PowerOff;
        }

        if state == RecoveryState::Reboot {
            ringbuf_entry!(Trace::Reset);
            self.display.blank();
            self.platform.mark_soft_reset();
            return Iteration::Reset;
        }

        Iteration::Continue
    }

    fn tick(&mut self) {
        let event = self.input.take();
        // A USB transition consumes the tick's event.
        let event = if self.arbitrate_usb() { None } else { event };

        match self.session.state {
            RecoveryState::Start => self.on_start(event),
            RecoveryState::DirectoryCheck => self.on_directory_check(event),
            RecoveryState::FileList => self.on_file_list(event),
            RecoveryState::FlashCheck => self.on_flash_check(event),
            RecoveryState::Flashing => self.on_flashing(),
            RecoveryState::FlashDone => self.on_flash_done(event),
            RecoveryState::UsbLink | RecoveryState::Reboot => {}
        }

        if event == Some(LONG_EXIT)
            && self.session.state != RecoveryState::Reboot
        {
            self.enter(RecoveryState::Reboot);
        }

        self.draw();

        let delay = self.config.input.power_up_delay_ticks;
        if self.session.power_up_ticks < delay {
            self.session.power_up_ticks += 1;
        } else {
            self.storage.poll();
        }
    }

    /// Follows the USB cable. Returns true if the state changed.
    fn arbitrate_usb(&mut self) -> bool {
        let state = self.session.state;
        if state == RecoveryState::Reboot {
            return false;
        }
        let plugged = self.usb.is_plugged();
        if state != RecoveryState::UsbLink && plugged {
            ringbuf_entry!(Trace::UsbPlugged);
            self.enter(RecoveryState::UsbLink);
            true
        } else if state == RecoveryState::UsbLink && !plugged {
            ringbuf_entry!(Trace::UsbUnplugged);
            self.enter(RecoveryState::Start);
            true
        } else {
            false
        }
    }

    fn enter(&mut self, next: RecoveryState) {
        let prev = self.session.state;
        ringbuf_entry!(Trace::Enter {
            from: prev,
            to: next
        });

        if prev == RecoveryState::UsbLink && next != RecoveryState::UsbLink {
            self.usb.stop_mass_storage();
        }
        if prev == RecoveryState::Flashing && next != RecoveryState::Flashing {
            if let Some(file) = self.session.file.take() {
                self.storage.close(file);
            }
        }
        if !matches!(next, RecoveryState::UsbLink | RecoveryState::Flashing) {
            self.nvm.release();
        }

        let session = &mut self.session;
        match next {
            RecoveryState::Start => {
                session.discard_listing();
                session.menu_cursor = 0;
                session.target = None;
                session.outcome = None;
            }
            RecoveryState::UsbLink => {
                session.discard_listing();
                self.nvm.acquire();
                self.usb.start_mass_storage();
            }
            RecoveryState::DirectoryCheck => {
                session.discard_listing();
                session.dir_error = None;
            }
            RecoveryState::Flashing => {
                if session.target == Some(MemoryTarget::Flash) {
                    self.nvm.acquire();
                }
            }
            RecoveryState::FileList
            | RecoveryState::FlashCheck
            | RecoveryState::FlashDone
            | RecoveryState::Reboot => {}
        }
        self.session.state = next;
    }

    fn on_start(&mut self, event: Option<Event>) {
        let Some(event) = event else { return };
        let last = self.session.menu.len().saturating_sub(1);
        let cursor = &mut self.session.menu_cursor;
        match (event.key, event.kind) {
            (Key::Down, EventKind::First) => *cursor = (*cursor + 1).min(last),
            (Key::Up, EventKind::First) => *cursor = cursor.saturating_sub(1),
            _ if event == ENTER => {
                let item = self.session.menu.get(*cursor).copied();
                match item {
                    Some(MenuItem::Flash) => self.choose(MemoryTarget::Flash),
                    Some(MenuItem::Eeprom) => {
                        self.choose(MemoryTarget::Eeprom)
                    }
                    Some(MenuItem::Exit) | None => {
                        self.enter(RecoveryState::Reboot)
                    }
                }
            }
            _ => {}
        }
    }

    fn choose(&mut self, target: MemoryTarget) {
        self.session.target = Some(target);
        self.enter(RecoveryState::DirectoryCheck);
    }

    fn on_directory_check(&mut self, event: Option<Event>) {
        let Some(target) = self.session.target else {
            self.enter(RecoveryState::Start);
            return;
        };
        match self.open_listing(target) {
            Ok(window) => {
                self.session.listing = Some(window);
                self.session.dir_error = None;
                self.enter(RecoveryState::FileList);
            }
            Err(e) => {
                ringbuf_entry!(Trace::DirectoryFailed(e));
                self.session.dir_error = Some(e);
                if event == Some(ENTER) || event == Some(EXIT) {
                    self.enter(RecoveryState::Start);
                }
            }
        }
    }

    fn open_listing(
        &mut self,
        target: MemoryTarget,
    ) -> Result<FileWindow<S::Dir, NAMES_ON_SCREEN>, StorageError> {
        self.storage.change_directory(target.directory())?;
        let dir = self.storage.open_directory(target)?;
        FileWindow::load(&mut self.storage, dir)
    }

    fn on_file_list(&mut self, event: Option<Event>) {
        let Some(event) = event else { return };
        let Some(window) = self.session.listing.as_mut() else {
            self.enter(RecoveryState::DirectoryCheck);
            return;
        };

        let moved = match (event.key, event.kind) {
            (Key::Down, EventKind::First | EventKind::Repeat) => {
                window.move_down(&mut self.storage)
            }
            (Key::Up, EventKind::First | EventKind::Repeat) => {
                window.move_up(&mut self.storage)
            }
            _ => Ok(()),
        };
        let selection = window.selection_index();

        if let Err(e) = moved {
            ringbuf_entry!(Trace::DirectoryFailed(e));
            self.enter(RecoveryState::DirectoryCheck);
        } else if event == ENTER {
            if let Some(index) = selection {
                self.session.verdict.select(index);
                self.enter(RecoveryState::FlashCheck);
            }
        } else if event == EXIT {
            self.enter(RecoveryState::Start);
        }
    }

    fn on_flash_check(&mut self, event: Option<Event>) {
        let (Some(target), Some(file)) =
            (self.session.target, self.session.selected().cloned())
        else {
            self.enter(RecoveryState::FileList);
            return;
        };

        if self.session.verdict.verdict() == ValidationVerdict::Unchecked {
            let verdict = self.check_candidate(target, &file);
            ringbuf_entry!(Trace::Verdict {
                index: self
                    .session
                    .listing
                    .as_ref()
                    .and_then(|w| w.selection_index()),
                verdict,
            });
            self.session.verdict.set(verdict);
        }

        match (self.session.verdict.verdict(), event) {
            (ValidationVerdict::Valid, Some(LONG_ENTER)) => {
                self.confirm(target, &file)
            }
            (ValidationVerdict::Valid, Some(EXIT)) => {
                self.enter(RecoveryState::FileList)
            }
            (ValidationVerdict::Invalid, Some(ENTER | EXIT)) => {
                self.enter(RecoveryState::FileList)
            }
            _ => {}
        }
    }

    /// Reads the start of `file`'s payload and checks its signature.
    fn check_candidate(
        &mut self,
        target: MemoryTarget,
        file: &CandidateFile,
    ) -> ValidationVerdict {
        let header = self.config.header_len(target);
        if file.size <= header {
            return ValidationVerdict::Invalid;
        }
        let Ok(mut f) = self.storage.open(&file.name) else {
            return ValidationVerdict::Invalid;
        };
        let mut head = [0u8; SIGNATURE_LEN];
        let read = self.read_head(&mut f, header, &mut head);
        self.storage.close(f);
        match read {
            Ok(len) => check_image_start(target, &head[..len], &self.config),
            Err(_) => ValidationVerdict::Invalid,
        }
    }

    fn read_head(
        &mut self,
        file: &mut S::File,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<usize, StorageError> {
        self.storage.seek(file, offset)?;
        let mut len = 0;
        while len < buf.len() {
            let n = self.storage.read_block(file, &mut buf[len..])?;
            if n == 0 {
                break;
            }
            len += n.min(buf.len() - len);
        }
        Ok(len)
    }

    fn confirm(&mut self, target: MemoryTarget, file: &CandidateFile) {
        match self.start_transfer(target, file) {
            Ok(f) => {
                ringbuf_entry!(Trace::TransferStarted {
                    target,
                    total: self.session.writer.total_size(),
                });
                self.session.file = Some(f);
                self.enter(RecoveryState::Flashing);
            }
            Err(e) => {
                ringbuf_entry!(Trace::ConfirmFailed(e));
                self.session.verdict.set(ValidationVerdict::Invalid);
                self.enter(RecoveryState::FileList);
            }
        }
    }

    /// Opens `file` positioned at its payload and stages the first block,
    /// checking the signature again on what will actually be written.
    fn start_transfer(
        &mut self,
        target: MemoryTarget,
        file: &CandidateFile,
    ) -> Result<S::File, RecoveryError> {
        if file.size <= self.config.header_len(target) {
            return Err(RecoveryError::InvalidImage);
        }
        let mut f = self.storage.open(&file.name)?;
        match self.prime_transfer(target, file.size, &mut f) {
            Ok(()) => Ok(f),
            Err(e) => {
                self.storage.close(f);
                Err(e)
            }
        }
    }

    fn prime_transfer(
        &mut self,
        target: MemoryTarget,
        size: u32,
        file: &mut S::File,
    ) -> Result<(), RecoveryError> {
        self.storage.seek(file, self.config.header_len(target))?;
        self.session.writer.begin(target, size, &self.config);
        self.session.writer.prime(&mut self.storage, file)?;
        let staged = self.session.writer.staged();
        match check_image_start(target, staged, &self.config) {
            ValidationVerdict::Valid => Ok(()),
            _ => Err(RecoveryError::InvalidImage),
        }
    }

    fn on_flashing(&mut self) {
        let session = &mut self.session;
        let reason = match session.file.as_mut() {
            Some(file) => {
                session.writer.step(&mut self.storage, file, &mut self.nvm)
            }
            None => Some(CompletionReason::ReadError(StorageError::NotReady)),
        };
        if let Some(reason) = reason {
            ringbuf_entry!(Trace::TransferDone {
                reason,
                written: self.session.writer.bytes_written(),
            });
            self.session.outcome = Some(reason);
            self.enter(RecoveryState::FlashDone);
        }
    }

    fn on_flash_done(&mut self, event: Option<Event>) {
        if event == Some(ENTER) || event == Some(EXIT) {
            self.enter(RecoveryState::Start);
        }
    }

    fn draw(&mut self) {
        let percent = self.progress().percent();
        let s = &self.session;
        let view = match s.state {
            RecoveryState::Start => View::Menu {
                items: &s.menu,
                cursor: s.menu_cursor,
            },
            RecoveryState::UsbLink => View::Usb,
            RecoveryState::DirectoryCheck => match s.dir_error {
                Some(e) => View::Fault {
                    error: RecoveryError::StorageUnavailable,
                    code: e as u32,
                },
                None => View::Blank,
            },
            RecoveryState::FileList => View::FileList {
                files: s.files(),
                cursor: s.listing.as_ref().map_or(0, |w| w.cursor()),
            },
            RecoveryState::FlashCheck => match s.selected() {
                Some(file) => View::Confirm {
                    file,
                    verdict: s.verdict.verdict(),
                },
                None => View::Blank,
            },
            RecoveryState::Flashing => View::Progress { percent },
            RecoveryState::FlashDone => match s.outcome {
                Some(reason) if reason.is_complete() => View::Done { reason },
                Some(reason) => View::Fault {
                    error: reason
                        .error()
                        .unwrap_or(RecoveryError::HardwareFault),
                    code: reason.code(),
                },
                None => View::Blank,
            },
            RecoveryState::Reboot => View::Blank,
        };
        self.display.draw(&Frame {
            state: s.state,
            view,
        });
    }

    pub fn state(&self) -> RecoveryState {
        self.session.state
    }

    pub fn session(&self) -> &RecoverySession<S::Dir, S::File> {
        &self.session
    }

    pub fn progress(&self) -> TransferProgress {
        TransferProgress {
            bytes_written: self.session.writer.bytes_written(),
            total_size: self.session.writer.total_size(),
            unlocked: self.nvm.is_unlocked(),
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.nvm.is_unlocked()
    }

    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn writer(&self) -> &W {
        self.nvm.writer()
    }

    pub fn usb(&self) -> &U {
        &self.usb
    }

    pub fn usb_mut(&mut self) -> &mut U {
        &mut self.usb
    }

    pub fn display(&self) -> &D {
        &self.display
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }
}
