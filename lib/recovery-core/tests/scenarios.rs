// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end sessions against in-memory hardware.

use std::collections::BTreeMap;

use proptest::prelude::*;
use recovery_core::api::{
    has_image_extension, CandidateFile, CompletionReason, Display, FileName,
    Frame, MemoryTarget, NvmError, NvmWriter, Platform, RecoveryError,
    RecoveryState, Storage, StorageError, UsbBridge, ValidationVerdict, View,
};
use recovery_core::config::{
    BoardConfig, EepromConfig, FlashConfig, InputConfig, KeyTiming,
    SignatureConfig, BLOCK_LEN,
};
use recovery_core::event::{Event, EventKind, InputChannel, Key, KeyLines};
use recovery_core::sampler::InputSampler;
use recovery_core::{Iteration, RecoveryController};

const HEADER: u32 = 0x8000;
const FLASH_BASE: u32 = 0x0800_0000;

fn board(flash_size: u32) -> BoardConfig {
    BoardConfig {
        name: "bench",
        flash: FlashConfig {
            base: FLASH_BASE,
            size: flash_size,
            bootloader_size: HEADER,
            page_size: 256,
        },
        eeprom: Some(EepromConfig {
            size: 0x8000,
            version: 5,
            header_len: 0x40,
            block_size: 0x40,
        }),
        signature: SignatureConfig {
            stack_mask: 0xFFFE_3000,
            stack_base: 0x2000_0000,
            vector_mask: 0xFFF0_0000,
            vector_base: 0x0800_0000,
        },
        input: InputConfig {
            boot_keys: 0x42,
            encoder_granularity: None,
            power_up_delay_ticks: 2,
            timing: KeyTiming {
                long_delay: 32,
                repeat_delay: 40,
                repeat_trigger: 48,
            },
        },
    }
}

/// A firmware file: loader area, then `payload` bytes starting with a
/// plausible vector table.
fn firmware(payload: usize) -> Vec<u8> {
    let mut image = vec![0xA5; HEADER as usize];
    let mut body: Vec<u8> = (0..payload).map(|i| i as u8).collect();
    let vectors = [0x2001_C000u32, 0x0800_8A01, 0x0800_8B11];
    for (i, v) in vectors.iter().enumerate() {
        body[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
    }
    image.extend(body);
    image
}

fn settings(len: usize) -> Vec<u8> {
    let mut image = vec![0; len];
    image[..4].copy_from_slice(&[5, 0x40, 0, 0x40]);
    image
}

#[derive(Default)]
struct Card {
    ready: bool,
    dirs: BTreeMap<String, Vec<(String, Vec<u8>)>>,
    cwd: String,
    opens: u32,
    open_files: i32,
    polls: u32,
    /// Added to the length of every non-empty read.
    overcount: usize,
}

impl Card {
    fn with(dir: &str, files: &[(&str, Vec<u8>)]) -> Self {
        let mut card = Card {
            ready: true,
            ..Default::default()
        };
        let files =
            files.iter().map(|(n, d)| (n.to_string(), d.clone())).collect();
        card.dirs.insert(dir.to_string(), files);
        card
    }

    fn data(&self, name: &str) -> Option<&Vec<u8>> {
        let dir = self.dirs.get(&self.cwd)?;
        dir.iter().find(|(n, _)| n == name).map(|(_, d)| d)
    }

    fn replace(&mut self, dir: &str, name: &str, data: Vec<u8>) {
        let files = self.dirs.get_mut(dir).unwrap();
        files.iter_mut().find(|(n, _)| n == name).unwrap().1 = data;
    }
}

struct CardFile {
    name: String,
    pos: usize,
}

impl Storage for Card {
    type Dir = Vec<CandidateFile>;
    type File = CardFile;

    fn change_directory(&mut self, path: &str) -> Result<(), StorageError> {
        if !self.ready {
            return Err(StorageError::NotReady);
        }
        if !self.dirs.contains_key(path) {
            return Err(StorageError::NoSuchDirectory);
        }
        self.cwd = path.to_string();
        Ok(())
    }

    fn open_directory(
        &mut self,
        target: MemoryTarget,
    ) -> Result<Self::Dir, StorageError> {
        let files = self
            .dirs
            .get(target.directory())
            .ok_or(StorageError::NoSuchDirectory)?;
        Ok(files
            .iter()
            .filter(|(n, _)| has_image_extension(n))
            .map(|(n, d)| {
                let mut name = FileName::new();
                name.push_str(n).unwrap();
                CandidateFile {
                    name,
                    size: d.len() as u32,
                }
            })
            .collect())
    }

    fn list_page<const N: usize>(
        &mut self,
        dir: &mut Self::Dir,
        start: u32,
        out: &mut heapless::Vec<CandidateFile, N>,
    ) -> Result<u32, StorageError> {
        if !self.ready {
            return Err(StorageError::NotReady);
        }
        for f in dir.iter().skip(start as usize) {
            if out.push(f.clone()).is_err() {
                break;
            }
        }
        Ok(dir.len() as u32)
    }

    fn open(&mut self, name: &str) -> Result<CardFile, StorageError> {
        if !self.ready {
            return Err(StorageError::NotReady);
        }
        self.data(name).ok_or(StorageError::NoSuchFile)?;
        self.opens += 1;
        self.open_files += 1;
        Ok(CardFile {
            name: name.to_string(),
            pos: 0,
        })
    }

    fn seek(
        &mut self,
        file: &mut CardFile,
        offset: u32,
    ) -> Result<(), StorageError> {
        file.pos = offset as usize;
        Ok(())
    }

    fn read_block(
        &mut self,
        file: &mut CardFile,
        buf: &mut [u8],
    ) -> Result<usize, StorageError> {
        let data = self.data(&file.name).ok_or(StorageError::ReadFailed)?;
        let start = file.pos.min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        file.pos += n;
        if n == 0 {
            return Ok(0);
        }
        Ok(n + self.overcount)
    }

    fn close(&mut self, _: CardFile) {
        self.open_files -= 1;
    }

    fn poll(&mut self) {
        self.polls += 1;
    }
}

#[derive(Default)]
struct Nvm {
    unlocked: bool,
    unlocks: u32,
    programs: Vec<(u32, usize)>,
    eeprom: Vec<(u32, usize)>,
    fail: Option<NvmError>,
}

impl NvmWriter for Nvm {
    fn unlock(&mut self) {
        self.unlocked = true;
        self.unlocks += 1;
    }

    fn lock(&mut self) {
        self.unlocked = false;
    }

    fn program_block(
        &mut self,
        address: u32,
        data: &[u8],
    ) -> Result<(), NvmError> {
        assert!(self.unlocked, "programmed {address:#x} while locked");
        if let Some(e) = self.fail {
            return Err(e);
        }
        self.programs.push((address, data.len()));
        Ok(())
    }

    fn write_eeprom_block(
        &mut self,
        offset: u32,
        data: &[u8],
    ) -> Result<(), NvmError> {
        self.eeprom.push((offset, data.len()));
        Ok(())
    }
}

#[derive(Default)]
struct Usb {
    plugged: bool,
    active: bool,
}

impl UsbBridge for Usb {
    fn is_plugged(&mut self) -> bool {
        self.plugged
    }

    fn start_mass_storage(&mut self) {
        self.active = true;
    }

    fn stop_mass_storage(&mut self) {
        self.active = false;
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Shown {
    Menu(usize),
    Usb,
    Fault(RecoveryError, u32),
    Files(Vec<String>, usize),
    Confirm(String, ValidationVerdict),
    Progress(u8),
    Done(CompletionReason),
    Blank,
}

#[derive(Default)]
struct Screen {
    frames: Vec<(RecoveryState, Shown)>,
    blanks: u32,
}

impl Display for Screen {
    fn draw(&mut self, frame: &Frame<'_>) {
        let shown = match frame.view {
            View::Menu { cursor, .. } => Shown::Menu(cursor),
            View::Usb => Shown::Usb,
            View::Fault { error, code } => Shown::Fault(error, code),
            View::FileList { files, cursor } => Shown::Files(
                files.iter().map(|f| f.name.to_string()).collect(),
                cursor,
            ),
            View::Confirm { file, verdict } => {
                Shown::Confirm(file.name.to_string(), verdict)
            }
            View::Progress { percent } => Shown::Progress(percent),
            View::Done { reason } => Shown::Done(reason),
            View::Blank => Shown::Blank,
        };
        self.frames.push((frame.state, shown));
    }

    fn blank(&mut self) {
        self.blanks += 1;
    }
}

#[derive(Default)]
struct Power {
    feeds: u32,
    held: u32,
    off_requested: bool,
    soft_reset: bool,
}

impl Platform for Power {
    fn feed_watchdog(&mut self) {
        self.feeds += 1;
    }

    fn power_button_pressed(&mut self) -> bool {
        if self.held > 0 {
            self.held -= 1;
            true
        } else {
            false
        }
    }

    fn power_off_requested(&mut self) -> bool {
        self.off_requested
    }

    fn power_off(&mut self) -> ! {
        panic!("powered off");
    }

    fn mark_soft_reset(&mut self) {
        self.soft_reset = true;
    }

    fn system_reset(&mut self) -> ! {
        panic!("reset");
    }
}

type Loader<'a> = RecoveryController<'a, Card, Nvm, Usb, Screen, Power>;

struct Rig<'a> {
    input: &'a InputChannel,
    loader: Loader<'a>,
}

impl<'a> Rig<'a> {
    fn new(input: &'a InputChannel, config: BoardConfig, card: Card) -> Self {
        Self::with_nvm(input, config, card, Nvm::default())
    }

    fn with_nvm(
        input: &'a InputChannel,
        config: BoardConfig,
        card: Card,
        nvm: Nvm,
    ) -> Self {
        let loader = RecoveryController::new(
            config,
            input,
            card,
            nvm,
            Usb::default(),
            Screen::default(),
            Power::default(),
        );
        Self { input, loader }
    }

    fn tick(&mut self, event: Option<Event>) -> Iteration {
        if let Some(e) = event {
            self.input.post(e);
        }
        self.input.signal_tick();
        self.loader.iterate()
    }

    fn idle(&mut self) -> Iteration {
        self.tick(None)
    }

    fn press(&mut self, key: Key) -> Iteration {
        self.tick(Some(Event::new(key, EventKind::Break)))
    }

    fn hold(&mut self, key: Key) -> Iteration {
        self.tick(Some(Event::new(key, EventKind::Long)))
    }

    fn step(&mut self, key: Key) -> Iteration {
        self.tick(Some(Event::new(key, EventKind::First)))
    }

    /// From the start menu, picks the `row`th entry and waits for the
    /// listing.
    fn open_listing(&mut self, row: usize) {
        for _ in 0..row {
            self.step(Key::Down);
        }
        self.press(Key::Enter);
        self.idle();
    }

    /// Selects the highlighted file and waits for its verdict.
    fn check_selected(&mut self) {
        self.press(Key::Enter);
        self.idle();
        assert_eq!(self.state(), RecoveryState::FlashCheck);
    }

    fn flash_until_done(&mut self) -> u32 {
        let mut ticks = 0;
        while self.state() == RecoveryState::Flashing {
            self.idle();
            ticks += 1;
            assert!(ticks < 10_000, "transfer never finished");
        }
        ticks
    }

    fn state(&self) -> RecoveryState {
        self.loader.state()
    }

    fn nvm(&self) -> &Nvm {
        self.loader.writer()
    }

    fn card(&self) -> &Card {
        self.loader.storage()
    }

    fn shown(&self) -> &Shown {
        &self.loader.display().frames.last().unwrap().1
    }

    /// States drawn so far, with repeats collapsed.
    fn states(&self) -> Vec<RecoveryState> {
        let mut states: Vec<RecoveryState> =
            self.loader.display().frames.iter().map(|(s, _)| *s).collect();
        states.dedup();
        states
    }
}

#[test]
fn missing_directory_returns_to_start() {
    let input = InputChannel::new();
    let card = Card {
        ready: true,
        ..Default::default()
    };
    let mut rig = Rig::new(&input, board(0x8_0000), card);

    rig.idle();
    rig.press(Key::Enter);
    rig.idle();
    assert_eq!(rig.state(), RecoveryState::DirectoryCheck);
    assert_eq!(
        *rig.shown(),
        Shown::Fault(
            RecoveryError::StorageUnavailable,
            StorageError::NoSuchDirectory as u32
        )
    );

    rig.press(Key::Exit);
    assert_eq!(
        rig.states(),
        [
            RecoveryState::Start,
            RecoveryState::DirectoryCheck,
            RecoveryState::Start
        ]
    );
    assert_eq!(rig.nvm().unlocks, 0);
    assert!(rig.nvm().programs.is_empty());
    assert!(rig.nvm().eeprom.is_empty());
}

#[test]
fn directory_check_retries_until_the_card_is_ready() {
    let input = InputChannel::new();
    let mut card = Card::with("/FIRMWARE", &[("fw.bin", firmware(64))]);
    card.ready = false;
    let mut rig = Rig::new(&input, board(0x8_0000), card);

    rig.open_listing(0);
    assert_eq!(rig.state(), RecoveryState::DirectoryCheck);
    assert_eq!(
        *rig.shown(),
        Shown::Fault(
            RecoveryError::StorageUnavailable,
            StorageError::NotReady as u32
        )
    );

    rig.loader.storage_mut().ready = true;
    rig.idle();
    assert_eq!(rig.state(), RecoveryState::FileList);
    assert_eq!(*rig.shown(), Shown::Files(vec!["fw.bin".into()], 0));
}

#[test]
fn bad_signature_is_refused() {
    let input = InputChannel::new();
    let card = Card::with(
        "/FIRMWARE",
        &[
            ("junk.bin", vec![0; HEADER as usize + 4096]),
            ("readme.txt", vec![0; 10]),
        ],
    );
    let mut rig = Rig::new(&input, board(0x8_0000), card);

    rig.open_listing(0);
    assert_eq!(*rig.shown(), Shown::Files(vec!["junk.bin".into()], 0));

    rig.check_selected();
    assert_eq!(rig.loader.session().verdict(), ValidationVerdict::Invalid);
    assert_eq!(
        *rig.shown(),
        Shown::Confirm("junk.bin".into(), ValidationVerdict::Invalid)
    );

    // An invalid image cannot be confirmed.
    rig.hold(Key::Enter);
    assert_eq!(rig.state(), RecoveryState::FlashCheck);

    rig.press(Key::Exit);
    assert!(rig.states().ends_with(&[
        RecoveryState::FileList,
        RecoveryState::FlashCheck,
        RecoveryState::FileList
    ]));
    assert_eq!(rig.loader.session().verdict(), ValidationVerdict::Invalid);
    assert_eq!(rig.nvm().unlocks, 0);
    assert_eq!(rig.card().open_files, 0);
}

#[test]
fn overcounted_reads_are_clamped() {
    let input = InputChannel::new();
    let mut card = Card::with("/FIRMWARE", &[("fw.bin", firmware(300))]);
    card.overcount = 64;
    let mut rig = Rig::new(&input, board(0x8_0000), card);

    rig.open_listing(0);
    rig.check_selected();
    assert_eq!(rig.loader.session().verdict(), ValidationVerdict::Valid);

    rig.hold(Key::Enter);
    rig.flash_until_done();
    assert_eq!(rig.nvm().programs, [(FLASH_BASE + HEADER, 512)]);
    assert_eq!(*rig.shown(), Shown::Done(CompletionReason::EndOfSource));
}

#[test]
fn image_no_larger_than_the_loader_area_is_invalid() {
    let input = InputChannel::new();
    let card =
        Card::with("/FIRMWARE", &[("tiny.bin", vec![0; HEADER as usize])]);
    let mut rig = Rig::new(&input, board(0x8_0000), card);

    rig.open_listing(0);
    rig.check_selected();
    assert_eq!(rig.loader.session().verdict(), ValidationVerdict::Invalid);
    assert_eq!(rig.card().opens, 0);
}

#[test]
fn firmware_is_written_block_by_block() {
    const PAYLOAD: usize = 128 * 1024;
    let input = InputChannel::new();
    let card = Card::with("/FIRMWARE", &[("fw.bin", firmware(PAYLOAD))]);
    let mut rig = Rig::new(&input, board(HEADER + 0x10_0000), card);

    rig.open_listing(0);
    rig.check_selected();
    assert_eq!(rig.loader.session().verdict(), ValidationVerdict::Valid);
    assert!(!rig.loader.is_unlocked());

    rig.hold(Key::Enter);
    assert_eq!(rig.state(), RecoveryState::Flashing);
    assert!(rig.loader.is_unlocked());
    assert_eq!(*rig.shown(), Shown::Progress(0));

    rig.flash_until_done();
    assert_eq!(rig.state(), RecoveryState::FlashDone);

    let progress = rig.loader.progress();
    assert_eq!(progress.bytes_written, 131_072);
    assert_eq!(progress.total_size, 131_072);
    assert!(!progress.unlocked);

    let programs = &rig.nvm().programs;
    assert_eq!(programs.len(), PAYLOAD.div_ceil(BLOCK_LEN));
    assert_eq!(programs[0], (FLASH_BASE + HEADER, BLOCK_LEN));
    assert!(!rig.nvm().unlocked);
    assert_eq!(rig.card().open_files, 0);
    assert_eq!(
        *rig.shown(),
        Shown::Done(CompletionReason::EndOfSource)
    );

    let percents: Vec<u8> = rig
        .loader
        .display()
        .frames
        .iter()
        .filter_map(|(_, s)| match s {
            Shown::Progress(p) => Some(*p),
            _ => None,
        })
        .collect();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    assert!(percents.iter().all(|&p| p <= 100));

    rig.press(Key::Enter);
    assert_eq!(rig.state(), RecoveryState::Start);
    assert_eq!(rig.loader.session().target(), None);
}

#[test]
fn usb_preempts_the_file_list() {
    let input = InputChannel::new();
    let card = Card::with(
        "/FIRMWARE",
        &[("a.bin", firmware(64)), ("b.bin", firmware(64))],
    );
    let mut rig = Rig::new(&input, board(0x8_0000), card);

    rig.open_listing(0);
    rig.step(Key::Down);
    assert_eq!(
        rig.loader.session().selected().unwrap().name.as_str(),
        "b.bin"
    );

    rig.loader.usb_mut().plugged = true;
    // The key press arriving with the cable is dropped.
    rig.press(Key::Enter);
    assert_eq!(rig.state(), RecoveryState::UsbLink);
    assert_eq!(*rig.shown(), Shown::Usb);
    assert!(rig.loader.usb().active);
    assert!(rig.loader.is_unlocked());
    assert!(rig.loader.session().files().is_empty());
    assert_eq!(rig.loader.session().selected(), None);

    rig.loader.usb_mut().plugged = false;
    rig.idle();
    assert_eq!(rig.state(), RecoveryState::Start);
    assert_eq!(*rig.shown(), Shown::Menu(0));
    assert!(!rig.loader.usb().active);
    assert!(!rig.loader.is_unlocked());
    assert!(!rig.nvm().unlocked);
}

#[test]
fn oversized_image_stops_at_the_backstop() {
    let config = board(HEADER + 4 * BLOCK_LEN as u32);
    let input = InputChannel::new();
    let image = firmware(config.flash_backstop() as usize + 1);
    assert_eq!(image.len(), config.flash.size as usize + 1);
    let card = Card::with("/FIRMWARE", &[("big.bin", image)]);
    let mut rig = Rig::new(&input, config, card);

    rig.open_listing(0);
    rig.check_selected();
    rig.hold(Key::Enter);
    rig.flash_until_done();

    assert_eq!(rig.state(), RecoveryState::FlashDone);
    assert_eq!(
        rig.loader.session().outcome(),
        Some(CompletionReason::Backstop)
    );
    assert_eq!(rig.loader.progress().bytes_written, config.flash_backstop());
    let end = config.flash.base + config.flash.size;
    for &(address, len) in &rig.nvm().programs {
        assert!(address + len as u32 <= end);
    }
    assert_eq!(rig.nvm().programs.len(), 4);
    assert_eq!(*rig.shown(), Shown::Done(CompletionReason::Backstop));
    assert!(!rig.loader.is_unlocked());
}

#[test]
fn settings_go_to_the_eeprom_without_unlocking_flash() {
    let input = InputChannel::new();
    let card = Card::with("/EEPROM", &[("radio.bin", settings(100))]);
    let mut rig = Rig::new(&input, board(0x8_0000), card);

    rig.open_listing(1);
    assert_eq!(rig.loader.session().target(), Some(MemoryTarget::Eeprom));
    rig.check_selected();
    assert_eq!(rig.loader.session().verdict(), ValidationVerdict::Valid);

    rig.hold(Key::Enter);
    assert_eq!(rig.state(), RecoveryState::Flashing);
    assert!(!rig.loader.is_unlocked());
    rig.flash_until_done();

    assert_eq!(rig.nvm().eeprom, [(0, 100)]);
    assert_eq!(rig.nvm().unlocks, 0);
    assert_eq!(*rig.shown(), Shown::Done(CompletionReason::EndOfSource));
}

#[test]
fn firmware_image_is_refused_for_the_eeprom() {
    let input = InputChannel::new();
    let card = Card::with("/EEPROM", &[("fw.bin", firmware(256))]);
    let mut rig = Rig::new(&input, board(0x8_0000), card);

    rig.open_listing(1);
    rig.check_selected();
    assert_eq!(rig.loader.session().verdict(), ValidationVerdict::Invalid);
}

#[test]
fn write_fault_aborts_and_relocks() {
    let input = InputChannel::new();
    let card = Card::with("/FIRMWARE", &[("fw.bin", firmware(3 * BLOCK_LEN))]);
    let nvm = Nvm {
        fail: Some(NvmError::ProgramFailed),
        ..Default::default()
    };
    let mut rig = Rig::with_nvm(&input, board(0x8_0000), card, nvm);

    rig.open_listing(0);
    rig.check_selected();
    rig.hold(Key::Enter);
    rig.idle();

    assert_eq!(rig.state(), RecoveryState::FlashDone);
    assert_eq!(
        *rig.shown(),
        Shown::Fault(
            RecoveryError::HardwareFault,
            NvmError::ProgramFailed as u32
        )
    );
    assert!(!rig.loader.is_unlocked());
    assert!(!rig.nvm().unlocked);
    assert_eq!(rig.card().open_files, 0);
}

#[test]
fn image_changed_before_confirmation_is_refused() {
    let input = InputChannel::new();
    let card = Card::with("/FIRMWARE", &[("fw.bin", firmware(BLOCK_LEN))]);
    let mut rig = Rig::new(&input, board(0x8_0000), card);

    rig.open_listing(0);
    rig.check_selected();
    assert_eq!(rig.loader.session().verdict(), ValidationVerdict::Valid);

    rig.loader.storage_mut().replace(
        "/FIRMWARE",
        "fw.bin",
        vec![0; HEADER as usize + BLOCK_LEN],
    );
    rig.hold(Key::Enter);

    assert_eq!(rig.state(), RecoveryState::FileList);
    assert_eq!(rig.loader.session().verdict(), ValidationVerdict::Invalid);
    assert_eq!(rig.nvm().unlocks, 0);
    assert_eq!(rig.card().open_files, 0);
}

#[test]
fn verdict_is_remembered_for_the_same_selection() {
    let input = InputChannel::new();
    let card = Card::with(
        "/FIRMWARE",
        &[("a.bin", firmware(64)), ("b.bin", firmware(64))],
    );
    let mut rig = Rig::new(&input, board(0x8_0000), card);

    rig.open_listing(0);
    rig.check_selected();
    assert_eq!(rig.card().opens, 1);

    rig.press(Key::Exit);
    assert_eq!(rig.state(), RecoveryState::FileList);
    rig.check_selected();
    assert_eq!(rig.card().opens, 1);
    assert_eq!(rig.loader.session().verdict(), ValidationVerdict::Valid);

    rig.press(Key::Exit);
    rig.step(Key::Down);
    rig.check_selected();
    assert_eq!(rig.card().opens, 2);
    assert_eq!(
        *rig.shown(),
        Shown::Confirm("b.bin".into(), ValidationVerdict::Valid)
    );
}

#[test]
fn usb_during_a_transfer_abandons_it() {
    let input = InputChannel::new();
    let card = Card::with("/FIRMWARE", &[("fw.bin", firmware(8 * BLOCK_LEN))]);
    let mut rig = Rig::new(&input, board(0x8_0000), card);

    rig.open_listing(0);
    rig.check_selected();
    rig.hold(Key::Enter);
    rig.idle();
    rig.idle();
    assert_eq!(rig.state(), RecoveryState::Flashing);

    rig.loader.usb_mut().plugged = true;
    rig.idle();
    assert_eq!(rig.state(), RecoveryState::UsbLink);
    assert_eq!(rig.card().open_files, 0);
    assert!(rig.loader.is_unlocked());
    assert_eq!(rig.nvm().unlocks, 1);

    rig.loader.usb_mut().plugged = false;
    rig.idle();
    assert_eq!(rig.state(), RecoveryState::Start);
    assert!(!rig.nvm().unlocked);
}

#[test]
fn watchdog_is_fed_once_per_iteration() {
    let input = InputChannel::new();
    let card = Card::with("/FIRMWARE", &[("fw.bin", firmware(4 * BLOCK_LEN))]);
    let mut rig = Rig::new(&input, board(0x8_0000), card);

    for _ in 0..5 {
        rig.loader.iterate();
    }
    assert_eq!(rig.loader.platform().feeds, 5);

    rig.open_listing(0);
    rig.check_selected();
    rig.hold(Key::Enter);
    let ticks = rig.flash_until_done();
    // Five idle loops, two to list, two to check, one to confirm.
    assert_eq!(rig.loader.platform().feeds, 5 + 2 + 2 + 1 + ticks);
}

#[test]
fn prologue_waits_for_the_power_button() {
    let input = InputChannel::new();
    let mut rig = Rig::new(&input, board(0x8_0000), Card::default());
    rig.loader.platform_mut().held = 3;
    rig.loader.prologue();
    assert_eq!(rig.loader.platform().feeds, 3);
    assert!(!rig.loader.platform_mut().power_button_pressed());
}

#[test]
fn power_off_is_ignored_while_flashing() {
    let input = InputChannel::new();
    let card = Card::with("/FIRMWARE", &[("fw.bin", firmware(4 * BLOCK_LEN))]);
    let mut rig = Rig::new(&input, board(0x8_0000), card);

    rig.open_listing(0);
    rig.check_selected();
    rig.hold(Key::Enter);
    rig.loader.platform_mut().off_requested = true;
    assert_eq!(rig.idle(), Iteration::Continue);
    rig.flash_until_done();
    assert_eq!(rig.idle(), Iteration::PowerOff);
}

#[test]
fn power_off_from_the_menu() {
    let input = InputChannel::new();
    let mut rig = Rig::new(&input, board(0x8_0000), Card::default());
    assert_eq!(rig.idle(), Iteration::Continue);
    rig.loader.platform_mut().off_requested = true;
    assert_eq!(rig.loader.iterate(), Iteration::PowerOff);
}

#[test]
fn long_exit_reboots_from_anywhere() {
    let input = InputChannel::new();
    let card = Card::with("/FIRMWARE", &[("fw.bin", firmware(8 * BLOCK_LEN))]);
    let mut rig = Rig::new(&input, board(0x8_0000), card);

    rig.open_listing(0);
    rig.check_selected();
    rig.hold(Key::Enter);
    rig.idle();
    assert_eq!(rig.state(), RecoveryState::Flashing);

    assert_eq!(rig.hold(Key::Exit), Iteration::Reset);
    assert_eq!(rig.state(), RecoveryState::Reboot);
    assert_eq!(rig.loader.display().blanks, 1);
    assert!(rig.loader.platform().soft_reset);
    assert!(!rig.nvm().unlocked);
    assert_eq!(rig.card().open_files, 0);
}

#[test]
fn menu_cursor_is_bounded() {
    let input = InputChannel::new();
    let mut rig = Rig::new(&input, board(0x8_0000), Card::default());

    rig.step(Key::Up);
    assert_eq!(*rig.shown(), Shown::Menu(0));
    for _ in 0..5 {
        rig.step(Key::Down);
    }
    assert_eq!(*rig.shown(), Shown::Menu(2));
    // Repeats do not move the menu.
    rig.tick(Some(Event::new(Key::Up, EventKind::Repeat)));
    assert_eq!(*rig.shown(), Shown::Menu(2));

    // The last row is Exit.
    assert_eq!(rig.press(Key::Enter), Iteration::Reset);
    assert!(rig.loader.platform().soft_reset);
}

#[test]
fn storage_is_polled_after_the_power_up_delay() {
    let input = InputChannel::new();
    let mut rig = Rig::new(&input, board(0x8_0000), Card::default());
    rig.idle();
    rig.idle();
    assert_eq!(rig.card().polls, 0);
    for _ in 0..3 {
        rig.idle();
    }
    assert_eq!(rig.card().polls, 3);
}

#[test]
fn sampled_keys_drive_the_menu() {
    let input = InputChannel::new();
    let config = board(0x8_0000);
    let mut sampler = InputSampler::new(&config.input);
    let mut rig = Rig::new(&input, config, Card::default());

    // Tap Enter: held for a few ticks, then released.
    for t in 0..10 {
        let lines = if t < 4 {
            KeyLines::ENTER
        } else {
            KeyLines::empty()
        };
        sampler.on_tick(lines, 0, &input);
        rig.loader.iterate();
    }
    assert_eq!(rig.state(), RecoveryState::DirectoryCheck);
    assert_eq!(rig.loader.session().target(), Some(MemoryTarget::Flash));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn writes_never_pass_the_backstop(payload in 12usize..3 * BLOCK_LEN) {
        let config = board(HEADER + 2 * BLOCK_LEN as u32);
        let input = InputChannel::new();
        let card = Card::with("/FIRMWARE", &[("fw.bin", firmware(payload))]);
        let mut rig = Rig::new(&input, config, card);

        rig.open_listing(0);
        rig.check_selected();
        rig.hold(Key::Enter);
        rig.flash_until_done();

        let backstop = config.flash_backstop();
        let written = rig.loader.progress().bytes_written;
        prop_assert_eq!(written, (payload as u32).min(backstop));
        let expected = if payload as u32 >= backstop {
            CompletionReason::Backstop
        } else {
            CompletionReason::EndOfSource
        };
        prop_assert_eq!(rig.loader.session().outcome(), Some(expected));

        let end = config.flash.base + config.flash.size;
        for &(address, len) in &rig.nvm().programs {
            prop_assert!(address + len as u32 <= end);
        }
        prop_assert!(!rig.nvm().unlocked);
    }

    #[test]
    fn flash_is_unlocked_only_for_usb_or_flashing(
        ticks in proptest::collection::vec(
            (
                proptest::option::of((0usize..4, 0usize..4)),
                any::<bool>(),
            ),
            1..200,
        ),
    ) {
        let input = InputChannel::new();
        let mut card = Card::with(
            "/FIRMWARE",
            &[
                ("a.bin", firmware(3 * BLOCK_LEN)),
                ("b.bin", vec![0; HEADER as usize + 64]),
            ],
        );
        card.dirs.insert(
            "/EEPROM".to_string(),
            vec![("radio.bin".to_string(), settings(100))],
        );
        let mut rig = Rig::new(&input, board(0x8_0000), card);

        for (event, toggle_usb) in ticks {
            if toggle_usb {
                let usb = rig.loader.usb_mut();
                usb.plugged = !usb.plugged;
            }
            let event = event.map(|(key, kind)| {
                let kind = [
                    EventKind::First,
                    EventKind::Repeat,
                    EventKind::Long,
                    EventKind::Break,
                ][kind];
                Event::new(Key::ALL[key], kind)
            });
            let outcome = rig.tick(event);

            let state = rig.state();
            let allowed = matches!(
                state,
                RecoveryState::UsbLink | RecoveryState::Flashing
            );
            prop_assert!(!rig.loader.is_unlocked() || allowed, "{:?}", state);
            prop_assert!(!rig.nvm().unlocked || allowed, "{:?}", state);
            if outcome == Iteration::Reset {
                break;
            }
        }
    }
}
