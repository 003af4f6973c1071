// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! API crate for the firmware recovery loader.
//!
//! This holds the vocabulary shared between the recovery controller and the
//! hardware it drives: the controller's states, the memory targets, candidate
//! files, error codes, the frame handed to the display, and one trait per
//! collaborator (removable storage, the flash/EEPROM writer, the USB
//! mass-storage bridge, the display and the board's power/reset/watchdog
//! plumbing).
//!
//! The controller is generic over these traits, so the same state machine
//! runs against the real drivers on the transmitter and against fakes in
//! host tests.

#![cfg_attr(not(test), no_std)]

use num_derive::FromPrimitive;

/// Longest file name we will show or open, in bytes.
pub const NAME_LEN: usize = 64;

/// Bounded file name as handed out by the storage gateway.
pub type FileName = heapless::String<NAME_LEN>;

/// File extension of recovery images.
pub const IMAGE_EXTENSION: &str = ".bin";

/// Returns true if `name` ends in [`IMAGE_EXTENSION`], ignoring ASCII case.
pub fn has_image_extension(name: &str) -> bool {
    let ext = IMAGE_EXTENSION.len();
    name.len() > ext
        && name.is_char_boundary(name.len() - ext)
        && name[name.len() - ext..].eq_ignore_ascii_case(IMAGE_EXTENSION)
}

/// State of the recovery controller. Exactly one is active at a time.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum RecoveryState {
    Start = 0,
    UsbLink,
    DirectoryCheck,
    FileList,
    FlashCheck,
    Flashing,
    FlashDone,
    Reboot,
}

/// Which non-volatile memory a session writes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryTarget {
    Flash,
    Eeprom,
}

impl MemoryTarget {
    /// Directory on removable storage that holds images for this target.
    pub fn directory(self) -> &'static str {
        match self {
            MemoryTarget::Flash => "/FIRMWARE",
            MemoryTarget::Eeprom => "/EEPROM",
        }
    }
}

/// Rows of the start menu.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MenuItem {
    Flash,
    Eeprom,
    Exit,
}

/// A file offered for writing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CandidateFile {
    pub name: FileName,
    /// Size in bytes, as reported by the directory entry.
    pub size: u32,
}

/// Outcome of the signature check on a selected file.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum ValidationVerdict {
    #[default]
    Unchecked,
    Valid,
    Invalid,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u32)]
pub enum StorageError {
    /// No card present, or the filesystem is not mounted.
    NotReady = 1,
    NoSuchDirectory,
    NoSuchFile,
    ReadFailed,
    SeekFailed,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u32)]
pub enum NvmError {
    /// A program operation was attempted with the flash controller locked.
    Locked = 1,
    /// Address or length does not meet the programming granularity.
    Misaligned,
    OutOfRange,
    ProgramFailed,
    EraseFailed,
    Timeout,
    /// The board has no EEPROM.
    NoEeprom,
    /// The EEPROM did not acknowledge on the I2C bus.
    Bus,
}

/// Error taxonomy of a recovery session, as shown on screen.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u32)]
pub enum RecoveryError {
    StorageUnavailable = 1,
    InvalidImage,
    CapacityExceeded,
    HardwareFault,
}

impl From<StorageError> for RecoveryError {
    fn from(_: StorageError) -> Self {
        RecoveryError::StorageUnavailable
    }
}

impl From<NvmError> for RecoveryError {
    fn from(_: NvmError) -> Self {
        RecoveryError::HardwareFault
    }
}

/// Why a transfer stopped.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CompletionReason {
    /// The source ran out of data.
    EndOfSource,
    /// The capacity backstop was reached before the source ran out.
    Backstop,
    /// Reading the source failed part way through.
    ReadError(StorageError),
    /// The writer reported a fault; the target contents are suspect.
    WriteFault(NvmError),
}

impl CompletionReason {
    /// True for the two reasons that count as a finished write.
    pub fn is_complete(self) -> bool {
        matches!(
            self,
            CompletionReason::EndOfSource | CompletionReason::Backstop
        )
    }

    /// Error to report for this reason, if any. Reaching the backstop is
    /// reported as `CapacityExceeded` even though the write completed.
    pub fn error(self) -> Option<RecoveryError> {
        match self {
            CompletionReason::EndOfSource => None,
            CompletionReason::Backstop => Some(RecoveryError::CapacityExceeded),
            CompletionReason::ReadError(e) => Some(e.into()),
            CompletionReason::WriteFault(e) => Some(e.into()),
        }
    }

    /// Numeric code of the collaborator error behind this reason, or zero.
    pub fn code(self) -> u32 {
        match self {
            CompletionReason::ReadError(e) => e as u32,
            CompletionReason::WriteFault(e) => e as u32,
            _ => 0,
        }
    }
}

/// What the display should show this tick.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Frame<'a> {
    pub state: RecoveryState,
    pub view: View<'a>,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum View<'a> {
    Menu {
        items: &'a [MenuItem],
        cursor: usize,
    },
    Usb,
    /// An error screen. `code` is the numeric value of the underlying
    /// collaborator error, zero if there is none.
    Fault {
        error: RecoveryError,
        code: u32,
    },
    FileList {
        files: &'a [CandidateFile],
        /// Index of the highlighted row within `files`.
        cursor: usize,
    },
    Confirm {
        file: &'a CandidateFile,
        verdict: ValidationVerdict,
    },
    Progress {
        percent: u8,
    },
    Done {
        reason: CompletionReason,
    },
    Blank,
}

/// Block-oriented filesystem on removable storage.
///
/// Reads are whole-buffer where possible; a short read does not imply the
/// end of the file, only a read of zero bytes does.
pub trait Storage {
    type Dir;
    type File;

    /// Makes `path` the current directory for later `open` calls.
    fn change_directory(&mut self, path: &str) -> Result<(), StorageError>;

    /// Opens the image listing for `target`'s directory.
    fn open_directory(
        &mut self,
        target: MemoryTarget,
    ) -> Result<Self::Dir, StorageError>;

    /// Fills `out` with image files starting at index `start` of the
    /// listing, up to `out`'s capacity, and returns the total number of
    /// image files in the directory.
    fn list_page<const N: usize>(
        &mut self,
        dir: &mut Self::Dir,
        start: u32,
        out: &mut heapless::Vec<CandidateFile, N>,
    ) -> Result<u32, StorageError>;

    fn open(&mut self, name: &str) -> Result<Self::File, StorageError>;

    /// Moves the read position to `offset` bytes from the start.
    fn seek(
        &mut self,
        file: &mut Self::File,
        offset: u32,
    ) -> Result<(), StorageError>;

    /// Reads up to `buf.len()` bytes. `Ok(0)` means end of file.
    fn read_block(
        &mut self,
        file: &mut Self::File,
        buf: &mut [u8],
    ) -> Result<usize, StorageError>;

    fn close(&mut self, file: Self::File);

    /// Card-detect and housekeeping; called once per tick once the
    /// power-up delay has passed.
    fn poll(&mut self) {}
}

/// Owner of the on-chip flash controller and the EEPROM.
pub trait NvmWriter {
    fn unlock(&mut self);
    fn lock(&mut self);

    /// Programs `data` into flash at absolute `address`. `data` is a whole
    /// number of flash pages.
    fn program_block(&mut self, address: u32, data: &[u8])
        -> Result<(), NvmError>;

    /// Writes `data` into the EEPROM at byte `offset`.
    fn write_eeprom_block(
        &mut self,
        offset: u32,
        data: &[u8],
    ) -> Result<(), NvmError>;
}

/// USB device port with a mass-storage personality exposing raw memory.
pub trait UsbBridge {
    fn is_plugged(&mut self) -> bool;
    fn start_mass_storage(&mut self);
    fn stop_mass_storage(&mut self);
}

pub trait Display {
    fn draw(&mut self, frame: &Frame<'_>);

    /// Clears the screen and turns the backlight off.
    fn blank(&mut self);
}

/// Board-level services that are neither storage nor memory.
pub trait Platform {
    fn feed_watchdog(&mut self);
    fn power_button_pressed(&mut self) -> bool;
    fn power_off_requested(&mut self) -> bool;
    fn power_off(&mut self) -> !;

    /// Leaves a marker in battery-backed memory telling the application the
    /// reset was requested.
    fn mark_soft_reset(&mut self);
    fn system_reset(&mut self) -> !;
}
