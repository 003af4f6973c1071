// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scrolling window over a directory of images.
//!
//! Only one screenful of names is kept in memory. Moving the cursor past
//! either edge of the window slides the window by one entry and refetches
//! it from storage, so the list scrolls a line at a time.

use drv_recovery_api::{CandidateFile, Storage, StorageError};
use heapless::Vec;

pub struct FileWindow<D, const N: usize> {
    dir: D,
    files: Vec<CandidateFile, N>,
    /// Listing index of `files[0]`.
    offset: u32,
    /// Index into `files` of the highlighted entry.
    cursor: usize,
    total: u32,
}

impl<D, const N: usize> FileWindow<D, N> {
    /// Loads the first window of `dir`.
    pub fn load<S: Storage<Dir = D>>(
        storage: &mut S,
        dir: D,
    ) -> Result<Self, StorageError> {
        let mut window = Self {
            dir,
            files: Vec::new(),
            offset: 0,
            cursor: 0,
            total: 0,
        };
        window.fetch(storage, 0)?;
        Ok(window)
    }

    fn fetch<S: Storage<Dir = D>>(
        &mut self,
        storage: &mut S,
        offset: u32,
    ) -> Result<(), StorageError> {
        self.files.clear();
        self.total = storage.list_page(&mut self.dir, offset, &mut self.files)?;
        self.offset = offset;
        // The directory may have changed under us.
        self.cursor = self.cursor.min(self.files.len().saturating_sub(1));
        Ok(())
    }

    pub fn move_down<S: Storage<Dir = D>>(
        &mut self,
        storage: &mut S,
    ) -> Result<(), StorageError> {
        if self.cursor + 1 < self.files.len() {
            self.cursor += 1;
        } else if self.offset + (self.files.len() as u32) < self.total {
            self.fetch(storage, self.offset + 1)?;
            self.cursor = self.files.len().saturating_sub(1);
        }
        Ok(())
    }

    pub fn move_up<S: Storage<Dir = D>>(
        &mut self,
        storage: &mut S,
    ) -> Result<(), StorageError> {
        if self.cursor > 0 {
            self.cursor -= 1;
        } else if self.offset > 0 {
            self.fetch(storage, self.offset - 1)?;
            self.cursor = 0;
        }
        Ok(())
    }

    pub fn files(&self) -> &[CandidateFile] {
        &self.files
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn selected(&self) -> Option<&CandidateFile> {
        self.files.get(self.cursor)
    }

    /// Listing index of the highlighted entry.
    pub fn selection_index(&self) -> Option<u32> {
        self.selected().map(|_| self.offset + self.cursor as u32)
    }
}
