// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Data backend contract
//!
//! A backend turns a `(torrent hash, file index)` pair and a byte range into
//! data. Calls may block for as long as the data takes to arrive.

use crate::error::FsResult;
use crate::types::{FileHandle, TorrentFileId};

pub trait Backend: Send + Sync {
    /// Called once when the filesystem is mounted
    fn init(&self) -> FsResult<()> {
        Ok(())
    }

    /// Called once when the filesystem is unmounted
    fn destroy(&self) {}

    fn open(&self, file: &TorrentFileId, flags: i32) -> FsResult<FileHandle>;

    /// Read up to `size` bytes at `offset`; fewer bytes only at end of file.
    fn read(
        &self,
        file: &TorrentFileId,
        offset: u64,
        size: u32,
        fh: FileHandle,
    ) -> FsResult<Vec<u8>>;

    fn release(&self, file: &TorrentFileId, fh: FileHandle) -> FsResult<()>;
}
