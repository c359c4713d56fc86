// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Inode store contract
//!
//! The store owns the namespace and per-inode attributes. Reads go straight to
//! the store; every mutation goes through a [`Transaction`], which is the only
//! serialization point between writers.

use crate::error::FsResult;
use crate::types::{DirEntry, Ino, InodeAttributes, NewFile, Ownership, SetAttributes};
use std::ffi::OsStr;
use std::path::Path;

/// Persistent directory hierarchy and attribute records
pub trait InodeStore: Send + Sync {
    /// Resolve `name` inside directory `parent`
    fn lookup(&self, parent: Ino, name: &OsStr) -> FsResult<Ino>;

    fn getattr(&self, ino: Ino) -> FsResult<InodeAttributes>;

    /// Target of a symbolic link
    fn readlink(&self, ino: Ino) -> FsResult<Vec<u8>>;

    /// Up to `limit` entries of directory `ino` following the resume cookie
    /// `offset` (`0` starts from the beginning).
    fn readdir(&self, ino: Ino, offset: i64, limit: usize) -> FsResult<Vec<DirEntry>>;

    /// Begin the single active mutation transaction, waiting for any other
    /// writer to finish first.
    fn transaction(&self) -> FsResult<Box<dyn Transaction + '_>>;
}

/// Scoped mutation guard
///
/// Changes become visible on [`Transaction::commit`]. Dropping the guard
/// without committing rolls every change back.
pub trait Transaction {
    fn getattr(&self, ino: Ino) -> FsResult<InodeAttributes>;

    /// Apply exactly the fields present in `changes`
    fn setattr(&mut self, ino: Ino, changes: &SetAttributes) -> FsResult<()>;

    fn mkdir(&mut self, parent: Ino, name: &OsStr, mode: u32, owner: Ownership) -> FsResult<Ino>;

    fn unlink(&mut self, parent: Ino, name: &OsStr) -> FsResult<()>;

    fn rmdir(&mut self, parent: Ino, name: &OsStr) -> FsResult<()>;

    /// Add another entry for an existing inode
    fn link(&mut self, ino: Ino, new_parent: Ino, new_name: &OsStr) -> FsResult<()>;

    fn symlink(
        &mut self,
        target: &Path,
        parent: Ino,
        name: &OsStr,
        owner: Ownership,
    ) -> FsResult<Ino>;

    /// Insert a regular file, typically one backed by a torrent
    fn create_file(&mut self, parent: Ino, name: &OsStr, file: &NewFile) -> FsResult<Ino>;

    /// The kernel dropped its last reference to `ino`; reclaim it if no
    /// directory entry points at it any more.
    fn forget(&mut self, ino: Ino) -> FsResult<()>;

    fn commit(self: Box<Self>) -> FsResult<()>;
}
