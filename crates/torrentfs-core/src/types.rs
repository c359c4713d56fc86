// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core type definitions for torrentfs

use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::time::SystemTime;

/// Kernel-visible inode number
pub type Ino = u64;

/// Inode number reserved for the mount root
pub const ROOT_INO: Ino = 1;

/// Identity of one file inside a torrent: the torrent's info-hash plus the
/// file's index within it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TorrentFileId {
    pub hash: String,
    pub index: u64,
}

impl TorrentFileId {
    pub fn new(hash: impl Into<String>, index: u64) -> Self {
        Self {
            hash: hash.into(),
            index,
        }
    }
}

impl std::fmt::Display for TorrentFileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.hash, self.index)
    }
}

/// Opaque handle identifier issued by a backend
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FileHandle(pub u64);

impl FileHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Node type, derived from the `S_IFMT` bits of the mode
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Directory,
    RegularFile,
    Symlink,
    NamedPipe,
    CharDevice,
    BlockDevice,
    Socket,
}

impl FileKind {
    pub fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT {
            libc::S_IFDIR => FileKind::Directory,
            libc::S_IFLNK => FileKind::Symlink,
            libc::S_IFIFO => FileKind::NamedPipe,
            libc::S_IFCHR => FileKind::CharDevice,
            libc::S_IFBLK => FileKind::BlockDevice,
            libc::S_IFSOCK => FileKind::Socket,
            _ => FileKind::RegularFile,
        }
    }
}

/// Attribute snapshot of one inode
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InodeAttributes {
    pub ino: Ino,
    /// Full mode including the `S_IFMT` type bits
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub rdev: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    /// Info-hash of the torrent holding this file's data
    pub t_hash: Option<String>,
    /// Index of this file within that torrent
    pub t_index: Option<u64>,
}

impl InodeAttributes {
    pub fn kind(&self) -> FileKind {
        FileKind::from_mode(self.mode)
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == FileKind::Directory
    }

    /// Permission bits only
    pub fn perm(&self) -> u16 {
        (self.mode & 0o7777) as u16
    }

    /// Backend address of the inode's data, when it has both torrent fields.
    pub fn torrent_file(&self) -> Option<TorrentFileId> {
        match (&self.t_hash, self.t_index) {
            (Some(hash), Some(index)) => Some(TorrentFileId::new(hash.clone(), index)),
            _ => None,
        }
    }
}

/// Timestamp update requested by `setattr`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeSpec {
    Now,
    At(SystemTime),
}

impl TimeSpec {
    pub fn resolve(self) -> SystemTime {
        match self {
            TimeSpec::Now => SystemTime::now(),
            TimeSpec::At(time) => time,
        }
    }
}

/// Attribute changes; only the fields that are `Some` are applied.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SetAttributes {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<TimeSpec>,
    pub mtime: Option<TimeSpec>,
    pub ctime: Option<SystemTime>,
}

impl SetAttributes {
    /// Names of the fields this change touches
    pub fn fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.mode.is_some() {
            fields.push("mode");
        }
        if self.uid.is_some() {
            fields.push("uid");
        }
        if self.gid.is_some() {
            fields.push("gid");
        }
        if self.size.is_some() {
            fields.push("size");
        }
        if self.atime.is_some() {
            fields.push("atime");
        }
        if self.mtime.is_some() {
            fields.push("mtime");
        }
        if self.ctime.is_some() {
            fields.push("ctime");
        }
        fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields().is_empty()
    }
}

/// Directory entry information
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: Ino,
    /// Resume cookie: passing it back to `readdir` continues after this entry
    pub offset: i64,
    pub kind: FileKind,
    pub name: OsString,
}

/// Owner of a newly created inode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
}

/// Regular file inserted by backend-driven population
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewFile {
    pub mode: u32,
    pub owner: Ownership,
    pub size: u64,
    pub torrent: Option<TorrentFileId>,
}
