// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Reply channel abstraction
//!
//! Handlers answer through these traits rather than the `fuser` reply types
//! directly. Every reply value is consumed by the call that answers it, so a
//! request cannot be answered twice.

use libc::c_int;
use std::time::Duration;
use torrentfs_core::{DirEntry, FileHandle, InodeAttributes};

#[derive(Debug, thiserror::Error)]
pub enum ReplyError {
    /// The kernel refused the reply, e.g. because the request was interrupted.
    #[error("kernel rejected the reply: {0}")]
    Rejected(String),
}

/// A one-shot answer to a single request.
pub trait Reply<T>: Send {
    fn send(self, value: T) -> Result<(), ReplyError>;

    fn fail(self, errno: c_int);
}

/// Directory listing reply with a bounded buffer.
pub trait DirectoryReply: Reply<()> {
    /// Buffer `entry`. Returns `true` when the buffer is full and the entry
    /// was not added.
    fn add(&mut self, entry: &DirEntry) -> bool;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttrOut {
    pub attr: InodeAttributes,
    pub ttl: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryOut {
    pub attr: InodeAttributes,
    pub attr_ttl: Duration,
    pub entry_ttl: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenOut {
    pub fh: FileHandle,
    pub keep_cache: bool,
}

/// Answer to `getxattr`/`listxattr`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum XattrOut {
    /// Size probe answer (`size == 0` in the request)
    Size(u32),
    Data(Vec<u8>),
}
