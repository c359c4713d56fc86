// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Shared fixtures for the adapter integration tests

#![allow(dead_code)]

use libc::c_int;
use mockall::mock;
use std::ffi::OsStr;
use std::sync::{Arc, Mutex};
use torrentfs_core::{
    Backend, DirEntry, FileHandle, FsResult, Ino, InodeStore, NewFile, Ownership,
    SqliteInodeStore, TorrentFileId,
};
use torrentfs_fuse_host::{DirectoryReply, Reply, ReplyError, TorrentFs};
use torrentfs_logging::test_utils::{capture_logs, LogBuffer};
use torrentfs_logging::Level;

mock! {
    pub TorrentBackend {}

    impl Backend for TorrentBackend {
        fn init(&self) -> FsResult<()>;
        fn destroy(&self);
        fn open(&self, file: &TorrentFileId, flags: i32) -> FsResult<FileHandle>;
        fn read(
            &self,
            file: &TorrentFileId,
            offset: u64,
            size: u32,
            fh: FileHandle,
        ) -> FsResult<Vec<u8>>;
        fn release(&self, file: &TorrentFileId, fh: FileHandle) -> FsResult<()>;
    }
}

/// What a request was answered with
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome<T> {
    Sent(T),
    /// Sent, but the kernel refused it
    Rejected(T),
    Failed(c_int),
}

/// Records every answer given through the paired [`RecordingReply`].
pub struct ReplySlot<T>(Arc<Mutex<Vec<Outcome<T>>>>);

impl<T> ReplySlot<T> {
    /// The single answer; panics unless exactly one was given.
    pub fn take(&self) -> Outcome<T> {
        let mut outcomes = self.0.lock().unwrap();
        assert_eq!(outcomes.len(), 1, "expected exactly one reply");
        outcomes.pop().unwrap()
    }

    pub fn count(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn sent(&self) -> T {
        match self.take() {
            Outcome::Sent(value) => value,
            Outcome::Rejected(_) => panic!("reply was rejected"),
            Outcome::Failed(errno) => panic!("request failed with errno {errno}"),
        }
    }

    pub fn errno(&self) -> c_int {
        match self.take() {
            Outcome::Failed(errno) => errno,
            _ => panic!("request unexpectedly succeeded"),
        }
    }
}

pub struct RecordingReply<T> {
    slot: Arc<Mutex<Vec<Outcome<T>>>>,
    reject: bool,
}

pub fn recorder<T>() -> (RecordingReply<T>, ReplySlot<T>) {
    let slot = Arc::new(Mutex::new(Vec::new()));
    (
        RecordingReply {
            slot: Arc::clone(&slot),
            reject: false,
        },
        ReplySlot(slot),
    )
}

/// A reply the kernel refuses, as when the request was interrupted.
pub fn rejecting_recorder<T>() -> (RecordingReply<T>, ReplySlot<T>) {
    let (mut reply, slot) = recorder();
    reply.reject = true;
    (reply, slot)
}

impl<T: Send> Reply<T> for RecordingReply<T> {
    fn send(self, value: T) -> Result<(), ReplyError> {
        let mut outcomes = self.slot.lock().unwrap();
        if self.reject {
            outcomes.push(Outcome::Rejected(value));
            return Err(ReplyError::Rejected("request interrupted".into()));
        }
        outcomes.push(Outcome::Sent(value));
        Ok(())
    }

    fn fail(self, errno: c_int) {
        self.slot.lock().unwrap().push(Outcome::Failed(errno));
    }
}

/// Directory reply with a kernel-sized buffer.
pub struct RecordingDirectory {
    entries: Arc<Mutex<Vec<DirEntry>>>,
    outcome: RecordingReply<()>,
    capacity: usize,
    used: usize,
}

pub struct DirectorySlot {
    entries: Arc<Mutex<Vec<DirEntry>>>,
    pub outcome: ReplySlot<()>,
}

impl DirectorySlot {
    /// Entries of a successful listing
    pub fn entries(&self) -> Vec<DirEntry> {
        self.outcome.sent();
        self.entries.lock().unwrap().clone()
    }
}

pub fn directory(capacity: usize) -> (RecordingDirectory, DirectorySlot) {
    let entries = Arc::new(Mutex::new(Vec::new()));
    let (outcome, slot) = recorder();
    (
        RecordingDirectory {
            entries: Arc::clone(&entries),
            outcome,
            capacity,
            used: 0,
        },
        DirectorySlot {
            entries,
            outcome: slot,
        },
    )
}

/// Size of a `struct fuse_dirent` carrying `name`
pub fn dirent_size(name: &OsStr) -> usize {
    (24 + name.len() + 7) & !7
}

impl Reply<()> for RecordingDirectory {
    fn send(self, (): ()) -> Result<(), ReplyError> {
        self.outcome.send(())
    }

    fn fail(self, errno: c_int) {
        self.entries.lock().unwrap().clear();
        self.outcome.fail(errno)
    }
}

impl DirectoryReply for RecordingDirectory {
    fn add(&mut self, entry: &DirEntry) -> bool {
        let size = dirent_size(&entry.name);
        if self.used + size > self.capacity {
            return true;
        }
        self.used += size;
        self.entries.lock().unwrap().push(entry.clone());
        false
    }
}

pub const HASH: &str = "abc123";

pub struct Fixture {
    pub fs: TorrentFs,
    pub store: Arc<SqliteInodeStore>,
    pub logs: LogBuffer,
}

pub fn fixture(backend: MockTorrentBackend) -> Fixture {
    fixture_with_level(backend, Level::DEBUG)
}

pub fn fixture_with_level(backend: MockTorrentBackend, level: Level) -> Fixture {
    let store = Arc::new(SqliteInodeStore::open_in_memory(owner()).unwrap());
    let (dispatch, logs) = capture_logs(level);
    let fs = TorrentFs::new(
        Arc::clone(&store) as Arc<dyn InodeStore>,
        Arc::new(backend),
        &Default::default(),
    )
    .with_dispatch(dispatch);
    Fixture { fs, store, logs }
}

pub fn owner() -> Ownership {
    Ownership { uid: 1000, gid: 1000 }
}

/// Insert a read-only regular file backed by torrent `hash`, file `index`.
pub fn add_torrent_file(
    store: &SqliteInodeStore,
    parent: Ino,
    name: &str,
    hash: &str,
    index: u64,
    size: u64,
) -> Ino {
    let mut txn = store.transaction().unwrap();
    let ino = txn
        .create_file(
            parent,
            OsStr::new(name),
            &NewFile {
                mode: 0o444,
                owner: owner(),
                size,
                torrent: Some(TorrentFileId::new(hash, index)),
            },
        )
        .unwrap();
    txn.commit().unwrap();
    ino
}
