// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! torrentfs core: the inode store, the data backend contract and the
//! torrent-identity xattrs shared by the FUSE host.

pub mod backend;
pub mod config;
pub mod error;
pub mod local_backend;
pub mod sqlite;
pub mod store;
pub mod types;
pub mod xattr;

pub use backend::Backend;
pub use config::{CacheConfig, FsConfig, WorkerConfig};
pub use error::{FsError, FsResult};
pub use local_backend::LocalBackend;
pub use sqlite::SqliteInodeStore;
pub use store::{InodeStore, Transaction};
pub use types::{
    DirEntry, FileHandle, FileKind, Ino, InodeAttributes, NewFile, Ownership, SetAttributes,
    TimeSpec, TorrentFileId, ROOT_INO,
};
pub use xattr::TorrentXattr;
