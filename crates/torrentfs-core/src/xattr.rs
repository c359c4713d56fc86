// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Extended attributes exposing the torrent identity of an inode

use crate::error::{FsError, FsResult};
use crate::types::InodeAttributes;
use std::ffi::OsStr;

/// The closed set of extended attributes torrentfs answers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TorrentXattr {
    /// `user.hash`, backed by `t_hash`
    Hash,
    /// `user.index`, backed by `t_index`
    Index,
}

impl TorrentXattr {
    pub const ALL: [TorrentXattr; 2] = [TorrentXattr::Hash, TorrentXattr::Index];

    pub fn name(self) -> &'static str {
        match self {
            TorrentXattr::Hash => "user.hash",
            TorrentXattr::Index => "user.index",
        }
    }

    pub fn from_name(name: &OsStr) -> Option<Self> {
        Self::ALL.into_iter().find(|xattr| OsStr::new(xattr.name()) == name)
    }

    /// Encoded value, or `None` when the backing field is unset.
    pub fn value(self, attr: &InodeAttributes) -> Option<Vec<u8>> {
        match self {
            TorrentXattr::Hash => attr.t_hash.as_ref().map(|hash| hash.as_bytes().to_vec()),
            TorrentXattr::Index => attr.t_index.map(|index| index.to_string().into_bytes()),
        }
    }
}

/// Attributes present on the inode, in declaration order.
pub fn present(attr: &InodeAttributes) -> Vec<TorrentXattr> {
    TorrentXattr::ALL.into_iter().filter(|xattr| xattr.value(attr).is_some()).collect()
}

/// `listxattr` payload: NUL-terminated names of the present attributes.
pub fn list(attr: &InodeAttributes) -> Vec<u8> {
    let mut buffer = Vec::new();
    for xattr in present(attr) {
        buffer.extend_from_slice(xattr.name().as_bytes());
        buffer.push(0);
    }
    buffer
}

/// `getxattr` payload. Unknown names and unset fields are both `ENODATA`.
pub fn get(attr: &InodeAttributes, name: &OsStr) -> FsResult<Vec<u8>> {
    TorrentXattr::from_name(name).and_then(|xattr| xattr.value(attr)).ok_or(FsError::NoData)
}
