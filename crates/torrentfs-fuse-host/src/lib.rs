// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! torrentfs FUSE host
//!
//! [`TorrentFs`] maps FUSE lowlevel requests onto an [`torrentfs_core::InodeStore`]
//! and a [`torrentfs_core::Backend`]. The `fuser` glue lives in `adapter`,
//! compiled only with the `fuse` feature on Linux.

#[cfg(all(feature = "fuse", target_os = "linux"))]
pub mod adapter;
pub mod ops;
pub mod reply;
pub mod workers;

pub use ops::{RequestContext, TorrentFs, NAME_MAX};
pub use reply::{AttrOut, DirectoryReply, EntryOut, OpenOut, Reply, ReplyError, XattrOut};
pub use workers::{worker_count, WorkerPool};
