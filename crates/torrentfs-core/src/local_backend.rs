// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Backend serving torrent files already present on local disk
//!
//! File `index` of torrent `hash` lives at `<root>/<hash>/<index>`.

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::backend::Backend;
use crate::error::{FsError, FsResult};
use crate::types::{FileHandle, TorrentFileId};

pub struct LocalBackend {
    root: PathBuf,
    handles: Mutex<HashMap<u64, Arc<File>>>,
    next_handle: AtomicU64,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// On-disk location of a torrent file. The hash must be hex so it can
    /// never name anything outside `root`.
    pub fn path_of(&self, file: &TorrentFileId) -> FsResult<PathBuf> {
        if file.hash.is_empty() || hex::decode(&file.hash).is_err() {
            return Err(FsError::InvalidArgument);
        }
        Ok(self.root.join(&file.hash).join(file.index.to_string()))
    }

    pub fn open_handles(&self) -> usize {
        self.handles().len()
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<u64, Arc<File>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Backend for LocalBackend {
    fn init(&self) -> FsResult<()> {
        if !self.root.is_dir() {
            return Err(FsError::NotADirectory);
        }
        info!(target: "torrentfs::backend", root = %self.root.display(), "local backend ready");
        Ok(())
    }

    fn destroy(&self) {
        let leaked = {
            let mut handles = self.handles();
            let leaked = handles.len();
            handles.clear();
            leaked
        };
        if leaked > 0 {
            info!(target: "torrentfs::backend", leaked, "closing handles left open at unmount");
        }
    }

    fn open(&self, file: &TorrentFileId, _flags: i32) -> FsResult<FileHandle> {
        let path = self.path_of(file)?;
        let opened = File::open(&path)?;
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.handles().insert(id, Arc::new(opened));
        debug!(target: "torrentfs::backend", %file, fh = id, "opened");
        Ok(FileHandle::new(id))
    }

    fn read(
        &self,
        _file: &TorrentFileId,
        offset: u64,
        size: u32,
        fh: FileHandle,
    ) -> FsResult<Vec<u8>> {
        let handle = self.handles().get(&fh.0).cloned().ok_or(FsError::BadFileDescriptor)?;

        let mut buffer = vec![0u8; size as usize];
        let mut filled = 0;
        while filled < buffer.len() {
            let read = handle.read_at(&mut buffer[filled..], offset + filled as u64)?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        buffer.truncate(filled);
        Ok(buffer)
    }

    fn release(&self, file: &TorrentFileId, fh: FileHandle) -> FsResult<()> {
        self.handles().remove(&fh.0).ok_or(FsError::BadFileDescriptor)?;
        debug!(target: "torrentfs::backend", %file, fh = fh.0, "released");
        Ok(())
    }
}
