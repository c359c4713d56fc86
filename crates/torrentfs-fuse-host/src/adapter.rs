// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! `fuser` glue
//!
//! Converts `fuser` requests into [`TorrentFs`] calls. Requests that may
//! block on the backend (`open`, `read`, `release`) are handed to the worker
//! pool so the session thread keeps serving metadata requests.

#[cfg(not(all(feature = "fuse", target_os = "linux")))]
compile_error!("This module requires the 'fuse' feature on Linux");

use fuser::{
    consts::FOPEN_KEEP_CACHE, FileAttr, FileType, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyXattr, Request, TimeOrNow,
};
use libc::c_int;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use torrentfs_core::{DirEntry, FileKind, FsConfig, InodeAttributes, SetAttributes, TimeSpec};
use tracing::{info, warn};

use crate::ops::{RequestContext, TorrentFs};
use crate::reply::{AttrOut, DirectoryReply, EntryOut, OpenOut, Reply, ReplyError, XattrOut};
use crate::workers::{worker_count, WorkerPool};

pub const MAX_BACKGROUND_ENV: &str = "TORRENTFS_FUSE_MAX_BACKGROUND";

/// torrentfs mounted through `fuser`
pub struct TorrentFsFuse {
    fs: Arc<TorrentFs>,
    workers: Option<WorkerPool>,
    max_background: u16,
}

impl TorrentFsFuse {
    pub fn new(fs: TorrentFs, config: &FsConfig) -> Self {
        let workers = WorkerPool::new(worker_count(&config.workers));
        Self {
            fs: Arc::new(fs),
            workers: Some(workers),
            max_background: desired_max_background(config.workers.max_background),
        }
    }

    pub fn worker_threads(&self) -> usize {
        self.workers.as_ref().map_or(0, WorkerPool::threads)
    }

    fn offload(&self, job: impl FnOnce(&TorrentFs) + Send + 'static) {
        let fs = Arc::clone(&self.fs);
        match &self.workers {
            Some(workers) => workers.submit(move || job(&fs)),
            None => job(&fs),
        }
    }
}

impl From<&Request<'_>> for RequestContext {
    fn from(req: &Request<'_>) -> Self {
        RequestContext {
            uid: req.uid(),
            gid: req.gid(),
            pid: req.pid(),
        }
    }
}

impl fuser::Filesystem for TorrentFsFuse {
    fn init(&mut self, _req: &Request, config: &mut fuser::KernelConfig) -> Result<(), c_int> {
        let (max_background, clamped) = configure_max_background(config, self.max_background);
        if clamped {
            warn!(
                target: "torrentfs::fuse",
                max_background,
                desired = self.max_background,
                "kernel limited max_background"
            );
        }
        let (congestion, clamped) = configure_congestion_threshold(config, max_background);
        if clamped {
            warn!(target: "torrentfs::fuse", congestion, "kernel limited congestion_threshold");
        }
        info!(
            target: "torrentfs::fuse",
            max_background,
            congestion_threshold = congestion,
            worker_threads = self.worker_threads(),
            "FUSE session negotiated"
        );
        self.fs.init()
    }

    fn destroy(&mut self) {
        // Let queued reads and releases finish before the backend goes away.
        drop(self.workers.take());
        self.fs.destroy();
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        self.fs.forget(ino, nlookup);
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        self.fs.lookup(parent, name, reply);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        self.fs.getattr(ino, reply);
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let changes = SetAttributes {
            mode,
            uid,
            gid,
            size,
            atime: atime.map(time_spec),
            mtime: mtime.map(time_spec),
            ctime,
        };
        self.fs.setattr(ino, changes, fh, reply);
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        self.fs.readlink(ino, reply);
    }

    fn mkdir(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        self.fs.mkdir(req.into(), parent, name, mode, reply);
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.fs.unlink(parent, name, reply);
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.fs.rmdir(parent, name, reply);
    }

    fn symlink(
        &mut self,
        req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        self.fs.symlink(req.into(), parent, link_name, target, reply);
    }

    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        self.fs.link(ino, newparent, newname, reply);
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        self.offload(move |fs| fs.open(ino, flags, reply));
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        self.offload(move |fs| fs.read(ino, fh, offset, size, reply));
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.offload(move |fs| fs.release(ino, fh, reply));
    }

    fn readdir(&mut self, _req: &Request, ino: u64, _fh: u64, offset: i64, reply: ReplyDirectory) {
        self.fs.readdir(ino, offset, reply);
    }

    fn getxattr(&mut self, _req: &Request, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        self.fs.getxattr(ino, name, size, reply);
    }

    fn listxattr(&mut self, _req: &Request, ino: u64, size: u32, reply: ReplyXattr) {
        self.fs.listxattr(ino, size, reply);
    }
}

// `fuser` replies do not report delivery failures, so `send` always succeeds
// and the release-on-rejected-open path in `TorrentFs::open` never runs under
// `fuser`. Handles the kernel never releases are closed by `Backend::destroy`
// at unmount (`LocalBackend::destroy` clears its table).

impl Reply<AttrOut> for ReplyAttr {
    fn send(self, out: AttrOut) -> Result<(), ReplyError> {
        self.attr(&out.ttl, &file_attr(&out.attr));
        Ok(())
    }

    fn fail(self, errno: c_int) {
        self.error(errno);
    }
}

impl Reply<EntryOut> for ReplyEntry {
    fn send(self, out: EntryOut) -> Result<(), ReplyError> {
        // One TTL on the wire; the entry TTL covers the name binding.
        self.entry(&out.entry_ttl, &file_attr(&out.attr), 0);
        Ok(())
    }

    fn fail(self, errno: c_int) {
        self.error(errno);
    }
}

impl Reply<OpenOut> for ReplyOpen {
    fn send(self, out: OpenOut) -> Result<(), ReplyError> {
        let flags = if out.keep_cache { FOPEN_KEEP_CACHE } else { 0 };
        self.opened(out.fh.0, flags);
        Ok(())
    }

    fn fail(self, errno: c_int) {
        self.error(errno);
    }
}

impl Reply<Vec<u8>> for ReplyData {
    fn send(self, data: Vec<u8>) -> Result<(), ReplyError> {
        self.data(&data);
        Ok(())
    }

    fn fail(self, errno: c_int) {
        self.error(errno);
    }
}

impl Reply<()> for ReplyEmpty {
    fn send(self, (): ()) -> Result<(), ReplyError> {
        self.ok();
        Ok(())
    }

    fn fail(self, errno: c_int) {
        self.error(errno);
    }
}

impl Reply<XattrOut> for ReplyXattr {
    fn send(self, out: XattrOut) -> Result<(), ReplyError> {
        match out {
            XattrOut::Size(size) => self.size(size),
            XattrOut::Data(data) => self.data(&data),
        }
        Ok(())
    }

    fn fail(self, errno: c_int) {
        self.error(errno);
    }
}

impl Reply<()> for ReplyDirectory {
    fn send(self, (): ()) -> Result<(), ReplyError> {
        self.ok();
        Ok(())
    }

    fn fail(self, errno: c_int) {
        self.error(errno);
    }
}

impl DirectoryReply for ReplyDirectory {
    fn add(&mut self, entry: &DirEntry) -> bool {
        ReplyDirectory::add(self, entry.ino, entry.offset, file_type(entry.kind), &entry.name)
    }
}

fn time_spec(time: TimeOrNow) -> TimeSpec {
    match time {
        TimeOrNow::Now => TimeSpec::Now,
        TimeOrNow::SpecificTime(time) => TimeSpec::At(time),
    }
}

fn file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::Directory => FileType::Directory,
        FileKind::RegularFile => FileType::RegularFile,
        FileKind::Symlink => FileType::Symlink,
        FileKind::NamedPipe => FileType::NamedPipe,
        FileKind::CharDevice => FileType::CharDevice,
        FileKind::BlockDevice => FileType::BlockDevice,
        FileKind::Socket => FileType::Socket,
    }
}

fn file_attr(attr: &InodeAttributes) -> FileAttr {
    FileAttr {
        ino: attr.ino,
        size: attr.size,
        blocks: attr.size.div_ceil(512),
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.ctime,
        kind: file_type(attr.kind()),
        perm: attr.perm(),
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: attr.rdev,
        blksize: 512,
        flags: 0,
    }
}

const DEFAULT_MAX_BACKGROUND: u16 = 64;

fn desired_max_background(configured: u16) -> u16 {
    std::env::var(MAX_BACKGROUND_ENV)
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .filter(|value| *value > 0)
        .or(Some(configured).filter(|value| *value > 0))
        .unwrap_or(DEFAULT_MAX_BACKGROUND)
}

fn configure_max_background(config: &mut fuser::KernelConfig, desired: u16) -> (u16, bool) {
    match config.set_max_background(desired) {
        Ok(_) => (desired, false),
        Err(limit) => {
            let _ = config.set_max_background(limit);
            (limit, true)
        }
    }
}

fn desired_congestion_threshold(max_background: u16) -> u16 {
    ((3 * max_background as u32) / 4).max(1) as u16
}

fn configure_congestion_threshold(
    config: &mut fuser::KernelConfig,
    max_background: u16,
) -> (u16, bool) {
    let desired = desired_congestion_threshold(max_background);
    match config.set_congestion_threshold(desired) {
        Ok(_) => (desired, false),
        Err(limit) => {
            let _ = config.set_congestion_threshold(limit);
            (limit, true)
        }
    }
}
