// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Protocol adapter
//!
//! One method per FUSE lowlevel operation. Each method answers its reply
//! exactly once; failures, including panics, are turned into an errno at
//! [`TorrentFs::respond`] and logged through the adapter's own dispatcher.

use anyhow::anyhow;
use libc::c_int;
use std::any::Any;
use std::error::Error as StdError;
use std::ffi::OsStr;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use torrentfs_core::{
    xattr, Backend, CacheConfig, FileHandle, FsError, FsResult, Ino, InodeAttributes, InodeStore,
    Ownership, SetAttributes, TorrentFileId,
};
use tracing::{debug, error, info, warn, Dispatch};

use crate::reply::{AttrOut, DirectoryReply, EntryOut, OpenOut, Reply, XattrOut};

/// Maximum single path component length
pub const NAME_MAX: usize = 255;

/// Entries fetched from the store per round trip while filling a readdir buffer
const READDIR_BATCH: usize = 128;

const TARGET: &str = "torrentfs::fuse";

/// Caller identity attached to a request
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

impl RequestContext {
    fn owner(&self) -> Ownership {
        Ownership {
            uid: self.uid,
            gid: self.gid,
        }
    }
}

/// torrentfs request handlers
pub struct TorrentFs {
    store: Arc<dyn InodeStore>,
    backend: Arc<dyn Backend>,
    attr_ttl: Duration,
    entry_ttl: Duration,
    log: Dispatch,
}

impl TorrentFs {
    /// Build an adapter logging through the dispatcher current at construction.
    pub fn new(store: Arc<dyn InodeStore>, backend: Arc<dyn Backend>, cache: &CacheConfig) -> Self {
        Self {
            store,
            backend,
            attr_ttl: cache.attr_ttl(),
            entry_ttl: cache.entry_ttl(),
            log: tracing::dispatcher::get_default(Dispatch::clone),
        }
    }

    /// Route this adapter's log records to `log`.
    pub fn with_dispatch(mut self, log: Dispatch) -> Self {
        self.log = log;
        self
    }

    pub fn attr_ttl(&self) -> Duration {
        self.attr_ttl
    }

    pub fn entry_ttl(&self) -> Duration {
        self.entry_ttl
    }

    /// Mount-time hook; the error aborts the mount.
    pub fn init(&self) -> Result<(), c_int> {
        self.in_scope(|| match self.run("init", "", || self.backend.init()) {
            Ok(()) => {
                info!(target: TARGET, "torrentfs initialized");
                Ok(())
            }
            Err(err) => {
                log_failure("init", "", &err);
                Err(err.errno())
            }
        })
    }

    pub fn destroy(&self) {
        self.in_scope(|| {
            let result = self.run("destroy", "", || {
                self.backend.destroy();
                Ok(())
            });
            if let Err(err) = result {
                log_failure("destroy", "", &err);
            }
            info!(target: TARGET, "torrentfs destroyed");
        })
    }

    /// The kernel dropped `nlookup` references to `ino`. No reply.
    pub fn forget(&self, ino: Ino, nlookup: u64) {
        self.in_scope(|| {
            let args = &format!("ino={ino} nlookup={nlookup}");
            let result = self.run("forget", args, || {
                let mut txn = self.store.transaction()?;
                txn.forget(ino)?;
                txn.commit()
            });
            if let Err(err) = result {
                log_failure("forget", args, &err);
            }
        })
    }

    pub fn getattr(&self, ino: Ino, reply: impl Reply<AttrOut>) {
        self.respond("getattr", &format!("ino={ino}"), reply, || {
            let attr = self.store.getattr(ino)?;
            Ok(AttrOut {
                attr,
                ttl: self.attr_ttl,
            })
        })
    }

    pub fn lookup(&self, parent: Ino, name: &OsStr, reply: impl Reply<EntryOut>) {
        let args = &format!("parent={parent} name={name:?}");
        self.respond("lookup", args, reply, || {
            check_name(name)?;
            let ino = self.store.lookup(parent, name)?;
            Ok(self.entry(self.store.getattr(ino)?))
        })
    }

    /// Apply exactly the fields present in `changes`.
    pub fn setattr(
        &self,
        ino: Ino,
        changes: SetAttributes,
        fh: Option<u64>,
        reply: impl Reply<AttrOut>,
    ) {
        let args = &format!("ino={ino} fields={:?} fh={fh:?}", changes.fields());
        self.respond("setattr", args, reply, || {
            let mut txn = self.store.transaction()?;
            txn.setattr(ino, &changes)?;
            let attr = txn.getattr(ino)?;
            txn.commit()?;
            Ok(AttrOut {
                attr,
                ttl: self.attr_ttl,
            })
        })
    }

    pub fn mkdir(
        &self,
        ctx: RequestContext,
        parent: Ino,
        name: &OsStr,
        mode: u32,
        reply: impl Reply<EntryOut>,
    ) {
        let args = &format!("parent={parent} name={name:?} mode={mode:o} uid={}", ctx.uid);
        self.respond("mkdir", args, reply, || {
            check_name(name)?;
            let mut txn = self.store.transaction()?;
            let ino = txn.mkdir(parent, name, mode, ctx.owner())?;
            let attr = txn.getattr(ino)?;
            txn.commit()?;
            Ok(self.entry(attr))
        })
    }

    pub fn unlink(&self, parent: Ino, name: &OsStr, reply: impl Reply<()>) {
        let args = &format!("parent={parent} name={name:?}");
        self.respond("unlink", args, reply, || {
            check_name(name)?;
            let mut txn = self.store.transaction()?;
            txn.unlink(parent, name)?;
            txn.commit()
        })
    }

    pub fn rmdir(&self, parent: Ino, name: &OsStr, reply: impl Reply<()>) {
        let args = &format!("parent={parent} name={name:?}");
        self.respond("rmdir", args, reply, || {
            check_name(name)?;
            let mut txn = self.store.transaction()?;
            txn.rmdir(parent, name)?;
            txn.commit()
        })
    }

    pub fn link(&self, ino: Ino, new_parent: Ino, new_name: &OsStr, reply: impl Reply<EntryOut>) {
        let args = &format!("ino={ino} new_parent={new_parent} new_name={new_name:?}");
        self.respond("link", args, reply, || {
            check_name(new_name)?;
            let mut txn = self.store.transaction()?;
            txn.link(ino, new_parent, new_name)?;
            let attr = txn.getattr(ino)?;
            txn.commit()?;
            Ok(self.entry(attr))
        })
    }

    pub fn symlink(
        &self,
        ctx: RequestContext,
        parent: Ino,
        name: &OsStr,
        target: &Path,
        reply: impl Reply<EntryOut>,
    ) {
        let args = &format!("parent={parent} name={name:?} target={target:?}");
        self.respond("symlink", args, reply, || {
            check_name(name)?;
            let mut txn = self.store.transaction()?;
            let ino = txn.symlink(target, parent, name, ctx.owner())?;
            let attr = txn.getattr(ino)?;
            txn.commit()?;
            Ok(self.entry(attr))
        })
    }

    pub fn readlink(&self, ino: Ino, reply: impl Reply<Vec<u8>>) {
        self.respond("readlink", &format!("ino={ino}"), reply, || self.store.readlink(ino))
    }

    /// Fill `reply` with the entries following the resume cookie `offset`.
    pub fn readdir(&self, ino: Ino, offset: i64, mut reply: impl DirectoryReply) {
        let args = &format!("ino={ino} offset={offset}");
        self.in_scope(|| {
            let result = self.run("readdir", args, || {
                if offset < 0 {
                    return Err(FsError::InvalidArgument);
                }
                let mut cursor = offset;
                loop {
                    let batch = self.store.readdir(ino, cursor, READDIR_BATCH)?;
                    for entry in &batch {
                        if reply.add(entry) {
                            return Ok(());
                        }
                        cursor = entry.offset;
                    }
                    if batch.len() < READDIR_BATCH {
                        return Ok(());
                    }
                }
            });
            finish("readdir", args, reply, result)
        })
    }

    pub fn listxattr(&self, ino: Ino, size: u32, reply: impl Reply<XattrOut>) {
        self.respond("listxattr", &format!("ino={ino} size={size}"), reply, || {
            let attr = self.store.getattr(ino)?;
            sized_xattr(xattr::list(&attr), size)
        })
    }

    pub fn getxattr(&self, ino: Ino, name: &OsStr, size: u32, reply: impl Reply<XattrOut>) {
        let args = &format!("ino={ino} name={name:?} size={size}");
        self.respond("getxattr", args, reply, || {
            let attr = self.store.getattr(ino)?;
            sized_xattr(xattr::get(&attr, name)?, size)
        })
    }

    /// Open the torrent file behind `ino` for reading.
    ///
    /// Write access is refused before the backend is consulted. When the
    /// kernel rejects the reply the new backend handle is released again.
    pub fn open(&self, ino: Ino, flags: i32, reply: impl Reply<OpenOut>) {
        let args = &format!("ino={ino} flags={flags:#o}");
        self.in_scope(|| {
            let opened = self.run("open", args, || {
                if flags & libc::O_ACCMODE != libc::O_RDONLY {
                    return Err(FsError::AccessDenied);
                }
                let file = self.torrent_file(ino)?;
                let fh = self.backend.open(&file, flags)?;
                debug!(target: TARGET, ino, %file, fh = fh.0, "opened");
                Ok((file, fh))
            });

            let (file, fh) = match opened {
                Ok(opened) => opened,
                Err(err) => {
                    log_failure("open", args, &err);
                    reply.fail(err.errno());
                    return;
                }
            };

            if let Err(err) = reply.send(OpenOut {
                fh,
                keep_cache: true,
            }) {
                warn!(
                    target: TARGET,
                    op = "open",
                    ino,
                    fh = fh.0,
                    %err,
                    "open reply rejected; releasing handle"
                );
                let released = self.run("open", args, || self.backend.release(&file, fh));
                if let Err(err) = released {
                    log_failure("open", args, &err);
                }
            }
        })
    }

    /// Bytes returned by the backend, unmodified. May block.
    pub fn read(&self, ino: Ino, fh: u64, offset: i64, size: u32, reply: impl Reply<Vec<u8>>) {
        let args = &format!("ino={ino} fh={fh} offset={offset} size={size}");
        self.respond("read", args, reply, || {
            let offset = u64::try_from(offset).map_err(|_| FsError::InvalidArgument)?;
            let file = self.torrent_file(ino)?;
            self.backend.read(&file, offset, size, FileHandle::new(fh))
        })
    }

    /// Release the backend handle. Always answers success.
    pub fn release(&self, ino: Ino, fh: u64, reply: impl Reply<()>) {
        let args = &format!("ino={ino} fh={fh}");
        self.in_scope(|| {
            let released = self.run("release", args, || {
                let file = self.torrent_file(ino)?;
                self.backend.release(&file, FileHandle::new(fh))
            });
            if let Err(err) = released {
                log_failure("release", args, &err);
            }
            finish("release", args, reply, Ok(()));
        })
    }

    fn entry(&self, attr: InodeAttributes) -> EntryOut {
        EntryOut {
            attr,
            attr_ttl: self.attr_ttl,
            entry_ttl: self.entry_ttl,
        }
    }

    // (t_hash, t_index) is looked up on every call so a concurrent setattr
    // is observed by the next read.
    fn torrent_file(&self, ino: Ino) -> FsResult<TorrentFileId> {
        self.store
            .getattr(ino)?
            .torrent_file()
            .ok_or_else(|| FsError::Internal(anyhow!("inode {ino} has no torrent identity")))
    }

    fn in_scope<R>(&self, f: impl FnOnce() -> R) -> R {
        tracing::dispatcher::with_default(&self.log, f)
    }

    /// Run `f`, converting a panic into an internal error.
    fn run<T>(
        &self,
        op: &'static str,
        args: &str,
        f: impl FnOnce() -> FsResult<T>,
    ) -> FsResult<T> {
        panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
            Err(FsError::Internal(anyhow!(
                "{op}({args}) panicked: {}",
                panic_message(payload.as_ref())
            )))
        })
    }

    /// The error boundary: run `f` and answer `reply` exactly once.
    fn respond<T, R: Reply<T>>(
        &self,
        op: &'static str,
        args: &str,
        reply: R,
        f: impl FnOnce() -> FsResult<T>,
    ) {
        self.in_scope(|| {
            let result = self.run(op, args, f);
            finish(op, args, reply, result)
        })
    }
}

fn finish<T, R: Reply<T>>(op: &'static str, args: &str, reply: R, result: FsResult<T>) {
    match result {
        Ok(value) => {
            if let Err(err) = reply.send(value) {
                warn!(target: TARGET, op, args = %args, %err, "reply rejected");
            }
        }
        Err(err) => {
            log_failure(op, args, &err);
            reply.fail(err.errno());
        }
    }
}

fn log_failure(op: &'static str, args: &str, err: &FsError) {
    match err.os_code() {
        None => error!(
            target: TARGET,
            op,
            args = %args,
            error = %ErrorChain(err),
            errno = libc::EIO,
            "request failed"
        ),
        Some(errno) if err.is_routine() => {
            debug!(target: TARGET, op, args = %args, errno, %err, "request failed")
        }
        Some(errno) => warn!(target: TARGET, op, args = %args, errno, %err, "request failed"),
    }
}

fn check_name(name: &OsStr) -> FsResult<()> {
    if name.as_bytes().len() > NAME_MAX {
        return Err(FsError::NameTooLong);
    }
    Ok(())
}

/// `size == 0` asks for the length only; a smaller non-zero buffer is `ERANGE`.
fn sized_xattr(value: Vec<u8>, size: u32) -> FsResult<XattrOut> {
    let len = u32::try_from(value.len()).map_err(|_| FsError::Os(libc::E2BIG))?;
    if size == 0 {
        Ok(XattrOut::Size(len))
    } else if len > size {
        Err(FsError::Os(libc::ERANGE))
    } else {
        Ok(XattrOut::Data(value))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Displays an error followed by each of its sources.
struct ErrorChain<'a>(&'a (dyn StdError + 'static));

impl fmt::Display for ErrorChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = self.0.source();
        while let Some(cause) = source {
            write!(f, ": {cause}")?;
            source = cause.source();
        }
        Ok(())
    }
}
