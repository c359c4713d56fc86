// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

mod common;

use anyhow::anyhow;
use common::*;
use mockall::predicate::eq;
use mockall::Sequence;
use std::ffi::OsStr;
use std::io;
use std::sync::{mpsc, Arc};
use std::time::Duration;
use torrentfs_core::{
    CacheConfig, FileHandle, FsError, InodeStore, SqliteInodeStore, TorrentFileId, ROOT_INO,
};
use torrentfs_fuse_host::{OpenOut, TorrentFs, WorkerPool};
use torrentfs_logging::test_utils::capture_logs;
use torrentfs_logging::Level;

fn movie() -> TorrentFileId {
    TorrentFileId::new(HASH, 3)
}

#[test]
fn open_read_only_reaches_backend_once() {
    let mut backend = MockTorrentBackend::new();
    backend
        .expect_open()
        .with(eq(movie()), eq(libc::O_RDONLY))
        .times(1)
        .returning(|_, _| Ok(FileHandle::new(7)));
    let fx = fixture(backend);
    let ino = add_torrent_file(&fx.store, ROOT_INO, "movie.mp4", HASH, 3, 1 << 30);

    let (reply, slot) = recorder::<OpenOut>();
    fx.fs.open(ino, libc::O_RDONLY, reply);
    assert_eq!(
        slot.sent(),
        OpenOut {
            fh: FileHandle::new(7),
            keep_cache: true
        }
    );
}

#[test]
fn write_opens_are_refused_without_backend() {
    let mut backend = MockTorrentBackend::new();
    backend.expect_open().never();
    let fx = fixture(backend);
    let ino = add_torrent_file(&fx.store, ROOT_INO, "movie.mp4", HASH, 3, 1);

    for flags in [libc::O_WRONLY, libc::O_RDWR, libc::O_RDWR | libc::O_APPEND] {
        let (reply, slot) = recorder::<OpenOut>();
        fx.fs.open(ino, flags, reply);
        assert_eq!(slot.errno(), libc::EACCES);
    }
}

#[test]
fn rejected_open_reply_releases_the_handle() {
    let mut backend = MockTorrentBackend::new();
    let mut seq = Sequence::new();
    backend
        .expect_open()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _| Ok(FileHandle::new(11)));
    backend
        .expect_release()
        .with(eq(movie()), eq(FileHandle::new(11)))
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _| Ok(()));
    let fx = fixture(backend);
    let ino = add_torrent_file(&fx.store, ROOT_INO, "movie.mp4", HASH, 3, 1);

    let (reply, slot) = rejecting_recorder::<OpenOut>();
    fx.fs.open(ino, libc::O_RDONLY, reply);
    assert!(matches!(slot.take(), Outcome::Rejected(out) if out.fh == FileHandle::new(11)));
    assert!(fx.logs.contents().contains("releasing handle"));
}

#[test]
fn open_without_torrent_identity_is_eio() {
    let mut backend = MockTorrentBackend::new();
    backend.expect_open().never();
    let fx = fixture(backend);

    let (reply, slot) = recorder::<OpenOut>();
    fx.fs.open(ROOT_INO, libc::O_RDONLY, reply);
    assert_eq!(slot.errno(), libc::EIO);
    assert!(fx.logs.contents().contains("has no torrent identity"));
}

#[test]
fn read_returns_backend_bytes_verbatim() {
    let payload: Vec<u8> = (0..4096u32).map(|i| (i * 31 % 251) as u8).collect();
    let expected = payload.clone();

    let mut backend = MockTorrentBackend::new();
    backend
        .expect_read()
        .with(eq(movie()), eq(1024u64), eq(4096u32), eq(FileHandle::new(7)))
        .times(1)
        .returning(move |_, _, _, _| Ok(payload.clone()));
    let fx = fixture(backend);
    let ino = add_torrent_file(&fx.store, ROOT_INO, "movie.mp4", HASH, 3, 1 << 20);

    let (reply, slot) = recorder::<Vec<u8>>();
    fx.fs.read(ino, 7, 1024, 4096, reply);
    assert_eq!(slot.sent(), expected);
}

#[test]
fn read_forwards_native_errors() {
    let mut backend = MockTorrentBackend::new();
    backend
        .expect_read()
        .returning(|_, _, _, _| Err(io::Error::from_raw_os_error(libc::ETIMEDOUT).into()));
    let fx = fixture(backend);
    let ino = add_torrent_file(&fx.store, ROOT_INO, "movie.mp4", HASH, 3, 1);

    let (reply, slot) = recorder::<Vec<u8>>();
    fx.fs.read(ino, 7, 0, 10, reply);
    assert_eq!(slot.errno(), libc::ETIMEDOUT);
}

#[test]
fn read_rejects_negative_offsets() {
    let mut backend = MockTorrentBackend::new();
    backend.expect_read().never();
    let fx = fixture(backend);
    let ino = add_torrent_file(&fx.store, ROOT_INO, "movie.mp4", HASH, 3, 1);

    let (reply, slot) = recorder::<Vec<u8>>();
    fx.fs.read(ino, 7, -1, 10, reply);
    assert_eq!(slot.errno(), libc::EINVAL);
}

#[test]
fn release_always_succeeds() {
    let mut backend = MockTorrentBackend::new();
    backend
        .expect_release()
        .with(eq(movie()), eq(FileHandle::new(7)))
        .times(1)
        .returning(|_, _| Err(anyhow!("peer connection reset").into()));
    let fx = fixture(backend);
    let ino = add_torrent_file(&fx.store, ROOT_INO, "movie.mp4", HASH, 3, 1);

    let (reply, slot) = recorder::<()>();
    fx.fs.release(ino, 7, reply);
    slot.sent();
    assert!(fx.logs.contents().contains("peer connection reset"));
}

#[test]
fn release_of_vanished_inode_still_succeeds() {
    let mut backend = MockTorrentBackend::new();
    backend.expect_release().never();
    let fx = fixture(backend);

    let (reply, slot) = recorder::<()>();
    fx.fs.release(9999, 7, reply);
    slot.sent();
}

#[test]
fn unlinked_open_file_stays_readable_until_forgotten() {
    let mut backend = MockTorrentBackend::new();
    backend.expect_open().times(1).returning(|_, _| Ok(FileHandle::new(1)));
    backend
        .expect_read()
        .times(1)
        .returning(|_, _, _, _| Ok(b"still here".to_vec()));
    backend.expect_release().times(1).returning(|_, _| Ok(()));
    let fx = fixture(backend);
    let ino = add_torrent_file(&fx.store, ROOT_INO, "movie.mp4", HASH, 3, 10);

    let (reply, slot) = recorder::<OpenOut>();
    fx.fs.open(ino, libc::O_RDONLY, reply);
    let fh = slot.sent().fh.0;

    let (reply, slot) = recorder::<()>();
    fx.fs.unlink(ROOT_INO, OsStr::new("movie.mp4"), reply);
    slot.sent();

    let (reply, slot) = recorder::<Vec<u8>>();
    fx.fs.read(ino, fh, 0, 10, reply);
    assert_eq!(slot.sent(), b"still here".to_vec());

    let (reply, slot) = recorder::<()>();
    fx.fs.release(ino, fh, reply);
    slot.sent();

    fx.fs.forget(ino, 1);
    assert!(matches!(fx.store.getattr(ino), Err(FsError::NotFound)));
}

#[test]
fn reads_served_from_worker_threads() {
    let mut backend = MockTorrentBackend::new();
    backend
        .expect_read()
        .times(16)
        .returning(|_, offset, size, _| Ok(vec![(offset / 4096) as u8; size as usize]));
    let fx = fixture(backend);
    let ino = add_torrent_file(&fx.store, ROOT_INO, "movie.mp4", HASH, 3, 1 << 20);
    let fs = Arc::new(fx.fs);

    let pool = WorkerPool::new(4);
    let (tx, rx) = mpsc::channel();
    for block in 0..16u64 {
        let fs = Arc::clone(&fs);
        let tx = tx.clone();
        pool.submit(move || {
            let (reply, slot) = recorder::<Vec<u8>>();
            fs.read(ino, 1, (block * 4096) as i64, 8, reply);
            tx.send((block, slot.sent())).unwrap();
        });
    }
    drop(tx);

    let mut results: Vec<_> = rx.iter().collect();
    results.sort();
    assert_eq!(results.len(), 16);
    for (block, data) in results {
        assert_eq!(data, vec![block as u8; 8]);
    }
}

#[test]
fn torrent_identity_is_reread_on_every_call() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("inodb.sqlite");
    let store = Arc::new(SqliteInodeStore::open(&db_path, owner()).unwrap());
    let ino = add_torrent_file(&store, ROOT_INO, "movie.mp4", HASH, 3, 1 << 20);
    let moved = TorrentFileId::new("def456", 9);

    let mut backend = MockTorrentBackend::new();
    backend
        .expect_open()
        .with(eq(movie()), eq(libc::O_RDONLY))
        .times(1)
        .returning(|_, _| Ok(FileHandle::new(5)));
    backend
        .expect_read()
        .with(eq(moved.clone()), eq(0u64), eq(16u32), eq(FileHandle::new(5)))
        .times(1)
        .returning(|_, _, _, _| Ok(vec![1; 16]));
    backend
        .expect_release()
        .with(eq(moved.clone()), eq(FileHandle::new(5)))
        .times(1)
        .returning(|_, _| Ok(()));
    let (dispatch, _logs) = capture_logs(Level::DEBUG);
    let fs = TorrentFs::new(
        Arc::clone(&store) as Arc<dyn InodeStore>,
        Arc::new(backend),
        &CacheConfig::default(),
    )
    .with_dispatch(dispatch);

    let (reply, slot) = recorder::<OpenOut>();
    fs.open(ino, libc::O_RDONLY, reply);
    assert_eq!(slot.sent().fh, FileHandle::new(5));

    // Another process rewrites the identity behind the open handle.
    let writer = rusqlite::Connection::open(&db_path).unwrap();
    writer.busy_timeout(Duration::from_secs(5)).unwrap();
    writer
        .execute(
            "UPDATE inodes SET t_hash = ?1, t_index = ?2 WHERE ino = ?3",
            rusqlite::params![moved.hash, moved.index as i64, ino as i64],
        )
        .unwrap();

    let (reply, slot) = recorder::<Vec<u8>>();
    fs.read(ino, 5, 0, 16, reply);
    assert_eq!(slot.sent(), vec![1; 16]);

    let (reply, slot) = recorder::<()>();
    fs.release(ino, 5, reply);
    slot.sent();
}
