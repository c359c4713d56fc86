// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! SQLite-backed inode store ("inodb")

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::error::{FsError, FsResult};
use crate::store::{InodeStore, Transaction};
use crate::types::{
    DirEntry, FileKind, Ino, InodeAttributes, NewFile, Ownership, SetAttributes, TorrentFileId,
    ROOT_INO,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS inodes (
    ino INTEGER PRIMARY KEY AUTOINCREMENT,
    mode INTEGER NOT NULL,
    uid INTEGER NOT NULL,
    gid INTEGER NOT NULL,
    size INTEGER NOT NULL DEFAULT 0,
    rdev INTEGER NOT NULL DEFAULT 0,
    atime_ns INTEGER NOT NULL,
    mtime_ns INTEGER NOT NULL,
    ctime_ns INTEGER NOT NULL,
    target BLOB,
    t_hash TEXT,
    t_index INTEGER
);
CREATE TABLE IF NOT EXISTS entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    parent INTEGER NOT NULL,
    name BLOB NOT NULL,
    ino INTEGER NOT NULL,
    UNIQUE (parent, name)
);
CREATE INDEX IF NOT EXISTS entries_by_ino ON entries(ino);
";

const ATTRIBUTES_QUERY: &str = "
SELECT i.ino, i.mode, i.uid, i.gid, i.size, i.rdev, i.atime_ns, i.mtime_ns, i.ctime_ns,
       i.t_hash, i.t_index,
       (SELECT COUNT(*) FROM entries e WHERE e.ino = i.ino),
       (SELECT COUNT(*) FROM entries e JOIN inodes c ON c.ino = e.ino
         WHERE e.parent = i.ino AND (c.mode & ?2) = ?3)
FROM inodes i WHERE i.ino = ?1";

/// SQLite inode store.
///
/// One connection guarded by a mutex; a [`Transaction`] holds the mutex for
/// its whole lifetime, which makes it the single writer.
pub struct SqliteInodeStore {
    conn: Mutex<Connection>,
}

impl SqliteInodeStore {
    /// Open (or create) the store at `db_path`.
    ///
    /// `root_owner` only applies when the root directory is created.
    pub fn open(db_path: &Path, root_owner: Ownership) -> FsResult<Self> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::with_connection(conn, root_owner)
    }

    /// Store living only as long as this value, for tests and scratch mounts.
    pub fn open_in_memory(root_owner: Ownership) -> FsResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, root_owner)
    }

    fn with_connection(conn: Connection, root_owner: Ownership) -> FsResult<Self> {
        conn.execute_batch(SCHEMA)?;

        let now = to_nanos(SystemTime::now());
        conn.execute(
            "INSERT OR IGNORE INTO inodes (ino, mode, uid, gid, atime_ns, mtime_ns, ctime_ns)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?5)",
            params![ROOT_INO as i64, libc::S_IFDIR | 0o755, root_owner.uid, root_owner.gid, now],
        )?;

        // Entry-less inodes left over from a previous mount can no longer be
        // referenced by any kernel.
        let purged = conn.execute(
            "DELETE FROM inodes WHERE ino != ?1 AND ino NOT IN (SELECT ino FROM entries)",
            params![ROOT_INO as i64],
        )?;
        if purged > 0 {
            info!(target: "torrentfs::store", purged, "reclaimed orphaned inodes");
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // A poisoned lock only means a transaction panicked; its guard already
    // rolled back, so the connection is consistent.
    fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl InodeStore for SqliteInodeStore {
    fn lookup(&self, parent: Ino, name: &OsStr) -> FsResult<Ino> {
        let conn = self.connection();
        lookup_entry(&conn, parent, name)?.ok_or(FsError::NotFound)
    }

    fn getattr(&self, ino: Ino) -> FsResult<InodeAttributes> {
        read_attributes(&self.connection(), ino)
    }

    fn readlink(&self, ino: Ino) -> FsResult<Vec<u8>> {
        let conn = self.connection();
        let (mode, target): (i64, Option<Vec<u8>>) = conn
            .query_row(
                "SELECT mode, target FROM inodes WHERE ino = ?1",
                params![ino as i64],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or(FsError::NotFound)?;

        if FileKind::from_mode(mode as u32) != FileKind::Symlink {
            return Err(FsError::InvalidArgument);
        }
        Ok(target.unwrap_or_default())
    }

    fn readdir(&self, ino: Ino, offset: i64, limit: usize) -> FsResult<Vec<DirEntry>> {
        let conn = self.connection();
        require_dir(&conn, ino)?;

        let mut stmt = conn.prepare_cached(
            "SELECT e.id, e.name, e.ino, i.mode FROM entries e JOIN inodes i ON i.ino = e.ino
             WHERE e.parent = ?1 AND e.id > ?2 ORDER BY e.id LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![ino as i64, offset, limit as i64], |row| {
            let name: Vec<u8> = row.get(1)?;
            let child: i64 = row.get(2)?;
            let mode: i64 = row.get(3)?;
            Ok(DirEntry {
                ino: child as Ino,
                offset: row.get(0)?,
                kind: FileKind::from_mode(mode as u32),
                name: OsString::from_vec(name),
            })
        })?;
        let entries = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn transaction(&self) -> FsResult<Box<dyn Transaction + '_>> {
        let conn = self.connection();
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Box::new(SqliteTransaction {
            conn,
            finished: false,
        }))
    }
}

struct SqliteTransaction<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl Transaction for SqliteTransaction<'_> {
    fn getattr(&self, ino: Ino) -> FsResult<InodeAttributes> {
        read_attributes(&self.conn, ino)
    }

    fn setattr(&mut self, ino: Ino, changes: &SetAttributes) -> FsResult<()> {
        let current = read_attributes(&self.conn, ino)?;

        let mut assignments: Vec<(&'static str, Value)> = Vec::new();
        if let Some(mode) = changes.mode {
            let mode = (current.mode & libc::S_IFMT) | (mode & 0o7777);
            assignments.push(("mode", Value::Integer(mode as i64)));
        }
        if let Some(uid) = changes.uid {
            assignments.push(("uid", Value::Integer(uid as i64)));
        }
        if let Some(gid) = changes.gid {
            assignments.push(("gid", Value::Integer(gid as i64)));
        }
        if let Some(size) = changes.size {
            let size = i64::try_from(size).map_err(|_| FsError::InvalidArgument)?;
            assignments.push(("size", Value::Integer(size)));
        }
        if let Some(atime) = changes.atime {
            assignments.push(("atime_ns", Value::Integer(to_nanos(atime.resolve()))));
        }
        if let Some(mtime) = changes.mtime {
            assignments.push(("mtime_ns", Value::Integer(to_nanos(mtime.resolve()))));
        }
        if let Some(ctime) = changes.ctime {
            assignments.push(("ctime_ns", Value::Integer(to_nanos(ctime))));
        }
        if assignments.is_empty() {
            return Ok(());
        }

        let columns = assignments
            .iter()
            .enumerate()
            .map(|(i, (column, _))| format!("{column} = ?{}", i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("UPDATE inodes SET {columns} WHERE ino = ?{}", assignments.len() + 1);
        let mut values: Vec<Value> = assignments.into_iter().map(|(_, value)| value).collect();
        values.push(Value::Integer(ino as i64));
        self.conn.execute(&sql, params_from_iter(values))?;
        Ok(())
    }

    fn mkdir(&mut self, parent: Ino, name: &OsStr, mode: u32, owner: Ownership) -> FsResult<Ino> {
        require_dir(&self.conn, parent)?;
        ensure_vacant(&self.conn, parent, name)?;
        let ino = insert_inode(
            &self.conn,
            libc::S_IFDIR | (mode & 0o7777),
            owner,
            0,
            None,
            None,
        )?;
        insert_entry(&self.conn, parent, name, ino)?;
        touch_directory(&self.conn, parent)?;
        Ok(ino)
    }

    fn unlink(&mut self, parent: Ino, name: &OsStr) -> FsResult<()> {
        require_dir(&self.conn, parent)?;
        let ino = lookup_entry(&self.conn, parent, name)?.ok_or(FsError::NotFound)?;
        if read_attributes(&self.conn, ino)?.is_dir() {
            return Err(FsError::IsADirectory);
        }
        remove_entry(&self.conn, parent, name)?;
        touch_directory(&self.conn, parent)?;
        touch_ctime(&self.conn, ino)
    }

    fn rmdir(&mut self, parent: Ino, name: &OsStr) -> FsResult<()> {
        require_dir(&self.conn, parent)?;
        let ino = lookup_entry(&self.conn, parent, name)?.ok_or(FsError::NotFound)?;
        require_dir(&self.conn, ino)?;
        let has_children: bool = self.conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM entries WHERE parent = ?1)",
            params![ino as i64],
            |row| row.get(0),
        )?;
        if has_children {
            return Err(FsError::NotEmpty);
        }
        remove_entry(&self.conn, parent, name)?;
        touch_directory(&self.conn, parent)
    }

    fn link(&mut self, ino: Ino, new_parent: Ino, new_name: &OsStr) -> FsResult<()> {
        if read_attributes(&self.conn, ino)?.is_dir() {
            return Err(FsError::OperationNotPermitted);
        }
        require_dir(&self.conn, new_parent)?;
        ensure_vacant(&self.conn, new_parent, new_name)?;
        insert_entry(&self.conn, new_parent, new_name, ino)?;
        touch_directory(&self.conn, new_parent)?;
        touch_ctime(&self.conn, ino)
    }

    fn symlink(
        &mut self,
        target: &Path,
        parent: Ino,
        name: &OsStr,
        owner: Ownership,
    ) -> FsResult<Ino> {
        require_dir(&self.conn, parent)?;
        ensure_vacant(&self.conn, parent, name)?;
        let target = target.as_os_str().as_bytes();
        let ino = insert_inode(
            &self.conn,
            libc::S_IFLNK | 0o777,
            owner,
            target.len() as u64,
            Some(target),
            None,
        )?;
        insert_entry(&self.conn, parent, name, ino)?;
        touch_directory(&self.conn, parent)?;
        Ok(ino)
    }

    fn create_file(&mut self, parent: Ino, name: &OsStr, file: &NewFile) -> FsResult<Ino> {
        require_dir(&self.conn, parent)?;
        ensure_vacant(&self.conn, parent, name)?;
        let ino = insert_inode(
            &self.conn,
            libc::S_IFREG | (file.mode & 0o7777),
            file.owner,
            file.size,
            None,
            file.torrent.as_ref(),
        )?;
        insert_entry(&self.conn, parent, name, ino)?;
        touch_directory(&self.conn, parent)?;
        Ok(ino)
    }

    fn forget(&mut self, ino: Ino) -> FsResult<()> {
        let reclaimed = self.conn.execute(
            "DELETE FROM inodes WHERE ino = ?1 AND ino != ?2
               AND NOT EXISTS (SELECT 1 FROM entries WHERE ino = ?1)",
            params![ino as i64, ROOT_INO as i64],
        )?;
        if reclaimed > 0 {
            debug!(target: "torrentfs::store", ino, "reclaimed unlinked inode");
        }
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> FsResult<()> {
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        match self.conn.execute_batch("ROLLBACK") {
            Ok(()) => debug!(target: "torrentfs::store", "transaction rolled back"),
            Err(err) => warn!(target: "torrentfs::store", %err, "failed to roll back transaction"),
        }
    }
}

fn read_attributes(conn: &Connection, ino: Ino) -> FsResult<InodeAttributes> {
    conn.query_row(
        ATTRIBUTES_QUERY,
        params![ino as i64, libc::S_IFMT, libc::S_IFDIR],
        |row| {
            let mode = row.get::<_, i64>(1)? as u32;
            let references: i64 = row.get(11)?;
            let subdirectories: i64 = row.get(12)?;
            let nlink = if FileKind::from_mode(mode) == FileKind::Directory {
                2 + subdirectories
            } else {
                references
            };
            Ok(InodeAttributes {
                ino: row.get::<_, i64>(0)? as Ino,
                mode,
                nlink: nlink as u32,
                uid: row.get(2)?,
                gid: row.get(3)?,
                size: row.get::<_, i64>(4)? as u64,
                rdev: row.get(5)?,
                atime: from_nanos(row.get(6)?),
                mtime: from_nanos(row.get(7)?),
                ctime: from_nanos(row.get(8)?),
                t_hash: row.get(9)?,
                t_index: row.get::<_, Option<i64>>(10)?.map(|index| index as u64),
            })
        },
    )
    .optional()?
    .ok_or(FsError::NotFound)
}

fn require_dir(conn: &Connection, ino: Ino) -> FsResult<InodeAttributes> {
    let attr = read_attributes(conn, ino)?;
    if !attr.is_dir() {
        return Err(FsError::NotADirectory);
    }
    Ok(attr)
}

fn lookup_entry(conn: &Connection, parent: Ino, name: &OsStr) -> FsResult<Option<Ino>> {
    let ino: Option<i64> = conn
        .query_row(
            "SELECT ino FROM entries WHERE parent = ?1 AND name = ?2",
            params![parent as i64, name.as_bytes()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(ino.map(|ino| ino as Ino))
}

fn ensure_vacant(conn: &Connection, parent: Ino, name: &OsStr) -> FsResult<()> {
    match lookup_entry(conn, parent, name)? {
        Some(_) => Err(FsError::AlreadyExists),
        None => Ok(()),
    }
}

fn insert_inode(
    conn: &Connection,
    mode: u32,
    owner: Ownership,
    size: u64,
    target: Option<&[u8]>,
    torrent: Option<&TorrentFileId>,
) -> FsResult<Ino> {
    let now = to_nanos(SystemTime::now());
    let size = i64::try_from(size).map_err(|_| FsError::InvalidArgument)?;
    let t_index = torrent
        .map(|file| i64::try_from(file.index).map_err(|_| FsError::InvalidArgument))
        .transpose()?;
    conn.execute(
        "INSERT INTO inodes
             (mode, uid, gid, size, atime_ns, mtime_ns, ctime_ns, target, t_hash, t_index)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?5, ?6, ?7, ?8)",
        params![
            mode,
            owner.uid,
            owner.gid,
            size,
            now,
            target,
            torrent.map(|file| file.hash.as_str()),
            t_index
        ],
    )?;
    Ok(conn.last_insert_rowid() as Ino)
}

fn insert_entry(conn: &Connection, parent: Ino, name: &OsStr, ino: Ino) -> FsResult<()> {
    conn.execute(
        "INSERT INTO entries (parent, name, ino) VALUES (?1, ?2, ?3)",
        params![parent as i64, name.as_bytes(), ino as i64],
    )?;
    Ok(())
}

fn remove_entry(conn: &Connection, parent: Ino, name: &OsStr) -> FsResult<()> {
    conn.execute(
        "DELETE FROM entries WHERE parent = ?1 AND name = ?2",
        params![parent as i64, name.as_bytes()],
    )?;
    Ok(())
}

fn touch_directory(conn: &Connection, ino: Ino) -> FsResult<()> {
    conn.execute(
        "UPDATE inodes SET mtime_ns = ?2, ctime_ns = ?2 WHERE ino = ?1",
        params![ino as i64, to_nanos(SystemTime::now())],
    )?;
    Ok(())
}

fn touch_ctime(conn: &Connection, ino: Ino) -> FsResult<()> {
    conn.execute(
        "UPDATE inodes SET ctime_ns = ?2 WHERE ino = ?1",
        params![ino as i64, to_nanos(SystemTime::now())],
    )?;
    Ok(())
}

fn to_nanos(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_nanos()).unwrap_or(i64::MAX),
        Err(before) => {
            i64::try_from(before.duration().as_nanos()).map(|ns| -ns).unwrap_or(i64::MIN)
        }
    }
}

fn from_nanos(nanos: i64) -> SystemTime {
    if nanos >= 0 {
        UNIX_EPOCH + Duration::from_nanos(nanos as u64)
    } else {
        UNIX_EPOCH - Duration::from_nanos(nanos.unsigned_abs())
    }
}
