// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for torrentfs

use libc::c_int;
use std::io;

/// Core filesystem error type
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("access denied")]
    AccessDenied,
    #[error("operation not permitted")]
    OperationNotPermitted,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("name too long")]
    NameTooLong,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    NotEmpty,
    #[error("no such attribute")]
    NoData,
    #[error("bad file descriptor")]
    BadFileDescriptor,
    #[error("os error {0}")]
    Os(c_int),
    #[error("io error")]
    Io(#[from] io::Error),
    #[error("inode store error")]
    Storage(#[from] rusqlite::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl FsError {
    /// Native errno carried by this error, if any.
    ///
    /// Errors without one (storage failures, opaque backend errors, I/O errors
    /// that did not originate from a syscall) are reported to the kernel as `EIO`.
    pub fn os_code(&self) -> Option<c_int> {
        match self {
            FsError::NotFound => Some(libc::ENOENT),
            FsError::AlreadyExists => Some(libc::EEXIST),
            FsError::AccessDenied => Some(libc::EACCES),
            FsError::OperationNotPermitted => Some(libc::EPERM),
            FsError::InvalidArgument => Some(libc::EINVAL),
            FsError::NameTooLong => Some(libc::ENAMETOOLONG),
            FsError::NotADirectory => Some(libc::ENOTDIR),
            FsError::IsADirectory => Some(libc::EISDIR),
            FsError::NotEmpty => Some(libc::ENOTEMPTY),
            FsError::NoData => Some(libc::ENODATA),
            FsError::BadFileDescriptor => Some(libc::EBADF),
            FsError::Os(code) => Some(*code),
            FsError::Io(err) => err.raw_os_error(),
            FsError::Storage(_) | FsError::Internal(_) => None,
        }
    }

    /// Errno sent to the kernel for this error.
    pub fn errno(&self) -> c_int {
        self.os_code().unwrap_or(libc::EIO)
    }

    /// Misses the kernel asks about all the time (negative lookups, absent xattrs).
    pub fn is_routine(&self) -> bool {
        matches!(self.os_code(), Some(libc::ENOENT) | Some(libc::ENODATA))
    }
}

pub type FsResult<T> = Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_errors_carry_their_errno() {
        assert_eq!(FsError::NotFound.errno(), libc::ENOENT);
        assert_eq!(FsError::AccessDenied.errno(), libc::EACCES);
        assert_eq!(FsError::NoData.errno(), libc::ENODATA);
        assert_eq!(FsError::Os(libc::EAGAIN).errno(), libc::EAGAIN);
    }

    #[test]
    fn io_errors_forward_raw_os_codes() {
        let err = FsError::from(io::Error::from_raw_os_error(libc::ETIMEDOUT));
        assert_eq!(err.os_code(), Some(libc::ETIMEDOUT));

        let synthetic = FsError::from(io::Error::new(io::ErrorKind::Other, "peer went away"));
        assert_eq!(synthetic.os_code(), None);
        assert_eq!(synthetic.errno(), libc::EIO);
    }

    #[test]
    fn wrapped_errors_are_sources_not_message_text() {
        let err = FsError::from(rusqlite::Error::QueryReturnedNoRows);
        assert_eq!(err.to_string(), "inode store error");
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source, Some(rusqlite::Error::QueryReturnedNoRows.to_string()));
        assert_eq!(err.errno(), libc::EIO);
    }

    #[test]
    fn internal_errors_map_to_eio() {
        let err = FsError::from(anyhow::anyhow!("piece verification failed"));
        assert_eq!(err.os_code(), None);
        assert_eq!(err.errno(), libc::EIO);
        assert!(!err.is_routine());
    }
}
