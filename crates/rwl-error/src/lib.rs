#![forbid(unsafe_code)]
//! Error types for the write log.
//!
//! Defines `RwlError` and a `Result<T>` alias used throughout the
//! workspace. Includes errno mappings for block-layer callers.

use std::sync::Arc;
use thiserror::Error;

/// Unified error type for all write-log operations.
///
/// Statuses fan out to every member of an append or flush batch, so the
/// type is `Clone`; I/O errors are shared behind an `Arc`.
#[derive(Debug, Error, Clone)]
pub enum RwlError {
    #[error("I/O error: {0}")]
    Io(#[from] Arc<std::io::Error>),

    #[error("unaligned extent at offset {offset} length {length}")]
    Unaligned { offset: u64, length: u64 },

    #[error("image is read-only")]
    ReadOnly,

    #[error("invalid pool layout: {0}")]
    Layout(String),

    #[error("pool cannot satisfy allocation of {bytes} bytes")]
    PoolExhausted { bytes: u64 },

    #[error("pool transaction aborted: {0}")]
    TxAborted(String),

    #[error("compare mismatch at offset {offset}")]
    CompareMismatch { offset: u64 },

    #[error("cache is shut down")]
    ShutDown,

    #[error("record parse failed: {0}")]
    Parse(#[from] rwl_types::ParseError),
}

impl From<std::io::Error> for RwlError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl RwlError {
    /// Convert this error into a POSIX errno for integer-status callers.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Unaligned { .. } | Self::Layout(_) | Self::Parse(_) => libc::EINVAL,
            Self::ReadOnly => libc::EROFS,
            Self::PoolExhausted { .. } => libc::ENOSPC,
            Self::TxAborted(_) => libc::EIO,
            Self::CompareMismatch { .. } => libc::EILSEQ,
            Self::ShutDown => libc::ESHUTDOWN,
        }
    }
}

/// Result alias using `RwlError`.
pub type Result<T> = std::result::Result<T, RwlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mappings() {
        assert_eq!(
            RwlError::Unaligned {
                offset: 1,
                length: 2
            }
            .to_errno(),
            libc::EINVAL
        );
        assert_eq!(RwlError::ReadOnly.to_errno(), libc::EROFS);
        assert_eq!(
            RwlError::TxAborted("commit failed".to_owned()).to_errno(),
            libc::EIO
        );
        assert_eq!(
            RwlError::PoolExhausted { bytes: 512 }.to_errno(),
            libc::ENOSPC
        );
    }

    #[test]
    fn io_errors_preserve_raw_errno() {
        let err = RwlError::from(std::io::Error::from_raw_os_error(libc::ENOENT));
        assert_eq!(err.to_errno(), libc::ENOENT);
    }

    #[test]
    fn statuses_are_cloneable() {
        let err = RwlError::from(std::io::Error::other("sync failed"));
        let copies = [err.clone(), err];
        assert!(matches!(copies[0], RwlError::Io(_)));
    }
}
