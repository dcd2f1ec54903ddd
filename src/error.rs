//! Error types, split by how far a failure reaches.
//!
//! - [`WireError`]: one datagram is bad. It is logged and dropped.
//! - [`TransferError`]: one transfer failed. Siblings on the same socket carry on.
//! - [`FatalError`]: the process cannot continue.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("datagram shorter than its fixed header")]
    Truncated,

    #[error("declared length does not match the bytes present")]
    LengthMismatch,

    #[error("checksum verification failed")]
    ChecksumMismatch,

    #[error("unknown tag {0}")]
    InvalidTag(u8),

    #[error("payload of {0} bytes does not fit in a frame")]
    PayloadTooLarge(usize),

    #[error("path of {0} bytes exceeds the limit")]
    PathTooLong(usize),
}

/// Why a single transfer ended without success.
///
/// The `Display` text is what the daemon puts in an `ERR` response.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("timed out")]
    Timeout,

    #[error("{0}")]
    ServerError(String),

    #[error("path outside root")]
    PathOutsideRoot,

    #[error("not found")]
    NotFound,

    #[error("permission denied")]
    PermissionDenied,

    #[error("not a directory")]
    NotADirectory,

    #[error("not a file")]
    NotAFile,

    #[error("too many chunks for the chunk size")]
    TooManyChunks,

    #[error("i/o error: {0}")]
    Io(String),

    #[error("invalid request: {0}")]
    InvalidRequest(#[from] WireError),
}

impl From<io::Error> for TransferError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => TransferError::NotFound,
            io::ErrorKind::PermissionDenied => TransferError::PermissionDenied,
            _ => TransferError::Io(e.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum FatalError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("socket error: {0}")]
    Socket(#[from] io::Error),

    #[error("served root {0} is not a directory")]
    InvalidRoot(String),

    #[error("interrupted")]
    Interrupted,
}
