//! Error types for the value-store WAL
//!
//! All WAL errors are represented by the WalError enum, which carries enough
//! context to tell an I/O failure apart from a format fault or a lifecycle
//! misuse. Structural corruption found while reading is NOT an error: readers
//! report it through their `complete` flag instead.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::format::Lsn;

/// WAL error types with detailed context
#[derive(Debug, Clone, Error)]
pub enum WalError {
    /// I/O operation failed
    #[error("{}", describe_io(.path, .kind, .message))]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// Configuration rejected at build time
    #[error("invalid WAL configuration: {field}: {reason}")]
    InvalidConfig {
        /// Name of the offending field
        field: &'static str,
        /// Why the value was rejected
        reason: String,
    },

    /// A well-formed mint frame carried a value-kind code this build does not know.
    /// This is a format/version fault, not ordinary corruption.
    #[error("unknown value kind code {code:?}")]
    UnknownValueKind {
        /// The code found on disk
        code: String,
    },

    /// A frame payload could not be serialized
    #[error("failed to encode WAL frame: {reason}")]
    Encode {
        /// Serializer message
        reason: String,
    },

    /// A frame would exceed the hard frame-size limit
    #[error("WAL frame too large: {frame_size} bytes exceeds limit of {max_size} bytes")]
    OversizedFrame {
        /// Size of the encoded payload
        frame_size: u64,
        /// Maximum allowed payload size
        max_size: u64,
    },

    /// A sealed segment could not be compressed; the bare file is kept
    #[error("compression of {} failed: {reason}", .path.display())]
    CompressionFailed {
        /// The bare segment being compressed
        path: PathBuf,
        /// What went wrong
        reason: String,
    },

    /// The WAL has been closed
    #[error("WAL is closed")]
    Closed,

    /// The background writer stopped on an error; the WAL accepts no more work
    #[error("WAL writer failed: {message}")]
    WriterFailed {
        /// Description of the original failure
        message: String,
    },

    /// Another WAL instance holds the directory lock
    #[error("WAL directory {} is locked by another instance", .path.display())]
    DirectoryLocked {
        /// The locked directory
        path: PathBuf,
    },

    /// `await_durable` was asked for an LSN that was never handed out
    #[error("LSN {lsn} was never assigned (last assigned {last_assigned})")]
    LsnNotAssigned {
        /// Requested LSN
        lsn: Lsn,
        /// Highest LSN assigned so far
        last_assigned: Lsn,
    },
}

fn describe_io(path: &Option<PathBuf>, kind: &std::io::ErrorKind, message: &str) -> String {
    match path {
        Some(path) => format!("I/O error in {}: {} ({})", path.display(), message, kind),
        None => format!("I/O error: {} ({})", message, kind),
    }
}

impl WalError {
    /// Build an `Io` error mapper for `map_err`, tagging the path and action.
    pub(crate) fn io_at<'a>(
        path: &'a Path,
        action: &'a str,
    ) -> impl FnOnce(std::io::Error) -> WalError + 'a {
        move |e| WalError::Io {
            path: Some(path.to_path_buf()),
            kind: e.kind(),
            message: format!("{}: {}", action, e),
        }
    }

    /// True for faults in the on-disk format rather than the environment.
    pub fn is_corruption(&self) -> bool {
        matches!(self, WalError::UnknownValueKind { .. })
    }
}

/// Convert std::io::Error to WalError::Io
impl From<std::io::Error> for WalError {
    fn from(err: std::io::Error) -> Self {
        WalError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for WAL operations
pub type WalResult<T> = Result<T, WalError>;
