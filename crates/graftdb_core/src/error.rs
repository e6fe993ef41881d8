//! Error types for GraftDB.

use std::io;
use thiserror::Error;

/// Result type for database operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in database operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The key does not exist (or was erased by a visible transaction).
    #[error("key not found")]
    KeyNotFound,

    /// The key already exists and neither overwrite nor duplicate
    /// insertion was requested.
    #[error("duplicate key")]
    DuplicateKey,

    /// The key is locked by another still-active transaction.
    #[error("transaction conflict")]
    TxnConflict,

    /// The database cannot be closed while a transaction holds
    /// un-terminated operations.
    #[error("transaction still open")]
    TxnStillOpen,

    /// The cursor is not coupled to a key.
    #[error("cursor is nil")]
    CursorIsNil,

    /// The key size does not match the configured key size.
    #[error("invalid key size: expected {expected}, got {actual}")]
    InvKeySize {
        /// The configured key size.
        expected: usize,
        /// The size of the supplied key.
        actual: usize,
    },

    /// The record size does not match the configured record size.
    #[error("invalid record size: expected {expected}, got {actual}")]
    InvRecordSize {
        /// The configured record size.
        expected: usize,
        /// The size of the supplied record.
        actual: usize,
    },

    /// An invalid parameter or flag combination was supplied.
    #[error("invalid parameter: {message}")]
    InvParameter {
        /// Description of the problem.
        message: String,
    },

    /// The database handle was closed.
    #[error("database is closed")]
    DatabaseClosed,

    /// The journal contains a record that cannot be decoded.
    #[error("journal corruption: {message}")]
    JournalCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// An internal consistency check failed.
    #[error("integrity check failed: {message}")]
    Integrity {
        /// Description of the violated invariant.
        message: String,
    },

    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] graftdb_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Creates an invalid parameter error.
    pub fn inv_parameter(message: impl Into<String>) -> Self {
        Self::InvParameter {
            message: message.into(),
        }
    }

    /// Creates a journal corruption error.
    pub fn journal_corruption(message: impl Into<String>) -> Self {
        Self::JournalCorruption {
            message: message.into(),
        }
    }

    /// Creates an integrity error.
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity {
            message: message.into(),
        }
    }
}
