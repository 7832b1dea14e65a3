//! Error types for the storage and query engine

use std::io;
use thiserror::Error;

use crate::value::DataType;

/// Result type for tabula operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for tabula operations
#[derive(Error, Debug)]
pub enum Error {
    /// Read or write failure reported by the byte-stream layer. Never retried here.
    #[error("Storage I/O error: {0}")]
    StorageIo(#[from] io::Error),

    /// A block failed its checksum or could not be decoded
    #[error("Corrupt block {block} in column {column}: {reason}")]
    CorruptBlock {
        /// Storage column the block belongs to
        column: u64,
        /// Block index within the storage column
        block: usize,
        /// What was wrong with it
        reason: String,
    },

    /// A value does not fit the declared type of a column or expression
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Declared type
        expected: String,
        /// Offending type
        actual: String,
    },

    /// Two schemas that must agree do not
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// An index or block was written by an unknown format version
    #[error("Unsupported format version {found} for {what} (supported: {supported})")]
    UnsupportedFormatVersion {
        /// Kind of artifact (block, column index, table index)
        what: &'static str,
        /// Version tag that was read
        found: u32,
        /// Version this build understands
        supported: u32,
    },

    /// Cooperative cancellation observed at a batch boundary
    #[error("Query cancelled")]
    Cancelled,

    /// Row or column index past the end
    #[error("Index {index} out of range for length {len}")]
    OutOfRange {
        /// Requested index
        index: u64,
        /// Length of the indexed object
        len: u64,
    },

    /// A named column does not exist
    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    /// A second writer was opened on a column that already has one
    #[error("Column already has an open writer")]
    WriterBusy,

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid operation for the current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Memory budget exceeded
    #[error("Memory budget exceeded: requested {requested} bytes, available {available} bytes")]
    MemoryBudgetExceeded {
        /// Requested memory in bytes
        requested: usize,
        /// Available memory in bytes
        available: usize,
    },

    /// Binary serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Index file (de)serialization error
    #[error("Index format error: {0}")]
    Json(#[from] serde_json::Error),

    /// A user-supplied function failed
    #[error("User function '{name}' failed: {message}")]
    Udf {
        /// Function name
        name: String,
        /// Failure message
        message: String,
    },
}

impl Error {
    /// Build a [`Error::TypeMismatch`] from a declared type and the offending type name
    pub fn type_mismatch(expected: &DataType, actual: impl ToString) -> Self {
        Error::TypeMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// A [`Error::CorruptBlock`] whose location is filled in later by the
    /// block manager
    pub fn corrupt(reason: impl Into<String>) -> Self {
        Error::CorruptBlock {
            column: 0,
            block: 0,
            reason: reason.into(),
        }
    }

    /// Attach a storage location to a corrupt-block error; other errors pass through
    pub fn at_block(self, column: u64, block: usize) -> Self {
        match self {
            Error::CorruptBlock { reason, .. } => Error::CorruptBlock {
                column,
                block,
                reason,
            },
            other => other,
        }
    }

    /// Whether this error came from cooperative cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
