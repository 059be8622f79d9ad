use std::io;
use std::result;

use thiserror::Error;

use crate::page::PageId;

/// Custom result type for lumokv operations
pub type Result<T> = result::Result<T, Error>;

/// lumokv error codes
#[derive(Debug, Error)]
pub enum Error {
    /// Key/data pair already exists
    #[error("Key/data pair already exists")]
    KeyExist,
    /// No matching key/data pair found
    #[error("No matching key/data pair found")]
    NotFound,
    /// Environment mapsize limit reached
    #[error("Environment mapsize limit reached")]
    OutOfSpace,
    /// Environment maxdbs limit reached
    #[error("Environment maxdbs limit reached")]
    TooManyDatabases,
    /// Named database does not exist and creation was not requested
    #[error("Database not found")]
    DbNotFound,
    /// Key or key/value pair does not fit the page layout
    #[error("Key/value of {size} bytes exceeds the maximum of {max}")]
    ValueTooLarge { size: usize, max: usize },
    /// Unsupported size of key/DB name/data
    #[error("Unsupported size of key/DB name/data")]
    BadValSize,
    /// Another write transaction is active
    #[error("A write transaction is already active")]
    WriterBusy,
    /// Environment maxreaders limit reached
    #[error("Environment maxreaders limit reached")]
    ReadersFull,
    /// Page failed structural or checksum validation
    #[error("Page {pgno} is corrupted: {reason}")]
    CorruptPage { pgno: PageId, reason: &'static str },
    /// Page number outside the snapshot
    #[error("Invalid page number {0}")]
    InvalidPageId(PageId),
    /// File is not a valid lumokv file
    #[error("File is not a valid lumokv file")]
    Invalid,
    /// Database version mismatch
    #[error("Database version mismatch")]
    VersionMismatch,
    /// Page size of the file differs from the requested one
    #[error("Page size {found} does not match the requested {expected}")]
    Incompatible { expected: usize, found: usize },
    /// Builder settings out of range
    #[error("Invalid environment configuration: {0}")]
    EnvInvalidConfig(&'static str),
    /// The specified DBI is not known to this transaction
    #[error("The specified DBI is not valid for this transaction")]
    BadDbi,
    /// Environment is read-only
    #[error("Environment is read-only")]
    ReadOnly,
    /// Transaction is no longer usable
    #[error("Invalid transaction state")]
    TxnInvalid,
    /// Environment is already open
    #[error("Environment is already open in this process")]
    EnvAlreadyOpen,
    /// Environment flags cannot be modified
    #[error("Environment flags cannot be modified")]
    EnvFlagsImmutable,
    /// Environment closed while transactions were still registered
    #[error("Environment closed with {readers} live transaction(s)")]
    ResourceLeak { readers: usize },
    /// Stored value is not valid UTF-8
    #[error("Value is not valid UTF-8")]
    Utf8(#[from] std::str::Utf8Error),
    /// I/O error from the data file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Errors the caller can react to without discarding the transaction.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::NotFound
                | Error::KeyExist
                | Error::OutOfSpace
                | Error::TooManyDatabases
                | Error::DbNotFound
                | Error::ValueTooLarge { .. }
                | Error::BadValSize
                | Error::WriterBusy
                | Error::ReadersFull
                | Error::Utf8(_)
        )
    }

    /// Errors that mean the data file cannot be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::CorruptPage { .. } | Error::InvalidPageId(_) | Error::Invalid
        )
    }
}
