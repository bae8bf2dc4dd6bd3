//! Error taxonomy shared by the object layer, the query engine and the stores.
//!
//! Every failure carries a stable numeric [`Error::code`]; `0` ([`SUCCESS`]) is
//! reserved for success so that `(code, result)` pairs can be rebuilt by
//! callers that bridge to foreign completion conventions.
use std::fmt;

use thiserror::Error;

/// Completion code for a successful operation.
pub const SUCCESS: u32 = 0;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Field-less discriminant of an [`Error`], convenient for matching in handlers.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Unconfirmed,
    InvalidFilter,
    IndexOutOfRange,
    ReadOnlyCollection,
    ImmutableAttachedObject,
    EngineNotRunning,
    StoreLocked,
    EngineInternal,
    InvalidAddress,
    InvalidHash,
    InvalidFormat,
    InvalidState,
    Config,
}

/// Errors surfaced by the crate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The hash, height or output has no corresponding chain entry.
    #[error("not found: {0}")]
    NotFound(String),

    /// The entry exists only in the mempool but confirmation was required.
    #[error("unconfirmed: {0} is only in the mempool")]
    Unconfirmed(String),

    /// A binary filter is shorter than the minimum bit length.
    #[error("invalid filter: {bits} bits given, at least {min} required")]
    InvalidFilter {
        /// Bit length of the rejected filter.
        bits: usize,
        /// Minimum accepted bit length.
        min: usize,
    },

    /// Positional access beyond the end of a collection.
    #[error("index out of range: {index} >= {count}")]
    IndexOutOfRange {
        /// Requested position.
        index: usize,
        /// Number of elements in the collection.
        count: usize,
    },

    /// Append attempted on an engine-owned collection.
    #[error("collection is owned by the engine and cannot be modified")]
    ReadOnlyCollection,

    /// Mutation attempted on an object attached to chain data.
    #[error("{0} is attached to chain data and cannot be modified")]
    ImmutableAttachedObject(&'static str),

    /// Operation invoked while the executor is not running.
    #[error("engine not running")]
    EngineNotRunning,

    /// Another process holds the backing store.
    #[error("backing store is locked: {0}")]
    StoreLocked(String),

    /// Opaque failure from the backing store or consensus engine.
    #[error("engine error {code}: {message}")]
    EngineInternal {
        /// Backend-specific diagnostic code (never zero).
        code: u32,
        /// Backend message, possibly empty.
        message: String,
    },

    /// Malformed payment address text.
    #[error("invalid payment address: {0}")]
    InvalidAddress(String),

    /// Malformed hash text.
    #[error("invalid hash: {0}")]
    InvalidHash(String),

    /// Malformed bytes or text handed to a constructor.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// Executor transition attempted from the wrong state.
    #[error("cannot {op} while the executor is {state}")]
    InvalidState {
        /// Rejected operation.
        op: &'static str,
        /// State the executor was in.
        state: &'static str,
    },

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Build an [`Error::EngineInternal`]; a zero code is bumped to `1`.
    pub fn internal(code: u32, message: impl Into<String>) -> Self {
        Error::EngineInternal {
            code: code.max(1),
            message: message.into(),
        }
    }

    /// The field-less kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Unconfirmed(_) => ErrorKind::Unconfirmed,
            Error::InvalidFilter { .. } => ErrorKind::InvalidFilter,
            Error::IndexOutOfRange { .. } => ErrorKind::IndexOutOfRange,
            Error::ReadOnlyCollection => ErrorKind::ReadOnlyCollection,
            Error::ImmutableAttachedObject(_) => ErrorKind::ImmutableAttachedObject,
            Error::EngineNotRunning => ErrorKind::EngineNotRunning,
            Error::StoreLocked(_) => ErrorKind::StoreLocked,
            Error::EngineInternal { .. } => ErrorKind::EngineInternal,
            Error::InvalidAddress(_) => ErrorKind::InvalidAddress,
            Error::InvalidHash(_) => ErrorKind::InvalidHash,
            Error::InvalidFormat(_) => ErrorKind::InvalidFormat,
            Error::InvalidState { .. } => ErrorKind::InvalidState,
            Error::Config(_) => ErrorKind::Config,
        }
    }

    /// Stable numeric completion code. Never [`SUCCESS`].
    pub fn code(&self) -> u32 {
        match self {
            Error::EngineInternal { code, .. } => *code,
            other => other.kind().code(),
        }
    }
}

impl ErrorKind {
    /// Numeric code of the kind. `EngineInternal` errors report their own code
    /// through [`Error::code`] instead.
    pub fn code(self) -> u32 {
        match self {
            ErrorKind::NotFound => 3,
            ErrorKind::Unconfirmed => 4,
            ErrorKind::InvalidFilter => 5,
            ErrorKind::IndexOutOfRange => 6,
            ErrorKind::ReadOnlyCollection => 7,
            ErrorKind::ImmutableAttachedObject => 8,
            ErrorKind::EngineNotRunning => 9,
            ErrorKind::StoreLocked => 10,
            ErrorKind::EngineInternal => 11,
            ErrorKind::InvalidAddress => 12,
            ErrorKind::InvalidHash => 13,
            ErrorKind::InvalidFormat => 14,
            ErrorKind::InvalidState => 15,
            ErrorKind::Config => 16,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<bitcoin::consensus::encode::Error> for Error {
    fn from(err: bitcoin::consensus::encode::Error) -> Self {
        Error::InvalidFormat(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::internal(err.raw_os_error().unwrap_or(1) as u32, err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            Error::EngineNotRunning
        } else {
            Error::internal(1, format!("engine task failed: {err}"))
        }
    }
}

#[cfg(feature = "store-sqlite")]
impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error() {
            Some(e)
                if matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                Error::StoreLocked(err.to_string())
            }
            Some(e) => Error::internal(e.extended_code as u32, err.to_string()),
            None => Error::internal(1, err.to_string()),
        }
    }
}
