//! Error types shared by every document backend.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type for document operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    NotFound(String),

    #[error("not supported: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("request cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// Machine-readable classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    Unsupported,
    Cancelled,
    DeadlineExceeded,
    Backend,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) | Error::Config(_) => ErrorKind::InvalidArgument,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Unsupported(_) => ErrorKind::Unsupported,
            Error::Backend(_) => ErrorKind::Backend,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::DeadlineExceeded => ErrorKind::DeadlineExceeded,
        }
    }

    pub(crate) fn request(operation: impl Into<String>, message: impl fmt::Display) -> Self {
        Error::Backend(BackendError::Request {
            operation: operation.into(),
            message: message.to_string(),
        })
    }
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "InvalidArgument",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Unsupported => "Unsupported",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::DeadlineExceeded => "DeadlineExceeded",
            ErrorKind::Backend => "Backend",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected keys, collections, expressions or paging tokens.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("provide non-blank key.Collection")]
    BlankCollection,

    #[error("provide non-blank key.Id")]
    BlankId,

    #[error("provide non-blank subKey.Collection")]
    BlankSubCollection,

    #[error("provide non-blank subKey.Id")]
    BlankSubId,

    #[error("provide non-blank collection")]
    BlankQueryCollection,

    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    #[error("provide valid query expression operator [==, <, >, <=, >=, startsWith]: {0}")]
    InvalidOperator(String),

    #[error("provide non-blank query expression operand: {0:?}")]
    BlankOperand(String),

    #[error("provide non-blank query expression value: {operand} {operator}")]
    BlankValue { operand: String, operator: String },

    #[error("query expression value must be a string, number or bool: {operand} {operator}")]
    UnsupportedValue { operand: String, operator: String },

    #[error("startsWith requires a string value: {0}")]
    PrefixNotString(String),

    #[error("inequality expressions on multiple properties are not supported: [ {0} ]")]
    MultipleInequalities(String),

    #[error("range expression combination not supported (use operators >= and <=) : {0}")]
    UnsupportedRange(String),

    #[error("invalid paging token: {0}")]
    InvalidPagingToken(String),
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("store error: {0}")]
    Store(#[from] sled::Error),

    #[error("store is locked: {}", .path.display())]
    Locked { path: PathBuf },

    #[error("corrupt store: {0}")]
    Corrupt(String),

    #[error("{operation} : {message}")]
    Request { operation: String, message: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for {field}: {value}")]
    Invalid { field: &'static str, value: String },
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Backend(BackendError::Io(err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
