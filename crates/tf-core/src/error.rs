//! Typed error definitions for the tickerflow pipeline.
//!
//! [`TfError`] covers the orchestration-level failures that are more
//! informative than plain `anyhow::Error` strings. [`StorageError`] carries a
//! network-style [`ErrorCode`] so the consumer can decide between redelivery
//! and dead-lettering. All variants implement `std::error::Error` via
//! `thiserror`, so they integrate with `anyhow::Result`.

use std::fmt;
use std::io;

use thiserror::Error;

/// Domain-specific errors for the pipeline.
#[derive(Debug, Error)]
pub enum TfError {
    /// Configuration parsing or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// Upstream source (exchange REST / WebSocket) error.
    #[error("source error: {0}")]
    Source(String),

    /// Publish to the message bus failed.
    #[error("publish error: {0}")]
    Publish(String),

    /// Message bus client error (connect, poll, commit, seek).
    #[error("broker error: {0}")]
    Broker(String),

    /// Ticker payload or exchange message parsing error.
    #[error("parse error: {0}")]
    Parse(String),

    /// Durable storage error.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// External monitor reporting error.
    #[error("monitor error: {0}")]
    Monitor(String),
}

/// Error code attached to a [`StorageError`].
///
/// The three named codes are the transient network conditions the consumer
/// treats as recoverable by default.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// `ETIMEDOUT`
    TimedOut,
    /// `ECONNRESET`
    ConnectionReset,
    /// `ENOTFOUND` (DNS lookup failed)
    HostNotFound,
    /// Any other driver / server code, kept verbatim.
    Other(String),
}

impl ErrorCode {
    /// The conventional string form of the code, e.g. `"ETIMEDOUT"`.
    pub fn as_str(&self) -> &str {
        match self {
            Self::TimedOut => "ETIMEDOUT",
            Self::ConnectionReset => "ECONNRESET",
            Self::HostNotFound => "ENOTFOUND",
            Self::Other(code) => code,
        }
    }

    /// Parse a code string, mapping the well-known names onto their variants.
    pub fn from_code(code: &str) -> Self {
        match code {
            "ETIMEDOUT" => Self::TimedOut,
            "ECONNRESET" => Self::ConnectionReset,
            "ENOTFOUND" => Self::HostNotFound,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a storage client.
#[derive(Debug, Clone, Error)]
#[error("storage error [{code}]: {message}")]
pub struct StorageError {
    pub code: ErrorCode,
    pub message: String,
}

impl StorageError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(e: io::Error) -> Self {
        let code = match e.kind() {
            io::ErrorKind::TimedOut => ErrorCode::TimedOut,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                ErrorCode::ConnectionReset
            }
            io::ErrorKind::NotFound => ErrorCode::HostNotFound,
            kind => ErrorCode::Other(format!("{kind:?}")),
        };
        Self::new(code, e.to_string())
    }
}
