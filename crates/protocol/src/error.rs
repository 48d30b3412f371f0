//! Protocol Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use std::time::Duration;

/// A protocol error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The link to the catalog gateway could not be opened.
    #[display("could not connect to catalog gateway: {_0}")]
    Connect(#[error(not(source))] String),
    /// A remote round trip did not complete in time.
    #[display("{operation} timed out after {}s", after.as_secs())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    /// Reading from or writing to the link failed.
    #[display("transport error")]
    Transport,
    /// The link closed while a request was outstanding.
    #[display("connection closed")]
    Closed,
    /// A frame could not be encoded or decoded.
    #[display("protocol error: {_0}")]
    Protocol(#[error(not(source))] String),
    /// The anonymous logon was answered with a non-OK result.
    #[display("logon failed: {_0}")]
    LogonFailed(#[error(not(source))] String),
    /// The response body did not match the request that was issued.
    #[display("unexpected response to {_0}")]
    UnexpectedResponse(#[error(not(source))] &'static str),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transport | Self::Closed)
    }
}
