//! Index Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use picsmap_protocol::AppId;
use std::path::PathBuf;

/// An index error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for index operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Reading or writing the persisted index failed.
    #[display("I/O error on {}", _0.display())]
    Io(#[error(not(source))] PathBuf),
    /// The index could not be encoded.
    #[display("could not serialize index")]
    Serialize,
    /// The persisted index is not valid JSON of the expected shape.
    #[display("could not deserialize index from {}", _0.display())]
    Deserialize(#[error(not(source))] PathBuf),
    /// An app's metadata tree is missing structure the builder requires.
    #[display("malformed metadata for app {app}: {reason}")]
    MalformedApp { app: AppId, reason: &'static str },
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
