//! Sync Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};

/// A sync error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// A catalog round trip failed.
    #[display("catalog request failed")]
    Catalog,
    /// The full catalog listing could not be retrieved or understood.
    #[display("full catalog listing failed: {_0}")]
    Listing(#[error(not(source))] String),
    /// The merged index could not be written.
    #[display("could not persist index")]
    Persist,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Catalog | Self::Listing(_))
    }
}
