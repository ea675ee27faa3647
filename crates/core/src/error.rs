//! Error types for the index engine
//!
//! All fallible operations return [`Result`]. We use `thiserror` for
//! automatic `Display` and `Error` trait implementations.
//!
//! Lookup misses are not errors: they surface as `Option::None` or as an
//! exhausted iterator. Corruption is an error here so that parsers stay
//! testable, but callers treat it as fatal — a corrupt row means the
//! on-disk index can no longer be trusted and must not keep feeding caches.

use std::io;
use thiserror::Error;

/// Result type alias for index operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the index engine
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the underlying table
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Unparseable row, wrong tail length, or decompression failure
    #[error("data corruption: {0}")]
    Corruption(String),

    /// The number of matching series exceeds the caller's limit
    #[error("the number of matching timeseries exceeds {max}; either narrow down the search or increase the limit")]
    TooManyTimeseries {
        /// The limit that was exceeded
        max: usize,
    },

    /// A tag filter that cannot be compiled (bad regexp, oversized parts)
    #[error("invalid tag filter: {0}")]
    InvalidTagFilter(String),
}

impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            // io::Error is not Clone; rebuild it from kind and message.
            Error::Io(err) => Error::Io(io::Error::new(err.kind(), err.to_string())),
            Error::Corruption(msg) => Error::Corruption(msg.clone()),
            Error::TooManyTimeseries { max } => Error::TooManyTimeseries { max: *max },
            Error::InvalidTagFilter(msg) => Error::InvalidTagFilter(msg.clone()),
        }
    }
}

impl Error {
    /// Build a corruption error from anything displayable
    pub fn corruption(msg: impl std::fmt::Display) -> Self {
        Error::Corruption(msg.to_string())
    }

    /// Check whether this error is the over-limit signal
    ///
    /// Callers reshape the query (narrower filters or a bigger limit)
    /// instead of retrying.
    pub fn is_too_many_timeseries(&self) -> bool {
        matches!(self, Error::TooManyTimeseries { .. })
    }
}
