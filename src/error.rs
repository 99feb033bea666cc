//! Crate-wide error type.

use thiserror::Error;

/// Errors surfaced by every public operation in this crate.
///
/// Statuses travel by value through operation completions, so the type is
/// cheap to copy and compare.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum Error {
    /// The request cannot be served at this layer.
    #[error("not supported: {0}")]
    NotSupported(&'static str),

    /// A block or page index fell outside the addressed device.
    #[error("index {index} out of range (limit {limit})")]
    OutOfRange { index: u64, limit: u64 },

    /// The caller handed us something unusable.
    #[error("invalid arguments: {0}")]
    InvalidArgs(&'static str),

    /// A buffer or list could not be allocated.
    #[error("allocation failed")]
    NoMemory,

    /// Malformed metadata, unusable geometry, or missing on-flash state.
    #[error("internal error: {0}")]
    Internal(&'static str),

    /// No reserved block remains to host a new table copy.
    #[error("no usable block remains in the reserved range")]
    NotFound,

    /// The controller reported a transfer failure.
    #[error("nand i/o failed: {0}")]
    Io(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
