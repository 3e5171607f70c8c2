//! Codec error type.

use crate::types::MpType;
use thiserror::Error;

/// Result type alias using [`MpError`].
pub type Result<T> = std::result::Result<T, MpError>;

/// Errors produced while reading the wire encoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MpError {
    /// The buffer ended in the middle of a value.
    #[error("unexpected end of buffer")]
    Eof,

    /// A marker byte that the encoding does not define.
    #[error("invalid type marker 0x{0:02x}")]
    InvalidMarker(u8),

    /// The value at the cursor has a different type than requested.
    #[error("type mismatch: expected {expected}, found {found}")]
    Type {
        /// What the caller asked for.
        expected: &'static str,
        /// What is actually encoded at the cursor.
        found: MpType,
    },

    /// An integer value does not fit the requested width.
    #[error("integer out of range")]
    OutOfRange,

    /// A string field holds bytes that are not valid UTF-8.
    #[error("invalid utf-8 in string value")]
    Utf8,
}
