//! Update engine errors.

use thiserror::Error;

/// Result type alias using [`UpdateError`].
pub type Result<T> = std::result::Result<T, UpdateError>;

/// Errors raised while decoding or applying update operations.
///
/// Decode-time errors abort the whole request before anything is
/// allocated; apply-time errors abort it in UPDATE mode and are skipped
/// per-op in UPSERT mode.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// Malformed request structure (not per-field).
    #[error("illegal parameters: {0}")]
    IllegalParams(String),

    /// Opcode outside the supported set.
    #[error("unknown UPDATE operation")]
    UnknownOp,

    /// A field referenced by number does not exist.
    #[error("field {0} was not found in the tuple")]
    NoSuchFieldNo(i32),

    /// A field referenced by name or path does not exist.
    #[error("field '{0}' was not found in the tuple")]
    NoSuchFieldName(String),

    /// An operation argument or the field it is applied to has the
    /// wrong type.
    #[error("argument type in operation '{op}' on field {field}: expected {expected}")]
    ArgType {
        /// Opcode character.
        op: char,
        /// Field identifier as the user wrote it.
        field: String,
        /// What the operation needs.
        expected: &'static str,
    },

    /// Integer arithmetic left the (-2^63, 2^64) window.
    #[error("integer overflow in operation '{op}' on field {field}")]
    IntegerOverflow {
        /// Opcode character.
        op: char,
        /// Field identifier.
        field: String,
    },

    /// Decimal arithmetic overflowed.
    #[error("decimal overflow in operation '{op}' on field {field}")]
    DecimalOverflow {
        /// Opcode character.
        op: char,
        /// Field identifier.
        field: String,
    },

    /// Splice bounds are invalid for the subject string.
    #[error("splice on field {field}: {reason}")]
    Splice {
        /// Field identifier.
        field: String,
        /// Which bound was violated.
        reason: &'static str,
    },

    /// Generic per-field failure.
    #[error("field {field}: {reason}")]
    Field {
        /// Field identifier.
        field: String,
        /// Failure description.
        reason: String,
    },

    /// A JSON path failed to parse.
    #[error("invalid JSON path '{path}' at position {pos}")]
    BadJsonPath {
        /// The offending path.
        path: String,
        /// 1-based symbol position of the first bad token.
        pos: usize,
    },

    /// Map insertion collided with an existing key.
    #[error("duplicate key '{0}' in map update")]
    Duplicate(String),

    /// Two operations addressed the same terminal path.
    #[error("field {0}: double update of the same field")]
    DoubleUpdate(String),

    /// Operations intersect in a way the engine does not support.
    #[error("unsupported update: {0}")]
    Unsupported(&'static str),
}

impl UpdateError {
    pub(crate) fn illegal(msg: impl Into<String>) -> Self {
        Self::IllegalParams(msg.into())
    }
}
