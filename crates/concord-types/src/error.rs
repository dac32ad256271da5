//! Error types for shared Concord types.

use thiserror::Error;

/// Errors raised while constructing or decoding shared types.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypesError {
    /// A committee must have at least one member.
    #[error("committee must not be empty")]
    EmptyCommittee,

    /// The own index does not address a committee member.
    #[error("own index {index} out of range for committee of size {size}")]
    IndexOutOfRange {
        /// Offending index.
        index: u16,
        /// Committee size.
        size: u16,
    },

    /// The number of identity keys does not match the committee size.
    #[error("expected {expected} identity keys, got {actual}")]
    IdentityCount {
        /// Committee size.
        expected: usize,
        /// Keys supplied.
        actual: usize,
    },

    /// Hex input could not be decoded.
    #[error("invalid hex: {0}")]
    InvalidHex(String),

    /// Byte input had the wrong length.
    #[error("invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength {
        /// Expected byte count.
        expected: usize,
        /// Actual byte count.
        actual: usize,
    },

    /// Key material was rejected by the signature library.
    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

/// A specialized Result type for shared type operations.
pub type Result<T> = std::result::Result<T, TypesError>;

impl From<hex::FromHexError> for TypesError {
    fn from(err: hex::FromHexError) -> Self {
        Self::InvalidHex(err.to_string())
    }
}
