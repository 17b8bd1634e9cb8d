//! Errors raised while parsing identifiers.

use thiserror::Error;

/// Why a string could not be parsed as a typed identifier.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// Nothing to parse.
    #[error("identifier cannot be empty")]
    Empty,

    /// No `_` between prefix and ULID.
    #[error("identifier missing '_' separator")]
    MissingSeparator,

    /// The prefix names a different entity type.
    #[error("wrong identifier prefix: expected '{expected}', got '{actual}'")]
    WrongPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ULID portion is malformed.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}

impl IdError {
    /// Returns true if the identifier belonged to another entity type.
    pub fn is_prefix_error(&self) -> bool {
        matches!(self, IdError::WrongPrefix { .. })
    }
}
