//! Error types for name parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating names and IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NameError {
    /// The input string is empty.
    #[error("name cannot be empty")]
    Empty,

    /// The name exceeds the maximum length for its kind.
    #[error("{kind} name is {actual} characters long, maximum is {max}")]
    TooLong {
        kind: &'static str,
        max: usize,
        actual: usize,
    },

    /// The name contains a character outside the allowed set.
    #[error("invalid character {found:?} at position {position} in {kind} name")]
    InvalidCharacter {
        kind: &'static str,
        found: char,
        position: usize,
    },

    /// The name starts or ends with a non-alphanumeric character.
    #[error("{kind} name must start and end with an alphanumeric character")]
    InvalidBoundary { kind: &'static str },

    /// A member ID is missing the `/` separator.
    #[error("member ID must have the form namespace/name, got '{0}'")]
    MissingSeparator(String),

    /// The ID has an invalid prefix.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ULID portion of the ID is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}

impl NameError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, NameError::Empty)
    }
}
