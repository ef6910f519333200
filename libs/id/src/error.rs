//! Error types for ID and name parsing.

use thiserror::Error;

/// Errors that can occur when parsing or validating IDs and names.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The input string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID has an unexpected prefix.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ID is missing the underscore separator.
    #[error("ID missing underscore separator")]
    MissingSeparator,

    /// The ULID portion of the ID is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),

    /// A name exceeds the maximum length.
    #[error("{kind} '{name}' is longer than {max} characters")]
    NameTooLong {
        kind: &'static str,
        name: String,
        max: usize,
    },

    /// A name contains a character outside `[a-z0-9._-]` or starts with a
    /// non-alphanumeric character.
    #[error("{kind} '{name}' contains invalid character '{character}'")]
    InvalidNameCharacter {
        kind: &'static str,
        name: String,
        character: char,
    },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }

    /// Returns true if this error came from name validation.
    pub fn is_name_error(&self) -> bool {
        matches!(
            self,
            IdError::NameTooLong { .. } | IdError::InvalidNameCharacter { .. }
        )
    }
}
