//! Error types for reference parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating references.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RefError {
    /// The input string is empty.
    #[error("{what} cannot be empty")]
    Empty { what: &'static str },

    /// The input exceeds the maximum length for its type.
    #[error("{what} exceeds {max} characters: '{actual}'")]
    TooLong {
        what: &'static str,
        max: usize,
        actual: String,
    },

    /// The input contains a character not allowed for its type.
    #[error("{what} contains invalid character {found:?}: '{actual}'")]
    InvalidCharacter {
        what: &'static str,
        found: char,
        actual: String,
    },

    /// The input does not start or end with an allowed character.
    #[error("{what} must start and end with an alphanumeric character: '{actual}'")]
    InvalidBoundary { what: &'static str, actual: String },

    /// The composite key is missing a separator.
    #[error("missing '{separator}' separator in '{actual}'")]
    MissingSeparator { separator: char, actual: String },
}

impl RefError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, RefError::Empty { .. })
    }

    /// Returns true if this error indicates a malformed composite key.
    pub fn is_separator_error(&self) -> bool {
        matches!(self, RefError::MissingSeparator { .. })
    }
}
