//! Error types for ID parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID contains whitespace or control characters.
    #[error("{kind} contains invalid characters: '{value}'")]
    InvalidCharacters { kind: &'static str, value: String },

    /// The ID does not have enough dash-separated components.
    #[error("task ID '{value}' has {found} components, expected at least {expected}")]
    MissingComponents {
        value: String,
        expected: usize,
        found: usize,
    },

    /// A component of the ID is empty.
    #[error("{field} cannot be empty")]
    EmptyComponent { field: &'static str },

    /// A numeric component of the ID could not be parsed.
    #[error("invalid {field} in task ID: '{value}'")]
    InvalidNumber { field: &'static str, value: String },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}
