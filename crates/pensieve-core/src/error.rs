//! Error types for the Pensieve core types.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while handling events and relay documents.
#[derive(Error, Debug)]
pub enum Error {
    /// Event has an invalid field format (e.g., wrong hex length).
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// The name of the invalid field.
        field: &'static str,
        /// Description of what's wrong.
        reason: String,
    },

    /// Filter contains a tag name that is not a single ASCII letter.
    #[error("invalid tag filter '{0}': tag names must be a single letter")]
    InvalidTagName(String),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
