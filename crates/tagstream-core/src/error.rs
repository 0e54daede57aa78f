//! Error types for the tagstream core crate.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while decoding and normalizing firehose messages.
#[derive(Error, Debug)]
pub enum Error {
    /// The message payload is not a valid JSON envelope.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A configured tag is unusable (e.g., empty after normalization).
    #[error("invalid tag '{tag}': {reason}")]
    InvalidTag {
        /// The tag as it was supplied.
        tag: String,
        /// Description of what's wrong.
        reason: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
