//! Error types for tokblock.

use thiserror::Error;

/// Result type alias for tokblock operations.
pub type Result<T> = std::result::Result<T, TokblockError>;

/// Main error type for tokblock operations.
#[derive(Error, Debug)]
pub enum TokblockError {
    /// Configuration errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A required field is absent from a batch.
    #[error("Missing field: {0}")]
    MissingField(String),

    /// Fields disagree on their concatenated length.
    #[error("Shape mismatch for field '{field}': expected {expected} tokens, got {actual}")]
    ShapeMismatch {
        /// Field whose length differs.
        field: String,
        /// Concatenated length of the reference field.
        expected: usize,
        /// Concatenated length of `field`.
        actual: usize,
    },

    /// Device transfer errors.
    #[error("Device error: {0}")]
    Device(String),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl TokblockError {
    /// Whether this error was caused by invalid configuration.
    #[must_use]
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}
