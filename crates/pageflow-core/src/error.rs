//! Error types shared across the Pageflow core.

use thiserror::Error;

/// Specialized Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by configuration and parameter validation.
///
/// Worker-local failures (IPC, pool, tokenizer) carry their own error types
/// in their own crates; this enum covers only what the core types themselves
/// can reject.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid engine configuration, fatal at startup.
    #[error("configuration error: {message}")]
    Config {
        /// What was wrong with the configuration.
        message: String,
    },

    /// A request parameter failed validation.
    #[error("validation error: {message}")]
    Validation {
        /// What was rejected.
        message: String,
        /// The offending field, when known.
        field: Option<&'static str>,
    },
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a validation error naming the offending field.
    pub fn validation_field(message: impl Into<String>, field: &'static str) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::config("kv pages must be positive");
        assert!(err.to_string().contains("kv pages"));

        let err = Error::validation_field("temperature below zero", "temperature");
        assert!(matches!(err, Error::Validation { field: Some("temperature"), .. }));
    }
}
