//! Error types for the codeblue_core library.

use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for codeblue_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Key-value store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Encryption or decryption failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// An action was invoked from a phase that has no edge for it
    #[error("Action '{action}' is not allowed in phase {phase}")]
    IllegalTransition { phase: String, action: &'static str },

    /// An intervention was refused by the eligibility guard
    #[error("Not eligible: {0}")]
    Ineligible(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub(crate) fn illegal(phase: impl std::fmt::Debug, action: &'static str) -> Self {
        Error::IllegalTransition {
            phase: format!("{:?}", phase),
            action,
        }
    }
}
