//! Error types for the Lock In voice client

use thiserror::Error;

/// Result type alias for Lock In operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the feedback and speech pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (missing API key, invalid URL or delays)
    #[error("configuration error: {0}")]
    Config(String),

    /// Push connection failed or closed abnormally
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed feedback message or status response
    #[error("parse error: {0}")]
    Parse(String),

    /// Non-success response from the speech synthesis API
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// Audio decode, device or playback failure
    #[error("playback error: {0}")]
    Playback(String),

    /// Phrase table loading error
    #[error("phrase table error: {0}")]
    Phrases(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
