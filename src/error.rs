//! Error types for the voice assistant

use thiserror::Error;

/// Result type alias for assistant operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice assistant
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// No usable API key; generation must not be attempted
    #[error("API key not configured: {0}")]
    ConfigurationMissing(String),

    /// Audio device or capture error
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Text generation error
    #[error("generation error: {0}")]
    Generation(String),

    /// The OS speech command could not be run
    #[error("speech dispatch error: {0}")]
    SpeechDispatch(String),

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

    /// TOML encoding error
    #[error("toml encode error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Error {
    /// Whether this error requires user action instead of a retry
    ///
    /// Missing configuration and a broken speech command stop the voice
    /// loop; everything else is absorbed and retried.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::ConfigurationMissing(_) | Self::SpeechDispatch(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::ConfigurationMissing("no key".to_string()).is_fatal());
        assert!(Error::SpeechDispatch("say not found".to_string()).is_fatal());
        assert!(!Error::Audio("no input device".to_string()).is_fatal());
        assert!(!Error::Stt("503".to_string()).is_fatal());
        assert!(!Error::Generation("quota".to_string()).is_fatal());
    }
}
