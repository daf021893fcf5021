//! TOML configuration file loading and persistence
//!
//! Supports `~/.config/bible-voice/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.
//! The API key record (`api_key`, `require_api_key_setup`) is rewritten when
//! the user submits a new key from a presentation surface.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct AssistantConfigFile {
    /// Generation service API key
    #[serde(default)]
    pub api_key: Option<String>,

    /// Whether the surface should prompt for a key before first use
    #[serde(default)]
    pub require_api_key_setup: Option<bool>,

    /// Voice loop configuration
    #[serde(default)]
    pub voice: VoiceFileConfig,

    /// Speech-to-text configuration
    #[serde(default)]
    pub transcription: TranscriptionFileConfig,

    /// Text generation configuration
    #[serde(default)]
    pub generation: GenerationFileConfig,

    /// Websocket bridge configuration
    #[serde(default)]
    pub server: ServerFileConfig,
}

/// Voice loop configuration
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct VoiceFileConfig {
    /// Wake phrase (e.g. "hey bible")
    pub wake_phrase: Option<String>,

    /// Phrase spoken after the wake phrase is heard
    pub acknowledgement: Option<String>,

    /// OS speech program (invoked as `<program> [args] -f <file>`)
    pub speak_command: Option<String>,

    /// Extra arguments placed before `-f <file>`
    pub speak_args: Option<Vec<String>>,

    /// Ambient-noise calibration window
    pub calibration_secs: Option<f64>,

    /// Maximum length of the wake utterance
    pub wake_phrase_limit_secs: Option<f64>,

    /// How long to wait for the command to start
    pub command_timeout_secs: Option<f64>,

    /// Maximum length of the command utterance
    pub command_phrase_limit_secs: Option<f64>,

    /// Silence that ends an utterance
    pub pause_threshold_secs: Option<f64>,

    /// Pause after a recoverable failure
    pub retry_backoff_secs: Option<f64>,

    /// Grace period between terminate and kill when interrupting speech
    pub interrupt_grace_ms: Option<u64>,

    /// Consecutive failures before the loop gives up (0 = never)
    pub max_consecutive_failures: Option<u32>,

    /// Kill leftover speech processes at startup
    pub sweep_orphans: Option<bool>,
}

/// Speech-to-text configuration
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct TranscriptionFileConfig {
    /// Provider ("gemini" or "whisper")
    pub provider: Option<String>,

    /// Model identifier
    pub model: Option<String>,

    /// `OpenAI` key for the Whisper provider
    pub openai_api_key: Option<String>,

    /// Request timeout
    pub timeout_secs: Option<u64>,
}

/// Text generation configuration
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct GenerationFileConfig {
    /// Model identifier (e.g. "gemini-2.5-flash")
    pub model: Option<String>,

    /// Service base URL
    pub base_url: Option<String>,

    /// Request timeout
    pub timeout_secs: Option<u64>,
}

/// Websocket bridge configuration
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct ServerFileConfig {
    /// Run the websocket bridge
    pub enabled: Option<bool>,

    /// Bind host
    pub host: Option<String>,

    /// Bind port
    pub port: Option<u16>,

    /// Directory with the browser front-end
    pub static_dir: Option<String>,
}

/// Persisted configuration record
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    /// Create a store backed by the given file
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the standard config path
    #[must_use]
    pub fn default_location() -> Option<Self> {
        config_file_path().map(Self::new)
    }

    /// Path of the backing file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the file
    ///
    /// Returns `AssistantConfigFile::default()` if the file doesn't exist or can't be parsed.
    #[must_use]
    pub fn load(&self) -> AssistantConfigFile {
        if !self.path.exists() {
            return AssistantConfigFile::default();
        }

        match std::fs::read_to_string(&self.path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    tracing::info!(path = %self.path.display(), "loaded config file");
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %e,
                        "failed to parse config file, using defaults"
                    );
                    AssistantConfigFile::default()
                }
            },
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "failed to read config file"
                );
                AssistantConfigFile::default()
            }
        }
    }

    /// Load the file, failing on read or parse errors
    ///
    /// A missing file is not an error and yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load_strict(&self) -> Result<AssistantConfigFile> {
        if !self.path.exists() {
            return Ok(AssistantConfigFile::default());
        }

        let content = std::fs::read_to_string(&self.path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Write the whole file, creating parent directories as needed
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be encoded or written
    pub fn save(&self, config: &AssistantConfigFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(config)?;
        std::fs::write(&self.path, content)?;

        tracing::info!(path = %self.path.display(), "saved config file");
        Ok(())
    }

    /// Persist a new API key and clear the setup flag
    ///
    /// Other fields already in the file are preserved. An unparsable file is
    /// left untouched rather than replaced with defaults.
    ///
    /// # Errors
    ///
    /// Returns error if the key is blank, the existing file cannot be parsed,
    /// or the file cannot be written
    pub fn save_api_key(&self, api_key: &str) -> Result<AssistantConfigFile> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(Error::Config("API key cannot be empty".to_string()));
        }

        let mut config = self.load_strict()?;
        config.api_key = Some(api_key.to_string());
        config.require_api_key_setup = Some(false);
        self.save(&config)?;

        Ok(config)
    }
}

/// Return the config file path: `~/.config/bible-voice/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("bible-voice").join("config.toml"))
}
