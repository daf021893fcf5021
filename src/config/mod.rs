//! Configuration management for the voice assistant

pub mod file;

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::voice::SpeechCommand;
use crate::{Error, Result};

pub use file::{AssistantConfigFile, ConfigStore};

/// Default wake phrase
pub const DEFAULT_WAKE_PHRASE: &str = "hey bible";

/// Default acknowledgement spoken after the wake phrase
pub const DEFAULT_ACKNOWLEDGEMENT: &str = "Yes, how can I help?";

/// Default generation model
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

/// Default websocket bridge port
pub const DEFAULT_PORT: u16 = 8765;

/// Assistant configuration
#[derive(Debug)]
pub struct Config {
    /// Generation service API key
    pub api_key: Option<SecretString>,

    /// Surface should prompt for a key before first use
    pub requires_setup: bool,

    /// Voice loop configuration
    pub voice: VoiceConfig,

    /// Speech-to-text configuration
    pub transcription: TranscriptionConfig,

    /// Text generation configuration
    pub generation: GenerationConfig,

    /// Websocket bridge configuration
    pub server: ServerConfig,

    /// Path of the persisted config file
    pub config_path: PathBuf,
}

/// Voice loop configuration
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// Lowercase wake phrase
    pub wake_phrase: String,

    /// Spoken after the wake phrase is detected
    pub acknowledgement: String,

    /// OS speech command
    pub speak_command: SpeechCommand,

    /// Ambient-noise sampling before each capture
    pub calibration: Duration,

    /// Maximum wake utterance length
    pub wake_phrase_limit: Duration,

    /// Wait for the command to start before giving up
    pub command_start_timeout: Duration,

    /// Maximum command utterance length
    pub command_phrase_limit: Duration,

    /// Trailing silence that ends an utterance
    pub pause_threshold: Duration,

    /// Pause after a recoverable failure
    pub retry_backoff: Duration,

    /// Terminate-to-kill grace period for interrupted speech
    pub interrupt_grace: Duration,

    /// Consecutive failures before the loop stops (0 = unlimited)
    pub max_consecutive_failures: u32,

    /// Kill leftover speech processes at startup
    pub sweep_orphans: bool,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            wake_phrase: DEFAULT_WAKE_PHRASE.to_string(),
            acknowledgement: DEFAULT_ACKNOWLEDGEMENT.to_string(),
            speak_command: SpeechCommand::platform_default(),
            calibration: Duration::from_millis(500),
            wake_phrase_limit: Duration::from_secs(10),
            command_start_timeout: Duration::from_secs(5),
            command_phrase_limit: Duration::from_secs(15),
            pause_threshold: Duration::from_millis(800),
            retry_backoff: Duration::from_secs(2),
            interrupt_grace: Duration::from_millis(500),
            max_consecutive_failures: 10,
            sweep_orphans: true,
        }
    }
}

/// Speech-to-text backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SttProvider {
    /// Gemini multimodal transcription (shares the generation key)
    #[default]
    Gemini,
    /// `OpenAI` Whisper transcription API
    Whisper,
}

impl SttProvider {
    /// Parse a provider name, case-insensitively
    ///
    /// # Errors
    ///
    /// Returns error for unknown provider names
    pub fn parse(name: &str) -> Result<Self> {
        match name.trim().to_lowercase().as_str() {
            "gemini" | "google" => Ok(Self::Gemini),
            "whisper" | "openai" => Ok(Self::Whisper),
            other => Err(Error::Config(format!("unknown transcription provider: {other}"))),
        }
    }

    /// Default model for this provider
    #[must_use]
    pub const fn default_model(self) -> &'static str {
        match self {
            Self::Gemini => DEFAULT_MODEL,
            Self::Whisper => "whisper-1",
        }
    }
}

/// Speech-to-text configuration
#[derive(Debug)]
pub struct TranscriptionConfig {
    /// Backend
    pub provider: SttProvider,

    /// Model identifier
    pub model: String,

    /// `OpenAI` key for Whisper
    pub openai_api_key: Option<SecretString>,

    /// Request timeout
    pub timeout: Duration,
}

/// Text generation configuration
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// Model identifier
    pub model: String,

    /// Service base URL
    pub base_url: String,

    /// Request timeout
    pub timeout: Duration,
}

/// Websocket bridge configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Run the bridge
    pub enabled: bool,

    /// Bind host
    pub host: String,

    /// Bind port
    pub port: u16,

    /// Directory with the browser front-end
    pub static_dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration from the standard file and environment
    ///
    /// # Errors
    ///
    /// Returns error if a configured value is invalid
    pub fn load() -> Result<Self> {
        let store = ConfigStore::default_location()
            .unwrap_or_else(|| ConfigStore::new(".config/bible-voice/config.toml"));
        Self::load_from(&store)
    }

    /// Load configuration from a specific store and the environment
    ///
    /// # Errors
    ///
    /// Returns error if a configured value is invalid
    pub fn load_from(store: &ConfigStore) -> Result<Self> {
        Self::resolve(store.load(), store.path().to_path_buf(), |key| {
            std::env::var(key).ok()
        })
    }

    /// Resolve configuration (env > toml > default)
    ///
    /// # Errors
    ///
    /// Returns error if a configured value is invalid
    pub fn resolve(
        fc: AssistantConfigFile,
        config_path: PathBuf,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let api_key = env("GEMINI_API_KEY")
            .or(fc.api_key)
            .filter(|k| !k.trim().is_empty());
        let requires_setup = fc.require_api_key_setup.unwrap_or(api_key.is_none());

        let defaults = VoiceConfig::default();
        let v = fc.voice;

        let speak_command = match env("BIBLE_VOICE_SPEAK_COMMAND").or(v.speak_command) {
            Some(program) => SpeechCommand::new(program, v.speak_args.unwrap_or_default()),
            None => defaults.speak_command.clone(),
        };

        let wake_phrase = v
            .wake_phrase
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .unwrap_or(defaults.wake_phrase);

        let voice = VoiceConfig {
            wake_phrase,
            acknowledgement: v.acknowledgement.unwrap_or(defaults.acknowledgement),
            speak_command,
            calibration: secs_or(v.calibration_secs, defaults.calibration)?,
            wake_phrase_limit: secs_or(v.wake_phrase_limit_secs, defaults.wake_phrase_limit)?,
            command_start_timeout: secs_or(v.command_timeout_secs, defaults.command_start_timeout)?,
            command_phrase_limit: secs_or(
                v.command_phrase_limit_secs,
                defaults.command_phrase_limit,
            )?,
            pause_threshold: secs_or(v.pause_threshold_secs, defaults.pause_threshold)?,
            retry_backoff: secs_or(v.retry_backoff_secs, defaults.retry_backoff)?,
            interrupt_grace: v
                .interrupt_grace_ms
                .map_or(defaults.interrupt_grace, Duration::from_millis),
            max_consecutive_failures: v
                .max_consecutive_failures
                .unwrap_or(defaults.max_consecutive_failures),
            sweep_orphans: v.sweep_orphans.unwrap_or(defaults.sweep_orphans),
        };

        let provider = fc
            .transcription
            .provider
            .as_deref()
            .map(SttProvider::parse)
            .transpose()?
            .unwrap_or_default();
        let transcription = TranscriptionConfig {
            provider,
            model: fc
                .transcription
                .model
                .unwrap_or_else(|| provider.default_model().to_string()),
            openai_api_key: env("OPENAI_API_KEY")
                .or(fc.transcription.openai_api_key)
                .map(SecretString::from),
            timeout: Duration::from_secs(fc.transcription.timeout_secs.unwrap_or(30)),
        };

        let generation = GenerationConfig {
            model: fc
                .generation
                .model
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: fc
                .generation
                .base_url
                .unwrap_or_else(|| crate::gemini::DEFAULT_BASE_URL.to_string()),
            timeout: Duration::from_secs(fc.generation.timeout_secs.unwrap_or(60)),
        };

        let server = ServerConfig {
            enabled: fc.server.enabled.unwrap_or(true),
            host: env("BIBLE_VOICE_HOST")
                .or(fc.server.host)
                .unwrap_or_else(|| "localhost".to_string()),
            port: env("BIBLE_VOICE_PORT")
                .and_then(|s| s.parse().ok())
                .or(fc.server.port)
                .unwrap_or(DEFAULT_PORT),
            static_dir: env("BIBLE_VOICE_STATIC_DIR")
                .or(fc.server.static_dir)
                .map(PathBuf::from),
        };

        Ok(Self {
            api_key: api_key.map(SecretString::from),
            requires_setup,
            voice,
            transcription,
            generation,
            server,
            config_path,
        })
    }

    /// Whether a non-empty API key is configured
    #[must_use]
    pub const fn has_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Replace the API key after a successful save
    pub fn set_api_key(&mut self, api_key: &str) {
        self.api_key = Some(SecretString::from(api_key.trim().to_string()));
        self.requires_setup = false;
    }
}

/// Convert optional seconds to a duration, rejecting negative or non-finite values
fn secs_or(value: Option<f64>, default: Duration) -> Result<Duration> {
    value.map_or(Ok(default), |secs| {
        Duration::try_from_secs_f64(secs)
            .map_err(|_| Error::Config(format!("invalid duration: {secs} seconds")))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn defaults_without_file() {
        let config =
            Config::resolve(AssistantConfigFile::default(), PathBuf::from("c.toml"), no_env)
                .unwrap();

        assert!(!config.has_key());
        assert!(config.requires_setup);
        assert_eq!(config.voice.wake_phrase, "hey bible");
        assert_eq!(config.voice.command_start_timeout, Duration::from_secs(5));
        assert_eq!(config.voice.interrupt_grace, Duration::from_millis(500));
        assert_eq!(config.generation.model, "gemini-2.5-flash");
        assert_eq!(config.transcription.provider, SttProvider::Gemini);
        assert_eq!(config.server.port, 8765);
    }

    #[test]
    fn env_overrides_file() {
        let mut fc = AssistantConfigFile::default();
        fc.api_key = Some("from-file".to_string());
        fc.server.port = Some(9000);

        let config = Config::resolve(fc, PathBuf::from("c.toml"), |key| match key {
            "BIBLE_VOICE_PORT" => Some("9100".to_string()),
            _ => None,
        })
        .unwrap();

        assert!(config.has_key());
        assert!(!config.requires_setup);
        assert_eq!(config.server.port, 9100);
    }

    #[test]
    fn wake_phrase_is_normalized() {
        let mut fc = AssistantConfigFile::default();
        fc.voice.wake_phrase = Some("  Hey SCROLL ".to_string());

        let config = Config::resolve(fc, PathBuf::from("c.toml"), no_env).unwrap();
        assert_eq!(config.voice.wake_phrase, "hey scroll");
    }

    #[test]
    fn blank_key_counts_as_missing() {
        let mut fc = AssistantConfigFile::default();
        fc.api_key = Some("   ".to_string());

        let config = Config::resolve(fc, PathBuf::from("c.toml"), no_env).unwrap();
        assert!(!config.has_key());
    }

    #[test]
    fn negative_duration_is_rejected() {
        let mut fc = AssistantConfigFile::default();
        fc.voice.retry_backoff_secs = Some(-1.0);

        assert!(Config::resolve(fc, PathBuf::from("c.toml"), no_env).is_err());
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let mut fc = AssistantConfigFile::default();
        fc.transcription.provider = Some("carrier-pigeon".to_string());

        assert!(Config::resolve(fc, PathBuf::from("c.toml"), no_env).is_err());
        assert_eq!(SttProvider::parse("Whisper").unwrap(), SttProvider::Whisper);
    }
}
