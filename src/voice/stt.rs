//! Speech-to-text (STT) processing

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::capture::UtteranceRequest;
use crate::gemini::{GeminiClient, GeminiError, GenerateContentRequest, Part};
use crate::{Error, Result};

/// Marker the Gemini transcriber is told to answer with on silence
const NO_SPEECH_MARKER: &str = "NO_SPEECH";

/// Instruction sent alongside audio to Gemini
const TRANSCRIBE_INSTRUCTION: &str = "Transcribe the spoken English in this audio exactly. \
Reply with the transcript only, without quotes or commentary. \
If there is no intelligible speech, reply with NO_SPEECH.";

/// Outcome of one transcription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptResult {
    /// Recognised text, lowercased
    Ok(String),
    /// No speech could be recognised
    Empty,
    /// Service failed or was unreachable
    ServiceError(String),
    /// Service did not answer in time
    Timeout,
}

impl TranscriptResult {
    /// Build a result from raw service text
    #[must_use]
    pub fn from_text(text: &str) -> Self {
        let text = text.trim().trim_matches('"').trim();
        if text.is_empty() || text.eq_ignore_ascii_case(NO_SPEECH_MARKER) {
            Self::Empty
        } else {
            Self::Ok(text.to_lowercase())
        }
    }
}

/// Converts one utterance to text
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe one captured utterance; never retries
    async fn transcribe(&self, utterance: &UtteranceRequest) -> TranscriptResult;
}

/// Transcribes with Gemini by sending the WAV inline
pub struct GeminiTranscriber {
    client: GeminiClient,
}

impl GeminiTranscriber {
    /// Create a transcriber
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationMissing` if the key is empty
    pub fn new(api_key: &str, model: &str, base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: GeminiClient::new(api_key, model, base_url, timeout)?,
        })
    }
}

#[async_trait]
impl Transcriber for GeminiTranscriber {
    async fn transcribe(&self, utterance: &UtteranceRequest) -> TranscriptResult {
        tracing::debug!(
            audio_bytes = utterance.audio.len(),
            model = self.client.model(),
            "starting Gemini transcription"
        );

        let request = GenerateContentRequest::user(
            None,
            vec![
                Part::text(TRANSCRIBE_INSTRUCTION),
                Part::inline("audio/wav", &utterance.audio),
            ],
        );

        match self.client.generate_content(&request).await {
            Ok(text) => {
                let result = TranscriptResult::from_text(&text);
                tracing::debug!(?result, "transcription complete");
                result
            }
            Err(GeminiError::Timeout) => TranscriptResult::Timeout,
            Err(GeminiError::Blocked(_)) => TranscriptResult::Empty,
            Err(e) => TranscriptResult::ServiceError(e.to_string()),
        }
    }
}

/// Response from `OpenAI` Whisper transcription API
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Transcribes with the `OpenAI` Whisper API
pub struct WhisperTranscriber {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
}

impl WhisperTranscriber {
    /// Create a transcriber
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(api_key: &str, model: String, timeout: Duration) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(Error::Config(
                "OpenAI API key required for Whisper".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            api_key: SecretString::from(api_key.trim().to_string()),
            model,
        })
    }

    async fn request(&self, audio: &[u8]) -> std::result::Result<String, TranscriptResult> {
        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio.to_vec())
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| TranscriptResult::ServiceError(e.to_string()))?,
            )
            .text("model", self.model.clone());

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/transcriptions")
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Whisper request failed");
                request_failure(&e)
            })?;

        let status = response.status();
        tracing::debug!(status = %status, "received response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Whisper API error");
            return Err(TranscriptResult::ServiceError(format!(
                "Whisper API error {status}: {body}"
            )));
        }

        let result: WhisperResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "failed to parse response");
            request_failure(&e)
        })?;

        Ok(result.text)
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, utterance: &UtteranceRequest) -> TranscriptResult {
        tracing::debug!(
            audio_bytes = utterance.audio.len(),
            "starting Whisper transcription"
        );

        match self.request(&utterance.audio).await {
            Ok(text) => {
                let result = TranscriptResult::from_text(&text);
                tracing::debug!(?result, "transcription complete");
                result
            }
            Err(failure) => failure,
        }
    }
}

fn request_failure(error: &reqwest::Error) -> TranscriptResult {
    if error.is_timeout() {
        TranscriptResult::Timeout
    } else {
        TranscriptResult::ServiceError(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcripts_are_lowercased() {
        assert_eq!(
            TranscriptResult::from_text("  Hey Bible, tell me about Noah "),
            TranscriptResult::Ok("hey bible, tell me about noah".to_string())
        );
    }

    #[test]
    fn silence_markers_are_empty() {
        assert_eq!(TranscriptResult::from_text(""), TranscriptResult::Empty);
        assert_eq!(TranscriptResult::from_text("no_speech\n"), TranscriptResult::Empty);
        assert_eq!(TranscriptResult::from_text("\"\""), TranscriptResult::Empty);
    }

    #[test]
    fn whisper_requires_key() {
        let result = WhisperTranscriber::new(" ", "whisper-1".to_string(), Duration::from_secs(5));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
