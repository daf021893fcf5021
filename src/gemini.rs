//! Minimal REST client for the Gemini `generateContent` endpoint
//!
//! Shared by the generation client and the Gemini transcriber.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Public Gemini API base URL
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// `generateContent` request body
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    pub contents: Vec<Content>,
}

impl GenerateContentRequest {
    /// Single user turn with an optional system instruction
    #[must_use]
    pub fn user(system_instruction: Option<&str>, parts: Vec<Part>) -> Self {
        Self {
            system_instruction: system_instruction.map(|text| Content {
                role: None,
                parts: vec![Part::text(text)],
            }),
            contents: vec![Content {
                role: Some("user".to_string()),
                parts,
            }],
        }
    }
}

/// One conversation turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

/// Text or inline binary part
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
}

impl Part {
    /// Text part
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            inline_data: None,
        }
    }

    /// Base64 inline data part
    #[must_use]
    pub fn inline(mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        use base64::Engine as _;

        Self {
            text: None,
            inline_data: Some(InlineData {
                mime_type: mime_type.into(),
                data: base64::engine::general_purpose::STANDARD.encode(bytes),
            }),
        }
    }
}

/// Inline binary payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

/// Failure of one `generateContent` call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GeminiError {
    /// No response within the request timeout
    #[error("request timed out")]
    Timeout,
    /// Service returned an error status
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },
    /// Prompt or response blocked by the service
    #[error("blocked: {0}")]
    Blocked(String),
    /// Connection or decoding failure
    #[error("{0}")]
    Transport(String),
}

/// Gemini REST client bound to one model
pub struct GeminiClient {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    model: String,
}

impl GeminiClient {
    /// Create a client
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationMissing` if the key is empty, or an HTTP error
    /// if the client cannot be built
    pub fn new(api_key: &str, model: &str, base_url: &str, timeout: Duration) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(Error::ConfigurationMissing(
                "Gemini API key required".to_string(),
            ));
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            api_key: SecretString::from(api_key.trim().to_string()),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }

    /// Model this client calls
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Call `generateContent` and return the concatenated text of the first candidate
    ///
    /// # Errors
    ///
    /// Returns [`GeminiError`] on timeout, transport failure, error status or block
    pub async fn generate_content(
        &self,
        request: &GenerateContentRequest,
    ) -> std::result::Result<String, GeminiError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(request)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, model = %self.model, "Gemini request failed");
                classify(&e)
            })?;

        let status = response.status();
        tracing::debug!(status = %status, "received response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorEnvelope>(&body).map_or(body, |env| {
                if env.error.status.is_empty() {
                    env.error.message
                } else {
                    format!("{} ({})", env.error.message, env.error.status)
                }
            });
            tracing::error!(status = %status, message = %message, "Gemini API error");
            return Err(GeminiError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: GenerateContentResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "failed to parse Gemini response");
            classify(&e)
        })?;

        extract_text(body)
    }
}

fn classify(error: &reqwest::Error) -> GeminiError {
    if error.is_timeout() {
        GeminiError::Timeout
    } else {
        GeminiError::Transport(error.to_string())
    }
}

fn extract_text(body: GenerateContentResponse) -> std::result::Result<String, GeminiError> {
    if let Some(reason) = body.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(GeminiError::Blocked(reason));
    }

    let Some(candidate) = body.candidates.into_iter().next() else {
        return Ok(String::new());
    };

    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    if text.is_empty() {
        if let Some(reason) = candidate.finish_reason.filter(|r| r == "SAFETY") {
            return Err(GeminiError::Blocked(reason));
        }
    }

    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uses_camel_case_fields() {
        let request = GenerateContentRequest::user(
            Some("be brief"),
            vec![Part::text("hi"), Part::inline("audio/wav", b"RIFF")],
        );
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(json["contents"][0]["role"], "user");
        assert_eq!(json["contents"][0]["parts"][1]["inlineData"]["mimeType"], "audio/wav");
        assert_eq!(json["contents"][0]["parts"][1]["inlineData"]["data"], "UklGRg==");
    }

    #[test]
    fn text_parts_are_concatenated() {
        let body: GenerateContentResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"In the "},{"text":"beginning"}]},"finishReason":"STOP"}]}"#,
        )
        .unwrap();

        assert_eq!(extract_text(body).unwrap(), "In the beginning");
    }

    #[test]
    fn blocked_prompt_is_an_error() {
        let body: GenerateContentResponse =
            serde_json::from_str(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#).unwrap();

        assert_eq!(
            extract_text(body),
            Err(GeminiError::Blocked("SAFETY".to_string()))
        );
    }

    #[test]
    fn errors_render_for_logs() {
        let err: Box<dyn std::error::Error> = Box::new(GeminiError::Api {
            status: 429,
            message: "quota exceeded".to_string(),
        });
        assert_eq!(err.to_string(), "API error 429: quota exceeded");
        assert_eq!(GeminiError::Timeout.to_string(), "request timed out");
    }

    #[test]
    fn empty_key_is_configuration_missing() {
        let result = GeminiClient::new("", "gemini-2.5-flash", DEFAULT_BASE_URL, Duration::from_secs(5));
        assert!(matches!(result, Err(Error::ConfigurationMissing(_))));
    }
}
