//! Text generation with a fixed storyteller persona

use std::time::Duration;

use async_trait::async_trait;

use crate::gemini::{GeminiClient, GenerateContentRequest, Part};
use crate::Result;

/// System instruction sent with every prompt
pub const PERSONA: &str = "You are the Bible AI, a wise and eloquent storyteller. \
Your purpose is to narrate stories and concepts from the Bible. \
When asked for a story, you must tell it in a cinematic, descriptive, and immersive way. \
Use vivid imagery, describe the scenes, the emotions of the characters, and the atmosphere. \
Speak in a clear, calm, and respectful tone. Your goal is to make the listener feel like they are there. \
Keep your responses focused on the user's request. \
If the user asks a question that is not about a story (e.g., 'who was Moses?'), answer it clearly \
and concisely from a biblical perspective. \
Begin your stories directly without introductory phrases like 'Of course, here is a story...'";

/// Outcome of one generation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationResult {
    Ok(String),
    Error(String),
}

/// Produces a spoken answer for a prompt
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generate a response; never retries
    async fn generate(&self, prompt: &str) -> GenerationResult;
}

/// Gemini-backed generator using [`PERSONA`]
pub struct GeminiGenerator {
    client: GeminiClient,
}

impl GeminiGenerator {
    /// Create a generator
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
impl Generator for GeminiGenerator {
    async fn generate(&self, prompt: &str) -> GenerationResult {
        tracing::debug!(model = self.client.model(), prompt_len = prompt.len(), "generating");

        let request = GenerateContentRequest::user(Some(PERSONA), vec![Part::text(prompt)]);

        match self.client.generate_content(&request).await {
            Ok(text) if text.trim().is_empty() => {
                GenerationResult::Error("empty response from model".to_string())
            }
            Ok(text) => GenerationResult::Ok(text.trim().to_string()),
            Err(e) => GenerationResult::Error(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persona_is_a_storyteller() {
        assert!(PERSONA.starts_with("You are the Bible AI"));
        assert!(!PERSONA.contains("  "));
    }
}
