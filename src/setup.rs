//! Interactive first-run setup (`bible-voice setup`)

use dialoguer::{Confirm, Input, Select};

use crate::config::{ConfigStore, DEFAULT_WAKE_PHRASE};
use crate::voice::SpeechCommand;

/// Show the first and last four characters of a key
#[must_use]
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}...{tail}")
    } else {
        "****".to_string()
    }
}

/// Run the interactive setup wizard
///
/// # Errors
///
/// Returns error if user input fails or config cannot be written
pub fn run_setup() -> anyhow::Result<()> {
    println!("Bible Voice Setup\n");

    let store = ConfigStore::default_location()
        .ok_or_else(|| anyhow::anyhow!("could not determine a config directory"))?;
    let mut existing = store.load();

    if store.path().exists() {
        println!("Existing config found at {}\n", store.path().display());
    }

    // 1. Gemini API key
    let existing_key = existing.api_key.clone().filter(|k| !k.trim().is_empty());
    let prompt = existing_key.as_deref().map_or_else(
        || "Gemini API key (GEMINI_API_KEY)".to_string(),
        |k| format!("Gemini API key (current: {}, leave blank to keep)", mask_key(k)),
    );

    let api_key_input: String = Input::new()
        .with_prompt(&prompt)
        .allow_empty(true)
        .interact_text()?;
    let api_key = if api_key_input.trim().is_empty() {
        existing_key
    } else {
        Some(api_key_input.trim().to_string())
    };

    // 2. Wake phrase
    let wake_phrase: String = Input::new()
        .with_prompt("Wake phrase")
        .default(
            existing
                .voice
                .wake_phrase
                .clone()
                .unwrap_or_else(|| DEFAULT_WAKE_PHRASE.to_string()),
        )
        .interact_text()?;

    // 3. Transcription provider
    let providers = ["gemini", "whisper"];
    let default_provider = existing
        .transcription
        .provider
        .as_deref()
        .and_then(|p| providers.iter().position(|&l| l.eq_ignore_ascii_case(p)))
        .unwrap_or(0);
    let provider_idx = Select::new()
        .with_prompt("Speech recognition provider")
        .items(&providers)
        .default(default_provider)
        .interact()?;

    if providers[provider_idx] == "whisper" && existing.transcription.openai_api_key.is_none() {
        let openai_key: String = Input::new()
            .with_prompt("OpenAI API key (OPENAI_API_KEY, leave blank to use env)")
            .allow_empty(true)
            .interact_text()?;
        if !openai_key.trim().is_empty() {
            existing.transcription.openai_api_key = Some(openai_key.trim().to_string());
        }
    }

    // 4. Speak command
    let default_speak = existing
        .voice
        .speak_command
        .clone()
        .unwrap_or_else(|| SpeechCommand::platform_default().program);
    let speak_command: String = Input::new()
        .with_prompt("Speech command (must accept -f <file>)")
        .default(default_speak)
        .interact_text()?;

    if which::which(&speak_command).is_err() {
        println!("Warning: '{speak_command}' was not found on PATH");
    }

    // 5. Websocket bridge
    let enable_server = Confirm::new()
        .with_prompt("Enable the browser bridge on localhost?")
        .default(existing.server.enabled.unwrap_or(true))
        .interact()?;

    existing.require_api_key_setup = Some(api_key.is_none());
    existing.api_key = api_key;
    existing.voice.wake_phrase = Some(wake_phrase.trim().to_lowercase());
    existing.voice.speak_command = Some(speak_command);
    existing.transcription.provider = Some(providers[provider_idx].to_string());
    existing.server.enabled = Some(enable_server);

    store.save(&existing)?;
    println!("\nConfig written to {}", store.path().display());
    println!("\nSetup complete! Run `bible-voice -v` to start.");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_long_keys() {
        assert_eq!(mask_key("AIzaSyExample1234"), "AIza...1234");
        assert_eq!(mask_key("short"), "****");
    }
}
