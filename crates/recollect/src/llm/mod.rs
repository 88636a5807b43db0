//! Text generation
//!
//! The retrieval core only needs two things from a language model: a free
//! text reply to a conversation, and a JSON object it can deserialize. Both go
//! through the [`Generator`] trait. [`OpenAiGenerator`] talks to any
//! OpenAI-compatible chat completion endpoint.

pub mod openai;
pub mod prompts;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::warn;

use crate::conversation::{Conversation, Message};

pub use openai::OpenAiGenerator;
pub use prompts::PromptTemplates;

/// Errors that can occur while generating text
#[derive(Error, Debug)]
pub enum GeneratorError {
    #[error("Request failed: {0}")]
    RequestFailed(String),
    #[error("API error: {0}")]
    ApiError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Produces assistant replies for a conversation
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generate the next assistant message.
    ///
    /// `context` is inserted as the start of the assistant's reasoning, so
    /// the model continues from it. A conversation that already ends in an
    /// assistant reasoning message is continued the same way.
    async fn generate(
        &self,
        conversation: &Conversation,
        context: Option<&str>,
    ) -> Result<Message, GeneratorError>;

    /// Generator name for logging
    fn name(&self) -> &'static str;
}

/// Deserialize the JSON object embedded in `text`.
///
/// Models like to wrap JSON in prose or code fences, so everything outside
/// the first `{` and the last `}` is ignored.
pub fn parse_json_object<T: DeserializeOwned>(text: &str) -> Result<T, GeneratorError> {
    let start = text.find('{');
    let end = text.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if e > s => &text[s..=e],
        _ => {
            return Err(GeneratorError::ParseError(
                "Response does not contain a JSON object".to_string(),
            ));
        }
    };

    serde_json::from_str(json)
        .map_err(|e| GeneratorError::ParseError(format!("Failed to parse JSON object: {e}")))
}

/// Generate a reply and parse it into `T`, retrying up to `max_attempts`
/// times when the request or the parse fails.
///
/// Returns the raw message alongside the parsed object so callers can still
/// read the model's reasoning.
pub async fn generate_object<T: DeserializeOwned>(
    generator: &dyn Generator,
    conversation: &Conversation,
    context: Option<&str>,
    max_attempts: usize,
) -> Result<(Message, T), GeneratorError> {
    let mut last_error = GeneratorError::ParseError("No attempts made".to_string());

    for attempt in 1..=max_attempts.max(1) {
        let result = generator
            .generate(conversation, context)
            .await
            .and_then(|message| {
                let object = parse_json_object(message.message_text())?;
                Ok((message, object))
            });

        match result {
            Ok(parsed) => return Ok(parsed),
            Err(e) => {
                warn!(
                    "{} object generation failed on attempt {}/{}: {}",
                    generator.name(),
                    attempt,
                    max_attempts,
                    e
                );
                last_error = e;
            }
        }
    }

    Err(last_error)
}
