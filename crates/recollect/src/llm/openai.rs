//! OpenAI-compatible chat completion generator
//!
//! Works with any endpoint that speaks the `/chat/completions` protocol. The
//! API key is read from the environment variable named in the config.
//!
//! Reasoning priming is done by ending the request with an assistant message
//! that opens a `<think>` block. Backends that continue a trailing assistant
//! message pick up from there; the reply is merged back with the primer.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::GeneratorConfig;
use crate::conversation::{Conversation, Message, Role};
use crate::llm::{Generator, GeneratorError};

/// Generator backed by an OpenAI-compatible HTTP API
#[derive(Debug)]
pub struct OpenAiGenerator {
    client: Client,
    config: GeneratorConfig,
    api_key: String,
}

/// OpenAI-compatible chat completion request
#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
    /// Not part of the OpenAI API; sent only when configured
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    frequency_penalty: f32,
    presence_penalty: f32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

/// OpenAI-compatible chat completion response
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiGenerator {
    /// Create a generator from config.
    ///
    /// Fails if the API key environment variable is not set.
    pub fn new(config: &GeneratorConfig) -> Result<Self, GeneratorError> {
        let api_key = env::var(&config.api_key_env).map_err(|_| {
            GeneratorError::ConfigError(format!(
                "API key env var '{}' not set",
                config.api_key_env
            ))
        })?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GeneratorError::ConfigError(e.to_string()))?;

        info!(
            "OpenAiGenerator initialized with model: {}, api_url: {}",
            config.model, config.api_url
        );

        Ok(Self {
            client,
            config: config.clone(),
            api_key,
        })
    }

    /// Build the request messages and the reasoning primer, if any
    fn build_messages(
        conversation: &Conversation,
        context: Option<&str>,
    ) -> (Vec<ChatMessage>, Option<String>) {
        let mut history = conversation.messages.as_slice();
        let mut primer: Option<String> = None;

        if conversation.ends_with_reasoning() {
            if let Some((last, rest)) = history.split_last() {
                primer = Some(last.reasoning_text().to_string());
                history = rest;
            }
        }
        if let Some(context) = context {
            primer = Some(match primer {
                Some(p) => format!("{p}\n{context}"),
                None => context.to_string(),
            });
        }

        let mut messages: Vec<ChatMessage> = history
            .iter()
            .map(|m| ChatMessage {
                role: m.role.as_str(),
                content: m.to_prompt_content(),
            })
            .collect();

        if let Some(p) = &primer {
            messages.push(ChatMessage {
                role: Role::Assistant.as_str(),
                content: format!("<think>{p}"),
            });
        }

        (messages, primer)
    }

    /// Call the API with exponential backoff for rate limiting
    async fn call_api(&self, request: &ChatCompletionRequest) -> Result<String, GeneratorError> {
        debug!("Calling chat completion API at: {}", self.config.api_url);

        let max_retries = self.config.max_retries.max(1);
        let mut last_error = None;
        let mut delay = Duration::from_secs(1);

        for attempt in 0..max_retries {
            match self
                .client
                .post(&self.config.api_url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(request)
                .send()
                .await
            {
                Ok(response) => {
                    let status = response.status();

                    if status == 429 {
                        warn!(
                            "Rate limited on attempt {}/{}, waiting {:?}",
                            attempt + 1,
                            max_retries,
                            delay
                        );
                        last_error = Some("rate limited".to_string());
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                        continue;
                    }

                    if !status.is_success() {
                        let error_text = response
                            .text()
                            .await
                            .unwrap_or_else(|_| "Unknown error".to_string());
                        return Err(GeneratorError::ApiError(format!(
                            "API returned {status}: {error_text}"
                        )));
                    }

                    let completion: ChatCompletionResponse = response
                        .json()
                        .await
                        .map_err(|e| GeneratorError::ParseError(e.to_string()))?;

                    return completion
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|c| c.message.content)
                        .ok_or_else(|| GeneratorError::ApiError("Empty response".to_string()));
                }
                Err(e) => {
                    let err_msg = e.to_string();
                    last_error = Some(err_msg.clone());
                    if attempt < max_retries - 1 {
                        warn!(
                            "Request failed on attempt {}/{}, retrying: {}",
                            attempt + 1,
                            max_retries,
                            err_msg
                        );
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        Err(GeneratorError::RequestFailed(format!(
            "Failed after {} retries: {}",
            max_retries,
            last_error.unwrap_or_else(|| "Unknown error".to_string())
        )))
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    async fn generate(
        &self,
        conversation: &Conversation,
        context: Option<&str>,
    ) -> Result<Message, GeneratorError> {
        let (messages, primer) = Self::build_messages(conversation, context);

        let request = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            top_p: self.config.top_p,
            top_k: (self.config.top_k > 0).then_some(self.config.top_k),
            frequency_penalty: self.config.frequency_penalty,
            presence_penalty: self.config.presence_penalty,
            stop: self.config.stop.clone(),
        };

        let raw = self.call_api(&request).await?;
        debug!("Generator response: {} chars", raw.len());
        Ok(Message::from_model_output(&raw, primer.as_deref()))
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn create_test_config(server_uri: &str, key_env: &str) -> GeneratorConfig {
        GeneratorConfig {
            api_url: format!("{server_uri}/chat/completions"),
            api_key_env: key_env.to_string(),
            timeout_secs: 30,
            ..GeneratorConfig::default()
        }
    }

    fn completion(content: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [{
                "message": {
                    "content": content
                }
            }]
        })
    }

    fn user_conversation(text: &str) -> Conversation {
        Conversation::from_messages(vec![Message::user(text)])
    }

    #[tokio::test]
    async fn test_openai_generator_missing_api_key() {
        unsafe { env::remove_var("RECOLLECT_TEST_MISSING_KEY") };

        let config = create_test_config("https://api.example.com/v1", "RECOLLECT_TEST_MISSING_KEY");
        let result = OpenAiGenerator::new(&config);

        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("RECOLLECT_TEST_MISSING_KEY"));
    }

    #[tokio::test]
    async fn test_openai_generator_plain_reply() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer test-key"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(completion("<think>The user greets me.</think>Hello!")),
            )
            .mount(&mock_server)
            .await;

        unsafe { env::set_var("RECOLLECT_TEST_KEY_PLAIN", "test-key") };
        let config = create_test_config(&mock_server.uri(), "RECOLLECT_TEST_KEY_PLAIN");
        let generator = OpenAiGenerator::new(&config).unwrap();

        let message = generator
            .generate(&user_conversation("Hi there"), None)
            .await
            .unwrap();

        assert_eq!(message.role, Role::Assistant);
        assert_eq!(message.message_text(), "Hello!");
        assert_eq!(message.reasoning_text(), "The user greets me.");
    }

    #[tokio::test]
    async fn test_openai_generator_sends_primer_as_assistant_turn() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(serde_json::json!({
                "model": "gpt-4o-mini",
                "top_k": 50,
                "messages": [
                    {"role": "user", "content": "What is Rust?"},
                    {"role": "assistant", "content": "<think>Okay, let me think."}
                ]
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(completion(" It is a language.</think>Rust is a systems language.")),
            )
            .mount(&mock_server)
            .await;

        unsafe { env::set_var("RECOLLECT_TEST_KEY_PRIMER", "test-key") };
        let config = create_test_config(&mock_server.uri(), "RECOLLECT_TEST_KEY_PRIMER");
        let generator = OpenAiGenerator::new(&config).unwrap();

        let message = generator
            .generate(&user_conversation("What is Rust?"), Some("Okay, let me think."))
            .await
            .unwrap();

        assert_eq!(message.message_text(), "Rust is a systems language.");
        assert_eq!(
            message.reasoning_text(),
            "Okay, let me think. It is a language."
        );
    }

    #[tokio::test]
    async fn test_openai_generator_continues_trailing_reasoning() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(serde_json::json!({
                "messages": [
                    {"role": "user", "content": "Who wrote it?"},
                    {"role": "assistant", "content": "<think>Ada wrote the notes."}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("Ada Lovelace did.")))
            .mount(&mock_server)
            .await;

        unsafe { env::set_var("RECOLLECT_TEST_KEY_TRAILING", "test-key") };
        let config = create_test_config(&mock_server.uri(), "RECOLLECT_TEST_KEY_TRAILING");
        let generator = OpenAiGenerator::new(&config).unwrap();

        let mut conversation = user_conversation("Who wrote it?");
        conversation.add_context_as_reasoning("Ada wrote the notes.");

        let message = generator.generate(&conversation, None).await.unwrap();
        assert_eq!(message.message_text(), "Ada Lovelace did.");
        assert_eq!(message.reasoning_text(), "Ada wrote the notes.");
    }

    #[tokio::test]
    async fn test_openai_generator_rate_limit_retry() {
        let mock_server = MockServer::start().await;

        // First call returns 429, second succeeds
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("ok")))
            .mount(&mock_server)
            .await;

        unsafe { env::set_var("RECOLLECT_TEST_KEY_RATE", "test-key") };
        let config = create_test_config(&mock_server.uri(), "RECOLLECT_TEST_KEY_RATE");
        let generator = OpenAiGenerator::new(&config).unwrap();

        let start = std::time::Instant::now();
        let result = generator.generate(&user_conversation("Test"), None).await;
        let elapsed = start.elapsed();

        assert_eq!(result.unwrap().message_text(), "ok");
        // Should have waited at least 1 second for retry
        assert!(elapsed >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_openai_generator_api_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("Internal Server Error"))
            .mount(&mock_server)
            .await;

        unsafe { env::set_var("RECOLLECT_TEST_KEY_ERROR", "test-key") };
        let config = create_test_config(&mock_server.uri(), "RECOLLECT_TEST_KEY_ERROR");
        let generator = OpenAiGenerator::new(&config).unwrap();

        let result = generator.generate(&user_conversation("Test"), None).await;
        let err = result.unwrap_err();
        assert!(matches!(err, GeneratorError::ApiError(_)));
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn test_openai_generator_invalid_response_body() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&mock_server)
            .await;

        unsafe { env::set_var("RECOLLECT_TEST_KEY_INVALID", "test-key") };
        let config = create_test_config(&mock_server.uri(), "RECOLLECT_TEST_KEY_INVALID");
        let generator = OpenAiGenerator::new(&config).unwrap();

        let result = generator.generate(&user_conversation("Test"), None).await;
        assert!(matches!(result, Err(GeneratorError::ParseError(_))));
    }

    #[tokio::test]
    async fn test_openai_generator_name() {
        unsafe { env::set_var("RECOLLECT_TEST_KEY_NAME", "test-key") };
        let config = create_test_config("https://api.example.com/v1", "RECOLLECT_TEST_KEY_NAME");
        let generator = OpenAiGenerator::new(&config).unwrap();

        assert_eq!(generator.name(), "openai");
    }
}
