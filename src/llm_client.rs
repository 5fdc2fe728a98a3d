//! Suggestion provider boundary.
//!
//! The coordinator only sees the `SuggestionProvider` trait: prompt
//! context in, text or a structured error out, with cooperative
//! cancellation so a superseded request stops consuming resources.
//! The concrete client talks to an OpenAI-compatible chat-completions
//! endpoint.

use async_trait::async_trait;
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::SuggestionError;
use crate::events::Role;
use crate::settings::SuggestionProviderConfig;

/// What the provider gets to work with: the transcript snapshot of the
/// turn that triggered generation. Prompt wording lives with the
/// provider, not the coordinator.
#[derive(Debug, Clone)]
pub struct PromptContext {
    pub role: Role,
    pub transcript: String,
}

#[async_trait]
pub trait SuggestionProvider: Send + Sync {
    /// Generate one suggestion. Implementations must return
    /// `SuggestionError::Cancelled` promptly once the token fires.
    async fn generate(
        &self,
        context: &PromptContext,
        cancel: &CancellationToken,
    ) -> Result<String, SuggestionError>;
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Debug, Deserialize)]
struct ChatMessageResponse {
    content: Option<String>,
}

/// Chat-completions client for any OpenAI-compatible endpoint.
pub struct ChatCompletionProvider {
    config: SuggestionProviderConfig,
    client: reqwest::Client,
}

impl ChatCompletionProvider {
    pub fn new(config: SuggestionProviderConfig) -> Result<Self, String> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if !config.api_key.is_empty() {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", config.api_key))
                    .map_err(|e| format!("Invalid authorization header value: {}", e))?,
            );
        }
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| format!("Failed to build HTTP client: {}", e))?;
        Ok(Self { config, client })
    }

    /// Sanity-check an API key before saving it.
    pub fn validate_api_key(key: &str) -> Result<(), String> {
        if key.is_empty() {
            return Err("API key cannot be empty".to_string());
        }
        if key.len() < 20 {
            return Err("API key seems too short".to_string());
        }
        Ok(())
    }

    fn build_prompt(context: &PromptContext) -> String {
        format!(
            "The other person in a live conversation just said:\n\n{}\n\n\
             Suggest a concise, natural reply the listener could give.",
            context.transcript
        )
    }

    async fn request(&self, context: &PromptContext) -> Result<String, SuggestionError> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        debug!("sending suggestion request to: {}", url);

        let request_body = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: Self::build_prompt(context),
            }],
        };

        let response = self
            .client
            .post(&url)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| SuggestionError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(map_status(status.as_u16(), message));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| SuggestionError::Network(format!("failed to parse response: {}", e)))?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or(SuggestionError::Empty)
    }
}

/// Map an HTTP status onto the error taxonomy. Auth and rate-limit get
/// their own variants so the host can point at credentials.
fn map_status(status: u16, message: String) -> SuggestionError {
    match status {
        401 | 403 => SuggestionError::Auth { status },
        429 => SuggestionError::RateLimited { status },
        _ => SuggestionError::Http { status, message },
    }
}

#[async_trait]
impl SuggestionProvider for ChatCompletionProvider {
    async fn generate(
        &self,
        context: &PromptContext,
        cancel: &CancellationToken,
    ) -> Result<String, SuggestionError> {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("suggestion request cancelled before completion");
                Err(SuggestionError::Cancelled)
            }
            result = self.request(context) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_api_key_rejects_empty_and_short_keys() {
        assert!(ChatCompletionProvider::validate_api_key("").is_err());
        assert!(ChatCompletionProvider::validate_api_key("short").is_err());
        assert!(ChatCompletionProvider::validate_api_key(
            "sk-0123456789abcdef0123456789abcdef"
        )
        .is_ok());
    }

    #[test]
    fn status_mapping_tags_credential_errors() {
        assert!(map_status(401, String::new()).is_credential_error());
        assert!(map_status(403, String::new()).is_credential_error());
        assert!(map_status(429, String::new()).is_credential_error());
        assert!(!map_status(500, "boom".into()).is_credential_error());
        assert!(matches!(
            map_status(500, "boom".into()),
            SuggestionError::Http { status: 500, .. }
        ));
    }

    #[tokio::test]
    async fn generate_honors_cancellation() {
        // Point at an unroutable address so the request would hang or
        // fail slowly; cancellation must win the race.
        let provider = ChatCompletionProvider::new(SuggestionProviderConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            model: "test".to_string(),
            api_key: String::new(),
        })
        .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = provider
            .generate(
                &PromptContext {
                    role: Role::OtherParty,
                    transcript: "hello".into(),
                },
                &cancel,
            )
            .await;
        assert_eq!(result, Err(SuggestionError::Cancelled));
    }
}
