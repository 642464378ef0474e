//! OpenRouter API Client
//!
//! Chat-completions client for the OpenRouter endpoint. The credential is
//! supplied per call so the pipeline can rotate keys between attempts; any
//! non-200 response or a response without the expected choice is a uniform
//! [`ModelError`] for retry purposes.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Response body bytes kept for logging on error
const ERROR_BODY_PREVIEW: usize = 300;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("response missing completion text")]
    MalformedResponse,
}

/// Everything one completion call needs besides the credential
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system_prompt: String,
    /// Conversation transcript, empty when no history exists
    pub context: String,
    pub query: String,
}

/// Remote model collaborator, swappable in tests
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest, credential: &str)
        -> Result<String, ModelError>;
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// reqwest-backed OpenRouter client
pub struct OpenRouterClient {
    client: Client,
    model_id: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenRouterClient {
    pub fn new(
        model_id: &str,
        max_tokens: u32,
        temperature: f32,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            model_id: model_id.to_string(),
            max_tokens,
            temperature,
        })
    }

    fn build_messages(request: &CompletionRequest) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage {
            role: "system",
            content: request.system_prompt.clone(),
        }];
        if !request.context.is_empty() {
            messages.push(ChatMessage {
                role: "system",
                content: format!("Conversation Context:\n{}", request.context),
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: request.query.clone(),
        });
        messages
    }
}

#[async_trait]
impl ModelClient for OpenRouterClient {
    async fn complete(
        &self,
        request: &CompletionRequest,
        credential: &str,
    ) -> Result<String, ModelError> {
        let body = ChatRequest {
            model: self.model_id.clone(),
            messages: Self::build_messages(request),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        debug!(
            model = %self.model_id,
            query_len = request.query.len(),
            context_len = request.context.len(),
            "calling OpenRouter"
        );

        let response = self
            .client
            .post(OPENROUTER_API_URL)
            .bearer_auth(credential)
            .header("HTTP-Referer", "http://localhost")
            .header("X-Title", "seekbot")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Api {
                status: status.as_u16(),
                body: truncate(&body, ERROR_BODY_PREVIEW),
            });
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|text| !text.is_empty())
            .ok_or(ModelError::MalformedResponse)
    }
}

fn truncate(s: &str, max: usize) -> String {
    let end = s
        .char_indices()
        .take_while(|(i, _)| *i < max)
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(s.len().min(max));
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_messages_with_context() {
        let req = CompletionRequest {
            system_prompt: "persona".into(),
            context: "Recent group conversation:\n- hi".into(),
            query: "help".into(),
        };
        let messages = OpenRouterClient::build_messages(&req);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, "system");
        assert!(messages[1].content.starts_with("Conversation Context:"));
        assert_eq!(messages[2].role, "user");
        assert_eq!(messages[2].content, "help");
    }

    #[test]
    fn test_build_messages_without_context() {
        let req = CompletionRequest {
            system_prompt: "persona".into(),
            context: String::new(),
            query: "help".into(),
        };
        let messages = OpenRouterClient::build_messages(&req);
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn test_response_parsing_happy_path() {
        let json = r#"{"choices":[{"message":{"role":"assistant","content":"hello there"}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(json).unwrap();
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap();
        assert_eq!(text, "hello there");
    }

    #[test]
    fn test_response_missing_choices_is_malformed() {
        let json = r#"{"id":"gen-1"}"#;
        let parsed: ChatResponse = serde_json::from_str(json).unwrap();
        assert!(parsed.choices.is_empty());
    }

    #[test]
    fn test_truncate_utf8_boundary() {
        let s = "héllo wörld";
        let t = truncate(s, 3);
        assert!(t.len() <= 4);
        assert!(s.starts_with(&t));
    }
}
