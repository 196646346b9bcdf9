//! Dot Conversation Providers
//!
//! Chat completion client for the conversation fallback. The core hands over a
//! transcript and gets the assistant's text back.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_ATTEMPTS: u32 = 2;
const DEFAULT_WAIT: Duration = Duration::from_secs(1);
const MAX_WAIT: Duration = Duration::from_secs(5);
const ERROR_BODY_CHARS: usize = 300;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    fn with_role(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role("assistant", content)
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP {status} from {url}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
        retry_after: Option<Duration>,
    },

    #[error("undecodable response: {0}")]
    Decode(String),

    #[error("provider refused: {0}")]
    Api(String),

    #[error("response carried no text")]
    Empty,
}

impl ProviderError {
    /// Rate limits, server errors, timeouts and refused connections
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { source, .. } => source.is_timeout() || source.is_connect(),
            Self::Status { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            _ => false,
        }
    }

    fn wait(&self) -> Duration {
        match self {
            Self::Status {
                retry_after: Some(wait),
                ..
            } => (*wait).min(MAX_WAIT),
            _ => DEFAULT_WAIT,
        }
    }
}

/// Anything that turns a transcript into the next assistant message
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ProviderError>;
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

/// Pulls the first choice's text out of a `/chat/completions` body
fn completion_text(body: &str) -> Result<String, ProviderError> {
    let parsed: CompletionResponse = serde_json::from_str(body)
        .map_err(|e| ProviderError::Decode(format!("{} | body={}", e, clip(body))))?;
    if let Some(error) = parsed.error {
        return Err(ProviderError::Api(error.message));
    }
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message)
        .and_then(|message| message.content)
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
        .ok_or(ProviderError::Empty)
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}

fn clip(text: &str) -> String {
    if text.chars().count() <= ERROR_BODY_CHARS {
        return text.to_string();
    }
    let mut clipped: String = text.chars().take(ERROR_BODY_CHARS).collect();
    clipped.push_str("...");
    clipped
}

/// Client for any server speaking the OpenAI `/chat/completions` dialect
pub struct OpenAiChat {
    http: Client,
    name: String,
    endpoint: String,
    api_key: String,
    model: String,
    attempts: u32,
}

impl OpenAiChat {
    pub fn new(name: &str, api_key: &str, base_url: Option<&str>, model: Option<&str>) -> Self {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        let base = base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/');
        Self {
            http,
            name: name.to_string(),
            endpoint: format!("{}/chat/completions", base),
            api_key: api_key.to_string(),
            model: model.unwrap_or(DEFAULT_MODEL).to_string(),
            attempts: DEFAULT_ATTEMPTS,
        }
    }

    /// Total tries per completion, at least one
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn send_once(&self, messages: &[ChatMessage]) -> Result<String, ProviderError> {
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&CompletionRequest {
                model: &self.model,
                messages,
            })
            .send()
            .await
            .map_err(|source| ProviderError::Transport {
                url: self.endpoint.clone(),
                source,
            })?;

        let status = response.status();
        let wait = retry_after(response.headers());
        let body = response
            .text()
            .await
            .map_err(|source| ProviderError::Transport {
                url: self.endpoint.clone(),
                source,
            })?;
        if !status.is_success() {
            return Err(ProviderError::Status {
                status: status.as_u16(),
                url: self.endpoint.clone(),
                body: clip(&body),
                retry_after: wait,
            });
        }
        completion_text(&body)
    }
}

#[async_trait]
impl ChatProvider for OpenAiChat {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ProviderError> {
        let mut attempt = 1;
        loop {
            match self.send_once(messages).await {
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    let wait = e.wait();
                    warn!(
                        provider = %self.name,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        "Retrying chat completion: {}",
                        e
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn endpoint_is_built_from_base_url() {
        let client = OpenAiChat::new("local", "key", Some("http://localhost:8080/v1/"), None);
        assert_eq!(client.endpoint(), "http://localhost:8080/v1/chat/completions");
        assert_eq!(client.model(), DEFAULT_MODEL);

        let default = OpenAiChat::new("openai", "key", None, Some("gpt-4o"));
        assert_eq!(default.endpoint(), "https://api.openai.com/v1/chat/completions");
        assert_eq!(default.model(), "gpt-4o");
    }

    #[test]
    fn first_choice_text_is_trimmed() {
        let body = r#"{"model":"m","choices":[{"message":{"content":" hello "},"finish_reason":"stop"}]}"#;
        assert_eq!(completion_text(body).expect("text"), "hello");
    }

    #[test]
    fn unusable_bodies_are_errors() {
        assert!(matches!(
            completion_text(r#"{"choices":[{"message":{"content":"   "}}]}"#),
            Err(ProviderError::Empty)
        ));
        assert!(matches!(completion_text(r#"{"id":"x"}"#), Err(ProviderError::Empty)));
        assert!(matches!(
            completion_text(r#"{"error":{"message":"bad key"}}"#),
            Err(ProviderError::Api(message)) if message == "bad key"
        ));
        assert!(matches!(completion_text("<html>"), Err(ProviderError::Decode(_))));
    }

    #[test]
    fn only_overload_statuses_are_transient() {
        let status = |code| ProviderError::Status {
            status: code,
            url: "u".to_string(),
            body: String::new(),
            retry_after: None,
        };
        assert!(status(429).is_transient());
        assert!(status(503).is_transient());
        assert!(!status(401).is_transient());
        assert!(!ProviderError::Empty.is_transient());
    }

    #[test]
    fn retry_after_header_is_capped() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("120"));
        let wait = retry_after(&headers);
        assert_eq!(wait, Some(Duration::from_secs(120)));

        let err = ProviderError::Status {
            status: 429,
            url: "u".to_string(),
            body: String::new(),
            retry_after: wait,
        };
        assert_eq!(err.wait(), MAX_WAIT);
        assert_eq!(ProviderError::Empty.wait(), DEFAULT_WAIT);
    }

    #[test]
    fn long_error_bodies_are_clipped() {
        let long = "x".repeat(ERROR_BODY_CHARS + 10);
        let clipped = clip(&long);
        assert!(clipped.ends_with("..."));
        assert_eq!(clipped.chars().count(), ERROR_BODY_CHARS + 3);
    }
}
