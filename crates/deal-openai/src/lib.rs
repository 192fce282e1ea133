//! OpenAI-compatible provider client and the Deal Co-Pilot stage agents
//!
//! Supports any provider with an OpenAI-compatible chat completions API
//! (OpenAI, Azure, LocalAI, etc.)
//!
//! # Features
//! - Chat completions, buffered or streamed as server-sent events
//! - A [`ChatBackend`] seam so agents can run against scripted backends
//! - The four stage agents: research, extraction, risk scan and IC memo

#![warn(missing_docs)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

use async_trait::async_trait;
use deal_core::ProviderConfig;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{self, HeaderMap, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

pub mod agents;
pub mod json;
pub mod prompts;
pub mod stream;

pub use agents::build_executors;

/// Stream of text deltas from a streamed completion
pub type DeltaStream = BoxStream<'static, anyhow::Result<String>>;

/// Anything that can answer chat completion requests.
///
/// [`OpenAIClient`] is the production implementation; tests script their own.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Model used when a request does not name one
    fn default_model(&self) -> &str;

    /// Run a request and return the whole assistant message
    async fn complete(&self, request: ChatRequest) -> anyhow::Result<String>;

    /// Run a request and stream the assistant message as it is produced
    async fn stream(&self, request: ChatRequest) -> anyhow::Result<DeltaStream>;
}

/// OpenAI-compatible client
#[derive(Debug, Clone)]
pub struct OpenAIClient {
    base_url: Url,
    api_key: SecretString,
    http: reqwest::Client,
    default_model: String,
}

/// Configuration for the client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL for the API (e.g. "https://api.openai.com/v1")
    pub base_url: String,
    /// API key for authentication; empty for local providers without auth
    pub api_key: SecretString,
    /// Default model to use for requests
    pub default_model: String,
    /// Request timeout in seconds
    pub timeout_seconds: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from(&ProviderConfig::default())
    }
}

impl From<&ProviderConfig> for ClientConfig {
    fn from(provider: &ProviderConfig) -> Self {
        Self {
            base_url: provider.base_url.clone(),
            api_key: SecretString::from(provider.api_key.clone().unwrap_or_default()),
            default_model: provider.model.clone(),
            timeout_seconds: provider.timeout_seconds,
        }
    }
}

/// Chat completion request
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    /// ID of the model to use
    pub model: String,
    /// List of messages in the conversation
    pub messages: Vec<Message>,
    /// Sampling temperature (0.0 to 2.0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Maximum number of tokens to generate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Desired format for the response
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    /// Stream the response as server-sent events
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
}

impl ChatRequest {
    /// A system + user exchange
    pub fn new(model: impl Into<String>, system: &str, user: &str) -> Self {
        Self {
            model: model.into(),
            messages: vec![Message::system(system), Message::user(user)],
            temperature: None,
            max_tokens: None,
            response_format: None,
            stream: false,
        }
    }

    /// Cap completion tokens
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set the sampling temperature
    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    /// Ask for a JSON object response
    pub fn json(mut self) -> Self {
        self.response_format = Some(ResponseFormat::JsonObject);
        self
    }
}

/// Format of the response
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ResponseFormat {
    /// JSON object response
    #[serde(rename = "json_object")]
    JsonObject,
    /// Plain text response
    #[serde(rename = "text")]
    Text,
}

/// Chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message author
    pub role: Role,
    /// Content of the message
    pub content: String,
}

impl Message {
    /// System message
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// User message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Role of the message author
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System prompt
    System,
    /// User input
    User,
    /// Assistant response
    Assistant,
}

/// Chat completion response
#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    /// Unique ID of the response
    pub id: String,
    /// Model used for generation
    pub model: String,
    /// List of generated choices
    pub choices: Vec<Choice>,
    /// Token usage statistics
    pub usage: Option<Usage>,
}

/// Generated choice
#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    /// Index of the choice
    pub index: i32,
    /// Generated message
    pub message: ResponseMessage,
    /// Reason for finishing (e.g. "stop", "length")
    pub finish_reason: Option<String>,
}

/// Assistant message in a response; content is null when filtered
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseMessage {
    /// Role of the message author
    pub role: Role,
    /// Content of the message
    pub content: Option<String>,
}

/// Token usage statistics
#[derive(Debug, Clone, Deserialize)]
pub struct Usage {
    /// Tokens in the prompt
    pub prompt_tokens: i32,
    /// Tokens in the completion
    pub completion_tokens: i32,
    /// Total tokens used
    pub total_tokens: i32,
}

/// API error response
#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
    /// Detailed error information
    pub error: ErrorDetail,
}

/// Detailed error information
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorDetail {
    /// Error message
    pub message: String,
    /// Error type
    #[serde(rename = "type", default)]
    pub error_type: String,
    /// Error code
    pub code: Option<String>,
}

impl OpenAIClient {
    /// Create a new client
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        let base_url = Url::parse(&config.base_url)?;

        info!(
            "Creating OpenAI client for URL: {}",
            base_url.domain().unwrap_or("unknown")
        );
        if config.api_key.expose_secret().is_empty() {
            warn!("No API key configured; requests are sent without authorization");
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            base_url,
            api_key: config.api_key,
            http,
            default_model: config.default_model,
        })
    }

    /// Build a client from the provider section of the app config
    pub fn from_provider(provider: &ProviderConfig) -> anyhow::Result<Self> {
        Self::new(ClientConfig::from(provider))
    }

    /// Build request headers
    fn build_headers(&self) -> anyhow::Result<HeaderMap> {
        let mut headers = HeaderMap::new();

        let key = self.api_key.expose_secret();
        if !key.is_empty() {
            let api_key_val = HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|e| anyhow::anyhow!("Invalid API key characters: {}", e))?;
            headers.insert(header::AUTHORIZATION, api_key_val);
        }

        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );

        Ok(headers)
    }

    fn completions_url(&self) -> anyhow::Result<Url> {
        // Url::join replaces the last segment unless the base ends with '/'
        if self.base_url.path().ends_with('/') {
            Ok(self.base_url.join("chat/completions")?)
        } else {
            let mut url_str = self.base_url.to_string();
            if !url_str.ends_with('/') {
                url_str.push('/');
            }
            url_str.push_str("chat/completions");
            Ok(Url::parse(&url_str)?)
        }
    }

    async fn send(&self, request: &ChatRequest) -> anyhow::Result<reqwest::Response> {
        let url = self.completions_url()?;
        let headers = self.build_headers()?;

        debug!(stream = request.stream, "Sending chat request to {}", url);

        let response = self
            .http
            .post(url)
            .headers(headers)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let error_text = response.text().await?;
        // Full body goes to the log only
        error!("API error ({}): {}", status, error_text);

        match serde_json::from_str::<ApiError>(&error_text) {
            Ok(api_error) => anyhow::bail!(
                "API error: {} ({})",
                sanitize_error_message(&api_error.error.message),
                api_error.error.error_type
            ),
            Err(_) => anyhow::bail!(
                "HTTP error {}: {}",
                status,
                status.canonical_reason().unwrap_or("Unknown error")
            ),
        }
    }

    /// Send a chat completion request
    #[instrument(skip(self, request), fields(model = %request.model))]
    pub async fn chat(&self, mut request: ChatRequest) -> anyhow::Result<ChatResponse> {
        request.stream = false;
        let response = self.send(&request).await?;
        let chat_response: ChatResponse = response.json().await?;
        info!(
            "Chat completion successful: {} tokens used",
            chat_response
                .usage
                .as_ref()
                .map(|u| u.total_tokens)
                .unwrap_or(0)
        );
        Ok(chat_response)
    }

    /// Send a chat completion request and stream the reply
    #[instrument(skip(self, request), fields(model = %request.model))]
    pub async fn chat_stream(&self, mut request: ChatRequest) -> anyhow::Result<DeltaStream> {
        request.stream = true;
        let response = self.send(&request).await?;
        let body = response.bytes_stream().map(|chunk| chunk.map(|b| b.to_vec()));
        Ok(stream::delta_stream(body))
    }

    /// Simple chat with default model
    pub async fn simple_chat(&self, system: &str, user: &str) -> anyhow::Result<String> {
        let request = ChatRequest::new(self.default_model.clone(), system, user)
            .with_temperature(Some(0.1))
            .with_max_tokens(4000);
        self.complete(request).await
    }
}

#[async_trait]
impl ChatBackend for OpenAIClient {
    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn complete(&self, request: ChatRequest) -> anyhow::Result<String> {
        let response = self.chat(request).await?;
        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|content| !content.is_empty())
            .ok_or_else(|| {
                anyhow::anyhow!("Provider returned an empty response (content filter or API issue)")
            })
    }

    async fn stream(&self, request: ChatRequest) -> anyhow::Result<DeltaStream> {
        self.chat_stream(request).await
    }
}

/// Sanitize error messages to prevent information disclosure
pub(crate) fn sanitize_error_message(message: &str) -> String {
    let patterns = [
        (r"(?i)api[_-]?key", "api_key"),
        (r"(?i)secret", "secret"),
        (r"(?i)token", "token"),
        (r"(?i)password", "password"),
        (r"(?i)credential", "credential"),
        (r"sk-[a-zA-Z0-9]{20,}", "sk-***"),
        (r"[a-zA-Z0-9_-]{32,}", "***REDACTED***"),
    ];

    let mut sanitized = message.to_string();

    for (pattern, replacement) in patterns {
        if let Ok(re) = regex::Regex::new(pattern) {
            sanitized = re.replace_all(&sanitized, replacement).to_string();
        }
    }

    if sanitized.len() > 256 {
        let mut cut = 256;
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}... [truncated]", &sanitized[..cut])
    } else {
        sanitized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn client(base_url: &str) -> OpenAIClient {
        OpenAIClient::new(ClientConfig {
            base_url: base_url.to_string(),
            api_key: SecretString::from("test-key".to_string()),
            default_model: "test-model".to_string(),
            timeout_seconds: 5,
        })
        .expect("client")
    }

    #[test]
    fn test_client_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.base_url, "https://api.openai.com/v1");
        assert_eq!(config.default_model, "gpt-4o-mini");
        assert_eq!(config.timeout_seconds, 300);
    }

    #[test]
    fn test_completions_url_keeps_path() {
        assert_eq!(
            client("https://api.example.com/v1").completions_url().expect("url").as_str(),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            client("https://api.example.com/v1/").completions_url().expect("url").as_str(),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn test_request_serialization() {
        let request = ChatRequest::new("m", "sys", "hi").json().with_max_tokens(10);
        let value = serde_json::to_value(&request).expect("json");
        assert_eq!(value["response_format"]["type"], "json_object");
        assert_eq!(value["max_tokens"], 10);
        assert!(value.get("stream").is_none());
        assert!(value.get("temperature").is_none());
        assert_eq!(value["messages"][0]["role"], "system");
    }

    #[test]
    fn test_sanitize_error_message() {
        let message = "Incorrect API key provided: sk-abcdefghijklmnopqrstuvwxyz123456";
        let sanitized = sanitize_error_message(message);
        assert!(!sanitized.contains("abcdefghijklmnop"));
        assert!(sanitized.contains("api_key"));

        let long = "é".repeat(300);
        assert!(sanitize_error_message(&long).ends_with("... [truncated]"));
    }

    #[tokio::test]
    async fn test_complete_against_mock_server() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer test-key")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"id":"c1","model":"test-model","choices":[{"index":0,"message":{"role":"assistant","content":"hello"},"finish_reason":"stop"}],"usage":{"prompt_tokens":3,"completion_tokens":1,"total_tokens":4}}"#,
            )
            .create_async()
            .await;

        let client = client(&format!("{}/v1", server.url()));
        let reply = client
            .complete(ChatRequest::new("test-model", "sys", "hi"))
            .await
            .expect("reply");
        assert_eq!(reply, "hello");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_stream_against_mock_server() {
        let mut server = mockito::Server::new_async().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"stream":true}"#.to_string(),
            ))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let client = client(&format!("{}/v1", server.url()));
        let deltas: Vec<String> = client
            .stream(ChatRequest::new("test-model", "sys", "hi"))
            .await
            .expect("stream")
            .map(|d| d.expect("delta"))
            .collect()
            .await;
        assert_eq!(deltas, vec!["Hel".to_string(), "lo".to_string()]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_api_error_is_sanitized() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(401)
            .with_body(
                r#"{"error":{"message":"Incorrect API key provided: sk-abcdefghijklmnopqrstuvwxyz123456","type":"invalid_request_error","code":"invalid_api_key"}}"#,
            )
            .create_async()
            .await;

        let client = client(&format!("{}/v1", server.url()));
        let err = client
            .complete(ChatRequest::new("test-model", "sys", "hi"))
            .await
            .expect_err("401");
        let message = format!("{:#}", err);
        assert!(message.contains("invalid_request_error"));
        assert!(!message.contains("abcdefghijklmnop"));
    }
}
