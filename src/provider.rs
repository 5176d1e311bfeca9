//! HTTP backends for the text-generation providers.
//!
//! Each backend turns a list of chat messages into generated text. Failures
//! keep the HTTP status so the fallback chain can decide whether to move on
//! to the next model or give up.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// User-Agent string identifying this client
const USER_AGENT: &str = concat!("briefly/", env!("CARGO_PKG_VERSION"), " (https://github.com/cladam/briefly)");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// How one provider attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    /// Worth trying another model
    Retryable,
    /// Same credentials will fail everywhere on this provider
    Fatal,
}

#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("{provider} API HTTP {status}")]
    Http {
        provider: String,
        status: u16,
        body: String,
    },
    #[error("request failed: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("empty response from {0}")]
    EmptyResponse(String),
    #[error("failed to parse response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Network(e.to_string())
        }
    }
}

impl ProviderError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Authentication failures are fatal; everything else may succeed on
    /// another model.
    pub fn classify(&self) -> AttemptOutcome {
        match self.status() {
            Some(401) | Some(403) => AttemptOutcome::Fatal,
            _ => AttemptOutcome::Retryable,
        }
    }

    /// Signals that the provider wants us to back off.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self.status(), Some(429) | Some(503))
    }
}

/// One text-generation provider.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Short provider name for logs, e.g. `openrouter`.
    fn name(&self) -> &str;

    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        max_tokens: u32,
    ) -> Result<String, ProviderError>;
}

/// Create a configured HTTP client for provider calls
fn create_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
}

// ── OpenRouter ─────────────────────────────────────────────────────

#[derive(Serialize)]
struct OpenRouterRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct OpenRouterResponse {
    #[serde(default)]
    choices: Vec<OpenRouterChoice>,
    #[serde(default)]
    error: Option<OpenRouterError>,
}

#[derive(Deserialize)]
struct OpenRouterChoice {
    message: OpenRouterMessage,
}

#[derive(Deserialize)]
struct OpenRouterMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenRouterError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<u16>,
}

/// Chat completions on OpenRouter (or any endpoint speaking its dialect).
pub struct OpenRouterBackend {
    client: Client,
    endpoint: String,
    api_key: String,
    temperature: f32,
}

impl OpenRouterBackend {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        temperature: f32,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client: create_client(timeout)?,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            temperature,
        })
    }
}

#[async_trait]
impl ChatBackend for OpenRouterBackend {
    fn name(&self) -> &str {
        "openrouter"
    }

    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        max_tokens: u32,
    ) -> Result<String, ProviderError> {
        let body = OpenRouterRequest {
            model,
            messages,
            temperature: self.temperature,
            max_tokens,
        };
        debug!(model, messages = messages.len(), max_tokens, "openrouter request");
        let start = Instant::now();

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header("X-Title", "briefly")
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        debug!(model, status = status.as_u16(), elapsed_ms = start.elapsed().as_millis() as u64, "openrouter response");

        if !status.is_success() {
            return Err(ProviderError::Http {
                provider: self.name().to_string(),
                status: status.as_u16(),
                body: text,
            });
        }

        let parsed: OpenRouterResponse =
            serde_json::from_str(&text).map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        // Upstream failures sometimes arrive with a 200 and an error object.
        if let Some(err) = parsed.error {
            return Err(ProviderError::Http {
                provider: self.name().to_string(),
                status: err.code.unwrap_or(502),
                body: err.message,
            });
        }

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ProviderError::EmptyResponse(self.name().to_string()))
    }
}

// ── Gemini ─────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    contents: Vec<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize, Deserialize, Default)]
struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: GeminiContent,
}

/// Google's `generateContent` API, used as the independent last resort.
pub struct GeminiBackend {
    client: Client,
    base_url: String,
    api_key: String,
    temperature: f32,
}

impl GeminiBackend {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        temperature: f32,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client: create_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            temperature,
        })
    }

    fn build_request(&self, messages: &[ChatMessage], max_tokens: u32) -> GeminiRequest {
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        let system_instruction = (!system.is_empty()).then(|| GeminiContent {
            role: None,
            parts: vec![GeminiPart {
                text: system.join("\n\n"),
            }],
        });
        let contents = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| GeminiContent {
                role: Some(if m.role == Role::Assistant { "model" } else { "user" }.to_string()),
                parts: vec![GeminiPart {
                    text: m.content.clone(),
                }],
            })
            .collect();
        GeminiRequest {
            system_instruction,
            contents,
            generation_config: GeminiGenerationConfig {
                temperature: self.temperature,
                max_output_tokens: max_tokens,
            },
        }
    }
}

#[async_trait]
impl ChatBackend for GeminiBackend {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        max_tokens: u32,
    ) -> Result<String, ProviderError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, model);
        let body = self.build_request(messages, max_tokens);
        debug!(model, messages = messages.len(), max_tokens, "gemini request");

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        debug!(model, status = status.as_u16(), "gemini response");

        if !status.is_success() {
            return Err(ProviderError::Http {
                provider: self.name().to_string(),
                status: status.as_u16(),
                body: text,
            });
        }

        let parsed: GeminiResponse =
            serde_json::from_str(&text).map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        let out: String = parsed
            .candidates
            .into_iter()
            .next()
            .map(|c| {
                c.content
                    .parts
                    .into_iter()
                    .map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        if out.trim().is_empty() {
            return Err(ProviderError::EmptyResponse(self.name().to_string()));
        }
        Ok(out)
    }
}
