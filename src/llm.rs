//! Thin adapter over an OpenAI-compatible chat completions endpoint
//!
//! Callers depend on the [`Completer`] trait so that demo mode and tests can
//! swap in [`DisabledCompleter`] or a fake.

use crate::config::LlmConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".to_string(), content: content.into() }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug)]
pub enum LlmError {
    /// No API key configured
    Disabled,
    Transport(String),
    Status { code: u16, body: String },
    Decode(String),
    Empty,
}

impl LlmError {
    fn is_retryable(&self) -> bool {
        match self {
            LlmError::Transport(_) => true,
            LlmError::Status { code, .. } => *code == 429 || *code >= 500,
            _ => false,
        }
    }
}

impl std::fmt::Display for LlmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmError::Disabled => write!(f, "LLM disabled (no API key)"),
            LlmError::Transport(msg) => write!(f, "LLM request failed: {}", msg),
            LlmError::Status { code, body } => write!(f, "LLM API error (HTTP {}): {}", code, body),
            LlmError::Decode(msg) => write!(f, "Unreadable LLM response: {}", msg),
            LlmError::Empty => write!(f, "LLM returned no choices"),
        }
    }
}

impl std::error::Error for LlmError {}

impl From<ureq::Error> for LlmError {
    fn from(e: ureq::Error) -> Self {
        LlmError::Transport(e.to_string())
    }
}

pub trait Completer: Send + Sync {
    fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError>;
}

/// Demo-mode completer: every call fails so callers use canned text
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledCompleter;

impl Completer for DisabledCompleter {
    fn complete(&self, _request: &CompletionRequest) -> Result<String, LlmError> {
        Err(LlmError::Disabled)
    }
}

#[derive(Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ApiResponse {
    choices: Option<Vec<Choice>>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

pub struct OpenAiClient {
    agent: ureq::Agent,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(config: &LlmConfig, api_key: &str) -> Self {
        let agent = ureq::Agent::new_with_config(
            ureq::config::Config::builder()
                .http_status_as_error(false)
                .timeout_global(Some(Duration::from_secs(config.timeout_secs.max(1))))
                .build(),
        );
        Self {
            agent,
            api_key: api_key.to_string(),
            base_url: config.base_url.clone(),
            model: config.model.clone(),
        }
    }

    fn call(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let body = ApiRequest {
            model: &self.model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let mut response = self
            .agent
            .post(&self.base_url)
            .header("Authorization", &format!("Bearer {}", self.api_key))
            .send_json(&body)?;

        let status = response.status().as_u16();
        if status != 200 {
            let body = response.body_mut().read_to_string().unwrap_or_default();
            return Err(LlmError::Status { code: status, body });
        }

        let parsed: ApiResponse = response
            .body_mut()
            .read_json()
            .map_err(|e| LlmError::Decode(e.to_string()))?;

        if let Some(err) = parsed.error {
            return Err(LlmError::Decode(err.message));
        }

        parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .map(|c| c.message.content.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or(LlmError::Empty)
    }
}

impl Completer for OpenAiClient {
    /// One retry on transport errors, 429 and 5xx
    fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        match self.call(request) {
            Err(e) if e.is_retryable() => {
                warn!(error = %e, model = %self.model, "LLM call failed, retrying once");
                self.call(request)
            }
            other => {
                debug!(model = %self.model, ok = other.is_ok(), "LLM call finished");
                other
            }
        }
    }
}

/// Build the completer for this configuration
pub fn completer_from_config(config: &crate::config::Config) -> Box<dyn Completer> {
    match config.llm.api_key.as_deref() {
        Some(key) if config.llm_enabled() => Box::new(OpenAiClient::new(&config.llm, key.trim())),
        _ => Box::new(DisabledCompleter),
    }
}
