//! LLM collaborator — the contract the engine calls through, plus an HTTP
//! client for Anthropic-style and OpenAI-compatible endpoints.
//!
//! The engine never retries. Any failure here becomes a failed block.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};

use crate::config::{LlmConfig, LlmProvider};

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM client is not configured: {0}")]
    NotConfigured(String),

    #[error("Could not reach LLM service: {0}")]
    Connection(String),

    #[error("LLM service rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("LLM service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Unexpected LLM response: {0}")]
    InvalidResponse(String),
}

/// One completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmRequest {
    pub prompt: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn invoke(&self, request: &LlmRequest) -> Result<String, LlmError>;
}

// ─── HTTP client ───────────────────────────────────────────────────────────

pub struct HttpLlmClient {
    client: reqwest::Client,
    config: LlmConfig,
}

impl HttpLlmClient {
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        if config.api_key.as_deref().unwrap_or_default().is_empty() {
            return Err(LlmError::NotConfigured(
                "no API key (set PROMPTFLOW_API_KEY or llm.api_key)".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LlmError::NotConfigured(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn api_key(&self) -> &str {
        self.config.api_key.as_deref().unwrap_or_default()
    }

    /// POST {base_url}/v1/messages
    async fn call_anthropic(&self, request: &LlmRequest) -> Result<String, LlmError> {
        let url = format!("{}/v1/messages", self.config.base_url().trim_end_matches('/'));
        let body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": [{ "role": "user", "content": request.prompt }]
        });

        tracing::info!("[LlmClient] Calling Anthropic API: {} (model: {})", url, request.model);

        let response = self
            .client
            .post(&url)
            .header("x-api-key", self.api_key())
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Connection(e.to_string()))?;

        let json = read_json(response).await?;
        anthropic_text(&json)
    }

    /// POST {base_url}/chat/completions
    async fn call_openai(&self, request: &LlmRequest) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.config.base_url().trim_end_matches('/'));
        let body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": [{ "role": "user", "content": request.prompt }]
        });

        tracing::info!("[LlmClient] Calling chat completions API: {} (model: {})", url, request.model);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key()))
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Connection(e.to_string()))?;

        let json = read_json(response).await?;
        openai_text(&json)
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn invoke(&self, request: &LlmRequest) -> Result<String, LlmError> {
        match self.config.provider {
            LlmProvider::Anthropic => self.call_anthropic(request).await,
            LlmProvider::Openai => self.call_openai(request).await,
        }
    }
}

async fn read_json(response: reqwest::Response) -> Result<Value, LlmError> {
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| LlmError::Connection(format!("Failed to read response body: {}", e)))?;
    parse_body(status, &text)
}

/// Map an HTTP status and body to parsed JSON or the matching error.
fn parse_body(status: StatusCode, text: &str) -> Result<Value, LlmError> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(LlmError::RateLimited(text.to_string()));
    }
    if !status.is_success() {
        return Err(LlmError::Status {
            status: status.as_u16(),
            body: text.to_string(),
        });
    }
    serde_json::from_str(text)
        .map_err(|e| LlmError::InvalidResponse(format!("Failed to parse response JSON: {}", e)))
}

/// Text blocks of a Messages API response, joined with newlines.
fn anthropic_text(json: &Value) -> Result<String, LlmError> {
    json.get("content")
        .and_then(|c| c.as_array())
        .and_then(|arr| {
            arr.iter()
                .filter(|block| block.get("type").and_then(|t| t.as_str()) == Some("text"))
                .filter_map(|block| block.get("text").and_then(|t| t.as_str()))
                .map(str::to_string)
                .reduce(|a, b| format!("{}\n{}", a, b))
        })
        .ok_or_else(|| LlmError::InvalidResponse("no text content in response".to_string()))
}

/// Content of the first choice of a chat completions response.
fn openai_text(json: &Value) -> Result<String, LlmError> {
    json.get("choices")
        .and_then(|c| c.as_array())
        .and_then(|arr| arr.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|msg| msg.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| LlmError::InvalidResponse("no message content in response".to_string()))
}

// ─── Offline client ────────────────────────────────────────────────────────

/// Answers every request with its own prompt. Used for dry runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoLlmClient;

#[async_trait]
impl LlmClient for EchoLlmClient {
    async fn invoke(&self, request: &LlmRequest) -> Result<String, LlmError> {
        Ok(request.prompt.clone())
    }
}
