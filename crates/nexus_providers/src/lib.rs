//! nexus_providers
//!
//! Provider transport + normalization only: one `call`/`stream` capability
//! per upstream LLM vendor. No policy, no redaction, no audit, no cost
//! accounting — those live in sibling crates and compose this one.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;

pub const PER_CALL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("credential missing for provider {0}")]
    CredentialMissing(String),
    #[error("provider error: status {status}, body: {body}")]
    ProviderError { status: u16, body: String },
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),
    #[error("decode error: {0}")]
    DecodeError(String),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct CallRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub system: Option<String>,
    pub temperature: f64,
    pub max_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct CallResponse {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

#[async_trait]
pub trait Provider: Send + Sync {
    async fn call(&self, req: &CallRequest) -> Result<CallResponse, ProviderError>;
    async fn stream(&self, req: &CallRequest) -> Result<ChunkStream, ProviderError>;
}

async fn with_timeout<T>(
    fut: impl std::future::Future<Output = Result<T, ProviderError>>,
) -> Result<T, ProviderError> {
    match tokio::time::timeout(PER_CALL_TIMEOUT, fut).await {
        Ok(inner) => inner,
        Err(_) => Err(ProviderError::Timeout(PER_CALL_TIMEOUT)),
    }
}

fn require_credential(provider: &str, api_key: &Option<String>) -> Result<&str, ProviderError> {
    match api_key {
        Some(k) if !k.is_empty() => Ok(k.as_str()),
        _ => Err(ProviderError::CredentialMissing(provider.to_string())),
    }
}

// ---------------------------------------------------------------------
// OpenAI-compatible adapter — shared by openai, groq, mistral, google.
// ---------------------------------------------------------------------

pub struct OpenAICompatProvider {
    name: String,
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAICompatProvider {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            name: name.into(),
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenAICompatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u64,
    temperature: f64,
    stream: bool,
}

fn build_messages(req: &CallRequest) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(req.messages.len() + 1);
    if let Some(system) = &req.system {
        messages.push(ChatMessage { role: "system".into(), content: system.clone() });
    }
    messages.extend(req.messages.iter().cloned());
    messages
}

#[async_trait]
impl Provider for OpenAICompatProvider {
    async fn call(&self, req: &CallRequest) -> Result<CallResponse, ProviderError> {
        let key = require_credential(&self.name, &self.api_key)?;
        with_timeout(async {
            let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
            let body = OpenAICompatRequest {
                model: &req.model,
                messages: build_messages(req),
                max_tokens: req.max_tokens,
                temperature: req.temperature,
                stream: false,
            };
            let resp = self.client.post(url).bearer_auth(key).json(&body).send().await?;
            if !resp.status().is_success() {
                let status = resp.status().as_u16();
                let body = resp.text().await.unwrap_or_default();
                return Err(ProviderError::ProviderError { status, body });
            }
            let raw: Value = resp.json().await?;
            decode_openai_compat(&raw)
        })
        .await
    }

    async fn stream(&self, req: &CallRequest) -> Result<ChunkStream, ProviderError> {
        let key = require_credential(&self.name, &self.api_key)?.to_string();
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let body = OpenAICompatRequest {
            model: &req.model,
            messages: build_messages(req),
            max_tokens: req.max_tokens,
            temperature: req.temperature,
            stream: true,
        };
        let client = self.client.clone();
        let resp = client.post(url).bearer_auth(&key).json(&body).send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::ProviderError { status, body });
        }

        let (tx, rx) = tokio::sync::mpsc::channel(32);
        tokio::spawn(async move {
            let mut byte_stream = resp.bytes_stream();
            let mut buf = String::new();
            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(Err(ProviderError::Transport(e))).await;
                        return;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buf.find("\n\n") {
                    let frame = buf[..pos].to_string();
                    buf = buf[pos + 2..].to_string();
                    for line in frame.lines() {
                        let Some(data) = line.strip_prefix("data: ") else { continue };
                        if data == "[DONE]" {
                            return;
                        }
                        let parsed: Result<Value, _> = serde_json::from_str(data);
                        match parsed {
                            Ok(v) => {
                                if let Some(fragment) = v
                                    .get("choices")
                                    .and_then(|c| c.get(0))
                                    .and_then(|c0| c0.get("delta"))
                                    .and_then(|d| d.get("content"))
                                    .and_then(|c| c.as_str())
                                {
                                    if tx.send(Ok(fragment.to_string())).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            Err(e) => {
                                let _ = tx.send(Err(ProviderError::DecodeError(e.to_string()))).await;
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

fn decode_openai_compat(raw: &Value) -> Result<CallResponse, ProviderError> {
    let text = raw
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c0| c0.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| ProviderError::DecodeError("missing choices[0].message.content".into()))?
        .to_string();

    let input_tokens = raw.get("usage").and_then(|u| u.get("prompt_tokens")).and_then(|v| v.as_u64()).unwrap_or(0);
    let output_tokens = raw.get("usage").and_then(|u| u.get("completion_tokens")).and_then(|v| v.as_u64()).unwrap_or(0);

    Ok(CallResponse { text, input_tokens, output_tokens })
}

// ---------------------------------------------------------------------
// Anthropic adapter — bespoke messages-API wire shape.
// ---------------------------------------------------------------------

pub struct AnthropicProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl AnthropicProvider {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self { client: reqwest::Client::new(), base_url: base_url.into(), api_key }
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u64,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
}

#[async_trait]
impl Provider for AnthropicProvider {
    async fn call(&self, req: &CallRequest) -> Result<CallResponse, ProviderError> {
        let key = require_credential("anthropic", &self.api_key)?;
        with_timeout(async {
            let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
            let body = AnthropicRequest {
                model: &req.model,
                messages: req.messages.clone(),
                max_tokens: req.max_tokens,
                temperature: req.temperature,
                system: req.system.as_deref(),
                stream: false,
            };
            let resp = self
                .client
                .post(url)
                .header("x-api-key", key)
                .header("anthropic-version", "2023-06-01")
                .json(&body)
                .send()
                .await?;
            if !resp.status().is_success() {
                let status = resp.status().as_u16();
                let body = resp.text().await.unwrap_or_default();
                return Err(ProviderError::ProviderError { status, body });
            }
            let raw: Value = resp.json().await?;

            let text = raw
                .get("content")
                .and_then(|c| c.get(0))
                .and_then(|c0| c0.get("text"))
                .and_then(|v| v.as_str())
                .ok_or_else(|| ProviderError::DecodeError("missing content[0].text".into()))?
                .to_string();

            let input_tokens = raw.get("usage").and_then(|u| u.get("input_tokens")).and_then(|v| v.as_u64()).unwrap_or(0);
            let output_tokens = raw.get("usage").and_then(|u| u.get("output_tokens")).and_then(|v| v.as_u64()).unwrap_or(0);

            Ok(CallResponse { text, input_tokens, output_tokens })
        })
        .await
    }

    async fn stream(&self, req: &CallRequest) -> Result<ChunkStream, ProviderError> {
        let key = require_credential("anthropic", &self.api_key)?.to_string();
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let body = AnthropicRequest {
            model: &req.model,
            messages: req.messages.clone(),
            max_tokens: req.max_tokens,
            temperature: req.temperature,
            system: req.system.as_deref(),
            stream: true,
        };
        let resp = self
            .client
            .post(url)
            .header("x-api-key", &key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::ProviderError { status, body });
        }

        let (tx, rx) = tokio::sync::mpsc::channel(32);
        tokio::spawn(async move {
            let mut byte_stream = resp.bytes_stream();
            let mut buf = String::new();
            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(Err(ProviderError::Transport(e))).await;
                        return;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buf.find("\n\n") {
                    let frame = buf[..pos].to_string();
                    buf = buf[pos + 2..].to_string();
                    for line in frame.lines() {
                        let Some(data) = line.strip_prefix("data: ") else { continue };
                        let parsed: Result<Value, _> = serde_json::from_str(data);
                        if let Ok(v) = parsed {
                            if v.get("type").and_then(|t| t.as_str()) == Some("content_block_delta") {
                                if let Some(fragment) = v
                                    .get("delta")
                                    .and_then(|d| d.get("text"))
                                    .and_then(|t| t.as_str())
                                {
                                    if tx.send(Ok(fragment.to_string())).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

// ---------------------------------------------------------------------
// DeepSeek adapter — bespoke response envelope.
// ---------------------------------------------------------------------

pub struct DeepSeekProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl DeepSeekProvider {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self { client: reqwest::Client::new(), base_url: base_url.into(), api_key }
    }
}

#[derive(Debug, Serialize)]
struct DeepSeekRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u64,
    temperature: f64,
}

#[derive(Debug, Deserialize)]
struct DeepSeekChoice {
    message: DeepSeekMessage,
}

#[derive(Debug, Deserialize)]
struct DeepSeekMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct DeepSeekUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct DeepSeekResponse {
    choices: Vec<DeepSeekChoice>,
    #[serde(default)]
    usage: Option<DeepSeekUsage>,
}

#[async_trait]
impl Provider for DeepSeekProvider {
    async fn call(&self, req: &CallRequest) -> Result<CallResponse, ProviderError> {
        let key = require_credential("deepseek", &self.api_key)?;
        with_timeout(async {
            let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
            let mut messages = Vec::with_capacity(req.messages.len() + 1);
            if let Some(system) = &req.system {
                messages.push(ChatMessage { role: "system".into(), content: system.clone() });
            }
            messages.extend(req.messages.iter().cloned());
            let body = DeepSeekRequest {
                model: &req.model,
                messages,
                max_tokens: req.max_tokens,
                temperature: req.temperature,
            };
            let resp = self.client.post(url).bearer_auth(key).json(&body).send().await?;
            if !resp.status().is_success() {
                let status = resp.status().as_u16();
                let body = resp.text().await.unwrap_or_default();
                return Err(ProviderError::ProviderError { status, body });
            }
            let decoded: DeepSeekResponse = resp
                .json()
                .await
                .map_err(|e| ProviderError::DecodeError(e.to_string()))?;
            let text = decoded
                .choices
                .into_iter()
                .next()
                .map(|c| c.message.content)
                .ok_or_else(|| ProviderError::DecodeError("empty choices".into()))?;
            let (input_tokens, output_tokens) = decoded
                .usage
                .map(|u| (u.prompt_tokens, u.completion_tokens))
                .unwrap_or((0, 0));

            Ok(CallResponse { text, input_tokens, output_tokens })
        })
        .await
    }

    async fn stream(&self, req: &CallRequest) -> Result<ChunkStream, ProviderError> {
        // DeepSeek has no bespoke streaming envelope distinct from a single
        // non-streamed call for our purposes: emit the full response as one
        // fragment followed by stream end.
        let resp = self.call(req).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        tokio::spawn(async move {
            let _ = tx.send(Ok(resp.text)).await;
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

// ---------------------------------------------------------------------
// Credentials + registry
// ---------------------------------------------------------------------

/// Read-only after startup: holds one credential slot per provider tag.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    keys: HashMap<String, String>,
}

impl CredentialStore {
    pub fn new(keys: HashMap<String, String>) -> Self {
        Self { keys }
    }

    /// Build from `{PROVIDER}_API_KEY` environment variables for the given
    /// provider tags.
    pub fn from_env(providers: &[&str]) -> Self {
        let mut keys = HashMap::new();
        for provider in providers {
            let var = format!("{}_API_KEY", provider.to_uppercase());
            if let Ok(value) = std::env::var(&var) {
                if !value.is_empty() {
                    keys.insert(provider.to_string(), value);
                }
            }
        }
        Self { keys }
    }

    pub fn get(&self, provider: &str) -> Option<String> {
        self.keys.get(provider).cloned()
    }

    pub fn has(&self, provider: &str) -> bool {
        self.keys.get(provider).is_some_and(|k| !k.is_empty())
    }
}

pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self { providers: HashMap::new() }
    }

    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(name.into(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    /// Build the standard registry over the six spec-mandated providers,
    /// wiring credentials from `creds`.
    pub fn standard(creds: &CredentialStore) -> Self {
        let mut registry = Self::new();
        registry.register(
            "openai",
            Arc::new(OpenAICompatProvider::new("openai", "https://api.openai.com", creds.get("openai"))),
        );
        registry.register(
            "groq",
            Arc::new(OpenAICompatProvider::new("groq", "https://api.groq.com/openai", creds.get("groq"))),
        );
        registry.register(
            "mistral",
            Arc::new(OpenAICompatProvider::new("mistral", "https://api.mistral.ai", creds.get("mistral"))),
        );
        registry.register(
            "google",
            Arc::new(OpenAICompatProvider::new(
                "google",
                "https://generativelanguage.googleapis.com/v1beta/openai",
                creds.get("google"),
            )),
        );
        registry.register(
            "anthropic",
            Arc::new(AnthropicProvider::new("https://api.anthropic.com", creds.get("anthropic"))),
        );
        registry.register(
            "deepseek",
            Arc::new(DeepSeekProvider::new("https://api.deepseek.com", creds.get("deepseek"))),
        );
        registry
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
