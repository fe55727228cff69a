use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::env;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
    Mistral,
    Local,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "openai",
            LlmProvider::Anthropic => "anthropic",
            LlmProvider::Mistral => "mistral",
            LlmProvider::Local => "local",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "openai" => Some(LlmProvider::OpenAi),
            "anthropic" => Some(LlmProvider::Anthropic),
            "mistral" => Some(LlmProvider::Mistral),
            "local" => Some(LlmProvider::Local),
            _ => None,
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "gpt-4.1-mini",
            LlmProvider::Anthropic => "claude-3-5-sonnet",
            LlmProvider::Mistral => "mistral-small-latest",
            LlmProvider::Local => "local",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub system: Option<String>,
    pub user: String,
    /// Ask the provider for a single JSON object instead of free text.
    pub json_mode: bool,
}

impl LlmRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: Some(system.into()),
            user: user.into(),
            json_mode: false,
        }
    }

    pub fn json(mut self) -> Self {
        self.json_mode = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl LlmResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            prompt_tokens: 0,
            completion_tokens: 0,
        }
    }

    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

/// The language-model collaborator as seen by the triage pipeline.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, req: &LlmRequest) -> Result<LlmResponse>;
}

#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    provider: LlmProvider,
    model: String,
    config: ProviderConfig,
}

#[derive(Clone)]
enum ProviderConfig {
    OpenAiCompatible(OpenAiCompatibleConfig),
    Anthropic(AnthropicConfig),
    Local,
}

#[derive(Clone)]
struct OpenAiCompatibleConfig {
    api_key: String,
    base_url: String,
}

#[derive(Clone)]
struct AnthropicConfig {
    api_key: String,
    max_tokens: u32,
}

impl LlmClient {
    pub fn new(provider: LlmProvider, model: impl Into<String>) -> Result<Self> {
        let model = model.into();
        let http = Client::new();
        let config = match provider {
            LlmProvider::OpenAi => ProviderConfig::OpenAiCompatible(OpenAiCompatibleConfig {
                api_key: read_api_key("OPENAI_API_KEY")?,
                base_url: env::var("OPENAI_BASE_URL")
                    .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            }),
            LlmProvider::Mistral => ProviderConfig::OpenAiCompatible(OpenAiCompatibleConfig {
                api_key: read_api_key("MISTRAL_API_KEY")?,
                base_url: env::var("MISTRAL_BASE_URL")
                    .unwrap_or_else(|_| "https://api.mistral.ai/v1".to_string()),
            }),
            LlmProvider::Anthropic => ProviderConfig::Anthropic(AnthropicConfig {
                api_key: read_api_key("ANTHROPIC_API_KEY")?,
                max_tokens: env::var("ANTHROPIC_MAX_TOKENS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1024),
            }),
            LlmProvider::Local => ProviderConfig::Local,
        };
        Ok(Self {
            http,
            provider,
            model,
            config,
        })
    }

    pub fn provider(&self) -> LlmProvider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn chat(&self, req: &LlmRequest) -> Result<LlmResponse> {
        match &self.config {
            ProviderConfig::OpenAiCompatible(cfg) => self.chat_openai_compatible(cfg, req).await,
            ProviderConfig::Anthropic(cfg) => self.chat_anthropic(cfg, req).await,
            ProviderConfig::Local => Ok(chat_local(req)),
        }
    }

    async fn chat_openai_compatible(
        &self,
        cfg: &OpenAiCompatibleConfig,
        req: &LlmRequest,
    ) -> Result<LlmResponse> {
        let url = format!("{}/chat/completions", cfg.base_url.trim_end_matches('/'));
        let mut messages = Vec::new();
        if let Some(system) = &req.system {
            messages.push(json!({"role": "system", "content": system }));
        }
        messages.push(json!({"role": "user", "content": req.user }));
        let mut payload = json!({
            "model": self.model,
            "messages": messages,
        });
        if req.json_mode {
            payload["response_format"] = json!({ "type": "json_object" });
        }
        let provider = self.provider.as_str();
        let response = self
            .http
            .post(&url)
            .bearer_auth(&cfg.api_key)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("{provider} request failed"))?;
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(anyhow!("{provider} rate limited the request"));
        }
        let value = decode_body(provider, response).await?;
        let content = extract_chat_text(&value)
            .ok_or_else(|| anyhow!("missing text in {provider} response"))?;
        let usage: OpenAiUsage = value
            .get("usage")
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default();
        debug!(
            provider,
            model = %self.model,
            prompt_tokens = usage.prompt_tokens.unwrap_or(0),
            completion_tokens = usage.completion_tokens.unwrap_or(0),
            "chat completion finished"
        );
        Ok(LlmResponse {
            content,
            prompt_tokens: usage.prompt_tokens.unwrap_or(0),
            completion_tokens: usage.completion_tokens.unwrap_or(0),
        })
    }

    async fn chat_anthropic(&self, cfg: &AnthropicConfig, req: &LlmRequest) -> Result<LlmResponse> {
        let mut payload = json!({
            "model": self.model,
            "max_tokens": cfg.max_tokens,
            "messages": [ { "role": "user", "content": req.user } ],
        });
        let mut system = req.system.clone().unwrap_or_default();
        if req.json_mode {
            system.push_str("\nRespond with a single JSON object and nothing else.");
        }
        if !system.trim().is_empty() {
            payload["system"] = json!(system.trim());
        }
        let response = self
            .http
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &cfg.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&payload)
            .send()
            .await
            .with_context(|| "anthropic request failed")?
            .error_for_status()
            .context("anthropic returned an error")?
            .json::<AnthropicResponse>()
            .await
            .context("failed to decode anthropic response")?;
        let text = response
            .content
            .into_iter()
            .find_map(|part| part.text)
            .ok_or_else(|| anyhow!("missing text in Anthropic response"))?;
        let usage = response.usage.unwrap_or_default();
        Ok(LlmResponse {
            content: text,
            prompt_tokens: usage.input_tokens.unwrap_or(0),
            completion_tokens: usage.output_tokens.unwrap_or(0),
        })
    }
}

#[async_trait]
impl LanguageModel for LlmClient {
    async fn complete(&self, req: &LlmRequest) -> Result<LlmResponse> {
        self.chat(req).await
    }
}

/// Offline provider: JSON requests get an empty object (every stage then
/// falls back to its defaults), text requests get a trimmed echo.
fn chat_local(req: &LlmRequest) -> LlmResponse {
    if req.json_mode {
        return LlmResponse::text("{}");
    }
    LlmResponse::text(summarize_text(&req.user, 60))
}

fn summarize_text(text: &str, max_words: usize) -> String {
    if max_words == 0 {
        return String::new();
    }
    text.split_whitespace()
        .take(max_words)
        .collect::<Vec<&str>>()
        .join(" ")
}

async fn decode_body(provider: &str, response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(anyhow!(format!(
            "{provider} returned error (status {status}): {body}"
        )));
    }
    serde_json::from_str(&body).with_context(|| format!("failed to decode {provider} response"))
}

fn read_api_key(var: &str) -> Result<String> {
    let value = env::var(var).map_err(|_| anyhow!(format!("{var} is not set")))?;
    validate_api_key(var, &value)?;
    Ok(value)
}

fn validate_api_key(var: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!(format!("{var} is empty")));
    }
    if var.contains("OPENAI") && !value.starts_with("sk-") {
        return Err(anyhow!(format!(
            "{} must start with 'sk-' (see https://platform.openai.com/)",
            var
        )));
    }
    if var.contains("ANTHROPIC") && !value.starts_with("sk-ant-") {
        return Err(anyhow!(format!("{} must start with 'sk-ant-'", var)));
    }
    Ok(())
}

fn extract_chat_text(value: &Value) -> Option<String> {
    let choice = value.get("choices")?.as_array()?.first()?;
    if let Some(text) = choice.get("text").and_then(|t| t.as_str()) {
        return Some(text.to_string());
    }
    let content = choice.get("message")?.get("content")?;
    if let Some(text) = content.as_str() {
        return Some(text.to_string());
    }
    content.as_array()?.iter().find_map(|part| {
        part.get("text")
            .and_then(|t| t.as_str())
            .map(|t| t.to_string())
    })
}

/// Returns the outermost `{ ... }` span of a model reply, ignoring Markdown
/// fences or prose the model wrapped around it.
pub fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&raw[start..=end])
}

pub fn parse_json_reply<T: DeserializeOwned>(raw: &str) -> Result<T> {
    let object = extract_json_object(raw)
        .ok_or_else(|| anyhow!("model reply does not contain a JSON object"))?;
    serde_json::from_str(object).context("model reply is not valid JSON for this stage")
}

#[derive(Default, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
struct AnthropicContent {
    text: Option<String>,
}

#[derive(Default, Deserialize)]
struct AnthropicUsage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}
