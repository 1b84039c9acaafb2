//! Text-generation backends.
//!
//! One `GenerationBackend` per provider, chosen by the provider named in the
//! agent's configuration. HTTP goes through `JsonTransport` so request shapes
//! can be checked without a network.

use crate::config::types::{ArenaError, Provider, Result};
use log::{debug, warn};
use reqwest::blocking::Client as HttpClient;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const ANTHROPIC_URL: &str = "https://api.anthropic.com/v1/messages";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const ANTHROPIC_MAX_TOKENS: u32 = 8192;
pub const OPENAI_URL: &str = "https://api.openai.com/v1";
pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1";
pub const HYPERBOLIC_URL: &str = "https://api.hyperbolic.xyz/v1";
pub const FIREWORKS_URL: &str = "https://api.fireworks.ai/inference/v1";
pub const GEMINI_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// One chat turn as sent by an agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    fn is_system(&self) -> bool {
        self.role == "system"
    }
}

pub trait GenerationBackend: Send + Sync {
    fn provider(&self) -> Provider;

    /// Produce the next program. `Ok(None)` when the provider answered
    /// without any text.
    fn generate(&self, model: &str, messages: &[Message]) -> Result<Option<String>>;
}

/// POST a JSON body, return the JSON response.
pub trait JsonTransport: Send + Sync {
    fn post_json(&self, url: &str, headers: &[(&str, String)], body: &Value) -> Result<Value>;
}

pub struct HttpTransport {
    client: HttpClient,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let client = HttpClient::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ArenaError::Backend(format!("http client: {}", e)))?;
        Ok(Self { client })
    }
}

impl JsonTransport for HttpTransport {
    fn post_json(&self, url: &str, headers: &[(&str, String)], body: &Value) -> Result<Value> {
        let mut builder = self.client.post(url);
        for (name, value) in headers {
            builder = builder.header(*name, value);
        }
        let response = builder
            .json(body)
            .send()
            .map_err(|e| ArenaError::Backend(format!("POST {} transport error: {}", redact(url), e)))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response
                .text()
                .map(|t| t.chars().take(512).collect::<String>())
                .unwrap_or_else(|_| "<response body unavailable>".to_string());
            return Err(ArenaError::Backend(format!(
                "POST {} failed: status={} body={}",
                redact(url),
                status.as_u16(),
                detail
            )));
        }
        response
            .json::<Value>()
            .map_err(|e| ArenaError::Backend(format!("POST {} returned invalid JSON: {}", redact(url), e)))
    }
}

/// Keep query-string keys out of logs and errors.
fn redact(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

pub struct AnthropicBackend {
    api_key: String,
    transport: Arc<dyn JsonTransport>,
}

impl GenerationBackend for AnthropicBackend {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    fn generate(&self, model: &str, messages: &[Message]) -> Result<Option<String>> {
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.is_system())
            .map(|m| m.content.as_str())
            .collect();
        let turns: Vec<&Message> = messages.iter().filter(|m| !m.is_system()).collect();

        let mut body = json!({
            "model": model,
            "max_tokens": ANTHROPIC_MAX_TOKENS,
            "messages": turns,
        });
        if !system.is_empty() {
            body["system"] = json!(system.join("\n\n"));
        }

        let headers = [
            ("x-api-key", self.api_key.clone()),
            ("anthropic-version", ANTHROPIC_VERSION.to_string()),
        ];
        let response = self.transport.post_json(ANTHROPIC_URL, &headers, &body)?;
        let text: Vec<&str> = response["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b["type"] == "text")
                    .filter_map(|b| b["text"].as_str())
                    .collect()
            })
            .unwrap_or_default();
        Ok(non_empty(text.concat()))
    }
}

/// Chat-completions API shared by OpenAI and its compatible hosts.
pub struct OpenAiCompatibleBackend {
    provider: Provider,
    base_url: &'static str,
    api_key: String,
    transport: Arc<dyn JsonTransport>,
}

impl GenerationBackend for OpenAiCompatibleBackend {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn generate(&self, model: &str, messages: &[Message]) -> Result<Option<String>> {
        let mut body = json!({
            "model": model,
            "messages": messages,
        });
        if self.provider == Provider::Openai {
            body["reasoning_effort"] = json!("high");
        }
        let url = format!("{}/chat/completions", self.base_url);
        let headers = [("Authorization", format!("Bearer {}", self.api_key))];
        let response = self.transport.post_json(&url, &headers, &body)?;
        let content = response["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default();
        Ok(non_empty(content.to_string()))
    }
}

pub struct GeminiBackend {
    api_key: String,
    transport: Arc<dyn JsonTransport>,
}

impl GenerationBackend for GeminiBackend {
    fn provider(&self) -> Provider {
        Provider::Gemini
    }

    fn generate(&self, model: &str, messages: &[Message]) -> Result<Option<String>> {
        let system: Vec<Value> = messages
            .iter()
            .filter(|m| m.is_system())
            .map(|m| json!({ "text": m.content }))
            .collect();
        let contents: Vec<Value> = messages
            .iter()
            .filter(|m| !m.is_system())
            .map(|m| {
                let role = if m.role == "assistant" { "model" } else { "user" };
                json!({ "role": role, "parts": [{ "text": m.content }] })
            })
            .collect();

        let mut body = json!({ "contents": contents });
        if !system.is_empty() {
            body["systemInstruction"] = json!({ "parts": system });
        }

        let url = format!("{}/{}:generateContent?key={}", GEMINI_URL, model, self.api_key);
        let response = self.transport.post_json(&url, &[], &body)?;
        let text: Vec<&str> = response["candidates"][0]["content"]["parts"]
            .as_array()
            .map(|parts| parts.iter().filter_map(|p| p["text"].as_str()).collect())
            .unwrap_or_default();
        Ok(non_empty(text.concat()))
    }
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Model used when an agent config names a provider but no model.
pub fn default_model(provider: Provider) -> &'static str {
    match provider {
        Provider::Anthropic => "claude-3-5-sonnet-latest",
        Provider::Openai => "gpt-4o",
        Provider::Openrouter => "openai/gpt-4o",
        Provider::Hyperbolic => "meta-llama/Llama-3.3-70B-Instruct",
        Provider::Fireworks => "accounts/fireworks/models/llama-v3p1-70b-instruct",
        Provider::Gemini => "gemini-1.5-pro",
    }
}

/// Select the backend implementation for a provider.
pub fn backend_for(
    provider: Provider,
    api_key: String,
    transport: Arc<dyn JsonTransport>,
) -> Box<dyn GenerationBackend> {
    match provider {
        Provider::Anthropic => Box::new(AnthropicBackend { api_key, transport }),
        Provider::Gemini => Box::new(GeminiBackend { api_key, transport }),
        Provider::Openai | Provider::Openrouter | Provider::Hyperbolic | Provider::Fireworks => {
            let base_url = match provider {
                Provider::Openrouter => OPENROUTER_URL,
                Provider::Hyperbolic => HYPERBOLIC_URL,
                Provider::Fireworks => FIREWORKS_URL,
                _ => OPENAI_URL,
            };
            Box::new(OpenAiCompatibleBackend {
                provider,
                base_url,
                api_key,
                transport,
            })
        }
    }
}

/// The backends a service instance can reach, keyed by provider.
#[derive(Default)]
pub struct Backends {
    backends: HashMap<Provider, Box<dyn GenerationBackend>>,
}

impl Backends {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a backend for every wanted provider whose key is in the environment.
    pub fn from_env<I>(providers: I) -> Result<Self>
    where
        I: IntoIterator<Item = Provider>,
    {
        let transport: Arc<dyn JsonTransport> = Arc::new(HttpTransport::new()?);
        let mut backends = Self::new();
        for provider in providers {
            if backends.backends.contains_key(&provider) {
                continue;
            }
            match std::env::var(provider.key_env_var()) {
                Ok(key) if !key.trim().is_empty() => {
                    debug!("Backend ready for {}", provider);
                    backends.insert(backend_for(provider, key, Arc::clone(&transport)));
                }
                _ => warn!(
                    "{} is not set; requests for {} agents will fail",
                    provider.key_env_var(),
                    provider
                ),
            }
        }
        Ok(backends)
    }

    pub fn insert(&mut self, backend: Box<dyn GenerationBackend>) {
        self.backends.insert(backend.provider(), backend);
    }

    pub fn get(&self, provider: Provider) -> Result<&dyn GenerationBackend> {
        self.backends
            .get(&provider)
            .map(|b| b.as_ref())
            .ok_or_else(|| ArenaError::Backend(format!("no backend configured for {}", provider)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records the last request and replies with a canned body.
    struct CannedTransport {
        reply: Value,
        seen: Mutex<Vec<(String, Vec<(String, String)>, Value)>>,
    }

    impl CannedTransport {
        fn new(reply: Value) -> Arc<Self> {
            Arc::new(Self {
                reply,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl JsonTransport for CannedTransport {
        fn post_json(&self, url: &str, headers: &[(&str, String)], body: &Value) -> Result<Value> {
            self.seen.lock().unwrap().push((
                url.to_string(),
                headers
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
                body.clone(),
            ));
            Ok(self.reply.clone())
        }
    }

    fn conversation() -> Vec<Message> {
        vec![
            Message::new("system", "You are an agent."),
            Message::new("user", "Your move."),
        ]
    }

    #[test]
    fn anthropic_moves_system_prompt_out_of_messages() {
        let transport = CannedTransport::new(json!({
            "content": [{"type": "text", "text": "print(1)"}, {"type": "tool_use"}]
        }));
        let backend = backend_for(Provider::Anthropic, "k".into(), transport.clone());
        let text = backend.generate("claude", &conversation()).unwrap();
        assert_eq!(text.as_deref(), Some("print(1)"));

        let seen = transport.seen.lock().unwrap();
        let (url, headers, body) = &seen[0];
        assert_eq!(url, ANTHROPIC_URL);
        assert!(headers.contains(&("x-api-key".to_string(), "k".to_string())));
        assert_eq!(body["system"], "You are an agent.");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["max_tokens"], ANTHROPIC_MAX_TOKENS);
    }

    #[test]
    fn openai_compatible_hosts_share_the_chat_shape() {
        let transport = CannedTransport::new(json!({
            "choices": [{"message": {"content": "import os"}}]
        }));
        let openai = backend_for(Provider::Openai, "k".into(), transport.clone());
        assert_eq!(
            openai.generate("gpt", &conversation()).unwrap().as_deref(),
            Some("import os")
        );
        let fireworks = backend_for(Provider::Fireworks, "k".into(), transport.clone());
        fireworks.generate("llama", &conversation()).unwrap();

        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[0].0, "https://api.openai.com/v1/chat/completions");
        assert_eq!(seen[0].2["reasoning_effort"], "high");
        assert_eq!(seen[1].0, "https://api.fireworks.ai/inference/v1/chat/completions");
        assert!(seen[1].2.get("reasoning_effort").is_none());
    }

    #[test]
    fn gemini_maps_roles_and_reports_empty_answers_as_none() {
        let transport = CannedTransport::new(json!({ "candidates": [] }));
        let backend = backend_for(Provider::Gemini, "secret".into(), transport.clone());
        let mut messages = conversation();
        messages.push(Message::new("assistant", "ok"));
        assert_eq!(backend.generate("gemini-pro", &messages).unwrap(), None);

        let seen = transport.seen.lock().unwrap();
        let body = &seen[0].2;
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "You are an agent.");
        assert_eq!(redact(&seen[0].0), format!("{}/gemini-pro:generateContent", GEMINI_URL));
    }

    #[test]
    fn missing_backend_is_an_error() {
        let backends = Backends::new();
        assert!(backends.get(Provider::Openrouter).is_err());
    }
}
