//! Blocking client for the move-generation service, used by agent programs
//! written in Rust and by the controller's turn-limit check.

use crate::config::types::{ArenaError, Result, API_KEY_HEADER};
use crate::server::backend::Message;
use reqwest::blocking::Client as HttpClient;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

pub const SERVER_URL_ENV: &str = "ARENA_SERVER_URL";
pub const API_KEY_ENV: &str = "AGENT_API_KEY";

#[derive(Deserialize)]
struct GenerateReply {
    text: Option<String>,
}

#[derive(Deserialize)]
struct TurnCountReply {
    turn_count: u64,
}

#[derive(Deserialize)]
struct ErrorReply {
    error: String,
}

pub struct MoveClient {
    base_url: String,
    api_key: Option<String>,
    client: HttpClient,
}

impl MoveClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ArenaError::Service(format!("http client: {}", e)))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    /// Build from `ARENA_SERVER_URL` and `AGENT_API_KEY`.
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var(SERVER_URL_ENV)
            .map_err(|_| ArenaError::Config(format!("{} is not set", SERVER_URL_ENV)))?;
        let api_key = std::env::var(API_KEY_ENV)
            .map_err(|_| ArenaError::Config(format!("{} is not set", API_KEY_ENV)))?;
        // Generation waits on the provider and possibly the turn barrier.
        Self::new(base_url, Some(api_key), Duration::from_secs(600))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Ask for the next move. Non-2xx answers become `ArenaError::Service`
    /// carrying the status and the service's error text.
    pub fn generate(&self, messages: &[Message]) -> Result<Option<String>> {
        let mut request = self
            .client
            .post(format!("{}/generate", self.base_url))
            .json(&json!({ "messages": messages }));
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }
        let response = request
            .send()
            .map_err(|e| ArenaError::Service(format!("generate request failed: {}", e)))?;
        let status = response.status();
        if status != StatusCode::OK {
            let detail = response
                .json::<ErrorReply>()
                .map(|r| r.error)
                .unwrap_or_else(|_| "<no error body>".to_string());
            return Err(ArenaError::Service(format!(
                "generate failed: status={} error={}",
                status.as_u16(),
                detail
            )));
        }
        let reply: GenerateReply = response
            .json()
            .map_err(|e| ArenaError::Service(format!("generate reply: {}", e)))?;
        Ok(reply.text)
    }

    pub fn turn_count(&self) -> Result<u64> {
        let response = self
            .client
            .get(format!("{}/turn_count", self.base_url))
            .send()
            .map_err(|e| ArenaError::Service(format!("turn_count request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(ArenaError::Service(format!(
                "turn_count failed: status={}",
                response.status().as_u16()
            )));
        }
        let reply: TurnCountReply = response
            .json()
            .map_err(|e| ArenaError::Service(format!("turn_count reply: {}", e)))?;
        Ok(reply.turn_count)
    }
}
