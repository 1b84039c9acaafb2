//! Integration tests for the move service over real HTTP
//!
//! A live `tiny_http` server on an ephemeral loopback port, driven through
//! the same client agents use.

use arenabox::config::agent::AgentConfig;
use arenabox::server::backend::{Backends, GenerationBackend, Message};
use arenabox::server::client::MoveClient;
use arenabox::server::interactions::{read_interactions, InteractionLog};
use arenabox::server::registry::Credentials;
use arenabox::server::{spawn, MoveService, ServerHandle};
use arenabox::turn::BarrierConfig;
use arenabox::{Provider, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const KEY_A: &str = "agent_key_a";
const KEY_B: &str = "agent_key_b";

/// Answers with the last message, prefixed.
struct Echo;

impl GenerationBackend for Echo {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    fn generate(&self, _model: &str, messages: &[Message]) -> Result<Option<String>> {
        Ok(messages.last().map(|m| format!("echo: {}", m.content)))
    }
}

fn credentials() -> Credentials {
    let config = |name: &str| AgentConfig {
        name: name.into(),
        agent_path: PathBuf::from("agent.py"),
        provider: Some(Provider::Anthropic),
        model: Some("test-model".into()),
        team: None,
        interpreter: None,
    };
    [(KEY_A.to_string(), config("alpha")), (KEY_B.to_string(), config("beta"))]
        .into_iter()
        .collect()
}

fn start(barrier: BarrierConfig, interactions: InteractionLog) -> (ServerHandle, Arc<MoveService>) {
    let mut backends = Backends::new();
    backends.insert(Box::new(Echo));
    let service = Arc::new(MoveService::new(&credentials(), backends, barrier, interactions));
    let handle = spawn("127.0.0.1:0", Arc::clone(&service)).unwrap();
    (handle, service)
}

fn client(handle: &ServerHandle, key: Option<&str>) -> MoveClient {
    MoveClient::new(handle.url(), key.map(String::from), Duration::from_secs(10)).unwrap()
}

fn hello() -> Vec<Message> {
    vec![Message::new("system", "play"), Message::new("user", "hi")]
}

#[test]
fn test_authenticated_generate_round_trip() {
    let log_path = std::env::temp_dir().join(format!("arenabox-interactions-{}.jsonl", uuid::Uuid::new_v4()));
    let (handle, _service) = start(BarrierConfig::default(), InteractionLog::open(&log_path).unwrap());

    let text = client(&handle, Some(KEY_A)).generate(&hello()).unwrap();
    assert_eq!(text.as_deref(), Some("echo: hi"));

    let recorded = read_interactions(&log_path).unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].agent_name, "alpha");
    assert_eq!(recorded[0].api_key, KEY_A);
    assert_eq!(recorded[0].messages, hello());
    assert_eq!(recorded[0].response.as_deref(), Some("echo: hi"));

    let _ = std::fs::remove_file(log_path);
}

#[test]
fn test_status_codes() {
    let (handle, _service) = start(BarrierConfig::default(), InteractionLog::disabled());

    let err = client(&handle, None).generate(&hello()).unwrap_err();
    assert!(err.to_string().contains("status=401"), "{}", err);

    let err = client(&handle, Some("agent_key_unknown")).generate(&hello()).unwrap_err();
    assert!(err.to_string().contains("status=401"), "{}", err);

    let err = client(&handle, Some(KEY_A)).generate(&[]).unwrap_err();
    assert!(err.to_string().contains("status=400"), "{}", err);

    let http = reqwest::blocking::Client::new();
    let response = http
        .post(format!("{}/generate", handle.url()))
        .header("X-Agent-API-Key", KEY_A)
        .body("{not json")
        .send()
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    let body: serde_json::Value = response.json().unwrap();
    assert!(body["error"].is_string());

    let response = http.get(format!("{}/nowhere", handle.url())).send().unwrap();
    assert_eq!(response.status().as_u16(), 404);

    assert_eq!(client(&handle, None).turn_count().unwrap(), 0);
}

#[test]
fn test_barrier_timeout_is_a_408_and_rolls_back() {
    let barrier = BarrierConfig {
        enabled: true,
        timeout: Duration::from_millis(200),
        poll_interval: Duration::from_millis(5),
    };
    let (handle, service) = start(barrier, InteractionLog::disabled());

    let err = client(&handle, Some(KEY_A)).generate(&hello()).unwrap_err();
    assert!(err.to_string().contains("status=408"), "{}", err);
    assert_eq!(service.barrier().snapshot().completed(KEY_A), Some(0));
    assert_eq!(client(&handle, None).turn_count().unwrap(), 0);
}

#[test]
fn test_simultaneous_moves_advance_the_turn() {
    let barrier = BarrierConfig {
        enabled: true,
        timeout: Duration::from_secs(10),
        poll_interval: Duration::from_millis(5),
    };
    let (handle, _service) = start(barrier, InteractionLog::disabled());

    let url = handle.url();
    let other = std::thread::spawn(move || {
        MoveClient::new(url, Some(KEY_B.to_string()), Duration::from_secs(10))
            .unwrap()
            .generate(&hello())
    });
    let mine = client(&handle, Some(KEY_A)).generate(&hello()).unwrap();
    let theirs = other.join().unwrap().unwrap();

    assert_eq!(mine.as_deref(), Some("echo: hi"));
    assert_eq!(theirs.as_deref(), Some("echo: hi"));
    assert_eq!(client(&handle, None).turn_count().unwrap(), 1);
}
