//! Move-generation service
//!
//! A small HTTP service agents call for their next program. Each request is
//! authenticated by a per-agent credential, routed to the agent's provider
//! backend and, in simultaneous-turn mode, held at the turn barrier before the
//! answer goes back.
//!
//! Routes:
//! - `POST /generate` with `{"messages": [{"role", "content"}]}` -> `{"text"}`
//! - `GET /turn_count` -> `{"turn_count"}`

pub mod backend;
pub mod client;
pub mod interactions;
pub mod registry;

use crate::config::types::{ArenaError, Result, API_KEY_HEADER};
use crate::turn::{BarrierConfig, BarrierError, TurnBarrier};
use backend::{Backends, Message};
use interactions::InteractionLog;
use log::{debug, error, info, warn};
use registry::{AgentRegistry, Credentials};
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::Read;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tiny_http::{Header, Method, Request, Response, Server};

pub use client::MoveClient;

const ACCEPT_POLL: Duration = Duration::from_millis(200);

/// Status and JSON body of one answer.
#[derive(Clone, Debug, PartialEq)]
pub struct Reply {
    pub status: u16,
    pub body: Value,
}

impl Reply {
    fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": message.into() }),
        }
    }
}

#[derive(Deserialize)]
struct GenerateRequest {
    #[serde(default)]
    messages: Vec<Message>,
}

/// Shared request-handling state. Transport-free so it can be driven directly.
pub struct MoveService {
    registry: AgentRegistry,
    backends: Backends,
    barrier: TurnBarrier,
    interactions: InteractionLog,
}

impl MoveService {
    pub fn new(
        credentials: &Credentials,
        backends: Backends,
        barrier: BarrierConfig,
        interactions: InteractionLog,
    ) -> Self {
        let registry = AgentRegistry::from_credentials(credentials);
        let barrier = TurnBarrier::new(barrier, registry.keys().map(String::from).collect::<Vec<_>>());
        info!(
            "Move service ready: {} agents, simultaneous turns {}",
            registry.len(),
            if barrier.is_enabled() { "on" } else { "off" }
        );
        Self {
            registry,
            backends,
            barrier,
            interactions,
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn barrier(&self) -> &TurnBarrier {
        &self.barrier
    }

    pub fn handle(&self, method: &str, path: &str, api_key: Option<&str>, body: &[u8]) -> Reply {
        let path = path.split('?').next().unwrap_or(path);
        match (method, path) {
            ("POST", "/generate") => self.generate(api_key, body),
            ("GET", "/turn_count") => Reply::ok(json!({ "turn_count": self.barrier.turn_count() })),
            _ => Reply::error(404, format!("no route for {} {}", method, path)),
        }
    }

    fn generate(&self, api_key: Option<&str>, body: &[u8]) -> Reply {
        let Some(api_key) = api_key.filter(|k| !k.is_empty()) else {
            return Reply::error(401, "missing API key");
        };
        let Some(agent) = self.registry.lookup(api_key) else {
            warn!("Rejected request with unknown API key");
            return Reply::error(401, "invalid API key");
        };

        let request: GenerateRequest = match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(e) => return Reply::error(400, format!("invalid request body: {}", e)),
        };
        if request.messages.is_empty() {
            return Reply::error(400, "messages must not be empty");
        }

        let backend = match self.backends.get(agent.provider) {
            Ok(backend) => backend,
            Err(e) => {
                error!("Agent '{}': {}", agent.name, e);
                return Reply::error(500, e.to_string());
            }
        };
        debug!("Generating for '{}' with {}/{}", agent.name, agent.provider, agent.model);
        let text = match backend.generate(&agent.model, &request.messages) {
            Ok(text) => text,
            Err(e) => {
                error!("Generation failed for '{}': {}", agent.name, e);
                return Reply::error(500, e.to_string());
            }
        };
        self.interactions
            .record(&agent.name, api_key, &request.messages, text.as_deref());

        match self.barrier.complete_turn(api_key) {
            Ok(_) => Reply::ok(json!({ "text": text })),
            Err(e @ BarrierError::Timeout { .. }) => {
                warn!("Agent '{}': {}", agent.name, e);
                Reply::error(408, e.to_string())
            }
            Err(e) => Reply::error(500, e.to_string()),
        }
    }
}

/// Running HTTP front end for a `MoveService`.
pub struct ServerHandle {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Stop accepting and join the accept loop. In-flight handlers finish on
    /// their own threads.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Bind `addr` and serve on a background thread, one thread per request.
pub fn spawn(addr: &str, service: Arc<MoveService>) -> Result<ServerHandle> {
    let listener = TcpListener::bind(addr)?;
    let local = listener.local_addr()?;
    let server = Server::from_listener(listener, None)
        .map_err(|e| ArenaError::Service(format!("cannot serve on {}: {}", local, e)))?;
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);

    let thread = thread::Builder::new()
        .name("arenabox-serve".into())
        .spawn(move || accept_loop(server, service, move || !stop_flag.load(Ordering::SeqCst)))
        .map_err(|e| ArenaError::Service(format!("cannot start accept loop: {}", e)))?;

    info!("Move service listening on {}", local);
    Ok(ServerHandle {
        addr: local,
        stop,
        thread: Some(thread),
    })
}

/// Serve on the calling thread until `keep_running` returns false.
pub fn serve_until<F>(addr: &str, service: Arc<MoveService>, keep_running: F) -> Result<()>
where
    F: Fn() -> bool,
{
    let server = Server::http(addr)
        .map_err(|e| ArenaError::Service(format!("cannot serve on {}: {}", addr, e)))?;
    info!("Move service listening on {}", addr);
    accept_loop(server, service, keep_running);
    info!("Move service stopped");
    Ok(())
}

fn accept_loop<F>(server: Server, service: Arc<MoveService>, keep_running: F)
where
    F: Fn() -> bool,
{
    while keep_running() {
        match server.recv_timeout(ACCEPT_POLL) {
            Ok(Some(request)) => {
                let service = Arc::clone(&service);
                if let Err(e) = thread::Builder::new()
                    .name("arenabox-request".into())
                    .spawn(move || respond(&service, request))
                {
                    error!("Cannot spawn request handler: {}", e);
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!("Accept failed: {}", e);
                break;
            }
        }
    }
}

fn respond(service: &MoveService, mut request: Request) {
    let mut body = Vec::new();
    if let Err(e) = request.as_reader().read_to_end(&mut body) {
        warn!("Failed to read request body: {}", e);
    }
    let api_key = request
        .headers()
        .iter()
        .find(|h| h.field.equiv(API_KEY_HEADER))
        .map(|h| h.value.to_string());
    let method = match request.method() {
        Method::Get => "GET",
        Method::Post => "POST",
        _ => "OTHER",
    };
    let url = request.url().to_string();

    let reply = service.handle(method, &url, api_key.as_deref(), &body);
    debug!("{} {} -> {}", method, url, reply.status);

    let mut response = Response::from_string(reply.body.to_string()).with_status_code(reply.status);
    if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]) {
        response = response.with_header(header);
    }
    if let Err(e) = request.respond(response) {
        warn!("Failed to send response: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::agent::AgentConfig;
    use crate::config::types::Provider;
    use backend::GenerationBackend;
    use std::path::PathBuf;

    struct Echo;

    impl GenerationBackend for Echo {
        fn provider(&self) -> Provider {
            Provider::Openai
        }

        fn generate(&self, _model: &str, messages: &[Message]) -> Result<Option<String>> {
            match messages.last().map(|m| m.content.as_str()) {
                Some("fail") => Err(ArenaError::Backend("provider down".into())),
                Some("silent") => Ok(None),
                other => Ok(other.map(|s| format!("echo {}", s))),
            }
        }
    }

    fn service(barrier: BarrierConfig) -> MoveService {
        let mut creds = Credentials::new();
        for (key, name, provider) in [
            ("key-a", "alpha", Some(Provider::Openai)),
            ("key-g", "gem", Some(Provider::Gemini)),
            ("key-n", "noop", None),
        ] {
            creds.insert(
                key.into(),
                AgentConfig {
                    name: name.into(),
                    agent_path: PathBuf::from("a.py"),
                    provider,
                    model: Some("m".into()),
                    team: None,
                    interpreter: None,
                },
            );
        }
        let mut backends = Backends::new();
        backends.insert(Box::new(Echo));
        MoveService::new(&creds, backends, barrier, InteractionLog::disabled())
    }

    fn body(content: &str) -> Vec<u8> {
        json!({ "messages": [{ "role": "user", "content": content }] })
            .to_string()
            .into_bytes()
    }

    #[test]
    fn maps_failures_to_status_codes() {
        let svc = service(BarrierConfig::default());
        assert_eq!(svc.handle("POST", "/generate", None, &body("x")).status, 401);
        assert_eq!(svc.handle("POST", "/generate", Some("nope"), &body("x")).status, 401);
        // No provider means no registration.
        assert_eq!(svc.handle("POST", "/generate", Some("key-n"), &body("x")).status, 401);
        assert_eq!(
            svc.handle("POST", "/generate", Some("key-a"), br#"{"messages": []}"#).status,
            400
        );
        assert_eq!(svc.handle("POST", "/generate", Some("key-a"), b"not json").status, 400);
        assert_eq!(svc.handle("POST", "/generate", Some("key-a"), &body("fail")).status, 500);
        // Gemini key is not configured.
        assert_eq!(svc.handle("POST", "/generate", Some("key-g"), &body("x")).status, 500);
        assert_eq!(svc.handle("GET", "/nowhere", None, b"").status, 404);
    }

    #[test]
    fn successful_generation_returns_text_or_null() {
        let svc = service(BarrierConfig::default());
        let reply = svc.handle("POST", "/generate", Some("key-a"), &body("hi"));
        assert_eq!(reply, Reply::ok(json!({ "text": "echo hi" })));
        let reply = svc.handle("POST", "/generate", Some("key-a"), &body("silent"));
        assert_eq!(reply.body, json!({ "text": null }));
        assert_eq!(
            svc.handle("GET", "/turn_count?x=1", None, b"").body,
            json!({ "turn_count": 0 })
        );
    }

    #[test]
    fn barrier_timeout_is_a_408() {
        let svc = service(BarrierConfig {
            enabled: true,
            timeout: Duration::from_millis(100),
            poll_interval: Duration::from_millis(5),
        });
        // "key-g" never moves, so "key-a" waits out the barrier.
        let reply = svc.handle("POST", "/generate", Some("key-a"), &body("hi"));
        assert_eq!(reply.status, 408);
        assert_eq!(svc.barrier().snapshot().completed("key-a"), Some(0));
    }
}
