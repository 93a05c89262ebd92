//! Shared fixtures: an in-process adapter and a connector that hands it out

#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use mcp_hub::config::{AdapterSpec, HttpConfig, ServerConnectionConfig};
use mcp_hub::core::{
    AdapterConnector, AdapterRequest, AdapterResponse, HubServer, RequestId, ServerStatus,
    StreamChunk,
};
use mcp_hub::transport::{
    AdapterEvent, AdapterHealth, AdapterStatus, ChunkStream, Protocol, ProtocolAdapter,
};
use mcp_hub::{HubError, HubResult};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Adapter that answers `tools/list` and `tools/call` from memory
pub struct FakeAdapter {
    pub server_id: String,
    protocol: Protocol,
    status: Mutex<AdapterStatus>,
    tools: Vec<Value>,
    fail_start: AtomicBool,
    start_delay: Option<Duration>,
    pub fail_calls: AtomicBool,
    /// `tools/call` never answers while set
    pub hang_calls: AtomicBool,
    pub healthy: AtomicBool,
    pub starts: AtomicU32,
    pub stops: AtomicU32,
    pub requests: Mutex<Vec<AdapterRequest>>,
    events: broadcast::Sender<AdapterEvent>,
}

impl FakeAdapter {
    pub fn new(server_id: &str, protocol: Protocol, tools: Vec<Value>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            server_id: server_id.to_string(),
            protocol,
            status: Mutex::new(AdapterStatus::Disconnected),
            tools,
            fail_start: AtomicBool::new(false),
            start_delay: None,
            fail_calls: AtomicBool::new(false),
            hang_calls: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            starts: AtomicU32::new(0),
            stops: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
            events,
        }
    }

    pub fn set_status(&self, status: AdapterStatus) {
        *self.status.lock() = status;
    }

    pub fn calls(&self) -> Vec<AdapterRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.method == "tools/call")
            .cloned()
            .collect()
    }

    fn respond(&self, request: &AdapterRequest) -> AdapterResponse {
        let id = request.id.clone().unwrap_or(RequestId::Number(0));
        match request.method.as_str() {
            "tools/list" => AdapterResponse::success(id, json!({ "tools": self.tools })),
            "tools/call" => {
                let params = request.params.clone().unwrap_or(Value::Null);
                AdapterResponse::success(
                    id,
                    json!({
                        "server": self.server_id,
                        "tool": params["name"],
                        "arguments": params["arguments"],
                    }),
                )
            }
            other => AdapterResponse::error(id, -32601, format!("method not found: {}", other)),
        }
    }
}

#[async_trait]
impl ProtocolAdapter for FakeAdapter {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn status(&self) -> AdapterStatus {
        *self.status.lock()
    }

    async fn start(&self) -> HubResult<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.set_status(AdapterStatus::Initializing);
        if let Some(delay) = self.start_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_start.load(Ordering::SeqCst) {
            self.set_status(AdapterStatus::Error);
            return Err(HubError::Connection(format!(
                "{} refused to start",
                self.server_id
            )));
        }
        self.set_status(AdapterStatus::Connected);
        Ok(())
    }

    async fn stop(&self) -> HubResult<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.set_status(AdapterStatus::Disconnected);
        Ok(())
    }

    async fn send_request(&self, request: AdapterRequest) -> HubResult<AdapterResponse> {
        self.requests.lock().push(request.clone());
        if self.status() != AdapterStatus::Connected {
            return Err(HubError::Connection(format!("{} is not connected", self.server_id)));
        }
        if self.fail_calls.load(Ordering::SeqCst) {
            return Err(HubError::Connection(format!("{} dropped the call", self.server_id)));
        }
        if request.method == "tools/call" && self.hang_calls.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(self.respond(&request))
    }

    async fn stream_request(&self, request: AdapterRequest) -> HubResult<ChunkStream> {
        let data = self.send_request(request).await?.into_result()?;
        Ok(stream::once(async move { Ok(StreamChunk { data, done: true }) }).boxed())
    }

    async fn health(&self) -> AdapterHealth {
        if self.status() == AdapterStatus::Connected && self.healthy.load(Ordering::SeqCst) {
            AdapterHealth::healthy()
        } else {
            AdapterHealth::unhealthy(format!("{} is unhealthy", self.server_id))
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }
}

/// Connector that builds `FakeAdapter`s and remembers them for inspection
#[derive(Default)]
pub struct FakeConnector {
    tools: Mutex<HashMap<String, Vec<Value>>>,
    failing: Mutex<HashSet<String>>,
    start_delay: Mutex<Option<Duration>>,
    created: Mutex<Vec<Arc<FakeAdapter>>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_tools(&self, server_id: &str, names: &[&str]) {
        self.tools
            .lock()
            .insert(server_id.to_string(), names.iter().map(|n| tool(n)).collect());
    }

    pub fn fail_start(&self, server_id: &str) {
        self.failing.lock().insert(server_id.to_string());
    }

    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock() = Some(delay);
    }

    /// Most recently built adapter for the server
    pub fn latest(&self, server_id: &str) -> Option<Arc<FakeAdapter>> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|a| a.server_id == server_id)
            .cloned()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }
}

impl AdapterConnector for FakeConnector {
    fn connect(&self, server_id: &str, spec: &AdapterSpec) -> HubResult<Arc<dyn ProtocolAdapter>> {
        let tools = self.tools.lock().get(server_id).cloned().unwrap_or_default();
        let mut adapter = FakeAdapter::new(server_id, spec.protocol(), tools);
        adapter.start_delay = *self.start_delay.lock();
        if self.failing.lock().contains(server_id) {
            adapter.fail_start.store(true, Ordering::SeqCst);
        }
        let adapter = Arc::new(adapter);
        self.created.lock().push(adapter.clone());
        Ok(adapter)
    }
}

pub fn tool(name: &str) -> Value {
    json!({
        "name": name,
        "description": format!("{} tool", name),
        "inputSchema": {
            "type": "object",
            "properties": { "input": { "type": "string", "description": "input value" } },
            "required": ["input"]
        }
    })
}

pub fn http_connection(server_id: &str) -> ServerConnectionConfig {
    ServerConnectionConfig::http(HttpConfig {
        base_url: format!("http://{}.invalid", server_id),
        ..Default::default()
    })
}

pub fn server(id: &str, name: &str, user_id: &str) -> HubServer {
    HubServer {
        id: id.to_string(),
        name: name.to_string(),
        user_id: user_id.to_string(),
        namespace: None,
        status: ServerStatus::Active,
        connection: http_connection(id),
    }
}

pub fn inactive(mut server: HubServer) -> HubServer {
    server.status = ServerStatus::Inactive;
    server
}

pub fn namespaced(mut server: HubServer, namespace: &str) -> HubServer {
    server.namespace = Some(namespace.to_string());
    server
}

/// Poll `check` until it holds or `within` elapses
pub async fn eventually<F: Fn() -> bool>(within: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
