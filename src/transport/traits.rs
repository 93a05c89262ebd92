use crate::core::protocol::{AdapterRequest, AdapterResponse, StreamChunk};
use crate::utils::errors::HubResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::sync::broadcast;

/// Lazy, finite sequence of chunks produced by `stream_request`
pub type ChunkStream = BoxStream<'static, HubResult<StreamChunk>>;

/// Transport protocol spoken by an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Stdio,
    Stream,
    Http,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Stdio => write!(f, "stdio"),
            Protocol::Stream => write!(f, "stream"),
            Protocol::Http => write!(f, "http"),
        }
    }
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdapterStatus {
    Initializing,
    Connected,
    Disconnected,
    Reconnecting,
    Error,
}

impl fmt::Display for AdapterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterStatus::Initializing => write!(f, "initializing"),
            AdapterStatus::Connected => write!(f, "connected"),
            AdapterStatus::Disconnected => write!(f, "disconnected"),
            AdapterStatus::Reconnecting => write!(f, "reconnecting"),
            AdapterStatus::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterHealth {
    pub status: HealthStatus,
    pub last_check: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AdapterHealth {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            last_check: Utc::now(),
            error: None,
        }
    }

    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            last_check: Utc::now(),
            error: Some(error.into()),
        }
    }

    pub fn unknown(reason: Option<String>) -> Self {
        Self {
            status: HealthStatus::Unknown,
            last_check: Utc::now(),
            error: reason,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Out-of-band happenings an adapter reports to its subscribers
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    /// Inbound message that matched no pending request
    Notification(Value),
    /// Inbound line that was not valid JSON
    ParseError { line: String, error: String },
    StatusChanged(AdapterStatus),
    /// Child process exited; `code` is `None` when killed by a signal
    ProcessExited { code: Option<i32> },
    Restarting { attempt: u32 },
    Reconnecting { attempt: u32 },
    /// The adapter gave up and is now in `Error`
    Fatal(String),
}

/// Uniform contract over one backend transport
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    fn protocol(&self) -> Protocol;

    fn status(&self) -> AdapterStatus;

    /// Connect or spawn. Calling `start` after `stop` brings the adapter back.
    async fn start(&self) -> HubResult<()>;

    /// Disconnect or kill; every pending request is failed first.
    async fn stop(&self) -> HubResult<()>;

    /// Single correlated round trip
    async fn send_request(&self, request: AdapterRequest) -> HubResult<AdapterResponse>;

    async fn stream_request(&self, request: AdapterRequest) -> HubResult<ChunkStream>;

    async fn health(&self) -> AdapterHealth;

    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent>;
}
