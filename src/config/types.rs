use crate::core::directory::{Endpoint, HubServer, ServerGroup};
use crate::core::load_balancer::LoadBalancingStrategy;
use crate::transport::Protocol;
use crate::utils::errors::{HubError, HubResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use url::Url;
use validator::Validate;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate, Default)]
pub struct HubConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    #[validate(nested)]
    pub factory: FactoryConfig,
    #[serde(default)]
    #[validate(nested)]
    pub load_balancer: LoadBalancerConfig,
    #[serde(default)]
    pub servers: Vec<HubServer>,
    #[serde(default)]
    pub groups: Vec<ServerGroup>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive, overridden by `RUST_LOG`
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Adapter factory limits and supervision cadence
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(default)]
pub struct FactoryConfig {
    #[validate(range(min = 1))]
    pub max_concurrent_adapters: usize,
    #[validate(range(min = 1))]
    pub health_check_interval_secs: u64,
    pub auto_restart: bool,
    #[validate(range(min = 1))]
    pub startup_timeout_secs: u64,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            max_concurrent_adapters: 100,
            health_check_interval_secs: 30,
            auto_restart: true,
            startup_timeout_secs: 30,
        }
    }
}

impl FactoryConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(default)]
pub struct LoadBalancerConfig {
    /// Strategy the router uses; `first_active` keeps load balancing off
    pub strategy: LoadBalancingStrategy,
    /// Number of failures before opening circuit
    #[validate(range(min = 1))]
    pub failure_threshold: u32,
    /// Seconds an open circuit waits before going half-open
    #[validate(range(min = 1))]
    pub reset_timeout_secs: u64,
    /// Successes needed in half-open to close the circuit
    #[validate(range(min = 1))]
    pub success_threshold: u32,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: LoadBalancingStrategy::FirstActive,
            failure_threshold: 5,
            reset_timeout_secs: 30,
            success_threshold: 2,
        }
    }
}

/// Per-server transport settings. Exactly one block is used; when several
/// are present the precedence is stdio, then stream, then http.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(default)]
pub struct ServerConnectionConfig {
    pub stdio: Option<StdioConfig>,
    pub stream: Option<StreamConfig>,
    pub http: Option<HttpConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct StdioConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<String>,
    pub request_timeout_ms: u64,
    pub max_restarts: u32,
    pub restart_delay_ms: u64,
}

impl Default for StdioConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            request_timeout_ms: 30_000,
            max_restarts: 3,
            restart_delay_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    /// Push endpoint; requests go to `<url>/request`
    pub url: String,
    pub headers: HashMap<String, String>,
    pub request_timeout_ms: u64,
    pub max_reconnects: u32,
    pub reconnect_delay_ms: u64,
    /// Idle longer than twice this reads as unhealthy
    pub health_check_interval_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            headers: HashMap::new(),
            request_timeout_ms: 30_000,
            max_reconnects: 5,
            reconnect_delay_ms: 1_000,
            health_check_interval_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    pub base_url: String,
    pub headers: HashMap<String, String>,
    pub timeout_ms: u64,
    pub max_concurrent_requests: usize,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    /// Optional health-check path, e.g. `/health`
    pub health_path: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            headers: HashMap::new(),
            timeout_ms: 30_000,
            max_concurrent_requests: 10,
            retry_attempts: 3,
            retry_delay_ms: 1_000,
            health_path: None,
        }
    }
}

/// A validated, protocol-specific adapter configuration
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterSpec {
    Stdio(StdioConfig),
    Stream(StreamConfig),
    Http(HttpConfig),
}

impl AdapterSpec {
    pub fn protocol(&self) -> Protocol {
        match self {
            AdapterSpec::Stdio(_) => Protocol::Stdio,
            AdapterSpec::Stream(_) => Protocol::Stream,
            AdapterSpec::Http(_) => Protocol::Http,
        }
    }
}

impl ServerConnectionConfig {
    pub fn stdio(config: StdioConfig) -> Self {
        Self {
            stdio: Some(config),
            ..Default::default()
        }
    }

    pub fn stream(config: StreamConfig) -> Self {
        Self {
            stream: Some(config),
            ..Default::default()
        }
    }

    pub fn http(config: HttpConfig) -> Self {
        Self {
            http: Some(config),
            ..Default::default()
        }
    }

    /// Pick the adapter to build and check that its block is complete.
    pub fn resolve(&self) -> HubResult<AdapterSpec> {
        let present = [self.stdio.is_some(), self.stream.is_some(), self.http.is_some()]
            .iter()
            .filter(|p| **p)
            .count();
        if present > 1 {
            debug!("Multiple protocol blocks configured, using precedence stdio > stream > http");
        }

        if let Some(stdio) = &self.stdio {
            if stdio.command.trim().is_empty() {
                return Err(HubError::Configuration(
                    "stdio adapter requires a command".to_string(),
                ));
            }
            return Ok(AdapterSpec::Stdio(stdio.clone()));
        }

        if let Some(stream) = &self.stream {
            parse_http_url(&stream.url, "stream adapter url")?;
            return Ok(AdapterSpec::Stream(stream.clone()));
        }

        if let Some(http) = &self.http {
            parse_http_url(&http.base_url, "http adapter base_url")?;
            if http.max_concurrent_requests == 0 {
                return Err(HubError::Configuration(
                    "http adapter max_concurrent_requests must be at least 1".to_string(),
                ));
            }
            return Ok(AdapterSpec::Http(http.clone()));
        }

        Err(HubError::Configuration(
            "no stdio, stream or http configuration supplied".to_string(),
        ))
    }
}

pub(crate) fn parse_http_url(raw: &str, what: &str) -> HubResult<Url> {
    if raw.trim().is_empty() {
        return Err(HubError::Configuration(format!("{} is required", what)));
    }
    let url = Url::parse(raw)
        .map_err(|e| HubError::Configuration(format!("invalid {} '{}': {}", what, raw, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(HubError::Configuration(format!(
            "{} must use http or https, got '{}'",
            what, other
        ))),
    }
}

/// `<base>/<path>` without doubling the slash
pub(crate) fn join_path(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
