//! Read-only lookups over servers, groups and endpoints
//!
//! The router never owns these records. It asks a `HubDirectory` for them on
//! every call, so an implementation backed by a database or by the config
//! file can be swapped in freely.

use crate::config::{HubConfig, ServerConnectionConfig};
use crate::utils::errors::{HubError, HubResult};
use parking_lot::RwLock;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    #[default]
    Active,
    Inactive,
}

/// One backend tool server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct HubServer {
    pub id: String,
    pub name: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub status: ServerStatus,
    #[serde(default)]
    pub connection: ServerConnectionConfig,
}

impl HubServer {
    pub fn is_active(&self) -> bool {
        self.status == ServerStatus::Active
    }

    /// Prefix applied to this server's tool names
    pub fn namespace_or_name(&self) -> &str {
        self.namespace.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RuleCondition {
    pub tool_name: String,
}

/// Pins a base tool name to a specific server within a group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RoutingRule {
    pub id: String,
    pub condition: RuleCondition,
    pub target_server_id: String,
    /// Higher wins
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ServerGroup {
    pub id: String,
    pub name: String,
    pub user_id: String,
    /// Member server ids in routing order
    #[serde(default)]
    pub servers: Vec<String>,
    /// Per-member weights (1..=100) for weighted balancing
    #[serde(default)]
    pub weights: HashMap<String, u32>,
    #[serde(default)]
    pub routing_rules: Vec<RoutingRule>,
}

/// The virtual tool endpoint a client talks to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Endpoint {
    pub id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

/// Lookups the router depends on. Not-found is `None` or empty, never an error.
#[cfg_attr(test, mockall::automock)]
pub trait HubDirectory: Send + Sync {
    fn server(&self, server_id: &str) -> Option<HubServer>;

    fn servers_by_user(&self, user_id: &str) -> Vec<HubServer>;

    /// Members of a group in the group's order; unknown members are skipped
    fn servers_by_group(&self, group_id: &str) -> Vec<HubServer>;

    fn group(&self, group_id: &str) -> Option<ServerGroup>;

    fn endpoint(&self, endpoint_id: &str) -> Option<Endpoint>;

    /// The only write the router performs
    fn set_routing_rules(&self, group_id: &str, rules: Vec<RoutingRule>) -> HubResult<()>;
}

#[derive(Debug, Default)]
struct DirectoryState {
    servers: Vec<HubServer>,
    groups: HashMap<String, ServerGroup>,
    endpoints: HashMap<String, Endpoint>,
}

impl DirectoryState {
    fn from_config(config: &HubConfig) -> Self {
        Self {
            servers: config.servers.clone(),
            groups: config
                .groups
                .iter()
                .map(|g| (g.id.clone(), g.clone()))
                .collect(),
            endpoints: config
                .endpoints
                .iter()
                .map(|e| (e.id.clone(), e.clone()))
                .collect(),
        }
    }
}

/// Directory held in memory and refreshed from the hub config
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    state: RwLock<DirectoryState>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &HubConfig) -> Self {
        Self {
            state: RwLock::new(DirectoryState::from_config(config)),
        }
    }

    /// Swap every record for the ones in `config`
    pub fn replace_from_config(&self, config: &HubConfig) {
        *self.state.write() = DirectoryState::from_config(config);
    }

    pub fn upsert_server(&self, server: HubServer) {
        let mut state = self.state.write();
        match state.servers.iter_mut().find(|s| s.id == server.id) {
            Some(existing) => *existing = server,
            None => state.servers.push(server),
        }
    }

    pub fn upsert_group(&self, group: ServerGroup) {
        self.state.write().groups.insert(group.id.clone(), group);
    }

    pub fn upsert_endpoint(&self, endpoint: Endpoint) {
        self.state
            .write()
            .endpoints
            .insert(endpoint.id.clone(), endpoint);
    }

    pub fn all_servers(&self) -> Vec<HubServer> {
        self.state.read().servers.clone()
    }
}

impl HubDirectory for InMemoryDirectory {
    fn server(&self, server_id: &str) -> Option<HubServer> {
        self.state
            .read()
            .servers
            .iter()
            .find(|s| s.id == server_id)
            .cloned()
    }

    fn servers_by_user(&self, user_id: &str) -> Vec<HubServer> {
        self.state
            .read()
            .servers
            .iter()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect()
    }

    fn servers_by_group(&self, group_id: &str) -> Vec<HubServer> {
        let state = self.state.read();
        let Some(group) = state.groups.get(group_id) else {
            return Vec::new();
        };
        group
            .servers
            .iter()
            .filter_map(|id| state.servers.iter().find(|s| &s.id == id).cloned())
            .collect()
    }

    fn group(&self, group_id: &str) -> Option<ServerGroup> {
        self.state.read().groups.get(group_id).cloned()
    }

    fn endpoint(&self, endpoint_id: &str) -> Option<Endpoint> {
        self.state.read().endpoints.get(endpoint_id).cloned()
    }

    fn set_routing_rules(&self, group_id: &str, rules: Vec<RoutingRule>) -> HubResult<()> {
        let mut state = self.state.write();
        let group = state
            .groups
            .get_mut(group_id)
            .ok_or_else(|| HubError::NotFound(format!("Group not found: {}", group_id)))?;
        group.routing_rules = rules;
        Ok(())
    }
}
