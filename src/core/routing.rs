//! Tool routing across the servers behind an endpoint
//!
//! Tool names are exposed as `<namespace>.<tool>`. A call is routed by
//! splitting on the last `.`, narrowing candidates to the namespace, then
//! applying the group's routing rules, the server selector, and finally a
//! first-active fallback.

use crate::core::directory::{Endpoint, HubDirectory, HubServer, RoutingRule};
use crate::core::factory::AdapterFactory;
use crate::core::protocol::AdapterRequest;
use crate::core::selector::{FirstActiveSelector, ServerSelector};
use crate::transport::AdapterHealth;
use crate::utils::errors::{HubError, HubResult};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

/// A tool as exposed through an endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
    pub server_id: String,
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    pub response_time_ms: u64,
}

impl ToolCallResult {
    fn failed(error: impl Into<String>, server_id: Option<String>, started: Instant) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            server_id,
            response_time_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Split `a.b.tool` into `(Some("a.b"), "tool")`
pub fn split_tool_name(tool_name: &str) -> (Option<&str>, &str) {
    match tool_name.rsplit_once('.') {
        Some((namespace, base)) => (Some(namespace), base),
        None => (None, tool_name),
    }
}

/// Name a raw tool is exposed under. Names that already carry a `.` are
/// treated as namespaced and kept as they are.
pub fn namespaced_name(server: &HubServer, raw_name: &str) -> String {
    if raw_name.contains('.') {
        raw_name.to_string()
    } else {
        format!("{}.{}", server.namespace_or_name(), raw_name)
    }
}

fn matches_namespace(server: &HubServer, namespace: &str) -> bool {
    server.namespace.as_deref() == Some(namespace) || server.name == namespace
}

/// Read a `tools/list` result: either `{"tools": [...]}` or a bare array
pub fn parse_tool_list(server: &HubServer, result: &Value) -> Vec<ToolDefinition> {
    let tools = match result {
        Value::Array(tools) => tools,
        other => match other.get("tools").and_then(Value::as_array) {
            Some(tools) => tools,
            None => {
                warn!("Server {} returned no tool list", server.id);
                return Vec::new();
            }
        },
    };

    let mut seen = HashSet::new();
    let mut definitions = Vec::new();
    for tool in tools {
        let Some(raw_name) = tool.get("name").and_then(Value::as_str) else {
            debug!("Skipping nameless tool from {}", server.id);
            continue;
        };
        let name = namespaced_name(server, raw_name);
        if !seen.insert(name.clone()) {
            warn!("Duplicate tool {} from server {} ignored", name, server.id);
            continue;
        }

        definitions.push(ToolDefinition {
            name,
            description: tool
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            parameters: tool_parameters(tool),
            server_id: server.id.clone(),
            namespace: server.namespace_or_name().to_string(),
        });
    }
    definitions
}

fn tool_parameters(tool: &Value) -> Vec<ToolParameter> {
    if let Some(parameters) = tool.get("parameters").and_then(Value::as_array) {
        return parameters
            .iter()
            .filter_map(|p| {
                let name = p.get("name")?.as_str()?.to_string();
                Some(ToolParameter {
                    name,
                    param_type: p
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or("any")
                        .to_string(),
                    description: p
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    required: p.get("required").and_then(Value::as_bool).unwrap_or(false),
                })
            })
            .collect();
    }

    let Some(schema) = tool.get("inputSchema") else {
        return Vec::new();
    };
    let required: HashSet<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    schema
        .get("properties")
        .and_then(Value::as_object)
        .map(|properties| {
            properties
                .iter()
                .map(|(name, property)| ToolParameter {
                    name: name.clone(),
                    param_type: property
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or("any")
                        .to_string(),
                    description: property
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    required: required.contains(name.as_str()),
                })
                .collect()
        })
        .unwrap_or_default()
}

pub struct Router {
    factory: Arc<AdapterFactory>,
    directory: Arc<dyn HubDirectory>,
    selector: Arc<dyn ServerSelector>,
}

impl Router {
    pub fn new(factory: Arc<AdapterFactory>, directory: Arc<dyn HubDirectory>) -> Self {
        Self::with_selector(factory, directory, Arc::new(FirstActiveSelector))
    }

    pub fn with_selector(
        factory: Arc<AdapterFactory>,
        directory: Arc<dyn HubDirectory>,
        selector: Arc<dyn ServerSelector>,
    ) -> Self {
        Self {
            factory,
            directory,
            selector,
        }
    }

    fn endpoint_servers(&self, endpoint: &Endpoint) -> Vec<HubServer> {
        match &endpoint.group_id {
            Some(group_id) => self.directory.servers_by_group(group_id),
            None => self.directory.servers_by_user(&endpoint.user_id),
        }
    }

    /// Adapter id for the server, creating the adapter on first use
    async fn ensure_adapter(&self, server: &HubServer) -> HubResult<String> {
        if let Some(instance) = self.factory.adapter_for_server(&server.id) {
            return Ok(instance.id);
        }
        match self.factory.create_adapter(&server.id, &server.connection).await {
            Ok(instance) => Ok(instance.id),
            // another caller won the race to create it
            Err(HubError::InvalidRequest(e)) => self
                .factory
                .adapter_for_server(&server.id)
                .map(|instance| instance.id)
                .ok_or(HubError::InvalidRequest(e)),
            Err(e) => Err(e),
        }
    }

    async fn list_server_tools(&self, server: &HubServer) -> HubResult<Vec<ToolDefinition>> {
        let adapter_id = self.ensure_adapter(server).await?;
        let response = self
            .factory
            .send_request(&adapter_id, AdapterRequest::new("tools/list", None))
            .await?;
        let result = response.into_result()?;
        Ok(parse_tool_list(server, &result))
    }

    /// Tools of every active server behind the endpoint. Failing servers are
    /// logged and left out.
    pub async fn get_available_tools(&self, endpoint_id: &str) -> Vec<ToolDefinition> {
        let Some(endpoint) = self.directory.endpoint(endpoint_id) else {
            warn!("Endpoint not found: {}", endpoint_id);
            return Vec::new();
        };

        let servers: Vec<HubServer> = self
            .endpoint_servers(&endpoint)
            .into_iter()
            .filter(HubServer::is_active)
            .collect();

        let listings = join_all(servers.iter().map(|server| async move {
            (server, self.list_server_tools(server).await)
        }))
        .await;

        let mut tools = Vec::new();
        for (server, listing) in listings {
            match listing {
                Ok(mut server_tools) => {
                    debug!("Server {} offers {} tools", server.id, server_tools.len());
                    tools.append(&mut server_tools);
                }
                Err(e) => warn!("Failed to list tools of server {}: {}", server.id, e),
            }
        }
        tools
    }

    fn resolve_server(
        &self,
        endpoint: &Endpoint,
        candidates: &[HubServer],
        tool_name: &str,
        base_name: &str,
    ) -> HubResult<HubServer> {
        let no_server = || HubError::Routing(format!("No server found for tool: {}", tool_name));

        let chosen = match self.rule_target(endpoint, candidates, tool_name, base_name) {
            Some(target) => target,
            None => {
                let eligible: Vec<HubServer> = candidates
                    .iter()
                    .filter(|s| self.selector.is_eligible(s))
                    .cloned()
                    .collect();
                self.selector
                    .select(&eligible, endpoint.group_id.as_deref())
                    .ok_or_else(no_server)?
            }
        };
        if self.selector.is_eligible(&chosen) {
            return Ok(chosen);
        }

        // a selector handed back a server it may not call; first eligible candidate instead
        warn!("Selected server {} is not eligible, falling back", chosen.id);
        candidates
            .iter()
            .find(|s| s.id != chosen.id && self.selector.is_eligible(s))
            .cloned()
            .ok_or_else(no_server)
    }

    /// Highest-priority enabled rule for `base_name` whose target is an
    /// eligible candidate
    fn rule_target(
        &self,
        endpoint: &Endpoint,
        candidates: &[HubServer],
        tool_name: &str,
        base_name: &str,
    ) -> Option<HubServer> {
        let group = self.directory.group(endpoint.group_id.as_deref()?)?;
        let mut rules: Vec<&RoutingRule> = group
            .routing_rules
            .iter()
            .filter(|r| r.enabled && r.condition.tool_name == base_name)
            .collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));

        rules.into_iter().find_map(|rule| {
            let target = self.directory.server(&rule.target_server_id)?;
            let eligible =
                self.selector.is_eligible(&target) && candidates.iter().any(|c| c.id == target.id);
            if eligible {
                debug!("Rule {} routes {} to {}", rule.id, tool_name, target.id);
            }
            eligible.then_some(target)
        })
    }

    /// Route one tool call. Never fails: every problem is reported in the
    /// returned `ToolCallResult`.
    pub async fn route_tool_call(
        &self,
        endpoint_id: &str,
        tool_name: &str,
        params: Value,
    ) -> ToolCallResult {
        let started = Instant::now();

        let Some(endpoint) = self.directory.endpoint(endpoint_id) else {
            return ToolCallResult::failed(format!("Endpoint not found: {}", endpoint_id), None, started);
        };

        let (namespace, base_name) = split_tool_name(tool_name);
        let mut candidates = self.endpoint_servers(&endpoint);
        if let Some(namespace) = namespace {
            candidates.retain(|s| matches_namespace(s, namespace));
        }

        let server = match self.resolve_server(&endpoint, &candidates, tool_name, base_name) {
            Ok(server) => server,
            Err(e) => {
                warn!("{}", e);
                return ToolCallResult::failed(routing_message(e), None, started);
            }
        };
        info!("Routing {} to server {}", tool_name, server.id);

        let outcome = {
            let _connection = ConnectionGuard::open(self.selector.as_ref(), &server.id);
            self.dispatch(&server, base_name, params).await
        };

        match outcome {
            Ok(result) => {
                self.selector.record_success(&server.id);
                ToolCallResult {
                    success: true,
                    result: Some(result),
                    error: None,
                    server_id: Some(server.id),
                    response_time_ms: started.elapsed().as_millis() as u64,
                }
            }
            Err(e) => {
                self.selector.record_failure(&server.id);
                warn!("Tool call {} on {} failed: {}", tool_name, server.id, e);
                ToolCallResult::failed(e.to_string(), Some(server.id), started)
            }
        }
    }

    async fn dispatch(&self, server: &HubServer, base_name: &str, params: Value) -> HubResult<Value> {
        let adapter_id = self.ensure_adapter(server).await?;
        let request = AdapterRequest::new(
            "tools/call",
            Some(json!({ "name": base_name, "arguments": params })),
        );
        self.factory
            .send_request(&adapter_id, request)
            .await?
            .into_result()
    }

    pub async fn get_server_health(&self, server_id: &str) -> AdapterHealth {
        self.factory.get_server_health(server_id).await
    }

    pub async fn get_group_health(&self, group_id: &str) -> HubResult<Vec<(String, AdapterHealth)>> {
        let group = self
            .directory
            .group(group_id)
            .ok_or_else(|| HubError::NotFound(format!("Group not found: {}", group_id)))?;

        let checks = group.servers.iter().map(|server_id| async move {
            (server_id.clone(), self.factory.get_server_health(server_id).await)
        });
        Ok(join_all(checks).await)
    }

    pub fn set_routing_rules(&self, group_id: &str, rules: Vec<RoutingRule>) -> HubResult<()> {
        if self.directory.group(group_id).is_none() {
            return Err(HubError::NotFound(format!("Group not found: {}", group_id)));
        }
        info!("Setting {} routing rules for group {}", rules.len(), group_id);
        self.directory.set_routing_rules(group_id, rules)
    }

    pub fn get_routing_rules(&self, group_id: &str) -> HubResult<Vec<RoutingRule>> {
        self.directory
            .group(group_id)
            .map(|group| group.routing_rules)
            .ok_or_else(|| HubError::NotFound(format!("Group not found: {}", group_id)))
    }
}

/// Routing failures are reported with their bare message
fn routing_message(error: HubError) -> String {
    match error {
        HubError::Routing(message) => message,
        other => other.to_string(),
    }
}

/// Tells the selector a call is in flight; the matching finish is reported
/// on drop, so an abandoned call still releases its connection slot.
struct ConnectionGuard<'a> {
    selector: &'a dyn ServerSelector,
    server_id: &'a str,
}

impl<'a> ConnectionGuard<'a> {
    fn open(selector: &'a dyn ServerSelector, server_id: &'a str) -> Self {
        selector.connection_started(server_id);
        Self { selector, server_id }
    }
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.selector.connection_finished(self.server_id);
    }
}
