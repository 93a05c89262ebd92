//! Configuration validation: derive checks plus cross-reference checks

use crate::config::manager::{load_config, parse_config, ConfigFormat};
use crate::config::HubConfig;
use schemars::schema_for;
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use validator::Validate;

/// Validation error
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Configuration validator
pub struct ConfigValidator {
    schema: Value,
}

impl ConfigValidator {
    /// Create a new validator with the generated schema
    pub fn new() -> Self {
        let schema = schema_for!(HubConfig);
        Self {
            schema: serde_json::to_value(&schema).unwrap_or_default(),
        }
    }

    /// Get the JSON Schema for the configuration
    pub fn get_schema(&self) -> &Value {
        &self.schema
    }

    /// Export the schema to a JSON string
    pub fn export_schema(&self) -> String {
        serde_json::to_string_pretty(&self.schema).unwrap_or_default()
    }

    /// Validate a configuration file in any supported format
    pub async fn validate_file(&self, path: impl AsRef<Path>) -> Result<HubConfig, Vec<ValidationError>> {
        let (config, _) = load_config(path)
            .await
            .map_err(|e| vec![ValidationError::new("root", e.to_string())])?;
        self.validate(&config)?;
        Ok(config)
    }

    /// Validate configuration text
    pub fn validate_str(&self, content: &str, format: ConfigFormat) -> Result<HubConfig, Vec<ValidationError>> {
        let config = parse_config(content, format)
            .map_err(|e| vec![ValidationError::new("root", e.to_string())])?;
        self.validate(&config)?;
        Ok(config)
    }

    pub fn validate(&self, config: &HubConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if let Err(validation_errors) = config.validate() {
            for (section, kind) in validation_errors.errors() {
                errors.push(ValidationError::new(section.to_string(), format!("{:?}", kind)));
            }
        }

        self.validate_servers(config, &mut errors);
        self.validate_groups(config, &mut errors);
        self.validate_endpoints(config, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_servers(&self, config: &HubConfig, errors: &mut Vec<ValidationError>) {
        let mut ids = HashSet::new();

        for (idx, server) in config.servers.iter().enumerate() {
            if server.id.is_empty() {
                errors.push(ValidationError::new(
                    format!("servers[{}].id", idx),
                    "Server id cannot be empty",
                ));
            }
            if !ids.insert(&server.id) {
                errors.push(ValidationError::new(
                    format!("servers[{}].id", idx),
                    format!("Duplicate server id: {}", server.id),
                ));
            }
            if server.name.is_empty() {
                errors.push(ValidationError::new(
                    format!("servers[{}].name", idx),
                    "Server name cannot be empty",
                ));
            }
            if let Err(e) = server.connection.resolve() {
                errors.push(ValidationError::new(
                    format!("servers[{}].connection", idx),
                    e.to_string(),
                ));
            }
        }
    }

    fn validate_groups(&self, config: &HubConfig, errors: &mut Vec<ValidationError>) {
        let server_ids: HashSet<&str> = config.servers.iter().map(|s| s.id.as_str()).collect();
        let mut group_ids = HashSet::new();

        for (idx, group) in config.groups.iter().enumerate() {
            if !group_ids.insert(&group.id) {
                errors.push(ValidationError::new(
                    format!("groups[{}].id", idx),
                    format!("Duplicate group id: {}", group.id),
                ));
            }
            for member in &group.servers {
                if !server_ids.contains(member.as_str()) {
                    errors.push(ValidationError::new(
                        format!("groups[{}].servers", idx),
                        format!("Unknown server: {}", member),
                    ));
                }
            }
            for (server_id, weight) in &group.weights {
                if !(1..=100).contains(weight) {
                    errors.push(ValidationError::new(
                        format!("groups[{}].weights.{}", idx, server_id),
                        "Weight must be between 1 and 100",
                    ));
                }
            }
            for (rule_idx, rule) in group.routing_rules.iter().enumerate() {
                if !server_ids.contains(rule.target_server_id.as_str()) {
                    errors.push(ValidationError::new(
                        format!("groups[{}].routing_rules[{}].target_server_id", idx, rule_idx),
                        format!("Unknown server: {}", rule.target_server_id),
                    ));
                }
            }
        }
    }

    fn validate_endpoints(&self, config: &HubConfig, errors: &mut Vec<ValidationError>) {
        let group_ids: HashSet<&str> = config.groups.iter().map(|g| g.id.as_str()).collect();
        let mut endpoint_ids = HashSet::new();

        for (idx, endpoint) in config.endpoints.iter().enumerate() {
            if !endpoint_ids.insert(&endpoint.id) {
                errors.push(ValidationError::new(
                    format!("endpoints[{}].id", idx),
                    format!("Duplicate endpoint id: {}", endpoint.id),
                ));
            }
            if let Some(group_id) = &endpoint.group_id {
                if !group_ids.contains(group_id.as_str()) {
                    errors.push(ValidationError::new(
                        format!("endpoints[{}].group_id", idx),
                        format!("Unknown group: {}", group_id),
                    ));
                }
            }
        }
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}
