//! Server selection strategies with per-server circuit breakers
//!
//! All selection state (round-robin cursors, weights, connection counts and
//! breakers) lives inside one `LoadBalancer`, so independent balancers never
//! share counters.

use crate::config::LoadBalancerConfig;
use crate::core::circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerManager, CircuitBreakerStatus, CircuitState,
};
use crate::core::directory::{HubServer, ServerGroup};
use crate::core::selector::ServerSelector;
use crate::utils::errors::{HubError, HubResult};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_KEY: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    /// First eligible server in list order
    #[default]
    FirstActive,
    RoundRobin,
    Weighted,
    LeastConnections,
    Random,
}

impl std::fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadBalancingStrategy::FirstActive => write!(f, "first_active"),
            LoadBalancingStrategy::RoundRobin => write!(f, "round_robin"),
            LoadBalancingStrategy::Weighted => write!(f, "weighted"),
            LoadBalancingStrategy::LeastConnections => write!(f, "least_connections"),
            LoadBalancingStrategy::Random => write!(f, "random"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerStatistics {
    pub strategy: LoadBalancingStrategy,
    pub tracked_breakers: usize,
    pub open_breakers: usize,
    pub half_open_breakers: usize,
    pub closed_breakers: usize,
    pub active_connections: u64,
    pub servers_with_connections: usize,
    pub weighted_groups: usize,
}

pub struct LoadBalancer {
    strategy: LoadBalancingStrategy,
    breakers: CircuitBreakerManager,
    round_robin: Mutex<HashMap<String, usize>>,
    weights: RwLock<HashMap<String, HashMap<String, u32>>>,
    connections: Mutex<HashMap<String, u64>>,
}

impl LoadBalancer {
    pub fn new(strategy: LoadBalancingStrategy, breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            strategy,
            breakers: CircuitBreakerManager::new(breaker_config),
            round_robin: Mutex::new(HashMap::new()),
            weights: RwLock::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &LoadBalancerConfig) -> Self {
        Self::new(
            config.strategy,
            CircuitBreakerConfig {
                failure_threshold: config.failure_threshold,
                reset_timeout: Duration::from_secs(config.reset_timeout_secs),
                success_threshold: config.success_threshold,
            },
        )
    }

    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.strategy
    }

    /// Load the weight tables of every group; invalid weights are rejected
    /// before anything is applied.
    pub fn load_group_weights(&self, groups: &[ServerGroup]) -> HubResult<()> {
        for group in groups {
            for (server_id, weight) in &group.weights {
                validate_weight(server_id, *weight)?;
            }
        }
        let mut weights = self.weights.write();
        for group in groups {
            if group.weights.is_empty() {
                weights.remove(&group.id);
            } else {
                weights.insert(group.id.clone(), group.weights.clone());
            }
        }
        info!("Loaded weight tables for {} group(s)", weights.len());
        Ok(())
    }

    /// Pick a server with the given strategy. Inactive servers and servers
    /// with an open breaker are never returned.
    pub fn select_server(
        &self,
        servers: &[HubServer],
        strategy: LoadBalancingStrategy,
        group_id: Option<&str>,
    ) -> Option<HubServer> {
        let eligible: Vec<&HubServer> = servers.iter().filter(|s| self.is_eligible(s)).collect();
        if eligible.is_empty() {
            debug!("No eligible servers among {} candidates", servers.len());
            return None;
        }

        let picked = match strategy {
            LoadBalancingStrategy::FirstActive => eligible[0],
            LoadBalancingStrategy::RoundRobin => self.round_robin(&eligible, group_id),
            LoadBalancingStrategy::Weighted => self.weighted(&eligible, group_id),
            LoadBalancingStrategy::LeastConnections => self.least_connections(&eligible),
            LoadBalancingStrategy::Random => random(&eligible),
        };
        debug!("{} selected server {}", strategy, picked.id);
        Some(picked.clone())
    }

    fn round_robin<'a>(&self, eligible: &[&'a HubServer], group_id: Option<&str>) -> &'a HubServer {
        let key = group_id.unwrap_or(DEFAULT_KEY);
        let mut counters = self.round_robin.lock();
        let counter = counters.entry(key.to_string()).or_insert(0);
        let picked = eligible[*counter % eligible.len()];
        *counter = counter.wrapping_add(1);
        picked
    }

    fn weighted<'a>(&self, eligible: &[&'a HubServer], group_id: Option<&str>) -> &'a HubServer {
        let key = group_id.unwrap_or(DEFAULT_KEY);
        let weights = self.weights.read();
        let Some(table) = weights.get(key) else {
            return random(eligible);
        };

        let cumulative: Vec<u64> = eligible
            .iter()
            .scan(0u64, |sum, s| {
                *sum += u64::from(table.get(&s.id).copied().unwrap_or(1));
                Some(*sum)
            })
            .collect();
        let total = cumulative.last().copied().unwrap_or(0);
        if total == 0 {
            return eligible[0];
        }

        let draw = rand::thread_rng().gen_range(0.0..total as f64);
        let index = cumulative
            .iter()
            .position(|c| *c as f64 >= draw)
            .unwrap_or(eligible.len() - 1);
        eligible[index]
    }

    fn least_connections<'a>(&self, eligible: &[&'a HubServer]) -> &'a HubServer {
        let connections = self.connections.lock();
        let mut best = eligible[0];
        let mut best_count = connections.get(&best.id).copied().unwrap_or(0);
        for server in eligible[1..].iter().copied() {
            let count = connections.get(&server.id).copied().unwrap_or(0);
            if count < best_count {
                best = server;
                best_count = count;
            }
        }
        best
    }

    pub fn set_server_weight(&self, group_id: &str, server_id: &str, weight: u32) -> HubResult<()> {
        validate_weight(server_id, weight)?;
        self.weights
            .write()
            .entry(group_id.to_string())
            .or_default()
            .insert(server_id.to_string(), weight);
        Ok(())
    }

    pub fn server_weights(&self, group_id: &str) -> HashMap<String, u32> {
        self.weights.read().get(group_id).cloned().unwrap_or_default()
    }

    pub fn clear_server_weights(&self, group_id: &str) {
        self.weights.write().remove(group_id);
    }

    pub fn record_success(&self, server_id: &str) {
        self.breakers.get_breaker(server_id).record_success();
    }

    pub fn record_failure(&self, server_id: &str) {
        self.breakers.get_breaker(server_id).record_failure();
    }

    pub fn get_circuit_breaker_status(&self, server_id: &str) -> CircuitBreakerStatus {
        self.breakers.status(server_id)
    }

    pub fn get_all_circuit_breakers(&self) -> Vec<CircuitBreakerStatus> {
        self.breakers.all_statuses()
    }

    pub fn reset_circuit_breaker(&self, server_id: &str) {
        self.breakers.reset(server_id);
    }

    pub fn increment_connections(&self, server_id: &str) {
        *self
            .connections
            .lock()
            .entry(server_id.to_string())
            .or_insert(0) += 1;
    }

    pub fn decrement_connections(&self, server_id: &str) {
        let mut connections = self.connections.lock();
        if let Some(count) = connections.get_mut(server_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                connections.remove(server_id);
            }
        }
    }

    pub fn get_connection_count(&self, server_id: &str) -> u64 {
        self.connections.lock().get(server_id).copied().unwrap_or(0)
    }

    pub fn get_statistics(&self) -> LoadBalancerStatistics {
        let breakers = self.breakers.all_statuses();
        let count = |state: CircuitState| breakers.iter().filter(|b| b.state == state).count();
        let connections = self.connections.lock();

        LoadBalancerStatistics {
            strategy: self.strategy,
            tracked_breakers: breakers.len(),
            open_breakers: count(CircuitState::Open),
            half_open_breakers: count(CircuitState::HalfOpen),
            closed_breakers: count(CircuitState::Closed),
            active_connections: connections.values().sum(),
            servers_with_connections: connections.len(),
            weighted_groups: self.weights.read().len(),
        }
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::from_config(&LoadBalancerConfig::default())
    }
}

impl ServerSelector for LoadBalancer {
    fn select(&self, candidates: &[HubServer], group_id: Option<&str>) -> Option<HubServer> {
        self.select_server(candidates, self.strategy, group_id)
    }

    fn is_eligible(&self, server: &HubServer) -> bool {
        server.is_active() && self.breakers.get_breaker(&server.id).allows_request()
    }

    fn record_success(&self, server_id: &str) {
        LoadBalancer::record_success(self, server_id);
    }

    fn record_failure(&self, server_id: &str) {
        LoadBalancer::record_failure(self, server_id);
    }

    fn connection_started(&self, server_id: &str) {
        self.increment_connections(server_id);
    }

    fn connection_finished(&self, server_id: &str) {
        self.decrement_connections(server_id);
    }
}

fn validate_weight(server_id: &str, weight: u32) -> HubResult<()> {
    if !(1..=100).contains(&weight) {
        return Err(HubError::Configuration(format!(
            "weight for server {} must be between 1 and 100, got {}",
            server_id, weight
        )));
    }
    Ok(())
}

fn random<'a>(eligible: &[&'a HubServer]) -> &'a HubServer {
    let index = rand::thread_rng().gen_range(0..eligible.len());
    eligible[index]
}
