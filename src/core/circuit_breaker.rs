//! Circuit breaker pattern for resilient server selection
//!
//! Keeps failing servers out of rotation until they have had time to recover.
//! State moves from OPEN to HALF_OPEN lazily: the transition happens on the
//! first status read after `next_attempt_time`, not on a timer.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - server is eligible
    Closed,
    /// Failure threshold reached - server is skipped
    Open,
    /// Testing if the server has recovered
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of failures before opening circuit
    pub failure_threshold: u32,
    /// How long an open circuit waits before going half-open
    pub reset_timeout: Duration,
    /// Success threshold in half-open state to close circuit
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

/// Snapshot of one server's breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerStatus {
    pub server_id: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub next_attempt_time: Option<DateTime<Utc>>,
}

impl CircuitBreakerStatus {
    fn closed(server_id: &str) -> Self {
        Self {
            server_id: server_id.to_string(),
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            next_attempt_time: None,
        }
    }
}

/// Circuit breaker for a single server
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    record: Mutex<CircuitBreakerStatus>,
}

impl CircuitBreaker {
    pub fn new(server_id: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let server_id = server_id.into();
        Self {
            config,
            record: Mutex::new(CircuitBreakerStatus::closed(&server_id)),
        }
    }

    fn reset_window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.reset_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(30))
    }

    /// Current status, applying a due OPEN -> HALF_OPEN transition first
    pub fn status(&self) -> CircuitBreakerStatus {
        let mut record = self.record.lock();
        if record.state == CircuitState::Open {
            let due = record
                .next_attempt_time
                .map(|at| Utc::now() >= at)
                .unwrap_or(true);
            if due {
                record.state = CircuitState::HalfOpen;
                record.success_count = 0;
                info!("Circuit breaker '{}' transitioned to half-open", record.server_id);
            }
        }
        record.clone()
    }

    pub fn state(&self) -> CircuitState {
        self.status().state
    }

    /// Whether the server may be selected right now
    pub fn allows_request(&self) -> bool {
        self.state() != CircuitState::Open
    }

    /// Record a successful request
    pub fn record_success(&self) {
        let mut record = self.record.lock();
        match record.state {
            CircuitState::Closed => {
                record.failure_count = record.failure_count.saturating_sub(1);
            }
            CircuitState::HalfOpen => {
                record.success_count += 1;
                if record.success_count >= self.config.success_threshold {
                    record.state = CircuitState::Closed;
                    record.failure_count = 0;
                    record.success_count = 0;
                    record.next_attempt_time = None;
                    info!("Circuit breaker '{}' closed after recovery", record.server_id);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed request
    pub fn record_failure(&self) {
        let now = Utc::now();
        let mut record = self.record.lock();
        record.failure_count += 1;
        record.last_failure_time = Some(now);

        match record.state {
            CircuitState::Closed => {
                if record.failure_count >= self.config.failure_threshold {
                    record.state = CircuitState::Open;
                    record.next_attempt_time = Some(now + self.reset_window());
                    warn!(
                        "Circuit breaker '{}' opened after {} failures",
                        record.server_id, record.failure_count
                    );
                }
            }
            CircuitState::HalfOpen => {
                record.state = CircuitState::Open;
                record.success_count = 0;
                record.next_attempt_time = Some(now + self.reset_window());
                warn!(
                    "Circuit breaker '{}' re-opened after failure in half-open state",
                    record.server_id
                );
            }
            // the existing window stands
            CircuitState::Open => {}
        }
    }

    /// Force CLOSED with counters zeroed
    pub fn reset(&self) {
        let mut record = self.record.lock();
        let server_id = std::mem::take(&mut record.server_id);
        *record = CircuitBreakerStatus::closed(&server_id);
        info!("Circuit breaker '{}' manually reset", server_id);
    }
}

/// One breaker per server, created on first observation
pub struct CircuitBreakerManager {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerManager {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get or create the breaker for a server
    pub fn get_breaker(&self, server_id: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(server_id) {
            return breaker.clone();
        }

        self.breakers
            .write()
            .entry(server_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(server_id, self.config.clone())))
            .clone()
    }

    pub fn status(&self, server_id: &str) -> CircuitBreakerStatus {
        self.get_breaker(server_id).status()
    }

    pub fn all_statuses(&self) -> Vec<CircuitBreakerStatus> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.breakers.read().values().cloned().collect();
        let mut statuses: Vec<CircuitBreakerStatus> = breakers.iter().map(|b| b.status()).collect();
        statuses.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        statuses
    }

    pub fn reset(&self, server_id: &str) {
        self.get_breaker(server_id).reset();
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.read().values() {
            breaker.reset();
        }
    }
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
