//! Adapter factory: creation, registry, supervision and shutdown
//!
//! Every live adapter is owned here. Callers address adapters by id and only
//! ever receive `AdapterInstance` snapshots.

use crate::config::{AdapterSpec, FactoryConfig, ServerConnectionConfig};
use crate::core::protocol::{AdapterRequest, AdapterResponse};
use crate::core::request_id::instance_id;
use crate::transport::{
    AdapterHealth, AdapterStatus, ChunkStream, HealthStatus, HttpAdapter, Protocol,
    ProtocolAdapter, StdioAdapter, StreamAdapter,
};
use crate::utils::errors::{HubError, HubResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterMetadata {
    pub request_count: u64,
    pub error_count: u64,
    pub uptime_ms: u64,
    pub restart_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Snapshot of one supervised adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterInstance {
    pub id: String,
    pub server_id: String,
    pub protocol: Protocol,
    pub status: AdapterStatus,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub metadata: AdapterMetadata,
}

impl AdapterInstance {
    /// Usable now or expected to become usable without intervention
    pub fn is_live(&self) -> bool {
        matches!(
            self.status,
            AdapterStatus::Connected | AdapterStatus::Initializing | AdapterStatus::Reconnecting
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FactoryEvent {
    AdapterCreated {
        adapter_id: String,
        server_id: String,
        protocol: Protocol,
    },
    StatusChanged {
        adapter_id: String,
        server_id: String,
        status: AdapterStatus,
    },
    AdapterRestarted {
        adapter_id: String,
        server_id: String,
    },
    AdapterRemoved {
        adapter_id: String,
        server_id: String,
    },
    HealthCheckFailed {
        adapter_id: String,
        server_id: String,
        error: Option<String>,
    },
    Shutdown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterStatistics {
    pub total: usize,
    pub by_protocol: HashMap<Protocol, usize>,
    pub by_status: HashMap<AdapterStatus, usize>,
    pub total_requests: u64,
    pub total_errors: u64,
    pub average_uptime_ms: u64,
}

/// Builds the concrete adapter for a resolved configuration
pub trait AdapterConnector: Send + Sync {
    fn connect(&self, server_id: &str, spec: &AdapterSpec) -> HubResult<Arc<dyn ProtocolAdapter>>;
}

/// Connector for the three built-in transports
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConnector;

impl AdapterConnector for DefaultConnector {
    fn connect(&self, server_id: &str, spec: &AdapterSpec) -> HubResult<Arc<dyn ProtocolAdapter>> {
        Ok(match spec {
            AdapterSpec::Stdio(config) => Arc::new(StdioAdapter::new(server_id, config.clone())),
            AdapterSpec::Stream(config) => Arc::new(StreamAdapter::new(server_id, config.clone())?),
            AdapterSpec::Http(config) => Arc::new(HttpAdapter::new(server_id, config.clone())?),
        })
    }
}

struct AdapterEntry {
    adapter: Arc<dyn ProtocolAdapter>,
    instance: RwLock<AdapterInstance>,
    /// Held for the whole of a restart
    restart_lock: tokio::sync::Mutex<()>,
}

impl AdapterEntry {
    fn id(&self) -> String {
        self.instance.read().id.clone()
    }

    fn server_id(&self) -> String {
        self.instance.read().server_id.clone()
    }

    fn record_error(&self, message: String) {
        let mut instance = self.instance.write();
        instance.metadata.error_count += 1;
        instance.metadata.last_error = Some(message);
    }
}

pub struct AdapterFactory {
    config: FactoryConfig,
    connector: Arc<dyn AdapterConnector>,
    adapters: DashMap<String, Arc<AdapterEntry>>,
    /// Makes the capacity/duplicate check and the insert one step
    registration: Mutex<()>,
    shutting_down: AtomicBool,
    monitor_token: CancellationToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<FactoryEvent>,
}

impl AdapterFactory {
    pub fn new(config: FactoryConfig) -> Self {
        Self::with_connector(config, Arc::new(DefaultConnector))
    }

    pub fn with_connector(config: FactoryConfig, connector: Arc<dyn AdapterConnector>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            connector,
            adapters: DashMap::new(),
            registration: Mutex::new(()),
            shutting_down: AtomicBool::new(false),
            monitor_token: CancellationToken::new(),
            monitor: Mutex::new(None),
            events,
        }
    }

    pub fn config(&self) -> &FactoryConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FactoryEvent> {
        self.events.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn emit(&self, event: FactoryEvent) {
        let _ = self.events.send(event);
    }

    fn set_status(&self, entry: &AdapterEntry, status: AdapterStatus) {
        let (adapter_id, server_id, changed) = {
            let mut instance = entry.instance.write();
            let changed = instance.status != status;
            instance.status = status;
            (instance.id.clone(), instance.server_id.clone(), changed)
        };
        if changed {
            debug!("Adapter {} ({}) is now {}", adapter_id, server_id, status);
            self.emit(FactoryEvent::StatusChanged {
                adapter_id,
                server_id,
                status,
            });
        }
    }

    /// Pull the adapter's own status into the snapshot unless the factory is
    /// itself mid-transition for it.
    fn sync_status(&self, entry: &AdapterEntry) {
        if entry.instance.read().status == AdapterStatus::Initializing {
            return;
        }
        let Ok(_restart) = entry.restart_lock.try_lock() else {
            return;
        };
        self.set_status(entry, entry.adapter.status());
    }

    fn snapshot(&self, entry: &AdapterEntry) -> AdapterInstance {
        self.sync_status(entry);
        let mut instance = entry.instance.read().clone();
        instance.metadata.uptime_ms = uptime_ms(instance.created_at);
        instance
    }

    fn entry(&self, adapter_id: &str) -> HubResult<Arc<AdapterEntry>> {
        self.adapters
            .get(adapter_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| HubError::NotFound(format!("Adapter not found: {}", adapter_id)))
    }

    fn entries(&self) -> Vec<Arc<AdapterEntry>> {
        self.adapters.iter().map(|e| e.value().clone()).collect()
    }

    /// Create, register and start an adapter for `server_id`.
    pub async fn create_adapter(
        &self,
        server_id: &str,
        connection: &ServerConnectionConfig,
    ) -> HubResult<AdapterInstance> {
        if self.is_shutting_down() {
            return Err(HubError::ShuttingDown);
        }
        let spec = connection.resolve()?;

        let (entry, replaced) = {
            let _registration = self.registration.lock();
            // shutdown flips the flag before it takes this lock to drain
            if self.is_shutting_down() {
                return Err(HubError::ShuttingDown);
            }

            let mut replaced = Vec::new();
            for existing in self.entries() {
                if existing.server_id() != server_id {
                    continue;
                }
                self.sync_status(&existing);
                let instance = existing.instance.read().clone();
                if instance.is_live() {
                    return Err(HubError::InvalidRequest(format!(
                        "server {} already has adapter {} ({})",
                        server_id, instance.id, instance.status
                    )));
                }
                self.adapters.remove(&instance.id);
                replaced.push(existing);
            }

            if self.adapters.len() >= self.config.max_concurrent_adapters {
                return Err(HubError::Capacity(format!(
                    "maximum of {} concurrent adapters reached",
                    self.config.max_concurrent_adapters
                )));
            }

            let adapter = self.connector.connect(server_id, &spec)?;
            let now = Utc::now();
            let instance = AdapterInstance {
                id: instance_id(),
                server_id: server_id.to_string(),
                protocol: adapter.protocol(),
                status: AdapterStatus::Initializing,
                created_at: now,
                last_used_at: now,
                metadata: AdapterMetadata::default(),
            };
            let entry = Arc::new(AdapterEntry {
                adapter,
                instance: RwLock::new(instance),
                restart_lock: tokio::sync::Mutex::new(()),
            });
            self.adapters.insert(entry.id(), entry.clone());
            (entry, replaced)
        };

        for dead in replaced {
            self.dispose(dead).await;
        }

        let adapter_id = entry.id();
        info!(
            "Creating {} adapter {} for server {}",
            spec.protocol(),
            adapter_id,
            server_id
        );
        self.emit(FactoryEvent::AdapterCreated {
            adapter_id: adapter_id.clone(),
            server_id: server_id.to_string(),
            protocol: spec.protocol(),
        });
        self.emit(FactoryEvent::StatusChanged {
            adapter_id: adapter_id.clone(),
            server_id: server_id.to_string(),
            status: AdapterStatus::Initializing,
        });

        match self.start_with_timeout(&entry).await {
            Ok(()) if self.is_shutting_down() => {
                self.abandon_for_shutdown(&entry).await;
                Err(HubError::ShuttingDown)
            }
            Ok(()) => {
                self.set_status(&entry, AdapterStatus::Connected);
                Ok(self.snapshot(&entry))
            }
            Err(e) => {
                error!("Adapter {} for server {} failed to start: {}", adapter_id, server_id, e);
                entry.instance.write().metadata.last_error = Some(e.to_string());
                self.set_status(&entry, AdapterStatus::Error);
                self.adapters.remove(&adapter_id);
                if let Err(stop_err) = entry.adapter.stop().await {
                    debug!("Cleanup stop of {} failed: {}", adapter_id, stop_err);
                }
                Err(e.scoped(&adapter_id, server_id))
            }
        }
    }

    async fn start_with_timeout(&self, entry: &AdapterEntry) -> HubResult<()> {
        let timeout = self.config.startup_timeout();
        match tokio::time::timeout(timeout, entry.adapter.start()).await {
            Ok(result) => result,
            Err(_) => Err(HubError::RequestTimeout(format!(
                "adapter start timed out after {}s",
                timeout.as_secs()
            ))),
        }
    }

    /// Undo a start that finished after shutdown began; the shutdown drain
    /// may already have stopped this adapter once.
    async fn abandon_for_shutdown(&self, entry: &AdapterEntry) {
        let adapter_id = entry.id();
        self.adapters.remove(&adapter_id);
        if let Err(e) = entry.adapter.stop().await {
            debug!("Stop of {} during shutdown failed: {}", adapter_id, e);
        }
        entry.instance.write().status = AdapterStatus::Disconnected;
        info!("Adapter {} started during shutdown and was stopped", adapter_id);
    }

    /// Stop an adapter that is already out of the registry. Stop failures
    /// are logged, never returned.
    async fn dispose(&self, entry: Arc<AdapterEntry>) {
        let adapter_id = entry.id();
        let server_id = entry.server_id();
        if let Err(e) = entry.adapter.stop().await {
            warn!("Failed to stop adapter {} for {}: {}", adapter_id, server_id, e);
        }
        entry.instance.write().status = AdapterStatus::Disconnected;
        info!("Removed adapter {} for server {}", adapter_id, server_id);
        self.emit(FactoryEvent::AdapterRemoved {
            adapter_id,
            server_id,
        });
    }

    pub async fn send_request(
        &self,
        adapter_id: &str,
        request: AdapterRequest,
    ) -> HubResult<AdapterResponse> {
        let entry = self.entry(adapter_id)?;
        let server_id = {
            let mut instance = entry.instance.write();
            instance.metadata.request_count += 1;
            instance.last_used_at = Utc::now();
            instance.server_id.clone()
        };

        match entry.adapter.send_request(request).await {
            Ok(response) => {
                if let Some(err) = &response.error {
                    entry.record_error(format!("backend error {}: {}", err.code, err.message));
                }
                Ok(response)
            }
            Err(e) => {
                entry.record_error(e.to_string());
                Err(e.scoped(adapter_id, &server_id))
            }
        }
    }

    pub async fn stream_request(
        &self,
        adapter_id: &str,
        request: AdapterRequest,
    ) -> HubResult<ChunkStream> {
        let entry = self.entry(adapter_id)?;
        let server_id = {
            let mut instance = entry.instance.write();
            instance.metadata.request_count += 1;
            instance.last_used_at = Utc::now();
            instance.server_id.clone()
        };

        entry.adapter.stream_request(request).await.map_err(|e| {
            entry.record_error(e.to_string());
            e.scoped(adapter_id, &server_id)
        })
    }

    pub async fn remove_adapter(&self, adapter_id: &str) -> HubResult<()> {
        let (_, entry) = self
            .adapters
            .remove(adapter_id)
            .ok_or_else(|| HubError::NotFound(format!("Adapter not found: {}", adapter_id)))?;
        self.dispose(entry).await;
        Ok(())
    }

    /// Remove every adapter of a server; returns how many were removed
    pub async fn remove_adapters_by_server(&self, server_id: &str) -> usize {
        let ids: Vec<String> = self
            .entries()
            .into_iter()
            .filter(|e| e.server_id() == server_id)
            .map(|e| e.id())
            .collect();

        let mut removed = 0;
        for id in ids {
            if let Some((_, entry)) = self.adapters.remove(&id) {
                self.dispose(entry).await;
                removed += 1;
            }
        }
        removed
    }

    /// Stop and start an adapter in place. Concurrent restarts of the same
    /// adapter queue behind each other.
    pub async fn restart_adapter(&self, adapter_id: &str) -> HubResult<AdapterInstance> {
        let entry = self.entry(adapter_id)?;
        let _restart = entry.restart_lock.lock().await;
        self.restart_locked(&entry).await
    }

    async fn restart_locked(&self, entry: &AdapterEntry) -> HubResult<AdapterInstance> {
        if self.is_shutting_down() {
            return Err(HubError::ShuttingDown);
        }
        let adapter_id = entry.id();
        let server_id = entry.server_id();
        info!("Restarting adapter {} for server {}", adapter_id, server_id);

        self.set_status(entry, AdapterStatus::Reconnecting);
        if let Err(e) = entry.adapter.stop().await {
            warn!("Stop before restart of {} failed: {}", adapter_id, e);
        }
        if self.is_shutting_down() {
            entry.instance.write().status = AdapterStatus::Disconnected;
            return Err(HubError::ShuttingDown);
        }

        match self.start_with_timeout(entry).await {
            Ok(()) if self.is_shutting_down() => {
                self.abandon_for_shutdown(entry).await;
                Err(HubError::ShuttingDown)
            }
            Ok(()) => {
                entry.instance.write().metadata.restart_count += 1;
                self.set_status(entry, AdapterStatus::Connected);
                self.emit(FactoryEvent::AdapterRestarted {
                    adapter_id: adapter_id.clone(),
                    server_id,
                });
                let mut instance = entry.instance.read().clone();
                instance.metadata.uptime_ms = uptime_ms(instance.created_at);
                Ok(instance)
            }
            Err(e) => {
                error!("Restart of adapter {} failed: {}", adapter_id, e);
                entry.instance.write().metadata.last_error = Some(e.to_string());
                self.set_status(entry, AdapterStatus::Error);
                Err(e.scoped(&adapter_id, &server_id))
            }
        }
    }

    /// Spawn the periodic health check. Calling it twice is a no-op.
    pub fn start_health_monitor(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() || self.is_shutting_down() {
            return;
        }

        let factory: Weak<Self> = Arc::downgrade(self);
        let token = self.monitor_token.clone();
        let period = self.config.health_check_interval();
        info!("Starting adapter health monitor every {}s", period.as_secs());

        *monitor = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(factory) = factory.upgrade() else {
                    break;
                };
                factory.check_health().await;
            }
            debug!("Adapter health monitor stopped");
        }));
    }

    /// One supervision pass over every registered adapter
    pub async fn check_health(&self) {
        if self.is_shutting_down() {
            return;
        }
        let entries = self.entries();
        join_all(entries.iter().map(|entry| self.check_one(entry))).await;
    }

    async fn check_one(&self, entry: &AdapterEntry) {
        let Ok(restart) = entry.restart_lock.try_lock() else {
            return;
        };
        if entry.instance.read().status == AdapterStatus::Initializing {
            return;
        }
        self.set_status(entry, entry.adapter.status());
        if entry.instance.read().status == AdapterStatus::Reconnecting {
            return;
        }

        let health = entry.adapter.health().await;
        let (adapter_id, server_id) = {
            let mut instance = entry.instance.write();
            instance.metadata.uptime_ms = uptime_ms(instance.created_at);
            (instance.id.clone(), instance.server_id.clone())
        };

        if health.status != HealthStatus::Unhealthy {
            return;
        }

        warn!(
            "Health check failed for adapter {} ({}): {}",
            adapter_id,
            server_id,
            health.error.as_deref().unwrap_or("unhealthy")
        );
        self.emit(FactoryEvent::HealthCheckFailed {
            adapter_id: adapter_id.clone(),
            server_id,
            error: health.error.clone(),
        });

        if self.config.auto_restart {
            if let Err(e) = self.restart_locked(entry).await {
                warn!("Automatic restart of {} failed: {}", adapter_id, e);
            }
        }
        drop(restart);
    }

    /// Stop accepting work, stop every adapter concurrently and clear the
    /// registry. Individual stop failures are logged.
    pub async fn graceful_shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down adapter factory");

        self.monitor_token.cancel();
        let monitor = self.monitor.lock().take();
        if let Some(handle) = monitor {
            let _ = handle.await;
        }

        let entries: Vec<Arc<AdapterEntry>> = {
            let _registration = self.registration.lock();
            let entries = self.entries();
            self.adapters.clear();
            entries
        };
        let count = entries.len();
        join_all(entries.into_iter().map(|entry| self.dispose(entry))).await;

        info!("Adapter factory shut down ({} adapters stopped)", count);
        self.emit(FactoryEvent::Shutdown);
    }

    pub fn get_adapter(&self, adapter_id: &str) -> Option<AdapterInstance> {
        self.adapters.get(adapter_id).map(|e| self.snapshot(e.value()))
    }

    pub fn get_adapters_by_server(&self, server_id: &str) -> Vec<AdapterInstance> {
        self.entries()
            .iter()
            .filter(|e| e.server_id() == server_id)
            .map(|e| self.snapshot(e))
            .collect()
    }

    pub fn list_adapters(&self) -> Vec<AdapterInstance> {
        let mut adapters: Vec<AdapterInstance> =
            self.entries().iter().map(|e| self.snapshot(e)).collect();
        adapters.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        adapters
    }

    /// First live adapter of a server
    pub fn adapter_for_server(&self, server_id: &str) -> Option<AdapterInstance> {
        self.get_adapters_by_server(server_id)
            .into_iter()
            .find(AdapterInstance::is_live)
    }

    pub async fn get_health(&self, adapter_id: &str) -> HubResult<AdapterHealth> {
        let entry = self.entry(adapter_id)?;
        Ok(entry.adapter.health().await)
    }

    /// Health of the server's live adapter, or its most recent one; unknown
    /// when the server has none.
    pub async fn get_server_health(&self, server_id: &str) -> AdapterHealth {
        let instance = self
            .adapter_for_server(server_id)
            .or_else(|| self.get_adapters_by_server(server_id).into_iter().next());
        match instance {
            Some(instance) => self
                .get_health(&instance.id)
                .await
                .unwrap_or_else(|e| AdapterHealth::unknown(Some(e.to_string()))),
            None => AdapterHealth::unknown(Some(format!("no adapter for server {}", server_id))),
        }
    }

    pub fn get_adapter_statistics(&self) -> AdapterStatistics {
        let adapters = self.list_adapters();
        let mut stats = AdapterStatistics {
            total: adapters.len(),
            ..Default::default()
        };

        let mut uptime_total: u64 = 0;
        for adapter in &adapters {
            *stats.by_protocol.entry(adapter.protocol).or_insert(0) += 1;
            *stats.by_status.entry(adapter.status).or_insert(0) += 1;
            stats.total_requests += adapter.metadata.request_count;
            stats.total_errors += adapter.metadata.error_count;
            uptime_total += adapter.metadata.uptime_ms;
        }
        if !adapters.is_empty() {
            stats.average_uptime_ms = uptime_total / adapters.len() as u64;
        }
        stats
    }
}

fn uptime_ms(created_at: DateTime<Utc>) -> u64 {
    (Utc::now() - created_at).num_milliseconds().max(0) as u64
}

impl Drop for AdapterFactory {
    fn drop(&mut self) {
        self.monitor_token.cancel();
    }
}
