//! Server-push transport: a long-lived SSE stream carries responses and
//! notifications, requests go out as POST `<url>/request`.

use crate::config::types::{join_path, parse_http_url};
use crate::config::StreamConfig;
use crate::core::framing::SseEventDecoder;
use crate::core::pending::{Dispatch, PendingRequests};
use crate::core::protocol::{AdapterRequest, AdapterResponse};
use crate::core::RequestIdGenerator;
use crate::transport::traits::{
    AdapterEvent, AdapterHealth, AdapterStatus, ChunkStream, Protocol, ProtocolAdapter,
};
use crate::transport::{build_headers, single_chunk};
use crate::utils::errors::{HubError, HubResult};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use serde_json::Value;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

/// SSE-backed adapter
pub struct StreamAdapter {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    server_id: String,
    config: StreamConfig,
    endpoint: Url,
    request_url: String,
    headers: HeaderMap,
    client: reqwest::Client,
    pending: PendingRequests,
    lifecycle: Mutex<()>,
    reader: Mutex<Option<JoinHandle<()>>>,
    status: RwLock<AdapterStatus>,
    generation: AtomicU64,
    reconnects: AtomicU32,
    last_activity: RwLock<Option<Instant>>,
    last_error: RwLock<Option<String>>,
    events: broadcast::Sender<AdapterEvent>,
    request_ids: RequestIdGenerator,
}

impl StreamAdapter {
    pub fn new(server_id: impl Into<String>, config: StreamConfig) -> HubResult<Self> {
        let server_id = server_id.into();
        let endpoint = parse_http_url(&config.url, "stream adapter url")?;
        let request_url = join_path(endpoint.as_str(), "request");
        let headers = build_headers(&config.headers)?;

        // No overall timeout: the push stream stays open indefinitely
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| HubError::Configuration(format!("failed to build HTTP client: {}", e)))?;

        let (events, _) = broadcast::channel(64);
        Ok(Self {
            inner: Arc::new(StreamInner {
                request_ids: RequestIdGenerator::with_prefix(server_id.clone()),
                server_id,
                config,
                endpoint,
                request_url,
                headers,
                client,
                pending: PendingRequests::new(),
                lifecycle: Mutex::new(()),
                reader: Mutex::new(None),
                status: RwLock::new(AdapterStatus::Disconnected),
                generation: AtomicU64::new(0),
                reconnects: AtomicU32::new(0),
                last_activity: RwLock::new(None),
                last_error: RwLock::new(None),
                events,
            }),
        })
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }
}

impl StreamInner {
    fn set_status(&self, status: AdapterStatus) {
        let changed = {
            let mut current = self.status.write();
            let changed = *current != status;
            *current = status;
            changed
        };
        if changed {
            let _ = self.events.send(AdapterEvent::StatusChanged(status));
        }
    }

    fn touch(&self) {
        *self.last_activity.write() = Some(Instant::now());
    }

    /// Open the push stream. Caller holds the lifecycle lock.
    async fn open_stream(&self) -> HubResult<(reqwest::Response, u64)> {
        info!("Connecting to SSE endpoint: {}", self.endpoint);

        let response = self
            .client
            .get(self.endpoint.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|e| HubError::Connection(format!("Failed to connect: {}", e)))?;

        if !response.status().is_success() {
            return Err(HubError::Connection(format!(
                "SSE endpoint returned HTTP {}",
                response.status()
            )));
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.touch();
        info!("SSE connection established for {}", self.server_id);
        Ok((response, generation))
    }

    async fn supervise(self: Arc<Self>, response: reqwest::Response, generation: u64) {
        let mut response = response;
        let mut generation = generation;

        loop {
            self.pump(response, generation).await;

            if self.generation.load(Ordering::SeqCst) != generation {
                return;
            }

            warn!("SSE stream for {} ended unexpectedly", self.server_id);
            self.pending.fail_all("stream connection lost");

            match self.reconnect(generation).await {
                Some((next_response, next_generation)) => {
                    response = next_response;
                    generation = next_generation;
                }
                None => return,
            }
        }
    }

    async fn reconnect(&self, lost_generation: u64) -> Option<(reqwest::Response, u64)> {
        loop {
            let attempt = self.reconnects.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > self.config.max_reconnects {
                let message = format!(
                    "server {} unreachable after {} reconnect attempts",
                    self.server_id, self.config.max_reconnects
                );
                error!("{}", message);
                *self.last_error.write() = Some(message.clone());
                self.set_status(AdapterStatus::Error);
                let _ = self.events.send(AdapterEvent::Fatal(message));
                return None;
            }

            self.set_status(AdapterStatus::Reconnecting);
            let _ = self.events.send(AdapterEvent::Reconnecting { attempt });
            tokio::time::sleep(Duration::from_millis(self.config.reconnect_delay_ms)).await;

            let _guard = self.lifecycle.lock().await;
            if self.generation.load(Ordering::SeqCst) != lost_generation {
                return None;
            }
            match self.open_stream().await {
                Ok(opened) => {
                    self.reconnects.store(0, Ordering::SeqCst);
                    self.set_status(AdapterStatus::Connected);
                    return Some(opened);
                }
                Err(e) => {
                    warn!("Reconnect attempt {} for {} failed: {}", attempt, self.server_id, e);
                    *self.last_error.write() = Some(e.to_string());
                }
            }
        }
    }

    async fn pump(&self, response: reqwest::Response, generation: u64) {
        let mut stream = response.bytes_stream();
        let mut decoder = SseEventDecoder::new();

        while let Some(chunk) = stream.next().await {
            if self.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            match chunk {
                Ok(bytes) => {
                    self.touch();
                    for event in decoder.feed(&bytes) {
                        self.handle_data(&event.data);
                    }
                }
                Err(e) => {
                    warn!("SSE stream error for {}: {}", self.server_id, e);
                    *self.last_error.write() = Some(e.to_string());
                    return;
                }
            }
        }

        if let Some(event) = decoder.finish() {
            self.handle_data(&event.data);
        }
        debug!("SSE reader for {} reached end of stream", self.server_id);
    }

    fn handle_data(&self, data: &str) {
        match serde_json::from_str::<Value>(data) {
            Ok(message) => {
                debug!("Received SSE message from {}: {}", self.server_id, message);
                if let Dispatch::Notification(message) = self.pending.dispatch(message) {
                    let _ = self.events.send(AdapterEvent::Notification(message));
                }
            }
            Err(e) => {
                warn!("Failed to parse SSE data from {}: {}", self.server_id, e);
                let _ = self.events.send(AdapterEvent::ParseError {
                    line: data.to_string(),
                    error: e.to_string(),
                });
            }
        }
    }
}

#[async_trait]
impl ProtocolAdapter for StreamAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Stream
    }

    fn status(&self) -> AdapterStatus {
        *self.inner.status.read()
    }

    async fn start(&self) -> HubResult<()> {
        let inner = &self.inner;
        let _guard = inner.lifecycle.lock().await;

        if *inner.status.read() == AdapterStatus::Connected {
            return Ok(());
        }

        inner.set_status(AdapterStatus::Initializing);
        inner.reconnects.store(0, Ordering::SeqCst);

        match inner.open_stream().await {
            Ok((response, generation)) => {
                *inner.last_error.write() = None;
                inner.set_status(AdapterStatus::Connected);
                let handle = tokio::spawn(inner.clone().supervise(response, generation));
                if let Some(previous) = inner.reader.lock().await.replace(handle) {
                    previous.abort();
                }
                Ok(())
            }
            Err(e) => {
                *inner.last_error.write() = Some(e.to_string());
                inner.set_status(AdapterStatus::Error);
                Err(e)
            }
        }
    }

    async fn stop(&self) -> HubResult<()> {
        let inner = &self.inner;
        let _guard = inner.lifecycle.lock().await;

        inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(reader) = inner.reader.lock().await.take() {
            reader.abort();
        }
        inner.pending.fail_all("adapter stopped");
        inner.set_status(AdapterStatus::Disconnected);
        info!("Closed SSE transport for {}", inner.server_id);
        Ok(())
    }

    async fn send_request(&self, request: AdapterRequest) -> HubResult<AdapterResponse> {
        let inner = &self.inner;
        let status = *inner.status.read();
        if status != AdapterStatus::Connected {
            return Err(HubError::Connection(format!(
                "stream adapter for {} is {}",
                inner.server_id, status
            )));
        }

        let mut request = request;
        let id = inner.request_ids.assign(&mut request);
        let body = serde_json::to_string(&request)?;

        let timeout = Duration::from_millis(inner.config.request_timeout_ms);
        let waiter = inner.pending.register(id, timeout)?;
        debug!("Sending SSE request to {}: {}", inner.request_url, body);

        let posted = inner
            .client
            .post(&inner.request_url)
            .headers(inner.headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .timeout(timeout)
            .body(body)
            .send()
            .await;

        match posted {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                waiter.cancel();
                return Err(HubError::Protocol(format!(
                    "request POST returned HTTP {}",
                    response.status()
                )));
            }
            Err(e) => {
                waiter.cancel();
                return Err(HubError::Connection(format!("Request failed: {}", e)));
            }
        }

        waiter.wait().await
    }

    async fn stream_request(&self, request: AdapterRequest) -> HubResult<ChunkStream> {
        let response = self.send_request(request).await?;
        single_chunk(response)
    }

    async fn health(&self) -> AdapterHealth {
        let inner = &self.inner;
        let status = *inner.status.read();
        if status != AdapterStatus::Connected {
            let reason = inner
                .last_error
                .read()
                .clone()
                .unwrap_or_else(|| format!("stream is {}", status));
            return AdapterHealth::unhealthy(reason);
        }

        let window = Duration::from_millis(inner.config.health_check_interval_ms.saturating_mul(2));
        match *inner.last_activity.read() {
            Some(at) if at.elapsed() <= window => AdapterHealth::healthy(),
            _ => AdapterHealth::unhealthy(format!(
                "no stream activity within {}ms",
                window.as_millis()
            )),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.inner.events.subscribe()
    }
}
