//! Plain request/response HTTP transport
//!
//! Unary calls go to `POST <base_url>/request`; streaming calls go to
//! `POST <base_url>/stream` and read an event-stream body line by line until a
//! chunk carries `"done": true`.

use crate::config::types::{join_path, parse_http_url};
use crate::config::HttpConfig;
use crate::core::framing::{Decoded, JsonLineDecoder, LineFormat};
use crate::core::protocol::{AdapterRequest, AdapterResponse, StreamChunk};
use crate::core::RequestIdGenerator;
use crate::transport::build_headers;
use crate::transport::traits::{
    AdapterEvent, AdapterHealth, AdapterStatus, ChunkStream, Protocol, ProtocolAdapter,
};
use crate::utils::errors::{HubError, HubResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Result of the most recent exchange, used for health when no health path is set
#[derive(Debug, Clone)]
enum LastOutcome {
    Reachable,
    Unreachable(String),
}

/// Stateless HTTP adapter with a soft concurrency cap
pub struct HttpAdapter {
    inner: Arc<HttpInner>,
}

struct HttpInner {
    server_id: String,
    config: HttpConfig,
    headers: HeaderMap,
    client: RwLock<Option<reqwest::Client>>,
    status: RwLock<AdapterStatus>,
    in_flight: AtomicUsize,
    last_outcome: RwLock<Option<LastOutcome>>,
    events: broadcast::Sender<AdapterEvent>,
    request_ids: RequestIdGenerator,
}

/// Holds one slot of the concurrency cap until dropped
struct InFlightGuard {
    inner: Arc<HttpInner>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl HttpAdapter {
    pub fn new(server_id: impl Into<String>, config: HttpConfig) -> HubResult<Self> {
        let server_id = server_id.into();
        let headers = build_headers(&config.headers)?;
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            inner: Arc::new(HttpInner {
                request_ids: RequestIdGenerator::with_prefix(server_id.clone()),
                server_id,
                config,
                headers,
                client: RwLock::new(None),
                status: RwLock::new(AdapterStatus::Disconnected),
                in_flight: AtomicUsize::new(0),
                last_outcome: RwLock::new(None),
                events,
            }),
        })
    }

    /// Unary requests plus open streams currently holding a slot
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }
}

impl HttpInner {
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

    fn client(&self) -> HubResult<reqwest::Client> {
        let status = *self.status.read();
        match self.client.read().as_ref() {
            Some(client) if status == AdapterStatus::Connected => Ok(client.clone()),
            _ => Err(HubError::Connection(format!(
                "http adapter for {} is {}",
                self.server_id, status
            ))),
        }
    }

    fn acquire(self: &Arc<Self>) -> HubResult<InFlightGuard> {
        let max = self.config.max_concurrent_requests;
        self.in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < max).then_some(current + 1)
            })
            .map_err(|current| {
                HubError::Capacity(format!(
                    "server {} has {} requests in flight (max {})",
                    self.server_id, current, max
                ))
            })?;
        Ok(InFlightGuard {
            inner: self.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        join_path(&self.config.base_url, path)
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    /// POST with the retry policy: 5xx and connection failures are retried,
    /// 4xx and timeouts are not.
    async fn post_with_retry(
        &self,
        client: &reqwest::Client,
        url: &str,
        body: &str,
        accept: &'static str,
        timeout: Option<Duration>,
    ) -> HubResult<reqwest::Response> {
        let mut attempt = 0u32;
        loop {
            let mut builder = client
                .post(url)
                .headers(self.headers.clone())
                .header(CONTENT_TYPE, "application/json")
                .header(ACCEPT, accept)
                .body(body.to_string());
            if let Some(timeout) = timeout {
                builder = builder.timeout(timeout);
            }

            let failure = match builder.send().await {
                Ok(response) if response.status().is_success() => {
                    *self.last_outcome.write() = Some(LastOutcome::Reachable);
                    return Ok(response);
                }
                Ok(response) if response.status().is_client_error() => {
                    *self.last_outcome.write() = Some(LastOutcome::Reachable);
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    return Err(HubError::Protocol(format!("HTTP {}: {}", status, text)));
                }
                Ok(response) => {
                    *self.last_outcome.write() = Some(LastOutcome::Reachable);
                    HubError::Connection(format!("HTTP {} from {}", response.status(), url))
                }
                Err(e) if e.is_timeout() => {
                    return Err(HubError::RequestTimeout(format!(
                        "POST {} timed out after {}ms",
                        url, self.config.timeout_ms
                    )));
                }
                Err(e) => {
                    let message = format!("Request failed: {}", e);
                    *self.last_outcome.write() = Some(LastOutcome::Unreachable(message.clone()));
                    HubError::Connection(message)
                }
            };

            if attempt >= self.config.retry_attempts {
                return Err(failure);
            }
            attempt += 1;
            warn!(
                "POST {} failed ({}), retry {}/{}",
                url, failure, attempt, self.config.retry_attempts
            );
            tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
        }
    }
}

/// Turn one decoded stream line into a chunk. Lines shaped as
/// `{"data": .., "done": ..}` map directly; anything else is the payload.
fn chunk_from_message(message: Value) -> StreamChunk {
    if message.get("data").is_some() {
        if let Ok(chunk) = serde_json::from_value::<StreamChunk>(message.clone()) {
            return chunk;
        }
    }
    let done = message.get("done").and_then(Value::as_bool).unwrap_or(false);
    StreamChunk {
        data: message,
        done,
    }
}

struct ChunkReader {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    decoder: JsonLineDecoder,
    ready: VecDeque<HubResult<StreamChunk>>,
    finished: bool,
    inner: Arc<HttpInner>,
    _slot: InFlightGuard,
}

impl ChunkReader {
    fn absorb(&mut self, decoded: Vec<Decoded>) {
        for item in decoded {
            if self.finished {
                return;
            }
            match item {
                Decoded::Message(message) => {
                    let chunk = chunk_from_message(message);
                    self.finished = chunk.done;
                    self.ready.push_back(Ok(chunk));
                }
                Decoded::Malformed { line, error } => {
                    warn!("Skipping malformed stream line from {}: {}", self.inner.server_id, error);
                    let _ = self.inner.events.send(AdapterEvent::ParseError { line, error });
                }
            }
        }
    }

    async fn next_chunk(mut self) -> Option<(HubResult<StreamChunk>, Self)> {
        loop {
            if let Some(item) = self.ready.pop_front() {
                return Some((item, self));
            }
            if self.finished {
                return None;
            }
            match self.body.next().await {
                Some(Ok(bytes)) => {
                    let decoded = self.decoder.feed(&bytes);
                    self.absorb(decoded);
                }
                Some(Err(e)) => {
                    self.finished = true;
                    return Some((
                        Err(HubError::Connection(format!("stream body failed: {}", e))),
                        self,
                    ));
                }
                None => {
                    let decoded = self.decoder.finish();
                    self.absorb(decoded);
                    self.finished = true;
                }
            }
        }
    }
}

#[async_trait]
impl ProtocolAdapter for HttpAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    fn status(&self) -> AdapterStatus {
        *self.inner.status.read()
    }

    async fn start(&self) -> HubResult<()> {
        let inner = &self.inner;
        inner.set_status(AdapterStatus::Initializing);

        let built = parse_http_url(&inner.config.base_url, "http adapter base_url").and_then(|_| {
            reqwest::Client::builder()
                .pool_max_idle_per_host(inner.config.max_concurrent_requests)
                .build()
                .map_err(|e| HubError::Configuration(format!("failed to build HTTP client: {}", e)))
        });

        match built {
            Ok(client) => {
                *inner.client.write() = Some(client);
                inner.set_status(AdapterStatus::Connected);
                info!("HTTP adapter ready for {} at {}", inner.server_id, inner.config.base_url);
                Ok(())
            }
            Err(e) => {
                inner.set_status(AdapterStatus::Error);
                Err(e)
            }
        }
    }

    async fn stop(&self) -> HubResult<()> {
        self.inner.set_status(AdapterStatus::Disconnected);
        info!("HTTP adapter for {} stopped", self.inner.server_id);
        Ok(())
    }

    async fn send_request(&self, request: AdapterRequest) -> HubResult<AdapterResponse> {
        let inner = &self.inner;
        let client = inner.client()?;
        let _slot = inner.acquire()?;

        let mut request = request;
        let id = inner.request_ids.assign(&mut request);
        let body = serde_json::to_string(&request)?;

        let url = inner.url("request");
        debug!("Sending HTTP request to {}: {}", url, body);
        let response = inner
            .post_with_retry(&client, &url, &body, "application/json", Some(inner.timeout()))
            .await?;

        let mut message: Value = response
            .json()
            .await
            .map_err(|e| HubError::Protocol(format!("invalid JSON response from {}: {}", url, e)))?;
        if let Value::Object(map) = &mut message {
            if !map.contains_key("id") {
                map.insert("id".to_string(), serde_json::to_value(&id)?);
            }
        }
        serde_json::from_value::<AdapterResponse>(message)
            .map_err(|e| HubError::Protocol(format!("malformed response from {}: {}", url, e)))
    }

    async fn stream_request(&self, request: AdapterRequest) -> HubResult<ChunkStream> {
        let inner = &self.inner;
        let client = inner.client()?;
        let slot = inner.acquire()?;

        let mut request = request;
        inner.request_ids.assign(&mut request);
        let body = serde_json::to_string(&request)?;

        let url = inner.url("stream");
        debug!("Opening HTTP stream at {}: {}", url, body);
        // The body may legitimately outlive timeout_ms, so only the connect
        // phase is bounded here
        let response = tokio::time::timeout(
            inner.timeout(),
            inner.post_with_retry(&client, &url, &body, "text/event-stream", None),
        )
        .await
        .map_err(|_| {
            HubError::RequestTimeout(format!(
                "POST {} timed out after {}ms",
                url, inner.config.timeout_ms
            ))
        })??;

        let reader = ChunkReader {
            body: response.bytes_stream().boxed(),
            decoder: JsonLineDecoder::new(LineFormat::EventStream),
            ready: VecDeque::new(),
            finished: false,
            inner: inner.clone(),
            _slot: slot,
        };
        Ok(stream::unfold(reader, ChunkReader::next_chunk).boxed())
    }

    async fn health(&self) -> AdapterHealth {
        let inner = &self.inner;
        let client = match inner.client() {
            Ok(client) => client,
            Err(e) => return AdapterHealth::unhealthy(e.to_string()),
        };

        if let Some(path) = &inner.config.health_path {
            let url = inner.url(path);
            return match client
                .get(&url)
                .headers(inner.headers.clone())
                .timeout(inner.timeout())
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => AdapterHealth::healthy(),
                Ok(response) => {
                    AdapterHealth::unhealthy(format!("health check returned HTTP {}", response.status()))
                }
                Err(e) => AdapterHealth::unhealthy(format!("health check failed: {}", e)),
            };
        }

        match inner.last_outcome.read().clone() {
            None => AdapterHealth::unknown(None),
            Some(LastOutcome::Reachable) => AdapterHealth::healthy(),
            Some(LastOutcome::Unreachable(error)) => AdapterHealth::unhealthy(error),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.inner.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chunk_from_wrapped_message() {
        let chunk = chunk_from_message(json!({"data": {"n": 1}, "done": true}));
        assert_eq!(chunk.data, json!({"n": 1}));
        assert!(chunk.done);
    }

    #[test]
    fn test_chunk_from_bare_message() {
        let chunk = chunk_from_message(json!({"partial": "abc"}));
        assert_eq!(chunk.data, json!({"partial": "abc"}));
        assert!(!chunk.done);
    }

    #[tokio::test]
    async fn test_requests_rejected_before_start() {
        let adapter = HttpAdapter::new(
            "s1",
            HttpConfig {
                base_url: "http://127.0.0.1:9".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        let err = adapter
            .send_request(AdapterRequest::new("ping", None))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Connection(_)));
        assert_eq!(adapter.status(), AdapterStatus::Disconnected);
    }
}
