//! Stream adapter tests against an in-process SSE server

mod common;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use common::eventually;
use futures::stream::{self, StreamExt};
use mcp_hub::config::StreamConfig;
use mcp_hub::core::{AdapterRequest, RequestId};
use mcp_hub::transport::{
    AdapterEvent, AdapterStatus, HealthStatus, ProtocolAdapter, StreamAdapter,
};
use mcp_hub::HubError;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Pushed through the channel to end every open event stream
const CLOSE: &str = "__close__";

#[derive(Clone)]
struct Backend {
    push: broadcast::Sender<String>,
    connections: Arc<AtomicUsize>,
    accepting: Arc<AtomicBool>,
}

impl Backend {
    fn send(&self, message: impl Into<String>) {
        let _ = self.push.send(message.into());
    }

    fn drop_streams(&self) {
        self.send(CLOSE);
    }
}

async fn events(State(backend): State<Backend>) -> Response {
    if !backend.accepting.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    backend.connections.fetch_add(1, Ordering::SeqCst);

    let rx = backend.push.subscribe();
    let stream = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(message) if message == CLOSE => return None,
                Ok(message) => return Some((Ok::<_, Infallible>(Event::default().data(message)), rx)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).into_response()
}

/// Accepts the request and answers it on the event stream
async fn request(State(backend): State<Backend>, Json(body): Json<Value>) -> StatusCode {
    match body["method"].as_str() {
        Some("reject") => StatusCode::INTERNAL_SERVER_ERROR,
        Some("silent") => StatusCode::ACCEPTED,
        method => {
            let reply = json!({ "id": body["id"], "result": { "method": method } });
            backend.send(reply.to_string());
            StatusCode::ACCEPTED
        }
    }
}

async fn spawn_backend() -> (String, Backend) {
    let (push, _) = broadcast::channel(64);
    let backend = Backend {
        push,
        connections: Arc::new(AtomicUsize::new(0)),
        accepting: Arc::new(AtomicBool::new(true)),
    };
    let app = Router::new()
        .route("/events", get(events))
        .route("/events/request", post(request))
        .with_state(backend.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}/events", addr), backend)
}

fn config(url: &str) -> StreamConfig {
    StreamConfig {
        url: url.to_string(),
        request_timeout_ms: 2_000,
        max_reconnects: 2,
        reconnect_delay_ms: 20,
        ..Default::default()
    }
}

async fn wait_for<F>(events: &mut broadcast::Receiver<AdapterEvent>, mut pred: F) -> AdapterEvent
where
    F: FnMut(&AdapterEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("expected event did not arrive")
}

#[tokio::test]
async fn test_response_arrives_over_event_stream() {
    let (url, _backend) = spawn_backend().await;
    let adapter = StreamAdapter::new("push", config(&url)).unwrap();
    adapter.start().await.unwrap();
    assert_eq!(adapter.status(), AdapterStatus::Connected);

    let response = adapter
        .send_request(AdapterRequest::new("tools/list", None))
        .await
        .unwrap();
    assert_eq!(response.id, RequestId::String("push-1".to_string()));
    assert_eq!(response.result, Some(json!({"method": "tools/list"})));
    assert_eq!(adapter.pending_requests(), 0);
    assert_eq!(adapter.health().await.status, HealthStatus::Healthy);

    adapter.stop().await.unwrap();
}

#[tokio::test]
async fn test_stream_request_wraps_single_response() {
    let (url, _backend) = spawn_backend().await;
    let adapter = StreamAdapter::new("push", config(&url)).unwrap();
    adapter.start().await.unwrap();

    let chunks: Vec<_> = adapter
        .stream_request(AdapterRequest::new("generate", None))
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(chunks.len(), 1);
    let chunk = chunks.into_iter().next().unwrap().unwrap();
    assert_eq!(chunk.data, json!({"method": "generate"}));
    assert!(chunk.done);
}

#[tokio::test]
async fn test_uncorrelated_events_become_notifications() {
    let (url, backend) = spawn_backend().await;
    let adapter = StreamAdapter::new("push", config(&url)).unwrap();
    let mut events = adapter.subscribe();
    adapter.start().await.unwrap();

    backend.send(json!({"method": "resources/updated"}).to_string());
    let event = wait_for(&mut events, |e| matches!(e, AdapterEvent::Notification(_))).await;
    let AdapterEvent::Notification(message) = event else {
        unreachable!()
    };
    assert_eq!(message["method"], "resources/updated");

    backend.send("{broken");
    let event = wait_for(&mut events, |e| matches!(e, AdapterEvent::ParseError { .. })).await;
    let AdapterEvent::ParseError { line, .. } = event else {
        unreachable!()
    };
    assert_eq!(line, "{broken");
}

#[tokio::test]
async fn test_rejected_post_is_protocol_error() {
    let (url, _backend) = spawn_backend().await;
    let adapter = StreamAdapter::new("push", config(&url)).unwrap();
    adapter.start().await.unwrap();

    let err = adapter
        .send_request(AdapterRequest::new("reject", None))
        .await
        .unwrap_err();
    assert!(matches!(&err, HubError::Protocol(m) if m.contains("500")));
    assert_eq!(adapter.pending_requests(), 0);
}

#[tokio::test]
async fn test_unanswered_request_times_out() {
    let (url, _backend) = spawn_backend().await;
    let mut config = config(&url);
    config.request_timeout_ms = 200;
    let adapter = StreamAdapter::new("push", config).unwrap();
    adapter.start().await.unwrap();

    let err = adapter
        .send_request(AdapterRequest::new("silent", None))
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::RequestTimeout(_)));
    assert_eq!(adapter.pending_requests(), 0);
}

#[tokio::test]
async fn test_lost_stream_fails_pending_and_reconnects() {
    let (url, backend) = spawn_backend().await;
    let mut config = config(&url);
    config.request_timeout_ms = 10_000;
    let adapter = Arc::new(StreamAdapter::new("push", config).unwrap());
    let mut events = adapter.subscribe();
    adapter.start().await.unwrap();

    let caller = {
        let adapter = adapter.clone();
        tokio::spawn(async move { adapter.send_request(AdapterRequest::new("silent", None)).await })
    };
    assert!(eventually(Duration::from_secs(2), || adapter.pending_requests() == 1).await);

    backend.drop_streams();
    let err = caller.await.unwrap().unwrap_err();
    assert!(matches!(&err, HubError::Connection(m) if m.contains("stream connection lost")));

    wait_for(&mut events, |e| matches!(e, AdapterEvent::Reconnecting { attempt: 1 })).await;
    wait_for(&mut events, |e| {
        matches!(e, AdapterEvent::StatusChanged(AdapterStatus::Connected))
    })
    .await;
    assert_eq!(backend.connections.load(Ordering::SeqCst), 2);

    let response = adapter
        .send_request(AdapterRequest::new("ping", None))
        .await
        .unwrap();
    assert_eq!(response.result, Some(json!({"method": "ping"})));
    adapter.stop().await.unwrap();
}

#[tokio::test]
async fn test_reconnect_budget_exhausted() {
    let (url, backend) = spawn_backend().await;
    let adapter = StreamAdapter::new("push", config(&url)).unwrap();
    let mut events = adapter.subscribe();
    adapter.start().await.unwrap();

    backend.accepting.store(false, Ordering::SeqCst);
    backend.drop_streams();

    wait_for(&mut events, |e| matches!(e, AdapterEvent::Reconnecting { attempt: 2 })).await;
    wait_for(&mut events, |e| matches!(e, AdapterEvent::Fatal(_))).await;
    assert_eq!(adapter.status(), AdapterStatus::Error);

    let health = adapter.health().await;
    assert_eq!(health.status, HealthStatus::Unhealthy);
    assert!(health.error.unwrap().contains("reconnect attempts"));
}

#[tokio::test]
async fn test_start_fails_on_error_status() {
    let (url, backend) = spawn_backend().await;
    backend.accepting.store(false, Ordering::SeqCst);
    let adapter = StreamAdapter::new("push", config(&url)).unwrap();

    let err = adapter.start().await.unwrap_err();
    assert!(matches!(&err, HubError::Connection(m) if m.contains("503")));
    assert_eq!(adapter.status(), AdapterStatus::Error);
}

#[tokio::test]
async fn test_idle_stream_reads_unhealthy() {
    let (url, _backend) = spawn_backend().await;
    let mut config = config(&url);
    config.health_check_interval_ms = 25;
    let adapter = StreamAdapter::new("push", config).unwrap();
    adapter.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(120)).await;
    let health = adapter.health().await;
    assert_eq!(health.status, HealthStatus::Unhealthy);
    assert!(health.error.unwrap().contains("no stream activity"));
}

#[tokio::test]
async fn test_stop_then_requests_are_refused() {
    let (url, _backend) = spawn_backend().await;
    let adapter = StreamAdapter::new("push", config(&url)).unwrap();
    adapter.start().await.unwrap();
    adapter.stop().await.unwrap();

    assert_eq!(adapter.status(), AdapterStatus::Disconnected);
    let err = adapter
        .send_request(AdapterRequest::new("ping", None))
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::Connection(_)));
}

#[test]
fn test_invalid_url_is_configuration_error() {
    for url in ["", "not a url", "ftp://example.com/events"] {
        let result = StreamAdapter::new(
            "push",
            StreamConfig {
                url: url.to_string(),
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(HubError::Configuration(_))), "{}", url);
    }
}
