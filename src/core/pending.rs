//! In-flight request bookkeeping shared by the correlating adapters
//!
//! A pending entry is removed by the matching response, its deadline, or a
//! drain on stop/restart/connection loss. The deadline holds even when the
//! caller stops waiting.

use crate::core::protocol::{message_id, AdapterResponse, RequestId};
use crate::utils::errors::{HubError, HubResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

type Completion = oneshot::Sender<HubResult<AdapterResponse>>;

/// Outcome of routing one inbound message
#[derive(Debug)]
pub enum Dispatch {
    /// The message completed a pending request
    Resolved(RequestId),
    /// No pending request claimed it: an out-of-band notification
    Notification(Value),
}

#[derive(Default)]
pub struct PendingRequests {
    entries: Arc<DashMap<RequestId, Completion>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request id that expires after `timeout`. Fails if the id is
    /// already in flight.
    pub fn register(&self, id: RequestId, timeout: Duration) -> HubResult<PendingResponse> {
        let (tx, rx) = oneshot::channel();
        match self.entries.entry(id.clone()) {
            Entry::Occupied(_) => Err(HubError::InvalidRequest(format!(
                "request id {} is already pending",
                id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(tx);
                Ok(PendingResponse {
                    id,
                    rx,
                    timeout,
                    deadline: Instant::now() + timeout,
                    entries: self.entries.clone(),
                    settled: false,
                })
            }
        }
    }

    pub fn remove(&self, id: &RequestId) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Route an inbound message to its waiting request, or hand it back as a
    /// notification when nothing is waiting on its id.
    pub fn dispatch(&self, message: Value) -> Dispatch {
        let Some(id) = message_id(&message) else {
            return Dispatch::Notification(message);
        };
        let Some((_, tx)) = self.entries.remove(&id) else {
            return Dispatch::Notification(message);
        };

        let outcome = serde_json::from_value::<AdapterResponse>(message).map_err(|e| {
            HubError::Protocol(format!("malformed response for request {}: {}", id, e))
        });
        if tx.send(outcome).is_err() {
            debug!("Caller for request {} went away before the response arrived", id);
        }
        Dispatch::Resolved(id)
    }

    /// Fail every in-flight request. Returns how many were drained.
    pub fn fail_all(&self, reason: &str) -> usize {
        let ids: Vec<RequestId> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut drained = 0;
        for id in ids {
            if let Some((_, tx)) = self.entries.remove(&id) {
                let _ = tx.send(Err(HubError::Connection(reason.to_string())));
                drained += 1;
            }
        }
        if drained > 0 {
            warn!("Failed {} pending request(s): {}", drained, reason);
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Receiving half of a registered request
///
/// Dropping it without waiting leaves the entry in place until its deadline,
/// after which it is swept.
pub struct PendingResponse {
    id: RequestId,
    rx: oneshot::Receiver<HubResult<AdapterResponse>>,
    timeout: Duration,
    deadline: Instant,
    entries: Arc<DashMap<RequestId, Completion>>,
    settled: bool,
}

impl PendingResponse {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Wait for the response until the deadline; on timeout the entry is
    /// removed so a late response is treated as a notification.
    pub async fn wait(mut self) -> HubResult<AdapterResponse> {
        let outcome = tokio::time::timeout_at(self.deadline, &mut self.rx).await;
        self.settled = true;
        match outcome {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(HubError::Connection(format!(
                "response channel closed for request {}",
                self.id
            ))),
            Err(_) => {
                self.entries.remove(&self.id);
                Err(HubError::RequestTimeout(format!(
                    "request {} timed out after {}ms",
                    self.id,
                    self.timeout.as_millis()
                )))
            }
        }
    }

    /// Withdraw the request before it reached the backend
    pub fn cancel(mut self) {
        self.entries.remove(&self.id);
        self.settled = true;
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        // closes the sender side, which marks the entry as abandoned
        self.rx.close();
        let entries = self.entries.clone();
        let id = self.id.clone();
        let deadline = self.deadline;
        let sweep = move || {
            if entries.remove_if(&id, |_, tx| tx.is_closed()).is_some() {
                debug!("Request {} expired after its caller went away", id);
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    tokio::time::sleep_until(deadline).await;
                    sweep();
                });
            }
            Err(_) => sweep(),
        }
    }
}
