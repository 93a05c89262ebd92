//! Correlation and instance identifiers
//!
//! Each adapter owns one generator, so `<server_id>-N` ids are unique per
//! backend connection and readable in logs.

use crate::core::protocol::{AdapterRequest, RequestId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Hands out correlation ids for one adapter. Clones share the counter.
#[derive(Clone, Debug)]
pub struct RequestIdGenerator {
    next: Arc<AtomicU64>,
    prefix: Option<Arc<str>>,
}

impl RequestIdGenerator {
    /// Bare numeric ids starting at 1
    pub fn new() -> Self {
        Self {
            next: Arc::new(AtomicU64::new(1)),
            prefix: None,
        }
    }

    /// String ids of the form `<prefix>-N`
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            next: Arc::new(AtomicU64::new(1)),
            prefix: Some(Arc::from(prefix.into())),
        }
    }

    pub fn next_id(&self) -> RequestId {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        match &self.prefix {
            Some(prefix) => RequestId::String(format!("{}-{}", prefix, n)),
            None => RequestId::Number(n as i64),
        }
    }

    /// Returns the request's id, minting one first if the caller left it empty.
    pub fn assign(&self, request: &mut AdapterRequest) -> RequestId {
        request.id.get_or_insert_with(|| self.next_id()).clone()
    }

    /// Number of ids issued so far
    pub fn issued(&self) -> u64 {
        self.next.load(Ordering::Relaxed) - 1
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Globally unique id for a registered adapter instance
pub fn instance_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prefixed_ids_count_up() {
        let ids = RequestIdGenerator::with_prefix("weather");
        assert_eq!(ids.next_id(), RequestId::String("weather-1".to_string()));
        assert_eq!(ids.next_id(), RequestId::String("weather-2".to_string()));
        assert_eq!(ids.issued(), 2);
    }

    #[test]
    fn test_assign_keeps_caller_id() {
        let ids = RequestIdGenerator::with_prefix("fs");
        let mut preset = AdapterRequest::with_id("ping", None, RequestId::from("mine"));
        assert_eq!(ids.assign(&mut preset), RequestId::from("mine"));
        assert_eq!(ids.issued(), 0);

        let mut fresh = AdapterRequest::new("tools/call", Some(json!({"name": "read"})));
        assert_eq!(ids.assign(&mut fresh), RequestId::String("fs-1".to_string()));
        assert_eq!(fresh.id, Some(RequestId::String("fs-1".to_string())));
    }

    #[test]
    fn test_instance_ids_are_unique() {
        assert_ne!(instance_id(), instance_id());
    }
}
