use crate::core::directory::HubServer;

/// Picks one server out of a candidate list and hears back about the outcome
///
/// The router always has one of these; the default takes the first active
/// candidate, while `LoadBalancer` applies its configured strategy.
pub trait ServerSelector: Send + Sync {
    fn select(&self, candidates: &[HubServer], group_id: Option<&str>) -> Option<HubServer>;

    /// Whether a server may receive a call at all, however it was picked
    fn is_eligible(&self, server: &HubServer) -> bool {
        server.is_active()
    }

    fn record_success(&self, _server_id: &str) {}

    fn record_failure(&self, _server_id: &str) {}

    fn connection_started(&self, _server_id: &str) {}

    fn connection_finished(&self, _server_id: &str) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FirstActiveSelector;

impl ServerSelector for FirstActiveSelector {
    fn select(&self, candidates: &[HubServer], _group_id: Option<&str>) -> Option<HubServer> {
        candidates.iter().find(|s| s.is_active()).cloned()
    }
}
