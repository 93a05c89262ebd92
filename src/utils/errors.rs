use thiserror::Error;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("request timeout: {0}")]
    RequestTimeout(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("capacity exceeded: {0}")]
    Capacity(String),

    #[error("routing error: {0}")]
    Routing(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("factory is shutting down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<anyhow::Error> for HubError {
    fn from(e: anyhow::Error) -> Self {
        HubError::Internal(e.to_string())
    }
}

impl HubError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Connection(_) => "CONNECTION_ERROR",
            Self::RequestTimeout(_) => "REQUEST_TIMEOUT",
            Self::Protocol(_) => "PROTOCOL_ERROR",
            Self::Capacity(_) => "CAPACITY_ERROR",
            Self::Routing(_) => "ROUTING_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Only connection failures are worth another attempt; everything else is
    /// either permanent (configuration, 4xx) or scoped to a single request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// Re-surface the error with the adapter and server identifiers embedded in
    /// the message, keeping the variant so callers can still match on it.
    pub fn scoped(self, adapter_id: &str, server_id: &str) -> Self {
        let scope = format!("[adapter {} / server {}]", adapter_id, server_id);
        match self {
            Self::Configuration(m) => Self::Configuration(format!("{} {}", scope, m)),
            Self::Connection(m) => Self::Connection(format!("{} {}", scope, m)),
            Self::RequestTimeout(m) => Self::RequestTimeout(format!("{} {}", scope, m)),
            Self::Protocol(m) => Self::Protocol(format!("{} {}", scope, m)),
            Self::Capacity(m) => Self::Capacity(format!("{} {}", scope, m)),
            Self::Routing(m) => Self::Routing(format!("{} {}", scope, m)),
            Self::NotFound(m) => Self::NotFound(format!("{} {}", scope, m)),
            Self::InvalidRequest(m) => Self::InvalidRequest(format!("{} {}", scope, m)),
            Self::ShuttingDown => Self::ShuttingDown,
            Self::Internal(m) => Self::Internal(format!("{} {}", scope, m)),
            Self::Io(e) => Self::Connection(format!("{} {}", scope, e)),
            Self::Serialization(e) => Self::Protocol(format!("{} {}", scope, e)),
        }
    }
}

pub type HubResult<T> = Result<T, HubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_keeps_variant() {
        let err = HubError::Connection("refused".to_string()).scoped("a-1", "srv");
        assert!(matches!(&err, HubError::Connection(m) if m.contains("adapter a-1") && m.contains("server srv")));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_scoped_maps_io_to_connection() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err = HubError::Io(io).scoped("a-2", "srv");
        assert_eq!(err.error_code(), "CONNECTION_ERROR");
    }
}
