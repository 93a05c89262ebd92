use crate::utils::errors::{HubError, HubResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Request envelope written to a backend: `{"method", "params"?, "id"?}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterRequest {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
}

/// Response envelope read from a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
    pub id: RequestId,
}

/// Backend-reported error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Request ID can be string or number
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(i64),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::String(s) => write!(f, "{}", s),
            RequestId::Number(n) => write!(f, "{}", n),
        }
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

/// One element of a streamed response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub data: Value,
    #[serde(default)]
    pub done: bool,
}

impl AdapterRequest {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
            id: None,
        }
    }

    /// Create a new request with a specific ID
    pub fn with_id(method: impl Into<String>, params: Option<Value>, id: RequestId) -> Self {
        Self {
            method: method.into(),
            params,
            id: Some(id),
        }
    }

    pub fn to_line(&self) -> HubResult<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

impl AdapterResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: RequestId, code: i64, message: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(ResponseError {
                code,
                message: message.into(),
                data: None,
            }),
            id,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Collapse the envelope into the backend's result, turning a reported
    /// error into a protocol error. A missing result reads as `null`.
    pub fn into_result(self) -> HubResult<Value> {
        match self.error {
            Some(err) => Err(HubError::Protocol(format!(
                "backend error {}: {}",
                err.code, err.message
            ))),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Extract the correlation id from a raw inbound message, if it has one.
pub fn message_id(message: &Value) -> Option<RequestId> {
    message
        .get("id")
        .and_then(|id| serde_json::from_value::<RequestId>(id.clone()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_omits_absent_fields() {
        let request = AdapterRequest::new("tools/list", None);
        assert_eq!(serde_json::to_string(&request).unwrap(), r#"{"method":"tools/list"}"#);
    }

    #[test]
    fn test_request_line_is_newline_terminated() {
        let request = AdapterRequest::with_id("ping", Some(json!({"a": 1})), RequestId::Number(7));
        let line = request.to_line().unwrap();
        assert_eq!(line, "{\"method\":\"ping\",\"params\":{\"a\":1},\"id\":7}\n");
    }

    #[test]
    fn test_into_result_maps_backend_error() {
        let response = AdapterResponse::error(RequestId::Number(1), -32601, "Method not found");
        let err = response.into_result().unwrap_err();
        assert!(matches!(err, HubError::Protocol(m) if m.contains("-32601")));
    }

    #[test]
    fn test_message_id_accepts_string_and_number() {
        assert_eq!(message_id(&json!({"id": "abc"})), Some(RequestId::from("abc")));
        assert_eq!(message_id(&json!({"id": 3})), Some(RequestId::Number(3)));
        assert_eq!(message_id(&json!({"method": "notify"})), None);
    }
}
