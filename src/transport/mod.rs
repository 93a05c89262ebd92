pub mod http;
pub mod stdio;
pub mod stream;
pub mod traits;

pub use http::HttpAdapter;
pub use stdio::StdioAdapter;
pub use stream::StreamAdapter;
pub use traits::{
    AdapterEvent, AdapterHealth, AdapterStatus, ChunkStream, HealthStatus, Protocol,
    ProtocolAdapter,
};

use crate::core::protocol::{AdapterResponse, StreamChunk};
use crate::utils::errors::{HubError, HubResult};
use futures::stream::{self as chunk_stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashMap;

/// Static headers from config, validated once at construction
pub(crate) fn build_headers(headers: &HashMap<String, String>) -> HubResult<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| HubError::Configuration(format!("invalid header name '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| HubError::Configuration(format!("invalid value for header {}: {}", name, e)))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Wrap a unary response as a one-chunk stream for transports without
/// native streaming.
pub(crate) fn single_chunk(response: AdapterResponse) -> HubResult<ChunkStream> {
    let data = response.into_result()?;
    Ok(chunk_stream::once(async move { Ok(StreamChunk { data, done: true }) }).boxed())
}
