pub mod circuit_breaker;
pub mod directory;
pub mod factory;
pub mod framing;
pub mod load_balancer;
pub mod pending;
pub mod protocol;
pub mod request_id;
pub mod routing;
pub mod selector;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus, CircuitState};
pub use directory::{
    Endpoint, HubDirectory, HubServer, InMemoryDirectory, RoutingRule, RuleCondition, ServerGroup,
    ServerStatus,
};
pub use factory::{
    AdapterConnector, AdapterFactory, AdapterInstance, AdapterMetadata, AdapterStatistics,
    DefaultConnector, FactoryEvent,
};
pub use load_balancer::{LoadBalancer, LoadBalancerStatistics, LoadBalancingStrategy};
pub use protocol::{AdapterRequest, AdapterResponse, RequestId, ResponseError, StreamChunk};
pub use request_id::{instance_id, RequestIdGenerator};
pub use routing::{Router, ToolCallResult, ToolDefinition, ToolParameter};
pub use selector::{FirstActiveSelector, ServerSelector};
