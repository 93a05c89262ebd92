//! mcp-hub: one tool endpoint in front of many stdio, SSE and HTTP tool servers

pub mod config;
pub mod core;
pub mod transport;
pub mod utils;

pub use config::HubConfig;
pub use core::{AdapterFactory, LoadBalancer, Router};
pub use utils::errors::{HubError, HubResult};
