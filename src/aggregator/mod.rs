//! Aggregator core: one MCP front, many MCP children.
//!
//! This module handles:
//! - Parsing and encoding public tool names (`mcp__syntropy__<server>_<tool>`)
//! - Routing server segments to pool keys
//! - Pooling child connections (lazy spawn, eager warm-up, health checks)
//! - Forwarding calls and shutting the children down cleanly
//!
//! Child I/O itself lives in [`crate::mcp_client`].

pub mod codec;
pub mod config;
pub mod eager;
pub mod errors;
pub mod health;
pub mod pool;
pub mod router;
pub mod routes;
pub mod shutdown;
pub mod tool_state;

#[cfg(test)]
pub(crate) mod testing;

/// Tracing target for every aggregator event.
pub const LOG_TARGET: &str = "syntropy";

// Re-exports for convenience
pub use config::{find_config_path, load_config, AggregatorConfig};
pub use eager::{EagerInit, EagerOptions, EagerReport};
pub use errors::{ConfigError, ParseError, RouteError, ToolStateError};
pub use health::{Health, HealthPolicy, HealthStatus};
pub use pool::{ClientPool, ConnectionState, PoolEntryStatus};
pub use router::{RequestRouter, RouterError};
pub use routes::RouteTable;
pub use shutdown::{LifecycleManager, ShutdownFlag, ShutdownReason, ShutdownSummary};
pub use tool_state::{ToolState, ToolStateStore};
