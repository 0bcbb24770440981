//! MCP Client: JSON-RPC over stdio transport to child MCP servers.
//!
//! This module handles:
//! - Spawning MCP server child processes and the MCP handshake
//! - JSON-RPC 2.0 communication over process stdio, with concurrent
//!   requests correlated by id
//! - Graceful shutdown of children (notify, wait, kill)
//!
//! The aggregator only depends on the [`ChildTransport`] and
//! [`ChildSpawner`] traits defined here.

pub mod errors;
pub mod lifecycle;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use errors::McpError;
pub use lifecycle::{ChildSpawner, ManagedChild, ProcessSpawner};
pub use transport::{ChildTransport, StdioTransport};
pub use types::{McpToolDefinition, ServerConfig};
