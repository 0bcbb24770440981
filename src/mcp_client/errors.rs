//! Child MCP client error types.

use thiserror::Error;

/// Errors raised while spawning, handshaking with, or talking to a child
/// MCP server.
///
/// `Clone` because a single in-flight connection attempt hands the same
/// outcome to every caller waiting on it.
#[derive(Debug, Clone, Error)]
pub enum McpError {
    /// A server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// The initialization handshake failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed { name: String, reason: String },

    /// JSON-RPC communication error (malformed message, broken pipe, EOF).
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The pool has no configuration for the requested key.
    #[error("no server configured for pool key '{pool_key}'")]
    NotConfigured { pool_key: String },

    /// The pool is draining; no new connections are handed out.
    #[error("pool is shutting down, refusing connection to '{pool_key}'")]
    ShuttingDown { pool_key: String },
}

impl McpError {
    /// Whether the error means the underlying transport is unusable and the
    /// connection must be re-established.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, McpError::TransportError { .. })
    }
}
