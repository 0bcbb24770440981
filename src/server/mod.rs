//! Front MCP server: what the client talks to.
//!
//! Speaks MCP over newline-delimited JSON-RPC on stdin/stdout. Logging goes
//! to stderr; stdout is reserved for protocol messages.

pub mod builtins;
mod errors;
pub mod handler;
pub mod stdio;

pub use builtins::BuiltinTool;
pub use handler::FrontHandler;
pub use stdio::serve;
