//! Aggregator error types.

use thiserror::Error;

/// A tool name that does not follow `mcp__syntropy__<server>_<tool>`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}: '{input}'")]
pub struct ParseError {
    /// Always `"malformed-name"`.
    pub reason: &'static str,
    pub input: String,
}

impl ParseError {
    pub(crate) fn malformed(input: &str) -> Self {
        Self {
            reason: "malformed-name",
            input: input.to_string(),
        }
    }
}

/// A server segment with no route.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}: '{server}'")]
pub struct RouteError {
    /// Always `"unknown-server"`.
    pub reason: &'static str,
    pub server: String,
}

impl RouteError {
    pub(crate) fn unknown(server: &str) -> Self {
        Self {
            reason: "unknown-server",
            server: server.to_string(),
        }
    }
}

/// Startup-time configuration failures. Fatal: the aggregator refuses to
/// start.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be found or read.
    #[error("failed to read config {path}: {reason}")]
    Unreadable { path: String, reason: String },

    /// The config file is not valid JSON/YAML for the expected shape.
    #[error("failed to parse config {path}: {reason}")]
    Malformed { path: String, reason: String },

    /// A route targets a pool key with no `servers` entry.
    #[error("route '{server}' targets pool key '{pool_key}', which has no entry in `servers`")]
    MissingServer { server: String, pool_key: String },

    /// A route name the tool name codec cannot address.
    #[error("route name '{server}' is invalid: {reason}")]
    InvalidRoute { server: String, reason: String },

    /// A server entry that cannot produce a child process.
    #[error("server '{pool_key}' is invalid: {reason}")]
    InvalidServer { pool_key: String, reason: String },

    /// Nothing to aggregate.
    #[error("config {path} defines no servers")]
    Empty { path: String },
}

/// Reading or writing the tool-state file failed.
#[derive(Debug, Error)]
pub enum ToolStateError {
    #[error("failed to access tool state {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("tool state {path} is not valid JSON: {reason}")]
    Malformed { path: String, reason: String },
}
