//! Request router: one public `tools/call` in, one child `tools/call` out.
//!
//! A request moves through
//! `Received → Parsed → Routed → Connected → Forwarded → Completed`;
//! a failure at any stage becomes a [`RouterError`] that records where it
//! happened and tells the caller what a correct call looks like.
//!
//! Forwarded calls have no timeout of their own: a child that never answers
//! holds its caller until the child dies or the aggregator shuts down.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use thiserror::Error;

use super::codec::{self, TOOL_PREFIX};
use super::pool::{elapsed_ms, ClientPool};
use super::routes::RouteTable;
use super::shutdown::ShutdownFlag;
use super::LOG_TARGET;
use crate::mcp_client::types::{error_codes, JsonRpcError};
use crate::mcp_client::McpError;

// ─── Stages ──────────────────────────────────────────────────────────────────

/// How far a request got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStage {
    Received,
    Parsed,
    Routed,
    Connected,
    Forwarded,
    Completed,
}

impl std::fmt::Display for RequestStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RequestStage::Received => "received",
            RequestStage::Parsed => "parsed",
            RequestStage::Routed => "routed",
            RequestStage::Connected => "connected",
            RequestStage::Forwarded => "forwarded",
            RequestStage::Completed => "completed",
        })
    }
}

// ─── Errors ──────────────────────────────────────────────────────────────────

/// What went wrong with a routed request.
#[derive(Debug, Clone, PartialEq)]
pub enum RouterErrorKind {
    /// The name does not follow `mcp__syntropy__<server>_<tool>`.
    MalformedName,
    /// No route for the server segment.
    UnknownServer,
    /// The child could not be spawned or initialized.
    ServerUnavailable,
    /// The child's transport broke while the call was in flight.
    TransportFailed,
    /// The child answered with a JSON-RPC error.
    ToolFailed { code: i32, data: Option<Value> },
    /// The aggregator is draining.
    ShuttingDown,
}

/// A request-scoped failure, rendered to the client as
/// `{message, troubleshooting}`.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct RouterError {
    pub kind: RouterErrorKind,
    /// Stage the request had reached when it failed (`Errored` from here).
    pub stage: RequestStage,
    pub message: String,
    pub expected: String,
    pub received: String,
    pub example: String,
    pub troubleshooting: Vec<String>,
}

impl RouterError {
    /// JSON-RPC error code for this failure.
    pub fn code(&self) -> i32 {
        match &self.kind {
            RouterErrorKind::MalformedName | RouterErrorKind::UnknownServer => {
                error_codes::INVALID_PARAMS
            }
            RouterErrorKind::ServerUnavailable | RouterErrorKind::TransportFailed => {
                error_codes::SERVER_UNAVAILABLE
            }
            RouterErrorKind::ToolFailed { code, .. } => *code,
            RouterErrorKind::ShuttingDown => error_codes::SHUTTING_DOWN,
        }
    }

    /// Wire form.
    pub fn to_jsonrpc(&self) -> JsonRpcError {
        let mut data = json!({
            "message": self.message,
            "troubleshooting": self.troubleshooting,
            "expected": self.expected,
            "received": self.received,
            "example": self.example,
            "stage": self.stage.to_string(),
        });
        if let RouterErrorKind::ToolFailed { data: Some(child), .. } = &self.kind {
            data["child"] = child.clone();
        }
        JsonRpcError {
            code: self.code(),
            message: self.message.clone(),
            data: Some(data),
        }
    }

    fn malformed(name: &str) -> Self {
        let expected = format!("{TOOL_PREFIX}<server>_<tool>");
        let example = codec::EXAMPLE_TOOL_NAME.to_string();
        Self {
            kind: RouterErrorKind::MalformedName,
            stage: RequestStage::Received,
            message: format!(
                "malformed tool name '{name}': expected {expected}, e.g. {example}"
            ),
            expected,
            received: name.to_string(),
            example,
            troubleshooting: vec![
                format!("Tool names start with '{TOOL_PREFIX}'"),
                "The server segment is separated from the tool by the first '_'".into(),
                format!("Call {TOOL_PREFIX}syntropy_list_all_tools to see every valid name"),
            ],
        }
    }

    fn unknown_server(name: &str, server: &str, known: &[&str]) -> Self {
        let example = known
            .first()
            .map(|s| codec::example_name_for(s))
            .unwrap_or_else(|| codec::EXAMPLE_TOOL_NAME.to_string());
        let expected = format!("one of: {}", known.join(", "));
        Self {
            kind: RouterErrorKind::UnknownServer,
            stage: RequestStage::Parsed,
            message: format!(
                "unknown server '{server}' in '{name}': expected {expected}, e.g. {example}"
            ),
            expected,
            received: server.to_string(),
            example,
            troubleshooting: vec![
                "Server names are case sensitive".into(),
                "Check the `routes` (or `servers`) section of the aggregator config".into(),
            ],
        }
    }

    fn from_child(name: &str, pool_key: &str, stage: RequestStage, err: McpError) -> Self {
        let example = name.to_string();
        let received = err.to_string();
        let (kind, expected, troubleshooting) = match &err {
            McpError::ShuttingDown { .. } => (
                RouterErrorKind::ShuttingDown,
                "a running aggregator".to_string(),
                vec!["The aggregator is shutting down; retry after it restarts".to_string()],
            ),
            McpError::ServerError { code, data, .. } => (
                RouterErrorKind::ToolFailed {
                    code: *code,
                    data: data.clone(),
                },
                "a successful tool result".to_string(),
                vec![
                    format!("Server '{pool_key}' rejected the call; check the tool arguments"),
                ],
            ),
            e if stage == RequestStage::Forwarded && e.is_transport_failure() => (
                RouterErrorKind::TransportFailed,
                format!("a live connection to '{pool_key}'"),
                vec![
                    format!("Server '{pool_key}' stopped responding during the call"),
                    "The connection was reset; the next call starts a fresh child".into(),
                ],
            ),
            _ => (
                RouterErrorKind::ServerUnavailable,
                format!("server '{pool_key}' to start and complete the MCP handshake"),
                vec![
                    format!("Check the `command` and `args` configured for '{pool_key}'"),
                    "Run the command by hand to see its output".into(),
                    format!("Call {TOOL_PREFIX}syntropy_healthcheck for a status report"),
                ],
            ),
        };
        Self {
            kind,
            stage,
            message: format!("call to '{name}' failed: {err}"),
            expected,
            received,
            example,
            troubleshooting,
        }
    }

    fn shutting_down(name: &str) -> Self {
        Self::from_child(
            name,
            "",
            RequestStage::Received,
            McpError::ShuttingDown {
                pool_key: String::new(),
            },
        )
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

/// Forwards public tool calls to the owning child.
#[derive(Clone)]
pub struct RequestRouter {
    routes: Arc<RouteTable>,
    pool: ClientPool,
    shutdown: ShutdownFlag,
}

impl RequestRouter {
    pub fn new(routes: Arc<RouteTable>, pool: ClientPool, shutdown: ShutdownFlag) -> Self {
        Self {
            routes,
            pool,
            shutdown,
        }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn pool(&self) -> &ClientPool {
        &self.pool
    }

    /// Route `name` to its child and return the child's result verbatim.
    ///
    /// A transport failure invalidates the connection so the next call
    /// reconnects; this call is not retried.
    pub async fn handle(&self, name: &str, arguments: Value) -> Result<Value, RouterError> {
        let started = Instant::now();

        if self.shutdown.is_set() {
            return Err(RouterError::shutting_down(name));
        }

        let id = codec::parse(name).map_err(|_| RouterError::malformed(name))?;

        let pool_key = self
            .routes
            .resolve_pool_key(&id.server)
            .map_err(|e| RouterError::unknown_server(name, &e.server, &self.routes.servers()))?;

        tracing::debug!(
            target: LOG_TARGET,
            tool = name,
            pool_key,
            stage = %RequestStage::Routed,
            "routing call"
        );

        let client = self
            .pool
            .get_client(pool_key)
            .await
            .map_err(|e| RouterError::from_child(name, pool_key, RequestStage::Routed, e))?;

        let native = codec::normalize_for_server(&id.server, &id.tool);

        match client.call_tool(&native, arguments).await {
            Ok(result) => {
                self.pool.record_success(pool_key);
                tracing::info!(
                    target: LOG_TARGET,
                    tool = name,
                    pool_key,
                    native = %native,
                    elapsed_ms = elapsed_ms(started.elapsed()),
                    "call completed"
                );
                Ok(result)
            }
            Err(e) => {
                if e.is_transport_failure() {
                    self.pool.mark_failed(pool_key, &client, &e.to_string());
                }
                tracing::warn!(
                    target: LOG_TARGET,
                    tool = name,
                    pool_key,
                    elapsed_ms = elapsed_ms(started.elapsed()),
                    error = %e,
                    "call failed"
                );
                Err(RouterError::from_child(
                    name,
                    pool_key,
                    RequestStage::Forwarded,
                    e,
                ))
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::pool::ConnectionState;
    use crate::aggregator::testing::{fake_router as router, FakeBehavior, FakeSpawner};

    #[tokio::test]
    async fn test_garbage_name_explains_format() {
        let router = router(Arc::new(FakeSpawner::new()));
        let err = router.handle("garbage", json!({})).await.unwrap_err();
        assert_eq!(err.kind, RouterErrorKind::MalformedName);
        assert!(err.message.contains("mcp__syntropy__"));
        assert!(err.message.contains(codec::EXAMPLE_TOOL_NAME));
        assert_eq!(err.received, "garbage");
        assert_eq!(err.code(), error_codes::INVALID_PARAMS);

        let wire = err.to_jsonrpc();
        let data = wire.data.unwrap();
        assert!(data["message"].as_str().unwrap().contains("mcp__syntropy__"));
        assert!(data["troubleshooting"].as_array().unwrap().len() >= 1);
    }

    #[tokio::test]
    async fn test_unknown_server_lists_known_servers() {
        let spawner = Arc::new(FakeSpawner::new());
        let router = router(spawner.clone());
        let err = router
            .handle("mcp__syntropy__gamma_run", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, RouterErrorKind::UnknownServer);
        assert_eq!(err.stage, RequestStage::Parsed);
        assert!(err.expected.contains("alpha"));
        assert!(err.expected.contains("beta"));
        assert_eq!(err.example, "mcp__syntropy__alpha_list_tools");
        assert!(router.pool().get_status().is_empty());
    }

    #[tokio::test]
    async fn test_lazy_server_spawned_on_first_call() {
        let spawner = Arc::new(FakeSpawner::new());
        let router = router(spawner.clone());
        assert_eq!(spawner.spawn_count("syn-beta"), 0);

        let result = router
            .handle("mcp__syntropy__beta_dothing", json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(result["echo"], json!({"name": "dothing", "arguments": {"x": 1}}));
        assert_eq!(spawner.spawn_count("syn-beta"), 1);

        let status = &router.pool().get_status()["syn-beta"];
        assert!(status.connected);
        assert_eq!(status.call_count, 1);
    }

    #[tokio::test]
    async fn test_context7_names_are_hyphenated() {
        let router = router(Arc::new(FakeSpawner::new()));
        let result = router
            .handle("mcp__syntropy__context7_resolve_library_id", json!({"q": "tokio"}))
            .await
            .unwrap();
        assert_eq!(result["echo"]["name"], "resolve-library-id");
    }

    #[tokio::test]
    async fn test_tool_with_underscores_passes_through() {
        let router = router(Arc::new(FakeSpawner::new()));
        let result = router
            .handle("mcp__syntropy__alpha_find__symbol", json!({}))
            .await
            .unwrap();
        assert_eq!(result["echo"]["name"], "find__symbol");
    }

    #[tokio::test]
    async fn test_child_error_keeps_connection() {
        let router = router(Arc::new(FakeSpawner::new()));
        let err = router
            .handle("mcp__syntropy__alpha_reject", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), -32602);
        assert_eq!(err.stage, RequestStage::Forwarded);
        assert_eq!(router.pool().state("syn-alpha"), Some(ConnectionState::Ready));
        assert_eq!(router.pool().get_status()["syn-alpha"].call_count, 0);
    }

    #[tokio::test]
    async fn test_broken_pipe_resets_connection() {
        let spawner = Arc::new(FakeSpawner::new().with_behavior("syn-alpha", FakeBehavior::BrokenPipe));
        let router = router(spawner.clone());

        let err = router
            .handle("mcp__syntropy__alpha_echo", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, RouterErrorKind::TransportFailed);
        assert_eq!(err.code(), error_codes::SERVER_UNAVAILABLE);
        assert_eq!(router.pool().state("syn-alpha"), Some(ConnectionState::Failed));

        // No automatic retry: the next call reconnects.
        let _ = router.handle("mcp__syntropy__alpha_echo", json!({})).await;
        assert_eq!(spawner.spawn_count("syn-alpha"), 2);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_unavailable() {
        let spawner = Arc::new(
            FakeSpawner::new().with_behavior("syn-beta", FakeBehavior::FailSpawn("uvx not found".into())),
        );
        let router = router(spawner);
        let err = router
            .handle("mcp__syntropy__beta_dothing", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, RouterErrorKind::ServerUnavailable);
        assert_eq!(err.stage, RequestStage::Routed);
        assert!(err.message.contains("uvx not found"));
    }

    #[tokio::test]
    async fn test_refuses_while_shutting_down() {
        let spawner = Arc::new(FakeSpawner::new());
        let router = router(spawner.clone());
        router.shutdown.trigger();

        let err = router
            .handle("mcp__syntropy__alpha_echo", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, RouterErrorKind::ShuttingDown);
        assert_eq!(err.code(), error_codes::SHUTTING_DOWN);
        assert_eq!(spawner.spawn_count("syn-alpha"), 0);
    }
}
