//! Front MCP method dispatch.
//!
//! One [`FrontHandler`] answers every request the client sends. Child tools
//! are advertised under their public names; calls whose server segment is
//! `syntropy` go to the built-in tools, everything else to the router.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use super::builtins::BuiltinTool;
use super::errors::InvalidCall;
use crate::aggregator::codec::{self, BUILTIN_SERVER, EXAMPLE_TOOL_NAME};
use crate::aggregator::pool::elapsed_ms;
use crate::aggregator::{EagerInit, HealthPolicy, RequestRouter, ToolStateStore, LOG_TARGET};
use crate::mcp_client::types::{
    error_codes, IncomingMessage, JsonRpcError, McpToolDefinition, OutgoingResponse,
    PROTOCOL_VERSION,
};

/// `tools/call` parameters.
#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
}

/// Tools advertised by one routed server.
#[derive(Debug, Clone)]
pub(crate) struct ServerTools {
    pub server: String,
    pub tools: Vec<McpToolDefinition>,
}

/// Answers front-side MCP requests.
pub struct FrontHandler {
    pub(crate) router: RequestRouter,
    pub(crate) tool_state: Arc<ToolStateStore>,
    pub(crate) health: HealthPolicy,
    pub(crate) eager: Option<EagerInit>,
}

impl FrontHandler {
    pub fn new(router: RequestRouter, tool_state: Arc<ToolStateStore>, health: HealthPolicy) -> Self {
        Self {
            router,
            tool_state,
            health,
            eager: None,
        }
    }

    /// Attach the eager initializer so health reports can include its result.
    pub fn with_eager(mut self, eager: EagerInit) -> Self {
        self.eager = Some(eager);
        self
    }

    /// Handle one message. Notifications produce no response.
    pub async fn handle(&self, message: IncomingMessage) -> Option<OutgoingResponse> {
        let Some(id) = message.id else {
            tracing::debug!(target: LOG_TARGET, method = %message.method, "notification");
            return None;
        };

        let params = message.params.unwrap_or_else(|| json!({}));
        let result = match message.method.as_str() {
            "initialize" => Ok(self.initialize()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.tools_list().await),
            "tools/call" => self.tools_call(params).await,
            other => Err(JsonRpcError {
                code: error_codes::METHOD_NOT_FOUND,
                message: format!("Method not found: {other}"),
                data: None,
            }),
        };

        Some(match result {
            Ok(value) => OutgoingResponse::success(id, value),
            Err(error) => OutgoingResponse::failure(id, error),
        })
    }

    fn initialize(&self) -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {"tools": {"listChanged": false}},
            "serverInfo": {
                "name": "syntropy",
                "version": env!("CARGO_PKG_VERSION"),
            },
        })
    }

    /// Built-ins plus the tools of every connected child, minus disabled ones.
    async fn tools_list(&self) -> Value {
        let mut tools: Vec<McpToolDefinition> = BuiltinTool::definitions();
        for server in self.child_tools().await {
            tools.extend(server.tools.into_iter().map(|tool| McpToolDefinition {
                name: codec::public_tool_name(&server.server, &tool.name),
                ..tool
            }));
        }
        tools.retain(|tool| self.tool_state.is_enabled(&tool.name));
        json!({ "tools": tools })
    }

    async fn tools_call(&self, params: Value) -> Result<Value, JsonRpcError> {
        let call = CallParams::deserialize(&params).map_err(|e| {
            InvalidCall::new(format!("invalid tools/call params: {e}"))
                .expected(r#"{"name": "<tool name>", "arguments": {...}}"#)
                .received(params.to_string())
                .example(json!({"name": EXAMPLE_TOOL_NAME, "arguments": {}}).to_string())
                .hint("`name` is required and must be a string")
                .hint("`arguments` is optional and must be an object")
        })?;
        let arguments = call.arguments.unwrap_or_else(|| json!({}));

        if let Ok(id) = codec::parse(&call.name) {
            if id.server == BUILTIN_SERVER {
                return self.call_builtin(&call.name, &id.tool, arguments).await;
            }
        }

        if !self.tool_state.is_enabled(&call.name) {
            let enable = BuiltinTool::EnableTools.public_name();
            return Err(InvalidCall::new(format!("tool '{}' is disabled", call.name))
                .expected("an enabled tool")
                .received(call.name.as_str())
                .example(format!("{enable} {}", json!({"enable": [call.name]})))
                .hint(format!("Re-enable it with {enable}"))
                .hint(format!(
                    "{} shows which tools are enabled",
                    BuiltinTool::ListAllTools.public_name()
                ))
                .into());
        }

        self.router
            .handle(&call.name, arguments)
            .await
            .map_err(|e| e.to_jsonrpc())
    }

    /// Native tool lists of every ready child, one entry per routed server.
    ///
    /// Never spawns: lazy servers contribute nothing until first used. A
    /// child whose transport breaks while listing is invalidated.
    pub(crate) async fn child_tools(&self) -> Vec<ServerTools> {
        let timeout = self.health.timeout();
        let ready = self.router.pool().ready_connections();

        let lists = self.router.routes().entries().filter_map(|(server, pool_key)| {
            let (_, transport) = ready.iter().find(|(key, _)| key == pool_key)?;
            let transport = Arc::clone(transport);
            let server = server.to_string();
            let pool_key = pool_key.to_string();
            Some(async move {
                let result = tokio::time::timeout(timeout, transport.list_tools()).await;
                match result {
                    Ok(Ok(tools)) => Some(ServerTools { server, tools }),
                    Ok(Err(e)) => {
                        if e.is_transport_failure() {
                            self.router.pool().mark_failed(&pool_key, &transport, &e.to_string());
                        }
                        tracing::warn!(target: LOG_TARGET, pool_key = %pool_key, error = %e, "tools/list failed");
                        None
                    }
                    Err(_) => {
                        tracing::warn!(
                            target: LOG_TARGET,
                            pool_key = %pool_key,
                            timeout_ms = elapsed_ms(timeout),
                            "tools/list timed out"
                        );
                        None
                    }
                }
            })
        });

        futures::future::join_all(lists)
            .await
            .into_iter()
            .flatten()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::testing::{fake_router, FakeSpawner};

    fn handler(spawner: Arc<FakeSpawner>) -> FrontHandler {
        FrontHandler::new(
            fake_router(spawner),
            Arc::new(ToolStateStore::in_memory()),
            HealthPolicy::default(),
        )
    }

    fn request(id: u64, method: &str, params: Value) -> IncomingMessage {
        IncomingMessage {
            id: Some(json!(id)),
            method: method.to_string(),
            params: Some(params),
        }
    }

    fn tool_names(response: &OutgoingResponse) -> Vec<String> {
        response.result.as_ref().unwrap()["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_initialize_reports_protocol() {
        let handler = handler(Arc::new(FakeSpawner::new()));
        let response = handler.handle(request(1, "initialize", json!({}))).await.unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(result["serverInfo"]["name"], "syntropy");
    }

    #[tokio::test]
    async fn test_notification_has_no_response() {
        let handler = handler(Arc::new(FakeSpawner::new()));
        let message = IncomingMessage {
            id: None,
            method: "notifications/initialized".into(),
            params: None,
        };
        assert!(handler.handle(message).await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let handler = handler(Arc::new(FakeSpawner::new()));
        let response = handler.handle(request(2, "resources/list", json!({}))).await.unwrap();
        assert_eq!(response.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_tools_list_includes_ready_children_only() {
        let spawner = Arc::new(FakeSpawner::new());
        let handler = handler(spawner.clone());

        let before = handler.handle(request(1, "tools/list", json!({}))).await.unwrap();
        let names = tool_names(&before);
        assert!(names.contains(&"mcp__syntropy__syntropy_healthcheck".to_string()));
        assert!(!names.iter().any(|n| n.starts_with("mcp__syntropy__alpha_")));
        assert_eq!(spawner.spawn_count("syn-beta"), 0);

        handler.router.pool().get_client("syn-alpha").await.unwrap();
        let after = handler.handle(request(2, "tools/list", json!({}))).await.unwrap();
        let names = tool_names(&after);
        assert!(names.contains(&"mcp__syntropy__alpha_echo".to_string()));
        assert!(names.contains(&"mcp__syntropy__alpha_dothing".to_string()));
    }

    #[tokio::test]
    async fn test_tools_call_forwards_to_child() {
        let handler = handler(Arc::new(FakeSpawner::new()));
        let response = handler
            .handle(request(
                3,
                "tools/call",
                json!({"name": "mcp__syntropy__beta_dothing", "arguments": {"x": 1}}),
            ))
            .await
            .unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["echo"], json!({"name": "dothing", "arguments": {"x": 1}}));
    }

    #[tokio::test]
    async fn test_router_error_carries_troubleshooting() {
        let handler = handler(Arc::new(FakeSpawner::new()));
        let response = handler
            .handle(request(4, "tools/call", json!({"name": "garbage"})))
            .await
            .unwrap();
        let error = response.error.unwrap();
        assert_eq!(error.code, error_codes::INVALID_PARAMS);
        let data = error.data.unwrap();
        assert!(data["message"].as_str().unwrap().contains("mcp__syntropy__"));
        assert!(data["troubleshooting"].is_array());
    }

    #[tokio::test]
    async fn test_disabled_tool_hidden_and_refused() {
        let handler = handler(Arc::new(FakeSpawner::new()));
        handler.router.pool().get_client("syn-alpha").await.unwrap();
        handler
            .tool_state
            .update(&[], &["mcp__syntropy__alpha_dothing".to_string()])
            .unwrap();

        let list = handler.handle(request(1, "tools/list", json!({}))).await.unwrap();
        let names = tool_names(&list);
        assert!(names.contains(&"mcp__syntropy__alpha_echo".to_string()));
        assert!(!names.contains(&"mcp__syntropy__alpha_dothing".to_string()));

        let call = handler
            .handle(request(2, "tools/call", json!({"name": "mcp__syntropy__alpha_dothing"})))
            .await
            .unwrap();
        let error = call.error.unwrap();
        assert!(error.message.contains("disabled"));
        let data = error.data.unwrap();
        assert_eq!(data["received"], "mcp__syntropy__alpha_dothing");
        assert_eq!(data["expected"], "an enabled tool");
        assert!(data["example"]
            .as_str()
            .unwrap()
            .starts_with("mcp__syntropy__syntropy_enable_tools"));
        assert!(!data["troubleshooting"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_call_name_is_invalid_params() {
        let handler = handler(Arc::new(FakeSpawner::new()));
        let response = handler
            .handle(request(5, "tools/call", json!({"arguments": {}})))
            .await
            .unwrap();
        let error = response.error.unwrap();
        assert_eq!(error.code, error_codes::INVALID_PARAMS);
        let data = error.data.unwrap();
        assert_eq!(data["received"], r#"{"arguments":{}}"#);
        assert!(data["example"].as_str().unwrap().contains(EXAMPLE_TOOL_NAME));
        assert!(!data["troubleshooting"].as_array().unwrap().is_empty());
    }
}
