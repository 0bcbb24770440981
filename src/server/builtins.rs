//! Aggregator-provided tools under the reserved `syntropy` server segment.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use super::errors::InvalidCall;
use super::handler::FrontHandler;
use crate::aggregator::codec::{self, ToolIdentifier, BUILTIN_SERVER, EXAMPLE_TOOL_NAME, TOOL_PREFIX};
use crate::aggregator::{health, Health};
use crate::mcp_client::types::{error_codes, JsonRpcError, McpToolDefinition};

/// Upper bound accepted for a caller-supplied health check timeout.
const MAX_HEALTH_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinTool {
    Healthcheck,
    ListAllTools,
    EnableTools,
}

impl BuiltinTool {
    const ALL: [BuiltinTool; 3] = [
        BuiltinTool::Healthcheck,
        BuiltinTool::ListAllTools,
        BuiltinTool::EnableTools,
    ];

    fn tool(self) -> &'static str {
        match self {
            BuiltinTool::Healthcheck => "healthcheck",
            BuiltinTool::ListAllTools => "list_all_tools",
            BuiltinTool::EnableTools => "enable_tools",
        }
    }

    fn from_tool(tool: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.tool() == tool)
    }

    /// Full public identifier, e.g. `mcp__syntropy__syntropy_healthcheck`.
    pub fn public_name(self) -> String {
        codec::encode(&ToolIdentifier::new(BUILTIN_SERVER, self.tool()))
    }

    fn definition(self) -> McpToolDefinition {
        let (description, schema) = match self {
            BuiltinTool::Healthcheck => (
                "Check that child MCP servers respond. Starts lazy servers that are checked.",
                json!({
                    "type": "object",
                    "properties": {
                        "servers": {
                            "type": "array",
                            "items": {"type": "string"},
                            "description": "Server names or pool keys to check (default: all)"
                        },
                        "timeout_ms": {
                            "type": "integer",
                            "description": "Per-server check budget in milliseconds"
                        }
                    }
                }),
            ),
            BuiltinTool::ListAllTools => (
                "List every tool of every connected server, including disabled ones, with its enabled flag.",
                json!({"type": "object", "properties": {}}),
            ),
            BuiltinTool::EnableTools => (
                "Enable or disable tools by their full name. Disabled tools are hidden from tools/list.",
                json!({
                    "type": "object",
                    "properties": {
                        "enable": {"type": "array", "items": {"type": "string"}},
                        "disable": {"type": "array", "items": {"type": "string"}}
                    }
                }),
            ),
        };
        McpToolDefinition {
            name: self.public_name(),
            description: Some(description.to_string()),
            input_schema: schema,
        }
    }

    pub fn definitions() -> Vec<McpToolDefinition> {
        Self::ALL.into_iter().map(Self::definition).collect()
    }

    /// A valid `arguments` object for this tool.
    fn example_arguments(self) -> Value {
        match self {
            BuiltinTool::Healthcheck => json!({"servers": ["serena"], "timeout_ms": 2000}),
            BuiltinTool::ListAllTools => json!({}),
            BuiltinTool::EnableTools => json!({"disable": [EXAMPLE_TOOL_NAME]}),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct HealthcheckArgs {
    #[serde(default)]
    servers: Option<Vec<String>>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct EnableToolsArgs {
    #[serde(default)]
    enable: Vec<String>,
    #[serde(default)]
    disable: Vec<String>,
}

fn parse_args<T: for<'de> Deserialize<'de>>(builtin: BuiltinTool, arguments: Value) -> Result<T, JsonRpcError> {
    T::deserialize(&arguments).map_err(|e| {
        let name = builtin.public_name();
        InvalidCall::new(format!("invalid arguments for '{name}': {e}"))
            .expected(builtin.definition().input_schema.to_string())
            .received(arguments.to_string())
            .example(builtin.example_arguments().to_string())
            .hint("Omit a field to use its default")
            .into()
    })
}

fn bad_tool_name(name: &str, reason: impl std::fmt::Display) -> InvalidCall {
    InvalidCall::new(format!(
        "{reason}: expected a full tool name like {EXAMPLE_TOOL_NAME}"
    ))
    .expected(format!("{TOOL_PREFIX}<server>_<tool>"))
    .received(name)
    .example(EXAMPLE_TOOL_NAME)
    .hint(format!(
        "{} lists every valid name",
        BuiltinTool::ListAllTools.public_name()
    ))
}

/// Wrap a JSON report as an MCP text result.
fn text_result(report: Value) -> Value {
    let text = serde_json::to_string_pretty(&report).unwrap_or_else(|_| report.to_string());
    json!({
        "content": [{"type": "text", "text": text}],
        "structuredContent": report,
        "isError": false,
    })
}

impl FrontHandler {
    pub(crate) async fn call_builtin(
        &self,
        name: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<Value, JsonRpcError> {
        let Some(builtin) = BuiltinTool::from_tool(tool) else {
            let known: Vec<String> = BuiltinTool::ALL.iter().map(|b| b.public_name()).collect();
            let expected = format!("one of {}", known.join(", "));
            return Err(InvalidCall::new(format!("unknown built-in tool '{name}': expected {expected}"))
                .expected(expected)
                .received(name)
                .example(BuiltinTool::Healthcheck.public_name())
                .hint(format!("The '{BUILTIN_SERVER}' server segment is reserved for aggregator tools"))
                .into());
        };

        match builtin {
            BuiltinTool::Healthcheck => self.healthcheck(parse_args(builtin, arguments)?).await,
            BuiltinTool::ListAllTools => Ok(self.list_all_tools().await),
            BuiltinTool::EnableTools => self.enable_tools(parse_args(builtin, arguments)?),
        }
    }

    async fn healthcheck(&self, args: HealthcheckArgs) -> Result<Value, JsonRpcError> {
        let routes = self.router.routes();
        let pool = self.router.pool();

        let pool_keys: Vec<String> = match &args.servers {
            Some(names) => names
                .iter()
                .map(|name| match routes.resolve_pool_key(name) {
                    Ok(key) => Ok(key.to_string()),
                    Err(_) if pool.config(name).is_some() => Ok(name.clone()),
                    Err(e) => {
                        let known = routes.servers();
                        let expected = format!("one of: {}", known.join(", "));
                        Err(InvalidCall::new(format!("{e}; known servers: {}", known.join(", ")))
                            .expected(expected)
                            .received(name.as_str())
                            .example(json!({"servers": [known.first().unwrap_or(&"serena")]}).to_string())
                            .hint("Pass server names or pool keys")
                            .hint("Omit `servers` to check every routed server"))
                    }
                })
                .collect::<Result<_, _>>()?,
            None => routes
                .entries()
                .map(|(_, key)| key.to_string())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
        };

        let timeout = args
            .timeout_ms
            .map(|ms| Duration::from_millis(ms.clamp(1, MAX_HEALTH_TIMEOUT_MS)))
            .unwrap_or_else(|| self.health.timeout());

        let statuses = health::check_many(pool, &pool_keys, timeout, &self.health).await;
        let count = |h: Health| statuses.iter().filter(|s| s.status == h).count();

        let servers: Vec<Value> = statuses
            .iter()
            .map(|status| {
                let mut entry = json!(status);
                entry["server"] = json!(routes.server_for_pool_key(&status.pool_key));
                entry["identity"] = json!(routes.identity(&status.pool_key));
                entry
            })
            .collect();

        let mut report = json!({
            "summary": {
                "healthy": count(Health::Healthy),
                "degraded": count(Health::Degraded),
                "down": count(Health::Down),
            },
            "servers": servers,
            "pool": pool.get_status(),
        });
        if let Some(eager) = self.eager.as_ref().and_then(|e| e.peek()) {
            report["eager"] = json!(*eager);
        }
        Ok(text_result(report))
    }

    async fn list_all_tools(&self) -> Value {
        let mut servers: Vec<Value> = Vec::new();
        let listed = self.child_tools().await;

        for (server, pool_key) in self.router.routes().entries() {
            let state = self
                .router
                .pool()
                .state(pool_key)
                .map(|s| s.to_string())
                .unwrap_or_else(|| "not_started".to_string());
            let tools: Vec<Value> = listed
                .iter()
                .filter(|l| l.server == server)
                .flat_map(|l| l.tools.iter())
                .map(|tool| {
                    let public = codec::public_tool_name(server, &tool.name);
                    json!({
                        "name": public,
                        "native_name": tool.name,
                        "description": tool.description,
                        "enabled": self.tool_state.is_enabled(&public),
                    })
                })
                .collect();
            servers.push(json!({
                "server": server,
                "pool_key": pool_key,
                "state": state,
                "tools": tools,
            }));
        }

        let builtins: Vec<Value> = BuiltinTool::ALL
            .iter()
            .map(|b| json!({"name": b.public_name(), "enabled": true}))
            .collect();

        text_result(json!({
            "builtin": builtins,
            "servers": servers,
        }))
    }

    fn enable_tools(&self, args: EnableToolsArgs) -> Result<Value, JsonRpcError> {
        for name in args.enable.iter().chain(args.disable.iter()) {
            codec::parse(name).map_err(|e| bad_tool_name(name, e))?;
        }
        if let Some(name) = args
            .disable
            .iter()
            .find(|n| codec::parse(n).is_ok_and(|id| id.server == BUILTIN_SERVER))
        {
            return Err(InvalidCall::new(format!("built-in tool '{name}' cannot be disabled"))
                .expected("a tool of a child server")
                .received(name.as_str())
                .example(EXAMPLE_TOOL_NAME)
                .hint(format!("Tools under '{TOOL_PREFIX}{BUILTIN_SERVER}_' are always available"))
                .into());
        }

        let state = self
            .tool_state
            .update(&args.enable, &args.disable)
            .map_err(|e| JsonRpcError {
                code: error_codes::INTERNAL_ERROR,
                message: e.to_string(),
                data: None,
            })?;

        Ok(text_result(json!({
            "enabled": state.enabled,
            "disabled": state.disabled,
            "updated_at": state.updated_at,
        })))
    }
}
