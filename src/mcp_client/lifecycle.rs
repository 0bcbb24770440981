//! Server process lifecycle management.
//!
//! Handles spawning and shutting down MCP server child processes. Each
//! server runs as a separate OS process communicating via JSON-RPC over
//! stdio. The pool reaches this module only through [`ChildSpawner`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};

use super::errors::McpError;
use super::transport::{extract_result, ChildTransport, StdioTransport};
use super::types::{InitializeParams, InitializeResult, McpToolDefinition, ServerConfig, ServerInfo};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Timeout for the initialize handshake.
///
/// Generous because some servers (serena, uvx-launched tools) resolve and
/// install dependencies on first launch.
const INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for graceful shutdown before force-killing.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Number of trailing stderr lines kept for failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

// ─── Spawner Seam ────────────────────────────────────────────────────────────

/// Creates a connected child for a pool key.
///
/// One call is one spawn: implementations must start exactly one process
/// (or equivalent) per invocation.
#[async_trait]
pub trait ChildSpawner: Send + Sync {
    async fn spawn(
        &self,
        pool_key: &str,
        config: &ServerConfig,
    ) -> Result<Arc<dyn ChildTransport>, McpError>;
}

/// Production spawner: launches the configured command and performs the MCP
/// handshake over its stdio.
#[derive(Debug, Default, Clone)]
pub struct ProcessSpawner;

#[async_trait]
impl ChildSpawner for ProcessSpawner {
    async fn spawn(
        &self,
        pool_key: &str,
        config: &ServerConfig,
    ) -> Result<Arc<dyn ChildTransport>, McpError> {
        let child = spawn_server(pool_key, config).await?;
        Ok(Arc::new(child))
    }
}

// ─── ManagedChild ────────────────────────────────────────────────────────────

/// A running MCP server process with its transport.
pub struct ManagedChild {
    name: String,
    process: tokio::sync::Mutex<Child>,
    transport: StdioTransport,
    stderr_tail: StderrTail,
}

impl ManagedChild {
    /// Attempt to gracefully shut down the server, force-killing it when it
    /// does not exit within the grace period.
    pub async fn shutdown(&self) -> Result<(), McpError> {
        // Best-effort: many servers exit on this or on stdin EOF.
        let _ = self.transport.notify("shutdown", None).await;

        let mut process = self.process.lock().await;
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, process.wait()).await {
            Ok(Ok(_)) => Ok(()),
            _ => process.kill().await.map_err(|e| McpError::TransportError {
                server: self.name.clone(),
                reason: format!("failed to kill process: {e}"),
            }),
        }
    }
}

#[async_trait]
impl ChildTransport for ManagedChild {
    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        self.transport.call_tool(name, arguments).await.map_err(|e| {
            if e.is_transport_failure() {
                with_stderr_context(e, &self.stderr_tail)
            } else {
                e
            }
        })
    }

    async fn list_tools(&self) -> Result<Vec<McpToolDefinition>, McpError> {
        self.transport.list_tools().await
    }

    async fn close(&self) -> Result<(), McpError> {
        self.shutdown().await
    }
}

// ─── Spawning ────────────────────────────────────────────────────────────────

/// Spawn a single MCP server process and perform the initialization handshake.
pub async fn spawn_server(name: &str, config: &ServerConfig) -> Result<ManagedChild, McpError> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);

    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    if let Some(dir) = config.cwd.as_deref() {
        cmd.current_dir(dir);
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    // Dropping the handle must never leave an orphan behind.
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
        name: name.to_string(),
        reason: format!("{} {}: {e}", config.command, config.args.join(" ")),
    })?;
    let pid = child.id();

    let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdin".into(),
    })?;

    let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdout".into(),
    })?;

    let stderr_tail = StderrTail::default();
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(drain_stderr(name.to_string(), stderr, stderr_tail.clone()));
    }

    let transport = StdioTransport::new(name, stdin, stdout);

    let server_info = match tokio::time::timeout(INIT_TIMEOUT, initialize(&transport, name)).await
    {
        Ok(Ok(info)) => info,
        Ok(Err(e)) => {
            let _ = child.kill().await;
            return Err(McpError::InitFailed {
                name: name.to_string(),
                reason: format!("{e}{}", stderr_tail.suffix()),
            });
        }
        Err(_) => {
            let _ = child.kill().await;
            return Err(McpError::InitFailed {
                name: name.to_string(),
                reason: format!(
                    "initialization timed out after {}s{}",
                    INIT_TIMEOUT.as_secs(),
                    stderr_tail.suffix()
                ),
            });
        }
    };

    tracing::debug!(
        server = name,
        pid = ?pid,
        child_name = ?server_info.as_ref().and_then(|i| i.name.as_deref()),
        child_version = ?server_info.as_ref().and_then(|i| i.version.as_deref()),
        "child handshake complete"
    );

    Ok(ManagedChild {
        name: name.to_string(),
        process: tokio::sync::Mutex::new(child),
        transport,
        stderr_tail,
    })
}

/// Perform the MCP initialization handshake.
async fn initialize(
    transport: &StdioTransport,
    server_name: &str,
) -> Result<Option<ServerInfo>, McpError> {
    let params = serde_json::to_value(InitializeParams::aggregator()).map_err(|e| {
        McpError::InitFailed {
            name: server_name.to_string(),
            reason: format!("failed to encode initialize params: {e}"),
        }
    })?;

    let response = transport.request("initialize", Some(params)).await?;
    let result = extract_result(response)?;

    let init_result: InitializeResult =
        serde_json::from_value(result).map_err(|e| McpError::InitFailed {
            name: server_name.to_string(),
            reason: format!("failed to parse initialize response: {e}"),
        })?;

    transport.notify("notifications/initialized", None).await?;

    Ok(init_result.server_info)
}

// ─── Stderr Capture ──────────────────────────────────────────────────────────

/// Rolling window of a child's most recent stderr lines.
#[derive(Clone, Default)]
struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl StderrTail {
    fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn snapshot(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Format a stderr suffix for error messages (empty string if no stderr).
    fn suffix(&self) -> String {
        let stderr = self.snapshot();
        if stderr.trim().is_empty() {
            String::new()
        } else {
            format!(" | stderr: {}", stderr.trim())
        }
    }
}

/// Forward child stderr to the log and keep the tail for error context.
///
/// Draining also keeps a chatty child from blocking on a full pipe.
async fn drain_stderr(name: String, stderr: ChildStderr, tail: StderrTail) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(server = %name, "{line}");
        tail.push(line);
    }
}

fn with_stderr_context(err: McpError, tail: &StderrTail) -> McpError {
    match err {
        McpError::TransportError { server, reason } => McpError::TransportError {
            server,
            reason: format!("{reason}{}", tail.suffix()),
        },
        other => other,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
