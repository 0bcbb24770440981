//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with MCP server child processes:
//! - Writing JSON-RPC requests to stdin through a single writer task
//! - Reading JSON-RPC responses from stdout on a reader task that routes
//!   each response to its waiting caller by request id
//! - Line-delimited JSON protocol (one JSON object per line)
//!
//! Several callers may have requests in flight on the same transport; the
//! completion order is whatever order the child answers in.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};

use super::errors::McpError;
use super::types::{JsonRpcRequest, JsonRpcResponse, McpToolDefinition, ToolsListResult};

// ─── Child Transport Seam ───────────────────────────────────────────────────

/// The operations the aggregator needs from one connected child server.
///
/// The pool, health checker and router only ever see this trait, so the
/// pooling logic is independent of how the child is actually reached.
#[async_trait]
pub trait ChildTransport: Send + Sync {
    /// Forward a `tools/call` and return the child's result payload verbatim.
    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError>;

    /// Issue `tools/list`.
    async fn list_tools(&self) -> Result<Vec<McpToolDefinition>, McpError>;

    /// Release the connection and terminate the child.
    async fn close(&self) -> Result<(), McpError>;
}

// ─── Transport ───────────────────────────────────────────────────────────────

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    next_id: AtomicU64,
    pending: PendingMap,
    writer_tx: mpsc::Sender<String>,
    closed: Arc<AtomicBool>,
}

impl StdioTransport {
    /// Create a transport from a child's stdin (writer) and stdout (reader).
    ///
    /// Spawns the writer and reader tasks; both end when the pipes close.
    pub fn new<W, R>(server_name: &str, writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
    {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let (writer_tx, writer_rx) = mpsc::channel::<String>(64);

        tokio::spawn(write_loop(
            server_name.to_string(),
            writer,
            writer_rx,
            Arc::clone(&closed),
        ));
        tokio::spawn(read_loop(
            server_name.to_string(),
            reader,
            Arc::clone(&pending),
            Arc::clone(&closed),
        ));

        Self {
            server_name: server_name.to_string(),
            next_id: AtomicU64::new(1),
            pending,
            writer_tx,
            closed,
        }
    }

    /// Whether either pipe has been observed closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send a JSON-RPC request and wait for the matching response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        if self.is_closed() {
            return Err(self.transport_error("server stdout closed (process may have exited)"));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(id, method, params);

        let mut json = serde_json::to_string(&req).map_err(|e| {
            self.transport_error(&format!("failed to serialize request: {e}"))
        })?;
        json.push('\n');

        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id, tx);
        // Removes the pending slot if this future is dropped (caller timeout).
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };
        // The reader marks `closed` before draining, so a slot inserted
        // after the drain is caught here.
        if self.is_closed() {
            return Err(self.transport_error("server stdout closed (process may have exited)"));
        }

        self.writer_tx
            .send(json)
            .await
            .map_err(|_| self.transport_error("failed to write to stdin: writer closed"))?;

        rx.await
            .map_err(|_| self.transport_error("server stdout closed (process may have exited)"))
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let mut notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        if let Some(params) = params {
            notification["params"] = params;
        }

        let mut json = serde_json::to_string(&notification).map_err(|e| {
            self.transport_error(&format!("failed to serialize notification: {e}"))
        })?;
        json.push('\n');

        self.writer_tx
            .send(json)
            .await
            .map_err(|_| self.transport_error("failed to write notification: writer closed"))
    }

    /// `tools/call` round trip.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments,
        });
        let response = self.request("tools/call", Some(params)).await?;
        extract_result(response)
    }

    /// `tools/list` round trip.
    pub async fn list_tools(&self) -> Result<Vec<McpToolDefinition>, McpError> {
        let response = self.request("tools/list", None).await?;
        let result = extract_result(response)?;
        let listed: ToolsListResult = serde_json::from_value(result).map_err(|e| {
            self.transport_error(&format!("failed to parse tools/list response: {e}"))
        })?;
        Ok(listed.tools)
    }

    fn transport_error(&self, reason: &str) -> McpError {
        McpError::TransportError {
            server: self.server_name.clone(),
            reason: reason.to_string(),
        }
    }
}

// ─── I/O Tasks ───────────────────────────────────────────────────────────────

async fn write_loop<W>(
    server_name: String,
    mut writer: W,
    mut rx: mpsc::Receiver<String>,
    closed: Arc<AtomicBool>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    while let Some(line) = rx.recv().await {
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            tracing::debug!(server = %server_name, error = %e, "child stdin closed");
            closed.store(true, Ordering::SeqCst);
            break;
        }
    }
}

async fn read_loop<R>(server_name: String, reader: R, pending: PendingMap, closed: Arc<AtomicBool>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(reader);
    let mut line_buf = Vec::new();

    loop {
        line_buf.clear();
        match reader.read_until(b'\n', &mut line_buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(server = %server_name, error = %e, "child stdout read failed");
                break;
            }
        }

        // Children may log arbitrary bytes; responses are always UTF-8.
        let line = String::from_utf8_lossy(&line_buf);
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        // Non-JSON lines are child log output; lines with a method are
        // child-initiated requests/notifications. Neither answers a request.
        let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(trimmed) else {
            continue;
        };
        if resp.method.is_some() {
            continue;
        }
        let Some(id) = resp.id else {
            continue;
        };

        let waiter = lock_pending(&pending).remove(&id);
        if let Some(tx) = waiter {
            let _ = tx.send(resp);
        }
    }

    closed.store(true, Ordering::SeqCst);
    // Dropping the senders wakes every in-flight caller with an error.
    lock_pending(&pending).clear();
}

fn lock_pending(
    pending: &Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>,
) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<JsonRpcResponse>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock_pending(self.pending).remove(&self.id);
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: -32603,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
