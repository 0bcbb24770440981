//! Newline-delimited JSON-RPC 2.0 loop for the client side.
//!
//! One reader (the caller's task), one writer task, one spawned task per
//! request so a slow child never blocks other calls. stdout carries protocol
//! messages only.

use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use super::handler::FrontHandler;
use crate::aggregator::LOG_TARGET;
use crate::mcp_client::types::{error_codes, IncomingMessage, JsonRpcError, OutgoingResponse};

/// Outgoing messages buffered between request tasks and the writer.
const WRITE_QUEUE: usize = 256;

/// Serve requests from `reader` until it reaches EOF.
///
/// Returns once input ends. Requests still in flight keep running and
/// write their responses if the writer is still open.
pub async fn serve<R, W>(handler: Arc<FrontHandler>, reader: R, writer: W) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<OutgoingResponse>(WRITE_QUEUE);
    tokio::spawn(write_loop(writer, rx));

    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    tracing::info!(target: LOG_TARGET, "serving MCP on stdio");

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }

        let decoded = match std::str::from_utf8(&buf) {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => decode(line.trim()),
            Err(e) => Err(parse_error(format!("Parse error: invalid UTF-8: {e}"))),
        };
        let message = match decoded {
            Ok(message) => message,
            Err(response) => {
                if tx.send(*response).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let handler = Arc::clone(&handler);
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Some(response) = handler.handle(message).await {
                let _ = tx.send(response).await;
            }
        });
    }

    tracing::info!(target: LOG_TARGET, "client closed stdin");
    Ok(())
}

/// Parse one line, or build the error response for it.
fn decode(line: &str) -> Result<IncomingMessage, Box<OutgoingResponse>> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| parse_error(format!("Parse error: {e}")))?;

    let id = value.get("id").cloned().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| {
        Box::new(OutgoingResponse::failure(
            id,
            JsonRpcError {
                code: error_codes::INVALID_REQUEST,
                message: format!("Invalid request: {e}"),
                data: None,
            },
        ))
    })
}

/// A `-32700` response; the id is unknown, so it is null.
fn parse_error(message: String) -> Box<OutgoingResponse> {
    Box::new(OutgoingResponse::failure(
        Value::Null,
        JsonRpcError {
            code: error_codes::PARSE_ERROR,
            message,
            data: None,
        },
    ))
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::Receiver<OutgoingResponse>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = rx.recv().await {
        let mut bytes = match serde_json::to_vec(&response) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(target: LOG_TARGET, error = %e, "failed to serialize response");
                continue;
            }
        };
        bytes.push(b'\n');
        if let Err(e) = writer.write_all(&bytes).await {
            tracing::warn!(target: LOG_TARGET, error = %e, "stdout closed");
            break;
        }
        if let Err(e) = writer.flush().await {
            tracing::warn!(target: LOG_TARGET, error = %e, "stdout flush failed");
            break;
        }
    }
}
