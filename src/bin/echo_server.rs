//! `syntropy-echo`: a minimal MCP server over stdio.
//!
//! Advertises two tools (`echo`, `dothing`) and answers every `tools/call`
//! with the `{name, arguments}` it received. Exits on the `shutdown`
//! notification or when stdin closes. Used as a real child process in
//! integration tests and as a smoke-test target for configs.
//!
//! Two tool names change behavior: `crash` exits without answering and
//! `sleep` waits `arguments.ms` milliseconds before echoing.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

#[derive(Parser, Debug)]
#[command(name = "syntropy-echo")]
#[command(about = "Minimal MCP echo server")]
struct Args {
    /// Name reported in the initialize handshake
    #[arg(long, default_value = "syntropy-echo")]
    name: String,

    /// Answer `initialize` with an error
    #[arg(long)]
    fail_init: bool,
}

type Stdout = Arc<Mutex<tokio::io::Stdout>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let args = Arc::new(Args::parse());
    let stdout: Stdout = Arc::new(Mutex::new(tokio::io::stdout()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    tracing::info!(name = %args.name, pid = std::process::id(), "echo server started");

    while let Some(line) = lines.next_line().await? {
        let message: Value = match serde_json::from_str(line.trim()) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed line");
                continue;
            }
        };

        let method = message["method"].as_str().unwrap_or_default().to_string();
        let Some(id) = message.get("id").cloned() else {
            if method == "shutdown" {
                tracing::info!("shutdown requested");
                break;
            }
            continue;
        };

        let args = Arc::clone(&args);
        let stdout = Arc::clone(&stdout);
        tokio::spawn(async move {
            let params = message.get("params").cloned().unwrap_or_else(|| json!({}));
            let response = match respond(&args, &method, params).await {
                Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
                Err((code, msg)) => {
                    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": msg}})
                }
            };
            if let Err(e) = write_line(&stdout, &response).await {
                tracing::warn!(error = %e, "stdout closed");
            }
        });
    }

    tracing::info!("echo server exiting");
    Ok(())
}

async fn respond(args: &Args, method: &str, params: Value) -> Result<Value, (i32, String)> {
    match method {
        "initialize" if args.fail_init => Err((-32603, "initialization refused".into())),
        "initialize" => Ok(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": args.name, "version": env!("CARGO_PKG_VERSION")},
        })),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({
            "tools": [
                {
                    "name": "echo",
                    "description": "Echo the call back",
                    "inputSchema": {"type": "object"}
                },
                {
                    "name": "dothing",
                    "description": "Pretend to do a thing",
                    "inputSchema": {"type": "object", "properties": {"x": {"type": "integer"}}}
                }
            ]
        })),
        "tools/call" => {
            let name = params["name"].as_str().unwrap_or_default().to_string();
            let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
            match name.as_str() {
                "crash" => {
                    tracing::warn!("crash requested");
                    std::process::exit(3);
                }
                "sleep" => {
                    let ms = arguments["ms"].as_u64().unwrap_or(100);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                }
                _ => {}
            }
            let echo = json!({"name": name, "arguments": arguments});
            Ok(json!({
                "content": [{"type": "text", "text": echo.to_string()}],
                "echo": echo,
                "server": args.name,
            }))
        }
        other => Err((-32601, format!("Method not found: {other}"))),
    }
}

async fn write_line(stdout: &Stdout, value: &Value) -> std::io::Result<()> {
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(b'\n');
    let mut out = stdout.lock().await;
    out.write_all(&bytes).await?;
    out.flush().await
}
