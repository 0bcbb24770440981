use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use syntropy::aggregator::{
    find_config_path, load_config, ClientPool, EagerInit, EagerOptions, LifecycleManager,
    RequestRouter, RouteTable, ShutdownFlag, ShutdownReason, ToolStateStore, LOG_TARGET,
};
use syntropy::mcp_client::ProcessSpawner;
use syntropy::server::{self, FrontHandler};
use syntropy::LogFormat;

/// File name of the tool-state file when none is given, next to the config.
const DEFAULT_TOOL_STATE_FILE: &str = "syntropy-tools.json";

#[derive(Parser, Debug)]
#[command(name = "syntropy")]
#[command(version)]
#[command(about = "MCP aggregation server: many MCP servers behind one stdio connection")]
struct Cli {
    /// Servers config file (JSON, or YAML by extension)
    #[arg(short, long, env = "SYNTROPY_CONFIG")]
    config: Option<PathBuf>,

    /// Tool enable/disable state file
    #[arg(long, env = "SYNTROPY_TOOL_STATE")]
    tool_state: Option<PathBuf>,

    /// Log line format
    #[arg(long, value_enum, default_value = "text", env = "SYNTROPY_LOG_FORMAT")]
    log_format: LogFormat,

    /// Write logs to this file (rotated on start) instead of stderr
    #[arg(long, env = "SYNTROPY_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Start serving without waiting for eager servers to come up
    #[arg(long, env = "SYNTROPY_NO_WAIT_EAGER")]
    no_wait_eager: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    syntropy::init_tracing(cli.log_format, cli.log_file.as_deref())
        .context("failed to initialize logging")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    let result = runtime.block_on(run(cli));
    // stdin is read on a blocking thread that never sees EOF after a signal.
    runtime.shutdown_timeout(Duration::from_millis(250));

    if let Err(e) = &result {
        tracing::error!(target: LOG_TARGET, error = %format!("{e:#}"), "aggregator failed");
    }
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let cwd = std::env::current_dir().context("failed to read working directory")?;
    let config_path = find_config_path(cli.config.as_deref(), &cwd)?;
    let config = load_config(&config_path)?;
    let routes = Arc::new(RouteTable::from_config(&config)?);

    let tool_state_path = cli
        .tool_state
        .unwrap_or_else(|| config_path.with_file_name(DEFAULT_TOOL_STATE_FILE));
    let tool_state = Arc::new(ToolStateStore::open(tool_state_path)?);

    tracing::info!(
        target: LOG_TARGET,
        config = %config_path.display(),
        routes = routes.entries().count(),
        servers = config.servers.len(),
        "configuration loaded"
    );

    let pool = ClientPool::new(config.servers.clone(), Arc::new(ProcessSpawner));
    let flag = ShutdownFlag::new();
    let lifecycle = LifecycleManager::new(
        pool.clone(),
        flag.clone(),
        Duration::from_millis(config.startup.shutdown_grace_ms),
    );

    let signal = async {
        if let Err(e) = LifecycleManager::wait_for_signal().await {
            tracing::warn!(target: LOG_TARGET, error = %e, "signal handlers unavailable");
            std::future::pending::<()>().await;
        }
    };
    tokio::pin!(signal);

    let eager_keys = config
        .eager_servers()
        .into_iter()
        .map(|(pool_key, _)| pool_key)
        .collect();
    let eager = EagerInit::start(
        pool.clone(),
        eager_keys,
        EagerOptions {
            overall_timeout: Duration::from_millis(config.startup.eager_timeout_ms),
            health_timeout: config.health.timeout(),
            policy: config.health.clone(),
        },
    );
    if !cli.no_wait_eager {
        tokio::select! {
            report = eager.wait() => {
                if report.is_none() {
                    tracing::warn!(
                        target: LOG_TARGET,
                        budget_ms = config.startup.eager_timeout_ms,
                        "eager servers still starting, serving anyway"
                    );
                }
            }
            _ = &mut signal => {
                lifecycle.shutdown(ShutdownReason::Signal).await;
                return Ok(());
            }
        }
    }

    let router = RequestRouter::new(routes, pool, flag);
    let handler = Arc::new(
        FrontHandler::new(router, tool_state, config.health.clone()).with_eager(eager),
    );

    let reason = tokio::select! {
        res = server::serve(handler, tokio::io::stdin(), tokio::io::stdout()) => {
            if let Err(e) = res {
                tracing::warn!(target: LOG_TARGET, error = %e, "stdin read failed");
            }
            ShutdownReason::ClientClosed
        }
        _ = &mut signal => ShutdownReason::Signal,
    };

    lifecycle.shutdown(reason).await;
    Ok(())
}
