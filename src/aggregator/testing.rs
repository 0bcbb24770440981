//! In-process doubles for the child spawner and transport.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::config::parse_config;
use super::{ClientPool, RequestRouter, RouteTable, ShutdownFlag};
use crate::mcp_client::{ChildSpawner, ChildTransport, McpError, McpToolDefinition, ServerConfig};

/// How a fake child behaves.
#[derive(Debug, Clone)]
pub(crate) enum FakeBehavior {
    /// Connects and echoes every call back.
    Echo,
    /// Every spawn fails with this reason.
    FailSpawn(String),
    /// The first spawn fails, later ones succeed.
    FailFirst(String),
    /// Spawn never completes.
    Hang,
    /// Connects, but every call fails as a broken pipe.
    BrokenPipe,
    /// Connects, answers `tools/list` after this long.
    SlowList(Duration),
    /// Connects, advertises no tools.
    NoTools,
    /// Connects, but `close` fails.
    FailClose,
}

/// Spawner that records each spawn and creates [`FakeTransport`]s.
pub(crate) struct FakeSpawner {
    behaviors: HashMap<String, FakeBehavior>,
    delay: Duration,
    spawns: Mutex<Vec<String>>,
    live: Arc<AtomicUsize>,
}

impl FakeSpawner {
    pub(crate) fn new() -> Self {
        Self {
            behaviors: HashMap::new(),
            delay: Duration::ZERO,
            spawns: Mutex::new(Vec::new()),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn with_behavior(mut self, pool_key: &str, behavior: FakeBehavior) -> Self {
        self.behaviors.insert(pool_key.to_string(), behavior);
        self
    }

    pub(crate) fn spawn_count(&self, pool_key: &str) -> usize {
        self.spawns
            .lock()
            .unwrap()
            .iter()
            .filter(|k| *k == pool_key)
            .count()
    }

    /// Children connected and not yet closed.
    pub(crate) fn live_children(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChildSpawner for FakeSpawner {
    async fn spawn(
        &self,
        pool_key: &str,
        _config: &ServerConfig,
    ) -> Result<Arc<dyn ChildTransport>, McpError> {
        let previous = {
            let mut spawns = self.spawns.lock().unwrap();
            let previous = spawns.iter().filter(|k| *k == pool_key).count();
            spawns.push(pool_key.to_string());
            previous
        };

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let behavior = self
            .behaviors
            .get(pool_key)
            .cloned()
            .unwrap_or(FakeBehavior::Echo);

        match &behavior {
            FakeBehavior::FailSpawn(reason) => {
                return Err(McpError::SpawnFailed {
                    name: pool_key.to_string(),
                    reason: reason.clone(),
                })
            }
            FakeBehavior::FailFirst(reason) if previous == 0 => {
                return Err(McpError::InitFailed {
                    name: pool_key.to_string(),
                    reason: reason.clone(),
                })
            }
            FakeBehavior::Hang => futures::future::pending::<()>().await,
            _ => {}
        }

        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeTransport {
            pool_key: pool_key.to_string(),
            behavior,
            closed: AtomicBool::new(false),
            live: Arc::clone(&self.live),
        }))
    }
}

/// Echoing child connection.
pub(crate) struct FakeTransport {
    pool_key: String,
    behavior: FakeBehavior,
    closed: AtomicBool,
    live: Arc<AtomicUsize>,
}

#[async_trait]
impl ChildTransport for FakeTransport {
    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        if matches!(self.behavior, FakeBehavior::BrokenPipe) || self.closed.load(Ordering::SeqCst) {
            return Err(McpError::TransportError {
                server: self.pool_key.clone(),
                reason: "broken pipe".into(),
            });
        }
        if name == "reject" {
            return Err(McpError::ServerError {
                code: -32602,
                message: "bad arguments".into(),
                data: None,
            });
        }
        Ok(serde_json::json!({
            "content": [{"type": "text", "text": format!("{} handled {name}", self.pool_key)}],
            "echo": {"name": name, "arguments": arguments},
        }))
    }

    async fn list_tools(&self) -> Result<Vec<McpToolDefinition>, McpError> {
        match &self.behavior {
            FakeBehavior::BrokenPipe => Err(McpError::TransportError {
                server: self.pool_key.clone(),
                reason: "broken pipe".into(),
            }),
            FakeBehavior::NoTools => Ok(vec![]),
            FakeBehavior::SlowList(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(vec![tool("echo")])
            }
            _ => Ok(vec![tool("echo"), tool("dothing")]),
        }
    }

    async fn close(&self) -> Result<(), McpError> {
        if matches!(self.behavior, FakeBehavior::FailClose) {
            return Err(McpError::TransportError {
                server: self.pool_key.clone(),
                reason: "child ignored shutdown".into(),
            });
        }
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

fn tool(name: &str) -> McpToolDefinition {
    McpToolDefinition {
        name: name.to_string(),
        description: Some(format!("fake {name}")),
        input_schema: serde_json::json!({"type": "object"}),
    }
}

/// Server configs for `(pool_key, eager)` pairs.
pub(crate) fn configs(keys: &[(&str, bool)]) -> BTreeMap<String, ServerConfig> {
    keys.iter()
        .map(|(key, eager)| {
            (
                key.to_string(),
                ServerConfig {
                    command: "fake-mcp".to_string(),
                    args: vec![],
                    env: HashMap::new(),
                    lazy: !eager,
                    cwd: None,
                    identity: None,
                },
            )
        })
        .collect()
}

/// Router over `alpha` (eager), `beta` and `context7` (lazy), all served by
/// `spawner`.
pub(crate) fn fake_router(spawner: Arc<FakeSpawner>) -> RequestRouter {
    let config = parse_config(
        r#"{"servers": {
                "syn-alpha": {"command": "fake-mcp", "lazy": false},
                "syn-beta": {"command": "fake-mcp"},
                "syn-context7": {"command": "fake-mcp"}
            }}"#,
        std::path::Path::new("syntropy.json"),
    )
    .unwrap();
    let routes = Arc::new(RouteTable::from_config(&config).unwrap());
    let pool = ClientPool::new(config.servers, spawner);
    RequestRouter::new(routes, pool, ShutdownFlag::new())
}
