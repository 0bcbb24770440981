//! Child process client pool.
//!
//! Owns one [`PooledConnection`] per pool key and hands out the connected
//! transport. The only shared mutable state in the aggregator lives here,
//! behind a synchronous mutex that is never held across an `.await`.
//!
//! The first caller for a key inserts a `Connecting` slot holding a shared
//! future *in the same critical section* that found the key unconnected.
//! Every later caller clones that future instead of spawning, so N
//! concurrent first uses produce exactly one child process and all N
//! callers see the same transport or the same error.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;

use super::LOG_TARGET;
use crate::mcp_client::{ChildSpawner, ChildTransport, McpError, ServerConfig};

type ConnectFuture = Shared<BoxFuture<'static, Result<Arc<dyn ChildTransport>, McpError>>>;

// ─── Types ───────────────────────────────────────────────────────────────────

/// Lifecycle state of one pool entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Uninitialized,
    Connecting,
    Ready,
    Failed,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Uninitialized => "uninitialized",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

enum Slot {
    Uninitialized,
    Connecting(ConnectFuture),
    Ready(Arc<dyn ChildTransport>),
    Failed,
    Closed,
}

/// A live or pending handle to one child process.
struct PooledConnection {
    slot: Slot,
    attempts: u64,
    call_count: u64,
    last_error: Option<String>,
    last_connect_ms: Option<u64>,
}

impl PooledConnection {
    fn new() -> Self {
        Self {
            slot: Slot::Uninitialized,
            attempts: 0,
            call_count: 0,
            last_error: None,
            last_connect_ms: None,
        }
    }

    fn state(&self) -> ConnectionState {
        match self.slot {
            Slot::Uninitialized => ConnectionState::Uninitialized,
            Slot::Connecting(_) => ConnectionState::Connecting,
            Slot::Ready(_) => ConnectionState::Ready,
            Slot::Failed => ConnectionState::Failed,
            Slot::Closed => ConnectionState::Closed,
        }
    }
}

/// Point-in-time view of one pool entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolEntryStatus {
    pub connected: bool,
    pub state: ConnectionState,
    pub call_count: u64,
    pub last_error: Option<String>,
    pub attempts: u64,
    pub last_connect_ms: Option<u64>,
}

// ─── ClientPool ──────────────────────────────────────────────────────────────

struct PoolInner {
    configs: BTreeMap<String, ServerConfig>,
    spawner: Arc<dyn ChildSpawner>,
    entries: Mutex<HashMap<String, PooledConnection>>,
    shutting_down: AtomicBool,
}

/// Connect-or-reuse pool of child connections, keyed by pool key.
///
/// Cheap to clone; clones share the same entries.
#[derive(Clone)]
pub struct ClientPool {
    inner: Arc<PoolInner>,
}

impl ClientPool {
    pub fn new(configs: BTreeMap<String, ServerConfig>, spawner: Arc<dyn ChildSpawner>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                configs,
                spawner,
                entries: Mutex::new(HashMap::new()),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Configuration for a pool key.
    pub fn config(&self, pool_key: &str) -> Option<&ServerConfig> {
        self.inner.configs.get(pool_key)
    }

    /// Whether `close_all` has started.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Return the ready connection for `pool_key`, joining an in-flight
    /// attempt or starting a new one as needed.
    ///
    /// A `Failed` entry is retried from scratch; there is no backoff.
    pub async fn get_client(&self, pool_key: &str) -> Result<Arc<dyn ChildTransport>, McpError> {
        let in_flight = {
            let mut entries = self.inner.lock_entries();
            if self.is_shutting_down() {
                return Err(McpError::ShuttingDown {
                    pool_key: pool_key.to_string(),
                });
            }
            let Some(config) = self.inner.configs.get(pool_key) else {
                return Err(McpError::NotConfigured {
                    pool_key: pool_key.to_string(),
                });
            };

            let entry = entries
                .entry(pool_key.to_string())
                .or_insert_with(PooledConnection::new);

            let joined = match &entry.slot {
                Slot::Ready(transport) => return Ok(Arc::clone(transport)),
                Slot::Connecting(in_flight) => Some(in_flight.clone()),
                Slot::Uninitialized | Slot::Failed | Slot::Closed => None,
            };
            match joined {
                Some(in_flight) => in_flight,
                None => self.start_connect(entry, pool_key, config),
            }
        };

        in_flight.await
    }

    /// Mark `entry` as connecting and launch the spawn + handshake.
    ///
    /// Runs under the entries lock; the returned future is already stored
    /// in the slot when the lock is released.
    fn start_connect(
        &self,
        entry: &mut PooledConnection,
        pool_key: &str,
        config: &ServerConfig,
    ) -> ConnectFuture {
        entry.attempts += 1;
        let attempt = entry.attempts;

        tracing::info!(
            target: LOG_TARGET,
            pool_key,
            attempt,
            command = %config.command,
            "connecting"
        );

        let inner = Arc::clone(&self.inner);
        let key = pool_key.to_string();
        let config = config.clone();
        // Detached so the attempt completes even if every waiter gives up.
        let task = tokio::spawn(async move {
            let started = Instant::now();
            let result = inner.spawner.spawn(&key, &config).await;
            inner.settle(&key, attempt, result, started.elapsed()).await
        });

        let inner = Arc::clone(&self.inner);
        let key = pool_key.to_string();
        let in_flight: ConnectFuture = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    let err = McpError::SpawnFailed {
                        name: key.clone(),
                        reason: format!("connect task aborted: {e}"),
                    };
                    inner
                        .settle(&key, attempt, Err(err), Duration::ZERO)
                        .await
                }
            }
        }
        .boxed()
        .shared();

        entry.slot = Slot::Connecting(in_flight.clone());
        in_flight
    }

    /// Count one successfully forwarded call.
    pub fn record_success(&self, pool_key: &str) {
        if let Some(entry) = self.inner.lock_entries().get_mut(pool_key) {
            entry.call_count += 1;
        }
    }

    /// Invalidate a connection whose transport broke so the next
    /// `get_client` reconnects.
    ///
    /// Ignored when the entry already holds a different transport (another
    /// caller reconnected in the meantime). The broken child is closed in
    /// the background.
    pub fn mark_failed(&self, pool_key: &str, transport: &Arc<dyn ChildTransport>, reason: &str) {
        let broken = {
            let mut entries = self.inner.lock_entries();
            let Some(entry) = entries.get_mut(pool_key) else {
                return;
            };
            match &entry.slot {
                Slot::Ready(current) if same_transport(current, transport) => {
                    entry.last_error = Some(reason.to_string());
                    std::mem::replace(&mut entry.slot, Slot::Failed)
                }
                _ => return,
            }
        };

        tracing::warn!(target: LOG_TARGET, pool_key, error = reason, "connection invalidated");

        if let Slot::Ready(transport) = broken {
            let key = pool_key.to_string();
            tokio::spawn(async move {
                if let Err(e) = transport.close().await {
                    tracing::debug!(target: LOG_TARGET, pool_key = %key, error = %e, "close after failure");
                }
            });
        }
    }

    /// Snapshot of every entry created so far. Keys never requested are absent.
    pub fn get_status(&self) -> BTreeMap<String, PoolEntryStatus> {
        self.inner
            .lock_entries()
            .iter()
            .map(|(key, entry)| {
                let state = entry.state();
                (
                    key.clone(),
                    PoolEntryStatus {
                        connected: state == ConnectionState::Ready,
                        state,
                        call_count: entry.call_count,
                        last_error: entry.last_error.clone(),
                        attempts: entry.attempts,
                        last_connect_ms: entry.last_connect_ms,
                    },
                )
            })
            .collect()
    }

    /// State of one entry, `None` if it was never requested.
    pub fn state(&self, pool_key: &str) -> Option<ConnectionState> {
        self.inner.lock_entries().get(pool_key).map(|e| e.state())
    }

    /// Every currently ready connection, sorted by pool key.
    pub fn ready_connections(&self) -> Vec<(String, Arc<dyn ChildTransport>)> {
        let mut ready: Vec<_> = self
            .inner
            .lock_entries()
            .iter()
            .filter_map(|(key, entry)| match &entry.slot {
                Slot::Ready(t) => Some((key.clone(), Arc::clone(t))),
                _ => None,
            })
            .collect();
        ready.sort_by(|a, b| a.0.cmp(&b.0));
        ready
    }

    /// Close every ready connection and refuse new ones.
    ///
    /// Best effort: a child that fails to close is logged and the rest are
    /// still closed. Every entry ends `Closed`. Attempts still in flight
    /// close their child as soon as they finish. Returns how many ready
    /// connections were closed cleanly.
    pub async fn close_all(&self) -> usize {
        let to_close: Vec<(String, Arc<dyn ChildTransport>)> = {
            let mut entries = self.inner.lock_entries();
            self.inner.shutting_down.store(true, Ordering::SeqCst);
            entries
                .iter_mut()
                .filter_map(|(key, entry)| {
                    match std::mem::replace(&mut entry.slot, Slot::Closed) {
                        Slot::Ready(t) => Some((key.clone(), t)),
                        _ => None,
                    }
                })
                .collect()
        };

        let total = to_close.len();
        let closes = to_close.into_iter().map(|(key, transport)| async move {
            let started = Instant::now();
            match transport.close().await {
                Ok(()) => {
                    tracing::info!(
                        target: LOG_TARGET,
                        pool_key = %key,
                        elapsed_ms = elapsed_ms(started.elapsed()),
                        "closed"
                    );
                    true
                }
                Err(e) => {
                    tracing::warn!(
                        target: LOG_TARGET,
                        pool_key = %key,
                        error = %e,
                        "close failed"
                    );
                    false
                }
            }
        });
        let closed = futures::future::join_all(closes)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count();

        tracing::info!(target: LOG_TARGET, closed, total, "pool drained");
        closed
    }
}

impl PoolInner {
    fn lock_entries(&self) -> MutexGuard<'_, HashMap<String, PooledConnection>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the outcome of connect attempt `attempt`.
    ///
    /// Only the attempt currently stored as `Connecting` may settle the
    /// entry. A child that finishes connecting after `close_all` is closed
    /// right away.
    async fn settle(
        &self,
        pool_key: &str,
        attempt: u64,
        result: Result<Arc<dyn ChildTransport>, McpError>,
        elapsed: Duration,
    ) -> Result<Arc<dyn ChildTransport>, McpError> {
        let elapsed_ms = elapsed_ms(elapsed);
        let orphan = {
            let mut entries = self.lock_entries();
            let current = entries.get_mut(pool_key).filter(|entry| {
                entry.attempts == attempt && matches!(entry.slot, Slot::Connecting(_))
            });

            match (current, result) {
                (Some(entry), Ok(transport)) => {
                    entry.slot = Slot::Ready(Arc::clone(&transport));
                    entry.last_error = None;
                    entry.last_connect_ms = Some(elapsed_ms);
                    tracing::info!(target: LOG_TARGET, pool_key, elapsed_ms, "ready");
                    return Ok(transport);
                }
                (Some(entry), Err(e)) => {
                    entry.slot = Slot::Failed;
                    entry.last_error = Some(e.to_string());
                    entry.last_connect_ms = Some(elapsed_ms);
                    tracing::warn!(target: LOG_TARGET, pool_key, elapsed_ms, error = %e, "failed");
                    return Err(e);
                }
                (None, Err(e)) => return Err(e),
                (None, Ok(transport)) => transport,
            }
        };

        tracing::info!(target: LOG_TARGET, pool_key, "closing child that connected after shutdown");
        if let Err(e) = orphan.close().await {
            tracing::warn!(target: LOG_TARGET, pool_key, error = %e, "close failed");
        }
        Err(McpError::ShuttingDown {
            pool_key: pool_key.to_string(),
        })
    }
}

fn same_transport(a: &Arc<dyn ChildTransport>, b: &Arc<dyn ChildTransport>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

pub(crate) fn elapsed_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::testing::{configs, FakeBehavior, FakeSpawner};

    fn pool_with(spawner: Arc<FakeSpawner>, keys: &[(&str, bool)]) -> ClientPool {
        ClientPool::new(configs(keys), spawner)
    }

    #[tokio::test]
    async fn test_get_client_connects_once_and_reuses() {
        let spawner = Arc::new(FakeSpawner::new());
        let pool = pool_with(Arc::clone(&spawner), &[("syn-alpha", false)]);

        let first = pool.get_client("syn-alpha").await.unwrap();
        let second = pool.get_client("syn-alpha").await.unwrap();

        assert!(same_transport(&first, &second));
        assert_eq!(spawner.spawn_count("syn-alpha"), 1);
        assert_eq!(pool.state("syn-alpha"), Some(ConnectionState::Ready));
    }

    #[tokio::test]
    async fn test_concurrent_first_use_spawns_once() {
        let spawner = Arc::new(FakeSpawner::new().with_delay(Duration::from_millis(50)));
        let pool = pool_with(Arc::clone(&spawner), &[("syn-alpha", true)]);

        let callers = (0..16).map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get_client("syn-alpha").await })
        });
        let results = futures::future::join_all(callers).await;

        let transports: Vec<_> = results
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();
        assert_eq!(spawner.spawn_count("syn-alpha"), 1);
        assert!(transports
            .iter()
            .all(|t| same_transport(t, &transports[0])));
    }

    #[tokio::test]
    async fn test_concurrent_first_use_shares_failure() {
        let spawner = Arc::new(
            FakeSpawner::new()
                .with_delay(Duration::from_millis(30))
                .with_behavior("syn-beta", FakeBehavior::FailSpawn("boom".into())),
        );
        let pool = pool_with(Arc::clone(&spawner), &[("syn-beta", true)]);

        let callers = (0..8).map(|_| {
            let pool = pool.clone();
            async move { pool.get_client("syn-beta").await }
        });
        let results = futures::future::join_all(callers).await;

        assert_eq!(spawner.spawn_count("syn-beta"), 1);
        for result in results {
            let err = result.err().unwrap();
            assert!(err.to_string().contains("boom"));
        }
        let status = &pool.get_status()["syn-beta"];
        assert_eq!(status.state, ConnectionState::Failed);
        assert!(!status.connected);
        assert!(status.last_error.as_ref().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_failed_entry_retried_on_next_call() {
        let spawner = Arc::new(
            FakeSpawner::new().with_behavior("syn-beta", FakeBehavior::FailFirst("flaky".into())),
        );
        let pool = pool_with(Arc::clone(&spawner), &[("syn-beta", true)]);

        assert!(pool.get_client("syn-beta").await.is_err());
        assert_eq!(pool.state("syn-beta"), Some(ConnectionState::Failed));

        pool.get_client("syn-beta").await.unwrap();
        assert_eq!(spawner.spawn_count("syn-beta"), 2);
        let status = &pool.get_status()["syn-beta"];
        assert!(status.connected);
        assert_eq!(status.attempts, 2);
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn test_unconfigured_key() {
        let pool = pool_with(Arc::new(FakeSpawner::new()), &[("syn-alpha", true)]);
        let err = pool.get_client("syn-nope").await.err().unwrap();
        assert!(matches!(err, McpError::NotConfigured { .. }));
        assert!(pool.get_status().is_empty());
    }

    #[tokio::test]
    async fn test_status_only_lists_requested_keys() {
        let pool = pool_with(
            Arc::new(FakeSpawner::new()),
            &[("syn-alpha", false), ("syn-beta", true)],
        );
        pool.get_client("syn-alpha").await.unwrap();
        pool.record_success("syn-alpha");
        pool.record_success("syn-alpha");

        let status = pool.get_status();
        assert_eq!(status.len(), 1);
        assert!(!status.contains_key("syn-beta"));
        assert_eq!(status["syn-alpha"].call_count, 2);
    }

    #[tokio::test]
    async fn test_mark_failed_forces_reconnect() {
        let spawner = Arc::new(FakeSpawner::new());
        let pool = pool_with(Arc::clone(&spawner), &[("syn-alpha", true)]);

        let first = pool.get_client("syn-alpha").await.unwrap();
        pool.mark_failed("syn-alpha", &first, "broken pipe");
        assert_eq!(pool.state("syn-alpha"), Some(ConnectionState::Failed));

        let second = pool.get_client("syn-alpha").await.unwrap();
        assert!(!same_transport(&first, &second));
        assert_eq!(spawner.spawn_count("syn-alpha"), 2);

        // A stale handle does not invalidate the fresh connection.
        pool.mark_failed("syn-alpha", &first, "late report");
        assert_eq!(pool.state("syn-alpha"), Some(ConnectionState::Ready));
    }

    #[tokio::test]
    async fn test_close_all_drains_and_refuses() {
        let spawner = Arc::new(
            FakeSpawner::new().with_behavior("syn-gamma", FakeBehavior::FailClose),
        );
        let pool = pool_with(
            Arc::clone(&spawner),
            &[("syn-alpha", true), ("syn-beta", true), ("syn-gamma", true)],
        );
        for key in ["syn-alpha", "syn-beta", "syn-gamma"] {
            pool.get_client(key).await.unwrap();
        }
        assert_eq!(spawner.live_children(), 3);

        let closed = pool.close_all().await;
        assert_eq!(closed, 2);
        assert!(pool
            .get_status()
            .values()
            .all(|s| s.state == ConnectionState::Closed && !s.connected));
        // The failing close still counts as attempted; the other two are gone.
        assert_eq!(spawner.live_children(), 1);

        let err = pool.get_client("syn-alpha").await.err().unwrap();
        assert!(matches!(err, McpError::ShuttingDown { .. }));
    }

    #[tokio::test]
    async fn test_connect_finishing_after_close_all_is_closed() {
        let spawner = Arc::new(FakeSpawner::new().with_delay(Duration::from_millis(50)));
        let pool = pool_with(Arc::clone(&spawner), &[("syn-alpha", true)]);

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get_client("syn-alpha").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.close_all().await;

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(McpError::ShuttingDown { .. })));
        assert_eq!(spawner.live_children(), 0);
        assert_eq!(pool.state("syn-alpha"), Some(ConnectionState::Closed));
    }
}
