//! Lifecycle manager: signal handling and graceful shutdown.
//!
//! Shutdown runs once, whether triggered by SIGINT/SIGTERM or by the client
//! closing stdin: raise the shutting-down flag so the router refuses new
//! calls, then drain the pool within a grace period.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::pool::{elapsed_ms, ClientPool};
use super::LOG_TARGET;

/// Process-wide "shutting down" marker, shared by the router and the
/// lifecycle manager.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Returns `true` only for the first caller.
    pub fn trigger(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What ended the serve loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT or SIGTERM.
    Signal,
    /// The client closed stdin.
    ClientClosed,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ShutdownReason::Signal => "signal",
            ShutdownReason::ClientClosed => "client closed stdin",
        })
    }
}

/// Outcome of one shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownSummary {
    /// Connections closed cleanly.
    pub closed: usize,
    /// The grace period elapsed before every child was closed.
    pub timed_out: bool,
    pub elapsed_ms: u64,
}

/// Owns the graceful-shutdown sequence for one pool.
pub struct LifecycleManager {
    pool: ClientPool,
    flag: ShutdownFlag,
    grace: Duration,
}

impl LifecycleManager {
    pub fn new(pool: ClientPool, flag: ShutdownFlag, grace: Duration) -> Self {
        Self { pool, flag, grace }
    }

    pub fn flag(&self) -> &ShutdownFlag {
        &self.flag
    }

    /// Resolve on the first SIGINT or SIGTERM.
    pub async fn wait_for_signal() -> std::io::Result<()> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = signal(SignalKind::terminate())?;
            tokio::select! {
                res = tokio::signal::ctrl_c() => res?,
                _ = term.recv() => {}
            }
            Ok(())
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await
        }
    }

    /// Refuse new work and close every child, bounded by the grace period.
    ///
    /// Idempotent: only the first call drains the pool.
    pub async fn shutdown(&self, reason: ShutdownReason) -> ShutdownSummary {
        if !self.flag.trigger() {
            tracing::debug!(target: LOG_TARGET, "shutdown already in progress");
            return ShutdownSummary {
                closed: 0,
                timed_out: false,
                elapsed_ms: 0,
            };
        }

        let started = Instant::now();
        tracing::info!(
            target: LOG_TARGET,
            reason = %reason,
            grace_ms = elapsed_ms(self.grace),
            "shutting down"
        );

        let (closed, timed_out) = match tokio::time::timeout(self.grace, self.pool.close_all()).await {
            Ok(closed) => (closed, false),
            Err(_) => {
                tracing::warn!(
                    target: LOG_TARGET,
                    grace_ms = elapsed_ms(self.grace),
                    "grace period elapsed before every child closed"
                );
                (0, true)
            }
        };

        let summary = ShutdownSummary {
            closed,
            timed_out,
            elapsed_ms: elapsed_ms(started.elapsed()),
        };
        tracing::info!(
            target: LOG_TARGET,
            closed = summary.closed,
            elapsed_ms = summary.elapsed_ms,
            "shutdown complete"
        );
        summary
    }
}
