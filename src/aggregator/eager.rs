//! Eager initializer: warm up `lazy: false` servers at boot.
//!
//! Three phases, all bounded by one overall deadline:
//! 1. spawn every eager server concurrently (join-all, failures collected),
//! 2. health-check every server that reached `ready`,
//! 3. log one summary line.
//!
//! The work runs on a background task. Requests are served while it runs;
//! a server still connecting when the deadline passes is reported failed
//! and keeps connecting in the pool.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use tokio::time::Instant as TokioInstant;

use super::health::{self, HealthPolicy, HealthStatus};
use super::pool::{elapsed_ms, ClientPool};
use super::LOG_TARGET;

// ─── Report ──────────────────────────────────────────────────────────────────

/// Outcome for one eager server.
#[derive(Debug, Clone, Serialize)]
pub struct EagerOutcome {
    pub pool_key: String,
    pub spawn_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EagerOutcome {
    pub fn is_healthy(&self) -> bool {
        self.health.as_ref().is_some_and(|h| h.is_up())
    }

    fn health_ms(&self) -> u64 {
        self.health.as_ref().map_or(0, |h| h.response_time_ms)
    }
}

/// Summary of one eager initialization run.
#[derive(Debug, Clone, Serialize)]
pub struct EagerReport {
    pub servers: Vec<EagerOutcome>,
    pub healthy: usize,
    pub failed: usize,
    pub elapsed_ms: u64,
    /// The overall budget ran out before every server settled.
    pub timed_out: bool,
}

// ─── Options ─────────────────────────────────────────────────────────────────

/// Budgets for one run.
#[derive(Debug, Clone)]
pub struct EagerOptions {
    /// Overall budget for all three phases.
    pub overall_timeout: Duration,
    /// Per-server health check budget (clipped to what is left overall).
    pub health_timeout: Duration,
    pub policy: HealthPolicy,
}

// ─── Initializer ─────────────────────────────────────────────────────────────

type ReportFuture = Shared<BoxFuture<'static, Arc<EagerReport>>>;

/// Handle to a running (or finished) eager initialization.
#[derive(Clone)]
pub struct EagerInit {
    report: ReportFuture,
    budget: Duration,
}

impl EagerInit {
    /// Start warming up `pool_keys` in the background.
    pub fn start(pool: ClientPool, pool_keys: Vec<String>, options: EagerOptions) -> Self {
        let budget = options.overall_timeout;
        let task = tokio::spawn(run(pool, pool_keys.clone(), options));
        let report = async move {
            match task.await {
                Ok(report) => Arc::new(report),
                Err(e) => {
                    tracing::error!(target: LOG_TARGET, error = %e, "eager init task aborted");
                    Arc::new(aborted_report(&pool_keys, &e.to_string()))
                }
            }
        }
        .boxed()
        .shared();
        Self { report, budget }
    }

    /// Block until the run settles, bounded by the overall budget.
    ///
    /// `None` when the budget elapses first; the run itself keeps going.
    pub async fn wait(&self) -> Option<Arc<EagerReport>> {
        tokio::time::timeout(self.budget, self.report.clone())
            .await
            .ok()
    }

    /// The report if the run already finished.
    pub fn peek(&self) -> Option<Arc<EagerReport>> {
        self.report.peek().cloned()
    }
}

/// Run the three phases to completion. Never exceeds the overall budget by
/// more than scheduling jitter.
pub async fn run(pool: ClientPool, pool_keys: Vec<String>, options: EagerOptions) -> EagerReport {
    let started = Instant::now();
    let deadline = TokioInstant::now() + options.overall_timeout;

    if pool_keys.is_empty() {
        tracing::info!(target: LOG_TARGET, "no eager servers configured");
        return EagerReport {
            servers: vec![],
            healthy: 0,
            failed: 0,
            elapsed_ms: 0,
            timed_out: false,
        };
    }

    tracing::info!(target: LOG_TARGET, servers = ?pool_keys, "eager init started");

    // Phase 1: spawn, every attempt settles (or hits the deadline).
    let spawns = pool_keys.iter().map(|key| {
        let pool = pool.clone();
        async move {
            let spawn_started = Instant::now();
            let result = tokio::time::timeout_at(deadline, pool.get_client(key)).await;
            let spawn_ms = elapsed_ms(spawn_started.elapsed());
            let error = match result {
                Ok(Ok(_)) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some(format!(
                    "still connecting after {}ms startup budget",
                    elapsed_ms(options.overall_timeout)
                )),
            };
            EagerOutcome {
                pool_key: key.clone(),
                spawn_ms,
                health: None,
                error,
            }
        }
    });
    let mut outcomes = futures::future::join_all(spawns).await;

    // Phase 2: verify the ones that connected.
    let checks = outcomes.iter_mut().filter(|o| o.error.is_none()).map(|outcome| {
        let pool = pool.clone();
        let policy = options.policy.clone();
        let remaining = deadline.saturating_duration_since(TokioInstant::now());
        let timeout = options.health_timeout.min(remaining);
        async move {
            let status = health::check(&pool, &outcome.pool_key, timeout, &policy).await;
            if !status.is_up() {
                outcome.error = status.error_detail.clone();
            }
            outcome.health = Some(status);
        }
    });
    futures::future::join_all(checks).await;

    // Phase 3: report.
    let healthy = outcomes.iter().filter(|o| o.is_healthy()).count();
    let failed = outcomes.len() - healthy;
    let timed_out = TokioInstant::now() >= deadline;
    let report = EagerReport {
        servers: outcomes,
        healthy,
        failed,
        elapsed_ms: elapsed_ms(started.elapsed()),
        timed_out,
    };
    log_summary(&report);
    report
}

fn log_summary(report: &EagerReport) {
    let breakdown = report
        .servers
        .iter()
        .map(|o| {
            let state = match (&o.health, &o.error) {
                (Some(h), None) => h.status.to_string(),
                _ => "failed".to_string(),
            };
            format!(
                "{}={} (spawn {}ms, health {}ms)",
                o.pool_key,
                state,
                o.spawn_ms,
                o.health_ms()
            )
        })
        .collect::<Vec<_>>()
        .join(", ");

    if report.failed == 0 {
        tracing::info!(
            target: LOG_TARGET,
            healthy = report.healthy,
            failed = report.failed,
            elapsed_ms = report.elapsed_ms,
            "eager init complete: {breakdown}"
        );
    } else {
        tracing::warn!(
            target: LOG_TARGET,
            healthy = report.healthy,
            failed = report.failed,
            elapsed_ms = report.elapsed_ms,
            timed_out = report.timed_out,
            "eager init degraded: {breakdown}"
        );
    }
}

fn aborted_report(pool_keys: &[String], reason: &str) -> EagerReport {
    EagerReport {
        servers: pool_keys
            .iter()
            .map(|key| EagerOutcome {
                pool_key: key.clone(),
                spawn_ms: 0,
                health: None,
                error: Some(format!("eager init aborted: {reason}")),
            })
            .collect(),
        healthy: 0,
        failed: pool_keys.len(),
        elapsed_ms: 0,
        timed_out: false,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
