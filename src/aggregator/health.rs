//! Health checker: is a pool entry responsive right now?
//!
//! A check obtains the connection through the pool (spawning it if needed)
//! and lists its tools, all inside the caller's timeout. Every failure mode
//! becomes a [`HealthStatus`]; a check never returns an error. A broken
//! transport also fails the pool entry, so the next request respawns it.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::pool::{elapsed_ms, ClientPool};
use super::LOG_TARGET;

/// Health classification of one pool entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Degraded,
    Down,
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Health::Healthy => "healthy",
            Health::Degraded => "degraded",
            Health::Down => "down",
        })
    }
}

/// Result of a single check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub pool_key: String,
    pub status: Health,
    pub response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_count: Option<usize>,
}

impl HealthStatus {
    /// Healthy or degraded: the child answered.
    pub fn is_up(&self) -> bool {
        self.status != Health::Down
    }
}

/// When a responsive child counts as degraded rather than healthy.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthPolicy {
    /// Default check budget.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Answers slower than this fraction of the budget are degraded.
    #[serde(default = "default_degraded_ratio")]
    pub degraded_ratio: f64,
}

fn default_timeout_ms() -> u64 {
    2_000
}
fn default_degraded_ratio() -> f64 {
    0.5
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            degraded_ratio: default_degraded_ratio(),
        }
    }
}

impl HealthPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Classify a check that completed.
    fn classify(&self, elapsed: Duration, timeout: Duration, tool_count: usize) -> (Health, Option<String>) {
        if tool_count == 0 {
            return (Health::Degraded, Some("server advertises no tools".into()));
        }
        let threshold = timeout.mul_f64(self.degraded_ratio.clamp(0.0, 1.0));
        if elapsed > threshold {
            return (
                Health::Degraded,
                Some(format!(
                    "slow response: {}ms exceeds {}ms",
                    elapsed_ms(elapsed),
                    elapsed_ms(threshold)
                )),
            );
        }
        (Health::Healthy, None)
    }
}

/// Check one pool entry within `timeout`.
pub async fn check(
    pool: &ClientPool,
    pool_key: &str,
    timeout: Duration,
    policy: &HealthPolicy,
) -> HealthStatus {
    let started = Instant::now();

    let attempt = async {
        let client = pool.get_client(pool_key).await?;
        let listed = client.list_tools().await;
        if let Err(e) = &listed {
            if e.is_transport_failure() {
                pool.mark_failed(pool_key, &client, &e.to_string());
            }
        }
        listed
    };

    let (status, error_detail, tool_count) = match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(tools)) => {
            let (status, detail) = policy.classify(started.elapsed(), timeout, tools.len());
            (status, detail, Some(tools.len()))
        }
        Ok(Err(e)) => (Health::Down, Some(e.to_string()), None),
        Err(_) => (
            Health::Down,
            Some(format!("timed out after {}ms", elapsed_ms(timeout))),
            None,
        ),
    };

    let response_time_ms = elapsed_ms(started.elapsed());
    match status {
        Health::Down => tracing::warn!(
            target: LOG_TARGET,
            pool_key,
            elapsed_ms = response_time_ms,
            status = %status,
            error = error_detail.as_deref().unwrap_or(""),
            "health check"
        ),
        _ => tracing::info!(
            target: LOG_TARGET,
            pool_key,
            elapsed_ms = response_time_ms,
            status = %status,
            tools = tool_count.unwrap_or(0),
            "health check"
        ),
    }

    HealthStatus {
        pool_key: pool_key.to_string(),
        status,
        response_time_ms,
        error_detail,
        tool_count,
    }
}

/// Check several entries concurrently; results keep the input order.
pub async fn check_many(
    pool: &ClientPool,
    pool_keys: &[String],
    timeout: Duration,
    policy: &HealthPolicy,
) -> Vec<HealthStatus> {
    futures::future::join_all(
        pool_keys
            .iter()
            .map(|key| check(pool, key, timeout, policy)),
    )
    .await
}

// ─── Tests ───────────────────────────────────────────────────────────────────
