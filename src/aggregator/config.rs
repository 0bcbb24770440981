//! Aggregator configuration loading and validation.
//!
//! Reads the servers file (JSON, or YAML by extension) once at startup and
//! resolves `${VAR}` / `${VAR:-default}` references so tokens can live in
//! the environment instead of the file. The result is immutable for the
//! lifetime of the process.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::errors::ConfigError;
use super::health::HealthPolicy;
use super::LOG_TARGET;
use crate::mcp_client::types::ServerConfig;

// ─── Public Types ────────────────────────────────────────────────────────────

/// File names searched for when no explicit path is given.
const CONFIG_FILE_NAMES: &[&str] = &["syntropy.json", ".syntropy/servers.json"];

/// Pool-key prefix stripped when routes are derived from server keys.
const POOL_KEY_PREFIX: &str = "syn-";

/// One `routes` entry: either a bare pool key or a table.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RouteSpec {
    PoolKey(String),
    Entry {
        pool: String,
        #[serde(default)]
        identity: Option<String>,
    },
}

impl RouteSpec {
    pub fn pool_key(&self) -> &str {
        match self {
            RouteSpec::PoolKey(key) => key,
            RouteSpec::Entry { pool, .. } => pool,
        }
    }

    pub fn identity(&self) -> Option<&str> {
        match self {
            RouteSpec::PoolKey(_) => None,
            RouteSpec::Entry { identity, .. } => identity.as_deref(),
        }
    }
}

/// Startup and shutdown budgets.
#[derive(Debug, Clone, Deserialize)]
pub struct StartupConfig {
    /// Overall budget for eager initialization (spawn + verify).
    #[serde(default = "default_eager_timeout_ms")]
    pub eager_timeout_ms: u64,
    /// How long `close_all` may take once shutdown begins.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_eager_timeout_ms() -> u64 {
    10_000
}
fn default_shutdown_grace_ms() -> u64 {
    5_000
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            eager_timeout_ms: default_eager_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

/// Top-level aggregator configuration (mirrors the servers file).
#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorConfig {
    /// Pool key → how to launch that child.
    pub servers: BTreeMap<String, ServerConfig>,
    /// Public server segment → pool key. When absent, every pool key
    /// `syn-<name>` (or a bare `<name>`) is routed from `<name>`.
    #[serde(default)]
    pub routes: Option<BTreeMap<String, RouteSpec>>,
    #[serde(default)]
    pub health: HealthPolicy,
    #[serde(default)]
    pub startup: StartupConfig,
}

impl AggregatorConfig {
    /// Routes as written, or derived from the server keys.
    pub fn effective_routes(&self) -> BTreeMap<String, RouteSpec> {
        if let Some(routes) = &self.routes {
            return routes.clone();
        }
        self.servers
            .keys()
            .map(|pool_key| {
                let server = pool_key.strip_prefix(POOL_KEY_PREFIX).unwrap_or(pool_key);
                (server.to_string(), RouteSpec::PoolKey(pool_key.clone()))
            })
            .collect()
    }

    /// `(pool_key, config)` for every server started at boot.
    pub fn eager_servers(&self) -> Vec<(String, ServerConfig)> {
        self.servers
            .iter()
            .filter(|(_, cfg)| cfg.is_eager())
            .map(|(key, cfg)| (key.clone(), cfg.clone()))
            .collect()
    }

    /// Structural checks on server entries. Route checks live in
    /// [`RouteTable::from_config`](super::routes::RouteTable::from_config).
    pub fn validate(&self, source: &str) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::Empty {
                path: source.to_string(),
            });
        }
        for (pool_key, server) in &self.servers {
            if pool_key.trim().is_empty() {
                return Err(ConfigError::InvalidServer {
                    pool_key: pool_key.clone(),
                    reason: "pool key must not be empty".into(),
                });
            }
            if server.command.trim().is_empty() {
                return Err(ConfigError::InvalidServer {
                    pool_key: pool_key.clone(),
                    reason: "`command` must not be empty".into(),
                });
            }
        }
        if !(0.0..=1.0).contains(&self.health.degraded_ratio) {
            return Err(ConfigError::Malformed {
                path: source.to_string(),
                reason: format!(
                    "health.degraded_ratio must be within 0.0..=1.0, got {}",
                    self.health.degraded_ratio
                ),
            });
        }
        Ok(())
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Resolve the config path.
///
/// Resolution order:
/// 1. `explicit` (CLI flag or `SYNTROPY_CONFIG`), which must exist.
/// 2. `syntropy.json` or `.syntropy/servers.json`, walking upward from `start`.
/// 3. `<config dir>/syntropy/servers.json` (e.g. `~/.config/syntropy/servers.json`).
pub fn find_config_path(explicit: Option<&Path>, start: &Path) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(ConfigError::Unreadable {
            path: path.display().to_string(),
            reason: "file does not exist".into(),
        });
    }

    let mut dir = start.to_path_buf();
    loop {
        for name in CONFIG_FILE_NAMES {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        if !dir.pop() {
            break;
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let candidate = config_dir.join("syntropy").join("servers.json");
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    Err(ConfigError::Unreadable {
        path: start.display().to_string(),
        reason: format!(
            "could not find {} in this directory or any parent",
            CONFIG_FILE_NAMES.join(" or ")
        ),
    })
}

/// Load, interpolate, parse and validate the aggregator config.
pub fn load_config(path: &Path) -> Result<AggregatorConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let config = parse_config(&raw, path)?;
    config.validate(&path.display().to_string())?;

    tracing::info!(
        target: LOG_TARGET,
        path = %path.display(),
        servers = config.servers.len(),
        eager = config.eager_servers().len(),
        "loaded aggregator config"
    );

    Ok(config)
}

/// Parse config text; YAML when the path ends in `.yaml`/`.yml`, JSON otherwise.
pub fn parse_config(raw: &str, path: &Path) -> Result<AggregatorConfig, ConfigError> {
    let interpolated = interpolate_env_vars(raw);
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );

    let parsed = if is_yaml {
        serde_yaml::from_str(&interpolated).map_err(|e| e.to_string())
    } else {
        serde_json::from_str(&interpolated).map_err(|e| e.to_string())
    };

    parsed.map_err(|reason| ConfigError::Malformed {
        path: path.display().to_string(),
        reason,
    })
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var_name, default)) => {
            std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
        }
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"{
        "servers": {
            "syn-serena": {"command": "uvx", "args": ["serena"], "lazy": false},
            "syn-context7": {"command": "npx", "args": ["-y", "@upstash/context7-mcp"]}
        },
        "routes": {
            "serena": "syn-serena",
            "context7": {"pool": "syn-context7", "identity": "mcp__context7__"}
        }
    }"#;

    #[test]
    fn test_parse_sample() {
        let config = parse_config(SAMPLE, Path::new("syntropy.json")).unwrap();
        assert_eq!(config.servers.len(), 2);
        assert!(config.servers["syn-serena"].is_eager());
        assert!(!config.servers["syn-context7"].is_eager());

        let routes = config.effective_routes();
        assert_eq!(routes["serena"].pool_key(), "syn-serena");
        assert_eq!(routes["context7"].identity(), Some("mcp__context7__"));
        assert_eq!(config.health.timeout_ms, 2_000);
        assert_eq!(config.startup.eager_timeout_ms, 10_000);
    }

    #[test]
    fn test_derived_routes() {
        let raw = r#"{"servers": {"syn-git": {"command": "uvx"}, "linear": {"command": "npx"}}}"#;
        let config = parse_config(raw, Path::new("syntropy.json")).unwrap();
        let routes = config.effective_routes();
        assert_eq!(routes["git"].pool_key(), "syn-git");
        assert_eq!(routes["linear"].pool_key(), "linear");
    }

    #[test]
    fn test_eager_servers_filter() {
        let config = parse_config(SAMPLE, Path::new("syntropy.json")).unwrap();
        let eager = config.eager_servers();
        assert_eq!(eager.len(), 1);
        assert_eq!(eager[0].0, "syn-serena");
    }

    #[test]
    fn test_yaml_by_extension() {
        let yaml = r#"
servers:
  syn-git:
    command: uvx
    args: ["mcp-server-git"]
    lazy: false
startup:
  eager_timeout_ms: 3000
"#;
        let config = parse_config(yaml, Path::new("servers.yaml")).unwrap();
        assert!(config.servers["syn-git"].is_eager());
        assert_eq!(config.startup.eager_timeout_ms, 3000);
        assert_eq!(config.startup.shutdown_grace_ms, 5000);
    }

    #[test]
    fn test_malformed_config() {
        let err = parse_config("{not json", Path::new("syntropy.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Malformed { .. }));
    }

    #[test]
    fn test_validate_rejects_empty_command() {
        let raw = r#"{"servers": {"syn-git": {"command": "  "}}}"#;
        let config = parse_config(raw, Path::new("syntropy.json")).unwrap();
        let err = config.validate("syntropy.json").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidServer { .. }));
    }

    #[test]
    fn test_validate_rejects_no_servers() {
        let config = parse_config(r#"{"servers": {}}"#, Path::new("syntropy.json")).unwrap();
        assert!(matches!(
            config.validate("syntropy.json"),
            Err(ConfigError::Empty { .. })
        ));
    }

    #[test]
    fn test_env_interpolation_in_config() {
        std::env::set_var("__SYNTROPY_TEST_TOKEN__", "secret-123");
        let raw = r#"{"servers": {"syn-linear": {
            "command": "npx",
            "env": {"LINEAR_API_KEY": "${__SYNTROPY_TEST_TOKEN__}", "MODE": "${__SYNTROPY_UNSET__:-fast}"}
        }}}"#;
        let config = parse_config(raw, Path::new("syntropy.json")).unwrap();
        let env = &config.servers["syn-linear"].env;
        assert_eq!(env["LINEAR_API_KEY"], "secret-123");
        assert_eq!(env["MODE"], "fast");
        std::env::remove_var("__SYNTROPY_TEST_TOKEN__");
    }

    #[test]
    fn test_interpolate_no_vars() {
        let input = "plain text with no variables";
        assert_eq!(interpolate_env_vars(input), input);
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/servers");
        assert!(!result.starts_with('~'), "tilde should be expanded");
        assert!(result.ends_with("/servers"));
    }

    #[test]
    fn test_find_config_walks_upward() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("syntropy.json"), SAMPLE).unwrap();
        let nested = tmp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_config_path(None, &nested).unwrap();
        assert_eq!(found, tmp.path().join("syntropy.json"));
    }

    #[test]
    fn test_find_config_explicit_missing() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("nope.json");
        let err = find_config_path(Some(&missing), tmp.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Unreadable { .. }));
    }

    #[test]
    fn test_load_config_from_disk() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("syntropy.json");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.servers.len(), 2);
    }
}
