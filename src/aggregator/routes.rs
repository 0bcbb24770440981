//! Server route table: public server segment → pool key.
//!
//! Built once from the config. Lookups never fall back to another server:
//! an unknown segment is an error the caller sees.

use std::collections::BTreeMap;

use super::codec::{BUILTIN_SERVER, SEGMENT_DELIMITER};
use super::config::AggregatorConfig;
use super::errors::{ConfigError, RouteError};
use super::LOG_TARGET;

#[derive(Debug, Clone)]
struct Route {
    pool_key: String,
    identity: String,
}

/// Static mapping between server segments, pool keys and child identities.
#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: BTreeMap<String, Route>,
}

impl RouteTable {
    /// Build the table, failing on any route the aggregator could not serve.
    pub fn from_config(config: &AggregatorConfig) -> Result<Self, ConfigError> {
        let mut routes = BTreeMap::new();

        for (server, entry) in config.effective_routes() {
            if server.is_empty() || server.contains(SEGMENT_DELIMITER) {
                return Err(ConfigError::InvalidRoute {
                    server,
                    reason: format!(
                        "must be non-empty and must not contain '{SEGMENT_DELIMITER}'"
                    ),
                });
            }
            if server == BUILTIN_SERVER {
                return Err(ConfigError::InvalidRoute {
                    server,
                    reason: "reserved for the aggregator's own tools".into(),
                });
            }

            let pool_key = entry.pool_key().to_string();
            let Some(server_config) = config.servers.get(&pool_key) else {
                return Err(ConfigError::MissingServer { server, pool_key });
            };

            let identity = entry
                .identity()
                .or(server_config.identity.as_deref())
                .unwrap_or(&pool_key)
                .to_string();

            routes.insert(server, Route { pool_key, identity });
        }

        for pool_key in config.servers.keys() {
            if !routes.values().any(|r| &r.pool_key == pool_key) {
                tracing::warn!(
                    target: LOG_TARGET,
                    pool_key = %pool_key,
                    "server has no route and is unreachable"
                );
            }
        }

        Ok(Self { routes })
    }

    /// Pool key for a server segment.
    pub fn resolve_pool_key(&self, server: &str) -> Result<&str, RouteError> {
        self.routes
            .get(server)
            .map(|r| r.pool_key.as_str())
            .ok_or_else(|| RouteError::unknown(server))
    }

    /// The child's declared protocol identity, for diagnostics.
    pub fn identity(&self, pool_key: &str) -> Option<&str> {
        self.routes
            .values()
            .find(|r| r.pool_key == pool_key)
            .map(|r| r.identity.as_str())
    }

    /// Server segment that routes to `pool_key` (first alphabetically when
    /// several do).
    pub fn server_for_pool_key(&self, pool_key: &str) -> Option<&str> {
        self.routes
            .iter()
            .find(|(_, r)| r.pool_key == pool_key)
            .map(|(server, _)| server.as_str())
    }

    /// All routable server segments, sorted.
    pub fn servers(&self) -> Vec<&str> {
        self.routes.keys().map(|s| s.as_str()).collect()
    }

    /// `(server, pool_key)` pairs, sorted by server.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.routes
            .iter()
            .map(|(server, r)| (server.as_str(), r.pool_key.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::config::parse_config;
    use std::path::Path;

    fn config(raw: &str) -> AggregatorConfig {
        parse_config(raw, Path::new("syntropy.json")).unwrap()
    }

    #[test]
    fn test_resolve_known_server() {
        let table = RouteTable::from_config(&config(
            r#"{"servers": {"pool-serena": {"command": "uvx"}},
                "routes": {"serena": "pool-serena"}}"#,
        ))
        .unwrap();
        assert_eq!(table.resolve_pool_key("serena").unwrap(), "pool-serena");
        assert_eq!(table.identity("pool-serena"), Some("pool-serena"));
        assert_eq!(table.server_for_pool_key("pool-serena"), Some("serena"));
    }

    #[test]
    fn test_unknown_server_is_error() {
        let table = RouteTable::from_config(&config(
            r#"{"servers": {"syn-git": {"command": "uvx"}}}"#,
        ))
        .unwrap();
        let err = table.resolve_pool_key("serena").unwrap_err();
        assert_eq!(err.reason, "unknown-server");
        assert_eq!(err.server, "serena");
        // Case sensitive: no implicit lowercasing.
        assert!(table.resolve_pool_key("Git").is_err());
    }

    #[test]
    fn test_missing_server_entry_fails_fast() {
        let err = RouteTable::from_config(&config(
            r#"{"servers": {"syn-git": {"command": "uvx"}},
                "routes": {"git": "syn-git", "serena": "syn-serena"}}"#,
        ))
        .unwrap_err();
        match err {
            ConfigError::MissingServer { server, pool_key } => {
                assert_eq!(server, "serena");
                assert_eq!(pool_key, "syn-serena");
            }
            other => panic!("expected MissingServer, got {other:?}"),
        }
    }

    #[test]
    fn test_route_with_delimiter_rejected() {
        let err = RouteTable::from_config(&config(
            r#"{"servers": {"syn-x": {"command": "uvx"}},
                "routes": {"my_server": "syn-x"}}"#,
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRoute { .. }));
    }

    #[test]
    fn test_builtin_segment_reserved() {
        let err = RouteTable::from_config(&config(
            r#"{"servers": {"syn-syntropy": {"command": "uvx"}}}"#,
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRoute { .. }));
    }

    #[test]
    fn test_identity_precedence() {
        let table = RouteTable::from_config(&config(
            r#"{"servers": {
                    "syn-a": {"command": "x", "identity": "from-server"},
                    "syn-b": {"command": "x", "identity": "from-server"}
                },
                "routes": {"a": "syn-a", "b": {"pool": "syn-b", "identity": "from-route"}}}"#,
        ))
        .unwrap();
        assert_eq!(table.identity("syn-a"), Some("from-server"));
        assert_eq!(table.identity("syn-b"), Some("from-route"));
        assert_eq!(table.servers(), vec!["a", "b"]);
    }
}
