//! Configuration management for the sync daemon.

use std::collections::HashMap;
use std::env;
use std::time::Duration;
use tidemark_engine::{Scene, SyncStrategy};

/// Sync configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite URL of the local replica
    pub database_url: String,
    /// SQLite URL of the remote (cloud role) replica
    pub remote_url: String,
    /// Name the remote replica is tracked under
    pub peer: String,
    /// Name the remote replica tracks this one under
    pub local_peer: String,
    /// Tables reconciled every run
    pub tables: Vec<String>,
    /// Rows per lane in one scan
    pub batch_limit: usize,
    /// Ceiling for widening a stalled scan
    pub max_batch_limit: usize,
    /// Deadline for each transport call
    pub transport_timeout: Duration,
    pub strategy: SyncStrategy,
    pub remote_is_authoritative: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from an explicit variable map.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let get = |name: &str| vars.get(name).map(|v| v.trim()).filter(|v| !v.is_empty());

        let database_url = get("TIDEMARK_DATABASE_URL")
            .ok_or(ConfigError::Missing("TIDEMARK_DATABASE_URL"))?
            .to_string();
        let remote_url = get("TIDEMARK_REMOTE_URL")
            .ok_or(ConfigError::Missing("TIDEMARK_REMOTE_URL"))?
            .to_string();

        let peer = get("TIDEMARK_PEER").unwrap_or("cloud").to_string();
        let local_peer = get("TIDEMARK_LOCAL_PEER").unwrap_or("device").to_string();
        if local_peer == peer {
            return Err(invalid("TIDEMARK_LOCAL_PEER", &local_peer));
        }

        let tables: Vec<String> = get("TIDEMARK_TABLES")
            .ok_or(ConfigError::Missing("TIDEMARK_TABLES"))?
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if tables.is_empty() {
            return Err(ConfigError::Missing("TIDEMARK_TABLES"));
        }

        let batch_limit = parse_number(get("TIDEMARK_BATCH_LIMIT"), "TIDEMARK_BATCH_LIMIT", 500)?;
        let max_batch_limit = parse_number(
            get("TIDEMARK_MAX_BATCH_LIMIT"),
            "TIDEMARK_MAX_BATCH_LIMIT",
            8000,
        )?;
        if batch_limit == 0 || max_batch_limit < batch_limit {
            return Err(ConfigError::Invalid {
                name: "TIDEMARK_MAX_BATCH_LIMIT",
                value: format!("{max_batch_limit} (batch limit {batch_limit})"),
            });
        }

        let timeout_ms: u64 = parse_number(
            get("TIDEMARK_TRANSPORT_TIMEOUT_MS"),
            "TIDEMARK_TRANSPORT_TIMEOUT_MS",
            10_000,
        )?;

        let scene = match get("TIDEMARK_SCENE").unwrap_or("kv") {
            "kv" => Scene::KvStore,
            "relational" => Scene::Relational,
            other => return Err(invalid("TIDEMARK_SCENE", other)),
        };

        let strategy = match get("TIDEMARK_STRATEGY").unwrap_or("merge") {
            "merge" => SyncStrategy::merge(scene),
            "force-push" => SyncStrategy::force_push(),
            other => return Err(invalid("TIDEMARK_STRATEGY", other)),
        };

        let remote_is_authoritative = match get("TIDEMARK_REMOTE_AUTHORITATIVE").unwrap_or("false")
        {
            "true" | "1" => true,
            "false" | "0" => false,
            other => return Err(invalid("TIDEMARK_REMOTE_AUTHORITATIVE", other)),
        };

        Ok(Self {
            database_url,
            remote_url,
            peer,
            local_peer,
            tables,
            batch_limit,
            max_batch_limit,
            transport_timeout: Duration::from_millis(timeout_ms),
            strategy,
            remote_is_authoritative,
        })
    }
}

fn parse_number<T: std::str::FromStr>(
    raw: Option<&str>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        Some(value) => value.parse().map_err(|_| invalid(name, value)),
        None => Ok(default),
    }
}

fn invalid(name: &'static str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_string(),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("Invalid {name} value: {value}")]
    Invalid { name: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn required() -> Vec<(&'static str, &'static str)> {
        vec![
            ("TIDEMARK_DATABASE_URL", "sqlite://local.db"),
            ("TIDEMARK_REMOTE_URL", "sqlite://cloud.db"),
            ("TIDEMARK_TABLES", "notes, users,,"),
        ]
    }

    #[test]
    fn defaults_apply() {
        let config = Config::from_vars(&vars(&required())).unwrap();
        assert_eq!(config.peer, "cloud");
        assert_eq!(config.local_peer, "device");
        assert_eq!(config.tables, vec!["notes", "users"]);
        assert_eq!(config.batch_limit, 500);
        assert_eq!(config.max_batch_limit, 8000);
        assert_eq!(config.transport_timeout, Duration::from_secs(10));
        assert_eq!(config.strategy, SyncStrategy::merge(Scene::KvStore));
        assert!(!config.remote_is_authoritative);
    }

    #[test]
    fn overrides_parse() {
        let mut pairs = required();
        pairs.extend([
            ("TIDEMARK_PEER", "phone"),
            ("TIDEMARK_BATCH_LIMIT", "10"),
            ("TIDEMARK_MAX_BATCH_LIMIT", "40"),
            ("TIDEMARK_TRANSPORT_TIMEOUT_MS", "250"),
            ("TIDEMARK_SCENE", "relational"),
            ("TIDEMARK_REMOTE_AUTHORITATIVE", "true"),
        ]);
        let config = Config::from_vars(&vars(&pairs)).unwrap();
        assert_eq!(config.peer, "phone");
        assert_eq!(config.batch_limit, 10);
        assert_eq!(config.transport_timeout, Duration::from_millis(250));
        assert_eq!(config.strategy, SyncStrategy::merge(Scene::Relational));
        assert!(config.remote_is_authoritative);

        pairs.push(("TIDEMARK_STRATEGY", "force-push"));
        let config = Config::from_vars(&vars(&pairs)).unwrap();
        assert_eq!(config.strategy, SyncStrategy::force_push());
    }

    #[test]
    fn missing_required_value() {
        let err = Config::from_vars(&vars(&[("TIDEMARK_DATABASE_URL", "sqlite://x")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("TIDEMARK_REMOTE_URL")));
    }

    #[test]
    fn invalid_values_rejected() {
        for (name, value) in [
            ("TIDEMARK_SCENE", "graph"),
            ("TIDEMARK_STRATEGY", "pull"),
            ("TIDEMARK_BATCH_LIMIT", "lots"),
            ("TIDEMARK_REMOTE_AUTHORITATIVE", "maybe"),
            ("TIDEMARK_MAX_BATCH_LIMIT", "1"),
            ("TIDEMARK_LOCAL_PEER", "cloud"),
        ] {
            let mut pairs = required();
            pairs.push((name, value));
            let err = Config::from_vars(&vars(&pairs)).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { .. }), "{name}={value}");
        }
    }
}
