//! Runtime settings sourced from the environment.

use std::env;
use std::time::Duration;

use tracing::warn;

use crate::bus::DEFAULT_QUEUE_CAPACITY;
use crate::registry::DEFAULT_RETENTION;

/// Environment-driven server settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Path to the external scanner binary (`SCANNER_BIN`)
    pub scanner_bin: String,
    /// Graph store HTTP endpoint (`GRAPH_URL`); in-memory store when unset
    pub graph_url: Option<String>,
    /// Graph store credentials (`GRAPH_USER` / `GRAPH_PASSWORD`)
    pub graph_user: String,
    pub graph_password: String,
    /// Graph database name (`GRAPH_DATABASE`)
    pub graph_database: String,
    /// Retention of terminal tasks (`TASK_RETENTION_SECONDS`)
    pub task_retention: Duration,
    /// Per-subscriber event queue bound (`SUBSCRIPTION_QUEUE_CAP`)
    pub queue_capacity: usize,
    /// Postgres connection string for config persistence (`DATABASE_URL`);
    /// in-memory store when unset
    pub database_url: Option<String>,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            scanner_bin: env_or("SCANNER_BIN", "nmap"),
            graph_url: env::var("GRAPH_URL").ok().filter(|v| !v.is_empty()),
            graph_user: env_or("GRAPH_USER", "neo4j"),
            graph_password: env_or("GRAPH_PASSWORD", ""),
            graph_database: env_or("GRAPH_DATABASE", "neo4j"),
            task_retention: env::var("TASK_RETENTION_SECONDS")
                .ok()
                .and_then(|v| parse_or_warn("TASK_RETENTION_SECONDS", &v))
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RETENTION),
            queue_capacity: env::var("SUBSCRIPTION_QUEUE_CAP")
                .ok()
                .and_then(|v| parse_or_warn("SUBSCRIPTION_QUEUE_CAP", &v))
                .map(|v: u64| v as usize)
                .unwrap_or(DEFAULT_QUEUE_CAPACITY),
            database_url: env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

fn parse_or_warn<T: std::str::FromStr>(key: &str, value: &str) -> Option<T> {
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(key, value, "ignoring unparseable environment variable");
            None
        }
    }
}
