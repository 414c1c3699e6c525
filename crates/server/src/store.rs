//! Per-user scan configuration persistence.
//!
//! The stored shape mirrors the wire shape: target list, port list, preset
//! tag, and an options document. Unknown users fall back to the default
//! configuration.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::debug;

use eidolon_core::config::{PortPreset, ScanConfig, ScanOptions};

/// Config store failures. These surface as 500s; validation happens before
/// a config ever reaches the store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("config store error: {0}")]
    Backend(String),
}

/// Store of per-user scan configurations.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get(&self, user_id: &str) -> Result<Option<ScanConfig>, StoreError>;
    async fn put(&self, user_id: &str, config: &ScanConfig) -> Result<(), StoreError>;
}

/// Postgres-backed config store.
#[derive(Debug, Clone)]
pub struct PostgresConfigStore {
    pool: PgPool,
}

impl PostgresConfigStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the backing table if this is a fresh database.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scan_configs (
                user_id TEXT PRIMARY KEY,
                network_cidrs TEXT[] NOT NULL,
                ports INT[] NOT NULL,
                port_preset TEXT NOT NULL,
                options JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(format!("failed to ensure scan_configs table: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for PostgresConfigStore {
    async fn get(&self, user_id: &str) -> Result<Option<ScanConfig>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT network_cidrs, ports, port_preset, options
            FROM scan_configs
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(format!("failed to load scan config: {e}")))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let network_cidrs: Vec<String> = row
            .try_get("network_cidrs")
            .map_err(|e| StoreError::Backend(format!("failed to read network_cidrs: {e}")))?;
        let ports: Vec<i32> = row
            .try_get("ports")
            .map_err(|e| StoreError::Backend(format!("failed to read ports: {e}")))?;
        let preset: String = row
            .try_get("port_preset")
            .map_err(|e| StoreError::Backend(format!("failed to read port_preset: {e}")))?;
        let options: serde_json::Value = row
            .try_get("options")
            .map_err(|e| StoreError::Backend(format!("failed to read options: {e}")))?;

        let config = ScanConfig {
            network_cidrs,
            ports: ports.into_iter().map(|p| p as u16).collect(),
            port_preset: PortPreset::from_str(&preset)
                .map_err(|e| StoreError::Backend(format!("stored preset invalid: {e}")))?,
            options: serde_json::from_value::<ScanOptions>(options)
                .map_err(|e| StoreError::Backend(format!("stored options invalid: {e}")))?,
        };
        debug!(user_id, "scan config loaded");
        Ok(Some(config))
    }

    async fn put(&self, user_id: &str, config: &ScanConfig) -> Result<(), StoreError> {
        let ports: Vec<i32> = config.ports.iter().map(|p| *p as i32).collect();
        let options = serde_json::to_value(config.options)
            .map_err(|e| StoreError::Backend(format!("failed to encode options: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO scan_configs (user_id, network_cidrs, ports, port_preset, options, updated_at)
            VALUES ($1, $2, $3, $4, $5, now())
            ON CONFLICT (user_id) DO UPDATE SET
                network_cidrs = EXCLUDED.network_cidrs,
                ports = EXCLUDED.ports,
                port_preset = EXCLUDED.port_preset,
                options = EXCLUDED.options,
                updated_at = now()
            "#,
        )
        .bind(user_id)
        .bind(&config.network_cidrs)
        .bind(&ports)
        .bind(config.port_preset.as_str())
        .bind(options)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(format!("failed to store scan config: {e}")))?;
        Ok(())
    }
}

/// In-memory config store for tests and database-less development.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    configs: Mutex<HashMap<String, ScanConfig>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get(&self, user_id: &str) -> Result<Option<ScanConfig>, StoreError> {
        Ok(self
            .configs
            .lock()
            .expect("config store mutex poisoned")
            .get(user_id)
            .cloned())
    }

    async fn put(&self, user_id: &str, config: &ScanConfig) -> Result<(), StoreError> {
        self.configs
            .lock()
            .expect("config store mutex poisoned")
            .insert(user_id.to_string(), config.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryConfigStore::new();
        assert!(store.get("alice").await.unwrap().is_none());

        let config = ScanConfig::default();
        store.put("alice", &config).await.unwrap();
        assert_eq!(store.get("alice").await.unwrap(), Some(config));
        assert!(store.get("bob").await.unwrap().is_none());
    }
}
