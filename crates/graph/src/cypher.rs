//! Cypher-over-HTTP graph store client.
//!
//! Talks to the graph database's transactional HTTP endpoint; one `apply`
//! is one `tx/commit` request carrying the full statement list for a host,
//! so the batch commits or fails atomically.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use eidolon_core::error::GraphError;

use crate::store::{GraphStore, HostBatch};

/// Per-request deadline for a single store call.
const CALL_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Serialize)]
struct Statement {
    statement: String,
    parameters: serde_json::Value,
}

#[derive(Serialize)]
struct TxRequest {
    statements: Vec<Statement>,
}

#[derive(Deserialize)]
struct TxResponse {
    #[serde(default)]
    errors: Vec<TxError>,
}

#[derive(Deserialize)]
struct TxError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Graph store backed by an HTTP Cypher transaction endpoint.
#[derive(Debug, Clone)]
pub struct CypherGraphStore {
    client: reqwest::Client,
    endpoint: String,
    user: String,
    password: String,
}

impl CypherGraphStore {
    /// Connect to `base_url` (e.g. `http://localhost:7474`) and the named
    /// database.
    pub fn new(
        base_url: &str,
        database: &str,
        user: &str,
        password: &str,
    ) -> Result<Self, GraphError> {
        let client = reqwest::Client::builder()
            .timeout(CALL_DEADLINE)
            .build()
            .map_err(|err| GraphError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            endpoint: format!(
                "{}/db/{database}/tx/commit",
                base_url.trim_end_matches('/')
            ),
            user: user.to_string(),
            password: password.to_string(),
        })
    }

    /// Build the statement list for one host batch.
    ///
    /// Nested metadata rides as JSON strings: the store only takes scalar
    /// and array properties.
    fn statements_for(batch: &HostBatch) -> Vec<Statement> {
        let asset = &batch.asset;
        let identifiers: Vec<&str> = asset.identifiers.iter().map(String::as_str).collect();
        let ports_json = serde_json::to_string(&asset.metadata.ports).unwrap_or_default();
        let os_json = serde_json::to_string(&asset.metadata.os_matches).unwrap_or_default();

        let mut statements = vec![Statement {
            statement: "\
MERGE (a:Asset {node_id: $node_id})
ON CREATE SET a.created_at = datetime()
SET a.identifiers = [x IN coalesce(a.identifiers, []) WHERE NOT x IN $identifiers] + $identifiers,
    a.hostname = $hostname,
    a.mac = $mac,
    a.vendor = $vendor,
    a.status = $status,
    a.lifecycle_state = $status,
    a.ports = $ports,
    a.os_matches = $os_matches,
    a.distance = $distance,
    a.rtt_srtt_us = $rtt_srtt_us,
    a.uptime_seconds = $uptime_seconds,
    a.last_seen = datetime($last_seen),
    a.updated_at = datetime()"
                .to_string(),
            parameters: json!({
                "node_id": asset.node_id,
                "identifiers": identifiers,
                "hostname": asset.metadata.hostname,
                "mac": asset.metadata.mac,
                "vendor": asset.metadata.vendor,
                "status": asset.lifecycle_state.to_string(),
                "ports": ports_json,
                "os_matches": os_json,
                "distance": asset.metadata.distance,
                "rtt_srtt_us": asset.metadata.rtt_srtt_us,
                "uptime_seconds": asset.metadata.uptime_seconds,
                "last_seen": asset.last_seen.to_rfc3339(),
            }),
        }];

        if let Some(network) = &batch.network {
            statements.push(Statement {
                statement: "\
MERGE (n:NetworkContainer {node_id: $net_id})
ON CREATE SET n.created_at = datetime()
SET n.cidr = $cidr, n.network_type = $network_type, n.updated_at = datetime()
WITH n
MATCH (a:Asset {node_id: $node_id})
MERGE (n)-[:CONTAINS]->(a)"
                    .to_string(),
                parameters: json!({
                    "net_id": network.node_id,
                    "cidr": network.cidr,
                    "network_type": network.network_type,
                    "node_id": asset.node_id,
                }),
            });
        }

        for service in &batch.services {
            statements.push(Statement {
                statement: "\
MATCH (a:Asset {node_id: $node_id})
MERGE (s:Service {node_id: $svc_id})
SET s.port = $port, s.proto = $proto, s.state = $state,
    s.name = $name, s.product = $product, s.version = $version,
    s.updated_at = datetime()
MERGE (a)-[:HAS_SERVICE]->(s)"
                    .to_string(),
                parameters: json!({
                    "node_id": asset.node_id,
                    "svc_id": service.node_id,
                    "port": service.port,
                    "proto": service.proto.to_string(),
                    "state": service.state.to_string(),
                    "name": service.name,
                    "product": service.product,
                    "version": service.version,
                }),
            });
        }

        // Services that vanished since the last scan are closed, not
        // deleted, so history survives
        let current: Vec<&str> = batch
            .services
            .iter()
            .map(|s| s.node_id.as_str())
            .collect();
        statements.push(Statement {
            statement: "\
MATCH (a:Asset {node_id: $node_id})-[:HAS_SERVICE]->(s:Service)
WHERE NOT s.node_id IN $current
SET s.state = 'closed', s.updated_at = datetime()"
                .to_string(),
            parameters: json!({
                "node_id": asset.node_id,
                "current": current,
            }),
        });

        statements
    }
}

#[async_trait]
impl GraphStore for CypherGraphStore {
    async fn apply(&self, batch: &HostBatch) -> Result<(), GraphError> {
        let request = TxRequest {
            statements: Self::statements_for(batch),
        };
        debug!(host = %batch.ip, statements = request.statements.len(), "committing host batch");

        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.user, Some(&self.password))
            .json(&request)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    GraphError::Deadline(CALL_DEADLINE)
                } else {
                    GraphError::Transport(err.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(GraphError::Rejected(format!("http status {status}")));
        }

        let body: TxResponse = response
            .json()
            .await
            .map_err(|err| GraphError::Transport(err.to_string()))?;
        if !body.errors.is_empty() {
            let detail = body
                .errors
                .iter()
                .map(|e| format!("{}: {}", e.code, e.message))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(GraphError::Rejected(detail));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eidolon_core::graph::{HostObservation, PortObservation};
    use eidolon_core::types::{PortState, Protocol, TargetSpec};

    fn batch() -> HostBatch {
        let obs = HostObservation {
            ip: Some("10.0.0.5".parse().unwrap()),
            up: true,
            mac: Some("aa:bb:cc:dd:ee:ff".into()),
            ports: vec![PortObservation {
                port: 22,
                proto: Protocol::Tcp,
                state: PortState::Open,
                service: Some("ssh".into()),
                product: None,
                version: None,
            }],
            ..Default::default()
        };
        let scope: TargetSpec = "10.0.0.0/24".parse().unwrap();
        HostBatch::from_observation(&obs, "10.0.0.5".parse().unwrap(), Some(&scope))
    }

    #[test]
    fn test_statement_list_covers_the_whole_batch() {
        let batch = batch();
        let statements = CypherGraphStore::statements_for(&batch);
        // Asset, network + CONTAINS, one service, close-missing
        assert_eq!(statements.len(), 4);
        assert!(statements[0].statement.contains("MERGE (a:Asset"));
        assert!(statements[1].statement.contains(":CONTAINS"));
        assert!(statements[2].statement.contains(":HAS_SERVICE"));
        assert!(statements[3].statement.contains("s.state = 'closed'"));
    }

    #[test]
    fn test_asset_parameters_serialize_ports_as_json() {
        let batch = batch();
        let statements = CypherGraphStore::statements_for(&batch);
        let ports = statements[0].parameters["ports"].as_str().unwrap();
        let parsed: Vec<PortObservation> = serde_json::from_str(ports).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].port, 22);
    }
}
