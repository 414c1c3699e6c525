//! In-memory graph store.
//!
//! Implements the same merge semantics as the Cypher store against plain
//! maps. Used by tests and by local development without a graph database;
//! supports scripted per-host failures to exercise the writer's retry
//! path.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Mutex;

use async_trait::async_trait;

use eidolon_core::error::GraphError;
use eidolon_core::graph::{Asset, NetworkContainer, NodeId, Service};

use crate::store::{GraphStore, HostBatch};

#[derive(Debug, Default)]
struct MemoryGraph {
    assets: BTreeMap<NodeId, Asset>,
    networks: BTreeMap<NodeId, NetworkContainer>,
    services: BTreeMap<NodeId, Service>,
    contains: HashSet<(NodeId, NodeId)>,
    has_service: HashSet<(NodeId, NodeId)>,
    fail_remaining: HashMap<Ipv4Addr, u32>,
    apply_calls: u64,
}

/// Graph store holding everything in process memory.
#[derive(Debug, Default)]
pub struct MemoryGraphStore {
    inner: Mutex<MemoryGraph>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` applies for `ip` fail with a rejected
    /// transaction.
    pub fn fail_host(&self, ip: Ipv4Addr, times: u32) {
        self.inner
            .lock()
            .expect("memory graph mutex poisoned")
            .fail_remaining
            .insert(ip, times);
    }

    /// Number of `apply` calls observed, including failed ones.
    pub fn apply_calls(&self) -> u64 {
        self.inner
            .lock()
            .expect("memory graph mutex poisoned")
            .apply_calls
    }

    pub fn asset(&self, node_id: &NodeId) -> Option<Asset> {
        self.inner
            .lock()
            .expect("memory graph mutex poisoned")
            .assets
            .get(node_id)
            .cloned()
    }

    /// Find an asset by any known identifier (IP, MAC, hostname).
    pub fn asset_by_identifier(&self, identifier: &str) -> Option<Asset> {
        self.inner
            .lock()
            .expect("memory graph mutex poisoned")
            .assets
            .values()
            .find(|asset| asset.identifiers.contains(identifier))
            .cloned()
    }

    pub fn assets(&self) -> Vec<Asset> {
        self.inner
            .lock()
            .expect("memory graph mutex poisoned")
            .assets
            .values()
            .cloned()
            .collect()
    }

    pub fn asset_node_ids(&self) -> Vec<NodeId> {
        self.inner
            .lock()
            .expect("memory graph mutex poisoned")
            .assets
            .keys()
            .cloned()
            .collect()
    }

    pub fn networks(&self) -> Vec<NetworkContainer> {
        self.inner
            .lock()
            .expect("memory graph mutex poisoned")
            .networks
            .values()
            .cloned()
            .collect()
    }

    /// Services linked to an asset, in port order.
    pub fn services_of(&self, asset: &NodeId) -> Vec<Service> {
        let graph = self.inner.lock().expect("memory graph mutex poisoned");
        let mut services: Vec<Service> = graph
            .has_service
            .iter()
            .filter(|(a, _)| a == asset)
            .filter_map(|(_, s)| graph.services.get(s).cloned())
            .collect();
        services.sort_by_key(|s| s.port);
        services
    }

    /// Whether a `CONTAINS` edge exists from network to asset.
    pub fn contains_edge(&self, network: &NodeId, asset: &NodeId) -> bool {
        self.inner
            .lock()
            .expect("memory graph mutex poisoned")
            .contains
            .contains(&(network.clone(), asset.clone()))
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn apply(&self, batch: &HostBatch) -> Result<(), GraphError> {
        let mut graph = self.inner.lock().expect("memory graph mutex poisoned");
        graph.apply_calls += 1;

        if let Some(remaining) = graph.fail_remaining.get_mut(&batch.ip) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(GraphError::Rejected(format!(
                    "injected failure for {}",
                    batch.ip
                )));
            }
        }

        // Asset merge: union identifiers, overwrite observed metadata
        let incoming = &batch.asset;
        match graph.assets.get_mut(&incoming.node_id) {
            Some(existing) => {
                existing
                    .identifiers
                    .extend(incoming.identifiers.iter().cloned());
                existing.metadata = incoming.metadata.clone();
                existing.lifecycle_state = incoming.lifecycle_state;
                existing.last_seen = incoming.last_seen;
            }
            None => {
                graph
                    .assets
                    .insert(incoming.node_id.clone(), incoming.clone());
            }
        }

        if let Some(network) = &batch.network {
            graph
                .networks
                .entry(network.node_id.clone())
                .or_insert_with(|| network.clone());
            graph
                .contains
                .insert((network.node_id.clone(), incoming.node_id.clone()));
        }

        for service in &batch.services {
            graph
                .services
                .insert(service.node_id.clone(), service.clone());
            graph
                .has_service
                .insert((incoming.node_id.clone(), service.node_id.clone()));
        }

        // Close services that did not show up in this scan
        let current: HashSet<&NodeId> = batch.services.iter().map(|s| &s.node_id).collect();
        let linked: Vec<NodeId> = graph
            .has_service
            .iter()
            .filter(|(a, _)| a == &incoming.node_id)
            .map(|(_, s)| s.clone())
            .collect();
        for service_id in linked {
            if !current.contains(&service_id) {
                if let Some(service) = graph.services.get_mut(&service_id) {
                    service.state = eidolon_core::types::PortState::Closed;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eidolon_core::graph::{HostObservation, PortObservation};
    use eidolon_core::types::{PortState, Protocol, TargetSpec};

    fn observation(ports: Vec<u16>) -> HostObservation {
        HostObservation {
            ip: Some("10.0.0.5".parse().unwrap()),
            up: true,
            ports: ports
                .into_iter()
                .map(|port| PortObservation {
                    port,
                    proto: Protocol::Tcp,
                    state: PortState::Open,
                    service: None,
                    product: None,
                    version: None,
                })
                .collect(),
            ..Default::default()
        }
    }

    fn batch(ports: Vec<u16>) -> HostBatch {
        let scope: TargetSpec = "10.0.0.0/24".parse().unwrap();
        HostBatch::from_observation(&observation(ports), "10.0.0.5".parse().unwrap(), Some(&scope))
    }

    #[tokio::test]
    async fn test_reapplying_a_batch_is_idempotent() {
        let store = MemoryGraphStore::new();
        let batch = batch(vec![22]);
        store.apply(&batch).await.unwrap();
        store.apply(&batch).await.unwrap();

        assert_eq!(store.assets().len(), 1);
        assert_eq!(store.networks().len(), 1);
        assert_eq!(store.services_of(&batch.asset.node_id).len(), 1);
    }

    #[tokio::test]
    async fn test_vanished_services_are_closed_not_deleted() {
        let store = MemoryGraphStore::new();
        let first = batch(vec![22, 80]);
        store.apply(&first).await.unwrap();

        let second = batch(vec![22]);
        store.apply(&second).await.unwrap();

        let services = store.services_of(&second.asset.node_id);
        assert_eq!(services.len(), 2);
        let port80 = services.iter().find(|s| s.port == 80).unwrap();
        assert_eq!(port80.state, PortState::Closed);
        let port22 = services.iter().find(|s| s.port == 22).unwrap();
        assert_eq!(port22.state, PortState::Open);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = MemoryGraphStore::new();
        let batch = batch(vec![22]);
        store.fail_host(batch.ip, 2);

        assert!(store.apply(&batch).await.is_err());
        assert!(store.apply(&batch).await.is_err());
        assert!(store.apply(&batch).await.is_ok());
        assert_eq!(store.apply_calls(), 3);
    }
}
