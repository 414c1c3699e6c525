//! Graph store abstraction.
//!
//! The writer talks to the store through [`GraphStore`]; one call applies
//! one host's batch as a single transaction. The store holds all graph
//! state, so the writer stays stateless between calls.

use std::net::Ipv4Addr;

use async_trait::async_trait;

use eidolon_core::error::GraphError;
use eidolon_core::graph::{Asset, HostObservation, NetworkContainer, Service};
use eidolon_core::types::TargetSpec;

/// One host's worth of graph writes: the asset node, its containing
/// network, and one service node per observed port.
#[derive(Debug, Clone)]
pub struct HostBatch {
    pub ip: Ipv4Addr,
    pub asset: Asset,
    pub network: Option<NetworkContainer>,
    pub services: Vec<Service>,
}

impl HostBatch {
    /// Assemble a batch from a host observation and its network scope.
    pub fn from_observation(
        obs: &HostObservation,
        ip: Ipv4Addr,
        scope: Option<&TargetSpec>,
    ) -> Self {
        let scope_str = scope.map(|s| s.to_string()).unwrap_or_default();
        let asset = Asset::from_observation(obs, ip, &scope_str);
        let network = scope.map(|s| NetworkContainer::from_scope(&s.to_string()));
        let services = obs
            .ports
            .iter()
            .map(|port| Service::from_observation(&asset.node_id, port))
            .collect();
        Self {
            ip,
            asset,
            network,
            services,
        }
    }
}

/// A property-graph store that can absorb host batches idempotently.
///
/// `apply` must behave as a merge: re-applying the same batch converges on
/// the same nodes, identifiers are unioned, port metadata is replaced
/// wholesale, and services absent from the batch are marked closed rather
/// than deleted.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn apply(&self, batch: &HostBatch) -> Result<(), GraphError>;
}
