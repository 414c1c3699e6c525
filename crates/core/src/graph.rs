//! Graph node models for discovered infrastructure.
//!
//! Node identity is content-derived: an asset is keyed by its MAC when one
//! was observed, otherwise by its address scoped to the network it was
//! found in, so re-running the same plan converges on the same nodes.

use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::{PortState, Protocol};

/// Stable identifier of a graph node.
///
/// Derived as a truncated SHA-256 over the node label and its primary key,
/// so the same observation always lands on the same node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Derive a node id from a label and a primary key.
    pub fn derive(label: &str, key: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(label.as_bytes());
        hasher.update(b":");
        hasher.update(key.as_bytes());
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(32);
        for byte in &digest[..16] {
            hex.push_str(&format!("{byte:02x}"));
        }
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Asset lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Online,
    Idle,
    Offline,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Online => write!(f, "online"),
            LifecycleState::Idle => write!(f, "idle"),
            LifecycleState::Offline => write!(f, "offline"),
        }
    }
}

/// One port observation from the latest scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortObservation {
    pub port: u16,
    pub proto: Protocol,
    pub state: PortState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// One OS detection guess
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsObservation {
    pub name: String,
    pub accuracy: u8,
}

/// Everything observed about a single host during one scan.
///
/// The parser emits one of these per completed report subtree; the writer
/// turns it into an asset upsert.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostObservation {
    pub ip: Option<Ipv4Addr>,
    pub up: bool,
    pub hostname: Option<String>,
    pub mac: Option<String>,
    pub vendor: Option<String>,
    pub rtt_srtt_us: Option<u64>,
    pub distance: Option<u8>,
    pub uptime_seconds: Option<u64>,
    pub ports: Vec<PortObservation>,
    pub os_matches: Vec<OsObservation>,
}

impl HostObservation {
    /// A MAC counts as identifying only when present and non-zero.
    pub fn identifying_mac(&self) -> Option<&str> {
        self.mac
            .as_deref()
            .filter(|mac| !mac.is_empty() && mac.bytes().any(|b| b != b'0' && b != b':'))
    }
}

/// Mutable metadata carried by an asset node.
///
/// `ports` always reflects the most recent scan wholesale so stale open
/// ports disappear; the other fields are overwritten when observed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    pub status: Option<LifecycleState>,
    pub ports: Vec<PortObservation>,
    pub os_matches: Vec<OsObservation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtt_srtt_us: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u64>,
}

/// Infrastructure asset node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub node_id: NodeId,
    /// Known IPs, MACs, and hostnames; unioned across scans
    pub identifiers: BTreeSet<String>,
    pub metadata: AssetMetadata,
    pub lifecycle_state: LifecycleState,
    pub last_seen: DateTime<Utc>,
}

impl Asset {
    /// Node id for a host: keyed by MAC when identifying, else by address
    /// scoped to the containing network.
    pub fn node_id_for(mac: Option<&str>, ip: Ipv4Addr, scope: &str) -> NodeId {
        match mac {
            Some(mac) => NodeId::derive("Asset", &mac.to_ascii_lowercase()),
            None => NodeId::derive("Asset", &format!("{ip}@{scope}")),
        }
    }

    /// Build an asset node from a host observation.
    pub fn from_observation(obs: &HostObservation, ip: Ipv4Addr, scope: &str) -> Self {
        let node_id = Self::node_id_for(obs.identifying_mac(), ip, scope);

        let mut identifiers = BTreeSet::new();
        identifiers.insert(ip.to_string());
        if let Some(mac) = obs.identifying_mac() {
            identifiers.insert(mac.to_ascii_lowercase());
        }
        if let Some(hostname) = &obs.hostname {
            identifiers.insert(hostname.clone());
        }

        let state = if obs.up {
            LifecycleState::Online
        } else {
            LifecycleState::Offline
        };

        Self {
            node_id,
            identifiers,
            metadata: AssetMetadata {
                hostname: obs.hostname.clone(),
                mac: obs.identifying_mac().map(|m| m.to_ascii_lowercase()),
                vendor: obs.vendor.clone(),
                status: Some(state),
                ports: obs.ports.clone(),
                os_matches: obs.os_matches.clone(),
                distance: obs.distance,
                rtt_srtt_us: obs.rtt_srtt_us,
                uptime_seconds: obs.uptime_seconds,
            },
            lifecycle_state: state,
            last_seen: Utc::now(),
        }
    }
}

/// Network container node: a CIDR block or address range that contains
/// assets via `CONTAINS` edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkContainer {
    pub node_id: NodeId,
    pub cidr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_type: Option<String>,
}

impl NetworkContainer {
    /// Container node for a normalized scope string.
    pub fn from_scope(scope: &str) -> Self {
        Self {
            node_id: NodeId::derive("NetworkContainer", scope),
            cidr: scope.to_string(),
            name: None,
            network_type: Some("segment".to_string()),
        }
    }
}

/// Service node: one observed port on an asset, linked via `HAS_SERVICE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub node_id: NodeId,
    pub port: u16,
    pub proto: Protocol,
    pub state: PortState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Service {
    /// Service node for a port observation on an asset.
    pub fn from_observation(asset: &NodeId, obs: &PortObservation) -> Self {
        Self {
            node_id: NodeId::derive(
                "Service",
                &format!("{}:{}/{}", asset.as_str(), obs.port, obs.proto),
            ),
            port: obs.port,
            proto: obs.proto,
            state: obs.state,
            name: obs.service.clone(),
            product: obs.product.clone(),
            version: obs.version.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_ids_are_stable() {
        let a = NodeId::derive("Asset", "aa:bb:cc:dd:ee:ff");
        let b = NodeId::derive("Asset", "aa:bb:cc:dd:ee:ff");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 32);

        // Labels partition the key space
        let c = NodeId::derive("Service", "aa:bb:cc:dd:ee:ff");
        assert_ne!(a, c);
    }

    #[test]
    fn test_mac_wins_over_ip_scope() {
        let ip: Ipv4Addr = "10.0.0.5".parse().unwrap();
        let with_mac = Asset::node_id_for(Some("AA:BB:CC:DD:EE:FF"), ip, "10.0.0.0/24");
        let without = Asset::node_id_for(None, ip, "10.0.0.0/24");
        assert_ne!(with_mac, without);

        // MAC keys are case-insensitive
        let lower = Asset::node_id_for(Some("aa:bb:cc:dd:ee:ff"), ip, "10.0.0.0/24");
        assert_eq!(with_mac, lower);
    }

    #[test]
    fn test_zero_mac_is_not_identifying() {
        let obs = HostObservation {
            mac: Some("00:00:00:00:00:00".to_string()),
            ..Default::default()
        };
        assert!(obs.identifying_mac().is_none());

        let obs = HostObservation {
            mac: Some("00:00:5e:00:53:01".to_string()),
            ..Default::default()
        };
        assert_eq!(obs.identifying_mac(), Some("00:00:5e:00:53:01"));
    }

    #[test]
    fn test_asset_from_observation_collects_identifiers() {
        let obs = HostObservation {
            ip: Some("10.0.0.5".parse().unwrap()),
            up: true,
            hostname: Some("printer.local".into()),
            mac: Some("AA:BB:CC:DD:EE:FF".into()),
            ..Default::default()
        };
        let asset = Asset::from_observation(&obs, "10.0.0.5".parse().unwrap(), "10.0.0.0/24");
        assert!(asset.identifiers.contains("10.0.0.5"));
        assert!(asset.identifiers.contains("aa:bb:cc:dd:ee:ff"));
        assert!(asset.identifiers.contains("printer.local"));
        assert_eq!(asset.lifecycle_state, LifecycleState::Online);
    }

    #[test]
    fn test_same_scope_same_asset_id() {
        let ip: Ipv4Addr = "10.0.0.5".parse().unwrap();
        let obs = HostObservation {
            ip: Some(ip),
            up: true,
            ..Default::default()
        };
        let first = Asset::from_observation(&obs, ip, "10.0.0.0/24");
        let second = Asset::from_observation(&obs, ip, "10.0.0.0/24");
        assert_eq!(first.node_id, second.node_id);

        let other_scope = Asset::from_observation(&obs, ip, "10.0.0.0/16");
        assert_ne!(first.node_id, other_scope.node_id);
    }
}
