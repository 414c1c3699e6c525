//! Core types and data structures for Eidolon

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// A single scan target as written in a scan configuration.
///
/// Targets are IPv4 only: a bare address, a dash range, or a CIDR block.
/// A dash range with a bare numeric right-hand side (`10.0.0.1-20`)
/// inherits the first three octets of the left-hand side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetSpec {
    /// Single IPv4 address
    Single(Ipv4Addr),
    /// Inclusive address range
    Range { start: Ipv4Addr, end: Ipv4Addr },
    /// CIDR block; bounds are the masked network and broadcast addresses
    Cidr { network: Ipv4Addr, prefix: u8 },
}

impl TargetSpec {
    /// Inclusive `[start, end]` bounds of this target as IPv4 integers.
    pub fn bounds(&self) -> (u32, u32) {
        match self {
            TargetSpec::Single(addr) => {
                let n = u32::from(*addr);
                (n, n)
            }
            TargetSpec::Range { start, end } => (u32::from(*start), u32::from(*end)),
            TargetSpec::Cidr { network, prefix } => {
                let base = u32::from(*network);
                let host_bits = 32 - u32::from(*prefix);
                let end = if host_bits == 32 {
                    u32::MAX
                } else {
                    base | ((1u32 << host_bits) - 1)
                };
                (base, end)
            }
        }
    }

    /// Number of addresses covered by this target.
    pub fn host_count(&self) -> u64 {
        let (start, end) = self.bounds();
        u64::from(end) - u64::from(start) + 1
    }

    /// Whether `addr` falls inside this target.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let (start, end) = self.bounds();
        let n = u32::from(addr);
        n >= start && n <= end
    }

    /// Iterate every address in the target in ascending order.
    pub fn addresses(&self) -> impl Iterator<Item = Ipv4Addr> {
        let (start, end) = self.bounds();
        (start..=end).map(Ipv4Addr::from)
    }
}

impl fmt::Display for TargetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetSpec::Single(addr) => write!(f, "{}", addr),
            TargetSpec::Range { start, end } => write!(f, "{}-{}", start, end),
            TargetSpec::Cidr { network, prefix } => write!(f, "{}/{}", network, prefix),
        }
    }
}

impl FromStr for TargetSpec {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ValidationError::InvalidTarget(s.to_string()));
        }

        // CIDR notation
        if let Some((network_str, prefix_str)) = s.split_once('/') {
            let addr: Ipv4Addr = network_str
                .parse()
                .map_err(|_| ValidationError::InvalidTarget(s.to_string()))?;
            let prefix: u8 = prefix_str
                .parse()
                .map_err(|_| ValidationError::InvalidTarget(s.to_string()))?;
            if prefix > 32 {
                return Err(ValidationError::InvalidTarget(s.to_string()));
            }
            // Normalize to the masked network address
            let mask = if prefix == 0 {
                0
            } else {
                u32::MAX << (32 - u32::from(prefix))
            };
            let network = Ipv4Addr::from(u32::from(addr) & mask);
            return Ok(TargetSpec::Cidr { network, prefix });
        }

        // Dash range; a bare numeric right side inherits the left's octets
        if let Some((start_str, end_str)) = s.split_once('-') {
            let start: Ipv4Addr = start_str
                .trim()
                .parse()
                .map_err(|_| ValidationError::InvalidTarget(s.to_string()))?;
            let end_str = end_str.trim();
            let end: Ipv4Addr = if end_str.contains('.') {
                end_str
                    .parse()
                    .map_err(|_| ValidationError::InvalidTarget(s.to_string()))?
            } else {
                let last: u8 = end_str
                    .parse()
                    .map_err(|_| ValidationError::InvalidTarget(s.to_string()))?;
                let octets = start.octets();
                Ipv4Addr::new(octets[0], octets[1], octets[2], last)
            };
            if u32::from(end) < u32::from(start) {
                return Err(ValidationError::InvalidTarget(s.to_string()));
            }
            return Ok(TargetSpec::Range { start, end });
        }

        // Single address
        let addr: Ipv4Addr = s
            .parse()
            .map_err(|_| ValidationError::InvalidTarget(s.to_string()))?;
        Ok(TargetSpec::Single(addr))
    }
}

/// Network protocol types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(format!("unknown protocol: {other}")),
        }
    }
}

/// Port state as reported by the scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortState {
    #[serde(rename = "open")]
    Open,
    #[serde(rename = "closed")]
    Closed,
    #[serde(rename = "filtered")]
    Filtered,
    #[serde(rename = "unfiltered")]
    Unfiltered,
    #[serde(rename = "open|filtered")]
    OpenFiltered,
    #[serde(rename = "closed|filtered")]
    ClosedFiltered,
}

impl PortState {
    /// Whether the port accepted connections in the latest scan.
    pub fn is_open(&self) -> bool {
        matches!(self, PortState::Open)
    }
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortState::Open => write!(f, "open"),
            PortState::Closed => write!(f, "closed"),
            PortState::Filtered => write!(f, "filtered"),
            PortState::Unfiltered => write!(f, "unfiltered"),
            PortState::OpenFiltered => write!(f, "open|filtered"),
            PortState::ClosedFiltered => write!(f, "closed|filtered"),
        }
    }
}

impl FromStr for PortState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(PortState::Open),
            "closed" => Ok(PortState::Closed),
            "filtered" => Ok(PortState::Filtered),
            "unfiltered" => Ok(PortState::Unfiltered),
            "open|filtered" => Ok(PortState::OpenFiltered),
            "closed|filtered" => Ok(PortState::ClosedFiltered),
            other => Err(format!("unknown port state: {other}")),
        }
    }
}

/// Host state as reported by the discovery stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostState {
    Up,
    Down,
    Unknown,
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostState::Up => write!(f, "up"),
            HostState::Down => write!(f, "down"),
            HostState::Unknown => write!(f, "unknown"),
        }
    }
}
