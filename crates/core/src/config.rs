//! Scan configuration for Eidolon

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Ports scanned by the `fast` preset.
pub const FAST_PORTS: &[u16] = &[80, 443];

/// Ports scanned by the `normal` preset.
pub const NORMAL_PORTS: &[u16] = &[
    21, 22, 23, 25, 53, 80, 110, 143, 443, 465, 587, 993, 995, 3306, 3389, 5432, 8080, 8443,
];

/// Upper bound on target entries per configuration.
pub const MAX_TARGETS: usize = 50;

/// Upper bound on explicit port entries per configuration.
pub const MAX_PORTS: usize = 1000;

/// Named port selection presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortPreset {
    /// Web ports only
    Fast,
    /// Common service ports
    Normal,
    /// All 65535 TCP ports
    Full,
    /// Caller-provided port list
    Custom,
}

impl PortPreset {
    /// The fixed port table for this preset, if it has one.
    pub fn ports(&self) -> Option<&'static [u16]> {
        match self {
            PortPreset::Fast => Some(FAST_PORTS),
            PortPreset::Normal => Some(NORMAL_PORTS),
            PortPreset::Full | PortPreset::Custom => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PortPreset::Fast => "fast",
            PortPreset::Normal => "normal",
            PortPreset::Full => "full",
            PortPreset::Custom => "custom",
        }
    }
}

impl std::str::FromStr for PortPreset {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fast" => Ok(PortPreset::Fast),
            "normal" => Ok(PortPreset::Normal),
            "full" => Ok(PortPreset::Full),
            "custom" => Ok(PortPreset::Custom),
            other => Err(ValidationError::InvalidPreset(other.to_string())),
        }
    }
}

/// Tuning options for a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    /// Probe parallelism for the ping sweep stage
    pub ping_concurrency: u16,
    /// Probe parallelism for the port scan stage
    pub port_scan_workers: u16,
    /// Resolve hostnames via reverse DNS
    pub dns_resolution: bool,
    /// Request OS and service version detection
    pub aggressive: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            ping_concurrency: 128,
            port_scan_workers: 32,
            dns_resolution: true,
            aggressive: false,
        }
    }
}

impl ScanOptions {
    /// Allowed range for `ping_concurrency`.
    pub const PING_CONCURRENCY_RANGE: (u16, u16) = (32, 512);
    /// Allowed range for `port_scan_workers`.
    pub const PORT_WORKERS_RANGE: (u16, u16) = (8, 64);

    fn validate(&self) -> Result<(), ValidationError> {
        let (min, max) = Self::PING_CONCURRENCY_RANGE;
        if self.ping_concurrency < min || self.ping_concurrency > max {
            return Err(ValidationError::OptionOutOfRange {
                option: "ping_concurrency",
                min: min.into(),
                max: max.into(),
            });
        }
        let (min, max) = Self::PORT_WORKERS_RANGE;
        if self.port_scan_workers < min || self.port_scan_workers > max {
            return Err(ValidationError::OptionOutOfRange {
                option: "port_scan_workers",
                min: min.into(),
                max: max.into(),
            });
        }
        Ok(())
    }
}

/// A user's scan configuration.
///
/// This is the stored/wire form; target strings are parsed and checked for
/// overlap when a [`crate::plan::ScanPlan`] is built from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Target ranges: single addresses, dash ranges, or CIDR blocks
    pub network_cidrs: Vec<String>,
    /// Explicit port list; populated from the preset table for
    /// `fast`/`normal`, empty for `full`
    pub ports: Vec<u16>,
    /// Port selection preset
    pub port_preset: PortPreset,
    /// Scan tuning options
    pub options: ScanOptions,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            network_cidrs: vec!["192.168.1.0/24".to_string()],
            ports: NORMAL_PORTS.to_vec(),
            port_preset: PortPreset::Normal,
            options: ScanOptions::default(),
        }
    }
}

impl ScanConfig {
    /// Validate and normalize this configuration in place.
    ///
    /// Trims target strings, resolves the preset port table, and checks
    /// port and option bounds. Target parsing and overlap detection happen
    /// during planning; calling this first guarantees the stored form is
    /// the normalized one.
    pub fn normalize(mut self) -> Result<Self, ValidationError> {
        self.network_cidrs = self
            .network_cidrs
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();

        self.ports = match self.port_preset {
            PortPreset::Fast => FAST_PORTS.to_vec(),
            PortPreset::Normal => NORMAL_PORTS.to_vec(),
            PortPreset::Full => Vec::new(),
            PortPreset::Custom => {
                if self.ports.is_empty() {
                    return Err(ValidationError::EmptyPorts);
                }
                if self.ports.len() > MAX_PORTS {
                    return Err(ValidationError::TooManyPorts {
                        count: self.ports.len(),
                        max: MAX_PORTS,
                    });
                }
                let mut seen = std::collections::HashSet::new();
                for &port in &self.ports {
                    if port == 0 {
                        return Err(ValidationError::InvalidPort(port));
                    }
                    if !seen.insert(port) {
                        return Err(ValidationError::DuplicatePort(port));
                    }
                }
                self.ports
            }
        };

        self.options.validate()?;
        Ok(self)
    }

    /// Whether the driver should be told to scan the whole port space.
    pub fn all_ports(&self) -> bool {
        self.port_preset == PortPreset::Full
    }

    /// One-line human summary, used in progress output and scan history.
    pub fn summary(&self) -> String {
        let targets = self.network_cidrs.join(", ");
        let port_label = if self.all_ports() {
            "ports 1-65535".to_string()
        } else if self.ports.is_empty() {
            "ports none".to_string()
        } else {
            let head: Vec<String> = self.ports.iter().take(5).map(|p| p.to_string()).collect();
            let suffix = if self.ports.len() > 5 { "..." } else { "" };
            format!("ports {}{}", head.join(","), suffix)
        };
        format!("{targets} {port_label}").trim().to_string()
    }
}
