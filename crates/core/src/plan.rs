//! Address planning: turning a validated configuration into a finite,
//! deduplicated set of scan targets.

use std::net::Ipv4Addr;

use crate::config::{ScanConfig, ScanOptions, MAX_TARGETS};
use crate::error::ValidationError;
use crate::types::TargetSpec;

/// A normalized scan plan.
///
/// Targets are sorted by range start and pairwise non-overlapping, so the
/// plan's host set is exactly the ordered union of the target ranges and
/// [`ScanPlan::host_count`] is the denominator reported in progress events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPlan {
    /// Parsed targets, sorted by range start
    pub targets: Vec<TargetSpec>,
    /// Ordered port list; empty when `all_ports` is set
    pub ports: Vec<u16>,
    /// Scan the full 1-65535 port space
    pub all_ports: bool,
    /// Tuning options carried over from the configuration
    pub options: ScanOptions,
    host_count: u64,
}

impl ScanPlan {
    /// Build a plan from a normalized configuration.
    ///
    /// Rejects empty or oversized target lists, unparseable targets, and
    /// overlapping ranges. The port list is taken verbatim; an empty list
    /// with the `full` preset means the whole port space.
    pub fn build(config: &ScanConfig) -> Result<Self, ValidationError> {
        if config.network_cidrs.is_empty() {
            return Err(ValidationError::EmptyTargets);
        }
        if config.network_cidrs.len() > MAX_TARGETS {
            return Err(ValidationError::TooManyTargets {
                count: config.network_cidrs.len(),
                max: MAX_TARGETS,
            });
        }

        let mut targets: Vec<TargetSpec> = Vec::with_capacity(config.network_cidrs.len());
        for raw in &config.network_cidrs {
            targets.push(raw.parse()?);
        }

        targets.sort_by_key(|t| t.bounds().0);
        for pair in targets.windows(2) {
            let (_, prev_end) = pair[0].bounds();
            let (curr_start, _) = pair[1].bounds();
            if curr_start <= prev_end {
                return Err(ValidationError::OverlappingTargets {
                    target: pair[1].to_string(),
                    other: pair[0].to_string(),
                });
            }
        }

        let host_count = targets.iter().map(TargetSpec::host_count).sum();

        Ok(Self {
            targets,
            ports: config.ports.clone(),
            all_ports: config.all_ports(),
            options: config.options,
            host_count,
        })
    }

    /// Exact number of host addresses in the plan.
    pub fn host_count(&self) -> u64 {
        self.host_count
    }

    /// Number of ports probed per live host.
    pub fn port_count(&self) -> u64 {
        if self.all_ports {
            65535
        } else {
            self.ports.len() as u64
        }
    }

    /// Every host address in the plan, ascending and duplicate-free.
    ///
    /// Targets are non-overlapping and sorted, so chaining their ranges
    /// yields the union directly.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.targets.iter().flat_map(TargetSpec::addresses)
    }

    /// The network scope of an address: the target range containing it.
    ///
    /// Used as the `ip@scope` disambiguator for assets without a MAC and
    /// as the parent network container.
    pub fn scope_of(&self, addr: Ipv4Addr) -> Option<&TargetSpec> {
        self.targets.iter().find(|t| t.contains(addr))
    }

    /// Normalized target strings, in scan order.
    pub fn target_args(&self) -> Vec<String> {
        self.targets.iter().map(TargetSpec::to_string).collect()
    }
}
