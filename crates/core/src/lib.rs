//! # Eidolon Core
//!
//! Shared foundation for the Eidolon network discovery platform: scan
//! configuration and validation, address planning, the typed scan event
//! stream, and the graph node models that discovered infrastructure is
//! written into.
//!
//! ## Example
//!
//! ```rust
//! use eidolon_core::{config::ScanConfig, plan::ScanPlan};
//!
//! let config = ScanConfig::default().normalize()?;
//! let plan = ScanPlan::build(&config)?;
//! assert_eq!(plan.host_count(), 256);
//! # Ok::<(), eidolon_core::error::ValidationError>(())
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod plan;
pub mod types;

// Re-export main types
pub use config::{PortPreset, ScanConfig, ScanOptions};
pub use error::{Error, GraphError, Result, ScanError, ValidationError};
pub use event::{FrameStatus, ScanEvent, Stage, TaskEvent, TaskStatus};
pub use graph::{Asset, HostObservation, NetworkContainer, NodeId, Service};
pub use plan::ScanPlan;
pub use types::{HostState, PortState, Protocol, TargetSpec};

/// Current version of the Eidolon core library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
