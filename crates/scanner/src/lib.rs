//! # Eidolon Scanner
//!
//! Driver for the external network scanner: spawns one child process per
//! scan stage, parses its XML report incrementally into typed scan events,
//! and enforces cooperative cancellation.
//!
//! The [`driver::ScanDriver`] trait is the seam the orchestrator runs
//! against; [`driver::NmapDriver`] is the production implementation.

pub mod driver;
pub mod nmap;

pub use driver::{NmapDriver, ScanDriver};
pub use nmap::ReportParser;
