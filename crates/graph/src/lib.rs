//! # Eidolon Graph
//!
//! Property-graph persistence for discovered infrastructure: the
//! [`store::GraphStore`] trait, a Cypher-over-HTTP client, an in-memory
//! store for tests and local development, and the retrying
//! [`writer::GraphWriter`] that the orchestrator feeds host batches into.

pub mod cypher;
pub mod memory;
pub mod store;
pub mod writer;

pub use cypher::CypherGraphStore;
pub use memory::MemoryGraphStore;
pub use store::{GraphStore, HostBatch};
pub use writer::{GraphWriter, WRITE_PARALLELISM};
