//! # Eidolon Server
//!
//! The scan orchestration service: task registry, event bus, stage state
//! machine, HTTP/SSE surface, and per-user configuration persistence.
//!
//! The singletons ([`registry::TaskRegistry`], [`bus::EventBus`]) are
//! created at startup and injected through [`state::AppState`] rather than
//! reached globally, so tests can stand up an isolated instance.

pub mod bus;
pub mod orchestrator;
pub mod registry;
pub mod routes;
pub mod settings;
pub mod state;
pub mod store;

pub use bus::{EventBus, Subscription, DEFAULT_QUEUE_CAPACITY};
pub use orchestrator::{run_scan, ScanRuntime, StageTimeouts};
pub use registry::{CancelOutcome, TaskRegistry, DEFAULT_RETENTION};
pub use settings::Settings;
pub use state::AppState;
pub use store::{ConfigStore, MemoryConfigStore, PostgresConfigStore};
