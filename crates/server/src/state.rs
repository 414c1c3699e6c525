//! Shared application state handed to every request handler.

use std::sync::Arc;

use crate::bus::EventBus;
use crate::orchestrator::ScanRuntime;
use crate::registry::TaskRegistry;
use crate::store::ConfigStore;

/// Handles to the process-wide singletons.
///
/// The registry and bus live inside the runtime; they are mirrored here so
/// handlers reach them without an extra hop.
#[derive(Clone)]
pub struct AppState {
    pub registry: TaskRegistry,
    pub bus: EventBus,
    pub runtime: Arc<ScanRuntime>,
    pub config_store: Arc<dyn ConfigStore>,
}

impl AppState {
    pub fn new(runtime: Arc<ScanRuntime>, config_store: Arc<dyn ConfigStore>) -> Self {
        Self {
            registry: runtime.registry.clone(),
            bus: runtime.bus.clone(),
            runtime,
            config_store,
        }
    }
}
