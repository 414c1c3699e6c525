//! Idempotent graph writer.
//!
//! Applies host batches through a [`GraphStore`] with bounded concurrency
//! and a fixed retry schedule. Failures after the last retry skip the host
//! rather than failing the scan.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use eidolon_core::error::GraphError;

use crate::store::{GraphStore, HostBatch};

/// Maximum in-flight host writes.
pub const WRITE_PARALLELISM: usize = 8;

/// Deadline for a single store call.
const ATTEMPT_DEADLINE: Duration = Duration::from_secs(5);

/// Backoff before each retry; the schedule length is the retry budget.
const RETRY_BACKOFF: [Duration; 3] = [
    Duration::from_millis(50),
    Duration::from_millis(200),
    Duration::from_millis(800),
];

/// Concurrency-bounded, retrying front-end to a graph store.
pub struct GraphWriter {
    store: Arc<dyn GraphStore>,
    semaphore: Arc<Semaphore>,
}

impl GraphWriter {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self {
            store,
            semaphore: Arc::new(Semaphore::new(WRITE_PARALLELISM)),
        }
    }

    /// Reserve a write slot.
    ///
    /// This is the caller's back-pressure point: once [`WRITE_PARALLELISM`]
    /// writes are in flight, acquisition suspends until one finishes. The
    /// permit is released by dropping it when the spawned write completes.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("writer semaphore closed")
    }

    /// Apply one host batch, retrying transient failures.
    ///
    /// Attempts are capped at the retry schedule plus the initial try; each
    /// attempt gets its own deadline. The terminal error reports the host
    /// so the caller can surface a diagnostic event and move on.
    pub async fn write_host(&self, batch: &HostBatch) -> Result<(), GraphError> {
        let mut last_error: Option<GraphError> = None;

        for attempt in 0..=RETRY_BACKOFF.len() {
            if attempt > 0 {
                sleep(RETRY_BACKOFF[attempt - 1]).await;
            }

            let result = match timeout(ATTEMPT_DEADLINE, self.store.apply(batch)).await {
                Ok(result) => result,
                Err(_) => Err(GraphError::Deadline(ATTEMPT_DEADLINE)),
            };

            match result {
                Ok(()) => {
                    debug!(host = %batch.ip, attempt, "host batch committed");
                    return Ok(());
                }
                Err(err) => {
                    warn!(host = %batch.ip, attempt, error = %err, "host write failed");
                    last_error = Some(err);
                }
            }
        }

        Err(GraphError::RetriesExhausted {
            host: batch.ip.to_string(),
            attempts: (RETRY_BACKOFF.len() + 1) as u32,
            last: last_error
                .map(|err| err.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }
}
