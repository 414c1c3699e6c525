//! Task registry: the process-wide map of running and recently finished
//! scans.
//!
//! Enforces at most one running scan per user, hands out the cancel token
//! for each task, and retains terminal tasks for a short window so a late
//! cancel gets `already_terminal` rather than `not_found`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use eidolon_core::error::ScanError;
use eidolon_core::event::{Stage, TaskStatus};

/// Default retention of terminal tasks.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(5);

/// Finished scans kept for the history endpoint.
const HISTORY_CAPACITY: usize = 100;

/// Snapshot of one scan task.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub task_id: Uuid,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub stage: Stage,
    pub status: TaskStatus,
    pub cancel_requested: bool,
    pub events_processed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_events: Option<u64>,
}

/// Record of a finished scan, served by the history endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ScanRecord {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub status: TaskStatus,
    pub events_collected: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_summary: Option<String>,
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled,
    NotFound,
    AlreadyTerminal,
}

#[derive(Debug)]
struct TaskEntry {
    task: Task,
    summary: String,
    cancel: CancellationToken,
    terminal_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct RegistryState {
    tasks: HashMap<Uuid, TaskEntry>,
    history: VecDeque<ScanRecord>,
}

/// Process-wide registry of scan tasks.
#[derive(Debug, Clone)]
pub struct TaskRegistry {
    state: Arc<Mutex<RegistryState>>,
    retention: Duration,
}

impl TaskRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(RegistryState::default())),
            retention,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().expect("task registry mutex poisoned")
    }

    /// Register a new running task for `user_id`.
    ///
    /// Fails when that user already has a running task.
    pub fn start(
        &self,
        user_id: &str,
        config_summary: &str,
    ) -> Result<(Uuid, CancellationToken), ScanError> {
        let mut state = self.lock();

        let running = state.tasks.values().any(|entry| {
            entry.task.user_id == user_id && entry.task.status == TaskStatus::Running
        });
        if running {
            return Err(ScanError::AlreadyRunning {
                user_id: user_id.to_string(),
            });
        }

        let task_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        state.tasks.insert(
            task_id,
            TaskEntry {
                task: Task {
                    task_id,
                    user_id: user_id.to_string(),
                    created_at: Utc::now(),
                    stage: Stage::Ping,
                    status: TaskStatus::Running,
                    cancel_requested: false,
                    events_processed: 0,
                    total_events: None,
                },
                summary: config_summary.to_string(),
                cancel: cancel.clone(),
                terminal_at: None,
            },
        );
        info!(%task_id, user_id, "scan task registered");
        Ok((task_id, cancel))
    }

    /// Request cancellation. Idempotent; a second call on a finished task
    /// reports `already_terminal` until retention expires.
    pub fn cancel(&self, task_id: Uuid) -> CancelOutcome {
        let mut state = self.lock();
        match state.tasks.get_mut(&task_id) {
            None => CancelOutcome::NotFound,
            Some(entry) if entry.task.status.is_terminal() => CancelOutcome::AlreadyTerminal,
            Some(entry) => {
                entry.task.cancel_requested = true;
                entry.cancel.cancel();
                info!(%task_id, "scan cancellation requested");
                CancelOutcome::Cancelled
            }
        }
    }

    /// Transition a task to a terminal status. Returns false if the task
    /// was unknown or already terminal; the first caller wins.
    pub fn finalize(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        error_message: Option<String>,
    ) -> bool {
        debug_assert!(status.is_terminal());
        let mut state = self.lock();
        let Some(entry) = state.tasks.get_mut(&task_id) else {
            return false;
        };
        if entry.task.status.is_terminal() {
            return false;
        }

        entry.task.status = status;
        entry.task.stage = Stage::Finalizing;
        entry.terminal_at = Some(Instant::now());

        let record = ScanRecord {
            id: task_id,
            started_at: entry.task.created_at,
            completed_at: Utc::now(),
            status,
            events_collected: entry.task.events_processed,
            error_message,
            config_summary: Some(entry.summary.clone()),
        };
        if state.history.len() == HISTORY_CAPACITY {
            state.history.pop_front();
        }
        state.history.push_back(record);
        info!(%task_id, %status, "scan task finalized");
        true
    }

    /// Snapshot read of a task.
    pub fn get(&self, task_id: Uuid) -> Option<Task> {
        self.lock().tasks.get(&task_id).map(|e| e.task.clone())
    }

    pub fn set_stage(&self, task_id: Uuid, stage: Stage) {
        if let Some(entry) = self.lock().tasks.get_mut(&task_id) {
            entry.task.stage = stage;
        }
    }

    pub fn record_events(&self, task_id: Uuid, count: u64) {
        if let Some(entry) = self.lock().tasks.get_mut(&task_id) {
            entry.task.events_processed += count;
        }
    }

    pub fn set_total_events(&self, task_id: Uuid, total: u64) {
        if let Some(entry) = self.lock().tasks.get_mut(&task_id) {
            entry.task.total_events = Some(total);
        }
    }

    /// Whether cancellation has been requested for a task.
    pub fn cancel_requested(&self, task_id: Uuid) -> bool {
        self.lock()
            .tasks
            .get(&task_id)
            .map(|e| e.task.cancel_requested)
            .unwrap_or(false)
    }

    /// Drop terminal tasks past their retention window.
    pub fn reap(&self) {
        let retention = self.retention;
        let mut state = self.lock();
        state.tasks.retain(|task_id, entry| {
            let keep = match entry.terminal_at {
                Some(at) => at.elapsed() < retention,
                None => true,
            };
            if !keep {
                debug!(%task_id, "terminal task reaped");
            }
            keep
        });
    }

    /// Cancel every running task; returns their ids.
    pub fn cancel_all(&self) -> Vec<Uuid> {
        let mut state = self.lock();
        let mut cancelled = Vec::new();
        for (task_id, entry) in state.tasks.iter_mut() {
            if entry.task.status == TaskStatus::Running {
                entry.task.cancel_requested = true;
                entry.cancel.cancel();
                cancelled.push(*task_id);
            }
        }
        cancelled
    }

    /// Number of tasks still running.
    pub fn running_count(&self) -> usize {
        self.lock()
            .tasks
            .values()
            .filter(|e| e.task.status == TaskStatus::Running)
            .count()
    }

    /// Ids of all running tasks.
    pub fn running_tasks(&self) -> Vec<Uuid> {
        self.lock()
            .tasks
            .values()
            .filter(|e| e.task.status == TaskStatus::Running)
            .map(|e| e.task.task_id)
            .collect()
    }

    /// Most recent finished scans, newest first.
    pub fn history(&self, limit: usize) -> Vec<ScanRecord> {
        self.lock()
            .history
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Periodically reap expired terminal tasks until the registry is
    /// dropped by every other holder.
    pub fn spawn_reaper(&self) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                if Arc::strong_count(&registry.state) == 1 {
                    break;
                }
                registry.reap();
            }
        })
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}
