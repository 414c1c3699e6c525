//! Scan events: the parser output stream and the envelope published on the
//! task event bus.

use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{PortState, Protocol};

/// Scan stages of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Host discovery sweep
    Ping,
    /// TCP port scan of live hosts
    Port,
    /// Flushing writes and settling terminal status
    Finalizing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Ping => write!(f, "ping"),
            Stage::Port => write!(f, "port"),
            Stage::Finalizing => write!(f, "finalizing"),
        }
    }
}

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Complete,
    Partial,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether this status ends the task.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Complete => write!(f, "complete"),
            TaskStatus::Partial => write!(f, "partial"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Status field of a published frame: `progress` while the task runs,
/// otherwise the terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameStatus {
    Progress,
    Complete,
    Partial,
    Failed,
    Cancelled,
}

impl From<TaskStatus> for FrameStatus {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Running => FrameStatus::Progress,
            TaskStatus::Complete => FrameStatus::Complete,
            TaskStatus::Partial => FrameStatus::Partial,
            TaskStatus::Failed => FrameStatus::Failed,
            TaskStatus::Cancelled => FrameStatus::Cancelled,
        }
    }
}

/// A single typed event produced by the scanner driver.
///
/// This is a closed sum so stage handling can be exhaustive; a `host_up`
/// can never smuggle a port payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScanEvent {
    /// A live host found by the discovery sweep
    HostUp {
        ip: Ipv4Addr,
        #[serde(skip_serializing_if = "Option::is_none")]
        hostname: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        mac: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        vendor: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        rtt_srtt_us: Option<u64>,
    },
    /// A probed host that did not answer
    HostDown { ip: Ipv4Addr },
    /// Observed state of a single port on a live host
    PortState {
        ip: Ipv4Addr,
        port: u16,
        proto: Protocol,
        state: PortState,
        #[serde(skip_serializing_if = "Option::is_none")]
        service: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        product: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },
    /// OS detection guess for a host
    OsMatch {
        ip: Ipv4Addr,
        name: String,
        accuracy: u8,
    },
    /// Liveness tick with the stage's running counters
    ProgressTick { done: u64, total: u64 },
    /// A stage finished cleanly
    StageComplete { stage: Stage },
    /// Free-form diagnostic line (scanner stderr, skipped fragments,
    /// abandoned writes)
    LogLine { line: String },
}

impl ScanEvent {
    /// Whether this event describes an asset observation (as opposed to
    /// bookkeeping). Drives the failed-versus-partial decision.
    pub fn is_asset_event(&self) -> bool {
        matches!(
            self,
            ScanEvent::HostUp { .. } | ScanEvent::PortState { .. } | ScanEvent::OsMatch { .. }
        )
    }

    /// Human-readable progress line for this event, if it merits one.
    pub fn describe(&self) -> Option<String> {
        match self {
            ScanEvent::HostUp { ip, hostname, .. } => Some(match hostname {
                Some(name) => format!("  -> {ip} ({name})"),
                None => format!("  -> {ip}"),
            }),
            ScanEvent::HostDown { .. } => None,
            ScanEvent::PortState {
                ip,
                port,
                proto,
                state,
                service,
                ..
            } if state.is_open() => {
                let service = service.as_deref().unwrap_or("unknown");
                Some(format!("  {ip}: {port}/{proto} open ({service})"))
            }
            ScanEvent::PortState { .. } => None,
            ScanEvent::OsMatch { ip, name, accuracy } => {
                Some(format!("  {ip}: os {name} ({accuracy}%)"))
            }
            ScanEvent::ProgressTick { done, total } => {
                Some(format!("scanned {done}/{total} hosts"))
            }
            ScanEvent::StageComplete { stage } => Some(format!("{stage} stage complete")),
            ScanEvent::LogLine { line } => Some(line.clone()),
        }
    }
}

/// The envelope published on the event bus and serialized into SSE frames.
///
/// `seq` is assigned by the bus and is strictly increasing within a task;
/// subscribers detect drops as gaps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: Uuid,
    pub seq: u64,
    pub status: FrameStatus,
    pub collector: String,
    pub events_processed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_events: Option<u64>,
    pub event: ScanEvent,
    pub timestamp: DateTime<Utc>,
}

/// Wire form of a task event: the exact JSON carried in an SSE `data:` frame.
#[derive(Serialize)]
struct Frame<'a> {
    event_type: &'static str,
    status: FrameStatus,
    payload: FramePayload<'a>,
}

#[derive(Serialize)]
struct FramePayload<'a> {
    task_id: Uuid,
    seq: u64,
    collector: &'a str,
    events_processed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    total_events: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<String>,
    event: &'a ScanEvent,
    timestamp: DateTime<Utc>,
}

impl TaskEvent {
    /// Event type tag carried by every frame.
    pub const EVENT_TYPE: &'static str = "collector.scan";

    /// Serialize into the SSE frame JSON. Consumers must tolerate unknown
    /// keys, so the typed event rides along under `payload.event`.
    pub fn frame_json(&self) -> String {
        let frame = Frame {
            event_type: Self::EVENT_TYPE,
            status: self.status,
            payload: FramePayload {
                task_id: self.task_id,
                seq: self.seq,
                collector: &self.collector,
                events_processed: self.events_processed,
                total_events: self.total_events,
                output: self.event.describe(),
                event: &self.event,
                timestamp: self.timestamp,
            },
        };
        // Serialization of a fully-owned value cannot fail
        serde_json::to_string(&frame).unwrap_or_default()
    }
}
