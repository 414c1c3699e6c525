//! Scan orchestrator: runs one task through its stages.
//!
//! ```text
//! CREATED -> PING -> PORT -> FINALIZING -> {COMPLETE | PARTIAL | FAILED | CANCELLED}
//! ```
//!
//! Each stage drives the scanner through a bounded channel; every parser
//! event is routed to the graph writer in host-scoped batches, counted,
//! and republished on the bus with the task's next sequence number. The
//! cancel token is checked on every dequeue and at stage boundaries, and
//! the terminal frame is always the last event on the task's topic.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use eidolon_core::error::ScanError;
use eidolon_core::event::{FrameStatus, ScanEvent, Stage, TaskStatus};
use eidolon_core::graph::HostObservation;
use eidolon_core::plan::ScanPlan;
use eidolon_graph::{GraphWriter, HostBatch};
use eidolon_scanner::ScanDriver;

use crate::bus::EventBus;
use crate::registry::TaskRegistry;

/// Bound of the driver-to-orchestrator event channel; once the writer and
/// bus fall behind, the scanner is throttled by pipe back-pressure.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Idle subscribers still observe liveness at this cadence.
const LIVENESS_TICK: Duration = Duration::from_secs(1);

/// Wall-clock caps per stage.
#[derive(Debug, Clone, Copy)]
pub struct StageTimeouts {
    pub ping: Duration,
    pub port: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            ping: Duration::from_secs(30 * 60),
            port: Duration::from_secs(6 * 60 * 60),
        }
    }
}

impl StageTimeouts {
    fn for_stage(&self, stage: Stage) -> Duration {
        match stage {
            Stage::Ping => self.ping,
            Stage::Port | Stage::Finalizing => self.port,
        }
    }
}

/// Shared dependencies of every scan run.
pub struct ScanRuntime {
    pub driver: Arc<dyn ScanDriver>,
    pub writer: Arc<GraphWriter>,
    pub bus: EventBus,
    pub registry: TaskRegistry,
    pub timeouts: StageTimeouts,
}

/// Execute one scan task to its terminal status. Spawned by the scan
/// endpoint; never returns an error, all outcomes are reported through the
/// registry and the bus.
pub async fn run_scan(
    runtime: Arc<ScanRuntime>,
    task_id: Uuid,
    cancel: CancellationToken,
    plan: ScanPlan,
) {
    let run = ScanRun {
        runtime,
        task_id,
        cancel,
        plan: Arc::new(plan),
        events_processed: 0,
        live_hosts: Vec::new(),
        pending: None,
        stage_progress: (0, 0),
        writes: JoinSet::new(),
    };
    run.run().await;
}

struct ScanRun {
    runtime: Arc<ScanRuntime>,
    task_id: Uuid,
    cancel: CancellationToken,
    plan: Arc<ScanPlan>,
    events_processed: u64,
    live_hosts: Vec<Ipv4Addr>,
    pending: Option<HostObservation>,
    stage_progress: (u64, u64),
    writes: JoinSet<()>,
}

impl ScanRun {
    fn publish(&self, event: ScanEvent) {
        self.runtime.bus.publish(
            self.task_id,
            FrameStatus::Progress,
            event,
            self.events_processed,
            None,
        );
    }

    fn log(&self, line: impl Into<String>) {
        self.publish(ScanEvent::LogLine { line: line.into() });
    }

    async fn run(mut self) {
        info!(task_id = %self.task_id, hosts = self.plan.host_count(), "scan starting");
        self.runtime.bus.open_topic(self.task_id);
        self.log(format!(
            "starting scan of {} network(s), {} host(s)",
            self.plan.targets.len(),
            self.plan.host_count()
        ));

        if let Err(err) = self.run_stage(Stage::Ping).await {
            return self.finish_with_error(err).await;
        }
        // Discovery writes must settle before the port stage rewrites the
        // same hosts
        self.drain_writes().await;
        if self.cancel.is_cancelled() {
            return self.finish(TaskStatus::Cancelled, None).await;
        }

        if self.live_hosts.is_empty() {
            self.log("no live hosts found");
            return self.finish(TaskStatus::Complete, None).await;
        }

        if let Err(err) = self.run_stage(Stage::Port).await {
            return self.finish_with_error(err).await;
        }
        if self.cancel.is_cancelled() {
            return self.finish(TaskStatus::Cancelled, None).await;
        }

        self.finish(TaskStatus::Complete, None).await
    }

    /// Drive one scanner stage to completion, timeout, or cancellation.
    async fn run_stage(&mut self, stage: Stage) -> Result<(), ScanError> {
        self.runtime.registry.set_stage(self.task_id, stage);
        let total = match stage {
            Stage::Ping => {
                self.log(format!(
                    "discovering hosts across {} target(s)",
                    self.plan.targets.len()
                ));
                self.plan.host_count()
            }
            Stage::Port | Stage::Finalizing => {
                self.log(format!(
                    "scanning {} port(s) on {} host(s)",
                    self.plan.port_count(),
                    self.live_hosts.len()
                ));
                self.live_hosts.len() as u64
            }
        };
        self.stage_progress = (0, total);

        let (tx, mut rx) = mpsc::channel::<ScanEvent>(EVENT_CHANNEL_CAPACITY);
        let driver = self.runtime.driver.clone();
        let plan = self.plan.clone();
        let cancel = self.cancel.clone();
        let live_hosts = self.live_hosts.clone();
        let driver_task = tokio::spawn(async move {
            match stage {
                Stage::Ping => driver.run_ping(&plan, &cancel, &tx).await,
                Stage::Port => driver.run_port(&plan, &live_hosts, &cancel, &tx).await,
                Stage::Finalizing => Ok(()),
            }
        });

        let deadline = Instant::now() + self.runtime.timeouts.for_stage(stage);
        let mut timed_out = false;
        let mut ticker = interval(LIVENESS_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(event) => self.handle_event(stage, event).await,
                    None => break,
                },
                _ = ticker.tick() => {
                    if !self.cancel.is_cancelled() {
                        let (done, total) = self.stage_progress;
                        self.publish(ScanEvent::ProgressTick { done, total });
                    }
                }
                _ = sleep_until(deadline), if !timed_out => {
                    warn!(task_id = %self.task_id, %stage, "stage deadline exceeded, cancelling scanner");
                    timed_out = true;
                    self.cancel.cancel();
                }
            }
        }

        let result = driver_task.await.unwrap_or(Err(ScanError::Cancelled));
        if timed_out {
            return Err(ScanError::StageTimeout {
                stage,
                seconds: self.runtime.timeouts.for_stage(stage).as_secs(),
            });
        }
        result
    }

    /// Route one parser event: count it, batch it toward the writer, and
    /// republish it. After a cancel observation events are drained but
    /// neither written nor published.
    async fn handle_event(&mut self, stage: Stage, event: ScanEvent) {
        if self.cancel.is_cancelled() {
            return;
        }

        if event.is_asset_event() {
            self.events_processed += 1;
            self.runtime.registry.record_events(self.task_id, 1);
        }

        match &event {
            ScanEvent::HostUp {
                ip,
                hostname,
                mac,
                vendor,
                rtt_srtt_us,
            } => {
                self.flush_pending().await;
                if stage == Stage::Ping {
                    self.live_hosts.push(*ip);
                }
                self.pending = Some(HostObservation {
                    ip: Some(*ip),
                    up: true,
                    hostname: hostname.clone(),
                    mac: mac.clone(),
                    vendor: vendor.clone(),
                    rtt_srtt_us: *rtt_srtt_us,
                    ..Default::default()
                });
            }
            ScanEvent::HostDown { .. } => {
                self.flush_pending().await;
            }
            ScanEvent::PortState {
                ip,
                port,
                proto,
                state,
                service,
                product,
                version,
            } => {
                let observation = eidolon_core::graph::PortObservation {
                    port: *port,
                    proto: *proto,
                    state: *state,
                    service: service.clone(),
                    product: product.clone(),
                    version: version.clone(),
                };
                match &mut self.pending {
                    Some(obs) if obs.ip == Some(*ip) => obs.ports.push(observation),
                    _ => {
                        self.flush_pending().await;
                        self.pending = Some(HostObservation {
                            ip: Some(*ip),
                            up: true,
                            ports: vec![observation],
                            ..Default::default()
                        });
                    }
                }
            }
            ScanEvent::OsMatch { ip, name, accuracy } => {
                if let Some(obs) = &mut self.pending {
                    if obs.ip == Some(*ip) {
                        obs.os_matches.push(eidolon_core::graph::OsObservation {
                            name: name.clone(),
                            accuracy: *accuracy,
                        });
                    }
                }
            }
            ScanEvent::ProgressTick { done, total } => {
                self.stage_progress = (*done, *total);
            }
            ScanEvent::StageComplete { .. } => {
                self.flush_pending().await;
            }
            ScanEvent::LogLine { .. } => {}
        }

        self.publish(event);
    }

    /// Hand the accumulated host to the writer.
    ///
    /// Waits for a write slot, then spawns the write so other hosts can
    /// proceed; the semaphore is the only place the orchestrator blocks on
    /// the store.
    async fn flush_pending(&mut self) {
        let Some(obs) = self.pending.take() else {
            return;
        };
        let Some(ip) = obs.ip else {
            return;
        };
        if !obs.up {
            return;
        }

        let scope = self.plan.scope_of(ip);
        let batch = HostBatch::from_observation(&obs, ip, scope);

        let permit = self.runtime.writer.acquire().await;
        let writer = self.runtime.writer.clone();
        let bus = self.runtime.bus.clone();
        let cancel = self.cancel.clone();
        let task_id = self.task_id;
        let events_processed = self.events_processed;
        self.writes.spawn(async move {
            let _permit = permit;
            if let Err(err) = writer.write_host(&batch).await {
                error!(host = %batch.ip, error = %err, "host write abandoned");
                // A cancelled task's topic must end on its cancelled frame
                if !cancel.is_cancelled() {
                    bus.publish(
                        task_id,
                        FrameStatus::Progress,
                        ScanEvent::LogLine {
                            line: err.to_string(),
                        },
                        events_processed,
                        None,
                    );
                }
            }
        });
    }

    async fn drain_writes(&mut self) {
        while self.writes.join_next().await.is_some() {}
    }

    async fn finish_with_error(self, err: ScanError) {
        match err {
            ScanError::Cancelled => self.finish(TaskStatus::Cancelled, None).await,
            ScanError::StageTimeout { .. } => {
                let reason = format!("timeout: {err}");
                self.finish(TaskStatus::Failed, Some(reason)).await
            }
            other => {
                let status = if self.events_processed == 0 {
                    TaskStatus::Failed
                } else {
                    TaskStatus::Partial
                };
                self.finish(status, Some(other.to_string())).await
            }
        }
    }

    /// Settle the task: wait out in-flight writes, fix the terminal status
    /// in the registry, and publish the terminal frame, which closes the
    /// topic.
    async fn finish(mut self, status: TaskStatus, error: Option<String>) {
        self.runtime
            .registry
            .set_stage(self.task_id, Stage::Finalizing);

        if status != TaskStatus::Cancelled {
            self.flush_pending().await;
        }
        self.drain_writes().await;

        let total = self.events_processed;
        self.runtime.registry.set_total_events(self.task_id, total);
        self.runtime
            .registry
            .finalize(self.task_id, status, error.clone());

        let line = match (&status, &error) {
            (TaskStatus::Cancelled, _) => "scan cancelled".to_string(),
            (_, Some(reason)) => format!("scan {status}: {reason}"),
            _ => format!("scan {status}: {total} event(s) collected"),
        };
        self.runtime.bus.publish(
            self.task_id,
            status.into(),
            ScanEvent::LogLine { line },
            total,
            Some(total),
        );
        info!(task_id = %self.task_id, %status, events = total, "scan finished");
    }
}
