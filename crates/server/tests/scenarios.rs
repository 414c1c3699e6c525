//! End-to-end scan scenarios against a scripted driver and an in-memory
//! graph store: single-host happy path, empty sweeps, cancellation,
//! overlap rejection, writer failures, and slow subscribers.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use eidolon_core::config::{PortPreset, ScanConfig, ScanOptions};
use eidolon_core::error::ScanError;
use eidolon_core::event::{FrameStatus, ScanEvent, Stage, TaskStatus};
use eidolon_core::graph::LifecycleState;
use eidolon_core::plan::ScanPlan;
use eidolon_core::types::{PortState, Protocol};
use eidolon_graph::{GraphWriter, MemoryGraphStore};
use eidolon_scanner::ScanDriver;
use eidolon_server::orchestrator::{run_scan, ScanRuntime, StageTimeouts};
use eidolon_server::routes::ApiError;
use eidolon_server::{EventBus, Subscription, TaskRegistry};

/// Driver that replays a fixed event script per stage, honouring the
/// cancel token between events.
struct ScriptedDriver {
    ping: Vec<ScanEvent>,
    port: Vec<ScanEvent>,
    event_delay: Duration,
    port_called: AtomicBool,
}

impl ScriptedDriver {
    fn new(ping: Vec<ScanEvent>, port: Vec<ScanEvent>) -> Self {
        Self {
            ping,
            port,
            event_delay: Duration::ZERO,
            port_called: AtomicBool::new(false),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.event_delay = delay;
        self
    }

    async fn play(
        &self,
        script: &[ScanEvent],
        cancel: &CancellationToken,
        events: &mpsc::Sender<ScanEvent>,
    ) -> Result<(), ScanError> {
        for event in script {
            if cancel.is_cancelled() {
                return Err(ScanError::Cancelled);
            }
            if !self.event_delay.is_zero() {
                tokio::time::sleep(self.event_delay).await;
            }
            if events.send(event.clone()).await.is_err() {
                return Err(ScanError::Cancelled);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ScanDriver for ScriptedDriver {
    async fn run_ping(
        &self,
        _plan: &ScanPlan,
        cancel: &CancellationToken,
        events: &mpsc::Sender<ScanEvent>,
    ) -> Result<(), ScanError> {
        self.play(&self.ping, cancel, events).await
    }

    async fn run_port(
        &self,
        _plan: &ScanPlan,
        _live_hosts: &[Ipv4Addr],
        cancel: &CancellationToken,
        events: &mpsc::Sender<ScanEvent>,
    ) -> Result<(), ScanError> {
        self.port_called.store(true, Ordering::SeqCst);
        self.play(&self.port, cancel, events).await
    }
}

struct Harness {
    runtime: Arc<ScanRuntime>,
    bus: EventBus,
    registry: TaskRegistry,
    store: Arc<MemoryGraphStore>,
}

fn harness(driver: Arc<ScriptedDriver>) -> Harness {
    let store = Arc::new(MemoryGraphStore::new());
    let bus = EventBus::new(1024);
    let registry = TaskRegistry::default();
    let runtime = Arc::new(ScanRuntime {
        driver,
        writer: Arc::new(GraphWriter::new(store.clone())),
        bus: bus.clone(),
        registry: registry.clone(),
        timeouts: StageTimeouts::default(),
    });
    Harness {
        runtime,
        bus,
        registry,
        store,
    }
}

fn custom_config(targets: &[&str], ports: Vec<u16>) -> ScanConfig {
    ScanConfig {
        network_cidrs: targets.iter().map(|t| t.to_string()).collect(),
        ports,
        port_preset: PortPreset::Custom,
        options: ScanOptions {
            ping_concurrency: 64,
            port_scan_workers: 8,
            dns_resolution: false,
            aggressive: false,
        },
    }
}

fn host_up(ip: &str) -> ScanEvent {
    ScanEvent::HostUp {
        ip: ip.parse().unwrap(),
        hostname: None,
        mac: None,
        vendor: None,
        rtt_srtt_us: None,
    }
}

fn port_state(ip: &str, port: u16, state: PortState, service: Option<&str>) -> ScanEvent {
    ScanEvent::PortState {
        ip: ip.parse().unwrap(),
        port,
        proto: Protocol::Tcp,
        state,
        service: service.map(str::to_string),
        product: None,
        version: None,
    }
}

/// Run the task to completion and collect every frame its topic emitted.
async fn run_and_collect(
    harness: &Harness,
    plan: ScanPlan,
) -> (Uuid, Vec<eidolon_core::event::TaskEvent>) {
    let (task_id, cancel) = harness.registry.start("alice", "test scan").unwrap();
    harness.bus.open_topic(task_id);
    let mut sub = harness.bus.subscribe(task_id);
    run_scan(harness.runtime.clone(), task_id, cancel, plan).await;

    let mut frames = Vec::new();
    while let Some(frame) = sub.next().await {
        frames.push(frame);
    }
    (task_id, frames)
}

async fn drain(sub: &mut Subscription) -> Vec<eidolon_core::event::TaskEvent> {
    let mut frames = Vec::new();
    while let Some(frame) = sub.next().await {
        frames.push(frame);
    }
    frames
}

#[tokio::test]
async fn single_host_scan_writes_one_asset_and_completes() {
    let driver = Arc::new(ScriptedDriver::new(
        vec![
            host_up("10.0.0.5"),
            ScanEvent::ProgressTick { done: 1, total: 1 },
            ScanEvent::StageComplete { stage: Stage::Ping },
        ],
        vec![
            host_up("10.0.0.5"),
            port_state("10.0.0.5", 22, PortState::Open, Some("ssh")),
            port_state("10.0.0.5", 80, PortState::Closed, None),
            ScanEvent::StageComplete { stage: Stage::Port },
        ],
    ));
    let harness = harness(driver);
    let config = custom_config(&["10.0.0.5/32"], vec![22, 80]).normalize().unwrap();
    let plan = ScanPlan::build(&config).unwrap();

    let (task_id, frames) = run_and_collect(&harness, plan).await;

    // One asset, identified by its address, online, with both port
    // observations from the latest scan
    let asset = harness.store.asset_by_identifier("10.0.0.5").unwrap();
    assert!(asset.identifiers.contains("10.0.0.5"));
    assert_eq!(asset.lifecycle_state, LifecycleState::Online);
    assert_eq!(asset.metadata.ports.len(), 2);
    assert_eq!(asset.metadata.ports[0].port, 22);
    assert_eq!(asset.metadata.ports[0].state, PortState::Open);
    assert_eq!(asset.metadata.ports[1].port, 80);
    assert_eq!(asset.metadata.ports[1].state, PortState::Closed);
    assert_eq!(harness.store.assets().len(), 1);

    // Stream: progress frames then exactly one terminal complete frame
    assert!(frames.len() >= 3);
    let (last, progress) = frames.split_last().unwrap();
    assert!(progress.iter().all(|f| f.status == FrameStatus::Progress));
    assert_eq!(last.status, FrameStatus::Complete);
    assert_eq!(last.total_events, Some(last.events_processed));

    // Sequence numbers strictly increase
    for pair in frames.windows(2) {
        assert!(pair[1].seq > pair[0].seq);
    }

    assert_eq!(
        harness.registry.get(task_id).unwrap().status,
        TaskStatus::Complete
    );
}

#[tokio::test]
async fn empty_ping_sweep_completes_without_assets() {
    let down: Vec<ScanEvent> = (1..=4)
        .map(|i| ScanEvent::HostDown {
            ip: format!("10.0.0.{i}").parse().unwrap(),
        })
        .chain([ScanEvent::StageComplete { stage: Stage::Ping }])
        .collect();
    let driver = Arc::new(ScriptedDriver::new(down, vec![]));
    let harness = harness(driver.clone());
    let config = custom_config(&["10.0.0.0/30"], vec![22]).normalize().unwrap();
    let plan = ScanPlan::build(&config).unwrap();

    let (task_id, frames) = run_and_collect(&harness, plan).await;

    assert!(harness.store.assets().is_empty());
    assert_eq!(
        harness.registry.get(task_id).unwrap().status,
        TaskStatus::Complete
    );
    let last = frames.last().unwrap();
    assert_eq!(last.status, FrameStatus::Complete);
    assert_eq!(last.total_events, Some(0));

    // No live hosts means the port stage never runs
    assert!(!driver.port_called.load(Ordering::SeqCst));
}

#[tokio::test]
async fn cancellation_stops_publishing_and_terminates_with_cancelled() {
    let mut ping: Vec<ScanEvent> = (0..1000u32)
        .map(|i| host_up(&format!("10.0.{}.{}", i / 250, i % 250 + 1)))
        .collect();
    ping.push(ScanEvent::StageComplete { stage: Stage::Ping });
    let driver =
        Arc::new(ScriptedDriver::new(ping, vec![]).with_delay(Duration::from_millis(1)));
    let harness = harness(driver);
    let config = custom_config(&["10.0.0.0/22"], vec![22]).normalize().unwrap();
    let plan = ScanPlan::build(&config).unwrap();

    let (task_id, cancel) = harness.registry.start("alice", "big scan").unwrap();
    harness.bus.open_topic(task_id);
    let mut sub = harness.bus.subscribe(task_id);
    let scan = tokio::spawn(run_scan(harness.runtime.clone(), task_id, cancel, plan));

    // Wait for the first frame, then cancel
    let first = sub.next().await.unwrap();
    assert_eq!(first.status, FrameStatus::Progress);
    assert_eq!(
        harness.registry.cancel(task_id),
        eidolon_server::CancelOutcome::Cancelled
    );

    scan.await.unwrap();
    let frames = drain(&mut sub).await;

    // Terminal frame is cancelled and nothing follows it
    let last = frames.last().unwrap();
    assert_eq!(last.status, FrameStatus::Cancelled);
    assert!(frames[..frames.len() - 1]
        .iter()
        .all(|f| f.status == FrameStatus::Progress));

    // The scan stopped well short of the scripted thousand hosts
    let host_ups = frames
        .iter()
        .filter(|f| matches!(f.event, ScanEvent::HostUp { .. }))
        .count();
    assert!(host_ups < 1000);

    assert_eq!(
        harness.registry.get(task_id).unwrap().status,
        TaskStatus::Cancelled
    );
    assert_eq!(
        harness.registry.cancel(task_id),
        eidolon_server::CancelOutcome::AlreadyTerminal
    );
}

#[tokio::test]
async fn overlapping_targets_are_rejected_before_any_task_exists() {
    let config = custom_config(&["10.0.0.0/24", "10.0.0.128/25"], vec![22])
        .normalize()
        .unwrap();
    let err = ScanPlan::build(&config).unwrap_err();
    let api: ApiError = err.into();
    assert_eq!(api.status, StatusCode::BAD_REQUEST);
    assert_eq!(api.error, "OverlappingTargets");
}

#[tokio::test]
async fn failing_host_is_skipped_and_logged_while_the_scan_completes() {
    let ips = ["10.0.0.5", "10.0.0.6", "10.0.0.7"];
    let mut ping: Vec<ScanEvent> = ips.iter().map(|ip| host_up(ip)).collect();
    ping.push(ScanEvent::StageComplete { stage: Stage::Ping });
    let mut port: Vec<ScanEvent> = Vec::new();
    for ip in ips {
        port.push(host_up(ip));
        port.push(port_state(ip, 22, PortState::Open, Some("ssh")));
    }
    port.push(ScanEvent::StageComplete { stage: Stage::Port });

    let harness = harness(Arc::new(ScriptedDriver::new(ping, port)));
    harness.store.fail_host("10.0.0.7".parse().unwrap(), u32::MAX);

    let config = custom_config(&["10.0.0.0/29"], vec![22]).normalize().unwrap();
    let plan = ScanPlan::build(&config).unwrap();
    let (task_id, frames) = run_and_collect(&harness, plan).await;

    assert!(harness.store.asset_by_identifier("10.0.0.5").is_some());
    assert!(harness.store.asset_by_identifier("10.0.0.6").is_some());
    assert!(harness.store.asset_by_identifier("10.0.0.7").is_none());

    // The abandoned write surfaced as a diagnostic frame
    assert!(frames.iter().any(|f| matches!(
        &f.event,
        ScanEvent::LogLine { line } if line.contains("10.0.0.7")
    )));

    assert_eq!(
        harness.registry.get(task_id).unwrap().status,
        TaskStatus::Complete
    );
    assert_eq!(frames.last().unwrap().status, FrameStatus::Complete);
}

#[tokio::test]
async fn slow_subscriber_loses_oldest_events_but_keeps_order() {
    let bus = EventBus::new(1024);
    let task = Uuid::new_v4();
    bus.open_topic(task);
    let mut sub = bus.subscribe(task);

    let published = 3000u64;
    for i in 0..published {
        bus.publish(
            task,
            FrameStatus::Progress,
            ScanEvent::ProgressTick {
                done: i,
                total: published,
            },
            i,
            None,
        );
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    bus.shutdown();

    let mut delivered = 0u64;
    let mut last_seq = 0u64;
    while let Some(frame) = sub.next().await {
        delivered += 1;
        assert!(frame.seq > last_seq);
        last_seq = frame.seq;
    }

    assert!(delivered <= 1024);
    assert_eq!(sub.dropped_count(), published - delivered);
}

#[tokio::test]
async fn rerunning_the_same_plan_converges_on_the_same_assets() {
    fn driver() -> Arc<ScriptedDriver> {
        Arc::new(ScriptedDriver::new(
            vec![
                host_up("10.0.0.1"),
                host_up("10.0.0.2"),
                ScanEvent::StageComplete { stage: Stage::Ping },
            ],
            vec![
                host_up("10.0.0.1"),
                port_state("10.0.0.1", 22, PortState::Open, Some("ssh")),
                host_up("10.0.0.2"),
                port_state("10.0.0.2", 80, PortState::Open, Some("http")),
                ScanEvent::StageComplete { stage: Stage::Port },
            ],
        ))
    }

    let store = Arc::new(MemoryGraphStore::new());
    let mut first_ids = None;
    for _ in 0..2 {
        let bus = EventBus::new(1024);
        let registry = TaskRegistry::default();
        let runtime = Arc::new(ScanRuntime {
            driver: driver(),
            writer: Arc::new(GraphWriter::new(store.clone())),
            bus: bus.clone(),
            registry: registry.clone(),
            timeouts: StageTimeouts::default(),
        });
        let config = custom_config(&["10.0.0.0/29"], vec![22, 80]).normalize().unwrap();
        let plan = ScanPlan::build(&config).unwrap();
        let (task_id, cancel) = registry.start("alice", "rerun").unwrap();
        bus.open_topic(task_id);
        run_scan(runtime, task_id, cancel, plan).await;

        let ids = store.asset_node_ids();
        assert_eq!(ids.len(), 2);
        match &first_ids {
            None => first_ids = Some(ids),
            Some(first) => assert_eq!(first, &ids),
        }
    }

    // Every live host ended up as an asset carrying its address
    for ip in ["10.0.0.1", "10.0.0.2"] {
        let asset = store.asset_by_identifier(ip).unwrap();
        assert!(asset.identifiers.contains(ip));
    }
}

#[tokio::test]
async fn stage_timeout_cancels_the_driver_and_finalizes_failed() {
    let mut ping: Vec<ScanEvent> = (1..=200u32)
        .map(|i| host_up(&format!("10.0.0.{}", i % 250)))
        .collect();
    ping.push(ScanEvent::StageComplete { stage: Stage::Ping });
    let driver =
        Arc::new(ScriptedDriver::new(ping, vec![]).with_delay(Duration::from_millis(10)));

    let store = Arc::new(MemoryGraphStore::new());
    let bus = EventBus::new(1024);
    let registry = TaskRegistry::default();
    let runtime = Arc::new(ScanRuntime {
        driver,
        writer: Arc::new(GraphWriter::new(store)),
        bus: bus.clone(),
        registry: registry.clone(),
        timeouts: StageTimeouts {
            ping: Duration::from_millis(50),
            port: Duration::from_secs(1),
        },
    });
    let config = custom_config(&["10.0.0.0/24"], vec![22]).normalize().unwrap();
    let plan = ScanPlan::build(&config).unwrap();
    let (task_id, cancel) = registry.start("alice", "slow scan").unwrap();
    bus.open_topic(task_id);
    let mut sub = bus.subscribe(task_id);
    run_scan(runtime, task_id, cancel, plan).await;

    let frames = drain(&mut sub).await;
    let last = frames.last().unwrap();
    assert_eq!(last.status, FrameStatus::Failed);
    assert!(matches!(
        &last.event,
        ScanEvent::LogLine { line } if line.contains("timeout")
    ));
    assert_eq!(registry.get(task_id).unwrap().status, TaskStatus::Failed);
}

#[tokio::test]
async fn driver_failure_after_events_finalizes_partial() {
    struct FailingDriver {
        ping: Vec<ScanEvent>,
    }

    #[async_trait]
    impl ScanDriver for FailingDriver {
        async fn run_ping(
            &self,
            _plan: &ScanPlan,
            _cancel: &CancellationToken,
            events: &mpsc::Sender<ScanEvent>,
        ) -> Result<(), ScanError> {
            for event in &self.ping {
                let _ = events.send(event.clone()).await;
            }
            Err(ScanError::ScannerExit {
                code: Some(1),
                stderr: "interface went away".to_string(),
            })
        }

        async fn run_port(
            &self,
            _plan: &ScanPlan,
            _live_hosts: &[Ipv4Addr],
            _cancel: &CancellationToken,
            _events: &mpsc::Sender<ScanEvent>,
        ) -> Result<(), ScanError> {
            unreachable!("port stage must not run after a ping failure")
        }
    }

    let store = Arc::new(MemoryGraphStore::new());
    let bus = EventBus::new(1024);
    let registry = TaskRegistry::default();
    let runtime = Arc::new(ScanRuntime {
        driver: Arc::new(FailingDriver {
            ping: vec![host_up("10.0.0.5")],
        }),
        writer: Arc::new(GraphWriter::new(store.clone())),
        bus: bus.clone(),
        registry: registry.clone(),
        timeouts: StageTimeouts::default(),
    });
    let config = custom_config(&["10.0.0.0/29"], vec![22]).normalize().unwrap();
    let plan = ScanPlan::build(&config).unwrap();
    let (task_id, cancel) = registry.start("alice", "flaky").unwrap();
    bus.open_topic(task_id);
    let mut sub = bus.subscribe(task_id);
    run_scan(runtime, task_id, cancel, plan).await;

    let frames = drain(&mut sub).await;
    assert_eq!(frames.last().unwrap().status, FrameStatus::Partial);
    assert_eq!(
        registry.get(task_id).unwrap().status,
        TaskStatus::Partial
    );
    // The event that did arrive was still written
    assert!(store.asset_by_identifier("10.0.0.5").is_some());
}
