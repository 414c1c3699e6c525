//! Scanner driver: owns one external scanner invocation per stage.
//!
//! The driver spawns the scanner with arguments derived from the plan,
//! feeds its stdout through the streaming report parser, forwards stderr
//! as diagnostic events, and enforces cooperative cancellation with a
//! terminate-then-kill escalation.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use eidolon_core::error::ScanError;
use eidolon_core::event::{ScanEvent, Stage};
use eidolon_core::graph::HostObservation;
use eidolon_core::plan::ScanPlan;

use crate::nmap::ReportParser;

/// How long a terminated child gets to exit before it is killed.
const KILL_GRACE: Duration = Duration::from_secs(3);

/// How many trailing stderr lines are kept for error reporting.
const STDERR_TAIL: usize = 20;

/// Give up on a report stream that yields nothing but parse errors.
const MAX_CONSECUTIVE_PARSE_ERRORS: u32 = 100;

/// A scan stage executor.
///
/// Implementations emit [`ScanEvent`]s on the provided channel as they are
/// produced and return once the stage has finished, failed, or observed
/// cancellation. Events parsed before a cancellation are always delivered.
#[async_trait]
pub trait ScanDriver: Send + Sync {
    /// Host discovery sweep over the plan's targets.
    async fn run_ping(
        &self,
        plan: &ScanPlan,
        cancel: &CancellationToken,
        events: &mpsc::Sender<ScanEvent>,
    ) -> Result<(), ScanError>;

    /// TCP port scan over the live hosts found by the ping stage.
    async fn run_port(
        &self,
        plan: &ScanPlan,
        live_hosts: &[Ipv4Addr],
        cancel: &CancellationToken,
        events: &mpsc::Sender<ScanEvent>,
    ) -> Result<(), ScanError>;
}

/// Driver backed by an external nmap-compatible binary.
#[derive(Debug, Clone)]
pub struct NmapDriver {
    bin: PathBuf,
}

impl NmapDriver {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }

    /// Common flags: XML on stdout, DNS policy, child-side parallelism.
    fn common_args(plan: &ScanPlan, parallelism: u16) -> Vec<String> {
        let mut args = vec!["-oX".to_string(), "-".to_string()];
        args.push(if plan.options.dns_resolution {
            "-R".to_string()
        } else {
            "-n".to_string()
        });
        if parallelism > 0 {
            args.push("--min-parallelism".to_string());
            args.push(parallelism.to_string());
            args.push("--max-parallelism".to_string());
            args.push(parallelism.to_string());
        }
        args
    }

    fn ping_args(plan: &ScanPlan) -> Vec<String> {
        let mut args = vec!["-sn".to_string()];
        args.extend(Self::common_args(plan, plan.options.ping_concurrency));
        args.extend(plan.target_args());
        args
    }

    fn port_args(plan: &ScanPlan, live_hosts: &[Ipv4Addr]) -> Vec<String> {
        let mut args = vec!["-Pn".to_string()];
        if plan.all_ports {
            args.push("-p-".to_string());
        } else {
            args.push("-p".to_string());
            args.push(
                plan.ports
                    .iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            );
        }
        args.extend(Self::common_args(plan, plan.options.port_scan_workers));
        if plan.options.aggressive {
            args.push("-O".to_string());
            args.push("-sV".to_string());
        }
        args.extend(live_hosts.iter().map(|h| h.to_string()));
        args
    }

    /// Run one scanner invocation, streaming events until the report ends.
    async fn run_stage(
        &self,
        stage: Stage,
        args: Vec<String>,
        total: u64,
        cancel: &CancellationToken,
        events: &mpsc::Sender<ScanEvent>,
    ) -> Result<(), ScanError> {
        info!(%stage, scanner = %self.bin.display(), "starting scan stage");
        debug!(?args, "scanner arguments");

        let mut child = Command::new(&self.bin)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ScanError::SpawnFailure {
                bin: self.bin.display().to_string(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or_else(|| ScanError::Parse(
            "scanner stdout was not captured".to_string(),
        ))?;
        let stderr = child.stderr.take();

        // Forward stderr as diagnostic events, keeping a tail for the
        // exit-status error message
        let stderr_task = tokio::spawn({
            let events = events.clone();
            async move {
                let mut tail: Vec<String> = Vec::new();
                if let Some(stderr) = stderr {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        if tail.len() == STDERR_TAIL {
                            tail.remove(0);
                        }
                        tail.push(line.clone());
                        let _ = events.send(ScanEvent::LogLine { line }).await;
                    }
                }
                tail.join("\n")
            }
        });

        let mut parser = ReportParser::new(BufReader::new(stdout));
        let mut done: u64 = 0;

        let drive = async {
            let mut consecutive_errors = 0u32;
            loop {
                match parser.next_host().await {
                    Ok(Some(host)) => {
                        consecutive_errors = 0;
                        done += 1;
                        self.emit_host(stage, host, events).await?;
                        if events
                            .send(ScanEvent::ProgressTick { done, total })
                            .await
                            .is_err()
                        {
                            return Err(ScanError::Cancelled);
                        }
                    }
                    Ok(None) => return Ok(()),
                    Err(err) => {
                        // Skipped fragment; surface it and keep reading.
                        // A stream that only yields errors is dead.
                        consecutive_errors += 1;
                        if consecutive_errors > MAX_CONSECUTIVE_PARSE_ERRORS {
                            return Err(err);
                        }
                        warn!(%stage, error = %err, "unparseable report fragment");
                        if events
                            .send(ScanEvent::LogLine {
                                line: format!("report parse error: {err}"),
                            })
                            .await
                            .is_err()
                        {
                            return Err(ScanError::Cancelled);
                        }
                    }
                }
            }
        };

        let outcome = tokio::select! {
            result = drive => result,
            _ = cancel.cancelled() => Err(ScanError::Cancelled),
        };

        if let Err(err) = outcome {
            terminate(&mut child).await;
            let _ = stderr_task.await;
            return Err(err);
        }

        let status = child.wait().await.map_err(|source| ScanError::SpawnFailure {
            bin: self.bin.display().to_string(),
            source,
        })?;
        let stderr_tail = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(ScanError::ScannerExit {
                code: status.code(),
                stderr: stderr_tail,
            });
        }

        info!(%stage, hosts = done, "scan stage finished");
        events
            .send(ScanEvent::StageComplete { stage })
            .await
            .map_err(|_| ScanError::Cancelled)?;
        Ok(())
    }

    /// Flatten one parsed host into the event stream.
    async fn emit_host(
        &self,
        stage: Stage,
        host: HostObservation,
        events: &mpsc::Sender<ScanEvent>,
    ) -> Result<(), ScanError> {
        let Some(ip) = host.ip else {
            let _ = events
                .send(ScanEvent::LogLine {
                    line: "skipping host record without an address".to_string(),
                })
                .await;
            return Ok(());
        };

        let send = |event: ScanEvent| {
            let events = events.clone();
            async move { events.send(event).await.map_err(|_| ScanError::Cancelled) }
        };

        if !host.up {
            // Port-stage reports are -Pn and always "up"; down hosts only
            // come out of the discovery sweep
            if stage == Stage::Ping {
                send(ScanEvent::HostDown { ip }).await?;
            }
            return Ok(());
        }

        send(ScanEvent::HostUp {
            ip,
            hostname: host.hostname.clone(),
            mac: host.mac.clone(),
            vendor: host.vendor.clone(),
            rtt_srtt_us: host.rtt_srtt_us,
        })
        .await?;

        for port in &host.ports {
            send(ScanEvent::PortState {
                ip,
                port: port.port,
                proto: port.proto,
                state: port.state,
                service: port.service.clone(),
                product: port.product.clone(),
                version: port.version.clone(),
            })
            .await?;
        }

        for os in &host.os_matches {
            send(ScanEvent::OsMatch {
                ip,
                name: os.name.clone(),
                accuracy: os.accuracy,
            })
            .await?;
        }

        Ok(())
    }
}

#[async_trait]
impl ScanDriver for NmapDriver {
    async fn run_ping(
        &self,
        plan: &ScanPlan,
        cancel: &CancellationToken,
        events: &mpsc::Sender<ScanEvent>,
    ) -> Result<(), ScanError> {
        self.run_stage(
            Stage::Ping,
            Self::ping_args(plan),
            plan.host_count(),
            cancel,
            events,
        )
        .await
    }

    async fn run_port(
        &self,
        plan: &ScanPlan,
        live_hosts: &[Ipv4Addr],
        cancel: &CancellationToken,
        events: &mpsc::Sender<ScanEvent>,
    ) -> Result<(), ScanError> {
        self.run_stage(
            Stage::Port,
            Self::port_args(plan, live_hosts),
            live_hosts.len() as u64,
            cancel,
            events,
        )
        .await
    }
}

/// Stop a child scanner: close its stdin, ask it to terminate, and kill it
/// if it has not exited within the grace window.
async fn terminate(child: &mut Child) {
    drop(child.stdin.take());

    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }

    match timeout(KILL_GRACE, child.wait()).await {
        Ok(_) => debug!("scanner exited within the grace window"),
        Err(_) => {
            warn!("scanner ignored terminate, killing");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eidolon_core::config::{PortPreset, ScanConfig};

    fn plan(targets: &[&str], ports: Vec<u16>) -> ScanPlan {
        let config = ScanConfig {
            network_cidrs: targets.iter().map(|t| t.to_string()).collect(),
            ports,
            port_preset: PortPreset::Custom,
            ..Default::default()
        };
        ScanPlan::build(&config.normalize().unwrap()).unwrap()
    }

    #[test]
    fn test_ping_args_shape() {
        let plan = plan(&["10.0.0.0/30", "10.0.1.5"], vec![22]);
        let args = NmapDriver::ping_args(&plan);
        assert_eq!(args[0], "-sn");
        assert!(args.contains(&"-oX".to_string()));
        assert!(args.contains(&"--min-parallelism".to_string()));
        assert!(args.contains(&"10.0.0.0/30".to_string()));
        assert!(args.contains(&"10.0.1.5".to_string()));
        // Default options resolve DNS
        assert!(args.contains(&"-R".to_string()));
    }

    #[test]
    fn test_port_args_shape() {
        let plan = plan(&["10.0.0.0/30"], vec![22, 80]);
        let live = vec!["10.0.0.1".parse().unwrap()];
        let args = NmapDriver::port_args(&plan, &live);
        assert_eq!(args[0], "-Pn");
        let p_index = args.iter().position(|a| a == "-p").unwrap();
        assert_eq!(args[p_index + 1], "22,80");
        assert!(args.contains(&"10.0.0.1".to_string()));
        assert!(!args.contains(&"-O".to_string()));
    }

    #[test]
    fn test_full_preset_scans_every_port() {
        let config = ScanConfig {
            network_cidrs: vec!["10.0.0.0/30".into()],
            port_preset: PortPreset::Full,
            ..Default::default()
        }
        .normalize()
        .unwrap();
        let plan = ScanPlan::build(&config).unwrap();
        let args = NmapDriver::port_args(&plan, &["10.0.0.1".parse().unwrap()]);
        assert!(args.contains(&"-p-".to_string()));
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_spawn_failure() {
        let driver = NmapDriver::new("/nonexistent/scanner-binary");
        let plan = plan(&["10.0.0.1"], vec![22]);
        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let err = driver.run_ping(&plan, &cancel, &tx).await.unwrap_err();
        assert!(matches!(err, ScanError::SpawnFailure { .. }));
    }

    #[tokio::test]
    async fn test_empty_report_completes_the_stage() {
        // `true` exits 0 with no output: an empty report, no host events
        let driver = NmapDriver::new("true");
        let plan = plan(&["10.0.0.1"], vec![22]);
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        driver.run_ping(&plan, &cancel, &tx).await.unwrap();
        drop(tx);

        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            seen.push(event);
        }
        assert_eq!(seen, vec![ScanEvent::StageComplete { stage: Stage::Ping }]);
    }

    #[tokio::test]
    async fn test_nonzero_exit_without_events_is_a_scan_failure() {
        let driver = NmapDriver::new("false");
        let plan = plan(&["10.0.0.1"], vec![22]);
        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let err = driver.run_ping(&plan, &cancel, &tx).await.unwrap_err();
        assert!(matches!(err, ScanError::ScannerExit { code: Some(1), .. }));
    }
}
