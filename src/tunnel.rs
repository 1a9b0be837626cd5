//! Tunnel helper processes.
//!
//! A tunneled location is reached through an external helper (by default
//! `openvpn-netns`) that brings up a VPN inside a network namespace and
//! prints a readiness marker on stdout once traffic can flow.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::config::PoolConfig;
use crate::error::TunnelError;
use crate::location::Location;
use crate::process::{self, GroupChild, ProcessLimits};
use crate::utils;

/// Everything a launcher needs to bring up one tunnel.
#[derive(Debug, Clone, Copy)]
pub struct TunnelRequest<'a> {
    pub location: &'a Location,
    /// Candidate config currently in use.
    pub config: &'a Path,
    /// Index of `config` among the location's candidates.
    pub candidate: usize,
    /// Extra helper arguments from the location file.
    pub extra_args: &'a [String],
    /// Network namespace the tunnel lives in.
    pub namespace: &'a str,
}

/// Starts tunnel processes for tunneled locations.
#[async_trait]
pub trait TunnelLauncher: Send + Sync {
    async fn launch(&self, request: &TunnelRequest<'_>) -> Result<TunnelProcess, TunnelError>;
}

/// The default launcher: runs the configured helper command.
#[derive(Debug, Clone)]
pub struct HelperLauncher {
    command: Vec<String>,
    ready_marker: String,
    limits: ProcessLimits,
}

impl HelperLauncher {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            command: config.tunnel_command.clone(),
            ready_marker: config.tunnel_ready_marker.clone(),
            limits: config.tunnel_limits,
        }
    }

    /// The helper command line for `request`.
    pub fn command_line(&self, request: &TunnelRequest<'_>) -> Vec<String> {
        let config = request.config.to_string_lossy();
        let vars = [
            ("namespace", request.namespace),
            ("config", config.as_ref()),
            ("location", request.location.name.as_str()),
        ];
        self.command
            .iter()
            .map(|arg| utils::expand_placeholders(arg, &vars))
            .chain(request.extra_args.iter().cloned())
            .collect()
    }
}

#[async_trait]
impl TunnelLauncher for HelperLauncher {
    async fn launch(&self, request: &TunnelRequest<'_>) -> Result<TunnelProcess, TunnelError> {
        let argv = self.command_line(request);
        TunnelProcess::spawn(&argv, &self.ready_marker, self.limits)
    }
}

/// A running tunnel helper.
///
/// The helper's stdout is drained by a background task that fires the
/// readiness signal when the marker line appears. The helper leads its own
/// process group, so whatever it forks (openvpn itself) goes down with it.
#[derive(Debug)]
pub struct TunnelProcess {
    process: GroupChild,
    ready: Option<oneshot::Receiver<()>>,
    lifetime: Duration,
    deadline: Instant,
}

impl TunnelProcess {
    /// Spawn `argv` and watch its stdout for `ready_marker`.
    pub fn spawn(argv: &[String], ready_marker: &str, limits: ProcessLimits) -> Result<Self, TunnelError> {
        let program = argv.first().cloned().unwrap_or_default();
        let mut helper = process::spawn(argv, &limits, Stdio::inherit())
            .map_err(|source| TunnelError::Spawn { program, source })?;

        let (ready_tx, ready_rx) = oneshot::channel();
        if let Some(stdout) = helper.child.stdout.take() {
            let marker = ready_marker.to_string();
            let pid = helper.id();
            tokio::spawn(async move {
                let mut ready_tx = Some(ready_tx);
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[tunnel {:?}] {}", pid, line);
                    if line.trim() == marker {
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(());
                        }
                    }
                }
            });
        }

        Ok(Self {
            process: helper,
            ready: Some(ready_rx),
            lifetime: limits.wall,
            deadline: Instant::now() + limits.wall,
        })
    }

    /// OS process id, if the helper has not been reaped yet.
    pub fn id(&self) -> Option<u32> {
        self.process.id()
    }

    /// Wait until the helper announces readiness.
    pub async fn wait_ready(&mut self, timeout: Duration) -> Result<(), TunnelError> {
        let Some(ready) = self.ready.take() else {
            return Ok(());
        };

        enum Waited {
            Ready,
            StdoutClosed,
            Exited(String),
            TimedOut,
        }

        let waited = tokio::select! {
            signal = ready => match signal {
                Ok(()) => Waited::Ready,
                Err(_) => Waited::StdoutClosed,
            },
            status = self.process.child.wait() => Waited::Exited(describe(status)),
            _ = tokio::time::sleep(timeout) => Waited::TimedOut,
        };

        match waited {
            Waited::Ready => Ok(()),
            Waited::Exited(status) => Err(TunnelError::ExitedEarly { status }),
            Waited::StdoutClosed => {
                // no marker will ever come; give the helper a moment to exit
                match tokio::time::timeout(timeout, self.process.child.wait()).await {
                    Ok(status) => Err(TunnelError::ExitedEarly { status: describe(status) }),
                    Err(_) => Err(TunnelError::ReadyTimeout(timeout)),
                }
            }
            Waited::TimedOut => Err(TunnelError::ReadyTimeout(timeout)),
        }
    }

    /// Resolve when the helper exits or outlives its wall-clock budget.
    pub async fn wait_exit(&mut self) -> TunnelError {
        tokio::select! {
            status = self.process.child.wait() => TunnelError::Dropped { status: describe(status) },
            _ = tokio::time::sleep_until(self.deadline) => TunnelError::LifetimeExceeded(self.lifetime),
        }
    }

    /// SIGTERM, then SIGKILL after `grace`; always reaps.
    pub async fn terminate(&mut self, grace: Duration) {
        process::terminate(&mut self.process, grace).await;
    }

    /// SIGKILL and reap.
    pub async fn kill(&mut self) {
        process::kill_and_reap(&mut self.process).await;
    }
}

fn describe(status: std::io::Result<std::process::ExitStatus>) -> String {
    match status {
        Ok(status) => status.to_string(),
        Err(e) => format!("wait failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn argv(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn limits() -> ProcessLimits {
        ProcessLimits::new(Duration::from_secs(30), None)
    }

    #[test]
    fn test_helper_command_line() {
        let config = PoolConfig::default();
        let launcher = HelperLauncher::new(&config);
        let location = Location::tunneled("de", vec![PathBuf::from("/vpn/de-1.ovpn")]);
        let extra = vec!["--auth-nocache".to_string()];
        let request = TunnelRequest {
            location: &location,
            config: Path::new("/vpn/de-1.ovpn"),
            candidate: 0,
            extra_args: &extra,
            namespace: "ns_de",
        };
        assert_eq!(
            launcher.command_line(&request),
            vec!["openvpn-netns", "ns_de", "/vpn/de-1.ovpn", "--auth-nocache"]
        );
    }

    #[tokio::test]
    async fn test_ready_marker_brings_tunnel_up() {
        let mut tunnel = TunnelProcess::spawn(&argv("echo starting; echo READY; sleep 30"), "READY", limits()).unwrap();
        tunnel.wait_ready(Duration::from_secs(5)).await.unwrap();
        tunnel.terminate(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_exit_before_ready() {
        let mut tunnel = TunnelProcess::spawn(&argv("echo nope; exit 3"), "READY", limits()).unwrap();
        let err = tunnel.wait_ready(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, TunnelError::ExitedEarly { .. }));
    }

    #[tokio::test]
    async fn test_ready_timeout() {
        let mut tunnel = TunnelProcess::spawn(&argv("sleep 30"), "READY", limits()).unwrap();
        let err = tunnel.wait_ready(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, TunnelError::ReadyTimeout(_)));
        tunnel.kill().await;
    }

    #[tokio::test]
    async fn test_drop_detected_after_ready() {
        let mut tunnel = TunnelProcess::spawn(&argv("echo READY; sleep 0.2; exit 1"), "READY", limits()).unwrap();
        tunnel.wait_ready(Duration::from_secs(5)).await.unwrap();
        let err = tunnel.wait_exit().await;
        assert!(matches!(err, TunnelError::Dropped { .. }));
    }

    #[tokio::test]
    async fn test_lifetime_budget() {
        let short = ProcessLimits::new(Duration::from_millis(200), None);
        let mut tunnel = TunnelProcess::spawn(&argv("echo READY; sleep 30"), "READY", short).unwrap();
        tunnel.wait_ready(Duration::from_secs(5)).await.unwrap();
        let err = tunnel.wait_exit().await;
        assert!(matches!(err, TunnelError::LifetimeExceeded(_)));
        tunnel.kill().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cpu_budget_drops_tunnel() {
        let cpu = ProcessLimits::new(Duration::from_secs(20), Some(Duration::from_secs(1)));
        let mut tunnel = TunnelProcess::spawn(&argv("echo READY; while :; do :; done"), "READY", cpu).unwrap();
        tunnel.wait_ready(Duration::from_secs(5)).await.unwrap();
        match tunnel.wait_exit().await {
            TunnelError::Dropped { status } => assert!(status.contains("signal"), "unexpected status {status}"),
            other => panic!("expected the kernel to stop the helper, got {other:?}"),
        }
        tunnel.kill().await;
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let err = TunnelProcess::spawn(&["/nonexistent/openvpn-netns".to_string()], "READY", limits()).unwrap_err();
        assert!(matches!(err, TunnelError::Spawn { .. }));
    }
}
