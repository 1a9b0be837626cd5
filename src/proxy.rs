//! Proxy handles: one location's live connection and its health.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use crate::config::PoolConfig;
use crate::error::TunnelError;
use crate::location::{ConnectionMethod, Location};
use crate::tunnel::{TunnelLauncher, TunnelProcess, TunnelRequest};
use crate::utils;

/// Status of a proxy handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyState {
    /// Created but not started.
    Queued,
    /// The tunnel helper is running but has not reported readiness.
    Starting,
    /// Traffic can be routed through this proxy.
    Online,
    /// No longer accepting work, about to stop.
    Draining,
    /// The tunnel is being torn down.
    Stopping,
    /// Torn down cleanly.
    Stopped,
    /// Failed to start, or dropped while online.
    Failed,
}

impl ProxyState {
    /// Whether this state occupies an admission slot.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Online | Self::Draining)
    }
}

/// How a command is routed through a proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Run on the host network.
    Direct,
    /// Run inside a tunnel's network namespace.
    Namespace {
        /// Namespace name.
        namespace: String,
        /// Command prefix that enters the namespace, already expanded.
        prefix: Vec<String>,
    },
}

impl Route {
    /// Route for `location`, using `netns_exec` as the namespace-entry template.
    pub fn for_location(location: &Location, netns_exec: &[String]) -> Self {
        match location.method {
            ConnectionMethod::Direct => Self::Direct,
            ConnectionMethod::TunneledVia { .. } => {
                let namespace = namespace_for(location);
                let vars = [("namespace", namespace.as_str())];
                let prefix = netns_exec
                    .iter()
                    .map(|arg| utils::expand_placeholders(arg, &vars))
                    .collect();
                Self::Namespace { namespace, prefix }
            }
        }
    }

    /// Rewrite `command` so its network traffic goes through this route.
    pub fn adjust_command(&self, command: &[String]) -> Vec<String> {
        match self {
            Self::Direct => command.to_vec(),
            Self::Namespace { prefix, .. } => prefix.iter().chain(command).cloned().collect(),
        }
    }
}

/// Network namespace used by a tunneled location.
pub fn namespace_for(location: &Location) -> String {
    format!("ns_{}", location.name)
}

/// One live or pending connection to one location.
///
/// The handle owns the tunnel process. Every exit path (`stop`, `close`,
/// or simply dropping the handle) terminates the helper.
pub struct ProxyHandle {
    location: Arc<Location>,
    state: ProxyState,
    tunnel: Option<TunnelProcess>,
    route: Route,
    active_candidate: usize,
    consecutive_failures: u32,
}

impl ProxyHandle {
    /// Create a handle for `location`, resuming candidate rotation and
    /// failure accounting from previous activations.
    pub fn new(
        location: Arc<Location>,
        config: &PoolConfig,
        active_candidate: usize,
        consecutive_failures: u32,
    ) -> Self {
        let route = Route::for_location(&location, &config.netns_exec);
        let active_candidate = active_candidate % location.candidate_count();
        Self {
            location,
            state: ProxyState::Queued,
            tunnel: None,
            route,
            active_candidate,
            consecutive_failures,
        }
    }

    pub fn location(&self) -> &Arc<Location> {
        &self.location
    }

    pub fn state(&self) -> ProxyState {
        self.state
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn active_candidate(&self) -> usize {
        self.active_candidate
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Stable identifier for logs: the location name, plus the candidate
    /// index for tunneled locations.
    pub fn label(&self) -> String {
        if self.location.is_tunneled() {
            format!("{}#{}", self.location.name, self.active_candidate)
        } else {
            self.location.name.clone()
        }
    }

    /// Launch the connection. Direct locations go Online immediately;
    /// tunneled ones go Starting until [`ProxyHandle::wait_ready`] succeeds.
    pub async fn start(&mut self, launcher: &dyn TunnelLauncher) -> Result<(), TunnelError> {
        let location = Arc::clone(&self.location);
        let (configs, extra_args) = match &location.method {
            ConnectionMethod::Direct => {
                self.state = ProxyState::Online;
                return Ok(());
            }
            ConnectionMethod::TunneledVia { configs, extra_args } => (configs, extra_args),
        };

        let Some(config) = configs.get(self.active_candidate) else {
            let err = TunnelError::Spawn {
                program: String::new(),
                source: io::Error::new(io::ErrorKind::NotFound, "location has no candidate configs"),
            };
            self.mark_failed(&err);
            return Err(err);
        };

        self.state = ProxyState::Starting;
        let namespace = namespace_for(&location);
        let request = TunnelRequest {
            location: &location,
            config,
            candidate: self.active_candidate,
            extra_args,
            namespace: &namespace,
        };
        info!("Launching tunnel {} with {}", self.label(), config.display());
        match launcher.launch(&request).await {
            Ok(tunnel) => {
                self.tunnel = Some(tunnel);
                Ok(())
            }
            Err(err) => {
                self.mark_failed(&err);
                Err(err)
            }
        }
    }

    /// Wait for the tunnel to report readiness, then go Online.
    pub async fn wait_ready(&mut self, timeout: Duration) -> Result<(), TunnelError> {
        if self.state == ProxyState::Online {
            return Ok(());
        }
        let result = match self.tunnel.as_mut() {
            Some(tunnel) => tunnel.wait_ready(timeout).await,
            None => Err(TunnelError::ExitedEarly {
                status: "not started".to_string(),
            }),
        };
        match result {
            Ok(()) => {
                self.state = ProxyState::Online;
                Ok(())
            }
            Err(err) => {
                self.mark_failed(&err);
                Err(err)
            }
        }
    }

    /// Resolve when the tunnel goes away. Never resolves for direct
    /// locations, which cannot drop.
    pub async fn dropped(&mut self) -> TunnelError {
        let err = match self.tunnel.as_mut() {
            Some(tunnel) => tunnel.wait_exit().await,
            None => futures::future::pending().await,
        };
        self.mark_failed(&err);
        err
    }

    /// Route `command` through this proxy.
    pub fn adjust_command(&self, command: &[String]) -> Vec<String> {
        self.route.adjust_command(command)
    }

    /// Record a failure: the handle goes Failed and the failure counts
    /// towards the location's backoff.
    pub fn mark_failed(&mut self, err: &TunnelError) {
        self.state = ProxyState::Failed;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        warn!(
            "Proxy {} failed ({} consecutive): {}",
            self.label(),
            self.consecutive_failures,
            err
        );
    }

    /// A task succeeded through this proxy.
    pub fn reset_failures(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Stop accepting work. The tunnel stays up until [`ProxyHandle::stop`].
    pub fn drain(&mut self) {
        if self.state == ProxyState::Online {
            self.state = ProxyState::Draining;
        }
    }

    /// Graceful shutdown: Stopping, then Stopped once the helper has exited
    /// (SIGKILL after `grace`).
    pub async fn stop(&mut self, grace: Duration) {
        self.drain();
        self.state = ProxyState::Stopping;
        if let Some(mut tunnel) = self.tunnel.take() {
            tunnel.terminate(grace).await;
        }
        self.state = ProxyState::Stopped;
        info!("Proxy {} stopped", self.label());
    }

    /// Immediate teardown. A Failed handle stays Failed.
    pub async fn close(&mut self) {
        if let Some(mut tunnel) = self.tunnel.take() {
            tunnel.kill().await;
        }
        if self.state != ProxyState::Failed {
            self.state = ProxyState::Stopped;
        }
    }
}

impl fmt::Debug for ProxyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyHandle")
            .field("label", &self.label())
            .field("state", &self.state)
            .field("consecutive_failures", &self.consecutive_failures)
            .field("pid", &self.tunnel.as_ref().and_then(TunnelProcess::id))
            .finish()
    }
}
