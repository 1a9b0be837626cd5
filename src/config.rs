//! Configuration for the proxy pool and the dispatcher.

use std::time::Duration;

use crate::backoff::Backoff;
use crate::process::ProcessLimits;

/// Order in which queued locations are admitted when a slot frees up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocationSelection {
    /// Cycle through locations in registry order, resuming after the last
    /// one admitted.
    #[default]
    RoundRobin,
    /// Admit in the order locations were (re)queued.
    Fifo,
    /// Admit a random queued location.
    Random,
}

/// Configuration for the proxy pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Global cap on locations simultaneously Starting, Online or Draining.
    pub max_simultaneous_proxies: usize,
    /// Consecutive failures after which a location is retired.
    pub max_failures: u32,
    /// Delay between a failure and the location's next start.
    pub backoff: Backoff,
    /// Admission order.
    pub selection: LocationSelection,
    /// Tunnel helper command line. `{namespace}` and `{config}` are
    /// substituted; the location's extra arguments are appended.
    pub tunnel_command: Vec<String>,
    /// Line the helper prints on stdout once the tunnel is up.
    pub tunnel_ready_marker: String,
    /// How long to wait for the ready marker.
    pub tunnel_ready_timeout: Duration,
    /// Budgets for the helper process.
    pub tunnel_limits: ProcessLimits,
    /// Prefix that runs a command inside a tunnel's network namespace.
    /// `{namespace}` is substituted.
    pub netns_exec: Vec<String>,
    /// How long a stopping process gets between SIGTERM and SIGKILL.
    pub shutdown_grace: Duration,
}

impl PoolConfig {
    /// Create a new configuration builder.
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::new()
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfigBuilder::new().build()
    }
}

/// Builder for `PoolConfig`.
pub struct PoolConfigBuilder {
    max_simultaneous_proxies: Option<usize>,
    max_failures: Option<u32>,
    backoff_base: Option<Duration>,
    backoff_max: Option<Duration>,
    selection: Option<LocationSelection>,
    tunnel_command: Option<Vec<String>>,
    tunnel_ready_marker: Option<String>,
    tunnel_ready_timeout: Option<Duration>,
    tunnel_limits: Option<ProcessLimits>,
    netns_exec: Option<Vec<String>>,
    shutdown_grace: Option<Duration>,
}

impl PoolConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            max_simultaneous_proxies: None,
            max_failures: None,
            backoff_base: None,
            backoff_max: None,
            selection: None,
            tunnel_command: None,
            tunnel_ready_marker: None,
            tunnel_ready_timeout: None,
            tunnel_limits: None,
            netns_exec: None,
            shutdown_grace: None,
        }
    }

    /// Set the global concurrency cap. Values below 1 are raised to 1.
    pub fn max_simultaneous_proxies(mut self, count: usize) -> Self {
        self.max_simultaneous_proxies = Some(count.max(1));
        self
    }

    /// Set the number of consecutive failures that retires a location.
    pub fn max_failures(mut self, count: u32) -> Self {
        self.max_failures = Some(count.max(1));
        self
    }

    /// Set the base backoff delay.
    pub fn backoff_base(mut self, delay: Duration) -> Self {
        self.backoff_base = Some(delay);
        self
    }

    /// Set the backoff cap.
    pub fn backoff_max(mut self, delay: Duration) -> Self {
        self.backoff_max = Some(delay);
        self
    }

    /// Set the admission order.
    pub fn selection(mut self, selection: LocationSelection) -> Self {
        self.selection = Some(selection);
        self
    }

    /// Set the tunnel helper command template.
    pub fn tunnel_command(mut self, command: Vec<impl Into<String>>) -> Self {
        self.tunnel_command = Some(command.into_iter().map(Into::into).collect());
        self
    }

    /// Set the readiness line printed by the tunnel helper.
    pub fn tunnel_ready_marker(mut self, marker: impl Into<String>) -> Self {
        self.tunnel_ready_marker = Some(marker.into());
        self
    }

    /// Set how long to wait for a tunnel to become ready.
    pub fn tunnel_ready_timeout(mut self, timeout: Duration) -> Self {
        self.tunnel_ready_timeout = Some(timeout);
        self
    }

    /// Set the wall-clock and CPU budgets of tunnel helpers.
    pub fn tunnel_limits(mut self, limits: ProcessLimits) -> Self {
        self.tunnel_limits = Some(limits);
        self
    }

    /// Set the namespace-exec prefix used to route commands through a tunnel.
    pub fn netns_exec(mut self, prefix: Vec<impl Into<String>>) -> Self {
        self.netns_exec = Some(prefix.into_iter().map(Into::into).collect());
        self
    }

    /// Set the SIGTERM-to-SIGKILL grace period.
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = Some(grace);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> PoolConfig {
        let backoff_base = self.backoff_base.unwrap_or(Duration::from_secs(5));
        let backoff_max = self.backoff_max.unwrap_or(Duration::from_secs(300)).max(backoff_base);
        PoolConfig {
            max_simultaneous_proxies: self.max_simultaneous_proxies.unwrap_or(4),
            max_failures: self.max_failures.unwrap_or(3),
            backoff: Backoff::new(backoff_base, backoff_max),
            selection: self.selection.unwrap_or_default(),
            tunnel_command: self.tunnel_command.unwrap_or_else(|| {
                vec!["openvpn-netns".to_string(), "{namespace}".to_string(), "{config}".to_string()]
            }),
            tunnel_ready_marker: self.tunnel_ready_marker.unwrap_or_else(|| "READY".to_string()),
            tunnel_ready_timeout: self.tunnel_ready_timeout.unwrap_or(Duration::from_secs(60)),
            tunnel_limits: self.tunnel_limits.unwrap_or_else(|| {
                ProcessLimits::new(Duration::from_secs(24 * 3600), Some(Duration::from_secs(3600)))
            }),
            netns_exec: self.netns_exec.unwrap_or_else(|| {
                ["ip", "netns", "exec", "{namespace}"].iter().map(|s| s.to_string()).collect()
            }),
            shutdown_grace: self.shutdown_grace.unwrap_or(Duration::from_secs(5)),
        }
    }
}

impl Default for PoolConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the dispatcher and its command executor.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Retryable failures after which a task is given up on.
    pub max_task_attempts: u32,
    /// Budgets for each task process.
    pub task_limits: ProcessLimits,
    /// Exit codes that mark a task's input as malformed; such failures are
    /// final and never count against the location.
    pub permanent_exit_codes: Vec<i32>,
    /// SIGTERM-to-SIGKILL grace period for cancelled tasks.
    pub kill_grace: Duration,
}

impl DispatchConfig {
    /// Create a new configuration builder.
    pub fn builder() -> DispatchConfigBuilder {
        DispatchConfigBuilder::new()
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfigBuilder::new().build()
    }
}

/// Builder for `DispatchConfig`.
#[derive(Default)]
pub struct DispatchConfigBuilder {
    max_task_attempts: Option<u32>,
    task_limits: Option<ProcessLimits>,
    permanent_exit_codes: Option<Vec<i32>>,
    kill_grace: Option<Duration>,
}

impl DispatchConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how many retryable failures a task may accumulate.
    pub fn max_task_attempts(mut self, attempts: u32) -> Self {
        self.max_task_attempts = Some(attempts.max(1));
        self
    }

    /// Set the wall-clock and CPU budgets of task processes.
    pub fn task_limits(mut self, limits: ProcessLimits) -> Self {
        self.task_limits = Some(limits);
        self
    }

    /// Set the exit codes treated as non-retryable.
    pub fn permanent_exit_codes(mut self, codes: Vec<i32>) -> Self {
        self.permanent_exit_codes = Some(codes);
        self
    }

    /// Set the SIGTERM-to-SIGKILL grace period for tasks.
    pub fn kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = Some(grace);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> DispatchConfig {
        DispatchConfig {
            max_task_attempts: self.max_task_attempts.unwrap_or(3),
            task_limits: self.task_limits.unwrap_or_else(|| {
                ProcessLimits::new(Duration::from_secs(600), Some(Duration::from_secs(300)))
            }),
            // EX_USAGE, EX_DATAERR
            permanent_exit_codes: self.permanent_exit_codes.unwrap_or_else(|| vec![64, 65]),
            kill_grace: self.kill_grace.unwrap_or(Duration::from_secs(2)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.max_simultaneous_proxies, 4);
        assert_eq!(config.max_failures, 3);
        assert_eq!(config.selection, LocationSelection::RoundRobin);
        assert_eq!(config.tunnel_command, vec!["openvpn-netns", "{namespace}", "{config}"]);
        assert_eq!(config.tunnel_ready_marker, "READY");
        assert_eq!(config.tunnel_limits.wall, Duration::from_secs(24 * 3600));
        assert_eq!(config.tunnel_limits.cpu, Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_pool_builder_clamps() {
        let config = PoolConfig::builder()
            .max_simultaneous_proxies(0)
            .max_failures(0)
            .backoff_base(Duration::from_secs(10))
            .backoff_max(Duration::from_secs(1))
            .build();
        assert_eq!(config.max_simultaneous_proxies, 1);
        assert_eq!(config.max_failures, 1);
        assert_eq!(config.backoff.max, Duration::from_secs(10));
    }

    #[test]
    fn test_dispatch_defaults() {
        let config = DispatchConfig::default();
        assert_eq!(config.max_task_attempts, 3);
        assert_eq!(config.permanent_exit_codes, vec![64, 65]);
        assert_eq!(config.task_limits.cpu, Some(Duration::from_secs(300)));
    }
}
