//! # vantage-dispatch
//!
//! A job dispatcher driven by a pool of network vantage points.
//!
//! Each location is reached either directly or through a tunnel helper that
//! brings up a VPN inside its own network namespace. The [`ProxyPool`] keeps as
//! many tunnels up as a global cap allows, restarts failed ones with
//! exponential backoff and retires locations that keep failing. The
//! [`Dispatcher`] hands tasks to whichever proxies are online and cancels
//! work on proxies that go away, so every task ends up succeeded, failed or
//! reported as not completed.

pub mod backoff;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod job;
pub mod location;
pub mod pool;
pub mod process;
pub mod proxy;
pub mod task;
pub mod tunnel;
mod utils;

pub use backoff::Backoff;
pub use config::{DispatchConfig, DispatchConfigBuilder, LocationSelection, PoolConfig, PoolConfigBuilder};
pub use dispatcher::{Dispatcher, RunSummary, TaskReport};
pub use error::{ConfigError, ConfigIssue, ExhaustedRetries, TaskError, TunnelError};
pub use job::{Job, JobReport};
pub use location::{load_locations, parse_locations, ConnectionMethod, Location};
pub use pool::{LocationState, PoolEvent, PoolMonitor, PoolReport, PoolSnapshot, ProxyLease, ProxyPool};
pub use process::ProcessLimits;
pub use proxy::{ProxyHandle, ProxyState, Route};
pub use task::{
    load_work, parse_work, CommandExecutor, TaskExecutor, TaskOutput, TaskResult, TaskSpec, TaskStatus,
    TaskTarget,
};
pub use tunnel::{HelperLauncher, TunnelLauncher, TunnelProcess, TunnelRequest};
