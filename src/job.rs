//! A complete run: one proxy pool feeding one dispatcher.

use std::sync::Arc;

use log::{error, info};
use tokio_util::sync::CancellationToken;

use crate::config::{DispatchConfig, PoolConfig};
use crate::dispatcher::{Dispatcher, RunSummary};
use crate::location::Location;
use crate::pool::{PoolMonitor, PoolReport, ProxyPool};
use crate::task::{TaskExecutor, TaskSpec};
use crate::tunnel::TunnelLauncher;

/// Outcome of a job: what happened to the tasks and to the locations.
#[derive(Debug, Clone, Default)]
pub struct JobReport {
    pub summary: RunSummary,
    pub pool: PoolReport,
}

impl JobReport {
    /// Every task got a final outcome.
    pub fn is_complete(&self) -> bool {
        self.summary.is_complete()
    }
}

/// Wires a [`ProxyPool`] to a [`Dispatcher`] over the event channel.
pub struct Job {
    pool: ProxyPool,
    dispatcher: Dispatcher,
}

impl Job {
    /// Create a job whose tunnels are started with the configured helper.
    pub fn new(
        pool_config: PoolConfig,
        dispatch_config: DispatchConfig,
        locations: Vec<Location>,
        tasks: Vec<TaskSpec>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Self {
        let dispatcher = Dispatcher::new(tasks, &locations, executor, dispatch_config);
        Self {
            pool: ProxyPool::new(pool_config, locations),
            dispatcher,
        }
    }

    /// Create a job with a custom tunnel launcher.
    pub fn with_launcher(
        pool_config: PoolConfig,
        dispatch_config: DispatchConfig,
        locations: Vec<Location>,
        tasks: Vec<TaskSpec>,
        executor: Arc<dyn TaskExecutor>,
        launcher: Arc<dyn TunnelLauncher>,
    ) -> Self {
        let dispatcher = Dispatcher::new(tasks, &locations, executor, dispatch_config);
        Self {
            pool: ProxyPool::with_launcher(pool_config, locations, launcher),
            dispatcher,
        }
    }

    /// Cancelling this token stops the job early: tasks in flight are
    /// cancelled and every tunnel is torn down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.pool.shutdown_token()
    }

    pub fn monitor(&self) -> PoolMonitor {
        self.pool.monitor()
    }

    /// Run until every task is settled or no location is left to run them,
    /// then wait for the pool to stop every tunnel.
    pub async fn run(self) -> JobReport {
        let stop = self.pool.shutdown_token();
        let (pool, events) = self.pool.spawn();
        let summary = self.dispatcher.run(events, stop).await;
        let pool = match pool.await {
            Ok(report) => report,
            Err(e) => {
                error!("Proxy pool task failed: {}", e);
                PoolReport::default()
            }
        };
        info!(
            "Job finished: {} locations completed, {} retired",
            pool.completed.len(),
            pool.retired.len()
        );
        JobReport { summary, pool }
    }
}
