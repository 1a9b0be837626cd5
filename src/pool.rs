//! Core proxy pool implementation.
//!
//! The pool owns every [`ProxyHandle`] and the admission counter. Each
//! admitted location runs its own lifecycle task (start tunnel, wait ready,
//! serve the dispatcher, handle failure) so a slow or broken location never
//! holds up the admission loop. The dispatcher hears about the pool only
//! through [`PoolEvent`]s and talks back only through the [`ProxyLease`] it
//! is handed when a proxy comes online.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::{LocationSelection, PoolConfig};
use crate::error::{ExhaustedRetries, TunnelError};
use crate::location::Location;
use crate::proxy::{ProxyHandle, Route};
use crate::tunnel::{HelperLauncher, TunnelLauncher};

/// Lifecycle notifications sent from the pool to the dispatcher.
#[derive(Debug)]
pub enum PoolEvent {
    /// A location's proxy is ready for work.
    Online(ProxyLease),
    /// A location's proxy is going away. The pool waits for `ack` before
    /// tearing the tunnel down or restarting the location, so the receiver
    /// must cancel and reap any work bound to it first.
    Offline {
        location: String,
        reason: String,
        ack: oneshot::Sender<()>,
    },
    /// A location failed too often and will not be started again.
    Retired { location: String, failures: u32 },
}

#[derive(Debug)]
pub(crate) enum LeaseSignal {
    Success,
    Failure(String),
}

/// The dispatcher's hold on an online proxy.
///
/// Dropping the lease tells the pool the location has no more work, and the
/// proxy is stopped gracefully.
#[derive(Debug)]
pub struct ProxyLease {
    location: Arc<Location>,
    label: String,
    route: Route,
    signals: mpsc::UnboundedSender<LeaseSignal>,
}

impl ProxyLease {
    pub(crate) fn new(
        location: Arc<Location>,
        label: String,
        route: Route,
    ) -> (Self, mpsc::UnboundedReceiver<LeaseSignal>) {
        let (signals, receiver) = mpsc::unbounded_channel();
        let lease = Self {
            location,
            label,
            route,
            signals,
        };
        (lease, receiver)
    }

    pub fn location(&self) -> &Arc<Location> {
        &self.location
    }

    pub fn name(&self) -> &str {
        &self.location.name
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    /// Route `command` through this proxy.
    pub fn adjust_command(&self, command: &[String]) -> Vec<String> {
        self.route.adjust_command(command)
    }

    /// A task succeeded through this proxy; resets its failure count.
    pub fn report_success(&self) {
        let _ = self.signals.send(LeaseSignal::Success);
    }

    /// A task failed at the network layer through this proxy. The location
    /// is treated as failed and restarted subject to the retry policy.
    pub fn report_failure(self, reason: impl Into<String>) {
        let _ = self.signals.send(LeaseSignal::Failure(reason.into()));
    }

    /// Hand the proxy back; the pool stops it.
    pub fn release(self) {}
}

/// Where a location is in its pool lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocationState {
    Queued,
    Starting,
    Online,
    Draining,
    Stopping,
    Failed,
    /// Waiting out its backoff delay; holds no admission slot.
    Retrying,
    /// Excluded for the rest of the run.
    Retired,
    /// Its proxy was released after its work was done.
    Completed,
    /// Stopped by pool shutdown.
    Stopped,
}

impl LocationState {
    /// Whether this state counts against the concurrency cap.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Online | Self::Draining)
    }
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Default)]
pub struct PoolSnapshot {
    /// Current state of every location.
    pub states: HashMap<String, LocationState>,
    /// Every transition so far, in order.
    pub transitions: Vec<(String, LocationState)>,
    /// Locations currently Starting, Online or Draining.
    pub active: usize,
    /// Highest `active` seen.
    pub peak_active: usize,
    /// Consecutive failures of every location that has been started.
    pub failures: HashMap<String, u32>,
}

impl PoolSnapshot {
    /// How many times `location` has been started.
    pub fn starts(&self, location: &str) -> usize {
        self.transitions
            .iter()
            .filter(|(name, state)| name == location && *state == LocationState::Starting)
            .count()
    }
}

/// Cloneable read handle on the pool's state.
#[derive(Debug, Clone, Default)]
pub struct PoolMonitor {
    inner: Arc<RwLock<PoolSnapshot>>,
}

impl PoolMonitor {
    pub fn snapshot(&self) -> PoolSnapshot {
        self.inner.read().clone()
    }

    pub fn state(&self, location: &str) -> Option<LocationState> {
        self.inner.read().states.get(location).copied()
    }

    /// Number of locations currently holding an admission slot.
    pub fn active(&self) -> usize {
        self.inner.read().active
    }

    /// Consecutive failures of `location`, 0 if it never failed.
    pub fn failures(&self, location: &str) -> u32 {
        self.inner.read().failures.get(location).copied().unwrap_or(0)
    }

    fn record_failures(&self, location: &str, failures: u32) {
        self.inner.write().failures.insert(location.to_string(), failures);
    }

    fn set(&self, location: &str, state: LocationState) {
        let mut snapshot = self.inner.write();
        let old = snapshot.states.insert(location.to_string(), state);
        if old == Some(state) {
            return;
        }
        snapshot.transitions.push((location.to_string(), state));
        let active = snapshot.states.values().filter(|s| s.is_active()).count();
        snapshot.active = active;
        if active > snapshot.peak_active {
            snapshot.peak_active = active;
        }
        debug!("Location {} status changed: {:?} -> {:?}", location, old, state);
    }
}

/// What happened to every location by the time the pool stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolReport {
    /// Released by the dispatcher after finishing their work.
    pub completed: Vec<String>,
    /// Excluded after exhausting their retries.
    pub retired: Vec<String>,
    /// Stopped by pool shutdown while online or starting.
    pub stopped: Vec<String>,
    /// Still queued or backing off when the pool shut down.
    pub not_started: Vec<String>,
}

/// Per-location bookkeeping that survives across activations.
#[derive(Debug)]
struct Slot {
    index: usize,
    location: Arc<Location>,
    active_candidate: usize,
    consecutive_failures: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleExit {
    Completed,
    Failed,
    Shutdown,
}

/// A pool of location proxies bounded by a global concurrency cap.
pub struct ProxyPool {
    config: Arc<PoolConfig>,
    locations: Vec<Arc<Location>>,
    launcher: Arc<dyn TunnelLauncher>,
    shutdown: CancellationToken,
    monitor: PoolMonitor,
}

impl ProxyPool {
    /// Create a pool that launches tunnels with the configured helper command.
    pub fn new(config: PoolConfig, locations: Vec<Location>) -> Self {
        let launcher = Arc::new(HelperLauncher::new(&config));
        Self::with_launcher(config, locations, launcher)
    }

    /// Create a pool with a custom tunnel launcher.
    pub fn with_launcher(
        config: PoolConfig,
        locations: Vec<Location>,
        launcher: Arc<dyn TunnelLauncher>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            locations: locations.into_iter().map(Arc::new).collect(),
            launcher,
            shutdown: CancellationToken::new(),
            monitor: PoolMonitor::default(),
        }
    }

    /// Token that stops the pool when cancelled: no new admissions, and
    /// every live proxy is taken offline and stopped.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn monitor(&self) -> PoolMonitor {
        self.monitor.clone()
    }

    /// Run the pool on its own task. The receiver yields lifecycle events and
    /// closes once the pool has fully stopped.
    pub fn spawn(self) -> (JoinHandle<PoolReport>, mpsc::UnboundedReceiver<PoolEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (tokio::spawn(self.run(events)), receiver)
    }

    /// Run the admission loop until every location has completed, retired
    /// or been stopped by shutdown.
    pub async fn run(self, events: mpsc::UnboundedSender<PoolEvent>) -> PoolReport {
        let cap = self.config.max_simultaneous_proxies;
        info!(
            "Starting proxy pool: {} locations, at most {} at once",
            self.locations.len(),
            cap
        );

        let mut queue: Vec<Slot> = self
            .locations
            .iter()
            .enumerate()
            .map(|(index, location)| Slot {
                index,
                location: Arc::clone(location),
                active_candidate: 0,
                consecutive_failures: 0,
            })
            .collect();
        for slot in &queue {
            self.monitor.set(&slot.location.name, LocationState::Queued);
        }

        let mut cursor = 0;
        let mut active: JoinSet<(Slot, LifecycleExit)> = JoinSet::new();
        let mut backing_off: JoinSet<Slot> = JoinSet::new();
        let mut report = PoolReport::default();
        let mut stopping = false;

        loop {
            if !stopping {
                while active.len() < cap {
                    let Some(slot) = self.select_next(&mut queue, &mut cursor) else {
                        break;
                    };
                    let lifecycle = Lifecycle {
                        config: Arc::clone(&self.config),
                        launcher: Arc::clone(&self.launcher),
                        events: events.clone(),
                        shutdown: self.shutdown.clone(),
                        monitor: self.monitor.clone(),
                    };
                    active.spawn(lifecycle.run(slot));
                }
            }

            if active.is_empty() && backing_off.is_empty() && (stopping || queue.is_empty()) {
                break;
            }

            tokio::select! {
                Some(joined) = active.join_next() => match joined {
                    Ok((slot, exit)) => {
                        self.after_lifecycle(slot, exit, stopping, &events, &mut backing_off, &mut report);
                    }
                    Err(e) => error!("Location lifecycle task failed: {}", e),
                },
                Some(joined) = backing_off.join_next() => match joined {
                    Ok(slot) if stopping => {
                        self.monitor.set(&slot.location.name, LocationState::Stopped);
                        report.not_started.push(slot.location.name.clone());
                    }
                    Ok(slot) => {
                        info!("Location {} queued for retry", slot.location.name);
                        self.monitor.set(&slot.location.name, LocationState::Queued);
                        queue.push(slot);
                    }
                    Err(e) => error!("Backoff task failed: {}", e),
                },
                _ = self.shutdown.cancelled(), if !stopping => {
                    info!("Proxy pool shutting down");
                    stopping = true;
                    for slot in queue.drain(..) {
                        self.monitor.set(&slot.location.name, LocationState::Stopped);
                        report.not_started.push(slot.location.name.clone());
                    }
                },
                else => break,
            }
        }

        info!(
            "Proxy pool stopped: {} completed, {} retired, {} stopped, {} never started",
            report.completed.len(),
            report.retired.len(),
            report.stopped.len(),
            report.not_started.len()
        );
        report
    }

    /// Pick the next queued location according to the selection strategy.
    fn select_next(&self, queue: &mut Vec<Slot>, cursor: &mut usize) -> Option<Slot> {
        if queue.is_empty() {
            return None;
        }
        let pos = match self.config.selection {
            LocationSelection::Fifo => 0,
            LocationSelection::Random => rand::rng().random_range(0..queue.len()),
            LocationSelection::RoundRobin => {
                let n = self.locations.len().max(1);
                let start = *cursor % n;
                queue
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, slot)| (slot.index + n - start) % n)
                    .map(|(pos, _)| pos)?
            }
        };
        let slot = queue.remove(pos);
        *cursor = slot.index + 1;
        Some(slot)
    }

    /// Apply the retry policy to a location whose lifecycle just ended.
    fn after_lifecycle(
        &self,
        mut slot: Slot,
        exit: LifecycleExit,
        stopping: bool,
        events: &mpsc::UnboundedSender<PoolEvent>,
        backing_off: &mut JoinSet<Slot>,
        report: &mut PoolReport,
    ) {
        let name = slot.location.name.clone();
        match exit {
            LifecycleExit::Completed => {
                info!("Location {} completed", name);
                self.monitor.set(&name, LocationState::Completed);
                report.completed.push(name);
            }
            LifecycleExit::Shutdown => {
                self.monitor.set(&name, LocationState::Stopped);
                report.stopped.push(name);
            }
            LifecycleExit::Failed if stopping => {
                self.monitor.set(&name, LocationState::Stopped);
                report.stopped.push(name);
            }
            LifecycleExit::Failed if slot.consecutive_failures >= self.config.max_failures => {
                let retired = ExhaustedRetries {
                    location: name.clone(),
                    failures: slot.consecutive_failures,
                };
                warn!("{}; excluded for the rest of the run", retired);
                self.monitor.set(&name, LocationState::Retired);
                let _ = events.send(PoolEvent::Retired {
                    location: name.clone(),
                    failures: slot.consecutive_failures,
                });
                report.retired.push(name);
            }
            LifecycleExit::Failed => {
                slot.active_candidate = (slot.active_candidate + 1) % slot.location.candidate_count();
                let delay = self.config.backoff.delay(slot.consecutive_failures);
                info!(
                    "Location {} failed {} time(s); retrying with candidate {} in {:?}",
                    name, slot.consecutive_failures, slot.active_candidate, delay
                );
                self.monitor.set(&name, LocationState::Retrying);
                let shutdown = self.shutdown.clone();
                backing_off.spawn(async move {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.cancelled() => {}
                    }
                    slot
                });
            }
        }
    }
}

/// Everything one location's lifecycle task needs.
struct Lifecycle {
    config: Arc<PoolConfig>,
    launcher: Arc<dyn TunnelLauncher>,
    events: mpsc::UnboundedSender<PoolEvent>,
    shutdown: CancellationToken,
    monitor: PoolMonitor,
}

enum OnlineExit {
    Released,
    Failed(TunnelError),
    Shutdown,
}

impl Lifecycle {
    async fn run(self, mut slot: Slot) -> (Slot, LifecycleExit) {
        let mut handle = ProxyHandle::new(
            Arc::clone(&slot.location),
            &self.config,
            slot.active_candidate,
            slot.consecutive_failures,
        );
        let exit = self.drive(&mut handle).await;
        slot.active_candidate = handle.active_candidate();
        slot.consecutive_failures = handle.consecutive_failures();
        self.monitor.record_failures(&slot.location.name, slot.consecutive_failures);
        (slot, exit)
    }

    async fn drive(&self, handle: &mut ProxyHandle) -> LifecycleExit {
        let name = handle.location().name.clone();
        self.monitor.set(&name, LocationState::Starting);
        info!("Starting proxy {}", handle.label());

        if handle.start(self.launcher.as_ref()).await.is_err() {
            self.monitor.set(&name, LocationState::Failed);
            handle.close().await;
            return LifecycleExit::Failed;
        }

        let ready = tokio::select! {
            ready = handle.wait_ready(self.config.tunnel_ready_timeout) => Some(ready),
            _ = self.shutdown.cancelled() => None,
        };
        match ready {
            None => {
                self.stop(handle).await;
                return LifecycleExit::Shutdown;
            }
            Some(Err(_)) => {
                self.monitor.set(&name, LocationState::Failed);
                handle.close().await;
                return LifecycleExit::Failed;
            }
            Some(Ok(())) => {}
        }

        self.monitor.set(&name, LocationState::Online);
        info!("Proxy {} online", handle.label());
        let (lease, mut signals) =
            ProxyLease::new(Arc::clone(handle.location()), handle.label(), handle.route().clone());
        if self.events.send(PoolEvent::Online(lease)).is_err() {
            debug!("No dispatcher listening; stopping {}", handle.label());
            self.stop(handle).await;
            return LifecycleExit::Shutdown;
        }

        let exit = loop {
            let step = tokio::select! {
                biased;
                signal = signals.recv() => match signal {
                    Some(LeaseSignal::Success) => None,
                    Some(LeaseSignal::Failure(reason)) => Some(OnlineExit::Failed(TunnelError::TaskReported(reason))),
                    None => Some(OnlineExit::Released),
                },
                err = handle.dropped() => Some(OnlineExit::Failed(err)),
                _ = self.shutdown.cancelled() => Some(OnlineExit::Shutdown),
            };
            match step {
                Some(exit) => break exit,
                None => {
                    handle.reset_failures();
                    self.monitor.record_failures(&name, 0);
                }
            }
        };

        match exit {
            OnlineExit::Released => {
                info!("Proxy {} released", handle.label());
                self.stop(handle).await;
                LifecycleExit::Completed
            }
            OnlineExit::Shutdown => {
                self.go_offline(&name, "pool shutting down").await;
                self.stop(handle).await;
                LifecycleExit::Shutdown
            }
            OnlineExit::Failed(err) => {
                if matches!(err, TunnelError::TaskReported(_)) {
                    handle.mark_failed(&err);
                }
                self.monitor.set(&name, LocationState::Failed);
                info!("Proxy {} offline: {}", handle.label(), err);
                self.go_offline(&name, &err.to_string()).await;
                self.monitor.set(&name, LocationState::Stopping);
                handle.close().await;
                LifecycleExit::Failed
            }
        }
    }

    /// Tell the dispatcher the proxy is going away and wait until it has
    /// cleaned up whatever was bound to it.
    async fn go_offline(&self, name: &str, reason: &str) {
        let (ack, acked) = oneshot::channel();
        let event = PoolEvent::Offline {
            location: name.to_string(),
            reason: reason.to_string(),
            ack,
        };
        if self.events.send(event).is_ok() {
            let _ = acked.await;
        }
    }

    async fn stop(&self, handle: &mut ProxyHandle) {
        let name = handle.location().name.clone();
        handle.drain();
        self.monitor.set(&name, LocationState::Draining);
        self.monitor.set(&name, LocationState::Stopping);
        handle.stop(self.config.shutdown_grace).await;
    }
}
