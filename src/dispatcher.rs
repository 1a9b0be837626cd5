//! The dispatcher: binds pending tasks to online proxies.
//!
//! It owns all task state. The pool reaches it only through [`PoolEvent`]s,
//! and it reaches the pool only through the [`ProxyLease`]s it holds: one
//! running attempt per lease at a time, so concurrency comes from having many
//! proxies online, never from stacking tasks on one tunnel.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::DispatchConfig;
use crate::error::TaskError;
use crate::location::Location;
use crate::pool::{PoolEvent, ProxyLease};
use crate::task::{TaskExecutor, TaskResult, TaskSpec, TaskStatus, TaskTarget};

struct TaskEntry {
    spec: Arc<TaskSpec>,
    status: TaskStatus,
    /// Retryable failures so far.
    failures: u32,
}

/// A task attempt running through a lease.
struct Binding {
    task: usize,
    lease: ProxyLease,
    cancel: CancellationToken,
    /// Set once the proxy went offline; answered when the attempt returns.
    offline_ack: Option<oneshot::Sender<()>>,
}

struct AttemptReport {
    location: String,
    result: TaskResult,
}

/// Final state of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub id: String,
    pub target: TaskTarget,
    pub status: TaskStatus,
    /// Retryable failures it went through.
    pub failures: u32,
}

/// What a run achieved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Every task, in work-file order.
    pub tasks: Vec<TaskReport>,
    /// Locations retired during the run, in retirement order.
    pub retired_locations: Vec<String>,
    /// Locations whose own tasks did not all get a final outcome.
    pub incomplete_locations: Vec<String>,
}

impl RunSummary {
    pub fn succeeded(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Succeeded(_)))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Failed(_)))
            .count()
    }

    /// Tasks that never got a final outcome.
    pub fn unfinished(&self) -> impl Iterator<Item = &TaskReport> {
        self.tasks.iter().filter(|t| !t.status.is_final())
    }

    /// Whether every task succeeded or failed for good.
    pub fn is_complete(&self) -> bool {
        self.unfinished().next().is_none()
    }

    pub fn status(&self, task: &str) -> Option<&TaskStatus> {
        self.tasks.iter().find(|t| t.id == task).map(|t| &t.status)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tasks: {} succeeded, {} failed, {} not completed",
            self.tasks.len(),
            self.succeeded(),
            self.failed(),
            self.unfinished().count()
        )?;
        if !self.retired_locations.is_empty() {
            write!(f, "; retired: {}", self.retired_locations.join(", "))?;
        }
        if !self.incomplete_locations.is_empty() {
            write!(
                f,
                "; locations with unfinished work: {}",
                self.incomplete_locations.join(", ")
            )?;
        }
        Ok(())
    }
}

/// Schedules tasks onto proxies as the pool brings them online.
pub struct Dispatcher {
    tasks: Vec<TaskEntry>,
    locations: Vec<String>,
    executor: Arc<dyn TaskExecutor>,
    config: DispatchConfig,
    bindings: HashMap<String, Binding>,
    /// Idle leases kept while an eligible task runs elsewhere and may yet
    /// need a second home, as long as no queued location is waiting for
    /// the slot.
    parked: BTreeMap<String, ProxyLease>,
    attempts: FuturesUnordered<BoxFuture<'static, AttemptReport>>,
    retired: Vec<String>,
    released: HashSet<String>,
    stop_pool: CancellationToken,
    finished: bool,
}

impl Dispatcher {
    pub fn new(
        tasks: Vec<TaskSpec>,
        locations: &[Location],
        executor: Arc<dyn TaskExecutor>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            tasks: tasks
                .into_iter()
                .map(|spec| TaskEntry {
                    spec: Arc::new(spec),
                    status: TaskStatus::Pending,
                    failures: 0,
                })
                .collect(),
            locations: locations.iter().map(|l| l.name.clone()).collect(),
            executor,
            config,
            bindings: HashMap::new(),
            parked: BTreeMap::new(),
            attempts: FuturesUnordered::new(),
            retired: Vec::new(),
            released: HashSet::new(),
            stop_pool: CancellationToken::new(),
            finished: false,
        }
    }

    /// Consume pool events until the pool closes its channel. `stop_pool` is
    /// cancelled as soon as every task is settled.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<PoolEvent>,
        stop_pool: CancellationToken,
    ) -> RunSummary {
        self.stop_pool = stop_pool;
        info!(
            "Dispatching {} tasks over {} locations",
            self.tasks.len(),
            self.locations.len()
        );
        self.check_finished();

        let mut pool_open = true;
        loop {
            tokio::select! {
                event = events.recv(), if pool_open => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        debug!("Proxy pool closed its event channel");
                        pool_open = false;
                    }
                },
                Some(report) = self.attempts.next(), if !self.attempts.is_empty() => {
                    self.finish_attempt(report);
                }
                else => break,
            }
            self.check_finished();
        }

        for entry in &mut self.tasks {
            if entry.status == TaskStatus::Pending {
                entry.status = TaskStatus::Cancelled;
            }
        }
        let summary = self.summary();
        info!("Run finished: {}", summary);
        for task in summary.unfinished() {
            warn!("Task {} ({}) not completed", task.id, task.target);
        }
        summary
    }

    fn handle_event(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::Online(lease) => self.place(lease),
            PoolEvent::Offline { location, reason, ack } => self.proxy_offline(location, &reason, ack),
            PoolEvent::Retired { location, failures } => {
                warn!(
                    "Location {} retired after {} consecutive failures",
                    location, failures
                );
                if !self.retired.contains(&location) {
                    self.retired.push(location);
                }
                self.cancel_orphans();
            }
        }
    }

    /// Give `lease` work, park it, or hand it back to the pool.
    fn place(&mut self, lease: ProxyLease) {
        let name = lease.name().to_string();
        if self.finished || self.stop_pool.is_cancelled() {
            debug!("Releasing {}: no more dispatching", lease.label());
            return;
        }
        if let Some(index) = self.next_task(&name) {
            self.launch(index, lease);
        } else if self.eligible_running(&name) && !self.awaiting_admission(&name) {
            debug!("Parking {} while eligible tasks run elsewhere", lease.label());
            self.parked.insert(name, lease);
        } else {
            info!("No more work for {}; releasing it", lease.label());
            self.released.insert(name);
            lease.release();
        }
    }

    fn eligible_running(&self, location: &str) -> bool {
        self.tasks
            .iter()
            .any(|t| matches!(t.status, TaskStatus::Running { .. }) && t.spec.runs_on(location))
    }

    /// Whether some location other than `except`, holding no lease yet, has
    /// pending work. A parked lease would keep that location out of the pool.
    fn awaiting_admission(&self, except: &str) -> bool {
        self.locations
            .iter()
            .filter(|l| l.as_str() != except)
            .filter(|l| !self.bindings.contains_key(*l) && !self.parked.contains_key(*l))
            .filter(|l| !self.retired.contains(l) && !self.released.contains(*l))
            .any(|l| {
                self.tasks
                    .iter()
                    .any(|t| t.status == TaskStatus::Pending && t.spec.runs_on(l))
            })
    }

    /// Next pending task for `location`: its own tasks first, then any-location ones.
    fn next_task(&self, location: &str) -> Option<usize> {
        let pending = |t: &TaskEntry| t.status == TaskStatus::Pending;
        self.tasks
            .iter()
            .position(|t| pending(t) && matches!(&t.spec.target, TaskTarget::Location(name) if name == location))
            .or_else(|| {
                self.tasks
                    .iter()
                    .position(|t| pending(t) && t.spec.target == TaskTarget::Any)
            })
    }

    fn launch(&mut self, index: usize, lease: ProxyLease) {
        let location = lease.name().to_string();
        let entry = &mut self.tasks[index];
        entry.status = TaskStatus::Running {
            location: location.clone(),
        };
        info!("Task {} started on {}", entry.spec.id, lease.label());

        let cancel = CancellationToken::new();
        let executor = Arc::clone(&self.executor);
        let spec = Arc::clone(&entry.spec);
        let route = lease.route().clone();
        let token = cancel.clone();
        let name = location.clone();
        let attempt = tokio::spawn(async move { executor.execute(&spec, &name, &route, &token).await });

        let reported = location.clone();
        self.attempts.push(
            attempt
                .map(move |joined| {
                    let result = match joined {
                        Ok(result) => result,
                        Err(e) if e.is_cancelled() => TaskResult::Cancelled,
                        Err(e) => TaskResult::failure(TaskError::Crashed(e.to_string())),
                    };
                    AttemptReport {
                        location: reported,
                        result,
                    }
                })
                .boxed(),
        );
        self.bindings.insert(
            location,
            Binding {
                task: index,
                lease,
                cancel,
                offline_ack: None,
            },
        );
    }

    /// The proxy for `location` is going away. Its attempt is cancelled and
    /// the ack is held back until that attempt has returned.
    fn proxy_offline(&mut self, location: String, reason: &str, ack: oneshot::Sender<()>) {
        if self.parked.remove(&location).is_some() {
            debug!("Dropped parked lease for {}", location);
        }
        match self.bindings.get_mut(&location) {
            Some(binding) => {
                info!(
                    "Proxy {} offline ({}); cancelling task {}",
                    binding.lease.label(),
                    reason,
                    self.tasks[binding.task].spec.id
                );
                binding.cancel.cancel();
                binding.offline_ack = Some(ack);
            }
            None => {
                debug!("Proxy {} offline ({}); nothing bound", location, reason);
                let _ = ack.send(());
            }
        }
    }

    fn finish_attempt(&mut self, report: AttemptReport) {
        let Some(binding) = self.bindings.remove(&report.location) else {
            warn!("Attempt finished on {} without a binding", report.location);
            return;
        };
        let Binding {
            task: index,
            lease,
            offline_ack,
            ..
        } = binding;
        let offline = offline_ack.is_some();
        let mut lease = Some(lease);
        let location = report.location;
        let entry = &mut self.tasks[index];
        let id = entry.spec.id.clone();

        match report.result {
            TaskResult::Success(output) => {
                info!("Task {} succeeded on {} ({} bytes)", id, location, output.bytes);
                entry.status = TaskStatus::Succeeded(output);
                if let (false, Some(lease)) = (offline, &lease) {
                    lease.report_success();
                }
            }
            TaskResult::Failure {
                error,
                retryable: false,
            } => {
                warn!("Task {} failed on {}: {}", id, location, error);
                entry.status = TaskStatus::Failed(error.to_string());
            }
            TaskResult::Failure {
                error,
                retryable: true,
            } if offline => {
                info!("Task {} interrupted on {} ({}); requeued", id, location, error);
                entry.status = TaskStatus::Pending;
            }
            TaskResult::Failure {
                error,
                retryable: true,
            } => {
                entry.failures += 1;
                if entry.failures >= self.config.max_task_attempts {
                    warn!(
                        "Task {} failed on {} ({}); giving up after {} attempts",
                        id, location, error, entry.failures
                    );
                    entry.status = TaskStatus::Failed(format!(
                        "{error} (gave up after {} attempts)",
                        entry.failures
                    ));
                } else {
                    info!(
                        "Task {} failed on {} (attempt {}/{}): {}; requeued",
                        id, location, entry.failures, self.config.max_task_attempts, error
                    );
                    entry.status = TaskStatus::Pending;
                }
                if let Some(lease) = lease.take() {
                    lease.report_failure(error.to_string());
                }
            }
            TaskResult::Cancelled => {
                info!("Task {} cancelled on {}; requeued", id, location);
                entry.status = TaskStatus::Pending;
            }
        }

        match offline_ack {
            Some(ack) => {
                drop(lease);
                let _ = ack.send(());
            }
            None => {
                if let Some(lease) = lease {
                    self.place(lease);
                }
            }
        }
        self.cancel_orphans();
        self.revisit_parked();
    }

    /// Try parked leases again, now that task states have moved.
    fn revisit_parked(&mut self) {
        let names: Vec<String> = self.parked.keys().cloned().collect();
        for name in names {
            if let Some(lease) = self.parked.remove(&name) {
                self.place(lease);
            }
        }
    }

    /// Pending tasks that no usable location can run any more are cancelled.
    fn cancel_orphans(&mut self) {
        let usable: Vec<&String> = self
            .locations
            .iter()
            .filter(|l| !self.retired.contains(l) && !self.released.contains(*l))
            .collect();
        for entry in &mut self.tasks {
            if entry.status == TaskStatus::Pending && !usable.iter().any(|l| entry.spec.runs_on(l)) {
                warn!("Task {} has no usable location left", entry.spec.id);
                entry.status = TaskStatus::Cancelled;
            }
        }
    }

    fn check_finished(&mut self) {
        if self.finished || !self.tasks.iter().all(|t| t.status.is_terminal()) {
            return;
        }
        self.finished = true;
        info!("All tasks settled; stopping the proxy pool");
        self.parked.clear();
        self.stop_pool.cancel();
    }

    fn summary(&self) -> RunSummary {
        let tasks: Vec<TaskReport> = self
            .tasks
            .iter()
            .map(|entry| TaskReport {
                id: entry.spec.id.clone(),
                target: entry.spec.target.clone(),
                status: entry.status.clone(),
                failures: entry.failures,
            })
            .collect();

        let mut incomplete_locations: Vec<String> = tasks
            .iter()
            .filter(|t| !t.status.is_final())
            .filter_map(|t| match &t.target {
                TaskTarget::Location(name) => Some(name.clone()),
                TaskTarget::Any => None,
            })
            .collect();
        incomplete_locations.sort();
        incomplete_locations.dedup();

        RunSummary {
            tasks,
            retired_locations: self.retired.clone(),
            incomplete_locations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::task::JoinHandle;

    use crate::pool::LeaseSignal;
    use crate::proxy::Route;
    use crate::task::TaskOutput;

    #[derive(Debug, Clone, Copy)]
    enum Outcome {
        Ok,
        Retry,
        Fatal,
        Hang,
    }

    /// Executor that plays back per-task outcomes (default `Ok`) and reports
    /// every attempt it starts.
    struct Scripted {
        outcomes: Mutex<HashMap<String, VecDeque<Outcome>>>,
        started: mpsc::UnboundedSender<(String, String)>,
    }

    impl Scripted {
        fn new(outcomes: Vec<(&str, Vec<Outcome>)>) -> (Arc<Self>, mpsc::UnboundedReceiver<(String, String)>) {
            let (started, log) = mpsc::unbounded_channel();
            let outcomes = outcomes
                .into_iter()
                .map(|(id, seq)| (id.to_string(), VecDeque::from(seq)))
                .collect();
            let executor = Self {
                outcomes: Mutex::new(outcomes),
                started,
            };
            (Arc::new(executor), log)
        }
    }

    #[async_trait]
    impl TaskExecutor for Scripted {
        async fn execute(
            &self,
            task: &TaskSpec,
            location: &str,
            _route: &Route,
            cancel: &CancellationToken,
        ) -> TaskResult {
            let _ = self.started.send((task.id.clone(), location.to_string()));
            let outcome = self
                .outcomes
                .lock()
                .get_mut(&task.id)
                .and_then(|seq| seq.pop_front())
                .unwrap_or(Outcome::Ok);
            match outcome {
                Outcome::Ok => TaskResult::Success(TaskOutput {
                    path: None,
                    bytes: 3,
                }),
                Outcome::Retry => TaskResult::failure(TaskError::TimedOut(Duration::from_secs(1))),
                Outcome::Fatal => TaskResult::failure(TaskError::InvalidCommand("bad input".into())),
                Outcome::Hang => {
                    cancel.cancelled().await;
                    TaskResult::Cancelled
                }
            }
        }
    }

    fn lease(name: &str) -> (ProxyLease, mpsc::UnboundedReceiver<LeaseSignal>) {
        ProxyLease::new(Arc::new(Location::direct(name)), name.to_string(), Route::Direct)
    }

    fn any(id: &str) -> TaskSpec {
        TaskSpec::new(id, TaskTarget::Any, vec!["true"])
    }

    fn only(id: &str, location: &str) -> TaskSpec {
        TaskSpec::new(id, TaskTarget::Location(location.into()), vec!["true"])
    }

    struct Harness {
        events: mpsc::UnboundedSender<PoolEvent>,
        stop: CancellationToken,
        run: JoinHandle<RunSummary>,
    }

    fn start(tasks: Vec<TaskSpec>, names: &[&str], executor: Arc<Scripted>, max_attempts: u32) -> Harness {
        let locations: Vec<Location> = names.iter().map(|n| Location::direct(*n)).collect();
        let config = DispatchConfig::builder().max_task_attempts(max_attempts).build();
        let dispatcher = Dispatcher::new(tasks, &locations, executor, config);
        let (events, receiver) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let run = tokio::spawn(dispatcher.run(receiver, stop.clone()));
        Harness { events, stop, run }
    }

    async fn within<F: std::future::Future>(future: F) -> F::Output {
        tokio::time::timeout(Duration::from_secs(5), future)
            .await
            .expect("timed out")
    }

    impl Harness {
        async fn finish(self) -> RunSummary {
            within(self.stop.cancelled()).await;
            drop(self.events);
            within(self.run).await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_own_tasks_before_any_location_tasks() {
        let (executor, mut started) = Scripted::new(Vec::new());
        let h = start(vec![any("a1"), only("d1", "de")], &["de"], executor, 3);
        let (lease, mut signals) = lease("de");
        h.events.send(PoolEvent::Online(lease)).unwrap();

        let summary = h.finish().await;
        assert!(summary.is_complete());
        assert_eq!(summary.succeeded(), 2);
        assert_eq!(within(started.recv()).await.unwrap(), ("d1".into(), "de".into()));
        assert_eq!(within(started.recv()).await.unwrap(), ("a1".into(), "de".into()));

        assert!(matches!(signals.recv().await, Some(LeaseSignal::Success)));
        assert!(matches!(signals.recv().await, Some(LeaseSignal::Success)));
        // the lease was handed back
        assert!(signals.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_retryable_failure_reports_on_lease_and_requeues() {
        let (executor, _started) = Scripted::new(vec![("t1", vec![Outcome::Retry])]);
        let h = start(vec![any("t1")], &["us"], executor, 3);

        let (first, mut signals) = lease("us");
        h.events.send(PoolEvent::Online(first)).unwrap();
        assert!(matches!(within(signals.recv()).await, Some(LeaseSignal::Failure(_))));
        assert!(signals.recv().await.is_none());

        let (second, _signals) = lease("us");
        h.events.send(PoolEvent::Online(second)).unwrap();
        let summary = h.finish().await;
        assert!(matches!(summary.status("t1"), Some(TaskStatus::Succeeded(_))));
        assert_eq!(summary.tasks[0].failures, 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let (executor, _started) = Scripted::new(vec![("t1", vec![Outcome::Retry, Outcome::Retry])]);
        let h = start(vec![any("t1")], &["us"], executor, 2);

        for _ in 0..2 {
            let (lease, mut signals) = lease("us");
            h.events.send(PoolEvent::Online(lease)).unwrap();
            assert!(matches!(within(signals.recv()).await, Some(LeaseSignal::Failure(_))));
        }

        let summary = h.finish().await;
        assert!(matches!(summary.status("t1"), Some(TaskStatus::Failed(_))));
        assert!(summary.is_complete());
    }

    #[tokio::test]
    async fn test_non_retryable_failure_keeps_the_lease() {
        let (executor, _started) = Scripted::new(vec![("t1", vec![Outcome::Fatal])]);
        let h = start(vec![any("t1"), any("t2")], &["us"], executor, 3);
        let (lease, mut signals) = lease("us");
        h.events.send(PoolEvent::Online(lease)).unwrap();

        let summary = h.finish().await;
        assert!(matches!(summary.status("t1"), Some(TaskStatus::Failed(_))));
        assert!(matches!(summary.status("t2"), Some(TaskStatus::Succeeded(_))));
        assert!(matches!(signals.recv().await, Some(LeaseSignal::Success)));
        assert!(signals.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_offline_cancels_then_parked_lease_takes_over() {
        let (executor, mut started) = Scripted::new(vec![("t1", vec![Outcome::Hang])]);
        let h = start(vec![any("t1")], &["a", "b"], executor, 3);

        let (lease_a, _signals_a) = lease("a");
        h.events.send(PoolEvent::Online(lease_a)).unwrap();
        assert_eq!(within(started.recv()).await.unwrap(), ("t1".into(), "a".into()));

        // nothing pending, but t1 may still need b
        let (lease_b, mut signals_b) = lease("b");
        h.events.send(PoolEvent::Online(lease_b)).unwrap();

        let (ack, acked) = oneshot::channel();
        h.events
            .send(PoolEvent::Offline {
                location: "a".into(),
                reason: "tunnel dropped".into(),
                ack,
            })
            .unwrap();
        within(acked).await.unwrap();
        assert_eq!(within(started.recv()).await.unwrap(), ("t1".into(), "b".into()));

        let summary = h.finish().await;
        assert!(matches!(summary.status("t1"), Some(TaskStatus::Succeeded(_))));
        assert_eq!(summary.tasks[0].failures, 0);
        assert!(matches!(signals_b.recv().await, Some(LeaseSignal::Success)));
    }

    #[tokio::test]
    async fn test_idle_lease_released_while_another_location_waits() {
        let (executor, mut started) = Scripted::new(vec![("long", vec![Outcome::Hang])]);
        let h = start(vec![any("long"), only("onc", "c")], &["a", "b", "c"], executor, 3);

        let (lease_a, _signals_a) = lease("a");
        h.events.send(PoolEvent::Online(lease_a)).unwrap();
        assert_eq!(within(started.recv()).await.unwrap(), ("long".into(), "a".into()));

        // b has nothing to run while c still waits for a slot
        let (lease_b, mut signals_b) = lease("b");
        h.events.send(PoolEvent::Online(lease_b)).unwrap();
        assert!(within(signals_b.recv()).await.is_none());

        let (lease_c, _signals_c) = lease("c");
        h.events.send(PoolEvent::Online(lease_c)).unwrap();
        assert_eq!(within(started.recv()).await.unwrap(), ("onc".into(), "c".into()));

        // c has nothing left of its own and nobody is waiting, so it parks
        // and picks up `long` once a goes away
        let (ack, acked) = oneshot::channel();
        h.events
            .send(PoolEvent::Offline {
                location: "a".into(),
                reason: "tunnel dropped".into(),
                ack,
            })
            .unwrap();
        within(acked).await.unwrap();
        assert_eq!(within(started.recv()).await.unwrap(), ("long".into(), "c".into()));

        let summary = h.finish().await;
        assert!(summary.is_complete());
        assert_eq!(summary.succeeded(), 2);
    }

    #[tokio::test]
    async fn test_offline_without_binding_acks_at_once() {
        let (executor, _started) = Scripted::new(Vec::new());
        let h = start(vec![only("t1", "de")], &["de", "us"], executor, 3);
        let (ack, acked) = oneshot::channel();
        h.events
            .send(PoolEvent::Offline {
                location: "us".into(),
                reason: "gone".into(),
                ack,
            })
            .unwrap();
        within(acked).await.unwrap();
        drop(h.events);
        let summary = within(h.run).await.unwrap();
        assert_eq!(summary.status("t1"), Some(&TaskStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_retired_location_cancels_its_tasks() {
        let (executor, _started) = Scripted::new(Vec::new());
        let h = start(vec![only("d1", "de"), any("a1")], &["de", "us"], executor, 3);
        h.events
            .send(PoolEvent::Retired {
                location: "de".into(),
                failures: 3,
            })
            .unwrap();
        let (lease, _signals) = lease("us");
        h.events.send(PoolEvent::Online(lease)).unwrap();

        let summary = h.finish().await;
        assert_eq!(summary.status("d1"), Some(&TaskStatus::Cancelled));
        assert!(matches!(summary.status("a1"), Some(TaskStatus::Succeeded(_))));
        assert_eq!(summary.retired_locations, vec!["de"]);
        assert_eq!(summary.incomplete_locations, vec!["de"]);
        assert!(!summary.is_complete());
        assert!(summary.to_string().contains("retired: de"));
    }

    #[tokio::test]
    async fn test_closed_pool_cancels_pending_tasks() {
        let (executor, _started) = Scripted::new(Vec::new());
        let h = start(vec![any("t1")], &["us"], executor, 3);
        drop(h.events);
        let summary = within(h.run).await.unwrap();
        assert_eq!(summary.status("t1"), Some(&TaskStatus::Cancelled));
        assert!(!h.stop.is_cancelled());
    }

    #[tokio::test]
    async fn test_empty_work_stops_pool_at_once() {
        let (executor, _started) = Scripted::new(Vec::new());
        let h = start(Vec::new(), &["us"], executor, 3);
        let summary = h.finish().await;
        assert!(summary.is_complete());
        assert_eq!(summary.to_string(), "0 tasks: 0 succeeded, 0 failed, 0 not completed");
    }
}
