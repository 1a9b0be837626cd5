//! Tasks: the work file, and running one task attempt through a proxy.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use tokio_util::sync::CancellationToken;

use crate::config::DispatchConfig;
use crate::error::{ConfigError, ConfigIssue, TaskError};
use crate::location::{Location, ALL_LOCATIONS};
use crate::process::{self, ProcessLimits, Supervised};
use crate::proxy::Route;
use crate::utils;

/// Where a task may run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskTarget {
    /// Any location.
    Any,
    /// Only the named location.
    Location(String),
}

impl TaskTarget {
    pub fn allows(&self, location: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Location(name) => name == location,
        }
    }
}

impl fmt::Display for TaskTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Location(name) => f.write_str(name),
        }
    }
}

/// One unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    /// Unique id; also names the output file.
    pub id: String,
    pub target: TaskTarget,
    /// Command line before routing. May contain `{location}`, `{task}` and
    /// `{output}` placeholders.
    pub command: Vec<String>,
}

impl TaskSpec {
    pub fn new(id: impl Into<String>, target: TaskTarget, command: Vec<impl Into<String>>) -> Self {
        Self {
            id: id.into(),
            target,
            command: command.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether this task may run on `location`.
    pub fn runs_on(&self, location: &str) -> bool {
        self.target.allows(location)
    }
}

/// What a successful attempt produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskOutput {
    /// Committed output file, if the executor writes one.
    pub path: Option<PathBuf>,
    /// Size of the output in bytes.
    pub bytes: usize,
}

/// Outcome of one task attempt.
#[derive(Debug)]
pub enum TaskResult {
    Success(TaskOutput),
    Failure { error: TaskError, retryable: bool },
    /// The attempt observed its cancellation token and stopped without
    /// committing anything.
    Cancelled,
}

impl TaskResult {
    /// Failure classified by [`TaskError::is_retryable`].
    pub fn failure(error: TaskError) -> Self {
        let retryable = error.is_retryable();
        Self::Failure { error, retryable }
    }
}

/// Where a task stands in the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running { location: String },
    Succeeded(TaskOutput),
    Failed(String),
    Cancelled,
}

impl TaskStatus {
    /// Succeeded, Failed or Cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded(_) | Self::Failed(_) | Self::Cancelled)
    }

    /// Succeeded or Failed: the task got an answer, one way or the other.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Succeeded(_) | Self::Failed(_))
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Running { location } => write!(f, "running on {location}"),
            Self::Succeeded(_) => f.write_str("succeeded"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            Self::Cancelled => f.write_str("not completed"),
        }
    }
}

/// Runs task attempts.
///
/// Implementations must return promptly once `cancel` fires, and must not
/// leave any process behind when they do.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(
        &self,
        task: &TaskSpec,
        location: &str,
        route: &Route,
        cancel: &CancellationToken,
    ) -> TaskResult;
}

/// Executor that runs the task's command line as a child process, routed
/// through the proxy, and commits its stdout to `<output_dir>/<task>.out`.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    output_dir: PathBuf,
    limits: ProcessLimits,
    permanent_exit_codes: Vec<i32>,
    kill_grace: Duration,
}

const STDERR_EXCERPT: usize = 512;

impl CommandExecutor {
    pub fn new(output_dir: impl Into<PathBuf>, config: &DispatchConfig) -> Self {
        Self {
            output_dir: output_dir.into(),
            limits: config.task_limits,
            permanent_exit_codes: config.permanent_exit_codes.clone(),
            kill_grace: config.kill_grace,
        }
    }

    /// Final location of `task`'s output.
    pub fn output_path(&self, task: &TaskSpec) -> PathBuf {
        self.output_dir.join(format!("{}.out", task.id))
    }

    /// The command line for `task` before routing.
    pub fn command_line(&self, task: &TaskSpec, location: &str) -> Vec<String> {
        let output = self.output_path(task);
        let output = output.to_string_lossy();
        let vars = [
            ("location", location),
            ("task", task.id.as_str()),
            ("output", output.as_ref()),
        ];
        task.command
            .iter()
            .map(|arg| utils::expand_placeholders(arg, &vars))
            .collect()
    }

    fn classify(&self, error: TaskError) -> TaskResult {
        match error {
            TaskError::ExitStatus { code: Some(code), .. } if self.permanent_exit_codes.contains(&code) => {
                TaskResult::Failure {
                    error,
                    retryable: false,
                }
            }
            error => TaskResult::failure(error),
        }
    }

    async fn run(
        &self,
        task: &TaskSpec,
        location: &str,
        route: &Route,
        cancel: &CancellationToken,
    ) -> Result<Option<TaskOutput>, TaskError> {
        let command = self.command_line(task, location);
        let Some(program) = command.first().cloned() else {
            return Err(TaskError::InvalidCommand(format!("task {} has an empty command", task.id)));
        };
        let argv = route.adjust_command(&command);
        debug!("Running task {} on {}: {}", task.id, location, argv.join(" "));

        let child = process::spawn(&argv, &self.limits, Stdio::piped())
            .map_err(|source| TaskError::Spawn { program, source })?;

        let output = match process::supervise(child, self.limits.wall, self.kill_grace, cancel).await? {
            Supervised::Cancelled => return Ok(None),
            Supervised::TimedOut => return Err(TaskError::TimedOut(self.limits.wall)),
            Supervised::Exited(output) => output,
        };

        if !output.status.success() {
            if process::cpu_exhausted(&output.status) {
                return Err(TaskError::CpuExceeded(self.limits.cpu.unwrap_or_default()));
            }
            return Err(TaskError::ExitStatus {
                status: output.status.to_string(),
                code: output.status.code(),
                stderr: stderr_excerpt(&output.stderr),
            });
        }

        let path = self.commit(task, location, &output.stdout).await?;
        Ok(Some(TaskOutput {
            path: Some(path),
            bytes: output.stdout.len(),
        }))
    }

    /// Write `data` next to its final path, then rename it into place.
    async fn commit(&self, task: &TaskSpec, location: &str, data: &[u8]) -> Result<PathBuf, TaskError> {
        let tmp = self.output_dir.join(format!("{}.{}.tmp", task.id, location));
        let path = self.output_path(task);
        tokio::fs::write(&tmp, data).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(path)
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn execute(
        &self,
        task: &TaskSpec,
        location: &str,
        route: &Route,
        cancel: &CancellationToken,
    ) -> TaskResult {
        match self.run(task, location, route, cancel).await {
            Ok(Some(output)) => TaskResult::Success(output),
            Ok(None) => TaskResult::Cancelled,
            Err(error) => self.classify(error),
        }
    }
}

fn stderr_excerpt(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let mut start = text.len().saturating_sub(STDERR_EXCERPT);
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

fn is_valid_task_id(id: &str) -> bool {
    !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

/// Read and parse a work file against the known locations.
pub fn load_work(path: &Path, locations: &[Location]) -> Result<Vec<TaskSpec>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_work(&content, locations)
}

/// Parse task descriptors, one per line: `task_id target command args...`.
///
/// `target` is `*` for any location, `all` for one copy of the task per
/// location (ids become `task_id@location`), or a location name.
pub fn parse_work(content: &str, locations: &[Location]) -> Result<Vec<TaskSpec>, ConfigError> {
    let known: HashSet<&str> = locations.iter().map(|l| l.name.as_str()).collect();
    let mut tasks = Vec::new();
    let mut issues = Vec::new();
    let mut seen = HashSet::new();

    for (line, fields) in utils::significant_lines(content) {
        let (id, target, command) = match fields.as_slice() {
            [id, target, command @ ..] if !command.is_empty() => (*id, *target, command),
            [id, ..] => {
                issues.push(ConfigIssue::new(line, format!("task `{id}` needs a target and a command")));
                continue;
            }
            [] => continue,
        };

        if !is_valid_task_id(id) {
            issues.push(ConfigIssue::new(line, format!("invalid task id `{id}`")));
            continue;
        }

        let expanded: Vec<TaskSpec> = match target {
            "*" => vec![TaskSpec::new(id, TaskTarget::Any, command.to_vec())],
            ALL_LOCATIONS => locations
                .iter()
                .map(|l| {
                    TaskSpec::new(
                        format!("{id}@{}", l.name),
                        TaskTarget::Location(l.name.clone()),
                        command.to_vec(),
                    )
                })
                .collect(),
            name if known.contains(name) => {
                vec![TaskSpec::new(id, TaskTarget::Location(name.to_string()), command.to_vec())]
            }
            name => {
                issues.push(ConfigIssue::new(line, format!("task `{id}` targets unknown location `{name}`")));
                continue;
            }
        };

        for task in expanded {
            if seen.insert(task.id.clone()) {
                tasks.push(task);
            } else {
                issues.push(ConfigIssue::new(line, format!("duplicate task id `{}`", task.id)));
            }
        }
    }

    if issues.is_empty() {
        info!("Loaded {} tasks", tasks.len());
        Ok(tasks)
    } else {
        Err(ConfigError::Invalid { issues })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn locations() -> Vec<Location> {
        vec![Location::direct("home"), Location::direct("de")]
    }

    fn sh(script: &str) -> TaskSpec {
        TaskSpec::new("t1", TaskTarget::Any, vec!["sh", "-c", script])
    }

    fn executor(dir: &Path) -> CommandExecutor {
        let config = DispatchConfig::builder()
            .task_limits(ProcessLimits::new(Duration::from_secs(10), None))
            .kill_grace(Duration::from_millis(200))
            .build();
        CommandExecutor::new(dir, &config)
    }

    #[test]
    fn test_parse_work_targets() {
        let text = "\
# id target command
fetch * curl -s https://example.org
trace all traceroute example.org
local de dig example.org
";
        let tasks = parse_work(text, &locations()).unwrap();
        let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["fetch", "trace@home", "trace@de", "local"]);
        assert_eq!(tasks[0].target, TaskTarget::Any);
        assert_eq!(tasks[2].target, TaskTarget::Location("de".into()));
        assert!(tasks[3].runs_on("de"));
        assert!(!tasks[3].runs_on("home"));
        assert_eq!(tasks[3].command, vec!["dig", "example.org"]);
    }

    #[test]
    fn test_parse_work_reports_every_problem() {
        let text = "\
a * true
a * true
b mars true
c *
.hidden * true
";
        let err = parse_work(text, &locations()).unwrap_err();
        let lines: Vec<usize> = err.issues().iter().map(|i| i.line).collect();
        assert_eq!(lines, vec![2, 3, 4, 5]);
        assert!(err.issues()[0].message.contains("duplicate"));
        assert!(err.issues()[1].message.contains("unknown location `mars`"));
    }

    #[test]
    fn test_load_work_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("work.txt");
        fs::write(&path, "t1 home echo hi\n").unwrap();
        let tasks = load_work(&path, &locations()).unwrap();
        assert_eq!(tasks.len(), 1);
    }

    #[test]
    fn test_command_line_placeholders() {
        let exec = executor(Path::new("/out"));
        let task = TaskSpec::new("t7", TaskTarget::Any, vec!["traceroute", "--from={location}", "{task}", "{output}"]);
        assert_eq!(
            exec.command_line(&task, "de"),
            vec!["traceroute", "--from=de", "t7", "/out/t7.out"]
        );
    }

    #[test]
    fn test_stderr_excerpt_keeps_tail() {
        let long = "x".repeat(2000) + "boom";
        let excerpt = stderr_excerpt(long.as_bytes());
        assert_eq!(excerpt.len(), STDERR_EXCERPT);
        assert!(excerpt.ends_with("boom"));
    }

    #[tokio::test]
    async fn test_success_commits_output() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let cancel = CancellationToken::new();
        let result = exec
            .execute(&sh("echo from {location}"), "de", &Route::Direct, &cancel)
            .await;
        match result {
            TaskResult::Success(output) => {
                let path = output.path.unwrap();
                assert_eq!(path, dir.path().join("t1.out"));
                assert_eq!(fs::read_to_string(&path).unwrap(), "from de\n");
                assert!(!dir.path().join("t1.de.tmp").exists());
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let result = exec
            .execute(&sh("echo broken >&2; exit 3"), "de", &Route::Direct, &CancellationToken::new())
            .await;
        match result {
            TaskResult::Failure {
                error: TaskError::ExitStatus { code, stderr, .. },
                retryable,
            } => {
                assert!(retryable);
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "broken");
            }
            other => panic!("expected retryable failure, got {other:?}"),
        }
        assert!(!dir.path().join("t1.out").exists());
    }

    #[tokio::test]
    async fn test_permanent_exit_code_is_final() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let result = exec
            .execute(&sh("exit 65"), "de", &Route::Direct, &CancellationToken::new())
            .await;
        assert!(matches!(result, TaskResult::Failure { retryable: false, .. }));
    }

    #[tokio::test]
    async fn test_spawn_failure_and_empty_command() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let cancel = CancellationToken::new();

        let missing = TaskSpec::new("t2", TaskTarget::Any, vec!["/nonexistent/program"]);
        let result = exec.execute(&missing, "de", &Route::Direct, &cancel).await;
        assert!(matches!(
            result,
            TaskResult::Failure { error: TaskError::Spawn { .. }, retryable: false }
        ));

        let empty = TaskSpec::new("t3", TaskTarget::Any, Vec::<String>::new());
        let result = exec.execute(&empty, "de", &Route::Direct, &cancel).await;
        assert!(matches!(
            result,
            TaskResult::Failure { error: TaskError::InvalidCommand(_), retryable: false }
        ));
    }

    #[tokio::test]
    async fn test_wall_budget_is_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let config = DispatchConfig::builder()
            .task_limits(ProcessLimits::new(Duration::from_millis(200), None))
            .build();
        let exec = CommandExecutor::new(dir.path(), &config);
        let result = exec
            .execute(&sh("exec sleep 30"), "de", &Route::Direct, &CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            TaskResult::Failure { error: TaskError::TimedOut(_), retryable: true }
        ));
    }

    #[tokio::test]
    async fn test_timed_out_task_leaves_no_background_work() {
        let dir = tempfile::tempdir().unwrap();
        let config = DispatchConfig::builder()
            .task_limits(ProcessLimits::new(Duration::from_millis(500), None))
            .build();
        let exec = CommandExecutor::new(dir.path(), &config);
        let marker = dir.path().join("alive");
        let script = format!("(sleep 2; touch '{}') & echo hi; sleep 30", marker.display());
        let result = exec
            .execute(&sh(&script), "de", &Route::Direct, &CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            TaskResult::Failure { error: TaskError::TimedOut(_), retryable: true }
        ));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_background_child_does_not_delay_success() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let result = exec
            .execute(&sh("sleep 30 & echo hi"), "de", &Route::Direct, &CancellationToken::new())
            .await;
        match result {
            TaskResult::Success(output) => {
                assert_eq!(fs::read_to_string(output.path.unwrap()).unwrap(), "hi\n");
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_attempt_commits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let result = exec
            .execute(&sh("echo partial; exec sleep 30"), "de", &Route::Direct, &cancel)
            .await;
        assert!(matches!(result, TaskResult::Cancelled));
        assert!(!dir.path().join("t1.out").exists());
    }

    #[tokio::test]
    async fn test_namespace_route_prefixes_command() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        // `env` stands in for the namespace-entry prefix
        let route = Route::Namespace {
            namespace: "ns_de".into(),
            prefix: vec!["env".into(), "ROUTED=ns_de".into()],
        };
        let result = exec
            .execute(&sh("echo $ROUTED"), "de", &route, &CancellationToken::new())
            .await;
        assert!(matches!(result, TaskResult::Success(_)));
        assert_eq!(fs::read_to_string(dir.path().join("t1.out")).unwrap(), "ns_de\n");
    }
}
