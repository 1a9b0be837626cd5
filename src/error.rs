//! Error types for the vantage-dispatch crate.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// One malformed entry in a location or work file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    /// 1-based line number of the offending entry.
    pub line: usize,
    /// What is wrong with it.
    pub message: String,
}

impl ConfigIssue {
    pub(crate) fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

fn plural_suffix(issues: &[ConfigIssue]) -> &'static str {
    if issues.len() == 1 {
        "y"
    } else {
        "ies"
    }
}

fn render_issues(issues: &[ConfigIssue]) -> String {
    issues
        .iter()
        .map(|issue| format!("  {issue}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Error returned when a location or work file cannot be used.
///
/// `Invalid` carries every problem found, not just the first.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// One or more entries are malformed.
    #[error("{} malformed entr{}:\n{}", .issues.len(), plural_suffix(.issues), render_issues(.issues))]
    Invalid { issues: Vec<ConfigIssue> },
}

impl ConfigError {
    /// The individual issues, empty for read failures.
    pub fn issues(&self) -> &[ConfigIssue] {
        match self {
            Self::Invalid { issues } => issues,
            Self::Read { .. } => &[],
        }
    }
}

/// Failures of a location's tunnel. All of them count towards the
/// location's consecutive failures.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The helper process could not be launched at all.
    #[error("failed to spawn tunnel helper `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    /// The helper exited before announcing readiness.
    #[error("tunnel helper exited before becoming ready ({status})")]
    ExitedEarly { status: String },
    /// The helper did not announce readiness in time.
    #[error("tunnel not ready after {0:?}")]
    ReadyTimeout(Duration),
    /// The helper exited while the tunnel was online.
    #[error("tunnel dropped ({status})")]
    Dropped { status: String },
    /// The helper outlived its wall-clock budget.
    #[error("tunnel exceeded its lifetime of {0:?}")]
    LifetimeExceeded(Duration),
    /// A task routed through the tunnel failed at the network layer.
    #[error("task failure reported through tunnel: {0}")]
    TaskReported(String),
}

/// Failures of a single task attempt.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The command line is empty or otherwise unusable.
    #[error("invalid task command: {0}")]
    InvalidCommand(String),
    /// The task program could not be launched.
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    /// The task program exited unsuccessfully.
    #[error("task exited with {status}: {stderr}")]
    ExitStatus {
        status: String,
        code: Option<i32>,
        stderr: String,
    },
    /// The task ran past its wall-clock budget.
    #[error("task timed out after {0:?}")]
    TimedOut(Duration),
    /// The task ran past its CPU-time budget.
    #[error("task exceeded its CPU budget of {0:?}")]
    CpuExceeded(Duration),
    /// Capturing or committing the task output failed.
    #[error("task output error: {0}")]
    Output(#[from] std::io::Error),
    /// The executor itself panicked or was aborted mid-attempt.
    #[error("task attempt crashed: {0}")]
    Crashed(String),
}

impl TaskError {
    /// Whether another attempt could succeed. A command that cannot be
    /// launched will not launch on a different location either.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidCommand(_) | Self::Spawn { .. })
    }
}

/// Error logged when a location is retired after too many consecutive
/// failures. It never unwinds past the pool.
#[derive(Debug, Error)]
#[error("location {location} retired after {failures} consecutive failures")]
pub struct ExhaustedRetries {
    pub location: String,
    pub failures: u32,
}
