use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use log::{info, warn};

use vantage_dispatch::{
    load_locations, load_work, CommandExecutor, DispatchConfig, Job, JobReport, LocationSelection, PoolConfig,
    ProcessLimits,
};

#[derive(Parser)]
#[command(
    name = "vantage-dispatch",
    version,
    about = "Run a batch of tasks from many network vantage points at once"
)]
struct Cli {
    /// Location file: one `name direct` or `name ovpn <glob> [args...]` per line
    locations: PathBuf,
    /// Work file: one `task_id target command [args...]` per line
    work: PathBuf,
    /// Directory receiving one `<task_id>.out` per successful task
    output_dir: PathBuf,

    /// Maximum number of locations starting or online at once
    #[arg(short = 'j', long, default_value_t = 4)]
    max_proxies: usize,
    /// Consecutive failures after which a location is retired
    #[arg(long, default_value_t = 3)]
    max_failures: u32,
    /// Base restart delay in seconds, doubled per consecutive failure
    #[arg(long, default_value_t = 5)]
    backoff_base: u64,
    /// Restart delay cap in seconds
    #[arg(long, default_value_t = 300)]
    backoff_max: u64,
    /// Order in which waiting locations are started
    #[arg(long, value_enum, default_value_t = Selection::RoundRobin)]
    selection: Selection,
    /// Tunnel helper, run as `<helper> <namespace> <config> [args...]`
    #[arg(long, default_value = "openvpn-netns")]
    tunnel_helper: String,
    /// Seconds to wait for a tunnel to report readiness
    #[arg(long, default_value_t = 60)]
    ready_timeout: u64,
    /// Wall-clock lifetime of each tunnel helper, in seconds
    #[arg(long, default_value_t = 86_400)]
    tunnel_timeout: u64,
    /// CPU-time budget of each tunnel helper, in seconds
    #[arg(long, default_value_t = 3600)]
    tunnel_cpu: u64,
    /// Retryable failures after which a task is given up on
    #[arg(long, default_value_t = 3)]
    max_task_attempts: u32,
    /// Wall-clock budget of each task, in seconds
    #[arg(long, default_value_t = 600)]
    task_timeout: u64,
    /// CPU-time budget of each task, in seconds
    #[arg(long, default_value_t = 300)]
    task_cpu: u64,

    /// Log debug messages
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Selection {
    RoundRobin,
    Fifo,
    Random,
}

impl From<Selection> for LocationSelection {
    fn from(selection: Selection) -> Self {
        match selection {
            Selection::RoundRobin => Self::RoundRobin,
            Selection::Fifo => Self::Fifo,
            Selection::Random => Self::Random,
        }
    }
}

/// Load both files and build the job. Nothing is started yet.
fn prepare(cli: &Cli) -> Result<Job> {
    let locations = load_locations(&cli.locations)
        .with_context(|| format!("invalid location file {}", cli.locations.display()))?;
    let tasks = load_work(&cli.work, &locations)
        .with_context(|| format!("invalid work file {}", cli.work.display()))?;
    std::fs::create_dir_all(&cli.output_dir)
        .with_context(|| format!("cannot create output directory {}", cli.output_dir.display()))?;

    let pool_config = PoolConfig::builder()
        .max_simultaneous_proxies(cli.max_proxies)
        .max_failures(cli.max_failures)
        .backoff_base(Duration::from_secs(cli.backoff_base))
        .backoff_max(Duration::from_secs(cli.backoff_max))
        .selection(cli.selection.into())
        .tunnel_command(vec![cli.tunnel_helper.as_str(), "{namespace}", "{config}"])
        .tunnel_ready_timeout(Duration::from_secs(cli.ready_timeout))
        .tunnel_limits(ProcessLimits::new(
            Duration::from_secs(cli.tunnel_timeout),
            Some(Duration::from_secs(cli.tunnel_cpu)),
        ))
        .build();
    let dispatch_config = DispatchConfig::builder()
        .max_task_attempts(cli.max_task_attempts)
        .task_limits(ProcessLimits::new(
            Duration::from_secs(cli.task_timeout),
            Some(Duration::from_secs(cli.task_cpu)),
        ))
        .build();

    info!(
        "Loaded {} locations and {} tasks",
        locations.len(),
        tasks.len()
    );
    let executor = Arc::new(CommandExecutor::new(&cli.output_dir, &dispatch_config));
    Ok(Job::new(pool_config, dispatch_config, locations, tasks, executor))
}

fn print_report(report: &JobReport) {
    for task in report.summary.unfinished() {
        println!("not completed: {} ({})", task.id, task.target);
    }
    for location in &report.summary.incomplete_locations {
        println!("location {location} did not complete its work");
    }
    println!("{}", report.summary);
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    let job = match prepare(&cli) {
        Ok(job) => job,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::from(2);
        }
    };

    let shutdown = job.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; stopping every tunnel");
            shutdown.cancel();
        }
    });

    let report = job.run().await;
    print_report(&report);
    if report.is_complete() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}
