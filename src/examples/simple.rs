//! Simple example of using vantage-dispatch with direct locations.

use std::sync::Arc;
use std::time::Duration;

use vantage_dispatch::{
    CommandExecutor, DispatchConfig, Job, Location, LocationSelection, PoolConfig, TaskSpec, TaskTarget,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("Preparing locations...");

    // direct locations need no tunnel helper, so this runs anywhere
    let locations = vec![
        Location::direct("home"),
        Location::direct("lab"),
        Location::direct("office"),
    ];
    let tasks = vec![
        TaskSpec::new("hello", TaskTarget::Any, vec!["echo", "hello from {location}"]),
        TaskSpec::new("uname", TaskTarget::Location("lab".into()), vec!["uname", "-a"]),
        TaskSpec::new("date", TaskTarget::Any, vec!["date", "-u"]),
    ];

    let pool_config = PoolConfig::builder()
        .max_simultaneous_proxies(2)
        .selection(LocationSelection::RoundRobin)
        .backoff_base(Duration::from_millis(200))
        .build();
    let dispatch_config = DispatchConfig::default();

    let output_dir = std::env::temp_dir().join("vantage-dispatch-simple");
    std::fs::create_dir_all(&output_dir)?;
    let executor = Arc::new(CommandExecutor::new(&output_dir, &dispatch_config));

    println!("Running {} tasks...", tasks.len());
    let report = Job::new(pool_config, dispatch_config, locations, tasks, executor).run().await;

    println!("Summary: {}", report.summary);
    for task in &report.summary.tasks {
        println!("  {} -> {}", task.id, task.status);
    }
    println!("Output written to {}", output_dir.display());

    Ok(())
}
