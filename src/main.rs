//! Reliability simulator.
//!
//! Drives a synthetic workload against simulated instances through a
//! [`ReliabilityManager`] and prints the resulting metrics as JSON.
//!
//! ```text
//! reliability-sim --config reliability.toml --requests 500 --failure-rate 0.3
//! ```

use clap::Parser;
use futures_util::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reliability_core::config::{load_config, ReliabilityConfig};
use reliability_core::lifecycle::signals;
use reliability_core::load_balancer::Instance;
use reliability_core::observability::{logging, metrics};
use reliability_core::{ClassifiedError, ErrorKind, Priority, ReliabilityManager};

#[derive(Parser)]
#[command(name = "reliability-sim")]
#[command(about = "Run a simulated workload through the reliability stack", long_about = None)]
struct Cli {
    /// TOML configuration file; defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long, default_value_t = 200)]
    requests: usize,

    #[arg(long, default_value_t = 8)]
    concurrency: usize,

    /// Probability that a simulated call fails
    #[arg(long, default_value_t = 0.2)]
    failure_rate: f64,

    /// Upper bound of the simulated call latency
    #[arg(long, default_value_t = 50)]
    max_latency_ms: u64,

    /// Simulated instances added when the configuration lists none
    #[arg(long, default_value_t = 3)]
    instances: u16,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ReliabilityConfig::default(),
    };
    logging::init_logging(&config.observability)?;

    tracing::info!(
        manager = %config.manager.name,
        requests = cli.requests,
        concurrency = cli.concurrency,
        failure_rate = cli.failure_rate,
        "reliability-sim starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let manager = Arc::new(ReliabilityManager::new(config)?);
    if let Some(lb) = manager.load_balancer() {
        if lb.instances().is_empty() {
            for n in 1..=cli.instances {
                lb.add_instance(Instance::new(format!("sim-{}", n), "127.0.0.1", 9000 + n));
            }
        }
        let flakiness = cli.failure_rate;
        lb.register_health_check("simulated", move |_instance| async move {
            Ok(fastrand::f64() >= flakiness / 2.0)
        });
    }
    manager.start();

    let workload = futures_util::stream::iter(0..cli.requests)
        .map(|i| simulate(&manager, &cli, i))
        .buffer_unordered(cli.concurrency.max(1))
        .collect::<Vec<_>>();

    tokio::select! {
        _ = workload => tracing::info!("Workload complete"),
        _ = signals::wait_for_termination() => tracing::warn!("Interrupted, stopping early"),
    }

    manager.evaluate_alerts();
    let report = serde_json::to_string_pretty(&manager.get_metrics())?;
    println!("{}", report);

    manager.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn simulate(manager: &ReliabilityManager, cli: &Cli, i: usize) {
    let priority = match i % 10 {
        0 => Priority::Critical,
        1 | 2 => Priority::High,
        9 => Priority::Low,
        _ => Priority::Normal,
    };
    let failure_rate = cli.failure_rate;
    let max_latency = cli.max_latency_ms.max(1);

    let result = manager
        .execute_with_fallback(
            priority,
            |instance| async move {
                tokio::time::sleep(Duration::from_millis(fastrand::u64(0..max_latency))).await;
                if fastrand::f64() < failure_rate {
                    let kind = match fastrand::u8(0..4) {
                        0 => ErrorKind::Timeout,
                        1 => ErrorKind::Network,
                        2 => ErrorKind::ServerError,
                        _ => ErrorKind::NonRetryable,
                    };
                    return Err(ClassifiedError::new(kind, "simulated failure"));
                }
                Ok(instance.map(|inst| inst.id).unwrap_or_else(|| "direct".to_string()))
            },
            || async { Ok::<_, reliability_core::BoxError>("fallback".to_string()) },
        )
        .await;

    match result {
        Ok(served_by) => tracing::debug!(request = i, served_by = %served_by, "Request served"),
        Err(e) => tracing::debug!(request = i, error = %e, "Request failed"),
    }
}
