//! TwoPhase Simulator
//!
//! Runs bank transfers through the coordinator, either from a scenario or at random.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use rust_decimal::Decimal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use twophase_coordinator::CoordinatorConfig;

mod bank;
mod controller;
mod metrics;
mod scenario;

use controller::{SimulationController, SimulationSettings};
use scenario::Scenario;

/// TwoPhase Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "simulator")]
#[command(about = "Bank transfer simulator for the two-phase commit coordinator")]
struct Args {
    /// Number of simulated banks to create
    #[arg(short, long, default_value = "3")]
    banks: usize,

    /// Built-in scenario name or path to a scenario JSON file
    #[arg(short, long)]
    scenario: Option<String>,

    /// List built-in scenarios and exit
    #[arg(long)]
    list_scenarios: bool,

    /// Simulation speed multiplier
    #[arg(long, default_value = "1.0")]
    speed: f64,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Run duration in seconds (0 = until Ctrl+C)
    #[arg(long, default_value = "0")]
    duration: u64,

    /// Starting balance of every bank
    #[arg(long, default_value = "1000000")]
    initial_balance: String,

    /// Chance of a random fault per transfer in continuous mode
    #[arg(long, default_value = "0.05")]
    fault_rate: f64,

    /// Prepare timeout in milliseconds
    #[arg(long)]
    prepare_timeout_ms: Option<u64>,

    /// How long a bank waits for its account lock, in milliseconds
    #[arg(long, default_value = "200")]
    lock_timeout_ms: u64,

    /// Decision log file (a temp file is used when omitted)
    #[arg(long)]
    decision_log: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    /// Print coordinator counters in Prometheus text format on exit
    #[arg(long)]
    prometheus: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    if args.list_scenarios {
        for name in Scenario::names() {
            println!("{name}");
        }
        return Ok(());
    }

    let mut config = CoordinatorConfig::from_env();
    if let Some(ms) = args.prepare_timeout_ms {
        config.prepare_timeout = Duration::from_millis(ms);
    }
    if args.decision_log.is_some() {
        config.decision_log_path = args.decision_log.clone();
    }

    let initial_balance = Decimal::from_str_exact(&args.initial_balance)
        .with_context(|| format!("Invalid initial balance {}", args.initial_balance))?;

    info!("Starting TwoPhase Simulator");
    info!("Banks: {}", args.banks);
    info!("Speed: {}x", args.speed);

    let controller = SimulationController::new(SimulationSettings {
        bank_count: args.banks,
        speed: args.speed,
        seed: args.seed,
        initial_balance,
        lock_timeout: Duration::from_millis(args.lock_timeout_ms),
        fault_rate: args.fault_rate,
        coordinator: config,
    })?;

    let report = controller.initialize().await?;
    if report.total() > 0 {
        info!(
            committed = report.committed.len(),
            aborted = report.aborted.len(),
            incomplete = report.incomplete.len(),
            "Recovered transactions from decision log"
        );
    }

    info!("Simulator initialized with {} banks", args.banks);

    let outcome = if let Some(scenario_name) = &args.scenario {
        let scenario = Scenario::load(scenario_name)?;
        controller.run_scenario(scenario).await
    } else {
        info!("Running in continuous mode");
        info!("Press Ctrl+C to stop");

        let duration = if args.duration > 0 {
            Some(Duration::from_secs(args.duration))
        } else {
            None
        };

        controller.run(duration).await
    };

    controller.shutdown().await?;

    let metrics = controller.metrics().await;
    let coordinator = controller.coordinator_metrics().await;
    info!("Simulation complete");
    info!("Total transfers: {}", metrics.total_transfers);
    info!("Committed: {}", metrics.committed_transfers);
    info!("Aborted: {}", metrics.aborted_transfers);
    info!("Pending: {}", metrics.pending_transfers);
    info!("Commit rate: {:.1}%", metrics.commit_rate() * 100.0);
    info!(
        "Latency: avg {}ms, p50 {}ms, p99 {}ms",
        metrics.average_latency_ms(),
        metrics.p50_latency_ms(),
        metrics.p99_latency_ms()
    );
    info!(
        prepare_timeouts = coordinator.prepare_timeouts,
        prepare_rejections = coordinator.prepare_rejections,
        participant_retries = coordinator.participant_retries,
        commit_failures = coordinator.commit_failures,
        "Coordinator counters"
    );
    for (bank, balance) in controller.balances() {
        info!(bank = %bank, balance = %balance, "Final balance");
    }
    if args.prometheus {
        print!("{}", controller.coordinator().await.metrics().to_prometheus());
    }

    outcome
}
