use anyhow::{Context, Result};
use clap::Parser;
use radload_core::report::{self, output_path, run_stamp, write_json};
use radload_core::{save_csv, Config, LoadRunner, Overrides, StepReport};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "radload-run")]
#[command(about = "Fixed-rate RADIUS load run - paces Access-Requests and records every outcome")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config/example.local.toml")]
    config: PathBuf,

    /// Client mode: mock or udp
    #[arg(long, default_value = "mock")]
    mode: String,

    /// RADIUS server host:port (overrides config)
    #[arg(long)]
    server: Option<String>,

    /// Shared secret (overrides config)
    #[arg(long)]
    secret: Option<String>,

    /// Number of workers (overrides config)
    #[arg(long)]
    workers: Option<usize>,

    /// Target requests per second (overrides config)
    #[arg(long)]
    rps: Option<u64>,

    /// Run duration in seconds (overrides config)
    #[arg(long)]
    duration: Option<u64>,
}

#[derive(Debug, Serialize)]
struct RunSummary<'a> {
    timestamp: String,
    mode: &'a str,
    server: &'a str,
    workers: usize,
    step: &'a StepReport,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    config.apply_overrides(&Overrides {
        server: args.server,
        secret: args.secret,
        workers: args.workers,
        rps: args.rps,
        duration_secs: args.duration,
        ..Default::default()
    });
    config.validate().context("Invalid configuration")?;

    let step = config.run.step();
    if step.target_rps == 0 || step.duration_ms == 0 {
        anyhow::bail!("run.rps and run.duration_secs must both be greater than zero");
    }

    let factory = config.client_factory(&args.mode)?;
    info!(
        "Starting {} RPS for {}s against {} in {} mode with {} workers",
        step.target_rps,
        config.run.duration_secs,
        config.target.server,
        factory.name(),
        config.pool.workers
    );

    let runner = LoadRunner::new(
        factory,
        config.credentials.clone(),
        config.runner_settings(),
    );
    let outcome = runner.run_step(0, &step).await;

    let stamp = run_stamp();
    let results_dir = &config.output.results_dir;
    if config.output.write_results {
        let csv_path = output_path(results_dir, "run_results", &stamp, "csv");
        save_csv(&csv_path, &outcome.results)?;
        info!("Per-request results written to {}", csv_path.display());
    }

    let summary = RunSummary {
        timestamp: chrono::Utc::now().to_rfc3339(),
        mode: &args.mode,
        server: &config.target.server,
        workers: config.pool.workers,
        step: &outcome.report,
    };
    write_json(&output_path(results_dir, "run", &stamp, "json"), &summary)?;

    report::print_step_summary(&outcome.report);
    Ok(())
}
