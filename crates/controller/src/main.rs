use anyhow::{Context, Result};
use clap::Parser;
use radload_core::report::{self, output_path, run_stamp, write_json};
use radload_core::{
    replay, save_csv, save_summary_csv, Config, LoadRunner, Overrides, ProfileReport,
    ProfileStep, RampController, RampPlanner, RampReport, RequestResult,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "radload-ramp")]
#[command(about = "RADIUS load ramp - steps the rate up until p95 latency breaks the SLO")]
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

    /// First ramp rate in requests per second (overrides config)
    #[arg(long)]
    start_rps: Option<u64>,

    /// Rate increase per ramp step (overrides config)
    #[arg(long)]
    step_rps: Option<u64>,

    /// Seconds to hold each ramp step (overrides config)
    #[arg(long = "step-duration")]
    step_duration_secs: Option<u64>,

    /// Last ramp rate in requests per second (overrides config)
    #[arg(long)]
    max_rps: Option<u64>,

    /// P95 latency SLO in milliseconds, fractions allowed (overrides config)
    #[arg(long)]
    slo_ms: Option<f64>,

    /// Replay the configured load profile instead of ramping
    #[arg(long)]
    profile: bool,

    /// Hourly profile CSV to replay (implies --profile)
    #[arg(long)]
    profile_csv: Option<PathBuf>,

    /// Only print the step schedule without running
    #[arg(long)]
    ramp_only: bool,

    /// Dry run: print what would be executed without sending traffic
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Serialize)]
struct RampSummary<'a> {
    timestamp: String,
    mode: &'a str,
    server: &'a str,
    workers: usize,
    ramp: &'a RampReport,
}

#[derive(Debug, Serialize)]
struct ProfileSummary<'a> {
    timestamp: String,
    mode: &'a str,
    server: &'a str,
    workers: usize,
    profile: &'a ProfileReport,
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
        server: args.server.clone(),
        secret: args.secret.clone(),
        workers: args.workers,
        start_rps: args.start_rps,
        step_rps: args.step_rps,
        step_duration_secs: args.step_duration_secs,
        max_rps: args.max_rps,
        slo_ms: args.slo_ms,
        ..Default::default()
    });
    config.validate().context("Invalid configuration")?;

    if let Some(path) = &args.profile_csv {
        config.profile.csv = Some(path.clone());
    }

    if args.profile || args.profile_csv.is_some() {
        run_profile(&args, &config).await
    } else {
        run_ramp(&args, &config).await
    }
}

async fn run_ramp(args: &Args, config: &Config) -> Result<()> {
    let mut controller =
        RampController::new(&config.ramp).context("Invalid [ramp] configuration")?;
    print_ramp_schedule(controller.planner(), config.ramp.slo_ms);

    if args.ramp_only {
        return Ok(());
    }
    if args.dry_run {
        print_dry_run(args, config);
        return Ok(());
    }

    let factory = config.client_factory(&args.mode)?;
    info!(
        "Ramping against {} in {} mode with {} workers",
        config.target.server,
        factory.name(),
        config.pool.workers
    );
    let mut runner = LoadRunner::new(factory, config.credentials.clone(), config.runner_settings());

    let stamp = run_stamp();
    let results_dir = config.output.results_dir.clone();
    let write_results = config.output.write_results;
    let ramp = controller
        .run(&mut runner, |outcome| {
            report::print_step_summary(&outcome.report);
            if write_results {
                let prefix = format!("ramp_step{}_{}rps", outcome.report.index, outcome.report.target_rps);
                save_step_results(&results_dir, &prefix, &stamp, &outcome.results);
            }
        })
        .await;

    let summary = RampSummary {
        timestamp: chrono::Utc::now().to_rfc3339(),
        mode: &args.mode,
        server: &config.target.server,
        workers: config.pool.workers,
        ramp: &ramp,
    };
    write_json(&output_path(&results_dir, "ramp", &stamp, "json"), &summary)?;

    report::print_ramp_summary(&ramp);
    Ok(())
}

async fn run_profile(args: &Args, config: &Config) -> Result<()> {
    let steps = config
        .profile
        .resolve()
        .context("Invalid [profile] configuration")?;
    print_profile_schedule(&steps);

    if args.ramp_only {
        return Ok(());
    }
    if args.dry_run {
        print_dry_run(args, config);
        return Ok(());
    }

    let factory = config.client_factory(&args.mode)?;
    info!(
        "Replaying {} profile steps against {} in {} mode",
        steps.len(),
        config.target.server,
        factory.name()
    );
    let mut runner = LoadRunner::new(factory, config.credentials.clone(), config.runner_settings());

    let stamp = run_stamp();
    let results_dir = config.output.results_dir.clone();
    let write_results = config.output.write_results;
    let profile = replay(&steps, &mut runner, |_, outcome| {
        report::print_step_summary(&outcome.report);
        if write_results {
            let prefix = format!("profile_step{}", outcome.report.index);
            save_step_results(&results_dir, &prefix, &stamp, &outcome.results);
        }
    })
    .await;

    let summary_csv = output_path(&results_dir, "profile_summary", &stamp, "csv");
    save_summary_csv(&summary_csv, &profile.rows)?;
    info!("Profile summary written to {}", summary_csv.display());

    let summary = ProfileSummary {
        timestamp: chrono::Utc::now().to_rfc3339(),
        mode: &args.mode,
        server: &config.target.server,
        workers: config.pool.workers,
        profile: &profile,
    };
    write_json(&output_path(&results_dir, "profile", &stamp, "json"), &summary)?;

    report::print_profile_summary(&profile);
    Ok(())
}

/// A failed export is logged; it does not abort the remaining steps.
fn save_step_results(dir: &Path, prefix: &str, stamp: &str, results: &[RequestResult]) {
    let path = output_path(dir, prefix, stamp, "csv");
    match save_csv(&path, results) {
        Ok(()) => info!("Step results written to {}", path.display()),
        Err(e) => warn!("Failed to write step results: {:#}", e),
    }
}

fn print_ramp_schedule(planner: &RampPlanner, slo_ms: f64) {
    println!("\n=== Ramp Schedule ===");
    println!("Total duration: {}ms", planner.total_duration_ms());
    println!("SLO (p95): {}ms", slo_ms);
    println!();

    for (idx, step) in planner.steps().iter().enumerate() {
        println!("Step {}: {} RPS for {}ms", idx, step.target_rps, step.duration_ms);
    }
    println!();
}

fn print_profile_schedule(steps: &[ProfileStep]) {
    let total_secs: u64 = steps.iter().map(|s| s.hold_secs).sum();
    println!("\n=== Profile Schedule ===");
    println!("Total duration: {}s", total_secs);
    println!();

    for (idx, step) in steps.iter().enumerate() {
        println!(
            "Step {} ({}): {} RPS for {}s",
            idx,
            step.label.as_deref().unwrap_or("-"),
            step.rps,
            step.hold_secs
        );
    }
    println!();
}

fn print_dry_run(args: &Args, config: &Config) {
    println!("\n=== Dry Run ===");
    println!("config: {:?}", args.config);
    println!("mode: {}", args.mode);
    println!("server: {}", config.target.server);
    println!("nas_identifier: {:?}", config.target.nas_identifier);
    println!(
        "workers: {} (queue capacity {})",
        config.pool.workers,
        config.pool.workers * config.pool.queue_factor
    );
    println!(
        "transport: timeout {}ms, {} retransmissions",
        config.target.timeout_ms, config.target.retries
    );
    println!(
        "retry: {} retries, {}ms backoff",
        config.retry.max_retries, config.retry.backoff_ms
    );
    println!("results dir: {:?}", config.output.results_dir);
    println!();
}
