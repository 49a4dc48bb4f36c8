use anyhow::{Context, Result};
use clap::Parser;
use radload_core::radius::Code;
use radload_core::{
    exchange_with_retry, Config, Overrides, ProtocolClient, RetryPolicy, UdpRadiusClient,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "radload-preflight")]
#[command(about = "Preflight check - sends Access-Requests to the configured RADIUS server")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config/example.local.toml")]
    config: PathBuf,

    /// RADIUS server host:port (overrides config)
    #[arg(long)]
    server: Option<String>,

    /// Shared secret (overrides config)
    #[arg(long)]
    secret: Option<String>,

    /// Number of probes to send
    #[arg(long, default_value_t = 1)]
    count: u32,
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
        ..Default::default()
    });
    config.validate().context("Invalid configuration")?;

    let settings = config.transport_settings();
    info!(
        "Probing {} (timeout {}ms, {} retransmissions)",
        settings.server, config.target.timeout_ms, settings.retries
    );

    let mut client = UdpRadiusClient::connect(
        Arc::new(settings),
        Arc::new(config.target.secret.clone()),
    )
    .await
    .with_context(|| format!("Failed to open a UDP client for {}", config.target.server))?;
    let policy = RetryPolicy::from_config(&config.retry);

    println!();
    println!("=== Preflight ({}) ===", config.target.server);
    println!("Client: {}", client.name());
    if let Ok(local) = client.local_addr() {
        println!("Local address: {local}");
    }
    println!("User: {}", config.credentials.username);

    let mut failures = 0u32;
    for probe in 0..args.count.max(1) {
        let start = Instant::now();
        let outcome = exchange_with_retry(&mut client, &config.credentials, &policy).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match &outcome.result {
            Ok(reply) => {
                println!(
                    "Probe {}: {} ({}ms, {} retries)",
                    probe,
                    describe(reply.code),
                    latency_ms,
                    outcome.retries
                );
                if reply.code == Code::AccessReject {
                    warn!("Server rejected the configured credentials");
                }
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                println!(
                    "Probe {}: {} ({}ms, {} retries): {}",
                    probe,
                    outcome.status().as_str(),
                    latency_ms,
                    outcome.retries,
                    e
                );
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("Preflight failed: {failures} probe(s) got no valid reply");
    }

    println!();
    println!("Preflight OK.");
    Ok(())
}

fn describe(code: Code) -> &'static str {
    match code {
        Code::AccessAccept => "Access-Accept",
        Code::AccessReject => "Access-Reject",
        Code::AccessChallenge => "Access-Challenge",
        Code::AccessRequest => "Access-Request",
    }
}
