//! Console and file summaries shared by the binaries.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::percentile::as_ms;
use crate::profile::ProfileReport;
use crate::ramp::{RampReport, StopReason};
use crate::runner::StepReport;
use crate::stats::{BucketCounts, StatsSnapshot};

/// Timestamp used to name the files of one run.
pub fn run_stamp() -> String {
    chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

pub fn output_path(dir: &Path, prefix: &str, stamp: &str, extension: &str) -> PathBuf {
    dir.join(format!("{prefix}_{stamp}.{extension}"))
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {:?}", parent))?;
    }
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {:?}", path))?;
    info!("Summary written to {}", path.display());
    Ok(())
}

/// `"< 50ms: 12 (24.0%)"`, one line per bucket.
pub fn bucket_lines(buckets: &BucketCounts) -> Vec<String> {
    buckets
        .iter()
        .map(|(bucket, count)| {
            format!("{}: {} ({:.1}%)", bucket.label(), count, buckets.percent(bucket))
        })
        .collect()
}

fn print_counters(stats: &StatsSnapshot) {
    println!("Sent: {}", stats.sent);
    println!("Succeeded: {}", stats.succeeded);
    println!("Failed: {}", stats.failed);
    println!("No reply: {}", stats.no_reply);
    println!("Retransmits: {}", stats.retransmits);
    println!("Success rate: {:.2}%", stats.success_rate());
}

pub fn print_step_summary(report: &StepReport) {
    println!(
        "\n=== Step {} ({} RPS for {}ms) ===",
        report.index, report.target_rps, report.duration_ms
    );
    print_counters(&report.stats);
    println!(
        "Effective rate: {:.1} RPS over {:.0}ms",
        report.effective_rps,
        as_ms(report.elapsed)
    );
    if report.dispatch.truncated {
        println!(
            "Dispatch truncated: {}/{} tasks submitted",
            report.dispatch.submitted, report.dispatch.planned
        );
    }
    println!("Latency distribution:");
    for line in bucket_lines(&report.stats.buckets) {
        println!("  {line}");
    }
    println!(
        "Latency p50/p95/p99: {:.1}ms / {:.1}ms / {:.1}ms",
        as_ms(report.latency.p50),
        as_ms(report.latency.p95),
        as_ms(report.latency.p99)
    );
    println!();
}

pub fn stop_description(stop: &StopReason) -> String {
    match stop {
        StopReason::Completed => "completed all steps".to_string(),
        StopReason::SloViolated { rps, p95 } => {
            format!("SLO violated at {} RPS (p95 {:.1}ms)", rps, as_ms(*p95))
        }
    }
}

pub fn print_ramp_summary(report: &RampReport) {
    println!("\n=== Ramp Results ===");
    println!("SLO (p95): {:.0}ms", as_ms(report.slo));
    println!("Steps run: {}", report.steps.len());
    println!("Stopped: {}", stop_description(&report.stop));
    match report.last_passing_rps() {
        Some(rps) => println!("Highest rate within SLO: {} RPS", rps),
        None => println!("No step stayed within the SLO"),
    }
    println!();
    for step in &report.steps {
        println!(
            "Step {}: {} RPS -> {:.1} RPS, p95 {:.1}ms, success {:.2}%",
            step.index,
            step.target_rps,
            step.effective_rps,
            as_ms(step.latency.p95),
            step.stats.success_rate()
        );
    }
    println!();
}

pub fn print_profile_summary(report: &ProfileReport) {
    println!("\n=== Profile Replay ({} steps) ===", report.rows.len());
    for row in &report.rows {
        println!(
            "{}: {} RPS -> {:.1} RPS, sent {}, success {:.2}%, p95 {:.1}ms, p99 {:.1}ms",
            row.label,
            row.target_rps,
            row.actual_rps,
            row.sent,
            row.success_rate,
            row.p95_ms,
            row.p99_ms
        );
    }
    println!("\nTotals:");
    print_counters(&report.totals);
    println!();
}
