//! Replay of a fixed load profile: an ordered list of rates, each held for a
//! set time, run back to back without any SLO gate.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::percentile::as_ms;
use crate::ramp::RampStep;
use crate::runner::{StepExecutor, StepOutcome, StepReport};
use crate::stats::StatsSnapshot;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileStep {
    /// Shown in logs and the summary CSV; defaults to the step index
    #[serde(default)]
    pub label: Option<String>,
    pub rps: u64,
    pub hold_secs: u64,
}

impl ProfileStep {
    pub fn ramp_step(&self) -> RampStep {
        RampStep::new(self.rps, self.hold_secs.saturating_mul(1000))
    }

    fn label_or(&self, index: usize) -> String {
        self.label.clone().unwrap_or_else(|| index.to_string())
    }
}

/// `[profile]` section. Steps come from `steps` or, when set, from `csv`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileConfig {
    #[serde(default)]
    pub steps: Vec<ProfileStep>,
    /// `hour,rps` CSV; each row becomes one step of `hold_secs`
    #[serde(default)]
    pub csv: Option<PathBuf>,
    #[serde(default = "default_hold_secs")]
    pub hold_secs: u64,
}

fn default_hold_secs() -> u64 {
    150
}

impl ProfileConfig {
    pub fn resolve(&self) -> Result<Vec<ProfileStep>> {
        let steps = match &self.csv {
            Some(path) => load_csv(path, self.hold_secs)?,
            None => self.steps.clone(),
        };
        if steps.is_empty() {
            anyhow::bail!("Load profile has no steps");
        }
        if let Some(step) = steps.iter().find(|s| s.hold_secs == 0) {
            anyhow::bail!(
                "Profile step {} has a zero hold time",
                step.label.as_deref().unwrap_or("?")
            );
        }
        Ok(steps)
    }
}

#[derive(Debug, Deserialize)]
struct HourlyRow {
    hour: u32,
    #[serde(alias = "rps_modified")]
    rps: f64,
}

/// Parse an hourly profile. Accepts an `rps` or `rps_modified` column;
/// fractional rates are truncated.
pub fn read_csv<R: Read>(reader: R, hold_secs: u64) -> Result<Vec<ProfileStep>> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut steps = Vec::new();
    for (line, row) in rdr.deserialize::<HourlyRow>().enumerate() {
        let row = row.with_context(|| format!("Invalid profile row {}", line + 1))?;
        if !row.rps.is_finite() || row.rps < 0.0 {
            anyhow::bail!("Profile row {} has an invalid rate: {}", line + 1, row.rps);
        }
        steps.push(ProfileStep {
            label: Some(format!("hour {:02}", row.hour)),
            rps: row.rps as u64,
            hold_secs,
        });
    }
    Ok(steps)
}

pub fn load_csv(path: impl AsRef<Path>, hold_secs: u64) -> Result<Vec<ProfileStep>> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open profile {:?}", path))?;
    read_csv(file, hold_secs).with_context(|| format!("Failed to parse profile {:?}", path))
}

/// One line of the profile summary CSV.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileRow {
    pub label: String,
    pub target_rps: u64,
    pub actual_rps: f64,
    pub sent: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub no_reply: u64,
    pub success_rate: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

impl ProfileRow {
    pub fn from_report(label: String, report: &StepReport) -> Self {
        Self {
            label,
            target_rps: report.target_rps,
            actual_rps: report.effective_rps,
            sent: report.stats.sent,
            succeeded: report.stats.succeeded,
            failed: report.stats.failed,
            no_reply: report.stats.no_reply,
            success_rate: report.stats.success_rate(),
            p95_ms: as_ms(report.latency.p95),
            p99_ms: as_ms(report.latency.p99),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileReport {
    pub rows: Vec<ProfileRow>,
    pub totals: StatsSnapshot,
    pub steps: Vec<StepReport>,
}

/// Run every step in order. `on_step` sees each outcome as it completes.
pub async fn replay<E, F>(steps: &[ProfileStep], executor: &mut E, mut on_step: F) -> ProfileReport
where
    E: StepExecutor + ?Sized,
    F: FnMut(&ProfileStep, &StepOutcome),
{
    let mut rows = Vec::with_capacity(steps.len());
    let mut reports = Vec::with_capacity(steps.len());
    let mut totals = StatsSnapshot::default();

    for (index, step) in steps.iter().enumerate() {
        let label = step.label_or(index);
        info!(step = index, label = %label, rps = step.rps, hold_secs = step.hold_secs, "Replaying profile step");

        let ramp_step = step.ramp_step();
        let outcome = executor.execute(index, &ramp_step).await;
        on_step(step, &outcome);

        let report = outcome.report;
        totals.absorb(&report.stats);
        let row = ProfileRow::from_report(label, &report);
        info!(
            label = %row.label,
            actual_rps = row.actual_rps,
            success_rate = row.success_rate,
            p95_ms = row.p95_ms,
            "Profile step complete"
        );
        rows.push(row);
        reports.push(report);
    }

    ProfileReport {
        rows,
        totals,
        steps: reports,
    }
}

pub fn write_summary_csv<W: Write>(writer: W, rows: &[ProfileRow]) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn save_summary_csv(path: impl AsRef<Path>, rows: &[ProfileRow]) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {:?}", parent))?;
    }
    let file = std::fs::File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
    write_summary_csv(file, rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MockClientFactory, MockOutcome};
    use crate::radius::Credentials;
    use crate::runner::{LoadRunner, RunnerSettings};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_read_hourly_csv() {
        let data = "hour, rps_modified\n0, 120.7\n1, 80\n13, 0\n";
        let steps = read_csv(data.as_bytes(), 30).unwrap();

        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].label.as_deref(), Some("hour 00"));
        assert_eq!(steps[0].rps, 120);
        assert_eq!(steps[1].rps, 80);
        assert_eq!(steps[2].label.as_deref(), Some("hour 13"));
        assert!(steps.iter().all(|s| s.hold_secs == 30));
    }

    #[test]
    fn test_read_csv_plain_rps_column() {
        let steps = read_csv("hour,rps\n5,40\n".as_bytes(), 10).unwrap();
        assert_eq!(steps[0].rps, 40);
        assert_eq!(steps[0].ramp_step(), RampStep::new(40, 10_000));
    }

    #[test]
    fn test_read_csv_rejects_bad_rows() {
        assert!(read_csv("hour,rps\nnoon,40\n".as_bytes(), 10).is_err());
        assert!(read_csv("hour,rps\n1,-5\n".as_bytes(), 10).is_err());
    }

    #[test]
    fn test_resolve_rejects_empty_profile() {
        let config = ProfileConfig::default();
        assert!(config.resolve().is_err());

        let config: ProfileConfig = toml::from_str(
            r#"
[[steps]]
label = "warmup"
rps = 10
hold_secs = 0
"#,
        )
        .unwrap();
        assert!(config.resolve().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_runs_every_step_without_gate() {
        let factory = MockClientFactory::new(Duration::from_millis(2))
            .with_script(vec![MockOutcome::Timeout])
            .with_fallback(MockOutcome::Reply);
        let mut runner = LoadRunner::new(
            Arc::new(factory),
            Credentials::new("testuser", "testpassword"),
            RunnerSettings {
                workers: 1,
                ..Default::default()
            },
        );
        let steps = vec![
            ProfileStep {
                label: Some("low".into()),
                rps: 10,
                hold_secs: 1,
            },
            ProfileStep {
                label: None,
                rps: 20,
                hold_secs: 1,
            },
        ];

        let mut seen = Vec::new();
        let report = replay(&steps, &mut runner, |step, outcome| {
            seen.push((step.rps, outcome.results.len()))
        })
        .await;

        assert_eq!(seen, vec![(10, 10), (20, 20)]);
        assert_eq!(report.rows[0].label, "low");
        assert_eq!(report.rows[1].label, "1");
        assert_eq!(report.totals.sent, 30);
        // the single worker's client is built per step, so each step sees one timeout
        assert_eq!(report.totals.no_reply, 2);
        assert!(report.totals.is_balanced());
    }

    #[test]
    fn test_summary_csv_header() {
        let row = ProfileRow {
            label: "hour 03".into(),
            target_rps: 100,
            actual_rps: 99.5,
            sent: 200,
            succeeded: 199,
            failed: 0,
            no_reply: 1,
            success_rate: 99.5,
            p95_ms: 12.0,
            p99_ms: 20.5,
        };
        let mut buf = Vec::new();
        write_summary_csv(&mut buf, &[row]).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("label,target_rps,actual_rps,sent,succeeded,failed,no_reply,success_rate,p95_ms,p99_ms")
        );
        assert_eq!(lines.next(), Some("hour 03,100,99.5,200,199,0,1,99.5,12.0,20.5"));
    }
}
