use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use crate::percentile::{as_ms, serialize_ms};
use crate::runner::{StepExecutor, StepOutcome, StepReport};

/// One fixed-duration interval at a constant target rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RampStep {
    /// Target requests per second
    pub target_rps: u64,
    /// How long to hold this rate in milliseconds
    pub duration_ms: u64,
}

impl RampStep {
    pub const fn new(target_rps: u64, duration_ms: u64) -> Self {
        Self {
            target_rps,
            duration_ms,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// Upper bound on the number of steps a ramp may expand to.
pub const MAX_RAMP_STEPS: u64 = 10_000;

/// `[ramp]` section: an arithmetic sequence of rates, gated by a P95 SLO.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RampConfig {
    #[serde(default = "default_start_rps")]
    pub start_rps: u64,
    #[serde(default = "default_step_rps")]
    pub step_rps: u64,
    #[serde(default = "default_step_duration_secs")]
    pub step_duration_secs: u64,
    #[serde(default = "default_max_rps")]
    pub max_rps: u64,
    /// P95 latency threshold in milliseconds, fractions allowed
    #[serde(default = "default_slo_ms")]
    pub slo_ms: f64,
}

fn default_start_rps() -> u64 {
    100
}

fn default_step_rps() -> u64 {
    100
}

fn default_step_duration_secs() -> u64 {
    60
}

fn default_max_rps() -> u64 {
    2000
}

fn default_slo_ms() -> f64 {
    200.0
}

impl Default for RampConfig {
    fn default() -> Self {
        Self {
            start_rps: default_start_rps(),
            step_rps: default_step_rps(),
            step_duration_secs: default_step_duration_secs(),
            max_rps: default_max_rps(),
            slo_ms: default_slo_ms(),
        }
    }
}

impl RampConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.start_rps == 0 {
            anyhow::bail!("ramp.start_rps must be greater than zero");
        }
        if self.step_rps == 0 {
            anyhow::bail!("ramp.step_rps must be greater than zero");
        }
        if self.step_duration_secs == 0 {
            anyhow::bail!("ramp.step_duration_secs must be greater than zero");
        }
        if self.start_rps > self.max_rps {
            anyhow::bail!(
                "ramp.start_rps ({}) exceeds ramp.max_rps ({})",
                self.start_rps,
                self.max_rps
            );
        }
        if self.step_count() > MAX_RAMP_STEPS {
            anyhow::bail!(
                "ramp from {} to {} by {} needs {} steps, at most {} allowed",
                self.start_rps,
                self.max_rps,
                self.step_rps,
                self.step_count(),
                MAX_RAMP_STEPS
            );
        }
        if !self.slo_ms.is_finite() || self.slo_ms < 0.0 {
            anyhow::bail!("ramp.slo_ms must be a non-negative number, got {}", self.slo_ms);
        }
        Ok(())
    }

    /// Number of steps from `start_rps` up to and including `max_rps`.
    pub fn step_count(&self) -> u64 {
        if self.step_rps == 0 || self.start_rps > self.max_rps {
            return 0;
        }
        (self.max_rps - self.start_rps) / self.step_rps + 1
    }

    /// The SLO rounded to whole nanoseconds. Invalid values map to zero.
    pub fn slo(&self) -> Duration {
        if !self.slo_ms.is_finite() || self.slo_ms <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_nanos((self.slo_ms * 1_000_000.0).round() as u64)
    }
}

/// Expands a [`RampConfig`] into its ordered steps.
#[derive(Debug, Clone)]
pub struct RampPlanner {
    steps: Vec<RampStep>,
}

impl RampPlanner {
    /// Expands at most [`MAX_RAMP_STEPS`] steps; an unvalidated config with
    /// a longer sequence is cut short.
    pub fn new(config: &RampConfig) -> Self {
        let duration_ms = config.step_duration_secs.saturating_mul(1000);
        let count = config.step_count().min(MAX_RAMP_STEPS);
        let steps = (0..count)
            .map(|k| RampStep::new(config.start_rps + k * config.step_rps, duration_ms))
            .collect();
        Self { steps }
    }

    /// Steps in the order they run.
    pub fn steps(&self) -> &[RampStep] {
        &self.steps
    }

    pub fn total_duration_ms(&self) -> u64 {
        self.steps.iter().map(|s| s.duration_ms).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    /// Every planned step ran without breaching the SLO.
    Completed,
    /// The step at `rps` had a P95 strictly above the SLO.
    SloViolated {
        rps: u64,
        #[serde(rename = "p95_ms", serialize_with = "serialize_ms")]
        p95: Duration,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampState {
    Idle,
    Stepping { rps: u64 },
    Evaluating { rps: u64 },
    Stopped(StopReason),
}

#[derive(Debug, Clone, Serialize)]
pub struct RampReport {
    #[serde(rename = "slo_ms", serialize_with = "serialize_ms")]
    pub slo: Duration,
    pub stop: StopReason,
    pub steps: Vec<StepReport>,
}

impl RampReport {
    /// Highest rate whose step stayed within the SLO.
    pub fn last_passing_rps(&self) -> Option<u64> {
        self.steps
            .iter()
            .filter(|s| s.latency.p95 <= self.slo)
            .map(|s| s.target_rps)
            .max()
    }
}

/// Steps load upward until a step's P95 breaches the SLO or the plan runs out.
pub struct RampController {
    planner: RampPlanner,
    slo: Duration,
    state: RampState,
}

impl RampController {
    pub fn new(config: &RampConfig) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self::with_planner(RampPlanner::new(config), config.slo()))
    }

    pub fn with_planner(planner: RampPlanner, slo: Duration) -> Self {
        Self {
            planner,
            slo,
            state: RampState::Idle,
        }
    }

    pub fn state(&self) -> RampState {
        self.state
    }

    pub fn planner(&self) -> &RampPlanner {
        &self.planner
    }

    /// Run the ramp. `on_step` sees every step's outcome before the SLO check.
    pub async fn run<E, F>(&mut self, executor: &mut E, mut on_step: F) -> RampReport
    where
        E: StepExecutor + ?Sized,
        F: FnMut(&StepOutcome),
    {
        let mut reports = Vec::with_capacity(self.planner.steps.len());
        let mut stop = StopReason::Completed;

        for (index, step) in self.planner.steps.iter().enumerate() {
            self.state = RampState::Stepping {
                rps: step.target_rps,
            };
            let outcome = executor.execute(index, step).await;

            self.state = RampState::Evaluating {
                rps: step.target_rps,
            };
            on_step(&outcome);
            let report = outcome.report;
            info!(
                step = index,
                target_rps = report.target_rps,
                effective_rps = report.effective_rps,
                sent = report.stats.sent,
                succeeded = report.stats.succeeded,
                p95_ms = as_ms(report.latency.p95),
                "Step complete"
            );

            let p95 = report.latency.p95;
            reports.push(report);
            if p95 > self.slo {
                warn!(
                    rps = step.target_rps,
                    p95_ms = as_ms(p95),
                    slo_ms = as_ms(self.slo),
                    "P95 above SLO, stopping ramp"
                );
                stop = StopReason::SloViolated {
                    rps: step.target_rps,
                    p95,
                };
                break;
            }
        }

        self.state = RampState::Stopped(stop);
        RampReport {
            slo: self.slo,
            stop,
            steps: reports,
        }
    }
}
