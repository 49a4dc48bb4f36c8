use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::info;

use crate::client::{BoxFuture, ClientFactory};
use crate::dispatcher::{DispatchReport, Dispatcher};
use crate::percentile::{serialize_ms, LatencyProfile};
use crate::pool::{Sinks, WorkerPool};
use crate::radius::Credentials;
use crate::ramp::RampStep;
use crate::results::RequestResult;
use crate::retry::RetryPolicy;
use crate::stats::{StatsAggregator, StatsSnapshot};

/// Everything measured during one step.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub index: usize,
    pub target_rps: u64,
    pub duration_ms: u64,
    /// Dispatch plus drain, the wall clock the effective rate is measured over
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_ms")]
    pub elapsed: Duration,
    pub effective_rps: f64,
    pub stats: StatsSnapshot,
    pub latency: LatencyProfile,
    pub dispatch: DispatchReport,
}

#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub report: StepReport,
    /// Sorted by task id
    pub results: Vec<RequestResult>,
}

/// Runs one fixed-rate step to completion.
pub trait StepExecutor: Send {
    fn execute<'a>(&'a mut self, index: usize, step: &'a RampStep) -> BoxFuture<'a, StepOutcome>;
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub workers: usize,
    /// Queue capacity is `workers * queue_factor`
    pub queue_factor: usize,
    pub retry: RetryPolicy,
    /// Log a stats snapshot this often while a step runs
    pub progress_every: Option<Duration>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            workers: 50,
            queue_factor: 2,
            retry: RetryPolicy::none(),
            progress_every: None,
        }
    }
}

pub struct LoadRunner {
    factory: Arc<dyn ClientFactory>,
    credentials: Arc<Credentials>,
    settings: RunnerSettings,
    sinks: Sinks,
}

impl LoadRunner {
    pub fn new(
        factory: Arc<dyn ClientFactory>,
        credentials: Credentials,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            factory,
            credentials: Arc::new(credentials),
            settings,
            sinks: Sinks::new(),
        }
    }

    pub fn queue_capacity(&self) -> usize {
        (self.settings.workers * self.settings.queue_factor).max(1)
    }

    pub async fn run_step(&self, index: usize, step: &RampStep) -> StepOutcome {
        self.sinks.stats.reset();
        self.sinks.results.clear();

        let workers = self.settings.workers.max(1);
        let (tx, rx) = async_channel::bounded(self.queue_capacity());
        let pool = WorkerPool::spawn(
            workers,
            rx,
            self.factory.clone(),
            self.settings.retry.clone(),
            self.sinks.clone(),
        );
        let progress = self.settings.progress_every.map(|every| {
            tokio::spawn(log_progress(index, every, self.sinks.stats.clone()))
        });

        info!(
            step = index,
            target_rps = step.target_rps,
            duration_ms = step.duration_ms,
            workers,
            client = self.factory.name(),
            "Starting step"
        );

        let dispatcher = Dispatcher::new(step.target_rps, step.duration(), self.credentials.clone());
        let dispatch = dispatcher.run(&tx, workers).await;
        drop(tx);
        pool.join().await;
        let elapsed = dispatch.started_at.elapsed();

        if let Some(handle) = progress {
            handle.abort();
        }

        let stats = self.sinks.stats.snapshot();
        let results = self.sinks.results.take_sorted();
        let latency = LatencyProfile::from_results(&results);

        let report = StepReport {
            index,
            target_rps: step.target_rps,
            duration_ms: step.duration_ms,
            elapsed,
            effective_rps: stats.effective_rps(elapsed),
            stats,
            latency,
            dispatch,
        };
        StepOutcome { report, results }
    }
}

impl StepExecutor for LoadRunner {
    fn execute<'a>(&'a mut self, index: usize, step: &'a RampStep) -> BoxFuture<'a, StepOutcome> {
        Box::pin(self.run_step(index, step))
    }
}

async fn log_progress(step: usize, every: Duration, stats: Arc<StatsAggregator>) {
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let snap = stats.snapshot();
        info!(
            step,
            sent = snap.sent,
            succeeded = snap.succeeded,
            failed = snap.failed,
            no_reply = snap.no_reply,
            retransmits = snap.retransmits,
            "Progress"
        );
    }
}
