use async_channel::Receiver;
use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::client::{exchange_with_retry, ClientFactory, ProtocolClient};
use crate::dispatcher::{Job, Task};
use crate::results::{RequestResult, ResultLog, Status};
use crate::retry::RetryPolicy;
use crate::stats::StatsAggregator;

/// Where workers report: the step's counters and its result log.
#[derive(Clone)]
pub struct Sinks {
    pub stats: Arc<StatsAggregator>,
    pub results: Arc<ResultLog>,
}

impl Sinks {
    pub fn new() -> Self {
        Self {
            stats: Arc::new(StatsAggregator::new()),
            results: Arc::new(ResultLog::new()),
        }
    }

    /// Record the single terminal outcome of a task.
    fn complete(&self, result: RequestResult) {
        self.stats.record_outcome(result.status, result.duration);
        self.results.push(result);
    }
}

impl Default for Sinks {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub worker: usize,
    pub completed: u64,
}

/// Fixed set of workers draining one shared queue.
pub struct WorkerPool {
    handles: Vec<JoinHandle<WorkerReport>>,
}

impl WorkerPool {
    pub fn spawn(
        size: usize,
        queue: Receiver<Job>,
        factory: Arc<dyn ClientFactory>,
        policy: RetryPolicy,
        sinks: Sinks,
    ) -> Self {
        let handles = (0..size)
            .map(|worker| {
                let queue = queue.clone();
                let factory = factory.clone();
                let policy = policy.clone();
                let sinks = sinks.clone();
                tokio::spawn(async move { run_worker(worker, queue, factory, policy, sinks).await })
            })
            .collect();
        Self { handles }
    }

    /// Wait for every worker to take its shutdown and exit.
    pub async fn join(self) -> Vec<WorkerReport> {
        let mut reports = Vec::with_capacity(self.handles.len());
        for (worker, handle) in self.handles.into_iter().enumerate() {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(e) => error!(worker, error = %e, "Worker task did not complete"),
            }
        }
        reports
    }
}

async fn run_worker(
    worker: usize,
    queue: Receiver<Job>,
    factory: Arc<dyn ClientFactory>,
    policy: RetryPolicy,
    sinks: Sinks,
) -> WorkerReport {
    let mut client = match factory.connect(worker).await {
        Ok(client) => Some(client),
        Err(e) => {
            warn!(worker, error = %e, "Client setup failed, tasks will be recorded as failed");
            None
        }
    };

    let mut completed = 0u64;
    while let Ok(job) = queue.recv().await {
        let task = match job {
            Job::Exchange(task) => task,
            Job::Shutdown => break,
        };

        let result = match client.as_deref_mut() {
            Some(client) => execute(client, &task, &policy, &sinks).await,
            None => RequestResult {
                id: task.id,
                status: Status::Failed,
                started_at: Utc::now(),
                duration: std::time::Duration::ZERO,
            },
        };
        sinks.complete(result);
        completed += 1;
    }

    debug!(worker, completed, "Worker exiting");
    WorkerReport { worker, completed }
}

async fn execute(
    client: &mut dyn ProtocolClient,
    task: &Task,
    policy: &RetryPolicy,
    sinks: &Sinks,
) -> RequestResult {
    let started_at = Utc::now();
    let start = Instant::now();

    let outcome = exchange_with_retry(client, &task.credentials, policy).await;
    for _ in 0..outcome.retries {
        sinks.stats.record_retransmit();
    }
    if let Err(e) = &outcome.result {
        debug!(id = task.id, retries = outcome.retries, error = %e, "Exchange did not succeed");
    }

    RequestResult {
        id: task.id,
        status: outcome.status(),
        started_at,
        duration: start.elapsed(),
    }
}
