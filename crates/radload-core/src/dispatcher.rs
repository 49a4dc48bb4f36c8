use async_channel::Sender;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::percentile::serialize_ms;
use crate::radius::Credentials;

const NANOS_PER_SECOND: u128 = 1_000_000_000;

/// One exchange to perform.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: u64,
    pub credentials: Arc<Credentials>,
    /// When the dispatcher started submitting this task to the queue
    pub submitted_at: Instant,
}

/// Queue item: a task, or the signal for one worker to exit.
#[derive(Debug, Clone)]
pub enum Job {
    Exchange(Task),
    Shutdown,
}

/// Hands out task ids; concurrent callers never see the same id.
#[derive(Debug, Default)]
pub struct TaskSequence {
    next: AtomicU64,
}

impl TaskSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Absolute pacing: task `k` is due at `start + (k + 1) / rps`.
///
/// Every deadline is derived from the fixed start and the index in integer
/// nanoseconds, so sleep overshoot on one task never shifts later ones.
#[derive(Debug, Clone, Copy)]
pub struct PaceSchedule {
    start: Instant,
    rps: u64,
}

impl PaceSchedule {
    pub fn new(start: Instant, rps: u64) -> Self {
        Self { start, rps }
    }

    pub fn offset(&self, index: u64) -> Duration {
        if self.rps == 0 {
            return Duration::MAX;
        }
        let nanos = (index as u128 + 1) * NANOS_PER_SECOND / self.rps as u128;
        Duration::from_nanos(nanos as u64)
    }

    /// `None` when the rate is zero and no task is ever due.
    pub fn deadline(&self, index: u64) -> Option<Instant> {
        self.start.checked_add(self.offset(index))
    }
}

/// `floor(rps * duration)` using whole milliseconds.
pub fn planned_tasks(rps: u64, duration: Duration) -> u64 {
    (rps as u128 * duration.as_millis() / 1000) as u64
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    pub planned: u64,
    pub submitted: u64,
    /// The step ended (or the queue closed) before every planned task went out
    pub truncated: bool,
    #[serde(skip)]
    pub started_at: Instant,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_ms")]
    pub elapsed: Duration,
}

/// Produces the tasks of one step at a fixed rate into the bounded queue.
pub struct Dispatcher {
    target_rps: u64,
    duration: Duration,
    credentials: Arc<Credentials>,
    sequence: TaskSequence,
}

impl Dispatcher {
    pub fn new(target_rps: u64, duration: Duration, credentials: Arc<Credentials>) -> Self {
        Self {
            target_rps,
            duration,
            credentials,
            sequence: TaskSequence::new(),
        }
    }

    pub fn planned(&self) -> u64 {
        planned_tasks(self.target_rps, self.duration)
    }

    /// Submit every task of the step, then one shutdown per worker.
    ///
    /// `send` waits while the queue is full, which slows dispatch below the
    /// target rate instead of dropping work. Once the step end has passed, no
    /// further tasks are submitted.
    pub async fn run(&self, queue: &Sender<Job>, workers: usize) -> DispatchReport {
        let planned = self.planned();
        let started_at = Instant::now();
        let end = started_at + self.duration;
        let schedule = PaceSchedule::new(started_at, self.target_rps);

        let mut submitted = 0u64;
        let mut truncated = false;

        for index in 0..planned {
            if Instant::now() > end {
                warn!(
                    submitted,
                    planned, "Step duration elapsed, stopping dispatch early"
                );
                truncated = true;
                break;
            }

            if let Some(deadline) = schedule.deadline(index) {
                sleep_until(deadline).await;
            }

            let task = Task {
                id: self.sequence.next_id(),
                credentials: self.credentials.clone(),
                submitted_at: Instant::now(),
            };
            if queue.send(Job::Exchange(task)).await.is_err() {
                warn!(submitted, "Task queue closed, stopping dispatch");
                truncated = true;
                break;
            }
            submitted += 1;
        }

        for _ in 0..workers {
            if queue.send(Job::Shutdown).await.is_err() {
                break;
            }
        }

        let elapsed = started_at.elapsed();
        debug!(
            submitted,
            planned,
            elapsed_ms = elapsed.as_millis() as u64,
            "Dispatch finished"
        );

        DispatchReport {
            planned,
            submitted,
            truncated,
            started_at,
            elapsed,
        }
    }
}
