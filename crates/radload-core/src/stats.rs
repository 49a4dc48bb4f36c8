use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::results::Status;

/// Fixed latency buckets. A duration lands in the first bucket whose
/// boundary it is strictly below; everything else goes to `AtLeast1s`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LatencyBucket {
    Under10ms,
    Under50ms,
    Under100ms,
    Under200ms,
    Under500ms,
    Under1s,
    AtLeast1s,
}

impl LatencyBucket {
    pub const ALL: [LatencyBucket; 7] = [
        LatencyBucket::Under10ms,
        LatencyBucket::Under50ms,
        LatencyBucket::Under100ms,
        LatencyBucket::Under200ms,
        LatencyBucket::Under500ms,
        LatencyBucket::Under1s,
        LatencyBucket::AtLeast1s,
    ];

    const BOUNDS_MS: [u64; 6] = [10, 50, 100, 200, 500, 1000];

    pub fn classify(duration: Duration) -> Self {
        Self::BOUNDS_MS
            .iter()
            .position(|&bound| duration < Duration::from_millis(bound))
            .map(|idx| Self::ALL[idx])
            .unwrap_or(LatencyBucket::AtLeast1s)
    }

    pub fn label(self) -> &'static str {
        match self {
            LatencyBucket::Under10ms => "< 10ms",
            LatencyBucket::Under50ms => "< 50ms",
            LatencyBucket::Under100ms => "< 100ms",
            LatencyBucket::Under200ms => "< 200ms",
            LatencyBucket::Under500ms => "< 500ms",
            LatencyBucket::Under1s => "< 1s",
            LatencyBucket::AtLeast1s => ">= 1s",
        }
    }

    fn index(self) -> usize {
        match self {
            LatencyBucket::Under10ms => 0,
            LatencyBucket::Under50ms => 1,
            LatencyBucket::Under100ms => 2,
            LatencyBucket::Under200ms => 3,
            LatencyBucket::Under500ms => 4,
            LatencyBucket::Under1s => 5,
            LatencyBucket::AtLeast1s => 6,
        }
    }
}

/// Count per latency bucket, always holding every bucket in boundary order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketCounts([u64; 7]);

impl BucketCounts {
    pub fn record(&mut self, bucket: LatencyBucket) {
        self.0[bucket.index()] += 1;
    }

    pub fn get(&self, bucket: LatencyBucket) -> u64 {
        self.0[bucket.index()]
    }

    pub fn total(&self) -> u64 {
        self.0.iter().sum()
    }

    /// Share of all recorded samples in `bucket`, 0..=100. Zero when empty.
    pub fn percent(&self, bucket: LatencyBucket) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.get(bucket) as f64 / total as f64 * 100.0
    }

    pub fn iter(&self) -> impl Iterator<Item = (LatencyBucket, u64)> + '_ {
        LatencyBucket::ALL.iter().map(move |&b| (b, self.get(b)))
    }

    pub fn absorb(&mut self, other: &BucketCounts) {
        for (mine, theirs) in self.0.iter_mut().zip(other.0.iter()) {
            *mine += theirs;
        }
    }
}

#[derive(Serialize)]
struct BucketEntry {
    label: &'static str,
    count: u64,
    percent: f64,
}

impl Serialize for BucketCounts {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter().map(|(bucket, count)| BucketEntry {
            label: bucket.label(),
            count,
            percent: self.percent(bucket),
        }))
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub sent: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub no_reply: u64,
    pub retransmits: u64,
    pub buckets: BucketCounts,
}

impl StatsSnapshot {
    /// `sent == succeeded + failed + no_reply`
    pub fn is_balanced(&self) -> bool {
        self.sent == self.succeeded + self.failed + self.no_reply
    }

    pub fn success_rate(&self) -> f64 {
        if self.sent == 0 {
            return 0.0;
        }
        self.succeeded as f64 / self.sent as f64 * 100.0
    }

    /// Requests per second over `elapsed`.
    pub fn effective_rps(&self, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.sent as f64 / secs
    }

    /// Add another step's counters into this one.
    pub fn absorb(&mut self, other: &StatsSnapshot) {
        self.sent += other.sent;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.no_reply += other.no_reply;
        self.retransmits += other.retransmits;
        self.buckets.absorb(&other.buckets);
    }

    fn record(&mut self, status: Status, duration: Duration) {
        self.sent += 1;
        match status {
            Status::Succeeded => self.succeeded += 1,
            Status::NoReply => self.no_reply += 1,
            Status::Failed => self.failed += 1,
        }
        self.buckets.record(LatencyBucket::classify(duration));
    }
}

/// Shared counters updated by every worker of a step.
///
/// All updates go through one lock, so a snapshot never mixes state from
/// before and after a reset.
#[derive(Debug, Default)]
pub struct StatsAggregator {
    inner: Mutex<StatsSnapshot>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_outcome(&self, status: Status, duration: Duration) {
        self.inner.lock().record(status, duration);
    }

    pub fn record_retransmit(&self) {
        self.inner.lock().retransmits += 1;
    }

    pub fn reset(&self) {
        *self.inner.lock() = StatsSnapshot::default();
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.inner.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_bucket_boundaries_are_exclusive() {
        assert_eq!(
            LatencyBucket::classify(Duration::from_micros(9_999)),
            LatencyBucket::Under10ms
        );
        assert_eq!(
            LatencyBucket::classify(Duration::from_millis(10)),
            LatencyBucket::Under50ms
        );
        assert_eq!(
            LatencyBucket::classify(Duration::from_millis(199)),
            LatencyBucket::Under200ms
        );
        assert_eq!(
            LatencyBucket::classify(Duration::from_millis(999)),
            LatencyBucket::Under1s
        );
        assert_eq!(
            LatencyBucket::classify(Duration::from_secs(1)),
            LatencyBucket::AtLeast1s
        );
        assert_eq!(
            LatencyBucket::classify(Duration::from_secs(30)),
            LatencyBucket::AtLeast1s
        );
    }

    #[test]
    fn test_record_and_reset() {
        let stats = StatsAggregator::new();
        stats.record_outcome(Status::Succeeded, Duration::from_millis(5));
        stats.record_outcome(Status::NoReply, Duration::from_secs(5));
        stats.record_outcome(Status::Failed, Duration::from_millis(120));
        stats.record_retransmit();

        let snap = stats.snapshot();
        assert_eq!(snap.sent, 3);
        assert_eq!(snap.succeeded, 1);
        assert_eq!(snap.no_reply, 1);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.retransmits, 1);
        assert_eq!(snap.buckets.get(LatencyBucket::Under10ms), 1);
        assert_eq!(snap.buckets.get(LatencyBucket::Under200ms), 1);
        assert_eq!(snap.buckets.get(LatencyBucket::AtLeast1s), 1);
        assert!(snap.is_balanced());

        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_snapshot_json_lists_every_bucket() {
        let stats = StatsAggregator::new();
        stats.record_outcome(Status::Succeeded, Duration::from_millis(60));
        let json = serde_json::to_value(stats.snapshot()).unwrap();

        let buckets = json["buckets"].as_array().unwrap();
        assert_eq!(buckets.len(), 7);
        assert_eq!(buckets[2]["label"], "< 100ms");
        assert_eq!(buckets[2]["count"], 1);
        assert_eq!(buckets[2]["percent"], 100.0);
        assert_eq!(buckets[0]["percent"], 0.0);
    }

    #[test]
    fn test_bucket_percentages_in_json() {
        let stats = StatsAggregator::new();
        for ms in [1, 2, 3, 300] {
            stats.record_outcome(Status::Succeeded, Duration::from_millis(ms));
        }
        let snap = stats.snapshot();
        assert_eq!(snap.buckets.percent(LatencyBucket::Under10ms), 75.0);
        assert_eq!(snap.buckets.percent(LatencyBucket::Under500ms), 25.0);

        let json = serde_json::to_value(&snap.buckets).unwrap();
        let percents: Vec<f64> = json
            .as_array()
            .unwrap()
            .iter()
            .map(|entry| entry["percent"].as_f64().unwrap())
            .collect();
        assert_eq!(percents, vec![75.0, 0.0, 0.0, 0.0, 25.0, 0.0, 0.0]);

        let empty = serde_json::to_value(BucketCounts::default()).unwrap();
        assert!(empty
            .as_array()
            .unwrap()
            .iter()
            .all(|entry| entry["percent"] == 0.0));
    }

    #[test]
    fn test_effective_rps() {
        let snap = StatsSnapshot {
            sent: 500,
            succeeded: 500,
            ..Default::default()
        };
        assert!((snap.effective_rps(Duration::from_secs(5)) - 100.0).abs() < f64::EPSILON);
        assert_eq!(snap.effective_rps(Duration::ZERO), 0.0);
    }

    #[test]
    fn test_absorb_sums_steps() {
        let stats = StatsAggregator::new();
        stats.record_outcome(Status::Succeeded, Duration::from_millis(5));
        stats.record_retransmit();
        let first = stats.snapshot();

        stats.reset();
        stats.record_outcome(Status::Failed, Duration::from_millis(5));
        stats.record_outcome(Status::NoReply, Duration::from_secs(2));

        let mut totals = first.clone();
        totals.absorb(&stats.snapshot());
        assert_eq!(totals.sent, 3);
        assert_eq!(totals.retransmits, 1);
        assert!(totals.is_balanced());
        assert_eq!(totals.buckets.get(LatencyBucket::Under10ms), 2);
        assert_eq!(totals.buckets.total(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_stay_balanced() {
        let stats = Arc::new(StatsAggregator::new());
        let mut handles = Vec::new();
        for worker in 0..8u64 {
            let stats = stats.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..1000u64 {
                    let status = match (worker + i) % 3 {
                        0 => Status::Succeeded,
                        1 => Status::NoReply,
                        _ => Status::Failed,
                    };
                    stats.record_outcome(status, Duration::from_millis(i % 1200));
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let snap = stats.snapshot();
        assert_eq!(snap.sent, 8000);
        assert!(snap.is_balanced());
        assert_eq!(snap.buckets.total(), 8000);
    }

    proptest! {
        #[test]
        fn prop_accounting_is_exact(outcomes in proptest::collection::vec((0u8..3, 0u64..3000), 0..200)) {
            let stats = StatsAggregator::new();
            for (kind, ms) in &outcomes {
                let status = match kind {
                    0 => Status::Succeeded,
                    1 => Status::NoReply,
                    _ => Status::Failed,
                };
                stats.record_outcome(status, Duration::from_millis(*ms));
            }
            let snap = stats.snapshot();
            prop_assert_eq!(snap.sent, outcomes.len() as u64);
            prop_assert!(snap.is_balanced());
            prop_assert_eq!(snap.buckets.total(), snap.sent);
        }
    }
}
