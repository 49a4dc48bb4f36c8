//! Nearest-rank latency percentiles over a completed step.

use serde::Serialize;
use std::time::Duration;

use crate::results::RequestResult;
use crate::stats::{BucketCounts, LatencyBucket};

/// Zero-based index of the nearest-rank percentile `p` (in percent) in a
/// sorted sample of `count` values: `ceil(p * count / 100) - 1`, floored at 0.
pub fn nearest_rank_index(count: usize, p: u64) -> usize {
    let rank = (p as u128 * count as u128).div_ceil(100) as usize;
    rank.saturating_sub(1).min(count.saturating_sub(1))
}

/// Percentile of an ascending sample. An empty sample yields zero.
pub fn percentile_sorted(sorted: &[Duration], p: u64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    sorted[nearest_rank_index(sorted.len(), p)]
}

pub fn percentile(durations: impl IntoIterator<Item = Duration>, p: u64) -> Duration {
    let mut sorted: Vec<Duration> = durations.into_iter().collect();
    sorted.sort_unstable();
    percentile_sorted(&sorted, p)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencyProfile {
    pub count: usize,
    #[serde(rename = "min_ms", serialize_with = "serialize_ms")]
    pub min: Duration,
    #[serde(rename = "max_ms", serialize_with = "serialize_ms")]
    pub max: Duration,
    #[serde(rename = "mean_ms", serialize_with = "serialize_ms")]
    pub mean: Duration,
    #[serde(rename = "p50_ms", serialize_with = "serialize_ms")]
    pub p50: Duration,
    #[serde(rename = "p95_ms", serialize_with = "serialize_ms")]
    pub p95: Duration,
    #[serde(rename = "p99_ms", serialize_with = "serialize_ms")]
    pub p99: Duration,
    pub buckets: BucketCounts,
}

impl LatencyProfile {
    pub fn from_results(results: &[RequestResult]) -> Self {
        Self::from_durations(results.iter().map(|r| r.duration))
    }

    pub fn from_durations(durations: impl IntoIterator<Item = Duration>) -> Self {
        let mut sorted: Vec<Duration> = durations.into_iter().collect();
        if sorted.is_empty() {
            return Self::default();
        }
        sorted.sort_unstable();

        let mut buckets = BucketCounts::default();
        for d in &sorted {
            buckets.record(LatencyBucket::classify(*d));
        }

        let count = sorted.len();
        let total_nanos: u128 = sorted.iter().map(|d| d.as_nanos()).sum();
        Self {
            count,
            min: sorted[0],
            max: sorted[count - 1],
            mean: Duration::from_nanos((total_nanos / count as u128) as u64),
            p50: percentile_sorted(&sorted, 50),
            p95: percentile_sorted(&sorted, 95),
            p99: percentile_sorted(&sorted, 99),
            buckets,
        }
    }
}

pub fn as_ms(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1_000_000.0
}

pub(crate) fn serialize_ms<S: serde::Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(as_ms(*d))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ladder() -> Vec<Duration> {
        (1..=100).map(|i| Duration::from_millis(i * 10)).collect()
    }

    #[test]
    fn test_p95_of_ladder() {
        assert_eq!(percentile(ladder(), 95), Duration::from_millis(950));
        assert_eq!(percentile(ladder(), 99), Duration::from_millis(990));
        assert_eq!(percentile(ladder(), 50), Duration::from_millis(500));
    }

    #[test]
    fn test_order_does_not_matter() {
        let mut shuffled = ladder();
        shuffled.reverse();
        shuffled.swap(3, 70);
        assert_eq!(percentile(shuffled, 95), Duration::from_millis(950));
    }

    #[test]
    fn test_empty_sample_is_zero() {
        assert_eq!(percentile(Vec::new(), 95), Duration::ZERO);
        assert_eq!(LatencyProfile::from_durations(Vec::new()).p95, Duration::ZERO);
    }

    #[test]
    fn test_small_samples() {
        assert_eq!(nearest_rank_index(1, 95), 0);
        assert_eq!(nearest_rank_index(10, 95), 9);
        assert_eq!(nearest_rank_index(20, 95), 18);
        assert_eq!(nearest_rank_index(0, 95), 0);
    }

    #[test]
    fn test_profile() {
        let profile = LatencyProfile::from_durations(ladder());
        assert_eq!(profile.count, 100);
        assert_eq!(profile.min, Duration::from_millis(10));
        assert_eq!(profile.max, Duration::from_millis(1000));
        assert_eq!(profile.mean, Duration::from_millis(505));
        assert_eq!(profile.p95, Duration::from_millis(950));
        assert_eq!(profile.buckets.get(LatencyBucket::Under50ms), 4);
        assert_eq!(profile.buckets.get(LatencyBucket::AtLeast1s), 1);

        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(json["p95_ms"], 950.0);
        assert_eq!(json["p99_ms"], 990.0);
    }
}
