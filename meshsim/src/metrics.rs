//! Latency histograms and per-actor counters.
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::actor::Lifecycle;
use crate::protocol::Kind;

const BUCKETS: usize = 40;

/// A latency histogram with power-of-two microsecond buckets.
///
/// Bucket `i` holds samples in `[2^i, 2^(i+1))` microseconds; sub-microsecond
/// samples land in bucket 0. Merging is commutative, so histograms from many
/// actors can be folded in any order. `min_us` is 0 while the histogram is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyHistogram {
    count: u64,
    sum_us: u64,
    min_us: u64,
    max_us: u64,
    #[serde(deserialize_with = "deserialize_buckets")]
    buckets: Vec<u64>,
}

/// Fit deserialized buckets to `BUCKETS`, folding any extra into the last one.
fn deserialize_buckets<'de, D>(deserializer: D) -> Result<Vec<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let mut buckets = Vec::<u64>::deserialize(deserializer)?;
    if buckets.len() > BUCKETS {
        let overflow: u64 = buckets.drain(BUCKETS..).sum();
        buckets[BUCKETS - 1] += overflow;
    }
    buckets.resize(BUCKETS, 0);
    Ok(buckets)
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self {
            count: 0,
            sum_us: 0,
            min_us: 0,
            max_us: 0,
            buckets: vec![0; BUCKETS],
        }
    }
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket_of(us: u64) -> usize {
        if us == 0 {
            0
        } else {
            (63 - us.leading_zeros() as usize).min(BUCKETS - 1)
        }
    }

    pub fn record(&mut self, latency: Duration) {
        let us = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.min_us = if self.is_empty() { us } else { self.min_us.min(us) };
        self.count += 1;
        self.sum_us = self.sum_us.saturating_add(us);
        self.max_us = self.max_us.max(us);
        self.buckets[Self::bucket_of(us)] += 1;
    }

    pub fn merge(&mut self, other: &LatencyHistogram) {
        if other.is_empty() {
            return;
        }
        self.min_us = if self.is_empty() {
            other.min_us
        } else {
            self.min_us.min(other.min_us)
        };
        self.count += other.count;
        self.sum_us = self.sum_us.saturating_add(other.sum_us);
        self.max_us = self.max_us.max(other.max_us);
        for (mine, theirs) in self.buckets.iter_mut().zip(&other.buckets) {
            *mine += theirs;
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn min(&self) -> Option<Duration> {
        (!self.is_empty()).then(|| Duration::from_micros(self.min_us))
    }

    pub fn max(&self) -> Option<Duration> {
        (!self.is_empty()).then(|| Duration::from_micros(self.max_us))
    }

    pub fn mean(&self) -> Option<Duration> {
        (!self.is_empty()).then(|| Duration::from_micros(self.sum_us / self.count))
    }

    /// The upper bound of the bucket holding quantile `q`, capped at the observed maximum.
    pub fn quantile(&self, q: f64) -> Option<Duration> {
        if self.is_empty() {
            return None;
        }
        let rank = ((q.clamp(0.0, 1.0) * self.count as f64).ceil() as u64).max(1);
        let mut seen = 0;
        for (index, count) in self.buckets.iter().enumerate() {
            seen += count;
            if seen >= rank {
                let upper = (1u64 << (index + 1)).saturating_sub(1);
                return Some(Duration::from_micros(upper.min(self.max_us)));
            }
        }
        self.max()
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let us = |d: Option<Duration>| d.map(|d| d.as_micros() as u64).unwrap_or_default();
        HistogramSnapshot {
            count: self.count,
            min_us: us(self.min()),
            max_us: us(self.max()),
            mean_us: us(self.mean()),
            p50_us: us(self.quantile(0.5)),
            p90_us: us(self.quantile(0.9)),
            p99_us: us(self.quantile(0.99)),
        }
    }
}

/// A summary of a [`LatencyHistogram`] for reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub min_us: u64,
    pub max_us: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p90_us: u64,
    pub p99_us: u64,
}

/// The counters an actor reports on a diagnostic pull and when it stops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorStats {
    pub name: String,
    pub service: String,
    pub state: Lifecycle,
    pub sent: u64,
    pub received: u64,
    /// Sends that found the destination already stopped.
    pub dropped: u64,
    /// Messages of a kind the actor does not handle.
    pub ignored: u64,
    /// Requests waiting on processing or sub-responses.
    pub in_flight: usize,
    /// Requests answered with every sub-response in.
    pub completed: u64,
    /// Requests answered degraded: timed out, no reachable dependency, or cut short by a stop.
    pub degraded: u64,
    /// Requests this actor started on its own.
    pub originated: u64,
    pub peers: usize,
    pub received_by_kind: BTreeMap<Kind, u64>,
    /// Round trip latency of sub-requests this actor issued.
    pub latency: LatencyHistogram,
    /// Latency of requests this actor originated, from start to final answer.
    pub end_to_end: LatencyHistogram,
}

impl ActorStats {
    pub fn new(name: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service: service.into(),
            state: Lifecycle::Starting,
            sent: 0,
            received: 0,
            dropped: 0,
            ignored: 0,
            in_flight: 0,
            completed: 0,
            degraded: 0,
            originated: 0,
            peers: 0,
            received_by_kind: BTreeMap::new(),
            latency: LatencyHistogram::new(),
            end_to_end: LatencyHistogram::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_histogram() {
        let histogram = LatencyHistogram::new();
        assert!(histogram.is_empty());
        assert_eq!(histogram.mean(), None);
        assert_eq!(histogram.quantile(0.5), None);
        assert_eq!(histogram.snapshot(), HistogramSnapshot::default());
    }

    #[test]
    fn test_histogram_statistics() {
        let mut histogram = LatencyHistogram::new();
        for ms in [1, 2, 3, 4, 100] {
            histogram.record(Duration::from_millis(ms));
        }
        assert_eq!(histogram.count(), 5);
        assert_eq!(histogram.min(), Some(Duration::from_millis(1)));
        assert_eq!(histogram.max(), Some(Duration::from_millis(100)));
        assert_eq!(histogram.mean(), Some(Duration::from_millis(22)));

        // 3ms falls in the [2048us, 4096us) bucket.
        let p50 = histogram.quantile(0.5).unwrap();
        assert!(p50 >= Duration::from_millis(3) && p50 < Duration::from_micros(4096));
        assert_eq!(histogram.quantile(1.0), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_histogram_merge_is_commutative() {
        let mut a = LatencyHistogram::new();
        let mut b = LatencyHistogram::new();
        a.record(Duration::from_micros(10));
        b.record(Duration::from_micros(5000));
        b.record(Duration::ZERO);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        assert_eq!(ab, ba);
        assert_eq!(ab.count(), 3);
        assert_eq!(ab.min(), Some(Duration::ZERO));

        let mut empty = LatencyHistogram::new();
        empty.merge(&a);
        assert_eq!(empty, a);
        a.merge(&LatencyHistogram::new());
        assert_eq!(a.min(), Some(Duration::from_micros(10)));
    }

    #[test]
    fn test_empty_histogram_serializes_zero_minimum() {
        let json = serde_json::to_value(LatencyHistogram::new()).unwrap();
        assert_eq!(json["min_us"], 0);
        assert_eq!(json["count"], 0);
    }

    #[test]
    fn test_deserialized_histogram_keeps_bucket_count() {
        let json = r#"{"count":1,"sum_us":5,"min_us":5,"max_us":5,"buckets":[0,0,1]}"#;
        let mut short: LatencyHistogram = serde_json::from_str(json).unwrap();
        short.record(Duration::from_secs(3600));
        assert_eq!(short.count(), 2);
        assert_eq!(short.min(), Some(Duration::from_micros(5)));

        let mut buckets = vec![0u64; BUCKETS + 2];
        buckets[BUCKETS + 1] = 2;
        let json = serde_json::json!({"count":2,"sum_us":0,"min_us":0,"max_us":0,"buckets":buckets});
        let long: LatencyHistogram = serde_json::from_value(json).unwrap();
        assert_eq!(long.buckets.len(), BUCKETS);
        assert_eq!(long.buckets[BUCKETS - 1], 2);
    }
}
