use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// One recorded transaction size (whole coins) and when it was seen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub size: f64,
    pub observed_at: DateTime<Utc>,
}

impl Sample {
    pub fn new(size: f64, observed_at: DateTime<Utc>) -> Self {
        Self { size, observed_at }
    }
}

/// Max-heap entry keyed on sample size. Equal sizes compare equal.
#[derive(Debug, Clone, Copy)]
struct BySize(f64);

impl PartialEq for BySize {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for BySize {}

impl PartialOrd for BySize {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BySize {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Number of samples that make up the upper `percent` of a window of `count`.
///
/// `ceil(count * percent / 100)`, never below 1 for a non-empty window and
/// never above `count`.
pub fn upper_count(count: usize, percent: f64) -> usize {
    if count == 0 {
        return 0;
    }
    let raw = count as f64 * percent / 100.0;
    // Products like 3000 * 1.1 / 100 land a hair above a whole number.
    let nearest = raw.round();
    let k = if (raw - nearest).abs() < 1e-9 { nearest } else { raw.ceil() };
    (k as usize).clamp(1, count)
}

/// Append-only, time-pruned window of transaction sizes.
///
/// Samples stay in arrival order. Retention is enforced only by [`prune`],
/// which the maintenance task calls on a timer, so between prunes the window
/// may briefly hold samples older than the retention period.
///
/// [`prune`]: WindowStore::prune
#[derive(Debug, Clone)]
pub struct WindowStore {
    samples: VecDeque<Sample>,
    retention: Duration,
}

impl WindowStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            retention,
        }
    }

    /// Rebuild a window from previously persisted samples, keeping their order.
    pub fn with_samples(retention: Duration, samples: Vec<Sample>) -> Self {
        Self {
            samples: samples.into(),
            retention,
        }
    }

    /// Append a sample observed now.
    pub fn record(&mut self, size: f64) {
        self.record_at(size, Utc::now());
    }

    /// Append a sample with an explicit observation time.
    pub fn record_at(&mut self, size: f64, observed_at: DateTime<Utc>) {
        self.samples.push_back(Sample::new(size, observed_at));
    }

    /// Drop every sample observed before `now - retention`. Returns how many were removed.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.retention;
        let before = self.samples.len();
        self.samples.retain(|s| s.observed_at >= cutoff);
        before - self.samples.len()
    }

    /// Arithmetic mean of all sizes, 0 for an empty window.
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.samples.iter().map(|s| s.size).sum();
        sum / self.samples.len() as f64
    }

    /// Mean of the largest `ceil(count * percent / 100)` sizes, 0 for an empty window.
    ///
    /// A fresh heap is built over the current contents on every call so the
    /// result always reflects the window as it is now.
    pub fn upper_percentile_average(&self, percent: f64) -> f64 {
        let k = upper_count(self.samples.len(), percent);
        if k == 0 {
            return 0.0;
        }

        let mut heap: BinaryHeap<BySize> = self.samples.iter().map(|s| BySize(s.size)).collect();
        let mut sum = 0.0;
        for _ in 0..k {
            match heap.pop() {
                Some(BySize(size)) => sum += size,
                None => break,
            }
        }
        sum / k as f64
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }

    /// Owned copy of the current contents, in order.
    pub fn snapshot(&self) -> Vec<Sample> {
        self.samples.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn window_of(sizes: &[f64]) -> WindowStore {
        let mut window = WindowStore::new(Duration::hours(24));
        for &size in sizes {
            window.record(size);
        }
        window
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
    }

    #[test]
    fn empty_window_statistics_are_zero() {
        let window = WindowStore::new(Duration::hours(1));
        assert_eq!(window.count(), 0);
        assert_eq!(window.average(), 0.0);
        assert_eq!(window.upper_percentile_average(10.0), 0.0);
    }

    #[test]
    fn average_of_samples() {
        let window = window_of(&[1.0, 2.0, 3.0, 6.0]);
        assert!((window.average() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn top_twenty_percent_of_one_to_ten() {
        let sizes: Vec<f64> = (1..=10).map(f64::from).collect();
        let window = window_of(&sizes);
        assert_eq!(upper_count(10, 20.0), 2);
        assert!((window.upper_percentile_average(20.0) - 9.5).abs() < 1e-12);
    }

    #[test]
    fn upper_count_rounds_up_and_is_at_least_one() {
        assert_eq!(upper_count(0, 50.0), 0);
        assert_eq!(upper_count(1, 0.5), 1);
        assert_eq!(upper_count(1000, 0.5), 5);
        assert_eq!(upper_count(1001, 0.5), 6);
        assert_eq!(upper_count(3, 34.0), 2);
        assert_eq!(upper_count(7, 100.0), 7);
    }

    #[test]
    fn upper_count_ignores_float_noise() {
        assert_eq!(upper_count(3000, 1.1), 33);
        assert_eq!(upper_count(1000, 0.7), 7);
        assert_eq!(upper_count(3001, 1.1), 34);
        assert_eq!(upper_count(100, 0.29), 1);
    }

    #[test]
    fn tiny_percentile_selects_the_maximum() {
        let window = window_of(&[4.0, 42.0, 7.0]);
        assert_eq!(window.upper_percentile_average(0.001), 42.0);
    }

    #[test]
    fn ties_are_counted_once_each() {
        let window = window_of(&[5.0, 5.0, 5.0, 1.0]);
        assert_eq!(window.upper_percentile_average(50.0), 5.0);
        assert!((window.upper_percentile_average(100.0) - 4.0).abs() < 1e-12);
    }

    #[test]
    fn statistic_follows_current_contents() {
        let mut window = window_of(&[1.0, 2.0]);
        assert_eq!(window.upper_percentile_average(50.0), 2.0);
        window.record(100.0);
        assert_eq!(window.upper_percentile_average(1.0), 100.0);
    }

    #[test]
    fn prune_removes_only_expired_and_keeps_order() {
        let now = Utc::now();
        let mut window = WindowStore::new(Duration::hours(1));
        window.record_at(1.0, now - Duration::minutes(90));
        window.record_at(2.0, now - Duration::minutes(30));
        window.record_at(3.0, now - Duration::minutes(61));
        window.record_at(4.0, now - Duration::minutes(5));

        let removed = window.prune(now);
        assert_eq!(removed, 2);
        let left: Vec<f64> = window.snapshot().iter().map(|s| s.size).collect();
        assert_eq!(left, vec![2.0, 4.0]);
    }

    #[test]
    fn prune_keeps_sample_exactly_at_cutoff() {
        let now = Utc::now();
        let mut window = WindowStore::new(Duration::hours(1));
        window.record_at(1.0, now - Duration::hours(1));
        assert_eq!(window.prune(now), 0);
        assert_eq!(window.count(), 1);
    }

    #[test]
    fn with_samples_preserves_order() {
        let now = Utc::now();
        let samples = vec![Sample::new(3.0, now), Sample::new(1.0, now), Sample::new(2.0, now)];
        let window = WindowStore::with_samples(Duration::hours(1), samples.clone());
        assert_eq!(window.snapshot(), samples);
    }

    proptest! {
        #[test]
        fn full_percentile_equals_mean(sizes in prop::collection::vec(0.0f64..1e7, 1..300)) {
            let window = window_of(&sizes);
            prop_assert!(close(window.upper_percentile_average(100.0), window.average()));
        }

        #[test]
        fn upper_average_does_not_grow_with_percent(
            sizes in prop::collection::vec(0.0f64..1e7, 1..300),
            a in 0.01f64..=100.0,
            b in 0.01f64..=100.0,
        ) {
            let window = window_of(&sizes);
            let (low, high) = if a <= b { (a, b) } else { (b, a) };
            let narrow = window.upper_percentile_average(low);
            let wide = window.upper_percentile_average(high);
            prop_assert!(wide <= narrow || close(wide, narrow));
        }

        #[test]
        fn count_is_records_minus_aged_out(
            ages_secs in prop::collection::vec(0i64..7_200, 0..200),
            retention_secs in 1i64..7_200,
        ) {
            let now = Utc::now();
            let mut window = WindowStore::new(Duration::seconds(retention_secs));
            for age in &ages_secs {
                window.record_at(1.0, now - Duration::seconds(*age));
            }
            prop_assert_eq!(window.count(), ages_secs.len());

            let removed = window.prune(now);
            let expired = ages_secs.iter().filter(|&&age| age > retention_secs).count();
            prop_assert_eq!(removed, expired);
            prop_assert_eq!(window.count(), ages_secs.len() - expired);
        }
    }
}
