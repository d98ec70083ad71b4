//! Fixed-width bucket histogram.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::config::NUM_HIST_BUCKETS;
use crate::table::IntInfo;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicHist {
    range_min: i64,
    range_max: i64,
    bucket_size: i64,
    min: i64,
    max: i64,
    count: i64,
    samples: i64,
    mean: f64,
    m2: f64,
    track_buckets: bool,
    /// Bucket left edge → weighted count. Sparse; empty buckets never
    /// appear.
    buckets: HashMap<i64, i64>,
}

impl BasicHist {
    /// Size buckets so the column's catalog extent spans `NUM_HIST_BUCKETS`
    /// of them, with a floor of width 1 for narrow extents.
    pub fn new(info: &IntInfo, track_buckets: bool) -> Self {
        let span = info.max.saturating_sub(info.min);
        Self {
            range_min: info.min,
            range_max: info.max,
            bucket_size: (span / NUM_HIST_BUCKETS as i64).max(1),
            min: i64::MAX,
            max: i64::MIN,
            count: 0,
            samples: 0,
            mean: 0.0,
            m2: 0.0,
            track_buckets,
            buckets: HashMap::new(),
        }
    }

    pub fn record_value(&mut self, value: i64, weight: i64) {
        if value < self.range_min || value > self.range_max.saturating_mul(10) {
            return;
        }

        self.count += weight;
        self.samples += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);

        let w = weight as f64;
        let v = value as f64;
        let delta = v - self.mean;
        self.mean += delta * w / self.count as f64;
        self.m2 += w * delta * (v - self.mean);

        if self.track_buckets {
            let idx = (value - self.range_min) / self.bucket_size;
            let edge = self.range_min + idx * self.bucket_size;
            *self.buckets.entry(edge).or_insert(0) += weight;
        }
    }

    pub fn combine(&mut self, other: &BasicHist) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = other.clone();
            return;
        }

        for (&edge, &count) in &other.buckets {
            *self.buckets.entry(edge).or_insert(0) += count;
        }

        // Parallel-variance merge keeps std_dev exact across partials.
        let total = (self.count + other.count) as f64;
        let delta = other.mean - self.mean;
        self.m2 += other.m2 + delta * delta * (self.count as f64 * other.count as f64) / total;
        self.mean =
            (self.mean * self.count as f64 + other.mean * other.count as f64) / total;

        self.count += other.count;
        self.samples += other.samples;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn min(&self) -> i64 {
        if self.count == 0 {
            0
        } else {
            self.min
        }
    }

    pub fn max(&self) -> i64 {
        if self.count == 0 {
            0
        } else {
            self.max
        }
    }

    pub fn total_count(&self) -> i64 {
        self.count
    }

    pub fn samples(&self) -> i64 {
        self.samples
    }

    pub fn std_dev(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        (self.m2 / self.count as f64).sqrt()
    }

    pub fn sparse_buckets(&self) -> HashMap<i64, i64> {
        self.buckets.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrow_extent_gets_unit_buckets() {
        let mut info = IntInfo::new(0);
        info.update(50);
        let h = BasicHist::new(&info, true);
        assert_eq!(h.bucket_size, 1);
    }

    #[test]
    fn wide_extent_divides_into_configured_bucket_count() {
        let mut info = IntInfo::new(0);
        info.update(1_000_000);
        let h = BasicHist::new(&info, true);
        assert_eq!(h.bucket_size, 1_000_000 / NUM_HIST_BUCKETS as i64);
    }

    #[test]
    fn untracked_histogram_skips_bucket_upkeep() {
        let mut info = IntInfo::new(0);
        info.update(100);
        let mut h = BasicHist::new(&info, false);
        for v in 0..100 {
            h.record_value(v, 1);
        }
        assert!(h.sparse_buckets().is_empty());
        assert_eq!(h.total_count(), 100);
    }

    #[test]
    fn combine_into_empty_adopts_the_other_side() {
        let mut info = IntInfo::new(0);
        info.update(100);
        let mut empty = BasicHist::new(&info, true);
        let mut full = BasicHist::new(&info, true);
        full.record_value(10, 1);
        full.record_value(20, 3);

        empty.combine(&full);
        assert_eq!(empty.total_count(), 4);
        assert!((empty.mean() - 17.5).abs() < 1e-9);
    }
}
