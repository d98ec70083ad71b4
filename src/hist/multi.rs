//! Log-scale histogram built from a chain of fixed-width sub-histograms.
//!
//! Sub-ranges halve in width from the top of the column extent downward,
//! so large values land in wide buckets and small values in narrow ones.
//! For an extent of `[0, 100]` the chain covers `[50,100]`, `[25,50]`,
//! `[12,25]`, … each with its own bucket grid.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use super::BasicHist;
use crate::table::IntInfo;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiHist {
    range_min: i64,
    range_max: i64,
    min: i64,
    max: i64,
    count: i64,
    samples: i64,
    mean: f64,
    m2: f64,
    track_buckets: bool,
    /// Ordered top range first; edge `i`'s lower bound is sub `i+1`'s upper.
    subhists: Vec<BasicHist>,
    edges: Vec<i64>,
}

impl MultiHist {
    pub fn new(info: &IntInfo, track_buckets: bool) -> Self {
        let mut subhists = Vec::new();
        let mut edges = Vec::new();

        if track_buckets {
            let mut width = info.max.saturating_sub(info.min);
            let mut right = info.max;
            while width > 0 {
                width >>= 1;
                let left = right - width;
                let mut sub_info = IntInfo::new(left);
                sub_info.update(right);
                subhists.push(BasicHist::new(&sub_info, true));
                edges.push(left);
                right = left;
            }
            // Halving never quite reaches the extent floor; stretch the
            // last sub-range down so minimum values still have a home.
            if let Some(last) = edges.last_mut() {
                if *last > info.min {
                    let mut sub_info = IntInfo::new(info.min);
                    sub_info.update(*last);
                    // INVARIANT: edges and subhists grow in lockstep, so a
                    // last edge implies a last subhist.
                    *subhists.last_mut().unwrap() = BasicHist::new(&sub_info, true);
                    *last = info.min;
                }
            }
        }

        Self {
            range_min: info.min,
            range_max: info.max,
            min: i64::MAX,
            max: i64::MIN,
            count: 0,
            samples: 0,
            mean: 0.0,
            m2: 0.0,
            track_buckets,
            subhists,
            edges,
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
            for (i, &left) in self.edges.iter().enumerate() {
                if value >= left {
                    self.subhists[i].record_value(value, weight);
                    break;
                }
            }
        }
    }

    pub fn combine(&mut self, other: &MultiHist) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = other.clone();
            return;
        }

        if self.subhists.len() == other.subhists.len() {
            for (sub, other_sub) in self.subhists.iter_mut().zip(&other.subhists) {
                sub.combine(other_sub);
            }
        } else {
            tracing::warn!(
                ours = self.subhists.len(),
                theirs = other.subhists.len(),
                "log-hist layouts differ, dropping bucket detail from one side"
            );
        }

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
        let mut all = HashMap::new();
        for sub in &self.subhists {
            for (edge, count) in sub.sparse_buckets() {
                *all.entry(edge).or_insert(0) += count;
            }
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(min: i64, max: i64) -> IntInfo {
        let mut info = IntInfo::new(min);
        info.update(max);
        info
    }

    #[test]
    fn subranges_halve_and_cover_the_extent() {
        let h = MultiHist::new(&extent(0, 100), true);
        assert_eq!(h.edges.first(), Some(&50));
        assert_eq!(h.edges.last(), Some(&0));
        for pair in h.edges.windows(2) {
            assert!(pair[1] < pair[0]);
        }
    }

    #[test]
    fn every_in_range_value_lands_in_some_bucket() {
        let mut h = MultiHist::new(&extent(0, 128), true);
        for v in 0..=128 {
            h.record_value(v, 1);
        }
        let bucketed: i64 = h.sparse_buckets().values().sum();
        assert_eq!(bucketed, 129);
    }

    #[test]
    fn degenerate_single_value_extent_still_records() {
        let mut h = MultiHist::new(&extent(7, 7), true);
        h.record_value(7, 2);
        assert_eq!(h.total_count(), 2);
        assert_eq!(h.min(), 7);
    }
}
