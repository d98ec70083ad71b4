//! # Histograms
//!
//! Per-group value distributions for `Hist` and `Avg` aggregations. Three
//! interchangeable engines sit behind one tagged enum:
//!
//! * [`BasicHist`]: fixed-width buckets over the column's catalog extent.
//!   Cheap, but resolution degrades on long-tailed columns.
//! * [`MultiHist`]: a chain of sub-histograms whose widths halve from the
//!   top of the range downward, giving log-scale resolution.
//! * `HdrHist` (feature `hdrhist`): a high-dynamic-range histogram for
//!   callers that want guaranteed quantile error bounds.
//!
//! All engines share the recording rules: a value outside
//! `[extent_min, extent_max * 10]` is discarded as an outlier, weights add
//! to the weighted count while `samples` counts raw rows, and running mean
//! and variance use Welford's method so combining partial histograms from
//! different blocks is exact.

mod basic;
#[cfg(feature = "hdrhist")]
mod hdr;
mod multi;

pub use basic::BasicHist;
#[cfg(feature = "hdrhist")]
pub use hdr::HdrHist;
pub use multi::MultiHist;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::config::TableOptions;
use crate::table::IntInfo;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Histogram {
    Basic(BasicHist),
    Multi(MultiHist),
    #[cfg(feature = "hdrhist")]
    Hdr(HdrHist),
}

impl Histogram {
    /// Pick the engine the table options ask for, sized to the column's
    /// catalog extent. `track_buckets` is false for plain averages, which
    /// never read percentiles or bucket counts.
    pub fn for_extent(options: &TableOptions, info: &IntInfo, track_buckets: bool) -> Self {
        #[cfg(feature = "hdrhist")]
        if options.hdr_hist {
            return Histogram::Hdr(HdrHist::new(info));
        }
        if options.log_hist {
            Histogram::Multi(MultiHist::new(info, track_buckets))
        } else {
            Histogram::Basic(BasicHist::new(info, track_buckets))
        }
    }

    pub fn record_value(&mut self, value: i64, weight: i64) {
        match self {
            Histogram::Basic(h) => h.record_value(value, weight),
            Histogram::Multi(h) => h.record_value(value, weight),
            #[cfg(feature = "hdrhist")]
            Histogram::Hdr(h) => h.record_value(value, weight),
        }
    }

    /// Merge another partial histogram of the same engine. Partials built
    /// from the same query share an engine and extent, so a variant
    /// mismatch means caller error and the merge is skipped.
    pub fn combine(&mut self, other: &Histogram) {
        match (self, other) {
            (Histogram::Basic(a), Histogram::Basic(b)) => a.combine(b),
            (Histogram::Multi(a), Histogram::Multi(b)) => a.combine(b),
            #[cfg(feature = "hdrhist")]
            (Histogram::Hdr(a), Histogram::Hdr(b)) => a.combine(b),
            #[allow(unreachable_patterns)]
            _ => tracing::warn!("refusing to combine mismatched histogram engines"),
        }
    }

    pub fn mean(&self) -> f64 {
        match self {
            Histogram::Basic(h) => h.mean(),
            Histogram::Multi(h) => h.mean(),
            #[cfg(feature = "hdrhist")]
            Histogram::Hdr(h) => h.mean(),
        }
    }

    pub fn min(&self) -> i64 {
        match self {
            Histogram::Basic(h) => h.min(),
            Histogram::Multi(h) => h.min(),
            #[cfg(feature = "hdrhist")]
            Histogram::Hdr(h) => h.min(),
        }
    }

    pub fn max(&self) -> i64 {
        match self {
            Histogram::Basic(h) => h.max(),
            Histogram::Multi(h) => h.max(),
            #[cfg(feature = "hdrhist")]
            Histogram::Hdr(h) => h.max(),
        }
    }

    /// Weighted count of recorded values.
    pub fn total_count(&self) -> i64 {
        match self {
            Histogram::Basic(h) => h.total_count(),
            Histogram::Multi(h) => h.total_count(),
            #[cfg(feature = "hdrhist")]
            Histogram::Hdr(h) => h.total_count(),
        }
    }

    /// Raw rows recorded, ignoring weights.
    pub fn samples(&self) -> i64 {
        match self {
            Histogram::Basic(h) => h.samples(),
            Histogram::Multi(h) => h.samples(),
            #[cfg(feature = "hdrhist")]
            Histogram::Hdr(h) => h.samples(),
        }
    }

    pub fn std_dev(&self) -> f64 {
        match self {
            Histogram::Basic(h) => h.std_dev(),
            Histogram::Multi(h) => h.std_dev(),
            #[cfg(feature = "hdrhist")]
            Histogram::Hdr(h) => h.std_dev(),
        }
    }

    /// 101 entries: `percentiles()[p]` is the bucket edge at or below the
    /// p-th percentile, for `p` in `0..=100`. Empty when nothing was
    /// recorded.
    pub fn percentiles(&self) -> Vec<i64> {
        match self {
            Histogram::Basic(h) => percentiles_from_sparse(&h.sparse_buckets()),
            Histogram::Multi(h) => percentiles_from_sparse(&h.sparse_buckets()),
            #[cfg(feature = "hdrhist")]
            Histogram::Hdr(h) => h.percentiles(),
        }
    }

    /// Non-empty buckets keyed by the decimal left edge.
    pub fn buckets(&self) -> HashMap<String, i64> {
        let sparse = match self {
            Histogram::Basic(h) => h.sparse_buckets(),
            Histogram::Multi(h) => h.sparse_buckets(),
            #[cfg(feature = "hdrhist")]
            Histogram::Hdr(h) => h.sparse_buckets(),
        };
        sparse.iter().map(|(edge, count)| (edge.to_string(), *count)).collect()
    }
}

/// The shared percentile walk: sort non-empty bucket edges ascending, then
/// sweep the cumulative weighted count, stamping every percentile slot the
/// sweep passes with the current edge.
fn percentiles_from_sparse(buckets: &HashMap<i64, i64>) -> Vec<i64> {
    let total: i64 = buckets.values().sum();
    if total == 0 {
        return Vec::new();
    }

    let mut edges: Vec<i64> = buckets
        .iter()
        .filter(|(_, &count)| count > 0)
        .map(|(&edge, _)| edge)
        .collect();
    edges.sort_unstable();

    let mut percentiles = vec![0i64; 101];
    let mut cumulative = 0i64;
    let mut prev_p = 0usize;
    for edge in edges {
        cumulative += buckets[&edge];
        let p = ((100 * cumulative) / total) as usize;
        for slot in prev_p..=p.min(100) {
            percentiles[slot] = edge;
        }
        prev_p = p.min(100);
    }

    percentiles
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(min: i64, max: i64) -> IntInfo {
        let mut info = IntInfo::new(min);
        info.update(max);
        info
    }

    fn filled(options: &TableOptions) -> Histogram {
        let mut h = Histogram::for_extent(options, &extent(0, 100), true);
        for v in 0..=100 {
            h.record_value(v, 1);
        }
        h
    }

    #[test]
    fn uniform_values_give_linear_percentiles() {
        for options in [
            TableOptions::default(),
            TableOptions { log_hist: true, ..Default::default() },
        ] {
            let h = filled(&options);
            let p = h.percentiles();
            assert_eq!(p.len(), 101);
            // Bucket granularity costs at most one bucket width of error.
            assert!((p[50] - 50).abs() <= 2, "p50 was {}", p[50]);
            assert!((p[25] - 25).abs() <= 2, "p25 was {}", p[25]);
            assert!((p[100] - 100).abs() <= 2, "p100 was {}", p[100]);
        }
    }

    #[test]
    fn mean_and_extrema_track_recorded_values() {
        let h = filled(&TableOptions::default());
        assert!((h.mean() - 50.0).abs() < 0.01);
        assert_eq!(h.min(), 0);
        assert_eq!(h.max(), 100);
        assert_eq!(h.total_count(), 101);
    }

    #[test]
    fn outliers_are_discarded() {
        let mut h = Histogram::for_extent(&TableOptions::default(), &extent(10, 100), true);
        h.record_value(50, 1);
        h.record_value(5, 1); // below extent min
        h.record_value(1001, 1); // above extent max * 10
        h.record_value(999, 1); // inside the guard band
        assert_eq!(h.total_count(), 2);
        assert_eq!(h.max(), 999);
    }

    #[test]
    fn weights_add_to_count_but_not_samples() {
        let mut h = Histogram::for_extent(&TableOptions::default(), &extent(0, 10), false);
        h.record_value(4, 9);
        h.record_value(6, 1);
        assert_eq!(h.total_count(), 10);
        assert_eq!(h.samples(), 2);
        assert!((h.mean() - 4.2).abs() < 1e-9);
    }

    #[test]
    fn combining_partials_matches_single_pass() {
        let options = TableOptions::default();
        let info = extent(0, 100);

        let mut whole = Histogram::for_extent(&options, &info, true);
        let mut left = Histogram::for_extent(&options, &info, true);
        let mut right = Histogram::for_extent(&options, &info, true);

        for v in 0..=100i64 {
            whole.record_value(v, 1);
            if v < 40 {
                left.record_value(v, 1);
            } else {
                right.record_value(v, 1);
            }
        }

        left.combine(&right);
        assert_eq!(left.total_count(), whole.total_count());
        assert!((left.mean() - whole.mean()).abs() < 1e-9);
        assert!((left.std_dev() - whole.std_dev()).abs() < 1e-9);
        assert_eq!(left.min(), whole.min());
        assert_eq!(left.max(), whole.max());
    }

    #[test]
    fn empty_histogram_has_no_percentiles() {
        let h = Histogram::for_extent(&TableOptions::default(), &extent(0, 10), true);
        assert!(h.percentiles().is_empty());
        assert!(h.buckets().is_empty());
    }
}
