//! High-dynamic-range histogram engine, enabled by the `hdrhist` feature.
//!
//! Values are shifted so the column extent's minimum maps to 1, because
//! the underlying histogram tracks unsigned values with a fixed lowest
//! discernible value. Queries running this engine bypass the query cache;
//! their results do not round-trip through the cache payload format.

use hashbrown::HashMap;
use hdrhistogram::serialization::{Deserializer as HdrDeserializer, Serializer, V2Serializer};
use serde::de::Error as DeError;
use serde::ser::Error as SerError;
use serde::{Deserialize, Deserializer, Serialize, Serializer as SerdeSerializer};

use crate::table::IntInfo;

#[derive(Debug, Clone)]
pub struct HdrHist {
    range_min: i64,
    range_max: i64,
    /// Added to raw values before recording; subtracted on the way out.
    offset: i64,
    samples: i64,
    inner: hdrhistogram::Histogram<u64>,
}

impl HdrHist {
    pub fn new(info: &IntInfo) -> Self {
        let offset = 1 - info.min;
        let high = (info.max.saturating_mul(10) + offset).max(2) as u64;
        // INVARIANT: low bound 1 and high >= 2 satisfy the constructor's
        // preconditions, so this cannot fail.
        let inner = hdrhistogram::Histogram::new_with_bounds(1, high, 3).unwrap();
        Self { range_min: info.min, range_max: info.max, offset, samples: 0, inner }
    }

    pub fn record_value(&mut self, value: i64, weight: i64) {
        if value < self.range_min || value > self.range_max.saturating_mul(10) {
            return;
        }
        let shifted = (value + self.offset) as u64;
        if self.inner.record_n(shifted, weight as u64).is_ok() {
            self.samples += 1;
        }
    }

    pub fn combine(&mut self, other: &HdrHist) {
        if self.inner.add(&other.inner).is_ok() {
            self.samples += other.samples;
        }
    }

    pub fn mean(&self) -> f64 {
        if self.inner.is_empty() {
            return 0.0;
        }
        self.inner.mean() - self.offset as f64
    }

    pub fn min(&self) -> i64 {
        if self.inner.is_empty() {
            return 0;
        }
        self.inner.min() as i64 - self.offset
    }

    pub fn max(&self) -> i64 {
        if self.inner.is_empty() {
            return 0;
        }
        self.inner.max() as i64 - self.offset
    }

    pub fn total_count(&self) -> i64 {
        self.inner.len() as i64
    }

    pub fn samples(&self) -> i64 {
        self.samples
    }

    pub fn std_dev(&self) -> f64 {
        if self.inner.is_empty() {
            return 0.0;
        }
        self.inner.stdev()
    }

    pub fn percentiles(&self) -> Vec<i64> {
        if self.inner.is_empty() {
            return Vec::new();
        }
        (0..=100)
            .map(|p| self.inner.value_at_quantile(p as f64 / 100.0) as i64 - self.offset)
            .collect()
    }

    pub fn sparse_buckets(&self) -> HashMap<i64, i64> {
        let mut out = HashMap::new();
        for value in self.inner.iter_recorded() {
            let edge = value.value_iterated_to() as i64 - self.offset;
            *out.entry(edge).or_insert(0) += value.count_at_value() as i64;
        }
        out
    }
}

impl Serialize for HdrHist {
    fn serialize<S: SerdeSerializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut payload = Vec::new();
        V2Serializer::new()
            .serialize(&self.inner, &mut payload)
            .map_err(|e| S::Error::custom(format!("hdr serialize: {e}")))?;
        (self.range_min, self.range_max, self.offset, self.samples, payload)
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for HdrHist {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (range_min, range_max, offset, samples, payload): (i64, i64, i64, i64, Vec<u8>) =
            Deserialize::deserialize(deserializer)?;
        let inner = HdrDeserializer::new()
            .deserialize(&mut payload.as_slice())
            .map_err(|e| D::Error::custom(format!("hdr deserialize: {e}")))?;
        Ok(Self { range_min, range_max, offset, samples, inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_extents_are_shifted_into_range() {
        let mut info = IntInfo::new(-50);
        info.update(50);
        let mut h = HdrHist::new(&info);
        h.record_value(-50, 1);
        h.record_value(0, 1);
        h.record_value(50, 1);
        assert_eq!(h.min(), -50);
        assert_eq!(h.max(), 50);
        assert!((h.mean() - 0.0).abs() < 1.0);
    }
}
