//! # Block Codec
//!
//! Lossless round-trip between an in-memory `TableBlock` and its on-disk
//! representation: a directory of per-column files plus a metadata file.
//!
//! ## On-disk layout of one block
//!
//! ```text
//! <block-dir>/
//!     info.db              SavedBlockInfo { num_records, per-field min/max }
//!     int_<field>.db[.gz]  SavedIntColumn
//!     str_<field>.db[.gz]  SavedStrColumn (+ dedup string table)
//!     set_<field>.db[.gz]  SavedSetColumn (+ dedup string table)
//!     cache/<hash>.db.gz   cached per-block query results (see query::cache)
//! ```
//!
//! ## Encodings
//!
//! A column is **bucket-encoded** (value → ascending record-id list) when its
//! distinct-value count is at most `chunk_size / 4`, else **value-encoded**
//! (dense array indexed by record id). Record ids within a bucket, and int
//! values within a dense array, may be delta-encoded against the previous
//! emitted value. String and set columns carry their own deduplicated string
//! table so a block is self-contained on disk; ids are remapped through a
//! translation table when the block is loaded back.
//!
//! Column files are serialized with bincode and may be transparently
//! gzip-compressed; the reader detects the `.gz` suffix and falls back to
//! the sibling filename in either direction.

mod read;
mod write;

pub use read::{decode_file, unpack_int_column, unpack_set_column, unpack_str_column};
pub use write::{encode_file, save_block, separate_into_columns, SeparatedColumns};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::table::{IntInfo, StrInfo};

/// Decoding hint for backwards compatibility of saved columns.
pub const BLOCK_VERSION: i32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedIntBucket {
    pub value: i64,
    pub records: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedStrBucket {
    pub value: i32,
    pub records: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedSetBucket {
    pub value: i32,
    pub records: Vec<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SavedIntColumn {
    pub name: String,
    pub delta_encoded_ids: bool,
    pub delta_encoded_values: bool,
    pub value_encoded: bool,
    pub bucket_encoded: bool,
    pub bins: Vec<SavedIntBucket>,
    pub values: Vec<i64>,
    pub version: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SavedStrColumn {
    pub name: String,
    pub delta_encoded_ids: bool,
    pub bucket_encoded: bool,
    pub bins: Vec<SavedStrBucket>,
    pub values: Vec<i32>,
    pub string_table: Vec<String>,
    pub version: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SavedSetColumn {
    pub name: String,
    pub delta_encoded_ids: bool,
    pub bucket_encoded: bool,
    pub bins: Vec<SavedSetBucket>,
    pub values: Vec<Vec<i32>>,
    pub string_table: Vec<String>,
    pub version: i32,
}

impl SavedIntColumn {
    pub fn new(name: String) -> Self {
        Self { name, version: BLOCK_VERSION, ..Default::default() }
    }
}

impl SavedStrColumn {
    pub fn new(name: String) -> Self {
        Self { name, version: BLOCK_VERSION, ..Default::default() }
    }
}

impl SavedSetColumn {
    pub fn new(name: String) -> Self {
        Self { name, version: BLOCK_VERSION, ..Default::default() }
    }
}

/// Block-level metadata, written as `info.db` inside the block directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SavedBlockInfo {
    pub num_records: i32,
    pub int_info: HashMap<String, IntInfo>,
    pub str_info: HashMap<String, StrInfo>,
}

/// Table-level block metadata cache file: block path → its `SavedBlockInfo`.
pub type SavedBlockCache = HashMap<String, SavedBlockInfo>;

/// Delta-encode an ascending record-id list in place: the first id stays
/// absolute, every following id becomes the difference from its predecessor.
pub fn delta_encode_ids(ids: &mut [u32]) {
    let mut prev = 0u32;
    for id in ids.iter_mut() {
        let absolute = *id;
        *id = absolute - prev;
        prev = absolute;
    }
}

/// Undo `delta_encode_ids` in place.
pub fn delta_decode_ids(ids: &mut [u32]) {
    let mut prev = 0u32;
    for id in ids.iter_mut() {
        *id += prev;
        prev = *id;
    }
}

/// Delta-encode int values in record-id order: first value absolute, the
/// rest as differences. Differences wrap, so any `i64` sequence survives
/// the round trip.
pub fn delta_encode_values(values: &mut [i64]) {
    let mut prev = 0i64;
    for v in values.iter_mut() {
        let absolute = *v;
        *v = absolute.wrapping_sub(prev);
        prev = absolute;
    }
}

/// Undo `delta_encode_values` in place.
pub fn delta_decode_values(values: &mut [i64]) {
    let mut prev = 0i64;
    for v in values.iter_mut() {
        *v = v.wrapping_add(prev);
        prev = *v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_delta_roundtrip_is_lossless() {
        let cases: Vec<Vec<u32>> = vec![
            vec![],
            vec![0],
            vec![0, 1, 2, 3],
            vec![5, 17, 17, 90, 4096],
            (0..1000).step_by(7).collect(),
        ];

        for original in cases {
            let mut ids = original.clone();
            delta_encode_ids(&mut ids);
            delta_decode_ids(&mut ids);
            assert_eq!(ids, original);
        }
    }

    #[test]
    fn value_delta_roundtrip_is_lossless() {
        let original = vec![0i64, -40, 22, 22, i64::from(i32::MAX), 7];
        let mut values = original.clone();
        delta_encode_values(&mut values);
        delta_decode_values(&mut values);
        assert_eq!(values, original);
    }

    #[test]
    fn value_delta_survives_extreme_magnitudes() {
        let original = vec![i64::MIN, i64::MAX, 0, -1, i64::MAX, i64::MIN, 1];
        let mut values = original.clone();
        delta_encode_values(&mut values);
        delta_decode_values(&mut values);
        assert_eq!(values, original);
    }

    #[test]
    fn id_delta_shrinks_dense_runs_to_small_numbers() {
        let mut ids: Vec<u32> = (100..200).collect();
        delta_encode_ids(&mut ids);
        assert_eq!(ids[0], 100);
        assert!(ids[1..].iter().all(|&d| d == 1));
    }
}
