//! # Configuration Constants and Options
//!
//! This module centralizes the tuning constants of the store and the
//! per-table runtime options. Constants that depend on each other are
//! co-located to prevent mismatch bugs.
//!
//! ## Relationships
//!
//! ```text
//! DEFAULT_CHUNK_SIZE (65536)
//!       │
//!       ├─> bucket vs. value encoding cutoff is
//!       │   chunk_size / CARDINALITY_THRESHOLD (see codec::write)
//!       │
//!       └─> slab recycling is only legal for full chunks; shrinking the
//!           chunk size in tests keeps the pool hot with tiny slabs
//!
//! LOCK_TRIES (50) × LOCK_RETRY_SLEEP (3ms)
//!       │
//!       └─> worst-case lock acquisition wait ≈ 150ms before the grab
//!           is surfaced as a failure to the caller
//!
//! MAX_LOCK_BREAKS (5)
//!       │
//!       └─> consecutive unparsable reads of a lock file tolerated before
//!           the lock is declared broken and recovery runs
//! ```

use std::time::Duration;

/// Records per immutable block. Blocks are closed at exactly this many
/// records; the remainder stays in the row store until the next digest.
pub const DEFAULT_CHUNK_SIZE: usize = 65536;

/// A column is bucket-encoded when its distinct-value count is at most
/// `chunk_size / CARDINALITY_THRESHOLD`, else value-encoded.
pub const CARDINALITY_THRESHOLD: usize = 4;

/// Bounded retries for grabbing a file lock.
pub const LOCK_TRIES: usize = 50;

/// Fixed backoff between lock grab attempts.
pub const LOCK_RETRY_SLEEP: Duration = Duration::from_millis(3);

/// Consecutive unparsable lock-file reads tolerated before the lock is
/// treated as broken. Tolerates transient partial writes by the owner.
pub const MAX_LOCK_BREAKS: u32 = 5;

/// Cap on distinct groups per result map. Once hit, new groups are dropped
/// and the query result is flagged as truncated.
pub const INTERNAL_RESULT_LIMIT: usize = 100_000;

/// Width in bytes of one grouping field inside a binary group key.
pub const GROUP_BY_WIDTH: usize = 8;

/// Separator between grouping values in a resolved group label.
pub const GROUP_DELIMITER: &str = "\t";

/// Bucket count for a basic fixed-resolution histogram.
pub const NUM_HIST_BUCKETS: usize = 1000;

/// Distinct string values retained per field in the catalog's top-value
/// table; the rest are pruned after each block save.
pub const TOP_STRING_COUNT: usize = 20;

/// Row-log file count above which a digest is triggered.
pub const FILE_DIGEST_THRESHOLD: usize = 256;

/// Row-log byte size (in KB) above which a digest is triggered.
pub const SIZE_DIGEST_THRESHOLD_KB: u64 = 2048;

/// Block metadata entries per table-level cache file.
pub const BLOCKS_PER_CACHE_FILE: usize = 64;

/// Suffix of transparently compressed on-disk files.
pub const GZIP_EXT: &str = ".gz";

/// Name of the row-store directory inside a table directory.
pub const INGEST_DIR: &str = "ingest";

/// Prefix of the temp directory row logs are moved into during a digest.
pub const STOMACHE_DIR: &str = "stomache";

/// Name of the table-level block metadata cache directory.
pub const CACHE_DIR: &str = "cache";

/// Reserved block name for the in-memory row store.
pub const ROW_STORE_BLOCK: &str = "ROW_STORE";

/// Order-by column name that sorts results by raw match count instead of
/// an aggregation's mean.
pub const SORT_COUNT: &str = "$COUNT";

/// Per-table runtime options.
///
/// All ambient query configuration lives here and is passed into the
/// engine's entry points explicitly; there are no process-wide flags, so
/// concurrent tables and concurrent tests do not interfere.
#[derive(Debug, Clone)]
pub struct TableOptions {
    /// Records per immutable block.
    pub chunk_size: usize,
    /// Delta-encode record ids inside bucket-encoded columns.
    pub delta_encode_record_ids: bool,
    /// Delta-encode int values inside value-encoded columns.
    pub delta_encode_int_values: bool,
    /// Recycle full-chunk record slabs through the load spec's pool.
    pub recycle_mem: bool,
    /// Persist and consult the per-block query result cache.
    pub cached_queries: bool,
    /// Never trigger a digest from the ingestion path.
    pub skip_compact: bool,
    /// Refresh catalog min/max statistics from column data during loads.
    pub update_table_info: bool,
    /// Use the multi-resolution histogram for `hist` aggregations.
    pub log_hist: bool,
    /// Use the high-dynamic-range histogram when compiled in; silently
    /// falls back to the basic/multi selection otherwise.
    pub hdr_hist: bool,
    /// Column whose int value weights count and histogram updates.
    pub weight_col: Option<String>,
    /// Column holding record timestamps, used for time bucketing and for
    /// sorting records before compaction.
    pub time_col: Option<String>,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            delta_encode_record_ids: true,
            delta_encode_int_values: true,
            recycle_mem: true,
            cached_queries: false,
            skip_compact: false,
            update_table_info: false,
            log_hist: false,
            hdr_hist: false,
            weight_col: None,
            time_col: None,
        }
    }
}

impl TableOptions {
    /// Distinct-value cutoff between bucket and value encoding.
    pub fn bucket_cutoff(&self) -> usize {
        (self.chunk_size / CARDINALITY_THRESHOLD).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_cutoff_scales_with_chunk_size() {
        let mut opts = TableOptions::default();
        assert_eq!(opts.bucket_cutoff(), DEFAULT_CHUNK_SIZE / 4);

        opts.chunk_size = 100;
        assert_eq!(opts.bucket_cutoff(), 25);

        opts.chunk_size = 2;
        assert_eq!(opts.bucket_cutoff(), 1, "cutoff never reaches zero");
    }
}
