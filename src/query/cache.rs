//! Per-block query result cache.
//!
//! A block that has reached full chunk size never changes again, so its
//! partial result for a given query can be stored beside it and replayed
//! on later scans. The cache key hashes the query's block-relevant shape:
//! filters clamped against the block's extents, group and aggregation
//! definitions, ordering, limit, and time bucket. Clamping matters for
//! hit rate: a filter the block's metadata already proves true for every
//! record does not change the answer and must not change the key.
//!
//! Saved partials hold pre-combine state. Replaying one feeds
//! [`combine_results`](super::aggregate::combine_results) exactly as a
//! fresh block pass would, which is why partials are saved before they
//! are combined.

use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::codec::{self, SavedBlockInfo};
use crate::config::{CACHE_DIR, GZIP_EXT};
use crate::table::Table;

use super::{Aggregation, Filter, IntOp, QuerySpec, ResultMap};

/// One block's saved partial for one query shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SavedQueryResults {
    pub results: ResultMap,
    pub time_results: BTreeMap<i64, ResultMap>,
    pub matched_count: usize,
}

/// The canonical bytes behind a cache key.
#[derive(Serialize)]
struct CacheKeySpec<'a> {
    filters: Vec<&'a Filter>,
    groups: Vec<&'a str>,
    aggregations: &'a [Aggregation],
    order_by: &'a Option<String>,
    limit: usize,
    time_bucket: Option<i64>,
}

/// Is this filter provably true for every record of the block? Requires
/// the field to be populated on every record, since filters reject
/// absent fields.
fn filter_is_trivial(filter: &Filter, table: &Table, info: &SavedBlockInfo) -> bool {
    let Filter::Int(f) = filter else { return false };
    let Some(name) = table.field_name(f.field) else { return false };
    let Some(extent) = info.int_info.get(name) else { return false };
    if extent.count != i64::from(info.num_records) {
        return false;
    }
    match f.op {
        IntOp::Gt => extent.min > f.value,
        IntOp::Ge => extent.min >= f.value,
        IntOp::Lt => extent.max < f.value,
        IntOp::Le => extent.max <= f.value,
        IntOp::Eq => extent.min == f.value && extent.max == f.value,
        IntOp::Ne => f.value < extent.min || f.value > extent.max,
    }
}

/// This block's cache key for the query: a blake3 hex digest of the
/// clamped query shape.
pub(crate) fn cache_key(spec: &QuerySpec, table: &Table, info: &SavedBlockInfo) -> Result<String> {
    let clamped: Vec<&Filter> = spec
        .filters
        .iter()
        .filter(|f| !filter_is_trivial(f, table, info))
        .collect();
    let key_spec = CacheKeySpec {
        filters: clamped,
        groups: spec.groups.iter().map(|g| g.name.as_str()).collect(),
        aggregations: &spec.aggregations,
        order_by: &spec.order_by,
        limit: spec.limit,
        time_bucket: spec.time_bucket,
    };
    let bytes = bincode::serialize(&key_spec).wrap_err("serializing cache key")?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

fn cache_file(block: &Path, key: &str) -> PathBuf {
    block.join(CACHE_DIR).join(format!("{key}.db"))
}

/// Load a saved partial if one exists and still decodes. A stale or
/// corrupt entry reads as a miss.
pub(crate) fn load_cached_results(block: &Path, key: &str) -> Option<SavedQueryResults> {
    let path = cache_file(block, key);
    match codec::decode_file::<SavedQueryResults>(&path) {
        Ok(saved) => {
            debug!(block = %block.display(), key, "query cache hit");
            Some(saved)
        }
        Err(_) => None,
    }
}

/// Save one block's pre-combine partial. Written to a temp file and
/// renamed so concurrent readers never see a torn entry.
pub(crate) fn save_cached_results(block: &Path, key: &str, spec: &QuerySpec) -> Result<()> {
    let cache_dir = block.join(CACHE_DIR);
    std::fs::create_dir_all(&cache_dir)?;

    let saved = SavedQueryResults {
        results: spec.results.clone(),
        time_results: spec.time_results.clone(),
        matched_count: spec.matched_count,
    };

    let temp = tempfile::Builder::new()
        .prefix("qcache")
        .tempfile_in(&cache_dir)
        .wrap_err("creating query cache temp file")?;
    codec::encode_file(temp.path(), &saved, true)?;
    // Persist under the gzip spelling so readers decompress it.
    let path = cache_dir.join(format!("{key}.db{GZIP_EXT}"));
    temp.persist(&path)
        .wrap_err_with(|| format!("publishing query cache entry {}", path.display()))?;
    debug!(block = %block.display(), key, "query cache entry saved");
    Ok(())
}

/// Replay a saved partial as if the block pass had just run.
pub(crate) fn partial_from_saved(spec: &QuerySpec, saved: SavedQueryResults) -> QuerySpec {
    let mut partial = spec.block_copy();
    partial.results = saved.results;
    partial.time_results = saved.time_results;
    partial.matched_count = saved.matched_count;
    partial
}
