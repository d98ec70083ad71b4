//! Table scans: block pruning, parallel loading, per-block aggregation,
//! and the final combine.
//!
//! ```text
//! list blocks ──▶ prune by metadata ──▶ per-block pass (rayon)
//!                                        │  cache hit? replay saved partial
//!                                        │  else load columns + aggregate
//!                                        ▼
//!                      combine partials ──▶ sort ──▶ ScanStats
//! ```
//!
//! Each worker fills a private [`QuerySpec`] copy, so the hot loop takes
//! no locks; partials are merged sequentially afterwards. A block that
//! fails to load is recorded in the stats and skipped, so one damaged
//! block degrades a scan instead of failing it.

use eyre::Result;
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::any::Any;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::codec::SavedBlockInfo;
use crate::config::ROW_STORE_BLOCK;
use crate::query::aggregate;
use crate::query::cache as query_cache;
use crate::query::{LoadSpec, MapReduce, QuerySpec, ScanStats};
use crate::records::{FieldId, RecordSlab, RowRecord};

use super::block::{file_looks_like_block, TableBlock, TableColumn};
use super::Table;

impl Table {
    /// Load every (requested) column of every block, without a query.
    pub fn load_records(&mut self, load: &LoadSpec) -> Result<ScanStats> {
        self.load_and_query(load, None)
    }

    /// Run a full scan, aggregating into `query` when one is given.
    pub fn load_and_query(
        &mut self,
        load: &LoadSpec,
        query: Option<&mut QuerySpec>,
    ) -> Result<ScanStats> {
        self.load_and_query_with_hook(load, query, None)
    }

    /// Full scan with an optional map/reduce hook over matched records.
    pub fn load_and_query_with_hook(
        &mut self,
        load: &LoadSpec,
        query: Option<&mut QuerySpec>,
        hook: Option<&dyn MapReduce>,
    ) -> Result<ScanStats> {
        self.load_block_cache();
        if !self.load_table_info() {
            self.has_flag_file();
        }

        let blocks = self.list_blocks()?;

        if self.options.update_table_info {
            // Rebuild catalog statistics from block metadata instead of
            // trusting the saved catalog.
            self.int_info.clear();
            self.str_info.clear();
            for block in &blocks {
                if let Ok(info) = self.load_block_info_cached(block) {
                    self.merge_block_info(&info);
                }
            }
        }

        let wanted = self.wanted_fields(load, query.as_deref());
        let chunk_size = self.options.chunk_size;
        // A hook needs every block's matched rows, which cached partials
        // cannot provide.
        let use_cache = self.options.cached_queries
            && hook.is_none()
            && query.as_deref().is_some_and(|q| q.cacheable(self));
        let qref: Option<&QuerySpec> = query.as_deref();

        let partials: Mutex<Vec<QuerySpec>> = Mutex::new(Vec::new());
        let hook_states: Mutex<Vec<Box<dyn Any + Send>>> = Mutex::new(Vec::new());
        let stats: Mutex<ScanStats> = Mutex::new(ScanStats::default());

        blocks.par_iter().for_each(|block| {
            let info = match self.load_block_info_cached(block) {
                Ok(info) => info,
                Err(err) => {
                    warn!(block = %block.display(), %err, "cannot read block metadata");
                    stats.lock().note_broken(block);
                    return;
                }
            };

            if let Some(q) = qref {
                if !q.block_is_relevant(self, &info) {
                    stats.lock().skipped_blocks += 1;
                    return;
                }
                if use_cache {
                    if let Ok(key) = query_cache::cache_key(q, self, &info) {
                        if let Some(saved) = query_cache::load_cached_results(block, &key) {
                            let mut s = stats.lock();
                            s.cached_blocks += 1;
                            s.cached_count += saved.matched_count;
                            drop(s);
                            partials.lock().push(query_cache::partial_from_saved(q, saved));
                            return;
                        }
                    }
                }
            }

            let mut loaded = match self.load_block_from_dir(block, wanted.as_ref(), Some(load)) {
                Ok(loaded) => loaded,
                Err(err) => {
                    warn!(block = %block.display(), %err, "cannot load block");
                    stats.lock().note_broken(block);
                    return;
                }
            };
            stats.lock().loaded_blocks += 1;

            match qref {
                Some(q) => {
                    let mut partial = q.block_copy();
                    if hook.is_some() {
                        partial.hold_matches = true;
                    }
                    match aggregate::filter_and_agg(&mut partial, self, &loaded) {
                        Ok(_) => {
                            // Saved before combining: combine is not
                            // idempotent, so a replay must start from the
                            // pristine per-block state.
                            if use_cache && info.num_records as usize >= chunk_size {
                                if let Ok(key) = query_cache::cache_key(q, self, &info) {
                                    if let Err(err) =
                                        query_cache::save_cached_results(block, &key, &partial)
                                    {
                                        debug!(block = %block.display(), %err, "query cache save failed");
                                    }
                                }
                            }
                            if let Some(h) = hook {
                                let mut state = h.init();
                                h.map(&mut *state, &partial.matched);
                                hook_states.lock().push(state);
                                if !q.hold_matches {
                                    partial.matched.clear();
                                }
                            }
                            partials.lock().push(partial);
                        }
                        Err(err) => {
                            warn!(block = %block.display(), %err, "block pass failed");
                            stats.lock().note_broken(block);
                        }
                    }
                }
                None => {
                    stats.lock().count += loaded.len();
                }
            }

            if loaded.len() >= chunk_size {
                if let Some(slab) = loaded.slab.take() {
                    load.recycle_slab(slab);
                }
            }
        });

        let mut stats = stats.into_inner();

        if load.read_ingestion_log {
            let rows = self.load_row_store()?;
            if !rows.is_empty() {
                match qref {
                    Some(q) => {
                        let block = self.block_from_rows(&rows);
                        let mut partial = q.block_copy();
                        if hook.is_some() {
                            partial.hold_matches = true;
                        }
                        aggregate::filter_and_agg(&mut partial, self, &block)?;
                        if let Some(h) = hook {
                            let mut state = h.init();
                            h.map(&mut *state, &partial.matched);
                            hook_states.lock().push(state);
                            if !q.hold_matches {
                                partial.matched.clear();
                            }
                        }
                        partials.lock().push(partial);
                    }
                    None => stats.count += rows.len(),
                }
            }
        }

        if let Some(q) = query {
            for partial in partials.into_inner() {
                aggregate::combine_results(q, partial);
            }
            aggregate::sort_results(q);
            stats.count = q.matched_count;
        }

        if let Some(h) = hook {
            let mut states = hook_states.into_inner();
            while states.len() > 1 {
                if let (Some(b), Some(a)) = (states.pop(), states.pop()) {
                    states.push(h.combine(a, b));
                }
            }
            if let Some(state) = states.pop() {
                h.finalize(state);
            }
        }

        self.write_block_cache();
        Ok(stats)
    }

    /// Pull raw matching records, newest blocks first, stopping as soon
    /// as `limit` matches are in hand. The row store is scanned first
    /// since its records are newest of all.
    pub fn load_samples(
        &mut self,
        load: &LoadSpec,
        query: &mut QuerySpec,
        limit: usize,
    ) -> Result<ScanStats> {
        self.load_block_cache();
        if !self.load_table_info() {
            self.has_flag_file();
        }
        query.hold_matches = true;

        let mut stats = ScanStats::default();
        let wanted = self.wanted_fields(load, Some(query));

        if load.read_ingestion_log {
            let rows = self.load_row_store()?;
            if !rows.is_empty() {
                let block = self.block_from_rows(&rows);
                let mut partial = query.block_copy();
                partial.hold_matches = true;
                aggregate::filter_and_agg(&mut partial, self, &block)?;
                aggregate::combine_results(query, partial);
            }
        }

        let mut blocks = self.list_blocks()?;
        // Newest first, by directory mtime.
        blocks.sort_by_key(|b| {
            std::cmp::Reverse(fs::metadata(b).and_then(|m| m.modified()).ok())
        });

        for block in blocks {
            if query.matched.len() >= limit {
                break;
            }
            let Ok(info) = self.load_block_info_cached(&block) else {
                stats.note_broken(&block);
                continue;
            };
            if !query.block_is_relevant(self, &info) {
                stats.skipped_blocks += 1;
                continue;
            }
            let loaded = match self.load_block_from_dir(&block, wanted.as_ref(), Some(load)) {
                Ok(loaded) => loaded,
                Err(err) => {
                    warn!(block = %block.display(), %err, "cannot load block");
                    stats.note_broken(&block);
                    continue;
                }
            };
            stats.loaded_blocks += 1;
            let mut partial = query.block_copy();
            partial.hold_matches = true;
            aggregate::filter_and_agg(&mut partial, self, &loaded)?;
            aggregate::combine_results(query, partial);
        }

        query.matched.truncate(limit);
        stats.count = query.matched.len();
        Ok(stats)
    }

    fn list_blocks(&self) -> Result<Vec<PathBuf>> {
        let mut blocks = Vec::new();
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Ok(blocks);
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if file_looks_like_block(&name) && entry.path().is_dir() {
                blocks.push(entry.path());
            }
        }
        blocks.sort();
        Ok(blocks)
    }

    fn wanted_fields(
        &self,
        load: &LoadSpec,
        query: Option<&QuerySpec>,
    ) -> Option<HashSet<FieldId>> {
        if load.load_all {
            return None;
        }
        let mut fields = load.columns.clone();
        if let Some(q) = query {
            fields.extend(q.referenced_fields(self));
        }
        // No explicit request at all means load everything.
        if fields.is_empty() {
            None
        } else {
            Some(fields)
        }
    }

    /// Assemble the not-yet-digested row store into an in-memory block so
    /// the same per-block pass covers it.
    fn block_from_rows(&self, rows: &[RowRecord]) -> TableBlock {
        let shape = self.slab_shape(rows.len(), None);
        let mut slab = RecordSlab::allocate(shape);
        let mut columns: HashMap<FieldId, TableColumn> = HashMap::new();

        for (row, record) in rows.iter().enumerate() {
            for &(field, value) in &record.ints {
                slab.put_int(row, field, value);
            }
            for (field, value) in &record.strs {
                let id = columns.entry(*field).or_default().val_id(value);
                slab.put_str(row, *field, id);
            }
            for (field, values) in &record.sets {
                for value in values {
                    let id = columns.entry(*field).or_default().val_id(value);
                    slab.push_set_val(row, *field, id);
                }
            }
        }

        let info = SavedBlockInfo { num_records: rows.len() as i32, ..Default::default() };
        TableBlock { name: PathBuf::from(ROW_STORE_BLOCK), info, slab: Some(slab), columns }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableOptions;
    use crate::locks::FixedLiveness;
    use crate::query::{AggOp, IntOp};
    use std::path::Path;
    use std::sync::Arc;

    fn seeded_table(dir: &Path, records: i64, options: TableOptions) -> Table {
        let mut t = Table::open_with_liveness(
            dir,
            "metrics",
            options,
            Arc::new(FixedLiveness { alive: true }),
        )
        .unwrap();
        for i in 0..records {
            let mut r = RowRecord::new();
            t.add_int_field(&mut r, "latency", 100 + i % 50).unwrap();
            t.add_str_field(&mut r, "host", if i % 3 == 0 { "alpha" } else { "beta" })
                .unwrap();
            t.add_record(r);
        }
        t.save_row_store().unwrap();
        t.digest_records().unwrap();
        t
    }

    fn small_options() -> TableOptions {
        TableOptions { chunk_size: 10, ..Default::default() }
    }

    #[test]
    fn plain_load_counts_every_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = seeded_table(dir.path(), 30, small_options());

        let load = LoadSpec::new(&t).all_columns();
        let stats = t.load_records(&load).unwrap();
        assert_eq!(stats.count, 30);
        assert_eq!(stats.loaded_blocks, 3);
        assert!(!stats.is_partial());
    }

    #[test]
    fn grouped_query_aggregates_across_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = seeded_table(dir.path(), 30, small_options());

        let mut query = QuerySpec::new()
            .group(t.grouping("host").unwrap())
            .aggregate(t.aggregation("latency", AggOp::Avg).unwrap());
        let load = LoadSpec::new(&t);
        let stats = t.load_and_query(&load, Some(&mut query)).unwrap();

        assert_eq!(stats.count, 30);
        assert_eq!(query.results["alpha"].count, 10);
        assert_eq!(query.results["beta"].count, 20);
        assert_eq!(query.cumulative.as_ref().unwrap().count, 30);
    }

    #[test]
    fn metadata_pruning_skips_irrelevant_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = seeded_table(dir.path(), 30, small_options());

        let mut query = QuerySpec::new().filter(t.int_filter("latency", IntOp::Gt, 10_000).unwrap());
        let load = LoadSpec::new(&t);
        let stats = t.load_and_query(&load, Some(&mut query)).unwrap();

        assert_eq!(stats.count, 0);
        assert_eq!(stats.skipped_blocks, 3);
        assert_eq!(stats.loaded_blocks, 0);
    }

    #[test]
    fn ingestion_log_rows_are_scannable_before_digest() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = seeded_table(dir.path(), 20, small_options());

        let mut r = RowRecord::new();
        t.add_int_field(&mut r, "latency", 140).unwrap();
        t.add_str_field(&mut r, "host", "gamma").unwrap();
        t.add_record(r);
        t.save_row_store().unwrap();

        let mut query = QuerySpec::new().group(t.grouping("host").unwrap());
        let load = LoadSpec::new(&t).with_ingestion_log();
        let stats = t.load_and_query(&load, Some(&mut query)).unwrap();

        assert_eq!(stats.count, 21);
        assert_eq!(query.results["gamma"].count, 1);
    }

    #[test]
    fn cached_rescan_matches_the_cold_scan() {
        let dir = tempfile::tempdir().unwrap();
        let options = TableOptions { cached_queries: true, ..small_options() };
        let mut t = seeded_table(dir.path(), 30, options);

        let build = |t: &Table| {
            QuerySpec::new()
                .group(t.grouping("host").unwrap())
                .aggregate(t.aggregation("latency", AggOp::Avg).unwrap())
        };

        let mut cold = build(&t);
        let load = LoadSpec::new(&t);
        t.load_and_query(&load, Some(&mut cold)).unwrap();

        let mut warm = build(&t);
        let stats = t.load_and_query(&load, Some(&mut warm)).unwrap();

        assert_eq!(stats.cached_blocks, 3);
        assert_eq!(stats.loaded_blocks, 0);
        for (key, group) in &cold.results {
            let other = &warm.results[key];
            assert_eq!(group.count, other.count);
            for (name, hist) in &group.hists {
                assert!((hist.mean() - other.hists[name].mean()).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn samples_stop_early_at_the_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = seeded_table(dir.path(), 30, small_options());

        let mut query = QuerySpec::new();
        let load = LoadSpec::new(&t);
        let stats = t.load_samples(&load, &mut query, 12).unwrap();

        assert_eq!(query.matched.len(), 12);
        assert!(stats.loaded_blocks < 3 || stats.count == 12);
    }

    #[test]
    fn broken_blocks_degrade_the_scan_instead_of_failing_it() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = seeded_table(dir.path(), 30, small_options());

        // Corrupt one block's metadata.
        let block = t.list_blocks().unwrap().remove(0);
        std::fs::write(block.join("info.db"), b"garbage").unwrap();
        t.block_info_cache.lock().clear();

        let mut query = QuerySpec::new();
        let load = LoadSpec::new(&t);
        let stats = t.load_and_query(&load, Some(&mut query)).unwrap();

        assert!(stats.is_partial());
        assert_eq!(stats.broken_blocks.len(), 1);
        assert_eq!(stats.count, 20);
    }
}
