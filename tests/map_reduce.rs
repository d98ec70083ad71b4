//! The map/reduce seam: per-block map over matched records, pairwise
//! combine, one finalize.

use std::any::Any;
use std::sync::atomic::{AtomicI64, Ordering};

use shale::{IntOp, LoadSpec, MapReduce, QuerySpec, RowRecord, Table, TableOptions};

/// Sums one int field over every matched record.
struct FieldSummer {
    field: shale::records::FieldId,
    total: AtomicI64,
    finalized: AtomicI64,
}

struct SumState(i64);

impl MapReduce for FieldSummer {
    fn init(&self) -> Box<dyn Any + Send> {
        Box::new(SumState(0))
    }

    fn map(&self, partial: &mut (dyn Any + Send), matched: &[RowRecord]) {
        if let Some(state) = partial.downcast_mut::<SumState>() {
            for record in matched {
                state.0 += record.int(self.field).unwrap_or(0);
            }
        }
    }

    fn combine(&self, a: Box<dyn Any + Send>, b: Box<dyn Any + Send>) -> Box<dyn Any + Send> {
        let a = a.downcast::<SumState>().map(|s| s.0).unwrap_or(0);
        let b = b.downcast::<SumState>().map(|s| s.0).unwrap_or(0);
        Box::new(SumState(a + b))
    }

    fn finalize(&self, partial: Box<dyn Any + Send>) {
        if let Ok(state) = partial.downcast::<SumState>() {
            self.total.store(state.0, Ordering::SeqCst);
            self.finalized.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn seeded_table(root: &std::path::Path) -> Table {
    let options = TableOptions { chunk_size: 10, ..Default::default() };
    let mut t = Table::open(root, "events", options).unwrap();
    for i in 0..30i64 {
        let mut r = RowRecord::new();
        t.add_int_field(&mut r, "value", i).unwrap();
        t.add_record(r);
    }
    t.save_row_store().unwrap();
    t.digest_records().unwrap();
    t
}

#[test]
fn hook_sees_every_matched_record_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut t = seeded_table(dir.path());

    let summer = FieldSummer {
        field: t.grouping("value").unwrap().field,
        total: AtomicI64::new(0),
        finalized: AtomicI64::new(0),
    };
    let mut query = QuerySpec::new();
    let load = LoadSpec::new(&t);
    t.load_and_query_with_hook(&load, Some(&mut query), Some(&summer)).unwrap();

    // Sum of 0..29.
    assert_eq!(summer.total.load(Ordering::SeqCst), 435);
    assert_eq!(summer.finalized.load(Ordering::SeqCst), 1);
    // The hook held matches privately; the caller never asked for them.
    assert!(query.matched.is_empty());
}

#[test]
fn hook_sees_rows_even_after_the_query_cache_is_warm() {
    let dir = tempfile::tempdir().unwrap();
    let options =
        TableOptions { chunk_size: 10, cached_queries: true, ..Default::default() };
    let mut t = Table::open(dir.path(), "events", options).unwrap();
    for i in 0..30i64 {
        let mut r = RowRecord::new();
        t.add_int_field(&mut r, "value", i).unwrap();
        t.add_record(r);
    }
    t.save_row_store().unwrap();
    t.digest_records().unwrap();

    // Warm the cache with a plain scan.
    let load = LoadSpec::new(&t);
    let mut warm = QuerySpec::new();
    t.load_and_query(&load, Some(&mut warm)).unwrap();
    let mut cached = QuerySpec::new();
    let stats = t.load_and_query(&load, Some(&mut cached)).unwrap();
    assert_eq!(stats.cached_blocks, 3);

    // Cached partials carry no rows, so the hook pass must read the blocks.
    let summer = FieldSummer {
        field: t.grouping("value").unwrap().field,
        total: AtomicI64::new(0),
        finalized: AtomicI64::new(0),
    };
    let mut query = QuerySpec::new();
    let stats =
        t.load_and_query_with_hook(&load, Some(&mut query), Some(&summer)).unwrap();
    assert_eq!(stats.cached_blocks, 0);
    assert_eq!(stats.loaded_blocks, 3);
    assert_eq!(summer.total.load(Ordering::SeqCst), 435);
    assert_eq!(summer.finalized.load(Ordering::SeqCst), 1);
}

#[test]
fn hook_respects_query_filters() {
    let dir = tempfile::tempdir().unwrap();
    let mut t = seeded_table(dir.path());

    let summer = FieldSummer {
        field: t.grouping("value").unwrap().field,
        total: AtomicI64::new(0),
        finalized: AtomicI64::new(0),
    };
    let mut query = QuerySpec::new().filter(t.int_filter("value", IntOp::Lt, 10).unwrap());
    let load = LoadSpec::new(&t);
    t.load_and_query_with_hook(&load, Some(&mut query), Some(&summer)).unwrap();

    // Sum of 0..9.
    assert_eq!(summer.total.load(Ordering::SeqCst), 45);
}
