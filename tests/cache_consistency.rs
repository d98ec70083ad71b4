//! The per-block query result cache must be invisible: cached rescans,
//! even from a fresh process, return exactly what a cold scan returns.

use shale::{AggOp, LoadSpec, QuerySpec, RowRecord, Table, TableOptions};

fn cached_options() -> TableOptions {
    TableOptions { chunk_size: 10, cached_queries: true, ..Default::default() }
}

fn seed(root: &std::path::Path, records: i64) {
    let mut t = Table::open(root, "events", cached_options()).unwrap();
    for i in 0..records {
        let mut r = RowRecord::new();
        t.add_int_field(&mut r, "latency", 100 + i % 7).unwrap();
        t.add_str_field(&mut r, "host", if i % 2 == 0 { "alpha" } else { "beta" })
            .unwrap();
        t.add_record(r);
    }
    t.save_row_store().unwrap();
    t.digest_records().unwrap();
}

fn run_query(root: &std::path::Path) -> (QuerySpec, shale::ScanStats) {
    let mut t = Table::open(root, "events", cached_options()).unwrap();
    let mut query = QuerySpec::new()
        .group(t.grouping("host").unwrap())
        .aggregate(t.aggregation("latency", AggOp::Hist).unwrap());
    let load = LoadSpec::new(&t);
    let stats = t.load_and_query(&load, Some(&mut query)).unwrap();
    (query, stats)
}

#[test]
fn cached_rescan_from_a_fresh_open_matches_the_cold_scan() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path(), 30);

    let (cold, cold_stats) = run_query(dir.path());
    assert_eq!(cold_stats.cached_blocks, 0);
    assert_eq!(cold_stats.loaded_blocks, 3);

    let (warm, warm_stats) = run_query(dir.path());
    assert_eq!(warm_stats.cached_blocks, 3);
    assert_eq!(warm_stats.loaded_blocks, 0);
    assert_eq!(warm_stats.count, cold_stats.count);

    assert_eq!(cold.results.len(), warm.results.len());
    for (key, a) in &cold.results {
        let b = &warm.results[key];
        assert_eq!(a.count, b.count);
        assert_eq!(a.samples, b.samples);
        let (ha, hb) = (&a.hists["latency"], &b.hists["latency"]);
        assert!((ha.mean() - hb.mean()).abs() < 1e-9);
        assert!((ha.std_dev() - hb.std_dev()).abs() < 1e-9);
        assert_eq!(ha.percentiles(), hb.percentiles());
        assert_eq!(ha.buckets(), hb.buckets());
    }
}

#[test]
fn new_data_after_a_cached_scan_is_still_counted() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path(), 30);
    let (_, stats) = run_query(dir.path());
    assert_eq!(stats.count, 30);

    // Another digest round: two more full blocks plus a partial one.
    seed(dir.path(), 25);

    let (query, stats) = run_query(dir.path());
    // The first three blocks replay from cache; only the new ones load.
    assert_eq!(stats.cached_blocks, 3);
    assert_eq!(stats.count, 55);
    let total: i64 = query.results.values().map(|g| g.count).sum();
    assert_eq!(total, 55);
}

#[test]
fn partial_blocks_are_never_cached() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path(), 15);

    run_query(dir.path());
    let (_, stats) = run_query(dir.path());
    // One full block replays from cache, the trailing half block reloads.
    assert_eq!(stats.cached_blocks, 1);
    assert_eq!(stats.loaded_blocks, 1);
    assert_eq!(stats.count, 15);
}

#[test]
fn different_queries_never_share_cache_entries() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path(), 30);
    run_query(dir.path());

    let mut t = Table::open(dir.path(), "events", cached_options()).unwrap();
    let mut narrow = QuerySpec::new()
        .group(t.grouping("host").unwrap())
        .filter(t.int_filter("latency", shale::IntOp::Ge, 104).unwrap());
    let load = LoadSpec::new(&t);
    let stats = t.load_and_query(&load, Some(&mut narrow)).unwrap();

    // The filtered query has its own key, so nothing replays.
    assert_eq!(stats.cached_blocks, 0);
    let total: i64 = narrow.results.values().map(|g| g.count).sum();
    // latency = 100 + i % 7, so 3 of every 7 records reach 104.
    assert!(stats.count < 30);
    assert_eq!(total as usize, stats.count);
}
