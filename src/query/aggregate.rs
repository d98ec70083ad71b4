//! The per-block record pass and the partial-result merge.
//!
//! [`filter_and_agg`] walks one loaded block: filters are compiled
//! against the block's intern tables, every surviving row is folded into
//! a group keyed by fixed-width binary bytes, and only at the end of the
//! pass are keys translated into tab-joined labels. [`combine_results`]
//! then merges per-block partials into the master spec, and
//! [`sort_results`] orders and truncates the final groups.

use eyre::{bail, Result};
use hashbrown::HashMap;

use crate::config::{GROUP_BY_WIDTH, GROUP_DELIMITER, INTERNAL_RESULT_LIMIT, SORT_COUNT};
use crate::hist::Histogram;
use crate::records::{FieldTag, FieldType, RecordSlab};
use crate::table::block::TableBlock;
use crate::table::{IntInfo, Table};

use super::filter::{self, CompiledFilter};
use super::{AggOp, Aggregation, GroupResult, Grouping, QuerySpec, ResultMap};

/// Label used when a query has no groupings.
pub const TOTAL_GROUP: &str = "total";

/// Fold a string into a stable 64-bit fingerprint so distinct sets over
/// block-local intern ids merge across blocks.
pub(crate) fn str_fingerprint(value: &str) -> i64 {
    let bytes = blake3::hash(value.as_bytes());
    let b = bytes.as_bytes();
    i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

/// The sentinel key byte pattern for an absent grouping field.
const ABSENT_KEY: u64 = u64::MAX;

fn push_group_key(key: &mut Vec<u8>, groups: &[Grouping], slab: &RecordSlab, row: usize) {
    for g in groups {
        let raw = if slab.tag(row, g.field) == FieldTag::Absent {
            ABSENT_KEY
        } else {
            match g.kind {
                FieldType::Int => slab.int(row, g.field) as u64,
                // Intern ids are non-negative and fit well below the
                // absent sentinel.
                _ => slab.str_id(row, g.field) as u32 as u64,
            }
        };
        key.extend_from_slice(&raw.to_le_bytes());
    }
}

fn translate_group_key(groups: &[Grouping], block: &TableBlock, key: &[u8]) -> String {
    if groups.is_empty() {
        return TOTAL_GROUP.to_string();
    }
    let mut label = String::new();
    for (i, g) in groups.iter().enumerate() {
        if i > 0 {
            label.push_str(GROUP_DELIMITER);
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&key[i * GROUP_BY_WIDTH..(i + 1) * GROUP_BY_WIDTH]);
        let raw = u64::from_le_bytes(raw);
        if raw == ABSENT_KEY {
            continue;
        }
        match g.kind {
            FieldType::Int => label.push_str(&(raw as i64).to_string()),
            _ => {
                if let Some(s) = block.string_for_val(g.field, raw as u32 as i32) {
                    label.push_str(s);
                }
            }
        }
    }
    label
}

struct AggPlan {
    agg: Aggregation,
    /// Extent used to size the histogram, from table info with the
    /// block's own extent as fallback.
    extent: Option<IntInfo>,
}

fn accumulate(
    group: &mut GroupResult,
    plans: &[AggPlan],
    table: &Table,
    block: &TableBlock,
    slab: &RecordSlab,
    row: usize,
    weight: i64,
) {
    group.count += weight;
    group.samples += 1;
    for plan in plans {
        if slab.tag(row, plan.agg.field) == FieldTag::Absent {
            continue;
        }
        match plan.agg.op {
            AggOp::Avg | AggOp::Hist => {
                let value = slab.int(row, plan.agg.field);
                let hist = group.hists.entry(plan.agg.name.clone()).or_insert_with(|| {
                    let extent = plan.extent.unwrap_or_else(|| IntInfo::new(value));
                    Histogram::for_extent(table.options(), &extent, plan.agg.op == AggOp::Hist)
                });
                hist.record_value(value, weight);
            }
            AggOp::Distinct => {
                let value = match plan.agg.kind {
                    FieldType::Int => slab.int(row, plan.agg.field),
                    _ => {
                        let id = slab.str_id(row, plan.agg.field);
                        match block.string_for_val(plan.agg.field, id) {
                            Some(s) => str_fingerprint(s),
                            None => continue,
                        }
                    }
                };
                group
                    .distincts
                    .entry(plan.agg.name.clone())
                    .or_default()
                    .insert(value);
            }
        }
    }
}

/// Run the filter and aggregation pass over one loaded block, filling
/// `spec`'s result state. Returns the matched record count.
pub(crate) fn filter_and_agg(
    spec: &mut QuerySpec,
    table: &Table,
    block: &TableBlock,
) -> Result<usize> {
    let Some(slab) = block.slab.as_ref() else {
        bail!("block {} has no loaded records", block.name.display());
    };

    let compiled: Vec<CompiledFilter> = filter::compile(&spec.filters, block)?;
    let weight_field = table
        .options()
        .weight_col
        .as_deref()
        .and_then(|name| table.field_id(name));
    let time_field = table
        .options()
        .time_col
        .as_deref()
        .and_then(|name| table.field_id(name));

    let plans: Vec<AggPlan> = spec
        .aggregations
        .iter()
        .map(|agg| {
            let extent = table.int_extent(agg.field).or_else(|| {
                table
                    .field_name(agg.field)
                    .and_then(|name| block.info.int_info.get(name))
                    .copied()
            });
            AggPlan { agg: agg.clone(), extent }
        })
        .collect();

    let mut results: HashMap<Vec<u8>, GroupResult> = HashMap::new();
    let mut time_results: HashMap<i64, HashMap<Vec<u8>, GroupResult>> = HashMap::new();
    let mut matched = 0usize;
    let mut key = Vec::with_capacity(spec.groups.len() * GROUP_BY_WIDTH);

    for row in 0..slab.len() {
        if !compiled.iter().all(|f| f.accepts(slab, row)) {
            continue;
        }
        matched += 1;

        let weight = match weight_field {
            Some(field) if slab.tag(row, field) == FieldTag::Int => slab.int(row, field),
            _ => 1,
        };

        key.clear();
        push_group_key(&mut key, &spec.groups, slab, row);

        // Cap distinct groups rather than memory. Existing groups keep
        // accumulating after the cap trips.
        if !results.contains_key(&key) && results.len() >= INTERNAL_RESULT_LIMIT {
            spec.truncated = true;
            continue;
        }

        let group = results.entry(key.clone()).or_default();
        accumulate(group, &plans, table, block, slab, row, weight);

        if let (Some(bucket), Some(field)) = (spec.time_bucket, time_field) {
            if slab.tag(row, field) == FieldTag::Int {
                let value = slab.int(row, field);
                let bucket_start = value / bucket * bucket;
                let group = time_results
                    .entry(bucket_start)
                    .or_default()
                    .entry(key.clone())
                    .or_default();
                accumulate(group, &plans, table, block, slab, row, weight);
            }
        }

        if spec.hold_matches {
            if let Some(record) = block.row_record(table, row) {
                spec.matched.push(record);
            }
        }
    }

    for (key, mut group) in results {
        group.group_key = translate_group_key(&spec.groups, block, &key);
        spec.results.insert(group.group_key.clone(), group);
    }
    for (bucket, groups) in time_results {
        let map = spec.time_results.entry(bucket).or_default();
        for (key, mut group) in groups {
            group.group_key = translate_group_key(&spec.groups, block, &key);
            map.insert(group.group_key.clone(), group);
        }
    }

    spec.matched_count = matched;
    Ok(matched)
}

fn merge_maps(master: &mut ResultMap, partial: ResultMap) {
    for (key, group) in partial {
        match master.get_mut(&key) {
            Some(existing) => existing.combine(&group),
            None => {
                master.insert(key, group);
            }
        }
    }
}

/// Fold one block's partial into the master spec. Not idempotent: a
/// partial must be combined exactly once.
pub(crate) fn combine_results(master: &mut QuerySpec, partial: QuerySpec) {
    let cumulative = master.cumulative.get_or_insert_with(|| GroupResult {
        group_key: "TOTAL".to_string(),
        ..Default::default()
    });
    for group in partial.results.values() {
        cumulative.combine(group);
    }

    merge_maps(&mut master.results, partial.results);
    for (bucket, groups) in partial.time_results {
        merge_maps(master.time_results.entry(bucket).or_default(), groups);
    }

    master.matched_count += partial.matched_count;
    master.matched.extend(partial.matched);
    master.truncated |= partial.truncated;
}

/// Sort the combined groups descending by the order-by column and
/// truncate to the configured limit.
pub(crate) fn sort_results(spec: &mut QuerySpec) {
    let mut sorted: Vec<GroupResult> = spec.results.values().cloned().collect();
    match spec.order_by.as_deref() {
        Some(SORT_COUNT) | None => {
            sorted.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.group_key.cmp(&b.group_key)));
        }
        Some(name) => {
            sorted.sort_by(|a, b| {
                let am = a.hists.get(name).map_or(f64::MIN, Histogram::mean);
                let bm = b.hists.get(name).map_or(f64::MIN, Histogram::mean);
                bm.total_cmp(&am).then_with(|| a.group_key.cmp(&b.group_key))
            });
        }
    }
    if spec.limit > 0 {
        sorted.truncate(spec.limit);
    }
    spec.sorted = sorted;
}
