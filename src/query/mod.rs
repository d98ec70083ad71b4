//! # Query Specifications and Results
//!
//! A query is built against a table's catalog: groupings and aggregations
//! resolve field names to ids up front, so the per-record hot loop never
//! touches the name tables. Execution fans out per block, each task
//! filling a private [`QuerySpec`] copy, and the per-block partials are
//! combined, sorted, and limited afterwards (see [`aggregate`]).
//!
//! During the per-block pass, groups are keyed by a fixed-width binary
//! key: 8 little-endian bytes per grouping field holding the raw stored
//! value (int value or interned string id), `u64::MAX` for an absent
//! field. Keys become human-readable tab-joined labels only once per
//! block, when the partial is handed back.

pub mod aggregate;
pub mod cache;
pub mod filter;

pub use filter::{Filter, IntOp, SetOp, StrOp};

use eyre::{bail, Result};
use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::path::Path;

use crate::codec::SavedBlockInfo;
use crate::config::SORT_COUNT;
use crate::hist::Histogram;
use crate::records::{FieldId, FieldType, RowRecord, SlabPool, SlabShape, RecordSlab};
use crate::table::Table;

/// Aggregation operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggOp {
    /// Mean only; bucket upkeep is skipped.
    Avg,
    /// Full distribution: percentiles and bucket counts.
    Hist,
    /// Count of distinct values.
    Distinct,
}

/// One group-by field, resolved against the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grouping {
    pub name: String,
    pub field: FieldId,
    pub kind: FieldType,
}

/// One aggregation over a field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Aggregation {
    pub name: String,
    pub field: FieldId,
    pub kind: FieldType,
    pub op: AggOp,
}

/// The aggregate state of one group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupResult {
    pub group_key: String,
    /// Weighted record count.
    pub count: i64,
    /// Raw record count, ignoring weights.
    pub samples: i64,
    /// Aggregation name → histogram.
    pub hists: HashMap<String, Histogram>,
    /// Aggregation name → distinct value set. String values are folded to
    /// stable 64-bit fingerprints so sets merge across blocks.
    pub distincts: HashMap<String, HashSet<i64>>,
}

impl GroupResult {
    pub fn combine(&mut self, other: &GroupResult) {
        self.count += other.count;
        self.samples += other.samples;
        for (name, hist) in &other.hists {
            match self.hists.get_mut(name) {
                Some(existing) => existing.combine(hist),
                None => {
                    self.hists.insert(name.clone(), hist.clone());
                }
            }
        }
        for (name, values) in &other.distincts {
            self.distincts.entry(name.clone()).or_default().extend(values);
        }
    }

    pub fn distinct_count(&self, aggregation: &str) -> usize {
        self.distincts.get(aggregation).map_or(0, HashSet::len)
    }
}

pub type ResultMap = HashMap<String, GroupResult>;

/// Which columns a scan materializes, plus the slab pool for reuse.
#[derive(Default)]
pub struct LoadSpec {
    pub(crate) columns: HashSet<FieldId>,
    pub load_all: bool,
    /// Also scan the not-yet-digested ingestion log.
    pub read_ingestion_log: bool,
    recycle: bool,
    pool: SlabPool,
}

impl LoadSpec {
    pub fn new(table: &Table) -> Self {
        Self { recycle: table.options().recycle_mem, ..Default::default() }
    }

    pub fn all_columns(mut self) -> Self {
        self.load_all = true;
        self
    }

    pub fn with_ingestion_log(mut self) -> Self {
        self.read_ingestion_log = true;
        self
    }

    /// Request one column by name. The field must already exist in the
    /// catalog.
    pub fn column(&mut self, table: &Table, name: &str) -> Result<&mut Self> {
        match table.field_id(name) {
            Some(field) => {
                self.columns.insert(field);
                Ok(self)
            }
            None => bail!("cannot load unknown column {name:?}"),
        }
    }

    pub(crate) fn claim_slab(&self, shape: SlabShape) -> Option<RecordSlab> {
        if self.recycle {
            self.pool.claim(shape)
        } else {
            None
        }
    }

    pub(crate) fn recycle_slab(&self, slab: RecordSlab) {
        if self.recycle {
            self.pool.give(slab);
        }
    }
}

/// An optional callback seam for external post-processing of matched
/// records, in the shape of a map/reduce pipeline. The engine invokes it
/// once per block with that block's matched rows, combines the partials
/// pairwise, and finalizes the survivor. When no hook is configured the
/// aggregation path is unaffected.
pub trait MapReduce: Send + Sync {
    fn init(&self) -> Box<dyn Any + Send>;
    fn map(&self, partial: &mut (dyn Any + Send), matched: &[RowRecord]);
    fn combine(
        &self,
        a: Box<dyn Any + Send>,
        b: Box<dyn Any + Send>,
    ) -> Box<dyn Any + Send>;
    fn finalize(&self, partial: Box<dyn Any + Send>);
}

/// A full query: filters, groupings, aggregations, ordering, and the
/// result state filled in by execution.
#[derive(Default)]
pub struct QuerySpec {
    pub(crate) filters: Vec<Filter>,
    pub(crate) groups: Vec<Grouping>,
    pub(crate) aggregations: Vec<Aggregation>,
    /// Sort column: an aggregation name, or [`SORT_COUNT`] for raw counts.
    pub order_by: Option<String>,
    pub limit: usize,
    /// Time-bucket width; bucketing is enabled when `Some`.
    pub time_bucket: Option<i64>,
    /// Keep matched rows on each per-block partial.
    pub hold_matches: bool,

    pub results: ResultMap,
    pub time_results: BTreeMap<i64, ResultMap>,
    /// Filled by the sort pass, descending, truncated to `limit`.
    pub sorted: Vec<GroupResult>,
    /// Every group folded together, for headline totals.
    pub cumulative: Option<GroupResult>,
    pub matched: Vec<RowRecord>,
    pub matched_count: usize,
    /// Set when the distinct-group cap dropped new groups.
    pub truncated: bool,
}

impl QuerySpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn group(mut self, grouping: Grouping) -> Self {
        self.groups.push(grouping);
        self
    }

    pub fn aggregate(mut self, aggregation: Aggregation) -> Self {
        self.aggregations.push(aggregation);
        self
    }

    pub fn order_by_count(mut self) -> Self {
        self.order_by = Some(SORT_COUNT.to_string());
        self
    }

    /// The fields execution reads: filters, groups, aggregation inputs,
    /// plus the configured weight and time columns.
    pub(crate) fn referenced_fields(&self, table: &Table) -> HashSet<FieldId> {
        let mut fields = HashSet::new();
        for f in &self.filters {
            fields.insert(f.field());
        }
        for g in &self.groups {
            fields.insert(g.field);
        }
        for a in &self.aggregations {
            fields.insert(a.field);
        }
        for col in [&table.options().weight_col, &table.options().time_col] {
            if let Some(name) = col {
                if let Some(field) = table.field_id(name) {
                    fields.insert(field);
                }
            }
        }
        fields
    }

    /// A fresh spec for one block's private pass: same question, empty
    /// answer state.
    pub(crate) fn block_copy(&self) -> QuerySpec {
        QuerySpec {
            filters: self.filters.clone(),
            groups: self.groups.clone(),
            aggregations: self.aggregations.clone(),
            order_by: self.order_by.clone(),
            limit: self.limit,
            time_bucket: self.time_bucket,
            hold_matches: self.hold_matches,
            ..Default::default()
        }
    }

    /// Block pruning from metadata extents, before any column is read.
    /// Only monotone int comparisons can prove a block irrelevant.
    pub(crate) fn block_is_relevant(&self, table: &Table, info: &SavedBlockInfo) -> bool {
        for filter in &self.filters {
            let f = match filter {
                Filter::Int(f) => f,
                _ => continue,
            };
            let Some(name) = table.field_name(f.field) else { continue };
            let Some(extent) = info.int_info.get(name) else {
                // No record in this block has the field, and filters
                // reject absent fields.
                return false;
            };
            let skip = match f.op {
                IntOp::Gt => extent.max <= f.value,
                IntOp::Ge => extent.max < f.value,
                IntOp::Lt => extent.min >= f.value,
                IntOp::Le => extent.min > f.value,
                IntOp::Eq => f.value < extent.min || f.value > extent.max,
                IntOp::Ne => false,
            };
            if skip {
                return false;
            }
        }
        true
    }

    /// Does this query's engine round-trip through the result cache? HDR
    /// histograms serialize lossily relative to the combine path, so they
    /// opt out.
    pub(crate) fn cacheable(&self, table: &Table) -> bool {
        // Saved partials carry no matched rows, so a query that must hold
        // its matches cannot replay from cache.
        if self.hold_matches {
            return false;
        }
        let _ = table;
        #[cfg(feature = "hdrhist")]
        if table.options().hdr_hist {
            return false;
        }
        true
    }
}

impl Table {
    /// Resolve a group-by field. Grouping by a set column is unsupported.
    pub fn grouping(&self, name: &str) -> Result<Grouping> {
        let Some(field) = self.field_id(name) else {
            bail!("cannot group by unknown field {name:?}");
        };
        let kind = self.field_type(field).unwrap_or(FieldType::Str);
        if kind == FieldType::Set {
            bail!("cannot group by set field {name:?}");
        }
        Ok(Grouping { name: name.to_string(), field, kind })
    }

    /// Resolve an aggregation. `Avg` and `Hist` need an int input;
    /// `Distinct` also accepts strings.
    pub fn aggregation(&self, name: &str, op: AggOp) -> Result<Aggregation> {
        let Some(field) = self.field_id(name) else {
            bail!("cannot aggregate unknown field {name:?}");
        };
        let kind = self.field_type(field).unwrap_or(FieldType::Int);
        match op {
            AggOp::Avg | AggOp::Hist => {
                if kind != FieldType::Int {
                    bail!("aggregation {op:?} needs an int field, {name:?} is {kind:?}");
                }
            }
            AggOp::Distinct => {
                if kind == FieldType::Set {
                    bail!("distinct over set field {name:?} is unsupported");
                }
            }
        }
        Ok(Aggregation { name: name.to_string(), field, kind, op })
    }
}

/// Execution counters for one scan.
#[derive(Debug, Default, Clone)]
pub struct ScanStats {
    /// Matched (or, without a query, loaded) record count.
    pub count: usize,
    /// Blocks whose columns were actually read.
    pub loaded_blocks: usize,
    /// Blocks skipped by metadata pruning.
    pub skipped_blocks: usize,
    /// Blocks answered from the query cache.
    pub cached_blocks: usize,
    /// Records accounted for by cached partials.
    pub cached_count: usize,
    /// Blocks that failed to load this scan.
    pub broken_blocks: Vec<std::path::PathBuf>,
}

impl ScanStats {
    pub fn is_partial(&self) -> bool {
        !self.broken_blocks.is_empty()
    }

    pub(crate) fn note_broken(&mut self, block: &Path) {
        self.broken_blocks.push(block.to_path_buf());
    }
}
