//! # Shale - Embedded Columnar Analytics Store
//!
//! Shale is an embedded, append-friendly columnar store for analytics
//! workloads: ingest loosely structured records fast, then answer
//! group-by/aggregate queries over millions of rows without a server.
//! This implementation prioritizes:
//!
//! - **Write-path simplicity**: new records land in an append-only row
//!   store and are compacted into immutable column blocks later
//! - **Scan speed**: per-block metadata pruning, parallel block passes,
//!   and a per-block query result cache
//! - **Crash tolerance**: every multi-file mutation is staged and swapped
//!   atomically, guarded by recoverable PID lock files
//!
//! ## Quick Start
//!
//! ```ignore
//! use shale::{AggOp, LoadSpec, QuerySpec, Table, TableOptions};
//!
//! let mut table = Table::open("./data".as_ref(), "events", TableOptions::default())?;
//!
//! let mut record = shale::RowRecord::new();
//! table.add_int_field(&mut record, "latency", 123)?;
//! table.add_str_field(&mut record, "host", "alpha")?;
//! table.add_record(record);
//! table.save_row_store()?;
//! table.digest_records()?;
//!
//! let mut query = QuerySpec::new()
//!     .group(table.grouping("host")?)
//!     .aggregate(table.aggregation("latency", AggOp::Hist)?);
//! table.load_and_query(&LoadSpec::new(&table), Some(&mut query))?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │      Public API (Table, QuerySpec)   │
//! ├─────────────────────────────────────┤
//! │  Scan Engine (prune/load/aggregate)  │
//! ├───────────────────┬─────────────────┤
//! │  Row Store Ingest │  Query Cache     │
//! ├───────────────────┴─────────────────┤
//! │   Column Codec (bucket/delta/gzip)   │
//! ├─────────────────────────────────────┤
//! │  Block Directories + PID Lock Files  │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! One directory per table, one directory per block:
//!
//! ```text
//! table_dir/
//! ├── info.db              # Catalog: field names, types, extents
//! ├── ingest/              # Append-only row store logs
//! ├── cache/               # Block metadata cache files
//! ├── block8GK1x2/         # One immutable column block
//! │   ├── info.db          # Record count and per-column extents
//! │   ├── int_latency.db   # One file per column
//! │   ├── str_host.db.gz
//! │   └── cache/           # Per-block query result cache
//! └── digest.lock          # Recoverable PID lock files
//! ```
//!
//! ## Module Overview
//!
//! - [`table`]: catalog, blocks, ingestion, scans, lock recovery
//! - [`query`]: filters, groupings, aggregations, result cache
//! - [`codec`]: column encodings and block (de)serialization
//! - [`hist`]: mergeable histograms behind the `hist` aggregations
//! - [`locks`]: PID lock files with dead-owner recovery
//! - [`records`]: row records, the columnar record slab, slab pooling
//! - [`config`]: tuning constants and [`TableOptions`](config::TableOptions)

pub mod codec;
pub mod config;
pub mod hist;
pub mod locks;
pub mod query;
pub mod records;
pub mod table;

pub use config::TableOptions;
pub use query::{
    AggOp, Filter, GroupResult, IntOp, LoadSpec, MapReduce, QuerySpec, ScanStats, SetOp, StrOp,
};
pub use records::{FieldType, RowRecord};
pub use table::Table;
