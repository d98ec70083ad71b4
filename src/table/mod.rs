//! # Tables
//!
//! A table is a directory of immutable column blocks plus a row-format
//! ingestion log, coordinated across processes by advisory PID locks:
//!
//! ```text
//! <root>/<table>/
//!     info.db             catalog: field names, types, column extents
//!     info.bak            previous catalog, for crash recovery
//!     info.db.exists      flag: this table has saved a catalog before
//!     block527396.../     one immutable block of up to chunk_size records
//!     ingest/             row-format append log awaiting digestion
//!     stomache.xyz/       rows mid-digestion (crash leaves them here)
//!     cache/              block metadata + per-block query result cache
//!     <resource>.lock     advisory locks, one per protected resource
//! ```
//!
//! The `Table` value holds the catalog, pending rows, and lock bookkeeping.
//! Field ids are dense `u16`s assigned at registration; a field's type is
//! fixed forever, and re-registering under a different type is an error.
//!
//! Submodules split the lifecycle: [`ingest`] appends and digests rows,
//! [`block`] loads saved blocks, [`scan`] runs queries, [`info`] persists
//! the catalog.

pub mod block;
pub mod info;
pub mod ingest;
pub mod scan;

use eyre::{bail, Result};
use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::codec::SavedBlockInfo;
use crate::config::{TableOptions, CACHE_DIR, INGEST_DIR, TOP_STRING_COUNT};
use crate::locks::{GrabResult, Liveness, LockManager, OsLiveness, Resource};
use crate::records::{FieldId, FieldType, RowRecord};

/// Running extent and population count for one int column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntInfo {
    pub min: i64,
    pub max: i64,
    pub count: i64,
}

impl IntInfo {
    pub fn new(value: i64) -> Self {
        Self { min: value, max: value, count: 1 }
    }

    pub fn update(&mut self, value: i64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.count += 1;
    }

    pub fn merge(&mut self, other: &IntInfo) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.count += other.count;
    }
}

/// Cardinality estimate and most-frequent values for one string column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrInfo {
    pub cardinality: usize,
    pub top_values: HashMap<String, i64>,
}

impl StrInfo {
    /// Account one distinct value with its occurrence count.
    pub fn observe(&mut self, value: &str, count: i64) {
        if !self.top_values.contains_key(value) {
            self.cardinality += 1;
        }
        *self.top_values.entry(value.to_string()).or_insert(0) += count;
    }

    /// Keep only the most frequent values. Cardinality keeps counting
    /// values that were pruned away.
    pub fn prune(&mut self) {
        if self.top_values.len() <= TOP_STRING_COUNT {
            return;
        }
        let mut counts: Vec<(String, i64)> = self.top_values.drain().collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        counts.truncate(TOP_STRING_COUNT);
        self.top_values = counts.into_iter().collect();
    }

    pub fn merge(&mut self, other: &StrInfo) {
        for (value, count) in &other.top_values {
            *self.top_values.entry(value.clone()).or_insert(0) += count;
        }
        self.cardinality = self.cardinality.max(other.cardinality);
        self.prune();
    }
}

/// One table: catalog, pending rows, and directory bookkeeping.
pub struct Table {
    name: String,
    dir: PathBuf,
    options: TableOptions,
    pub(crate) key_table: HashMap<String, FieldId>,
    /// Field id → name; the inverse of `key_table`.
    pub(crate) key_names: Vec<String>,
    pub(crate) key_types: HashMap<FieldId, FieldType>,
    pub(crate) int_info: HashMap<FieldId, IntInfo>,
    pub(crate) str_info: HashMap<FieldId, StrInfo>,
    pub(crate) new_records: Vec<RowRecord>,
    /// Block path → metadata, filled from the cache dir and from loads.
    pub(crate) block_info_cache: Mutex<HashMap<PathBuf, SavedBlockInfo>>,
    /// Blocks whose metadata is not yet persisted to the cache dir.
    pub(crate) new_block_infos: Mutex<Vec<PathBuf>>,
    pub(crate) locks: LockManager,
}

impl Table {
    /// Open (or create the directory of) a table under `root`.
    pub fn open(root: &Path, name: &str, options: TableOptions) -> Result<Self> {
        Self::open_with_liveness(root, name, options, Arc::new(OsLiveness))
    }

    /// Like [`Table::open`] with an explicit liveness probe, so tests can
    /// simulate dead lock owners.
    pub fn open_with_liveness(
        root: &Path,
        name: &str,
        options: TableOptions,
        liveness: Arc<dyn Liveness>,
    ) -> Result<Self> {
        if name.is_empty() || name.contains('/') {
            bail!("invalid table name {name:?}");
        }
        let dir = root.join(name);
        fs::create_dir_all(&dir)?;

        Ok(Self {
            name: name.to_string(),
            locks: LockManager::new(dir.clone(), liveness),
            dir,
            options,
            key_table: HashMap::new(),
            key_names: Vec::new(),
            key_types: HashMap::new(),
            int_info: HashMap::new(),
            str_info: HashMap::new(),
            new_records: Vec::new(),
            block_info_cache: Mutex::new(HashMap::new()),
            new_block_infos: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn options(&self) -> &TableOptions {
        &self.options
    }

    pub(crate) fn cache_dir(&self) -> PathBuf {
        self.dir.join(CACHE_DIR)
    }

    pub(crate) fn ingest_dir(&self) -> PathBuf {
        self.dir.join(INGEST_DIR)
    }

    // ---- catalog ----------------------------------------------------

    pub fn field_id(&self, name: &str) -> Option<FieldId> {
        self.key_table.get(name).copied()
    }

    pub fn field_name(&self, id: FieldId) -> Option<&str> {
        self.key_names.get(id as usize).map(String::as_str)
    }

    pub fn field_type(&self, id: FieldId) -> Option<FieldType> {
        self.key_types.get(&id).copied()
    }

    pub fn field_count(&self) -> usize {
        self.key_names.len()
    }

    /// Table-wide extent for an int field, when the catalog has seen one.
    pub fn int_extent(&self, id: FieldId) -> Option<IntInfo> {
        self.int_info.get(&id).copied()
    }

    /// Register a field, or confirm its existing registration. A type
    /// conflict is fatal: silently coercing would corrupt saved blocks.
    pub fn get_or_create_key(&mut self, name: &str, kind: FieldType) -> Result<FieldId> {
        if let Some(&id) = self.key_table.get(name) {
            let existing = self.key_types[&id];
            if existing != kind {
                bail!(
                    "field {name:?} is registered as {existing:?}, refusing to treat it as {kind:?}"
                );
            }
            return Ok(id);
        }

        let id = self.key_names.len() as FieldId;
        self.key_table.insert(name.to_string(), id);
        self.key_names.push(name.to_string());
        self.key_types.insert(id, kind);
        Ok(id)
    }

    pub fn add_int_field(
        &mut self,
        record: &mut RowRecord,
        name: &str,
        value: i64,
    ) -> Result<()> {
        let id = self.get_or_create_key(name, FieldType::Int)?;
        record.ints.push((id, value));
        Ok(())
    }

    pub fn add_str_field(
        &mut self,
        record: &mut RowRecord,
        name: &str,
        value: &str,
    ) -> Result<()> {
        let id = self.get_or_create_key(name, FieldType::Str)?;
        record.strs.push((id, value.to_string()));
        Ok(())
    }

    pub fn add_set_field(
        &mut self,
        record: &mut RowRecord,
        name: &str,
        values: Vec<String>,
    ) -> Result<()> {
        let id = self.get_or_create_key(name, FieldType::Set)?;
        record.sets.push((id, values));
        Ok(())
    }

    /// Queue a finished record for the next flush.
    pub fn add_record(&mut self, record: RowRecord) {
        self.new_records.push(record);
    }

    pub fn pending_records(&self) -> usize {
        self.new_records.len()
    }

    /// Fold one block's metadata into the table-level catalog extents.
    pub(crate) fn merge_block_info(&mut self, info: &SavedBlockInfo) {
        for (name, int_info) in &info.int_info {
            if let Some(&id) = self.key_table.get(name.as_str()) {
                self.int_info
                    .entry(id)
                    .and_modify(|existing| existing.merge(int_info))
                    .or_insert(*int_info);
            }
        }
        for (name, str_info) in &info.str_info {
            if let Some(&id) = self.key_table.get(name.as_str()) {
                self.str_info
                    .entry(id)
                    .and_modify(|existing| existing.merge(str_info))
                    .or_insert_with(|| str_info.clone());
            }
        }
    }

    // ---- locks ------------------------------------------------------

    /// Grab the catalog lock, running recovery if a previous holder died
    /// mid-save.
    pub fn grab_info_lock(&mut self) -> bool {
        match self.locks.grab(&Resource::Info) {
            GrabResult::Grabbed => true,
            GrabResult::Failed => false,
            GrabResult::NeedsRecovery => self.recover_info_lock(),
        }
    }

    pub fn release_info_lock(&self) -> bool {
        self.locks.release(&Resource::Info)
    }

    pub fn grab_digest_lock(&mut self) -> bool {
        match self.locks.grab(&Resource::Digest) {
            GrabResult::Grabbed => true,
            GrabResult::Failed => false,
            GrabResult::NeedsRecovery => self.recover_digest_lock(),
        }
    }

    pub fn release_digest_lock(&self) -> bool {
        self.locks.release(&Resource::Digest)
    }

    pub fn grab_cache_lock(&self) -> bool {
        match self.locks.grab(&Resource::Cache) {
            GrabResult::Grabbed => true,
            GrabResult::Failed => false,
            GrabResult::NeedsRecovery => self.recover_cache_lock(),
        }
    }

    pub fn release_cache_lock(&self) -> bool {
        self.locks.release(&Resource::Cache)
    }

    pub fn grab_block_lock(&self, block: &Path) -> bool {
        let resource = Resource::Block(block.to_path_buf());
        match self.locks.grab(&resource) {
            GrabResult::Grabbed => true,
            GrabResult::Failed => false,
            GrabResult::NeedsRecovery => self.recover_block_lock(block),
        }
    }

    pub fn release_block_lock(&self, block: &Path) -> bool {
        self.locks.release(&Resource::Block(block.to_path_buf()))
    }

    // ---- lock recovery ----------------------------------------------

    /// The catalog survived if either `info.db` or its backup decodes.
    fn recover_info_lock(&mut self) -> bool {
        debug!(table = %self.name, "recovering info lock");
        let infodb = self.dir.join("info.db");
        let backup = self.dir.join("info.bak");

        if self.load_table_info_from(&infodb) {
            self.locks.force_delete(&Resource::Info);
            return true;
        }

        if self.load_table_info_from(&backup) {
            let _ = fs::remove_file(&infodb);
            if let Err(err) = fs::rename(&backup, &infodb) {
                warn!(table = %self.name, %err, "could not restore catalog backup");
                return false;
            }
            self.locks.force_delete(&Resource::Info);
            return self.grab_info_lock();
        }

        warn!(
            table = %self.name,
            "cannot decode info.db or info.bak, leaving lock for manual repair"
        );
        false
    }

    /// A digest died mid-flight: move any stranded stomache rows back to
    /// the ingest log and clear the lock.
    fn recover_digest_lock(&mut self) -> bool {
        debug!(table = %self.name, "recovering digest lock");
        let _ = fs::create_dir_all(self.ingest_dir());
        self.locks.force_make(&Resource::Digest, process::id());
        if let Err(err) = self.restore_uningested_files() {
            warn!(table = %self.name, %err, "could not restore uningested files");
        }
        self.locks.force_delete(&Resource::Digest);
        true
    }

    /// A block save died mid-swap: either the block verifies and only its
    /// `.partial` staging needs sweeping, or it is quarantined as `.broke`.
    fn recover_block_lock(&self, block: &Path) -> bool {
        debug!(block = %block.display(), "recovering block lock");
        let resource = Resource::Block(block.to_path_buf());

        let healthy = match block::load_block_info(block) {
            Ok(info) => info.num_records > 0,
            Err(_) => false,
        };

        if healthy {
            let partial = block::partial_path(block);
            let _ = fs::remove_dir_all(&partial);
        } else {
            warn!(block = %block.display(), "quarantining unreadable block");
            let broke = block.with_extension("broke");
            let _ = fs::rename(block, &broke);
        }

        self.locks.force_delete(&resource);
        true
    }

    /// Sweep undecodable files out of the cache dir; the cache is only an
    /// accelerator, so deleting is always safe.
    fn recover_cache_lock(&self) -> bool {
        debug!(table = %self.name, "recovering cache lock");
        if let Ok(entries) = fs::read_dir(self.cache_dir()) {
            for entry in entries.flatten() {
                let path = entry.path();
                let decoded: Result<crate::codec::SavedBlockCache> =
                    crate::codec::decode_file(&path);
                if decoded.is_err() {
                    debug!(file = %path.display(), "deleting undecodable cache file");
                    let _ = fs::remove_file(&path);
                }
            }
        }
        self.locks.force_delete(&Resource::Cache);
        true
    }
}
