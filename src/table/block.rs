//! Block loading, saving, and the block metadata cache.
//!
//! A block directory is immutable once written. Saving stages the new
//! block next to its final name as `<name>.partial`, verifies the staged
//! copy decodes with the right record count, shuffles any previous block
//! to `<name>.old`, and renames the staging dir into place. A crash
//! leaves either the old block or a verifiable new one, never a half
//! block under the real name.

use eyre::{ensure, Result};
use hashbrown::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::Builder;
use tracing::{debug, warn};

use super::Table;
use crate::codec::{
    self, decode_file, SavedBlockCache, SavedBlockInfo, SavedIntColumn, SavedSetColumn,
    SavedStrColumn,
};
use crate::config::{BLOCKS_PER_CACHE_FILE, GZIP_EXT, CACHE_DIR, INGEST_DIR, STOMACHE_DIR};
use crate::query::{LoadSpec, QuerySpec};
use crate::records::{FieldId, FieldTag, FieldType, RecordSlab, RowRecord, SlabShape};

/// Per-block string intern table for one field.
#[derive(Debug, Default)]
pub struct TableColumn {
    ids: HashMap<String, i32>,
    names: Vec<String>,
}

impl TableColumn {
    pub fn val_id(&mut self, value: &str) -> i32 {
        if let Some(&id) = self.ids.get(value) {
            return id;
        }
        let id = self.names.len() as i32;
        self.names.push(value.to_string());
        self.ids.insert(value.to_string(), id);
        id
    }

    pub fn string_for_val(&self, id: i32) -> Option<&str> {
        self.names.get(id as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// One loaded block: metadata, the record slab, and per-field intern
/// tables for string and set columns.
pub struct TableBlock {
    pub name: PathBuf,
    pub info: SavedBlockInfo,
    pub slab: Option<RecordSlab>,
    pub columns: HashMap<FieldId, TableColumn>,
}

impl TableBlock {
    pub fn column(&mut self, field: FieldId) -> &mut TableColumn {
        self.columns.entry(field).or_default()
    }

    pub fn string_for_val(&self, field: FieldId, id: i32) -> Option<&str> {
        self.columns.get(&field).and_then(|c| c.string_for_val(id))
    }

    pub fn len(&self) -> usize {
        self.info.num_records as usize
    }

    pub fn is_empty(&self) -> bool {
        self.info.num_records == 0
    }

    /// Rebuild one slab row as an ingestion-form record, translating
    /// intern ids back through the block's string tables.
    pub(crate) fn row_record(&self, table: &Table, row: usize) -> Option<RowRecord> {
        let slab = self.slab.as_ref()?;
        let mut record = RowRecord::new();
        for field in 0..table.field_count() as FieldId {
            match slab.tag(row, field) {
                FieldTag::Absent => {}
                FieldTag::Int => record.ints.push((field, slab.int(row, field))),
                FieldTag::Str => {
                    if let Some(s) = self.string_for_val(field, slab.str_id(row, field)) {
                        record.strs.push((field, s.to_string()));
                    }
                }
                FieldTag::Set => {
                    if let Some(ids) = slab.set_ids(row, field) {
                        let values = ids
                            .iter()
                            .filter_map(|&id| self.string_for_val(field, id))
                            .map(str::to_string)
                            .collect();
                        record.sets.push((field, values));
                    }
                }
            }
        }
        Some(record)
    }

    /// Every row of the block in ingestion form, oldest first.
    pub(crate) fn row_records(&self, table: &Table) -> Vec<RowRecord> {
        (0..self.len())
            .filter_map(|row| self.row_record(table, row))
            .collect()
    }
}

/// The staging sibling of a block directory.
pub fn partial_path(block: &Path) -> PathBuf {
    let mut name = block.as_os_str().to_os_string();
    name.push(".partial");
    PathBuf::from(name)
}

fn old_path(block: &Path) -> PathBuf {
    let mut name = block.as_os_str().to_os_string();
    name.push(".old");
    PathBuf::from(name)
}

/// Decode a block's `info.db`.
pub fn load_block_info(block: &Path) -> Result<SavedBlockInfo> {
    decode_file(&block.join("info.db"))
}

/// Directory entries that are actual column blocks, as opposed to the
/// ingestion log, caches, staging dirs, locks, and quarantined blocks.
pub fn file_looks_like_block(name: &str) -> bool {
    !(name == INGEST_DIR
        || name == CACHE_DIR
        || name.starts_with(STOMACHE_DIR)
        || name.ends_with("info.db")
        || name.ends_with(".old")
        || name.ends_with(".broke")
        || name.ends_with(".lock")
        || name.ends_with(".partial"))
}

/// A column file name like `int_age.db` or `str_name.db.gz`, split into
/// its field kind and field name.
fn parse_column_file(file_name: &str) -> Option<(FieldType, &str)> {
    let stem = file_name.strip_suffix(GZIP_EXT).unwrap_or(file_name);
    let stem = stem.strip_suffix(".db")?;
    if let Some(field) = stem.strip_prefix("int_") {
        Some((FieldType::Int, field))
    } else if let Some(field) = stem.strip_prefix("str_") {
        Some((FieldType::Str, field))
    } else if let Some(field) = stem.strip_prefix("set_") {
        Some((FieldType::Set, field))
    } else {
        None
    }
}

impl Table {
    /// Block metadata, through the in-memory cache. Uncached reads also
    /// queue the block for the next cache-dir flush.
    pub fn load_block_info_cached(&self, block: &Path) -> Result<SavedBlockInfo> {
        if let Some(info) = self.block_info_cache.lock().get(block) {
            return Ok(info.clone());
        }
        let info = load_block_info(block)?;
        self.block_info_cache.lock().insert(block.to_path_buf(), info.clone());
        self.new_block_infos.lock().push(block.to_path_buf());
        Ok(info)
    }

    /// Pre-scan pruning from block extents. Only int filters whose
    /// outcome is monotone in the value can skip a block: a `Gt` filter
    /// can never match a block whose maximum is too small, and so on.
    /// `Ne` never prunes.
    pub fn should_load_block(&self, block: &Path, query: Option<&QuerySpec>) -> bool {
        let query = match query {
            Some(q) => q,
            None => return true,
        };
        let info = match self.load_block_info_cached(block) {
            Ok(info) => info,
            Err(_) => return true, // let the real load report the damage
        };
        query.block_is_relevant(self, &info)
    }

    /// Load the columns of one block into a fresh (or pooled) slab.
    /// `wanted` of `None` loads every column in the directory.
    pub fn load_block_from_dir(
        &self,
        block: &Path,
        wanted: Option<&HashSet<FieldId>>,
        load: Option<&LoadSpec>,
    ) -> Result<TableBlock> {
        let info = self.load_block_info_cached(block)?;
        let num_records = info.num_records as usize;

        let shape = self.slab_shape(num_records, wanted);
        let mut slab = load
            .and_then(|l| l.claim_slab(shape))
            .unwrap_or_else(|| RecordSlab::allocate(shape));

        let mut columns: HashMap<FieldId, TableColumn> = HashMap::new();
        let mut seen: HashSet<String> = HashSet::new();

        for entry in fs::read_dir(block)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();

            let (kind, field_name) = match parse_column_file(&file_name) {
                Some(parsed) => parsed,
                None => continue,
            };
            // int_age.db and int_age.db.gz are the same logical column.
            if !seen.insert(file_name.trim_end_matches(GZIP_EXT).to_string()) {
                continue;
            }

            let field = match self.key_table.get(field_name) {
                Some(&field) => field,
                None => {
                    warn!(block = %block.display(), field = field_name, "skipping unknown column");
                    continue;
                }
            };
            if self.key_types.get(&field) != Some(&kind) {
                warn!(block = %block.display(), field = field_name, "column kind disagrees with catalog");
                continue;
            }
            if let Some(wanted) = wanted {
                if !wanted.contains(&field) {
                    continue;
                }
            }

            let path = entry.path();
            match kind {
                FieldType::Int => {
                    let saved: SavedIntColumn = decode_file(&path)?;
                    codec::unpack_int_column(&saved, field, &mut slab)?;
                }
                FieldType::Str => {
                    let saved: SavedStrColumn = decode_file(&path)?;
                    let col = columns.entry(field).or_default();
                    codec::unpack_str_column(&saved, field, col, &mut slab)?;
                }
                FieldType::Set => {
                    let saved: SavedSetColumn = decode_file(&path)?;
                    let col = columns.entry(field).or_default();
                    codec::unpack_set_column(&saved, field, col, &mut slab)?;
                }
            }
        }

        Ok(TableBlock { name: block.to_path_buf(), info, slab: Some(slab), columns })
    }

    pub(crate) fn slab_shape(&self, len: usize, wanted: Option<&HashSet<FieldId>>) -> SlabShape {
        let mut has_ints = false;
        let mut has_strs = false;
        let mut has_sets = false;
        for (&field, &kind) in &self.key_types {
            if wanted.map_or(true, |w| w.contains(&field)) {
                match kind {
                    FieldType::Int => has_ints = true,
                    FieldType::Str => has_strs = true,
                    FieldType::Set => has_sets = true,
                }
            }
        }
        SlabShape {
            stride: self.key_names.len().max(1),
            len,
            has_ints,
            has_strs,
            has_sets,
        }
    }

    /// Stage, verify, and atomically swap in one block of records.
    /// Returns false when the block lock is held elsewhere.
    pub fn save_records_to_block(&self, records: &[RowRecord], block: &Path) -> Result<bool> {
        if !self.grab_block_lock(block) {
            debug!(block = %block.display(), "cannot grab lock to save block");
            return Ok(false);
        }
        let result = self.save_records_to_block_locked(records, block);
        self.release_block_lock(block);
        result.map(|_| true)
    }

    fn save_records_to_block_locked(&self, records: &[RowRecord], block: &Path) -> Result<()> {
        let partial = partial_path(block);
        let old = old_path(block);

        let written = codec::save_block(&partial, records, &self.key_names, &self.options)?;

        // Consistency check before the swap: the staged copy must decode
        // with the record count we just wrote.
        let staged = load_block_info(&partial)?;
        ensure!(
            staged.num_records == records.len() as i32 && staged.num_records == written.num_records,
            "staged block {} decodes with {} records, expected {}",
            partial.display(),
            staged.num_records,
            records.len()
        );

        let _ = fs::remove_dir_all(&old);
        if block.exists() {
            fs::rename(block, &old)?;
        }
        fs::rename(&partial, block)?;
        let _ = fs::remove_dir_all(&old);

        self.block_info_cache.lock().insert(block.to_path_buf(), written);
        debug!(block = %block.display(), records = records.len(), "saved block");
        Ok(())
    }

    /// Allocate a fresh uniquely named block directory path. The name is
    /// reserved by creating (then removing) a temp dir, so concurrent
    /// digests cannot collide.
    pub(crate) fn new_block_path(&self) -> Result<PathBuf> {
        let dir = Builder::new().prefix("block").tempdir_in(&self.dir)?;
        let path = dir.keep();
        // save_records_to_block stages into <path>.partial; the reserved
        // dir itself stays empty until the swap.
        Ok(path)
    }

    // ---- block metadata cache dir -----------------------------------

    /// Read every decodable cache file into the in-memory metadata cache.
    pub fn load_block_cache(&self) {
        if !self.grab_cache_lock() {
            return;
        }
        if let Ok(entries) = fs::read_dir(self.cache_dir()) {
            for entry in entries.flatten() {
                let decoded: Result<SavedBlockCache> = decode_file(&entry.path());
                if let Ok(cache) = decoded {
                    let mut info_cache = self.block_info_cache.lock();
                    for (name, info) in cache {
                        info_cache.insert(PathBuf::from(name), info);
                    }
                }
            }
        }
        let loaded = self.block_info_cache.lock().len();
        debug!(table = %self.name, loaded, "filled block metadata cache");
        self.release_cache_lock();
    }

    /// Flush freshly observed block metadata to the cache dir, one file
    /// per `BLOCKS_PER_CACHE_FILE` blocks. A remainder smaller than one
    /// file stays queued for a later flush.
    pub fn write_block_cache(&self) {
        let pending = {
            let mut new_infos = self.new_block_infos.lock();
            let full_files = new_infos.len() / BLOCKS_PER_CACHE_FILE;
            if full_files == 0 {
                return;
            }
            new_infos
                .drain(..full_files * BLOCKS_PER_CACHE_FILE)
                .collect::<Vec<_>>()
        };

        if !self.grab_cache_lock() {
            // Put them back; some other process is writing the cache.
            self.new_block_infos.lock().extend(pending);
            return;
        }

        let cache_dir = self.cache_dir();
        let _ = fs::create_dir_all(&cache_dir);

        for chunk in pending.chunks(BLOCKS_PER_CACHE_FILE) {
            let mut cache = SavedBlockCache::new();
            {
                let info_cache = self.block_info_cache.lock();
                for block in chunk {
                    if let Some(info) = info_cache.get(block) {
                        cache.insert(block.to_string_lossy().into_owned(), info.clone());
                    }
                }
            }

            let write = || -> Result<()> {
                let temp = Builder::new().prefix("blockcache").tempfile_in(&cache_dir)?;
                bincode::serialize_into(temp.as_file(), &cache)?;
                let target = temp.path().with_extension("db");
                temp.persist(target)?;
                Ok(())
            };
            if let Err(err) = write() {
                warn!(table = %self.name, %err, "could not write block cache file");
                break;
            }
        }

        self.release_cache_lock();
    }
}
