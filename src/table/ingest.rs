//! Row-store ingestion and digestion into column blocks.
//!
//! Writers never touch column files directly. Pending records land in the
//! table's `ingest/` row store, one bincode log per flush, where they are
//! cheap to append and immediately scannable. A digest pass later swallows
//! the logs: it moves them into a private `stomache.*` staging directory
//! under the digest lock, merges their rows with any trailing
//! partially-filled block, and rewrites them as full column blocks.
//!
//! ```text
//! writer ──▶ ingest/log.XXXX.db ──▶ stomache.XXXX/ ──▶ block00XX/
//! ```
//!
//! Moving the logs before reading them is what makes a died digest
//! recoverable: anything stranded in a stomache directory is simply moved
//! back to `ingest/` by the next lock recovery.

use eyre::{Result, WrapErr};
use std::fs;
use std::path::PathBuf;
use tempfile::Builder;
use tracing::{debug, warn};

use crate::codec;
use crate::config::{FILE_DIGEST_THRESHOLD, SIZE_DIGEST_THRESHOLD_KB, STOMACHE_DIR};
use crate::query::LoadSpec;
use crate::records::RowRecord;

use super::block::file_looks_like_block;
use super::Table;

impl Table {
    /// Append the pending records to the ingestion log. Returns the
    /// number of records written.
    pub fn save_row_store(&mut self) -> Result<usize> {
        if self.new_records.is_empty() {
            return Ok(0);
        }
        let ingest = self.ingest_dir();
        fs::create_dir_all(&ingest)?;

        let records = std::mem::take(&mut self.new_records);
        let temp = Builder::new()
            .prefix("log")
            .suffix(".db")
            .tempfile_in(&ingest)
            .wrap_err("creating ingestion log")?;
        bincode::serialize_into(temp.as_file(), &records)
            .wrap_err("writing ingestion log")?;
        let (_, path) = temp.keep().wrap_err("keeping ingestion log")?;

        debug!(table = %self.name, records = records.len(), log = %path.display(), "appended to row store");
        Ok(records.len())
    }

    /// Read every decodable log in the row store. Undecodable logs are
    /// skipped with a warning; they stay on disk for inspection.
    pub fn load_row_store(&self) -> Result<Vec<RowRecord>> {
        let mut rows = Vec::new();
        let Ok(entries) = fs::read_dir(self.ingest_dir()) else {
            return Ok(rows);
        };
        for entry in entries.flatten() {
            let path = entry.path();
            match codec::decode_file::<Vec<RowRecord>>(&path) {
                Ok(mut records) => rows.append(&mut records),
                Err(err) => warn!(log = %path.display(), %err, "skipping undecodable ingestion log"),
            }
        }
        Ok(rows)
    }

    /// Has the row store grown enough to be worth digesting? Either many
    /// small logs or a large total size qualifies.
    pub fn should_digest(&self) -> bool {
        let Ok(entries) = fs::read_dir(self.ingest_dir()) else {
            return false;
        };
        let mut files = 0usize;
        let mut bytes = 0u64;
        for entry in entries.flatten() {
            files += 1;
            if let Ok(meta) = entry.metadata() {
                bytes += meta.len();
            }
        }
        files >= FILE_DIGEST_THRESHOLD || bytes >= SIZE_DIGEST_THRESHOLD_KB * 1024
    }

    /// Digest the row store into column blocks. Returns `Ok(false)` when
    /// another process holds the digest lock.
    pub fn digest_records(&mut self) -> Result<bool> {
        if !self.grab_digest_lock() {
            debug!(table = %self.name, "digest already in progress elsewhere");
            return Ok(false);
        }
        let result = self.digest_records_locked();
        if result.is_err() {
            // Put any stranded logs back where the next digest finds them.
            if let Err(err) = self.restore_uningested_files() {
                warn!(table = %self.name, %err, "could not restore uningested files");
            }
        }
        self.release_digest_lock();
        result.map(|_| true)
    }

    fn digest_records_locked(&mut self) -> Result<()> {
        let ingest = self.ingest_dir();
        fs::create_dir_all(&ingest)?;

        let stomache = Builder::new()
            .prefix(STOMACHE_DIR)
            .tempdir_in(&self.dir)
            .wrap_err("creating digest staging dir")?;
        let stomache = stomache.keep();

        let mut swallowed = 0usize;
        if let Ok(entries) = fs::read_dir(&ingest) {
            for entry in entries.flatten() {
                let from = entry.path();
                let to = stomache.join(entry.file_name());
                if fs::rename(&from, &to).is_ok() {
                    swallowed += 1;
                }
            }
        }
        if swallowed == 0 {
            let _ = fs::remove_dir_all(&stomache);
            return Ok(());
        }

        let mut rows = Vec::new();
        if let Ok(entries) = fs::read_dir(&stomache) {
            for entry in entries.flatten() {
                let path = entry.path();
                match codec::decode_file::<Vec<RowRecord>>(&path) {
                    Ok(mut records) => rows.append(&mut records),
                    Err(err) => {
                        warn!(log = %path.display(), %err, "skipping undecodable ingestion log")
                    }
                }
            }
        }

        debug!(table = %self.name, logs = swallowed, rows = rows.len(), "digesting row store");
        self.save_rows_to_blocks(rows)?;

        fs::remove_dir_all(&stomache).wrap_err("sweeping digest staging dir")?;
        Ok(())
    }

    /// Write the pending records straight to column blocks, bypassing the
    /// row store.
    pub fn flush(&mut self) -> Result<()> {
        if self.new_records.is_empty() {
            return Ok(());
        }
        let rows = std::mem::take(&mut self.new_records);
        self.save_rows_to_blocks(rows)
    }

    /// The shared back half of digestion and direct flushing: merge with
    /// any trailing partial block, rechunk, and save.
    fn save_rows_to_blocks(&mut self, rows: Vec<RowRecord>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let chunk_size = self.options.chunk_size;

        let (partial_block, mut all_rows) = self.drain_partial_block()?;
        all_rows.extend(rows);

        // Time-ordered blocks give time filters tight extents to prune on.
        if let Some(field) = self.options.time_col.as_deref().and_then(|n| self.field_id(n)) {
            all_rows.sort_by_key(|r| r.int(field).unwrap_or(i64::MAX));
        }

        let mut full_blocks = Vec::new();
        for chunk in all_rows.chunks(chunk_size) {
            let block = self.new_block_path()?;
            if !self.save_records_to_block(chunk, &block)? {
                eyre::bail!("could not lock fresh block {}", block.display());
            }
            if chunk.len() == chunk_size {
                full_blocks.push(block.clone());
            }
            let info = self.block_info_cache.lock().get(&block).cloned();
            if let Some(info) = info {
                self.merge_block_info(&info);
            }
        }
        // Only full blocks are immutable enough for the metadata cache.
        self.new_block_infos.lock().extend(full_blocks);

        if let Some(block) = partial_block {
            fs::remove_dir_all(&block)
                .wrap_err_with(|| format!("removing refilled partial block {}", block.display()))?;
            self.block_info_cache.lock().remove(&block);
        }

        if !self.save_table_info()? {
            warn!(table = %self.name, "catalog busy, skipping info save");
        }
        Ok(())
    }

    /// Find a trailing block that never reached full chunk size and drain
    /// its rows so they can be rechunked with the fresh ones. The block
    /// directory itself is removed by the caller only after the rechunked
    /// blocks are safely on disk.
    fn drain_partial_block(&mut self) -> Result<(Option<PathBuf>, Vec<RowRecord>)> {
        let chunk_size = self.options.chunk_size;
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Ok((None, Vec::new()));
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !file_looks_like_block(&name) || !entry.path().is_dir() {
                continue;
            }
            let block = entry.path();
            let Ok(info) = self.load_block_info_cached(&block) else { continue };
            if info.num_records == 0 || info.num_records as usize >= chunk_size {
                continue;
            }
            let load = LoadSpec::new(self).all_columns();
            let loaded = self.load_block_from_dir(&block, None, Some(&load))?;
            let rows = loaded.row_records(self);
            debug!(block = %block.display(), rows = rows.len(), "refilling partial block");
            return Ok((Some(block), rows));
        }
        Ok((None, Vec::new()))
    }

    /// Move files stranded in digest staging directories back into the
    /// row store. Safe to run at any time under the digest lock.
    pub(crate) fn restore_uningested_files(&self) -> Result<()> {
        let ingest = self.ingest_dir();
        fs::create_dir_all(&ingest)?;

        let entries = fs::read_dir(&self.dir)?;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(STOMACHE_DIR) || !entry.path().is_dir() {
                continue;
            }
            let stomache = entry.path();
            let mut restored = 0usize;
            if let Ok(files) = fs::read_dir(&stomache) {
                for file in files.flatten() {
                    let to = ingest.join(file.file_name());
                    if fs::rename(file.path(), &to).is_ok() {
                        restored += 1;
                    }
                }
            }
            debug!(dir = %stomache.display(), restored, "restored uningested files");
            let _ = fs::remove_dir_all(&stomache);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableOptions;
    use crate::locks::FixedLiveness;
    use crate::table::block::load_block_info;
    use std::path::Path;
    use std::sync::Arc;

    fn small_chunk_table(dir: &Path) -> Table {
        let options = TableOptions { chunk_size: 10, ..Default::default() };
        Table::open_with_liveness(dir, "events", options, Arc::new(FixedLiveness { alive: true }))
            .unwrap()
    }

    fn add_records(t: &mut Table, n: i64) {
        for i in 0..n {
            let mut r = RowRecord::new();
            t.add_int_field(&mut r, "value", i).unwrap();
            t.add_str_field(&mut r, "kind", "event").unwrap();
            t.add_record(r);
        }
    }

    fn block_record_counts(t: &Table) -> Vec<usize> {
        let mut counts = Vec::new();
        for entry in fs::read_dir(t.dir()).unwrap().flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if file_looks_like_block(&name) && entry.path().is_dir() {
                counts.push(load_block_info(&entry.path()).unwrap().num_records as usize);
            }
        }
        counts.sort_unstable();
        counts
    }

    #[test]
    fn digest_compacts_logs_into_chunked_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = small_chunk_table(dir.path());

        add_records(&mut t, 25);
        assert_eq!(t.save_row_store().unwrap(), 25);
        assert_eq!(t.pending_records(), 0);
        assert!(t.digest_records().unwrap());

        assert_eq!(block_record_counts(&t), vec![5, 10, 10]);
        // Logs are consumed.
        assert!(t.load_row_store().unwrap().is_empty());
    }

    #[test]
    fn digest_refills_the_trailing_partial_block() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = small_chunk_table(dir.path());

        add_records(&mut t, 25);
        t.save_row_store().unwrap();
        t.digest_records().unwrap();

        add_records(&mut t, 5);
        t.save_row_store().unwrap();
        t.digest_records().unwrap();

        assert_eq!(block_record_counts(&t), vec![10, 10, 10]);
    }

    #[test]
    fn flush_bypasses_the_row_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = small_chunk_table(dir.path());

        add_records(&mut t, 12);
        t.flush().unwrap();
        assert_eq!(block_record_counts(&t), vec![2, 10]);
        assert!(t.load_row_store().unwrap().is_empty());
    }

    #[test]
    fn restore_moves_stranded_staging_files_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = small_chunk_table(dir.path());

        add_records(&mut t, 3);
        t.save_row_store().unwrap();

        // Simulate a digest that died after swallowing the logs.
        let stomache = t.dir().join(format!("{STOMACHE_DIR}.dead"));
        fs::create_dir_all(&stomache).unwrap();
        for entry in fs::read_dir(t.ingest_dir()).unwrap().flatten() {
            fs::rename(entry.path(), stomache.join(entry.file_name())).unwrap();
        }
        assert!(t.load_row_store().unwrap().is_empty());

        t.restore_uningested_files().unwrap();
        assert_eq!(t.load_row_store().unwrap().len(), 3);
        assert!(!stomache.exists());
    }

    #[test]
    fn should_digest_tracks_log_count() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = small_chunk_table(dir.path());
        assert!(!t.should_digest());

        for _ in 0..FILE_DIGEST_THRESHOLD {
            add_records(&mut t, 1);
            t.save_row_store().unwrap();
        }
        assert!(t.should_digest());
    }
}
