//! Catalog persistence: `info.db`, its backup, and the existence flag.
//!
//! Saving is crash-safe in two layers. The current `info.db` is first
//! copied to `info.bak`, then the new catalog is written to a temp file
//! and renamed over `info.db`. A crash at any point leaves at least one
//! decodable catalog on disk for info-lock recovery to find. The
//! `info.db.exists` flag file distinguishes "new table" from "table whose
//! catalog went missing": once a catalog has ever been saved the flag
//! stays behind, and a missing `info.db` with the flag present is treated
//! as damage rather than emptiness.

use eyre::{Result, WrapErr};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::{IntInfo, StrInfo, Table};
use crate::codec::{decode_file, BLOCK_VERSION};
use crate::records::{FieldId, FieldType};

/// The serialized catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SavedTable {
    pub version: i32,
    pub key_table: HashMap<String, FieldId>,
    pub key_types: HashMap<FieldId, FieldType>,
    pub int_info: HashMap<FieldId, IntInfo>,
    pub str_info: HashMap<FieldId, StrInfo>,
}

impl Table {
    fn to_saved(&self) -> SavedTable {
        SavedTable {
            version: BLOCK_VERSION,
            key_table: self.key_table.clone(),
            key_types: self.key_types.clone(),
            int_info: self.int_info.clone(),
            str_info: self.str_info.clone(),
        }
    }

    /// Persist the catalog under the info lock. Returns false when the
    /// lock could not be grabbed.
    pub fn save_table_info(&mut self) -> Result<bool> {
        if !self.grab_info_lock() {
            debug!(table = %self.name, "info lock busy, not saving catalog");
            return Ok(false);
        }
        let result = self.save_table_info_locked();
        self.release_info_lock();
        result.map(|_| true)
    }

    fn save_table_info_locked(&self) -> Result<()> {
        let infodb = self.dir.join("info.db");
        let backup = self.dir.join("info.bak");
        let flagfile = self.dir.join("info.db.exists");

        if infodb.exists() {
            fs::copy(&infodb, &backup).wrap_err("backing up catalog")?;
        }

        let temp = NamedTempFile::new_in(&self.dir).wrap_err("creating catalog temp file")?;
        bincode::serialize_into(temp.as_file(), &self.to_saved()).wrap_err("encoding catalog")?;
        temp.persist(&infodb).wrap_err("swapping in new catalog")?;

        fs::File::create(&flagfile).wrap_err("creating catalog flag file")?;
        Ok(())
    }

    /// Load the catalog under the info lock. False when the lock is busy
    /// or no decodable catalog exists yet.
    pub fn load_table_info(&mut self) -> bool {
        if !self.grab_info_lock() {
            debug!(table = %self.name, "info lock busy, not loading catalog");
            return false;
        }
        let infodb = self.dir.join("info.db");
        let loaded = self.load_table_info_from(&infodb);
        self.release_info_lock();
        loaded
    }

    /// Merge a saved catalog file into this table. Only non-empty pieces
    /// overwrite, so a partially written catalog cannot erase known fields.
    pub(crate) fn load_table_info_from(&mut self, path: &Path) -> bool {
        let saved: SavedTable = match decode_file(path) {
            Ok(saved) => saved,
            Err(err) => {
                debug!(file = %path.display(), %err, "catalog not decodable");
                return false;
            }
        };

        if !saved.key_table.is_empty() {
            let mut names = vec![String::new(); saved.key_table.len()];
            for (name, &id) in &saved.key_table {
                if (id as usize) >= names.len() {
                    names.resize(id as usize + 1, String::new());
                }
                names[id as usize] = name.clone();
            }
            self.key_table = saved.key_table;
            self.key_names = names;
        }
        if !saved.key_types.is_empty() {
            self.key_types = saved.key_types;
        }
        if !saved.int_info.is_empty() {
            self.int_info = saved.int_info;
        }
        if !saved.str_info.is_empty() {
            self.str_info = saved.str_info;
        }

        true
    }

    /// Has this table ever saved a catalog? Used to tell a brand new
    /// table apart from one whose catalog was damaged.
    pub fn has_flag_file(&self) -> bool {
        let flagfile = self.dir.join("info.db.exists");
        if flagfile.exists() {
            warn!(table = %self.name, "catalog missing but flag file exists");
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableOptions;
    use crate::locks::FixedLiveness;
    use std::sync::Arc;

    fn test_table(dir: &Path) -> Table {
        Table::open_with_liveness(
            dir,
            "events",
            TableOptions::default(),
            Arc::new(FixedLiveness { alive: true }),
        )
        .unwrap()
    }

    #[test]
    fn catalog_roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = test_table(dir.path());
        t.get_or_create_key("age", FieldType::Int).unwrap();
        t.get_or_create_key("name", FieldType::Str).unwrap();
        let mut extent = IntInfo::new(3);
        extent.update(99);
        t.int_info.insert(0, extent);

        assert!(t.save_table_info().unwrap());

        let mut fresh = test_table(dir.path());
        assert!(fresh.load_table_info());
        assert_eq!(fresh.field_id("age"), Some(0));
        assert_eq!(fresh.field_type(1), Some(FieldType::Str));
        assert_eq!(fresh.int_info[&0].max, 99);
    }

    #[test]
    fn saving_twice_leaves_a_backup_behind() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = test_table(dir.path());
        t.get_or_create_key("age", FieldType::Int).unwrap();
        t.save_table_info().unwrap();
        t.get_or_create_key("name", FieldType::Str).unwrap();
        t.save_table_info().unwrap();

        assert!(dir.path().join("events/info.bak").exists());
        assert!(dir.path().join("events/info.db.exists").exists());
    }

    #[test]
    fn corrupt_catalog_falls_back_during_lock_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = test_table(dir.path());
        t.get_or_create_key("age", FieldType::Int).unwrap();
        t.save_table_info().unwrap();
        t.get_or_create_key("name", FieldType::Str).unwrap();
        t.save_table_info().unwrap();

        // Damage info.db; the backup still holds the one-field catalog.
        fs::write(dir.path().join("events/info.db"), b"garbage").unwrap();

        let mut fresh = test_table(dir.path());
        assert!(!fresh.load_table_info_from(&dir.path().join("events/info.db")));
        assert!(fresh.load_table_info_from(&dir.path().join("events/info.bak")));
        assert_eq!(fresh.field_id("age"), Some(0));
    }
}
