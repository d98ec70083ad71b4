//! Column-file decoding: transparent gzip handling plus unpacking of saved
//! columns into a block's `RecordSlab`.

use eyre::{bail, ensure, Result, WrapErr};
use flate2::read::GzDecoder;
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use super::{SavedIntColumn, SavedSetColumn, SavedStrColumn};
use crate::config::GZIP_EXT;
use crate::records::{FieldId, RecordSlab};
use crate::table::block::TableColumn;

/// The sibling filename of `path` under gzip-suffix fallback: strip `.gz`
/// if present, append it otherwise.
fn gzip_sibling(path: &Path) -> PathBuf {
    let name = path.to_string_lossy();
    match name.strip_suffix(GZIP_EXT) {
        Some(stripped) => PathBuf::from(stripped),
        None => PathBuf::from(format!("{name}{GZIP_EXT}")),
    }
}

/// Deserialize one on-disk file, decompressing when the resolved filename
/// carries the gzip suffix. If `path` itself does not exist the sibling
/// name (with or without `.gz`) is tried before giving up, so callers can
/// ask for either spelling of a column file.
pub fn decode_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let resolved = if path.exists() {
        path.to_path_buf()
    } else {
        let sibling = gzip_sibling(path);
        if sibling.exists() {
            sibling
        } else {
            bail!("no such column file: {}", path.display());
        }
    };

    let file = File::open(&resolved)
        .wrap_err_with(|| format!("opening column file {}", resolved.display()))?;
    let reader = BufReader::new(file);

    let decoded = if resolved.to_string_lossy().ends_with(GZIP_EXT) {
        bincode::deserialize_from(GzDecoder::new(reader))
    } else {
        bincode::deserialize_from(reader)
    };

    decoded.wrap_err_with(|| format!("decoding column file {}", resolved.display()))
}

/// Unpack a saved int column into the slab.
///
/// Value-encoded columns are dense: a row that never had the field reads
/// back as a populated 0, matching what the writer emitted.
pub fn unpack_int_column(
    saved: &SavedIntColumn,
    field: FieldId,
    slab: &mut RecordSlab,
) -> Result<()> {
    let len = slab.len();

    if saved.bucket_encoded {
        for bin in &saved.bins {
            let mut prev = 0u32;
            for &raw in &bin.records {
                let id = if saved.delta_encoded_ids { prev + raw } else { raw };
                prev = id;
                let row = id as usize;
                ensure!(
                    row < len,
                    "record id {row} out of range for block of {len} in column {}",
                    saved.name
                );
                slab.put_int(row, field, bin.value);
            }
        }
    } else {
        ensure!(
            saved.values.len() <= len,
            "value array of {} overflows block of {len} in column {}",
            saved.values.len(),
            saved.name
        );
        let mut prev = 0i64;
        for (row, &raw) in saved.values.iter().enumerate() {
            let value = if saved.delta_encoded_values { prev.wrapping_add(raw) } else { raw };
            prev = value;
            slab.put_int(row, field, value);
        }
    }

    Ok(())
}

/// Unpack a saved string column, remapping its self-contained string table
/// into the block's `TableColumn` intern table.
pub fn unpack_str_column(
    saved: &SavedStrColumn,
    field: FieldId,
    col: &mut TableColumn,
    slab: &mut RecordSlab,
) -> Result<()> {
    let len = slab.len();
    let translate: Vec<i32> = saved.string_table.iter().map(|s| col.val_id(s)).collect();
    let remap = |local: i32| -> Result<i32> {
        match translate.get(local as usize) {
            Some(&id) => Ok(id),
            None => bail!(
                "string id {local} has no entry in the {}-entry table of column {}",
                translate.len(),
                saved.name
            ),
        }
    };

    if saved.bucket_encoded {
        for bin in &saved.bins {
            let value = remap(bin.value)?;
            let mut prev = 0u32;
            for &raw in &bin.records {
                let id = if saved.delta_encoded_ids { prev + raw } else { raw };
                prev = id;
                let row = id as usize;
                ensure!(
                    row < len,
                    "record id {row} out of range for block of {len} in column {}",
                    saved.name
                );
                slab.put_str(row, field, value);
            }
        }
    } else {
        ensure!(
            saved.values.len() <= len,
            "value array of {} overflows block of {len} in column {}",
            saved.values.len(),
            saved.name
        );
        for (row, &local) in saved.values.iter().enumerate() {
            slab.put_str(row, field, remap(local)?);
        }
    }

    Ok(())
}

/// Unpack a saved set column. Each bucket (or dense entry) lists the string
/// ids of one record's set elements; element order within a record follows
/// insertion order at write time.
pub fn unpack_set_column(
    saved: &SavedSetColumn,
    field: FieldId,
    col: &mut TableColumn,
    slab: &mut RecordSlab,
) -> Result<()> {
    let len = slab.len();
    let translate: Vec<i32> = saved.string_table.iter().map(|s| col.val_id(s)).collect();
    let remap = |local: i32| -> Result<i32> {
        match translate.get(local as usize) {
            Some(&id) => Ok(id),
            None => bail!(
                "string id {local} has no entry in the {}-entry table of column {}",
                translate.len(),
                saved.name
            ),
        }
    };

    if saved.bucket_encoded {
        for bin in &saved.bins {
            let value = remap(bin.value)?;
            let mut prev = 0u32;
            for &raw in &bin.records {
                let id = if saved.delta_encoded_ids { prev + raw } else { raw };
                prev = id;
                let row = id as usize;
                ensure!(
                    row < len,
                    "record id {row} out of range for block of {len} in column {}",
                    saved.name
                );
                slab.push_set_val(row, field, value);
            }
        }
    } else {
        ensure!(
            saved.values.len() <= len,
            "value array of {} overflows block of {len} in column {}",
            saved.values.len(),
            saved.name
        );
        for (row, locals) in saved.values.iter().enumerate() {
            for &local in locals {
                slab.push_set_val(row, field, remap(local)?);
            }
        }
    }

    Ok(())
}
