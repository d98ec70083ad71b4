//! Column-file encoding: splitting rows into per-field value buckets,
//! choosing an encoding per column, and writing the block directory.

use eyre::{bail, Result, WrapErr};
use flate2::write::GzEncoder;
use flate2::Compression;
use hashbrown::HashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use tracing::debug;

use super::{
    delta_encode_ids, delta_encode_values, SavedBlockInfo, SavedIntBucket, SavedIntColumn,
    SavedSetBucket, SavedSetColumn, SavedStrBucket, SavedStrColumn,
};
use crate::config::TableOptions;
use crate::records::{FieldId, RowRecord};
use crate::table::{IntInfo, StrInfo};

/// Serialize a value to `path` with bincode, gzip-compressing when asked.
/// Callers that compress should spell the `.gz` suffix into `path`.
pub fn encode_file<T: Serialize>(path: &Path, value: &T, compress: bool) -> Result<()> {
    let file = File::create(path)
        .wrap_err_with(|| format!("creating column file {}", path.display()))?;
    let writer = BufWriter::new(file);

    if compress {
        let gz = GzEncoder::new(writer, Compression::default());
        bincode::serialize_into(gz, value)
    } else {
        bincode::serialize_into(writer, value)
    }
    .wrap_err_with(|| format!("encoding column file {}", path.display()))?;

    Ok(())
}

/// Per-field string interner used while separating, so each written column
/// carries a self-contained string table.
#[derive(Default)]
struct Interner {
    table: Vec<String>,
    ids: HashMap<String, i32>,
}

impl Interner {
    fn id_for(&mut self, s: &str) -> i32 {
        if let Some(&id) = self.ids.get(s) {
            return id;
        }
        let id = self.table.len() as i32;
        self.table.push(s.to_string());
        self.ids.insert(s.to_string(), id);
        id
    }
}

/// Records cross-sectioned by column: field → value → ascending record ids.
///
/// `BTreeMap` keys keep bucket order deterministic, so two saves of the
/// same rows produce byte-identical column files.
#[derive(Default)]
pub struct SeparatedColumns {
    pub ints: HashMap<FieldId, BTreeMap<i64, Vec<u32>>>,
    strs: HashMap<FieldId, (Interner, BTreeMap<i32, Vec<u32>>)>,
    sets: HashMap<FieldId, (Interner, BTreeMap<i32, Vec<u32>>)>,
}

/// Cross-section rows into per-column value buckets. Record ids are the
/// row's position in `records`, so bucket id lists come out ascending.
pub fn separate_into_columns(records: &[RowRecord]) -> SeparatedColumns {
    let mut out = SeparatedColumns::default();

    for (i, record) in records.iter().enumerate() {
        let row = i as u32;
        for &(field, value) in &record.ints {
            out.ints.entry(field).or_default().entry(value).or_default().push(row);
        }
        for (field, value) in &record.strs {
            let (interner, buckets) = out.strs.entry(*field).or_default();
            let id = interner.id_for(value);
            buckets.entry(id).or_default().push(row);
        }
        for (field, values) in &record.sets {
            let (interner, buckets) = out.sets.entry(*field).or_default();
            for value in values {
                let id = interner.id_for(value);
                buckets.entry(id).or_default().push(row);
            }
        }
    }

    out
}

fn field_name(names: &[String], field: FieldId) -> Result<&str> {
    match names.get(field as usize) {
        Some(name) if !name.is_empty() => Ok(name),
        _ => bail!("field id {field} has no catalog name"),
    }
}

/// Write one block directory from row records: every populated column as
/// its own file plus `info.db`. The directory is created if needed; callers
/// stage into a `.partial` path and swap it in after verification.
///
/// Returns the block metadata that was written, for the table-level block
/// info cache and catalog extent merging.
pub fn save_block(
    dir: &Path,
    records: &[RowRecord],
    names: &[String],
    options: &TableOptions,
) -> Result<SavedBlockInfo> {
    std::fs::create_dir_all(dir)
        .wrap_err_with(|| format!("creating block dir {}", dir.display()))?;

    let cutoff = options.bucket_cutoff();
    let separated = separate_into_columns(records);
    let mut info = SavedBlockInfo { num_records: records.len() as i32, ..Default::default() };

    for (field, buckets) in &separated.ints {
        let name = field_name(names, *field)?;
        let mut col = SavedIntColumn::new(name.to_string());

        let mut extent: Option<IntInfo> = None;
        for (&value, ids) in buckets {
            for _ in ids {
                match extent.as_mut() {
                    Some(e) => e.update(value),
                    None => extent = Some(IntInfo::new(value)),
                }
            }
        }
        if let Some(extent) = extent {
            info.int_info.insert(name.to_string(), extent);
        }

        if buckets.len() <= cutoff {
            col.bucket_encoded = true;
            col.delta_encoded_ids = options.delta_encode_record_ids;
            for (&value, ids) in buckets {
                let mut records = ids.clone();
                if col.delta_encoded_ids {
                    delta_encode_ids(&mut records);
                }
                col.bins.push(SavedIntBucket { value, records });
            }
        } else {
            col.value_encoded = true;
            col.delta_encoded_values = options.delta_encode_int_values;
            let max_row = buckets.values().flatten().max().map_or(0, |&r| r as usize + 1);
            col.values = vec![0; max_row];
            for (&value, ids) in buckets {
                for &id in ids {
                    col.values[id as usize] = value;
                }
            }
            if col.delta_encoded_values {
                delta_encode_values(&mut col.values);
            }
        }

        let encoding = if col.bucket_encoded { "bucketed" } else { "dense" };
        debug!(column = name, encoding, "saving int column");
        encode_file(&dir.join(format!("int_{name}.db")), &col, false)?;
    }

    for (field, (interner, buckets)) in &separated.strs {
        let name = field_name(names, *field)?;
        let mut col = SavedStrColumn::new(name.to_string());
        col.string_table = interner.table.clone();

        let mut stats = StrInfo::default();
        for (&id, ids) in buckets {
            stats.observe(&interner.table[id as usize], ids.len() as i64);
        }
        stats.prune();
        info.str_info.insert(name.to_string(), stats);

        if buckets.len() <= cutoff {
            col.bucket_encoded = true;
            col.delta_encoded_ids = options.delta_encode_record_ids;
            for (&value, ids) in buckets {
                let mut records = ids.clone();
                if col.delta_encoded_ids {
                    delta_encode_ids(&mut records);
                }
                col.bins.push(SavedStrBucket { value, records });
            }
        } else {
            let max_row = buckets.values().flatten().max().map_or(0, |&r| r as usize + 1);
            col.values = vec![0; max_row];
            for (&value, ids) in buckets {
                for &id in ids {
                    col.values[id as usize] = value;
                }
            }
        }

        let encoding = if col.bucket_encoded { "bucketed" } else { "dense" };
        debug!(column = name, encoding, "saving str column");
        encode_file(&dir.join(format!("str_{name}.db")), &col, false)?;
    }

    for (field, (interner, buckets)) in &separated.sets {
        let name = field_name(names, *field)?;
        let mut col = SavedSetColumn::new(name.to_string());
        col.string_table = interner.table.clone();

        if buckets.len() <= cutoff {
            col.bucket_encoded = true;
            col.delta_encoded_ids = options.delta_encode_record_ids;
            for (&value, ids) in buckets {
                let mut records = ids.clone();
                if col.delta_encoded_ids {
                    delta_encode_ids(&mut records);
                }
                col.bins.push(SavedSetBucket { value, records });
            }
        } else {
            let max_row = buckets.values().flatten().max().map_or(0, |&r| r as usize + 1);
            col.values = vec![Vec::new(); max_row];
            for (&value, ids) in buckets {
                for &id in ids {
                    col.values[id as usize].push(value);
                }
            }
        }

        let encoding = if col.bucket_encoded { "bucketed" } else { "dense" };
        debug!(column = name, encoding, "saving set column");
        encode_file(&dir.join(format!("set_{name}.db")), &col, false)?;
    }

    encode_file(&dir.join("info.db"), &info, false)?;
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::RowRecord;

    fn names() -> Vec<String> {
        vec!["age".into(), "name".into(), "tags".into()]
    }

    fn row(age: i64, name: &str) -> RowRecord {
        RowRecord {
            ints: vec![(0, age)],
            strs: vec![(1, name.to_string())],
            sets: vec![(2, vec!["a".to_string(), name.to_string()])],
        }
    }

    #[test]
    fn separation_keeps_record_ids_ascending() {
        let records = vec![row(10, "x"), row(20, "y"), row(10, "x")];
        let separated = separate_into_columns(&records);

        let ages = &separated.ints[&0];
        assert_eq!(ages[&10], vec![0, 2]);
        assert_eq!(ages[&20], vec![1]);
    }

    #[test]
    fn low_cardinality_column_is_bucket_encoded() {
        let dir = tempfile::tempdir().unwrap();
        let records: Vec<_> = (0..100).map(|i| row(i % 3, "x")).collect();
        let options = TableOptions { chunk_size: 100, ..Default::default() };

        save_block(dir.path(), &records, &names(), &options).unwrap();

        let col: SavedIntColumn =
            crate::codec::decode_file(&dir.path().join("int_age.db")).unwrap();
        assert!(col.bucket_encoded);
        assert_eq!(col.bins.len(), 3);
    }

    #[test]
    fn high_cardinality_column_is_value_encoded() {
        let dir = tempfile::tempdir().unwrap();
        let records: Vec<_> = (0..100).map(|i| row(i, "x")).collect();
        let options = TableOptions { chunk_size: 100, ..Default::default() };

        save_block(dir.path(), &records, &names(), &options).unwrap();

        let col: SavedIntColumn =
            crate::codec::decode_file(&dir.path().join("int_age.db")).unwrap();
        assert!(col.value_encoded);
        assert_eq!(col.values.len(), 100);
    }

    #[test]
    fn block_info_records_extents_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let records = vec![row(5, "x"), row(90, "y"), row(7, "x")];
        let options = TableOptions::default();

        let info = save_block(dir.path(), &records, &names(), &options).unwrap();

        assert_eq!(info.num_records, 3);
        let age = &info.int_info["age"];
        assert_eq!((age.min, age.max, age.count), (5, 90, 3));
        assert_eq!(info.str_info["name"].cardinality, 2);
    }
}
