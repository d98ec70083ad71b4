//! # Record Slabs and the Slab Pool
//!
//! A loaded block does not hold one allocation per record. Instead it owns a
//! `RecordSlab`: one flat backing array per field kind (`i64` ints, interned
//! `i32` string ids, a per-record set map) plus a presence-tag array, all
//! `stride` entries wide per record where `stride` is the table's highest
//! field id plus one. Record `r`, field `f` lives at index `r * stride + f`.
//! This bounds allocation count to O(1) per block regardless of record count.
//!
//! ## Recycling
//!
//! Repeated scans of same-shaped blocks (same table, same requested column
//! subset, full chunk size) can claim a previously used slab from the
//! `SlabPool` owned by the caller's `LoadSpec` instead of allocating. The
//! pool re-zeroes int/string values, clears set maps, and resets every
//! presence tag to `Absent` before handing a slab out. Pooling is only legal
//! for full-size chunks; partial blocks always allocate fresh.
//!
//! The pool is an explicit object handed around by reference — never a
//! module-global — so parallel tests and parallel tables stay isolated.

use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Stable, catalog-assigned column identifier.
pub type FieldId = u16;

/// Set-field storage for one record: field id → interned string ids.
pub type SetMap = HashMap<FieldId, SmallVec<[i32; 4]>>;

/// The declared type of a catalog field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Int,
    Str,
    Set,
}

/// Per-record, per-field presence tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum FieldTag {
    #[default]
    Absent = 0,
    Int = 1,
    Str = 2,
    Set = 3,
}

/// The shape of a slab: two slabs are interchangeable through the pool only
/// if their shapes are identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabShape {
    /// Highest field id in the table plus one.
    pub stride: usize,
    /// Number of records.
    pub len: usize,
    pub has_ints: bool,
    pub has_strs: bool,
    pub has_sets: bool,
}

/// Flat columnar backing storage for one loaded block.
#[derive(Debug)]
pub struct RecordSlab {
    shape: SlabShape,
    ints: Vec<i64>,
    strs: Vec<i32>,
    sets: Vec<SetMap>,
    tags: Vec<FieldTag>,
}

impl RecordSlab {
    pub fn allocate(shape: SlabShape) -> Self {
        let cells = shape.stride * shape.len;
        Self {
            shape,
            ints: if shape.has_ints { vec![0; cells] } else { Vec::new() },
            strs: if shape.has_strs { vec![0; cells] } else { Vec::new() },
            sets: if shape.has_sets {
                (0..shape.len).map(|_| SetMap::new()).collect()
            } else {
                Vec::new()
            },
            tags: vec![FieldTag::Absent; cells],
        }
    }

    pub fn shape(&self) -> SlabShape {
        self.shape
    }

    pub fn len(&self) -> usize {
        self.shape.len
    }

    pub fn is_empty(&self) -> bool {
        self.shape.len == 0
    }

    #[inline]
    fn cell(&self, row: usize, field: FieldId) -> usize {
        row * self.shape.stride + field as usize
    }

    #[inline]
    pub fn tag(&self, row: usize, field: FieldId) -> FieldTag {
        self.tags[self.cell(row, field)]
    }

    #[inline]
    pub fn int(&self, row: usize, field: FieldId) -> i64 {
        self.ints[self.cell(row, field)]
    }

    #[inline]
    pub fn str_id(&self, row: usize, field: FieldId) -> i32 {
        self.strs[self.cell(row, field)]
    }

    pub fn set_ids(&self, row: usize, field: FieldId) -> Option<&SmallVec<[i32; 4]>> {
        self.sets.get(row).and_then(|m| m.get(&field))
    }

    pub fn put_int(&mut self, row: usize, field: FieldId, value: i64) {
        let cell = self.cell(row, field);
        self.ints[cell] = value;
        self.tags[cell] = FieldTag::Int;
    }

    pub fn put_str(&mut self, row: usize, field: FieldId, value: i32) {
        let cell = self.cell(row, field);
        self.strs[cell] = value;
        self.tags[cell] = FieldTag::Str;
    }

    pub fn push_set_val(&mut self, row: usize, field: FieldId, value: i32) {
        let cell = self.cell(row, field);
        self.sets[row].entry(field).or_default().push(value);
        self.tags[cell] = FieldTag::Set;
    }

    /// Wash-and-rinse cycle before a slab is handed back out of the pool:
    /// zero every value, clear set maps, reset every tag to `Absent`.
    fn reset(&mut self) {
        self.ints.iter_mut().for_each(|v| *v = 0);
        self.strs.iter_mut().for_each(|v| *v = 0);
        self.sets.iter_mut().for_each(|m| m.clear());
        self.tags.iter_mut().for_each(|t| *t = FieldTag::Absent);
    }
}

/// Pool of full-chunk slabs, owned by a `LoadSpec`.
#[derive(Debug, Default)]
pub struct SlabPool {
    slabs: Mutex<Vec<RecordSlab>>,
}

impl SlabPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a pooled slab of exactly this shape, reset and ready for use.
    pub fn claim(&self, shape: SlabShape) -> Option<RecordSlab> {
        let mut slabs = self.slabs.lock();
        let idx = slabs.iter().position(|s| s.shape == shape)?;
        let mut slab = slabs.swap_remove(idx);
        slab.reset();
        Some(slab)
    }

    /// Return a slab to the pool. Callers must only hand back full-chunk
    /// slabs; partial slabs are dropped by the ambient allocator instead.
    pub fn give(&self, slab: RecordSlab) {
        self.slabs.lock().push(slab);
    }

    pub fn available(&self) -> usize {
        self.slabs.lock().len()
    }
}

/// One logical row in ingestion form: typed (field id, value) pairs.
///
/// This is the shape records take in the row store and while pending
/// compaction; loaded blocks use `RecordSlab` instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RowRecord {
    pub ints: Vec<(FieldId, i64)>,
    pub strs: Vec<(FieldId, String)>,
    pub sets: Vec<(FieldId, Vec<String>)>,
}

impl RowRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ints.is_empty() && self.strs.is_empty() && self.sets.is_empty()
    }

    /// The record's value for an int field, if populated.
    pub fn int(&self, field: FieldId) -> Option<i64> {
        self.ints.iter().find(|(f, _)| *f == field).map(|(_, v)| *v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(len: usize) -> SlabShape {
        SlabShape { stride: 4, len, has_ints: true, has_strs: true, has_sets: true }
    }

    #[test]
    fn slab_cells_are_independent_per_record() {
        let mut slab = RecordSlab::allocate(shape(3));

        slab.put_int(0, 1, 42);
        slab.put_str(1, 1, 7);
        slab.push_set_val(2, 3, 9);

        assert_eq!(slab.tag(0, 1), FieldTag::Int);
        assert_eq!(slab.int(0, 1), 42);
        assert_eq!(slab.tag(1, 1), FieldTag::Str);
        assert_eq!(slab.str_id(1, 1), 7);
        assert_eq!(slab.tag(2, 3), FieldTag::Set);
        assert_eq!(slab.set_ids(2, 3).unwrap().as_slice(), &[9]);

        assert_eq!(slab.tag(0, 0), FieldTag::Absent);
        assert_eq!(slab.tag(1, 3), FieldTag::Absent);
    }

    #[test]
    fn pool_claim_resets_values_and_tags() {
        let pool = SlabPool::new();
        let mut slab = RecordSlab::allocate(shape(2));
        slab.put_int(0, 0, 5);
        slab.push_set_val(1, 2, 3);
        pool.give(slab);

        let slab = pool.claim(shape(2)).unwrap();
        assert_eq!(slab.int(0, 0), 0);
        assert_eq!(slab.tag(0, 0), FieldTag::Absent);
        assert!(slab.set_ids(1, 2).is_none());
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn pool_rejects_mismatched_shapes() {
        let pool = SlabPool::new();
        pool.give(RecordSlab::allocate(shape(2)));

        assert!(pool.claim(shape(3)).is_none());
        let mut other = shape(2);
        other.has_sets = false;
        assert!(pool.claim(other).is_none());
        assert!(pool.claim(shape(2)).is_some());
    }
}
