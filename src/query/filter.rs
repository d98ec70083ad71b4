//! Typed record filters and their per-block compiled forms.
//!
//! Filters are declared against catalog fields and serialized (pattern
//! strings included) into query-cache keys. Before a block's record pass
//! they are compiled against that block's string tables: a string
//! comparison or regex becomes a per-intern-id match table, and a set
//! membership test becomes a single target id, so the per-record check is
//! an integer lookup regardless of operator.
//!
//! Every operator rejects records where the field is absent, including
//! the negative ones: `Ne` means "present and different", not "not known
//! to be equal".

use eyre::{bail, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::records::{FieldId, FieldTag, FieldType, RecordSlab};
use crate::table::block::TableBlock;
use crate::table::Table;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrOp {
    Eq,
    Ne,
    /// Regex match against the pattern in `value`.
    Re,
    NotRe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetOp {
    /// The set contains the value.
    Has,
    /// The record has the set field but not the value.
    HasNot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntFilter {
    pub name: String,
    pub field: FieldId,
    pub op: IntOp,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrFilter {
    pub name: String,
    pub field: FieldId,
    pub op: StrOp,
    /// Literal for `Eq`/`Ne`, pattern source for `Re`/`NotRe`.
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetFilter {
    pub name: String,
    pub field: FieldId,
    pub op: SetOp,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    Int(IntFilter),
    Str(StrFilter),
    Set(SetFilter),
}

impl Filter {
    pub fn field(&self) -> FieldId {
        match self {
            Filter::Int(f) => f.field,
            Filter::Str(f) => f.field,
            Filter::Set(f) => f.field,
        }
    }
}

impl IntFilter {
    pub fn accepts(&self, value: i64) -> bool {
        match self.op {
            IntOp::Eq => value == self.value,
            IntOp::Ne => value != self.value,
            IntOp::Gt => value > self.value,
            IntOp::Ge => value >= self.value,
            IntOp::Lt => value < self.value,
            IntOp::Le => value <= self.value,
        }
    }
}

impl Table {
    pub fn int_filter(&self, name: &str, op: IntOp, value: i64) -> Result<Filter> {
        let field = self.filter_field(name, FieldType::Int)?;
        Ok(Filter::Int(IntFilter { name: name.to_string(), field, op, value }))
    }

    pub fn str_filter(&self, name: &str, op: StrOp, value: &str) -> Result<Filter> {
        let field = self.filter_field(name, FieldType::Str)?;
        if matches!(op, StrOp::Re | StrOp::NotRe) {
            // Surface pattern errors at build time, not per block.
            Regex::new(value)?;
        }
        Ok(Filter::Str(StrFilter {
            name: name.to_string(),
            field,
            op,
            value: value.to_string(),
        }))
    }

    pub fn set_filter(&self, name: &str, op: SetOp, value: &str) -> Result<Filter> {
        let field = self.filter_field(name, FieldType::Set)?;
        Ok(Filter::Set(SetFilter {
            name: name.to_string(),
            field,
            op,
            value: value.to_string(),
        }))
    }

    fn filter_field(&self, name: &str, kind: FieldType) -> Result<FieldId> {
        let Some(field) = self.field_id(name) else {
            bail!("cannot filter unknown field {name:?}");
        };
        let actual = self.field_type(field);
        if actual != Some(kind) {
            bail!("filter on {name:?} expects {kind:?}, field is {actual:?}");
        }
        Ok(field)
    }
}

/// A filter specialized to one block's intern tables.
pub(crate) enum CompiledFilter {
    Int(IntFilter),
    Str {
        field: FieldId,
        /// Indexed by the block-local string id.
        matches: Vec<bool>,
    },
    Set {
        field: FieldId,
        op: SetOp,
        /// The value's block-local id; `None` means the value never
        /// occurs in this block.
        target: Option<i32>,
    },
}

impl CompiledFilter {
    pub(crate) fn accepts(&self, slab: &RecordSlab, row: usize) -> bool {
        match self {
            CompiledFilter::Int(f) => {
                slab.tag(row, f.field) == FieldTag::Int && f.accepts(slab.int(row, f.field))
            }
            CompiledFilter::Str { field, matches } => {
                slab.tag(row, *field) == FieldTag::Str
                    && matches
                        .get(slab.str_id(row, *field) as usize)
                        .copied()
                        .unwrap_or(false)
            }
            CompiledFilter::Set { field, op, target } => {
                if slab.tag(row, *field) != FieldTag::Set {
                    return false;
                }
                let has = match (target, slab.set_ids(row, *field)) {
                    (Some(id), Some(ids)) => ids.contains(id),
                    _ => false,
                };
                match op {
                    SetOp::Has => has,
                    SetOp::HasNot => !has,
                }
            }
        }
    }
}

/// Compile the filter list against one block.
pub(crate) fn compile(filters: &[Filter], block: &TableBlock) -> Result<Vec<CompiledFilter>> {
    filters
        .iter()
        .map(|filter| {
            Ok(match filter {
                Filter::Int(f) => CompiledFilter::Int(f.clone()),
                Filter::Str(f) => {
                    let empty = TableColumnView::default();
                    let names = block
                        .columns
                        .get(&f.field)
                        .map(TableColumnView::from)
                        .unwrap_or(empty);
                    let matches = match f.op {
                        StrOp::Eq => names.map(|s| s == f.value),
                        StrOp::Ne => names.map(|s| s != f.value),
                        StrOp::Re => {
                            let re = Regex::new(&f.value)?;
                            names.map(|s| re.is_match(s))
                        }
                        StrOp::NotRe => {
                            let re = Regex::new(&f.value)?;
                            names.map(|s| !re.is_match(s))
                        }
                    };
                    CompiledFilter::Str { field: f.field, matches }
                }
                Filter::Set(f) => {
                    let target = block
                        .columns
                        .get(&f.field)
                        .and_then(|col| {
                            (0..col.len() as i32).find(|&id| col.string_for_val(id) == Some(f.value.as_str()))
                        });
                    CompiledFilter::Set { field: f.field, op: f.op, target }
                }
            })
        })
        .collect()
}

/// Borrowed view over a block column's intern table, for building match
/// tables.
#[derive(Default)]
struct TableColumnView<'a> {
    names: Vec<&'a str>,
}

impl<'a> From<&'a crate::table::block::TableColumn> for TableColumnView<'a> {
    fn from(col: &'a crate::table::block::TableColumn) -> Self {
        let names = (0..col.len() as i32)
            .map(|id| col.string_for_val(id).unwrap_or(""))
            .collect();
        Self { names }
    }
}

impl<'a> TableColumnView<'a> {
    fn map(&self, f: impl Fn(&str) -> bool) -> Vec<bool> {
        self.names.iter().map(|s| f(s)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_op_semantics() {
        let f = IntFilter { name: "age".into(), field: 0, op: IntOp::Ge, value: 10 };
        assert!(f.accepts(10));
        assert!(f.accepts(11));
        assert!(!f.accepts(9));

        let f = IntFilter { name: "age".into(), field: 0, op: IntOp::Ne, value: 10 };
        assert!(f.accepts(9));
        assert!(!f.accepts(10));
    }

    #[test]
    fn bad_regex_is_rejected_at_build_time() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = Table::open(dir.path(), "t", Default::default()).unwrap();
        t.get_or_create_key("host", FieldType::Str).unwrap();
        assert!(t.str_filter("host", StrOp::Re, "(unclosed").is_err());
        assert!(t.str_filter("host", StrOp::Re, "^east-.*$").is_ok());
    }

    #[test]
    fn filters_enforce_field_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = Table::open(dir.path(), "t", Default::default()).unwrap();
        t.get_or_create_key("age", FieldType::Int).unwrap();
        assert!(t.int_filter("age", IntOp::Gt, 3).is_ok());
        assert!(t.str_filter("age", StrOp::Eq, "x").is_err());
        assert!(t.int_filter("missing", IntOp::Eq, 1).is_err());
    }
}
