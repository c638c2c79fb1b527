// Copyright 2025 Rowscan Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Search plans
//!
//! A plan is produced by the query planner (out of scope) and binds one
//! cursor: which key to scan, over what range, under which key-part and
//! data constraints, and how the select list maps onto key parts or the
//! clustering-key fetch. Plans are immutable and shared via `Arc`; the
//! cursor re-derives its cached resolution whenever it is reset onto a
//! new plan.

use std::cmp::Ordering;

use smallvec::SmallVec;

use crate::core::{DataType, Error, KeyId, RelationId, Result, TupleRef, TxId, Value};

/// Sort order of one key part as stored in the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// One part of a key definition
#[derive(Debug, Clone)]
pub struct KeyPart {
    /// Attribute number in the relation
    pub attr_no: usize,
    /// Declared type, needed to undo descending storage
    pub data_type: DataType,
    /// Stored order of this part
    pub order: SortOrder,
}

impl KeyPart {
    /// Ascending part of the given type
    pub fn asc(attr_no: usize, data_type: DataType) -> Self {
        Self {
            attr_no,
            data_type,
            order: SortOrder::Ascending,
        }
    }

    /// Descending part of the given type
    pub fn desc(attr_no: usize, data_type: DataType) -> Self {
        Self {
            attr_no,
            data_type,
            order: SortOrder::Descending,
        }
    }
}

/// A key (index) definition
#[derive(Debug, Clone)]
pub struct SearchKey {
    pub id: KeyId,
    pub parts: Vec<KeyPart>,
    /// True for the clustering (primary) key whose entries carry the
    /// whole row
    pub is_clustering: bool,
    /// Number of leading parts that identify the logical row. Versions of
    /// one row share these values; trailing parts may differ between
    /// versions. A secondary key is unique over all its parts.
    pub unique_parts: usize,
}

impl SearchKey {
    /// Secondary key definition, unique over all its parts
    pub fn secondary(id: KeyId, parts: Vec<KeyPart>) -> Self {
        let unique_parts = parts.len();
        Self {
            id,
            parts,
            is_clustering: false,
            unique_parts,
        }
    }

    /// Clustering key definition whose entries carry the whole row;
    /// `unique_parts` leading parts form the primary key
    pub fn clustering(id: KeyId, parts: Vec<KeyPart>, unique_parts: usize) -> Self {
        Self {
            id,
            parts,
            is_clustering: true,
            unique_parts,
        }
    }

    /// Index of the part carrying `attr_no`, if present
    pub fn part_for_attr(&self, attr_no: usize) -> Option<usize> {
        self.parts.iter().position(|p| p.attr_no == attr_no)
    }
}

/// One end of a key range, expressed over a prefix of the key parts
#[derive(Debug, Clone)]
pub struct RangeBound {
    pub values: SmallVec<[Value; 4]>,
    pub inclusive: bool,
}

impl RangeBound {
    /// Inclusive bound over the given prefix values
    pub fn inclusive(values: impl IntoIterator<Item = Value>) -> Self {
        Self {
            values: values.into_iter().collect(),
            inclusive: true,
        }
    }

    /// Exclusive bound over the given prefix values
    pub fn exclusive(values: impl IntoIterator<Item = Value>) -> Self {
        Self {
            values: values.into_iter().collect(),
            inclusive: false,
        }
    }
}

/// Compares an entry's leading values against a bound prefix.
/// Only the bound's length participates; a full prefix match is `Equal`.
fn prefix_compare(entry: &[Value], bound: &[Value]) -> Ordering {
    for (e, b) in entry.iter().zip(bound.iter()) {
        match e.compare(b) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    if entry.len() < bound.len() {
        Ordering::Less
    } else {
        Ordering::Equal
    }
}

/// Key range of a scan; `None` means unbounded on that side
#[derive(Debug, Clone, Default)]
pub struct KeyRange {
    pub begin: Option<RangeBound>,
    pub end: Option<RangeBound>,
}

impl KeyRange {
    /// Unbounded range
    pub fn all() -> Self {
        Self::default()
    }

    /// Closed-open range `[begin, end)`
    pub fn closed_open(
        begin: impl IntoIterator<Item = Value>,
        end: impl IntoIterator<Item = Value>,
    ) -> Self {
        Self {
            begin: Some(RangeBound::inclusive(begin)),
            end: Some(RangeBound::exclusive(end)),
        }
    }

    /// Exact-match range over the given values
    pub fn exact(values: impl IntoIterator<Item = Value> + Clone) -> Self {
        Self {
            begin: Some(RangeBound::inclusive(values.clone())),
            end: Some(RangeBound::inclusive(values)),
        }
    }

    /// Returns true if an entry with these leading values falls inside
    pub fn contains(&self, entry: &[Value]) -> bool {
        if let Some(begin) = &self.begin {
            match prefix_compare(entry, &begin.values) {
                Ordering::Less => return false,
                Ordering::Equal if !begin.inclusive => return false,
                _ => {}
            }
        }
        if let Some(end) = &self.end {
            match prefix_compare(entry, &end.values) {
                Ordering::Greater => return false,
                Ordering::Equal if !end.inclusive => return false,
                _ => {}
            }
        }
        true
    }

    /// Returns true if these leading values lie past the range in the
    /// given direction (forward: past the end; backward: before the begin)
    pub fn is_past(&self, entry: &[Value], forward: bool) -> bool {
        if forward {
            match &self.end {
                Some(end) => match prefix_compare(entry, &end.values) {
                    Ordering::Greater => true,
                    Ordering::Equal => !end.inclusive,
                    Ordering::Less => false,
                },
                None => false,
            }
        } else {
            match &self.begin {
                Some(begin) => match prefix_compare(entry, &begin.values) {
                    Ordering::Less => true,
                    Ordering::Equal => !begin.inclusive,
                    Ordering::Greater => false,
                },
                None => false,
            }
        }
    }
}

/// Comparison operator for key-part and data constraints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl ConstraintOp {
    /// Evaluates `candidate op reference`
    pub fn matches(self, candidate: &Value, reference: &Value) -> bool {
        // SQL semantics: NULL matches nothing
        if candidate.is_null() || reference.is_null() {
            return false;
        }
        let ord = candidate.compare(reference);
        match self {
            ConstraintOp::Eq => ord == Ordering::Equal,
            ConstraintOp::Ne => ord != Ordering::Equal,
            ConstraintOp::Lt => ord == Ordering::Less,
            ConstraintOp::Le => ord != Ordering::Greater,
            ConstraintOp::Gt => ord == Ordering::Greater,
            ConstraintOp::Ge => ord != Ordering::Less,
        }
    }
}

/// Constraint on one part of the scanned key, applied to every visible
/// entry during the index step
#[derive(Debug, Clone)]
pub struct KeyConstraint {
    pub part_index: usize,
    pub op: ConstraintOp,
    pub value: Value,
}

/// Constraint on one attribute of the fetched row, applied by the data
/// search after the clustering fetch
#[derive(Debug, Clone)]
pub struct DataConstraint {
    pub attr_no: usize,
    pub op: ConstraintOp,
    pub value: Value,
}

/// Where a select-list attribute is materialized from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectSource {
    /// Part of the scanned key entry
    Key(usize),
    /// Attribute of the clustering-key entry fetched by the data search
    Data(usize),
}

/// Select list resolved against a plan's key parts
#[derive(Debug, Clone, Default)]
pub struct ResolvedSelect {
    pub sources: Vec<SelectSource>,
    pub needs_data_fetch: bool,
    pub has_blob: bool,
}

/// A complete search plan binding one cursor
#[derive(Debug, Clone)]
pub struct SearchPlan {
    pub relation: RelationId,
    /// The key being scanned (clustering or secondary)
    pub key: SearchKey,
    /// The relation's clustering key, used by the data search and for
    /// tuple references
    pub clustering_key: SearchKey,
    pub range: KeyRange,
    pub key_constraints: Vec<KeyConstraint>,
    pub data_constraints: Vec<DataConstraint>,
    /// Attribute numbers the caller wants, in output order
    pub select: Vec<usize>,
    /// Positions within `key.parts` that carry the clustering key's unique
    /// (primary) values, in clustering-part order; one entry per unique
    /// clustering part. For a clustering scan this is the identity over
    /// the leading unique parts.
    pub clustering_ref_parts: Vec<usize>,
}

impl SearchPlan {
    /// Resolves the select list against the scanned key. Attributes not
    /// present among the key parts come from the clustering-key fetch.
    pub fn resolve_select(&self) -> Result<ResolvedSelect> {
        let mut resolved = ResolvedSelect::default();
        for &attr_no in &self.select {
            if let Some(part) = self.key.part_for_attr(attr_no) {
                if self.key.parts[part].data_type == DataType::Blob {
                    resolved.has_blob = true;
                }
                resolved.sources.push(SelectSource::Key(part));
            } else {
                let part = self.clustering_key.part_for_attr(attr_no).ok_or(
                    Error::AttributeUnavailable {
                        key: self.key.id,
                        attr: attr_no,
                    },
                )?;
                if self.clustering_key.parts[part].data_type == DataType::Blob {
                    resolved.has_blob = true;
                }
                resolved.sources.push(SelectSource::Data(part));
                resolved.needs_data_fetch = true;
            }
        }
        // Explicit data constraints force the clustering fetch even when
        // every selected column lives in the scan key
        if !self.data_constraints.is_empty() {
            resolved.needs_data_fetch = true;
        }
        Ok(resolved)
    }

    /// Returns true if stepping this plan must run the data search
    pub fn needs_data_fetch(&self) -> Result<bool> {
        Ok(self.resolve_select()?.needs_data_fetch)
    }

    /// Extracts the clustering-key values from a scanned entry's decoded
    /// values and builds the lockable tuple reference
    pub fn tuple_ref_from_entry(&self, entry: &[Value], producing_tx: TxId) -> Result<TupleRef> {
        let mut key_values: SmallVec<[Value; 4]> =
            SmallVec::with_capacity(self.clustering_ref_parts.len());
        for (&part, cpart) in self
            .clustering_ref_parts
            .iter()
            .zip(self.clustering_key.parts.iter())
        {
            let value = entry.get(part).ok_or_else(|| {
                Error::corrupt_key(format!("entry lacks clustering ref part {}", part))
            })?;
            // Descending key parts carry their stored form; the reference
            // must use the normal form the clustering tree is keyed by.
            let part_def = self.key.parts.get(part).ok_or_else(|| {
                Error::corrupt_key(format!("clustering ref part {} not in key", part))
            })?;
            let value = match part_def.order {
                SortOrder::Ascending => value.clone(),
                SortOrder::Descending => value.from_descending_stored(cpart.data_type)?,
            };
            key_values.push(value);
        }
        Ok(TupleRef::new(key_values, producing_tx))
    }

    /// Returns true if the flat materialization path may be used: a
    /// clustering scan with no BLOB columns, no data fetch and no
    /// descending parts, so values copy across without per-attribute
    /// branching
    pub fn allows_flat_materialization(&self, resolved: &ResolvedSelect) -> bool {
        self.key.is_clustering
            && !resolved.has_blob
            && !resolved.needs_data_fetch
            && self
                .key
                .parts
                .iter()
                .all(|p| p.order == SortOrder::Ascending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_part_key(id: u32, clustering: bool) -> SearchKey {
        let parts = vec![
            KeyPart::asc(0, DataType::Integer),
            KeyPart::asc(1, DataType::Text),
        ];
        if clustering {
            SearchKey::clustering(KeyId(id), parts, 1)
        } else {
            SearchKey::secondary(KeyId(id), parts)
        }
    }

    fn plan_over(key: SearchKey, clustering_key: SearchKey, select: Vec<usize>) -> SearchPlan {
        let clustering_ref_parts = (0..clustering_key.unique_parts).collect();
        SearchPlan {
            relation: RelationId(1),
            key,
            clustering_key,
            range: KeyRange::all(),
            key_constraints: Vec::new(),
            data_constraints: Vec::new(),
            select,
            clustering_ref_parts,
        }
    }

    #[test]
    fn test_range_contains() {
        let range = KeyRange::closed_open([Value::Integer(10)], [Value::Integer(20)]);
        assert!(!range.contains(&[Value::Integer(9)]));
        assert!(range.contains(&[Value::Integer(10)]));
        assert!(range.contains(&[Value::Integer(19), Value::text("x")]));
        assert!(!range.contains(&[Value::Integer(20)]));
    }

    #[test]
    fn test_range_is_past() {
        let range = KeyRange::closed_open([Value::Integer(10)], [Value::Integer(20)]);
        assert!(range.is_past(&[Value::Integer(20)], true));
        assert!(!range.is_past(&[Value::Integer(19)], true));
        assert!(range.is_past(&[Value::Integer(9)], false));
        assert!(!range.is_past(&[Value::Integer(10)], false));
    }

    #[test]
    fn test_exact_range_matches_longer_entries() {
        let range = KeyRange::exact([Value::Integer(5)]);
        assert!(range.contains(&[Value::Integer(5), Value::text("tail")]));
        assert!(!range.contains(&[Value::Integer(6)]));
    }

    #[test]
    fn test_constraint_ops() {
        assert!(ConstraintOp::Eq.matches(&Value::Integer(3), &Value::Integer(3)));
        assert!(ConstraintOp::Lt.matches(&Value::Integer(2), &Value::Integer(3)));
        assert!(ConstraintOp::Ge.matches(&Value::Integer(3), &Value::Integer(3)));
        // NULL matches nothing
        assert!(!ConstraintOp::Eq.matches(&Value::Null, &Value::Null));
        assert!(!ConstraintOp::Ne.matches(&Value::Null, &Value::Integer(1)));
    }

    #[test]
    fn test_select_resolution_key_only() {
        let key = two_part_key(1, true);
        let plan = plan_over(key.clone(), key, vec![0, 1]);
        let resolved = plan.resolve_select().unwrap();
        assert_eq!(
            resolved.sources,
            vec![SelectSource::Key(0), SelectSource::Key(1)]
        );
        assert!(!resolved.needs_data_fetch);
        assert!(plan.allows_flat_materialization(&resolved));
    }

    #[test]
    fn test_select_resolution_needs_data() {
        // secondary key carries attrs {1, 0}; attr 2 must come from data
        let secondary = SearchKey::secondary(
            KeyId(2),
            vec![
                KeyPart::asc(1, DataType::Text),
                KeyPart::asc(0, DataType::Integer),
            ],
        );
        let clustering = SearchKey::clustering(
            KeyId(1),
            vec![
                KeyPart::asc(0, DataType::Integer),
                KeyPart::asc(1, DataType::Text),
                KeyPart::asc(2, DataType::Float),
            ],
            1,
        );
        let mut plan = plan_over(secondary, clustering, vec![1, 2]);
        plan.clustering_ref_parts = vec![1]; // part 1 of secondary = attr 0

        let resolved = plan.resolve_select().unwrap();
        assert_eq!(
            resolved.sources,
            vec![SelectSource::Key(0), SelectSource::Data(2)]
        );
        assert!(resolved.needs_data_fetch);
        assert!(!plan.allows_flat_materialization(&resolved));
    }

    #[test]
    fn test_data_constraints_force_fetch() {
        let key = two_part_key(1, true);
        let mut plan = plan_over(key.clone(), key, vec![0]);
        plan.data_constraints.push(DataConstraint {
            attr_no: 1,
            op: ConstraintOp::Eq,
            value: Value::text("x"),
        });
        assert!(plan.resolve_select().unwrap().needs_data_fetch);
    }

    #[test]
    fn test_tuple_ref_from_entry() {
        let key = two_part_key(1, true);
        let plan = plan_over(key.clone(), key, vec![0, 1]);
        let entry = [Value::Integer(7), Value::text("k")];
        let tref = plan.tuple_ref_from_entry(&entry, TxId(9)).unwrap();
        // only the unique clustering prefix identifies the row
        assert_eq!(tref.key_values(), &[Value::Integer(7)]);
        assert_eq!(tref.producing_tx(), TxId(9));
    }

    #[test]
    fn test_unknown_select_attr_is_error() {
        let key = two_part_key(1, true);
        let plan = plan_over(key.clone(), key, vec![5]);
        assert!(matches!(
            plan.resolve_select(),
            Err(Error::AttributeUnavailable { .. })
        ));
    }
}
