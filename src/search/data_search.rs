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

//! Data search
//!
//! Fetches the full row behind a secondary-key entry: an exact-match scan
//! of the clustering key for each row whose requested columns are not in
//! the scanned key. The match-key buffer is grown and reused across
//! fetches, never shrunk, so repeated fetches allocate nothing in steady
//! state.

use std::cmp::Ordering;

use crate::core::{RelationId, Result, ScanDirection, TxId, Value};
use crate::key::CompressedKeyBuf;
use crate::plan::{KeyConstraint, KeyRange, SearchPlan};
use crate::search::index_search::{IndexSearch, IndexStep};
use crate::search::return_key::SearchReturnKey;
use crate::search::time_constraint::TimeConstraint;
use crate::traits::{TreeKind, TreeSource};

/// Outcome of one clustering-key fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFetch {
    /// The row was fetched into the data return key
    Found,
    /// No row (or the row fails the data constraints)
    NotFound,
    /// The fetch hit a key-level lock
    Wait,
}

/// Exact-match clustering-key search owned by one cursor
pub struct DataSearch {
    relation: RelationId,
    search: IndexSearch,
    /// Reusable encoding buffer for the current match key; grown across
    /// fetches, never shrunk
    match_key: CompressedKeyBuf,
    pessimistic: bool,
}

impl DataSearch {
    /// Opens the data search for a plan. The clustering tree is scanned
    /// with the plan's data constraints mapped onto clustering key parts.
    pub fn open(source: &dyn TreeSource, plan: &SearchPlan, pessimistic: bool) -> Result<Self> {
        let scan = source.open_scan(plan.clustering_key.id, TreeKind::Visible)?;
        let constraints = Self::map_constraints(plan)?;
        let search = IndexSearch::new(
            plan.clustering_key.id,
            scan,
            plan.clustering_key.parts.clone(),
            plan.clustering_key.unique_parts,
            constraints,
            KeyRange::all(),
        );
        Ok(Self {
            relation: plan.relation,
            search,
            match_key: CompressedKeyBuf::new(),
            pessimistic,
        })
    }

    fn map_constraints(plan: &SearchPlan) -> Result<Vec<KeyConstraint>> {
        plan.data_constraints
            .iter()
            .map(|c| {
                let part_index = plan.clustering_key.part_for_attr(c.attr_no).ok_or(
                    crate::core::Error::AttributeUnavailable {
                        key: plan.clustering_key.id,
                        attr: c.attr_no,
                    },
                )?;
                Ok(KeyConstraint {
                    part_index,
                    op: c.op,
                    value: c.value.clone(),
                })
            })
            .collect()
    }

    /// Re-derives constraints from a new plan without reallocating the
    /// search; used by cursor reset
    pub fn reset(&mut self, plan: &SearchPlan) -> Result<()> {
        let constraints = Self::map_constraints(plan)?;
        self.search.reset(Some(KeyRange::all()), Some(constraints));
        Ok(())
    }

    /// Relation this search fetches from
    pub fn relation(&self) -> RelationId {
        self.relation
    }

    /// True when explicit data constraints are in force, making a
    /// not-found fetch an acceptable outcome
    pub fn has_constraints(&self) -> bool {
        self.search.constraint_count() > 0
    }

    /// Fetches the row identified by the clustering-key values: an
    /// exact-match probe positioned at the match key, accepting only an
    /// entry whose leading values equal it
    pub fn fetch(
        &mut self,
        key_values: &[Value],
        stmt_tx: TxId,
        tc: &TimeConstraint,
    ) -> Result<DataFetch> {
        self.match_key.encode_values(key_values);
        self.search.set_position(&self.match_key);

        match self.search.step(ScanDirection::Forward, stmt_tx, tc)? {
            IndexStep::Found => {
                let entry = self.search.srk_ref().decode_values()?;
                let matches = key_values.len() <= entry.len()
                    && key_values
                        .iter()
                        .zip(entry.iter())
                        .all(|(a, b)| a.compare(b) == Ordering::Equal);
                if matches {
                    Ok(DataFetch::Found)
                } else {
                    // The probe ran past the match key: no such row
                    Ok(DataFetch::NotFound)
                }
            }
            IndexStep::NotFound | IndexStep::End | IndexStep::LockPlaceholder => {
                Ok(DataFetch::NotFound)
            }
            IndexStep::WaitLock => Ok(DataFetch::Wait),
        }
    }

    /// The return key holding the fetched row
    pub fn srk(&mut self) -> &mut SearchReturnKey {
        self.search.srk()
    }

    /// Read-only view of the fetched row
    pub fn srk_ref(&self) -> &SearchReturnKey {
        self.search.srk_ref()
    }

    /// Encoded form of the most recent match key
    pub fn match_key(&self) -> &CompressedKeyBuf {
        &self.match_key
    }

    /// Whether the fetch path runs under the pessimistic discipline
    pub fn is_pessimistic(&self) -> bool {
        self.pessimistic
    }

    /// Applies or clears the long-sequential classification on the
    /// clustering scan
    pub fn set_long_sequential(&mut self, on: bool) {
        self.search.set_long_sequential(on);
    }

    /// Whether the clustering scan is classified long-sequential
    pub fn is_long_sequential(&self) -> bool {
        self.search.is_long_sequential()
    }
}

impl std::fmt::Debug for DataSearch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSearch")
            .field("relation", &self.relation)
            .field("pessimistic", &self.pessimistic)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::core::{CommitVersion, DataType, KeyId, RelationId, TxState};
    use crate::mem::{MemTree, MemTreeSource};
    use crate::plan::{ConstraintOp, DataConstraint, KeyPart, SearchKey, SearchPlan};
    use crate::traits::TxBuffer;

    fn fixture() -> (MemTreeSource, Arc<MemTree>, SearchPlan, TimeConstraint) {
        let source = MemTreeSource::new();
        let tree = source.add_tree(RelationId(1), KeyId(1), 1);

        let clustering = SearchKey::clustering(
            KeyId(1),
            vec![
                KeyPart::asc(0, DataType::Integer),
                KeyPart::asc(1, DataType::Text),
            ],
            1,
        );
        let secondary = SearchKey::secondary(
            KeyId(2),
            vec![
                KeyPart::asc(1, DataType::Text),
                KeyPart::asc(0, DataType::Integer),
            ],
        );
        let plan = SearchPlan {
            relation: RelationId(1),
            key: secondary,
            clustering_key: clustering,
            range: KeyRange::all(),
            key_constraints: Vec::new(),
            data_constraints: Vec::new(),
            select: vec![1],
            clustering_ref_parts: vec![1],
        };

        let buffer = Arc::new(TxBuffer::new());
        buffer.record(TxId(1), TxState::Committed(CommitVersion(1)));
        let tc = TimeConstraint::fixed_window(buffer, CommitVersion(10), TxId(9));
        (source, tree, plan, tc)
    }

    #[test]
    fn test_fetch_finds_exact_row() {
        let (source, tree, plan, tc) = fixture();
        tree.insert(&[Value::Integer(5), Value::text("five")], TxId(1), false, 0);
        tree.insert(&[Value::Integer(6), Value::text("six")], TxId(1), false, 0);

        let mut data = DataSearch::open(&source, &plan, false).unwrap();
        assert_eq!(
            data.fetch(&[Value::Integer(5)], TxId(9), &tc).unwrap(),
            DataFetch::Found
        );
        assert_eq!(data.srk().attr_value(1).unwrap(), Value::text("five"));

        assert_eq!(
            data.fetch(&[Value::Integer(7)], TxId(9), &tc).unwrap(),
            DataFetch::NotFound
        );
    }

    #[test]
    fn test_fetch_rejects_neighboring_key() {
        let (source, tree, plan, tc) = fixture();
        // Only row 6 exists; a probe for 5 lands on it and must refuse
        tree.insert(&[Value::Integer(6), Value::text("six")], TxId(1), false, 0);

        let mut data = DataSearch::open(&source, &plan, false).unwrap();
        assert_eq!(
            data.fetch(&[Value::Integer(5)], TxId(9), &tc).unwrap(),
            DataFetch::NotFound
        );
    }

    #[test]
    fn test_data_constraints_filter() {
        let (source, tree, mut plan, tc) = fixture();
        tree.insert(&[Value::Integer(5), Value::text("keep")], TxId(1), false, 0);
        tree.insert(&[Value::Integer(6), Value::text("drop")], TxId(1), false, 0);
        plan.data_constraints.push(DataConstraint {
            attr_no: 1,
            op: ConstraintOp::Eq,
            value: Value::text("keep"),
        });

        let mut data = DataSearch::open(&source, &plan, false).unwrap();
        assert!(data.has_constraints());
        assert_eq!(
            data.fetch(&[Value::Integer(5)], TxId(9), &tc).unwrap(),
            DataFetch::Found
        );
        assert_eq!(
            data.fetch(&[Value::Integer(6)], TxId(9), &tc).unwrap(),
            DataFetch::NotFound
        );
    }

    #[test]
    fn test_match_buffer_reused_across_fetches() {
        let (source, tree, plan, tc) = fixture();
        for i in 0i64..4 {
            tree.insert(&[Value::Integer(i), Value::text("r")], TxId(1), false, 0);
        }

        let mut data = DataSearch::open(&source, &plan, false).unwrap();
        data.fetch(&[Value::Integer(0)], TxId(9), &tc).unwrap();
        let ptr = data.match_key().as_bytes().as_ptr();

        // Same-size match keys must not reallocate the buffer
        for i in 1i64..4 {
            data.fetch(&[Value::Integer(i)], TxId(9), &tc).unwrap();
            assert_eq!(data.match_key().as_bytes().as_ptr(), ptr);
        }
    }
}
