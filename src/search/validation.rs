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

//! Index validation search
//!
//! A read-only scan over the uncommitted-version tree, consumed by commit
//! validation. It shares the key-range and time-constraint machinery with
//! the ordinary cursor but takes no locks, materializes nothing, and does
//! not collapse version chains: every uncommitted entry is yielded,
//! delete marks included, in strictly monotonic key order. The ordering
//! assertion on every step is the correctness basis of the validation
//! algorithm that consumes this scan.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::core::{Error, KeyId, Result, ScanDirection, TxId};
use crate::key::CompressedKeyBuf;
use crate::plan::{KeyRange, SearchKey};
use crate::search::return_key::SearchReturnKey;
use crate::search::time_constraint::TimeConstraint;
use crate::traits::{TreeKind, TreeScan, TreeSource, TreeStep};

/// Read-only scan over one key's uncommitted tree
pub struct IndexValidationSearch {
    key_id: KeyId,
    scan: Box<dyn TreeScan>,
    tc: TimeConstraint,
    srk: SearchReturnKey,
    last_key: CompressedKeyBuf,
}

impl IndexValidationSearch {
    /// Opens the validation scan over a key's uncommitted tree, bounded
    /// by the plan's range and visible to the maximum transaction id
    pub fn open(
        source: &dyn TreeSource,
        buffer: Arc<crate::traits::TxBuffer>,
        key: &SearchKey,
        range: KeyRange,
    ) -> Result<Self> {
        let mut scan = source.open_scan(key.id, TreeKind::Uncommitted)?;
        scan.reset(Some(&range));
        Ok(Self {
            key_id: key.id,
            scan,
            tc: TimeConstraint::for_validation(buffer),
            srk: SearchReturnKey::new(),
            last_key: CompressedKeyBuf::new(),
        })
    }

    /// The key being validated
    pub fn key_id(&self) -> KeyId {
        self.key_id
    }

    /// Yields the next uncommitted entry, or `None` at end of range.
    /// Every successful step asserts monotonic key order.
    pub fn next(&mut self) -> Result<Option<&SearchReturnKey>> {
        loop {
            match self
                .scan
                .step(ScanDirection::Forward, TxId::MAX, &mut self.srk)
            {
                TreeStep::Found | TreeStep::LockPlaceholder => {
                    if !self.tc.accepts(self.srk.producing_tx()) {
                        continue;
                    }
                    if !self.last_key.is_empty()
                        && self.srk.key().compare(&self.last_key)? == Ordering::Less
                    {
                        return Err(Error::KeyOrderViolation { key: self.key_id });
                    }
                    self.last_key.load(self.srk.key().as_bytes());
                    return Ok(Some(&self.srk));
                }
                TreeStep::NotFound => continue,
                TreeStep::End => return Ok(None),
                TreeStep::Cancel => return Err(Error::Cancelled),
                TreeStep::UniqueViolation => {
                    return Err(Error::UniqueViolation { key: self.key_id })
                }
                TreeStep::WaitLock | TreeStep::Deadlock => {
                    // The uncommitted tree is scanned without locking;
                    // lock-flavored outcomes from it are a layer error
                    return Err(Error::internal(
                        "uncommitted-tree scan returned a lock outcome",
                    ));
                }
            }
        }
    }
}

impl std::fmt::Debug for IndexValidationSearch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexValidationSearch")
            .field("key_id", &self.key_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DataType, RelationId, Value};
    use crate::mem::MemTreeSource;
    use crate::plan::KeyPart;
    use crate::traits::TxBuffer;

    fn key_def() -> SearchKey {
        SearchKey::secondary(KeyId(4), vec![KeyPart::asc(0, DataType::Integer)])
    }

    #[test]
    fn test_yields_uncommitted_and_delete_marks_in_order() {
        let source = MemTreeSource::new();
        let tree = source.add_uncommitted_tree(RelationId(1), KeyId(4), 1);
        tree.insert(&[Value::Integer(3)], TxId(10), false, 0);
        tree.insert(&[Value::Integer(1)], TxId(11), false, 0);
        tree.insert(&[Value::Integer(2)], TxId(12), true, 0);

        let buffer = Arc::new(TxBuffer::new());
        // All three producers are still active; validation sees them anyway
        for tx in [10, 11, 12] {
            buffer.record(TxId(tx), crate::core::TxState::Active);
        }

        let mut search =
            IndexValidationSearch::open(&source, buffer, &key_def(), KeyRange::all()).unwrap();

        let mut seen = Vec::new();
        while let Some(srk) = search.next().unwrap() {
            let value = srk.key().decode_values().unwrap()[0].clone();
            seen.push((value, srk.key().delete_mark()));
        }
        assert_eq!(
            seen,
            vec![
                (Value::Integer(1), false),
                (Value::Integer(2), true),
                (Value::Integer(3), false),
            ]
        );
    }

    #[test]
    fn test_range_bounds_apply() {
        let source = MemTreeSource::new();
        let tree = source.add_uncommitted_tree(RelationId(1), KeyId(4), 1);
        for i in 0i64..6 {
            tree.insert(&[Value::Integer(i)], TxId(10), false, 0);
        }
        let buffer = Arc::new(TxBuffer::new());
        let range = KeyRange::closed_open([Value::Integer(2)], [Value::Integer(4)]);
        let mut search =
            IndexValidationSearch::open(&source, buffer, &key_def(), range).unwrap();

        let mut seen = Vec::new();
        while let Some(srk) = search.next().unwrap() {
            seen.push(srk.key().decode_values().unwrap()[0].clone());
        }
        assert_eq!(seen, vec![Value::Integer(2), Value::Integer(3)]);
    }

    #[test]
    fn test_missing_tree_is_unknown_key() {
        let source = MemTreeSource::new();
        let buffer = Arc::new(TxBuffer::new());
        assert!(matches!(
            IndexValidationSearch::open(&source, buffer, &key_def(), KeyRange::all()),
            Err(Error::UnknownKey(KeyId(4)))
        ));
    }
}
