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

//! Index search
//!
//! Wraps the tree layer's raw range scan with everything the cursor needs
//! per step: time-constraint filtering, suppression of older versions once
//! a logical key is decided, key-part constraint matching, and the
//! long-sequential hint. The tree yields physical entries newest-version
//! first within a logical key; the first visible version decides the row
//! (a visible delete mark suppresses the key entirely).

use std::cmp::Ordering;

use tracing::trace;

use crate::core::{Error, KeyId, Result, ScanDirection, TxId, Value};
use crate::key::CompressedKeyBuf;
use crate::plan::{KeyConstraint, KeyPart, KeyRange, SortOrder};
use crate::search::return_key::SearchReturnKey;
use crate::search::time_constraint::TimeConstraint;
use crate::traits::{TreeScan, TreeStep};

/// Outcome of one filtered index step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStep {
    /// A visible, constraint-matching entry is loaded in the return key
    Found,
    /// The step landed on a visible entry that fails the constraints;
    /// position advanced, the scan may continue
    NotFound,
    /// Range exhausted in the step direction
    End,
    /// The step hit a key-level lock; the row lock must be resolved
    /// before the position can move
    WaitLock,
    /// The entry is a lock placeholder carrying no visible data
    LockPlaceholder,
}

/// A visibility-filtered, constraint-checked scan over one key's tree
pub struct IndexSearch {
    key_id: KeyId,
    scan: Box<dyn TreeScan>,
    key_parts: Vec<KeyPart>,
    /// Leading parts identifying the logical row; versions share them
    unique_parts: usize,
    constraints: Vec<KeyConstraint>,
    range: KeyRange,
    srk: SearchReturnKey,
    /// Values of the most recently decided logical key; further versions
    /// of the same key are suppressed until the values change
    decided_key: CompressedKeyBuf,
    suppressing: bool,
    long_sequential: bool,
}

impl IndexSearch {
    /// Opens a filtered search over a raw tree scan
    pub fn new(
        key_id: KeyId,
        mut scan: Box<dyn TreeScan>,
        key_parts: Vec<KeyPart>,
        unique_parts: usize,
        constraints: Vec<KeyConstraint>,
        range: KeyRange,
    ) -> Self {
        scan.reset(Some(&range));
        Self {
            key_id,
            scan,
            key_parts,
            unique_parts,
            constraints,
            range,
            srk: SearchReturnKey::new(),
            decided_key: CompressedKeyBuf::new(),
            suppressing: false,
            long_sequential: false,
        }
    }

    /// The key this search scans
    pub fn key_id(&self) -> KeyId {
        self.key_id
    }

    /// Replaces range and constraints and repositions at the range start.
    /// `None` keeps the current range (the restart case).
    pub fn reset(&mut self, range: Option<KeyRange>, constraints: Option<Vec<KeyConstraint>>) {
        if let Some(range) = range {
            self.range = range;
        }
        if let Some(constraints) = constraints {
            self.constraints = constraints;
        }
        self.scan.reset(Some(&self.range));
        self.srk.clear();
        self.suppressing = false;
    }

    /// Current key range
    pub fn range(&self) -> &KeyRange {
        &self.range
    }

    /// Number of key-part constraints in force
    pub fn constraint_count(&self) -> usize {
        self.constraints.len()
    }

    /// The return key holding the current entry
    pub fn srk(&mut self) -> &mut SearchReturnKey {
        &mut self.srk
    }

    /// Read-only view of the return key
    pub fn srk_ref(&self) -> &SearchReturnKey {
        &self.srk
    }

    /// Advances one visible entry in `direction`
    pub fn step(
        &mut self,
        direction: ScanDirection,
        stmt_tx: TxId,
        tc: &TimeConstraint,
    ) -> Result<IndexStep> {
        loop {
            match self.scan.step(direction, stmt_tx, &mut self.srk) {
                TreeStep::Found => {
                    if self.suppressing && self.same_as_decided()? {
                        continue;
                    }
                    self.suppressing = false;
                    if !tc.accepts(self.srk.producing_tx()) {
                        // An older version of this key may still be visible
                        continue;
                    }
                    // First visible version decides the logical key
                    self.decided_key.load(self.srk.key().as_bytes());
                    self.suppressing = true;
                    if self.srk.key().delete_mark() {
                        // Row is deleted inside this window
                        continue;
                    }
                    if !self.constraints_match()? {
                        return Ok(IndexStep::NotFound);
                    }
                    return Ok(IndexStep::Found);
                }
                TreeStep::NotFound => return Ok(IndexStep::NotFound),
                TreeStep::End => return Ok(IndexStep::End),
                TreeStep::WaitLock => return Ok(IndexStep::WaitLock),
                TreeStep::LockPlaceholder => {
                    if !tc.accepts(self.srk.producing_tx()) {
                        continue;
                    }
                    return Ok(IndexStep::LockPlaceholder);
                }
                TreeStep::Cancel => return Err(Error::Cancelled),
                TreeStep::UniqueViolation => {
                    return Err(Error::UniqueViolation { key: self.key_id })
                }
                TreeStep::Deadlock => return Err(Error::Deadlock { tx: stmt_tx }),
            }
        }
    }

    /// Positions past the range end (forward) or before its start
    /// (backward)
    pub fn goto_end(&mut self, direction: ScanDirection) {
        self.scan.goto_end(direction);
        self.srk.clear();
        self.suppressing = false;
    }

    /// Positions just before the given key
    pub fn set_position(&mut self, key: &CompressedKeyBuf) {
        self.scan.set_position(key);
        self.srk.clear();
        self.suppressing = false;
    }

    /// Copies the tree's current position key into `out`
    pub fn last_key(&self, out: &mut CompressedKeyBuf) -> bool {
        self.scan.last_key(out)
    }

    /// Applies or clears the long-sequential classification
    pub fn set_long_sequential(&mut self, on: bool) {
        if self.long_sequential != on {
            trace!(key = self.key_id.0, on, "long-sequential scan mark");
        }
        self.long_sequential = on;
        self.scan.set_long_sequential(on);
    }

    /// Whether the scan is currently classified long-sequential
    pub fn is_long_sequential(&self) -> bool {
        self.long_sequential
    }

    /// Whether the underlying tree changed since the last check
    pub fn has_changed(&mut self) -> bool {
        self.scan.has_changed()
    }

    fn same_as_decided(&self) -> Result<bool> {
        if self.decided_key.is_empty() {
            return Ok(false);
        }
        // Two entries are versions of the same logical row when their
        // unique leading values match, regardless of delete marks or
        // trailing attribute differences
        let a = self.srk.key().decode_values()?;
        let b = self.decided_key.decode_values()?;
        if a.len() < self.unique_parts || b.len() < self.unique_parts {
            return Ok(false);
        }
        Ok(a[..self.unique_parts]
            .iter()
            .zip(b[..self.unique_parts].iter())
            .all(|(x, y)| x.compare(y) == Ordering::Equal))
    }

    fn constraints_match(&mut self) -> Result<bool> {
        if self.constraints.is_empty() {
            return Ok(true);
        }
        // Decode each constrained part, undoing descending storage so the
        // comparison runs over logical values
        for i in 0..self.constraints.len() {
            let (part_index, op, reference) = {
                let c = &self.constraints[i];
                (c.part_index, c.op, c.value.clone())
            };
            let part = self.key_parts.get(part_index).ok_or_else(|| {
                Error::corrupt_key(format!("constraint on missing key part {}", part_index))
            })?;
            let stored = self.srk.attr_value(part_index)?;
            let logical = match part.order {
                SortOrder::Ascending => stored,
                SortOrder::Descending => stored.from_descending_stored(part.data_type)?,
            };
            if !op.matches(&logical, &reference) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Decoded logical values of the current entry, with descending parts
    /// restored to their normal form
    pub fn current_logical_values(&mut self) -> Result<smallvec::SmallVec<[Value; 4]>> {
        let count = self.srk.key().value_count();
        let mut out = smallvec::SmallVec::with_capacity(count);
        for i in 0..count {
            let stored = self.srk.attr_value(i)?;
            let value = match self.key_parts.get(i) {
                Some(part) if part.order == SortOrder::Descending => {
                    stored.from_descending_stored(part.data_type)?
                }
                _ => stored,
            };
            out.push(value);
        }
        Ok(out)
    }
}

impl std::fmt::Debug for IndexSearch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexSearch")
            .field("key_id", &self.key_id)
            .field("constraints", &self.constraints.len())
            .field("long_sequential", &self.long_sequential)
            .finish()
    }
}
