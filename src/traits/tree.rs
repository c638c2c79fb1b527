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

//! Contract with the index/B-tree layer
//!
//! The tree layer owns node format and page traversal; the cursor consumes
//! a positioned range scan through this trait. A scan yields every physical
//! key entry in range — visibility filtering is layered on top by the
//! index search, not here.

use crate::core::{KeyId, RelationId, Result, ScanDirection, TxId};
use crate::key::CompressedKeyBuf;
use crate::search::SearchReturnKey;

/// Outcome of one raw tree step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeStep {
    /// An entry was decoded into the return key
    Found,
    /// Nothing at this step, but the scan may continue
    NotFound,
    /// The range is exhausted in the step direction
    End,
    /// The step ran into a key-level lock; the caller must resolve the
    /// row lock before the position can advance
    WaitLock,
    /// The entry is a lock placeholder with no visible data
    LockPlaceholder,
    /// The scan was cancelled cooperatively
    Cancel,
    /// A duplicate key surfaced during the step (unique trees only)
    UniqueViolation,
    /// The tree layer's own latching detected a deadlock
    Deadlock,
}

/// Which tree of a key the scan runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeKind {
    /// The ordinary tree holding visible (committed and in-flight) entries
    Visible,
    /// The uncommitted-version tree consumed by commit validation
    Uncommitted,
}

/// A positioned range scan over one key's tree
///
/// Implementations keep the position between calls; `step` writes the next
/// entry into the caller's reusable [`SearchReturnKey`].
pub trait TreeScan: Send {
    /// Repositions before the start of the range (or after its end for a
    /// backward scan). `range` replaces the scan's key range; `None`
    /// keeps the current one.
    fn reset(&mut self, range: Option<&crate::plan::KeyRange>);

    /// Advances one entry in `direction` on behalf of `stmt_tx`
    fn step(
        &mut self,
        direction: ScanDirection,
        stmt_tx: TxId,
        srk: &mut SearchReturnKey,
    ) -> TreeStep;

    /// Positions past the last entry (forward) or before the first
    /// (backward), so the next step in the opposite direction yields the
    /// extreme entry of the range
    fn goto_end(&mut self, direction: ScanDirection);

    /// Positions just before `key`, so the next forward step yields the
    /// first entry at or after it
    fn set_position(&mut self, key: &CompressedKeyBuf);

    /// Copies the key at the current position into `out`; returns false
    /// if the scan is not positioned on an entry
    fn last_key(&self, out: &mut CompressedKeyBuf) -> bool;

    /// Hints that the scan has gone long-sequential, switching the tree
    /// layer's buffering/read-ahead policy
    fn set_long_sequential(&mut self, on: bool);

    /// Returns true if the underlying tree changed since the previous
    /// call (or since the scan was opened, for the first call)
    fn has_changed(&mut self) -> bool;
}

/// Factory and relation-level signals of the tree layer
pub trait TreeSource: Send + Sync {
    /// Opens a scan over the given key's tree
    fn open_scan(&self, key: KeyId, kind: TreeKind) -> Result<Box<dyn TreeScan>>;

    /// Monotonically increasing counter bumped by every content change
    /// to the relation; pessimistic cursors compare it between steps
    fn change_count(&self, relation: RelationId) -> u64;
}
