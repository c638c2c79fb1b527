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

//! In-memory reference tree
//!
//! A `BTreeMap`-backed implementation of the tree contract, ordered by the
//! key's unique leading values with version chains per logical key. It
//! exists so the cursor subsystem can be exercised end to end without an
//! external storage engine; tests also use its injection hooks to simulate
//! lock waits, cancellation and the other raw step outcomes.
//!
//! Versions of one logical key are yielded newest first, which is the
//! order the index search's first-visible-version rule depends on.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::core::{Error, KeyId, KeyPosition, RelationId, Result, ScanDirection, TxId, Value};
use crate::key::{encode, CompressedKeyBuf};
use crate::plan::KeyRange;
use crate::search::SearchReturnKey;
use crate::traits::{TreeKind, TreeScan, TreeSource, TreeStep};

/// Map key: the unique leading values of a logical row
#[derive(Debug, Clone, PartialEq, Eq)]
struct OrdKey(SmallVec<[Value; 4]>);

impl PartialOrd for OrdKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrdKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            match a.compare(b) {
                std::cmp::Ordering::Equal => continue,
                other => return other,
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

#[derive(Debug, Clone)]
struct VersionEntry {
    producing_tx: TxId,
    /// Full encoded entry, delete mark and blob bitmap included
    bytes: Vec<u8>,
    position: KeyPosition,
    placeholder: bool,
}

type Versions = SmallVec<[VersionEntry; 2]>;

/// One key's in-memory tree
pub struct MemTree {
    relation: RelationId,
    key_id: KeyId,
    unique_parts: usize,
    entries: RwLock<BTreeMap<OrdKey, Versions>>,
    change_count: AtomicU64,
    next_position: AtomicU64,
    cancel_requested: AtomicBool,
    long_sequential: AtomicBool,
    /// Raw outcomes queued by tests; consumed one per step
    injected: Mutex<VecDeque<TreeStep>>,
}

impl MemTree {
    /// Creates an empty tree for one key
    pub fn new(relation: RelationId, key_id: KeyId, unique_parts: usize) -> Self {
        Self {
            relation,
            key_id,
            unique_parts,
            entries: RwLock::new(BTreeMap::new()),
            change_count: AtomicU64::new(0),
            next_position: AtomicU64::new(1),
            cancel_requested: AtomicBool::new(false),
            long_sequential: AtomicBool::new(false),
            injected: Mutex::new(VecDeque::new()),
        }
    }

    /// The key this tree stores
    pub fn key_id(&self) -> KeyId {
        self.key_id
    }

    /// The owning relation
    pub fn relation(&self) -> RelationId {
        self.relation
    }

    /// Current change counter
    pub fn change_count(&self) -> u64 {
        self.change_count.load(AtomicOrdering::Acquire)
    }

    /// Bumps the change counter without inserting, as a schema or bulk
    /// operation would
    pub fn bump_change_count(&self) {
        self.change_count.fetch_add(1, AtomicOrdering::AcqRel);
    }

    /// Inserts a version entry for the row identified by the leading
    /// unique values of `values`
    pub fn insert(&self, values: &[Value], producing_tx: TxId, delete_mark: bool, blob_bitmap: u32) {
        self.insert_entry(values, producing_tx, delete_mark, blob_bitmap, false);
    }

    /// Inserts a lock placeholder: a version with no visible data
    pub fn insert_placeholder(&self, values: &[Value], producing_tx: TxId) {
        self.insert_entry(values, producing_tx, false, 0, true);
    }

    fn insert_entry(
        &self,
        values: &[Value],
        producing_tx: TxId,
        delete_mark: bool,
        blob_bitmap: u32,
        placeholder: bool,
    ) {
        let ord = OrdKey(values.iter().take(self.unique_parts).cloned().collect());
        let entry = VersionEntry {
            producing_tx,
            bytes: encode(values, delete_mark, blob_bitmap),
            position: KeyPosition(self.next_position.fetch_add(1, AtomicOrdering::AcqRel)),
            placeholder,
        };
        self.entries.write().entry(ord).or_default().push(entry);
        self.change_count.fetch_add(1, AtomicOrdering::AcqRel);
    }

    /// Removes every version produced by `tx` (abort cleanup in tests)
    pub fn remove_versions_of(&self, tx: TxId) {
        let mut entries = self.entries.write();
        entries.retain(|_, versions| {
            versions.retain(|v| v.producing_tx != tx);
            !versions.is_empty()
        });
        self.change_count.fetch_add(1, AtomicOrdering::AcqRel);
    }

    /// Requests cooperative cancellation of every scan on this tree
    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, AtomicOrdering::Release);
    }

    /// Clears a previous cancellation request
    pub fn clear_cancel(&self) {
        self.cancel_requested.store(false, AtomicOrdering::Release);
    }

    /// Whether any scan has hinted long-sequential access
    pub fn is_long_sequential(&self) -> bool {
        self.long_sequential.load(AtomicOrdering::Acquire)
    }

    /// Queues a raw step outcome; the next scan step returns it instead
    /// of (or, for entry-carrying outcomes, on top of) the real entry
    pub fn inject_step(&self, step: TreeStep) {
        self.injected.lock().push_back(step);
    }

    fn take_injection(&self) -> Option<TreeStep> {
        self.injected.lock().pop_front()
    }
}

impl std::fmt::Debug for MemTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTree")
            .field("relation", &self.relation)
            .field("key_id", &self.key_id)
            .field("keys", &self.entries.read().len())
            .finish()
    }
}

/// Scan position over a [`MemTree`]
#[derive(Debug, Clone)]
enum Pos {
    /// Fresh scan; the first step picks its entry point from its direction
    Unpositioned,
    /// Before everything in range
    Start,
    /// Immediately before the given key
    Before(OrdKey),
    /// On version `vidx` (newest-first) of the given key
    At(OrdKey, usize),
    /// After everything in range
    AfterEnd,
}

/// A positioned scan over one [`MemTree`]
pub struct MemTreeScan {
    tree: Arc<MemTree>,
    range: KeyRange,
    pos: Pos,
    seen_change: u64,
}

impl MemTreeScan {
    fn new(tree: Arc<MemTree>) -> Self {
        let seen_change = tree.change_count();
        Self {
            tree,
            range: KeyRange::all(),
            pos: Pos::Unpositioned,
            seen_change,
        }
    }

    /// Finds the key and version after the current position, forward order
    fn advance_forward(&self) -> Option<(OrdKey, usize)> {
        let entries = self.tree.entries.read();
        // Same-key version advance first
        if let Pos::At(key, vidx) = &self.pos {
            if let Some(versions) = entries.get(key) {
                if vidx + 1 < versions.len() {
                    return Some((key.clone(), vidx + 1));
                }
            }
        }
        let lower: Bound<&OrdKey> = match &self.pos {
            Pos::Unpositioned | Pos::Start => Bound::Unbounded,
            Pos::Before(key) => Bound::Included(key),
            Pos::At(key, _) => Bound::Excluded(key),
            Pos::AfterEnd => return None,
        };
        for (key, _) in entries.range((lower, Bound::Unbounded)) {
            if self.range.is_past(&key.0, true) {
                return None;
            }
            if !self.range.contains(&key.0) {
                continue;
            }
            return Some((key.clone(), 0));
        }
        None
    }

    /// Finds the key and version after the current position, backward order
    fn advance_backward(&self) -> Option<(OrdKey, usize)> {
        let entries = self.tree.entries.read();
        if let Pos::At(key, vidx) = &self.pos {
            if let Some(versions) = entries.get(key) {
                if vidx + 1 < versions.len() {
                    return Some((key.clone(), vidx + 1));
                }
            }
        }
        let upper: Bound<&OrdKey> = match &self.pos {
            Pos::Unpositioned | Pos::AfterEnd => Bound::Unbounded,
            Pos::Before(key) | Pos::At(key, _) => Bound::Excluded(key),
            Pos::Start => return None,
        };
        for (key, _) in entries.range((Bound::Unbounded, upper)).rev() {
            if self.range.is_past(&key.0, false) {
                return None;
            }
            if !self.range.contains(&key.0) {
                continue;
            }
            return Some((key.clone(), 0));
        }
        None
    }

    fn load_current(&self, srk: &mut SearchReturnKey) -> Option<bool> {
        let entries = self.tree.entries.read();
        if let Pos::At(key, vidx) = &self.pos {
            let versions = entries.get(key)?;
            // newest-first: vidx 0 is the most recently inserted version
            let entry = versions.get(versions.len().checked_sub(vidx + 1)?)?;
            srk.load(&entry.bytes, entry.producing_tx, entry.position);
            return Some(entry.placeholder);
        }
        None
    }
}

impl TreeScan for MemTreeScan {
    fn reset(&mut self, range: Option<&KeyRange>) {
        if let Some(range) = range {
            self.range = range.clone();
        }
        self.pos = Pos::Unpositioned;
    }

    fn step(
        &mut self,
        direction: ScanDirection,
        _stmt_tx: TxId,
        srk: &mut SearchReturnKey,
    ) -> TreeStep {
        if self.tree.cancel_requested.load(AtomicOrdering::Acquire) {
            return TreeStep::Cancel;
        }
        let injected = self.tree.take_injection();
        match injected {
            // Outcomes that stand in for the step itself, position untouched
            Some(step @ (TreeStep::NotFound | TreeStep::Cancel | TreeStep::End)) => {
                return step;
            }
            _ => {}
        }

        let next = match direction {
            ScanDirection::Forward => self.advance_forward(),
            ScanDirection::Backward => self.advance_backward(),
        };
        match next {
            Some((key, vidx)) => {
                self.pos = Pos::At(key, vidx);
                let placeholder = self.load_current(srk).unwrap_or(false);
                // Entry-carrying injections replace the Found outcome
                if let Some(step) = injected {
                    return step;
                }
                if placeholder {
                    TreeStep::LockPlaceholder
                } else {
                    TreeStep::Found
                }
            }
            None => {
                self.pos = match direction {
                    ScanDirection::Forward => Pos::AfterEnd,
                    ScanDirection::Backward => Pos::Start,
                };
                if let Some(step) = injected {
                    return step;
                }
                TreeStep::End
            }
        }
    }

    fn goto_end(&mut self, direction: ScanDirection) {
        self.pos = match direction {
            ScanDirection::Forward => Pos::AfterEnd,
            ScanDirection::Backward => Pos::Start,
        };
    }

    fn set_position(&mut self, key: &CompressedKeyBuf) {
        match key.decode_values() {
            Ok(values) => {
                let leading = values
                    .into_iter()
                    .take(self.tree.unique_parts)
                    .collect::<SmallVec<[Value; 4]>>();
                self.pos = Pos::Before(OrdKey(leading));
            }
            Err(_) => self.pos = Pos::Unpositioned,
        }
    }

    fn last_key(&self, out: &mut CompressedKeyBuf) -> bool {
        let entries = self.tree.entries.read();
        if let Pos::At(key, vidx) = &self.pos {
            if let Some(versions) = entries.get(key) {
                if let Some(entry) = versions
                    .len()
                    .checked_sub(vidx + 1)
                    .and_then(|i| versions.get(i))
                {
                    out.load(&entry.bytes);
                    return true;
                }
            }
        }
        false
    }

    fn set_long_sequential(&mut self, on: bool) {
        self.tree
            .long_sequential
            .store(on, AtomicOrdering::Release);
    }

    fn has_changed(&mut self) -> bool {
        let current = self.tree.change_count();
        let changed = current != self.seen_change;
        self.seen_change = current;
        changed
    }
}

/// Registry of in-memory trees acting as the tree layer
#[derive(Default)]
pub struct MemTreeSource {
    visible: RwLock<FxHashMap<u32, Arc<MemTree>>>,
    uncommitted: RwLock<FxHashMap<u32, Arc<MemTree>>>,
}

impl MemTreeSource {
    /// Creates an empty source
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) the visible tree for a key
    pub fn add_tree(
        &self,
        relation: RelationId,
        key: KeyId,
        unique_parts: usize,
    ) -> Arc<MemTree> {
        let tree = Arc::new(MemTree::new(relation, key, unique_parts));
        self.visible.write().insert(key.0, Arc::clone(&tree));
        tree
    }

    /// Adds (or replaces) the uncommitted-version tree for a key
    pub fn add_uncommitted_tree(
        &self,
        relation: RelationId,
        key: KeyId,
        unique_parts: usize,
    ) -> Arc<MemTree> {
        let tree = Arc::new(MemTree::new(relation, key, unique_parts));
        self.uncommitted.write().insert(key.0, Arc::clone(&tree));
        tree
    }

    /// The visible tree for a key, if registered
    pub fn tree(&self, key: KeyId) -> Option<Arc<MemTree>> {
        self.visible.read().get(&key.0).cloned()
    }
}

impl TreeSource for MemTreeSource {
    fn open_scan(&self, key: KeyId, kind: TreeKind) -> Result<Box<dyn TreeScan>> {
        let map = match kind {
            TreeKind::Visible => self.visible.read(),
            TreeKind::Uncommitted => self.uncommitted.read(),
        };
        let tree = map.get(&key.0).cloned().ok_or(Error::UnknownKey(key))?;
        Ok(Box::new(MemTreeScan::new(tree)))
    }

    fn change_count(&self, relation: RelationId) -> u64 {
        self.visible
            .read()
            .values()
            .filter(|t| t.relation() == relation)
            .map(|t| t.change_count())
            .sum()
    }
}
