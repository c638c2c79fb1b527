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

//! In-memory reference transaction system
//!
//! Implements the transaction-layer contract for tests and examples:
//! monotonic id/version allocation, a shared transaction-state buffer, a
//! small lock table with immediate replies (grant, wait, timeout on a
//! zero budget, depth-one deadlock detection), per-relation locking
//! policies, and modification bookkeeping for the lost-update check.
//! Nothing here blocks; a conflicting request is answered `Wait` and the
//! test releases the lock before retrying, exactly as a real caller
//! parked on an event would.

use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::core::{
    CommitVersion, IsolationLevel, LockMode, RelationId, RelationKind, StorageKind, TupleRef,
    TxId, TxState, Value,
};
use crate::key;
use crate::traits::{LockReply, LockingPolicy, TxBuffer, TxnSystem};

/// Per-relation configuration for the reference system
#[derive(Debug, Clone)]
pub struct RelationConfig {
    pub kind: RelationKind,
    pub storage: StorageKind,
    pub policy: LockingPolicy,
}

impl RelationConfig {
    /// Optimistic disk relation with locking required
    pub fn optimistic() -> Self {
        Self {
            kind: RelationKind::Optimistic,
            storage: StorageKind::Disk,
            policy: LockingPolicy {
                required: true,
                timeout_ms: Some(1_000),
                optimistic: true,
                uses_shared_locks: false,
            },
        }
    }

    /// Pessimistic disk relation with shared locks
    pub fn pessimistic() -> Self {
        Self {
            kind: RelationKind::Pessimistic,
            storage: StorageKind::Disk,
            policy: LockingPolicy {
                required: true,
                timeout_ms: Some(1_000),
                optimistic: false,
                uses_shared_locks: true,
            },
        }
    }

    /// Relation that needs no row locks at all
    pub fn lock_free() -> Self {
        Self {
            kind: RelationKind::Optimistic,
            storage: StorageKind::Disk,
            policy: LockingPolicy::lock_free(),
        }
    }

    /// Same configuration with rows living in memory
    pub fn in_memory(mut self) -> Self {
        self.storage = StorageKind::MainMemory;
        self
    }

    /// Same configuration with the given lock timeout
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.policy.timeout_ms = Some(timeout_ms);
        self
    }
}

type LockKey = (u32, Vec<u8>);

#[derive(Debug, Default)]
struct LockTable {
    /// Holders per row; shared locks may stack, anything else is exclusive.
    /// AHash for the byte-string row keys, Fx for the integer side tables.
    holders: AHashMap<LockKey, SmallVec<[(i64, LockMode); 2]>>,
    /// Which row each transaction is currently waiting on
    waits_for: FxHashMap<i64, LockKey>,
}

impl LockTable {
    fn compatible(a: LockMode, b: LockMode) -> bool {
        a == LockMode::Shared && b == LockMode::Shared
    }
}

/// Reference implementation of the transaction layer
pub struct MemTxnSystem {
    buffer: Arc<TxBuffer>,
    next_tx: AtomicI64,
    next_version: AtomicI64,
    isolation: RwLock<IsolationLevel>,
    /// Snapshot read level per transaction, taken at begin
    begin_levels: RwLock<FxHashMap<i64, i64>>,
    relations: RwLock<FxHashMap<u32, RelationConfig>>,
    locks: Mutex<LockTable>,
    /// Commit version of the latest modification per row, for the
    /// lost-update check
    modified: Mutex<AHashMap<LockKey, i64>>,
    /// Relation gate entry counters, per relation
    gate_entries: Mutex<FxHashMap<u32, u32>>,
}

impl MemTxnSystem {
    /// Creates an empty system at read committed isolation
    pub fn new() -> Self {
        Self {
            buffer: Arc::new(TxBuffer::new()),
            next_tx: AtomicI64::new(0),
            next_version: AtomicI64::new(0),
            isolation: RwLock::new(IsolationLevel::ReadCommitted),
            begin_levels: RwLock::new(FxHashMap::default()),
            relations: RwLock::new(FxHashMap::default()),
            locks: Mutex::new(LockTable::default()),
            modified: Mutex::new(AHashMap::default()),
            gate_entries: Mutex::new(FxHashMap::default()),
        }
    }

    /// Registers a relation's configuration
    pub fn configure_relation(&self, relation: RelationId, config: RelationConfig) {
        self.relations.write().insert(relation.0, config);
    }

    /// Sets the global isolation level
    pub fn set_isolation(&self, level: IsolationLevel) {
        *self.isolation.write() = level;
    }

    /// Begins a transaction: allocates an id, records it active and
    /// snapshots the current version as its read level
    pub fn begin(&self) -> TxId {
        let tx = TxId(self.next_tx.fetch_add(1, AtomicOrdering::AcqRel) + 1);
        self.buffer.record(tx, TxState::Active);
        self.begin_levels
            .write()
            .insert(tx.0, self.next_version.load(AtomicOrdering::Acquire));
        tx
    }

    /// Commits a transaction, assigning it the next version
    pub fn commit(&self, tx: TxId) -> CommitVersion {
        let version =
            CommitVersion(self.next_version.fetch_add(1, AtomicOrdering::AcqRel) + 1);
        self.buffer.record(tx, TxState::Committed(version));
        self.begin_levels.write().remove(&tx.0);
        self.release_all_locks(tx);
        version
    }

    /// Aborts a transaction
    pub fn abort(&self, tx: TxId) {
        self.buffer.record(tx, TxState::Aborted);
        self.begin_levels.write().remove(&tx.0);
        self.release_all_locks(tx);
    }

    /// Records that a row was modified at the given commit version;
    /// feeds the lost-update check
    pub fn note_modified(&self, relation: RelationId, key_values: &[Value], at: CommitVersion) {
        let row_key = (relation.0, key::encode(key_values, false, 0));
        self.modified.lock().insert(row_key, at.0);
    }

    /// Current global commit version
    pub fn current_version(&self) -> CommitVersion {
        CommitVersion(self.next_version.load(AtomicOrdering::Acquire))
    }

    /// Gate entries currently outstanding for a relation (test hook)
    pub fn gate_depth(&self, relation: RelationId) -> u32 {
        self.gate_entries
            .lock()
            .get(&relation.0)
            .copied()
            .unwrap_or(0)
    }

    fn release_all_locks(&self, tx: TxId) {
        let mut table = self.locks.lock();
        table.holders.retain(|_, holders| {
            holders.retain(|(owner, _)| *owner != tx.0);
            !holders.is_empty()
        });
        table.waits_for.remove(&tx.0);
    }

    fn row_key(relation: RelationId, row: &TupleRef) -> LockKey {
        (relation.0, key::encode(row.key_values(), false, 0))
    }

    fn config(&self, relation: RelationId) -> RelationConfig {
        self.relations
            .read()
            .get(&relation.0)
            .cloned()
            .unwrap_or_else(RelationConfig::optimistic)
    }
}

impl Default for MemTxnSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl TxnSystem for MemTxnSystem {
    fn read_level(&self, tx: TxId) -> CommitVersion {
        match *self.isolation.read() {
            // Each statement sees the latest committed state
            IsolationLevel::ReadCommitted => self.current_version(),
            // Stable snapshot taken at begin
            IsolationLevel::Repeatable | IsolationLevel::Serializable => CommitVersion(
                self.begin_levels
                    .read()
                    .get(&tx.0)
                    .copied()
                    .unwrap_or_else(|| self.next_version.load(AtomicOrdering::Acquire)),
            ),
        }
    }

    fn isolation_level(&self, _tx: TxId) -> IsolationLevel {
        *self.isolation.read()
    }

    fn tx_buffer(&self) -> Arc<TxBuffer> {
        Arc::clone(&self.buffer)
    }

    fn locking_policy(&self, relation: RelationId, _mode: LockMode) -> LockingPolicy {
        self.config(relation).policy
    }

    fn storage_kind(&self, relation: RelationId) -> StorageKind {
        self.config(relation).storage
    }

    fn relation_kind(&self, relation: RelationId) -> RelationKind {
        self.config(relation).kind
    }

    fn lock_row(
        &self,
        tx: TxId,
        relation: RelationId,
        row: &TupleRef,
        mode: LockMode,
        timeout_ms: u64,
    ) -> LockReply {
        let row_key = Self::row_key(relation, row);
        let mut table = self.locks.lock();

        let conflicting: SmallVec<[i64; 2]> = table
            .holders
            .get(&row_key)
            .map(|holders| {
                holders
                    .iter()
                    .filter(|(owner, held)| {
                        *owner != tx.0 && !LockTable::compatible(*held, mode)
                    })
                    .map(|(owner, _)| *owner)
                    .collect()
            })
            .unwrap_or_default();

        if conflicting.is_empty() {
            let holders = table.holders.entry(row_key).or_default();
            match holders.iter_mut().find(|(owner, _)| *owner == tx.0) {
                Some(held) => held.1 = held.1.max(mode),
                None => holders.push((tx.0, mode)),
            }
            table.waits_for.remove(&tx.0);
            return LockReply::Granted;
        }

        if timeout_ms == 0 {
            return LockReply::Timeout;
        }

        // Depth-one cycle: a conflicting holder is itself waiting on a
        // row we hold
        for owner in &conflicting {
            if let Some(waited_key) = table.waits_for.get(owner) {
                let held_by_us = table
                    .holders
                    .get(waited_key)
                    .is_some_and(|h| h.iter().any(|(o, _)| *o == tx.0));
                if held_by_us {
                    return LockReply::Deadlock;
                }
            }
        }

        table.waits_for.insert(tx.0, row_key);
        LockReply::Wait
    }

    fn unlock_row(&self, tx: TxId, relation: RelationId, row: &TupleRef) {
        let row_key = Self::row_key(relation, row);
        let mut table = self.locks.lock();
        if let Some(holders) = table.holders.get_mut(&row_key) {
            holders.retain(|(owner, _)| *owner != tx.0);
            if holders.is_empty() {
                table.holders.remove(&row_key);
            }
        }
        table.waits_for.remove(&tx.0);
    }

    fn lost_update_check(&self, tx: TxId, relation: RelationId, row: &TupleRef) -> bool {
        let row_key = Self::row_key(relation, row);
        let modified_at = self.modified.lock().get(&row_key).copied().unwrap_or(0);
        modified_at > self.read_level(tx).0
    }

    fn relation_enter(&self, _tx: TxId, relation: RelationId) -> LockReply {
        *self.gate_entries.lock().entry(relation.0).or_insert(0) += 1;
        LockReply::Granted
    }

    fn relation_exit(&self, _tx: TxId, relation: RelationId) {
        let mut gates = self.gate_entries.lock();
        if let Some(depth) = gates.get_mut(&relation.0) {
            *depth = depth.saturating_sub(1);
        }
    }

    fn tx_state(&self, tx: TxId) -> TxState {
        self.buffer.state(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(values: &[Value]) -> TupleRef {
        TupleRef::new(values.iter().cloned(), TxId(1))
    }

    #[test]
    fn test_begin_commit_moves_read_level() {
        let txn = MemTxnSystem::new();
        txn.set_isolation(IsolationLevel::Repeatable);

        let t1 = txn.begin();
        let level_before = txn.read_level(t1);

        let t2 = txn.begin();
        txn.commit(t2);

        // Repeatable: t1's level is pinned at its begin snapshot
        assert_eq!(txn.read_level(t1), level_before);

        txn.set_isolation(IsolationLevel::ReadCommitted);
        // Read committed: the level follows the global version
        assert_eq!(txn.read_level(t1), txn.current_version());
    }

    #[test]
    fn test_lock_grant_and_conflict() {
        let txn = MemTxnSystem::new();
        let rel = RelationId(1);
        let r = row(&[Value::Integer(1)]);

        let t1 = txn.begin();
        let t2 = txn.begin();

        assert_eq!(
            txn.lock_row(t1, rel, &r, LockMode::Exclusive, 100),
            LockReply::Granted
        );
        assert_eq!(
            txn.lock_row(t2, rel, &r, LockMode::Exclusive, 100),
            LockReply::Wait
        );
        assert_eq!(
            txn.lock_row(t2, rel, &r, LockMode::Exclusive, 0),
            LockReply::Timeout
        );

        txn.unlock_row(t1, rel, &r);
        assert_eq!(
            txn.lock_row(t2, rel, &r, LockMode::Exclusive, 100),
            LockReply::Granted
        );
    }

    #[test]
    fn test_shared_locks_stack() {
        let txn = MemTxnSystem::new();
        let rel = RelationId(1);
        let r = row(&[Value::Integer(1)]);

        let t1 = txn.begin();
        let t2 = txn.begin();
        assert_eq!(
            txn.lock_row(t1, rel, &r, LockMode::Shared, 100),
            LockReply::Granted
        );
        assert_eq!(
            txn.lock_row(t2, rel, &r, LockMode::Shared, 100),
            LockReply::Granted
        );
        // An exclusive request conflicts with the other sharer
        assert_eq!(
            txn.lock_row(t2, rel, &r, LockMode::Exclusive, 100),
            LockReply::Wait
        );
    }

    #[test]
    fn test_deadlock_detection() {
        let txn = MemTxnSystem::new();
        let rel = RelationId(1);
        let ra = row(&[Value::Integer(1)]);
        let rb = row(&[Value::Integer(2)]);

        let t1 = txn.begin();
        let t2 = txn.begin();

        assert_eq!(
            txn.lock_row(t1, rel, &ra, LockMode::Exclusive, 100),
            LockReply::Granted
        );
        assert_eq!(
            txn.lock_row(t2, rel, &rb, LockMode::Exclusive, 100),
            LockReply::Granted
        );
        // t2 waits on a; t1 then requesting b closes the cycle
        assert_eq!(
            txn.lock_row(t2, rel, &ra, LockMode::Exclusive, 100),
            LockReply::Wait
        );
        assert_eq!(
            txn.lock_row(t1, rel, &rb, LockMode::Exclusive, 100),
            LockReply::Deadlock
        );
    }

    #[test]
    fn test_commit_releases_locks() {
        let txn = MemTxnSystem::new();
        let rel = RelationId(1);
        let r = row(&[Value::Integer(1)]);

        let t1 = txn.begin();
        let t2 = txn.begin();
        txn.lock_row(t1, rel, &r, LockMode::Exclusive, 100);
        txn.commit(t1);
        assert_eq!(
            txn.lock_row(t2, rel, &r, LockMode::Exclusive, 100),
            LockReply::Granted
        );
    }

    #[test]
    fn test_lost_update_check() {
        let txn = MemTxnSystem::new();
        txn.set_isolation(IsolationLevel::Repeatable);
        let rel = RelationId(1);
        let r = row(&[Value::Integer(1)]);

        let reader = txn.begin();
        assert!(!txn.lost_update_check(reader, rel, &r));

        // Another transaction modifies the row after the reader began
        let writer = txn.begin();
        let at = txn.commit(writer);
        txn.note_modified(rel, &[Value::Integer(1)], at);

        assert!(txn.lost_update_check(reader, rel, &r));
    }

    #[test]
    fn test_relation_gate_depth() {
        let txn = MemTxnSystem::new();
        let rel = RelationId(3);
        let t1 = txn.begin();
        assert_eq!(txn.relation_enter(t1, rel), LockReply::Granted);
        assert_eq!(txn.gate_depth(rel), 1);
        txn.relation_exit(t1, rel);
        assert_eq!(txn.gate_depth(rel), 0);
    }

    #[test]
    fn test_tx_states_flow_to_buffer() {
        let txn = MemTxnSystem::new();
        let t1 = txn.begin();
        assert_eq!(txn.tx_state(t1), TxState::Active);
        let v = txn.commit(t1);
        assert_eq!(txn.tx_state(t1), TxState::Committed(v));

        let t2 = txn.begin();
        txn.abort(t2);
        assert_eq!(txn.tx_state(t2), TxState::Aborted);
    }
}
