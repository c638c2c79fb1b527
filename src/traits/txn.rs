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

//! Contract with the transaction and lock-manager layer
//!
//! The transaction layer owns commit/abort bookkeeping, id allocation and
//! deadlock detection. The cursor consumes read levels, lock replies and
//! the shared transaction-state buffer through this trait; it never blocks
//! in-process — a `Wait` reply is surfaced to the caller as a wait-lock
//! step result.

use std::sync::Arc;

use dashmap::DashMap;
use rustc_hash::FxBuildHasher;

use crate::core::{
    CommitVersion, IsolationLevel, LockMode, RelationId, RelationKind, StorageKind, TupleRef,
    TxId, TxState,
};

/// Reply to a lock request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockReply {
    /// The lock is held; proceed
    Granted,
    /// Another transaction holds a conflicting lock; park and retry
    Wait,
    /// The request timed out
    Timeout,
    /// Granting would deadlock
    Deadlock,
}

/// Per-relation locking discipline handed to a cursor at creation
#[derive(Debug, Clone, Copy)]
pub struct LockingPolicy {
    /// Whether row locks are required at all for this relation and mode
    pub required: bool,
    /// Lock wait budget in milliseconds. `Some(0)` fails immediately;
    /// `None` leaves the budget to the cursor's configured default.
    pub timeout_ms: Option<u64>,
    /// Optimistic concurrency control: conflicts degrade to lost-update
    /// errors instead of hard deadlocks
    pub optimistic: bool,
    /// Whether shared read locks are taken on this relation. A nominally
    /// pessimistic relation that takes none is treated as optimistic
    /// under relaxed isolation.
    pub uses_shared_locks: bool,
}

impl LockingPolicy {
    /// Policy for a relation that needs no locking at all
    pub fn lock_free() -> Self {
        Self {
            required: false,
            timeout_ms: None,
            optimistic: true,
            uses_shared_locks: false,
        }
    }
}

/// Shared transaction-state buffer
///
/// Maps transaction ids to their current state. The buffer is owned by the
/// transaction layer and shared read-only with every time constraint; the
/// cursor must never mutate it.
#[derive(Debug, Default)]
pub struct TxBuffer {
    states: DashMap<i64, TxState, FxBuildHasher>,
}

impl TxBuffer {
    /// Creates an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a transaction state (transaction layer only)
    pub fn record(&self, tx: TxId, state: TxState) {
        self.states.insert(tx.0, state);
    }

    /// Removes a transaction from the buffer (transaction layer only)
    pub fn forget(&self, tx: TxId) {
        self.states.remove(&tx.0);
    }

    /// Looks up a transaction's state. Transactions aged out of the
    /// buffer are long-committed.
    pub fn state(&self, tx: TxId) -> TxState {
        self.states
            .get(&tx.0)
            .map(|s| *s)
            .unwrap_or(TxState::Committed(CommitVersion::MIN))
    }

    /// Number of tracked transactions
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Returns true if no transactions are tracked
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Transaction-layer operations the cursor depends on
pub trait TxnSystem: Send + Sync {
    /// The reader's current visibility ceiling. Rebuilt into the time
    /// constraint on every cursor reset/restart.
    fn read_level(&self, tx: TxId) -> CommitVersion;

    /// Isolation level currently in force for the transaction
    fn isolation_level(&self, tx: TxId) -> IsolationLevel;

    /// Handle to the shared transaction-state buffer
    fn tx_buffer(&self) -> Arc<TxBuffer>;

    /// Locking discipline for a relation under the given mode
    fn locking_policy(&self, relation: RelationId, mode: LockMode) -> LockingPolicy;

    /// Whether the relation's rows live on disk or in memory
    fn storage_kind(&self, relation: RelationId) -> StorageKind;

    /// The relation's declared concurrency-control discipline
    fn relation_kind(&self, relation: RelationId) -> RelationKind;

    /// Requests a row lock. Never blocks; a conflicting holder yields
    /// `Wait` (or `Timeout` when `timeout_ms` is zero).
    fn lock_row(
        &self,
        tx: TxId,
        relation: RelationId,
        row: &TupleRef,
        mode: LockMode,
        timeout_ms: u64,
    ) -> LockReply;

    /// Releases a row lock taken by `lock_row`
    fn unlock_row(&self, tx: TxId, relation: RelationId, row: &TupleRef);

    /// Returns true if the row was modified after the reader's read
    /// level — the optimistic lost-update condition
    fn lost_update_check(&self, tx: TxId, relation: RelationId, row: &TupleRef) -> bool;

    /// Enters the relation-level shared gate (pessimistic relations)
    fn relation_enter(&self, tx: TxId, relation: RelationId) -> LockReply;

    /// Leaves the relation-level shared gate
    fn relation_exit(&self, tx: TxId, relation: RelationId);

    /// State of an arbitrary transaction, consulted when distinguishing
    /// a legitimately missing row from corruption
    fn tx_state(&self, tx: TxId) -> TxState;
}
