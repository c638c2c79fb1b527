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

//! Shared identifiers and enums for the row-retrieval engine

use std::fmt;

/// Transaction identifier assigned by the transaction layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TxId(pub i64);

impl TxId {
    /// Sentinel for "no transaction"
    pub const NONE: TxId = TxId(0);

    /// Sentinel used by validation scans: visible to everything
    pub const MAX: TxId = TxId(i64::MAX);

    /// Returns true if this is a real transaction id
    pub fn is_some(self) -> bool {
        self != TxId::NONE
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic commit version assigned when a transaction commits
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CommitVersion(pub i64);

impl CommitVersion {
    /// Lowest possible version, visible in every window
    pub const MIN: CommitVersion = CommitVersion(0);

    /// Highest possible version, used as an open upper bound
    pub const MAX: CommitVersion = CommitVersion(i64::MAX);
}

impl fmt::Display for CommitVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Relation (table) identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RelationId(pub u32);

impl fmt::Display for RelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key (index) identifier; a relation has one clustering key and any number
/// of secondary keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct KeyId(pub u32);

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical position of a key entry inside its tree, used to tiebreak
/// versions of the same logical key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct KeyPosition(pub u64);

/// Isolation level of the reading transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Each statement sees the latest committed state
    ReadCommitted,
    /// The transaction sees a stable snapshot taken at begin
    Repeatable,
    /// Full serializable execution
    Serializable,
}

impl IsolationLevel {
    /// Levels below serializable allow the shared-lock-free optimistic
    /// treatment of nominally pessimistic relations
    pub fn is_relaxed(self) -> bool {
        !matches!(self, IsolationLevel::Serializable)
    }
}

/// Direction of one cursor step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDirection {
    Forward,
    Backward,
}

impl ScanDirection {
    /// The opposite direction
    pub fn reversed(self) -> ScanDirection {
        match self {
            ScanDirection::Forward => ScanDirection::Backward,
            ScanDirection::Backward => ScanDirection::Forward,
        }
    }
}

/// What the statement intends to do with the rows it reads.
/// Determines the lock mode the cursor requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorKind {
    /// Plain read
    Read,
    /// SELECT ... FOR UPDATE
    ForUpdate,
    /// Searched UPDATE
    SearchedUpdate,
    /// Searched DELETE
    SearchedDelete,
}

impl CursorKind {
    /// Derives the row lock mode for this cursor kind
    pub fn lock_mode(self) -> LockMode {
        match self {
            CursorKind::Read => LockMode::Shared,
            CursorKind::ForUpdate => LockMode::Update,
            CursorKind::SearchedUpdate | CursorKind::SearchedDelete => LockMode::Exclusive,
        }
    }

    /// True for the FOR UPDATE flavor, which gets lost-update verification
    /// on optimistic relations
    pub fn is_for_update(self) -> bool {
        matches!(self, CursorKind::ForUpdate)
    }
}

/// Row lock mode requested from the lock manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockMode {
    /// No locking at all
    Free,
    Shared,
    Update,
    Exclusive,
}

impl LockMode {
    /// Returns true if this mode acquires any lock
    pub fn is_locking(self) -> bool {
        self != LockMode::Free
    }
}

/// Concurrency-control discipline of a relation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    /// Conflicts surface as lost-update errors, statement retries
    Optimistic,
    /// Conflicts block on locks; the relation gate serializes scans
    Pessimistic,
}

/// Where the relation's rows live; disk and in-memory relations get
/// different cursor variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Disk,
    MainMemory,
}

/// Outcome of one cursor step. These are control flow, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// A row was found and materialized
    Found,
    /// Nothing at this step; position is preserved, the caller may step again
    NotFound,
    /// The scan range is exhausted in this direction
    End,
    /// The step parked on a row lock. The caller must wait externally and
    /// re-invoke the same step; the cursor will retry the identical row.
    WaitLock,
}

impl StepResult {
    /// True when the caller should keep stepping in the same direction
    pub fn should_continue(self) -> bool {
        matches!(self, StepResult::Found | StepResult::NotFound)
    }
}

/// State of a transaction as recorded in the shared visibility buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// In progress; its versions are invisible to others
    Active,
    /// Committed at the given version
    Committed(CommitVersion),
    /// Rolled back; its versions are garbage
    Aborted,
}

impl TxState {
    /// Commit version, if committed
    pub fn commit_version(self) -> Option<CommitVersion> {
        match self {
            TxState::Committed(v) => Some(v),
            _ => None,
        }
    }
}

/// Why a registry broadcast invalidated a cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationCause {
    /// The owning transaction committed; the cursor must rebuild its
    /// visibility window before the next step
    Commit,
    /// The isolation level changed mid-transaction
    IsolationChange,
}
