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

//! Error types for the row-retrieval engine
//!
//! Ordinary scan outcomes (row found, nothing at this step, end of range,
//! waiting on a row lock) are not errors — they travel in the `Ok` arm as
//! [`StepResult`](crate::core::StepResult). This module defines everything
//! else: concurrency conflicts, mid-scan invalidation, and consistency
//! violations.

use thiserror::Error;

use crate::core::types::{KeyId, RelationId, TxId};

/// Result type alias for rowscan operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for cursor and search operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // =========================================================================
    // Concurrency conflicts
    // =========================================================================
    /// A row lock could not be granted within the caller's timeout
    #[error("lock timeout on relation {relation}")]
    LockTimeout { relation: RelationId },

    /// The lock manager detected a deadlock involving this request
    #[error("deadlock detected for transaction {tx}")]
    Deadlock { tx: TxId },

    /// Optimistic conflict: the row changed between read and intended write.
    /// The statement must be retried from the top, not blocked.
    #[error("lost update on relation {relation}, statement must be retried")]
    LostUpdate { relation: RelationId },

    /// The relation or key this cursor scans was invalidated mid-scan
    /// (dropped, truncated, or aborted by an administrative broadcast)
    #[error("search aborted: relation {relation} was invalidated")]
    SearchAborted { relation: RelationId },

    /// The transaction's isolation level changed while the cursor was open,
    /// invalidating its visibility window
    #[error("isolation level changed under an open cursor")]
    IsolationChanged,

    /// Duplicate key detected during an index step
    #[error("unique constraint violation on key {key}")]
    UniqueViolation { key: KeyId },

    /// The scan was cancelled cooperatively by the index layer
    #[error("scan cancelled")]
    Cancelled,

    // =========================================================================
    // Consistency violations
    // =========================================================================
    /// An unconstrained clustering-key fetch found nothing for a row the
    /// index just returned. The index and data trees disagree.
    #[error("data fetch found no row for a visible index entry on relation {relation}")]
    DataFetchInconsistency { relation: RelationId },

    /// Key entries came back out of order from a scan that guarantees
    /// monotonic key order
    #[error("key order violation in validation scan on key {key}")]
    KeyOrderViolation { key: KeyId },

    /// A compressed key could not be decoded
    #[error("corrupt key entry: {0}")]
    CorruptKey(String),

    // =========================================================================
    // Usage errors
    // =========================================================================
    /// The cursor was stepped after being closed
    #[error("cursor closed")]
    CursorClosed,

    /// The select list names an attribute the plan cannot supply
    #[error("attribute {attr} not available from key {key} or data fetch")]
    AttributeUnavailable { key: KeyId, attr: usize },

    /// A plan referenced a key or relation the tree source does not know
    #[error("unknown key {0}")]
    UnknownKey(KeyId),

    /// Internal error for unexpected conditions
    #[error("{message}")]
    Internal { message: String },
}

impl Error {
    /// Create a new Internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }

    /// Create a new CorruptKey error
    pub fn corrupt_key(message: impl Into<String>) -> Self {
        Error::CorruptKey(message.into())
    }

    /// Check if this is a concurrency conflict the statement layer may retry
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::LockTimeout { .. }
                | Error::Deadlock { .. }
                | Error::LostUpdate { .. }
                | Error::SearchAborted { .. }
                | Error::IsolationChanged
                | Error::UniqueViolation { .. }
        )
    }

    /// Check if this error indicates index/data corruption rather than a
    /// legitimate concurrent schedule
    pub fn is_consistency_violation(&self) -> bool {
        matches!(
            self,
            Error::DataFetchInconsistency { .. }
                | Error::KeyOrderViolation { .. }
                | Error::CorruptKey(_)
        )
    }

    /// Check if the statement should be retried from the top (optimistic
    /// conflict) as opposed to aborted outright
    pub fn is_statement_retryable(&self) -> bool {
        matches!(self, Error::LostUpdate { .. })
    }
}
