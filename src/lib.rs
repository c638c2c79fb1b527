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

//! # Rowscan - versioned row-retrieval engine
//!
//! Rowscan is the search cursor subsystem of a transactional relational
//! database: given a plan (key range, predicates, projection list) it
//! produces versioned tuples consistent with the reader's snapshot, while
//! cooperating with an external lock manager and an external B-tree
//! layer.
//!
//! ## Key features
//!
//! - **MVCC visibility** - every scan step filters through a per-cursor
//!   time constraint rebuilt from the transaction's read level
//! - **Lock-step concurrency** - pessimistic and optimistic disciplines,
//!   bounce locks, lost-update degradation and deferred lock replay
//! - **Adaptive scans** - long-sequential classification after repeated
//!   same-direction steps, cleared on reversal
//! - **Partial-key materialization** - clustering-key data fetch for
//!   columns missing from the scanned key, with out-of-line BLOB
//!   reference substitution
//! - **Broadcast invalidation** - a per-connection registry delivers
//!   commit, isolation-change and schema events to open cursors
//! - **Commit validation scans** - monotonic-order reads of the
//!   uncommitted tree
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use rowscan::config::ScanConfig;
//! use rowscan::core::{CursorKind, DataType, KeyId, RelationId, StepResult, Value};
//! use rowscan::mem::{MemTreeSource, MemTxnSystem, RelationConfig};
//! use rowscan::plan::{KeyPart, KeyRange, SearchKey, SearchPlan};
//! use rowscan::search::{SearchCursor, UserSearchRegistry};
//!
//! // Reference collaborators standing in for the real engine
//! let txn = Arc::new(MemTxnSystem::new());
//! let source = Arc::new(MemTreeSource::new());
//! let registry = Arc::new(UserSearchRegistry::new());
//!
//! let relation = RelationId(1);
//! txn.configure_relation(relation, RelationConfig::lock_free());
//! let tree = source.add_tree(relation, KeyId(1), 1);
//!
//! let writer = txn.begin();
//! tree.insert(&[Value::Integer(11), Value::text("a")], writer, false, 0);
//! tree.insert(&[Value::Integer(12), Value::text("b")], writer, false, 0);
//! txn.commit(writer);
//!
//! let key = SearchKey::clustering(
//!     KeyId(1),
//!     vec![KeyPart::asc(0, DataType::Integer), KeyPart::asc(1, DataType::Text)],
//!     1,
//! );
//! let plan = Arc::new(SearchPlan {
//!     relation,
//!     key: key.clone(),
//!     clustering_key: key,
//!     range: KeyRange::closed_open([Value::Integer(10)], [Value::Integer(20)]),
//!     key_constraints: Vec::new(),
//!     data_constraints: Vec::new(),
//!     select: vec![0, 1],
//!     clustering_ref_parts: vec![0],
//! });
//!
//! let reader = txn.begin();
//! let mut cursor = SearchCursor::create(
//!     txn, source, registry, reader, plan,
//!     CursorKind::Read, ScanConfig::default(), false,
//! ).unwrap();
//!
//! assert_eq!(cursor.next().unwrap(), StepResult::Found);
//! assert_eq!(cursor.tuple().unwrap().get(0), Some(&Value::Integer(11)));
//! assert_eq!(cursor.next().unwrap(), StepResult::Found);
//! assert_eq!(cursor.next().unwrap(), StepResult::End);
//! cursor.close();
//! ```
//!
//! ## Modules
//!
//! - [`core`] - values, tuples, identifiers, the error taxonomy
//! - [`key`] - compressed key entries and lazy attribute maps
//! - [`plan`] - planner-produced search plans
//! - [`traits`] - contracts with the tree and transaction layers
//! - [`search`] - the cursor subsystem itself
//! - [`mem`] - in-memory reference collaborators for tests and examples
//! - [`config`] - scan tunables

pub mod config;
pub mod core;
pub mod key;
pub mod mem;
pub mod plan;
pub mod search;
pub mod traits;

// Re-export main types for convenience
pub use crate::core::{
    BlobRef, CommitVersion, CursorKind, DataType, Error, InvalidationCause, IsolationLevel,
    KeyId, KeyPosition, LockMode, RelationId, RelationKind, Result, ScanDirection, StepResult,
    StorageKind, Tuple, TupleRef, TxId, TxState, Value,
};

pub use crate::config::ScanConfig;

pub use crate::key::{AttributeMap, CompressedKeyBuf};

pub use crate::plan::{
    ConstraintOp, DataConstraint, KeyConstraint, KeyPart, KeyRange, RangeBound, ResolvedSelect,
    SearchKey, SearchPlan, SelectSource, SortOrder,
};

pub use crate::traits::{
    LockReply, LockingPolicy, TreeKind, TreeScan, TreeSource, TreeStep, TxBuffer, TxnSystem,
};

pub use crate::search::{
    DataFetch, DataSearch, IndexSearch, IndexStep, IndexValidationSearch, RelationCursor,
    ScanStats, SearchCursor, SearchReturnKey, SharedCursorState, SlotId, TimeConstraint,
    UserSearchRegistry,
};
