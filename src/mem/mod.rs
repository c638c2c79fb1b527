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

//! In-memory reference collaborators
//!
//! Small, deterministic implementations of the tree and transaction
//! contracts, backing the crate's tests and examples. They are reference
//! material, not a storage engine: no persistence, no real deadlock
//! graph, no latching.

pub mod tree;
pub mod txn;

pub use tree::{MemTree, MemTreeScan, MemTreeSource};
pub use txn::{MemTxnSystem, RelationConfig};
