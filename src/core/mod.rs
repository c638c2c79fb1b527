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

//! Core types for the row-retrieval engine
//!
//! - [`Error`] / [`Result`] - error taxonomy for cursor operations
//! - [`Value`] / [`BlobRef`] - runtime values and BLOB descriptors
//! - [`Tuple`] / [`TupleRef`] - result buffer and lockable row reference
//! - identifiers and shared enums ([`TxId`], [`StepResult`], ...)

pub mod error;
pub mod tuple;
pub mod types;
pub mod value;

pub use error::{Error, Result};
pub use tuple::{Tuple, TupleRef};
pub use types::{
    CommitVersion, CursorKind, InvalidationCause, IsolationLevel, KeyId, KeyPosition, LockMode,
    RelationId, RelationKind, ScanDirection, StepResult, StorageKind, TxId, TxState,
};
pub use value::{BlobRef, DataType, Value};
