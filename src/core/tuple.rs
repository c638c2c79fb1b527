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

//! Caller-visible tuple buffer and the tuple reference handed to the
//! lock manager

use smallvec::SmallVec;

use crate::core::types::TxId;
use crate::core::value::Value;

/// A materialized result row, indexed by select-list position
///
/// The cursor owns one `Tuple` and rewrites it in place on every step;
/// callers borrow it between steps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tuple {
    values: Vec<Value>,
}

impl Tuple {
    /// Creates an empty tuple
    pub fn new() -> Self {
        Self { values: Vec::new() }
    }

    /// Creates a tuple from values
    pub fn from_values(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// Value at a select-list position
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Number of values
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if the tuple holds no values
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Clears the buffer, keeping its allocation
    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// Appends a value
    pub fn push(&mut self, value: Value) {
        self.values.push(value);
    }

    /// All values in select-list order
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Resizes the buffer to `len` positions, filling new slots with NULL
    pub fn resize(&mut self, len: usize) {
        self.values.resize(len, Value::Null);
    }

    /// Overwrites the value at a position; the position must exist
    pub fn set(&mut self, index: usize, value: Value) {
        self.values[index] = value;
    }
}

/// Reference to one physical row: its clustering-key values plus the
/// transaction that produced the version. This is the unit the lock
/// manager locks and the data search fetches by.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TupleRef {
    key_values: SmallVec<[Value; 4]>,
    producing_tx: TxId,
}

impl TupleRef {
    /// Creates a reference from clustering-key values
    pub fn new(key_values: impl IntoIterator<Item = Value>, producing_tx: TxId) -> Self {
        Self {
            key_values: key_values.into_iter().collect(),
            producing_tx,
        }
    }

    /// Rebuilds this reference in place, reusing the buffer
    pub fn rebuild(&mut self, key_values: impl IntoIterator<Item = Value>, producing_tx: TxId) {
        self.key_values.clear();
        self.key_values.extend(key_values);
        self.producing_tx = producing_tx;
    }

    /// Clustering-key values identifying the row
    pub fn key_values(&self) -> &[Value] {
        &self.key_values
    }

    /// Transaction that produced the referenced version
    pub fn producing_tx(&self) -> TxId {
        self.producing_tx
    }

    /// Returns true if the reference has been built
    pub fn is_valid(&self) -> bool {
        !self.key_values.is_empty()
    }

    /// Clears the reference, keeping its buffer
    pub fn invalidate(&mut self) {
        self.key_values.clear();
        self.producing_tx = TxId::NONE;
    }
}
