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

//! Search return key
//!
//! The reusable buffer one scan step decodes into. Each cursor path owns
//! exactly one of these per sub-search (index and data), allocated with the
//! cursor and rewritten in place on every step, so a scan performs no
//! per-row allocation. The attribute map over the compressed key is built
//! on first access and cached until the key is overwritten.

use crate::core::{KeyPosition, Result, TxId, Value};
use crate::key::{AttributeMap, CompressedKeyBuf};

/// One decoded key entry produced by a scan step
#[derive(Debug, Default)]
pub struct SearchReturnKey {
    key: CompressedKeyBuf,
    previous_key: CompressedKeyBuf,
    attribute_map: Option<AttributeMap>,
    position: KeyPosition,
    producing_tx: TxId,
}

impl SearchReturnKey {
    /// Creates an empty return key
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a new entry, rotating the current key into `previous_key`
    /// and invalidating the cached attribute map
    pub fn load(&mut self, entry_bytes: &[u8], producing_tx: TxId, position: KeyPosition) {
        std::mem::swap(&mut self.key, &mut self.previous_key);
        self.key.load(entry_bytes);
        self.attribute_map = None;
        self.producing_tx = producing_tx;
        self.position = position;
    }

    /// Clears both key buffers, keeping their allocations
    pub fn clear(&mut self) {
        self.key.clear();
        self.previous_key.clear();
        self.attribute_map = None;
        self.producing_tx = TxId::NONE;
        self.position = KeyPosition(0);
    }

    /// Returns true if no entry is loaded
    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }

    /// The current compressed key entry
    pub fn key(&self) -> &CompressedKeyBuf {
        &self.key
    }

    /// The entry loaded before the current one, if any
    pub fn previous_key(&self) -> &CompressedKeyBuf {
        &self.previous_key
    }

    /// Physical position of the entry in its tree
    pub fn position(&self) -> KeyPosition {
        self.position
    }

    /// Transaction that produced this entry
    pub fn producing_tx(&self) -> TxId {
        self.producing_tx
    }

    /// The attribute map for the current entry, building it on first use
    pub fn attribute_map(&mut self) -> Result<&AttributeMap> {
        if self.attribute_map.is_none() {
            self.attribute_map = Some(self.key.build_attribute_map()?);
        }
        Ok(self.attribute_map.as_ref().expect("map was just built"))
    }

    /// Decodes the value at a key-part position via the cached map
    pub fn attr_value(&mut self, index: usize) -> Result<Value> {
        if self.attribute_map.is_none() {
            self.attribute_map = Some(self.key.build_attribute_map()?);
        }
        let map = self.attribute_map.as_ref().expect("map was just built");
        map.value_at(&self.key, index)
    }

    /// Decodes all values of the current entry
    pub fn decode_values(&self) -> Result<smallvec::SmallVec<[Value; 4]>> {
        self.key.decode_values()
    }
}
