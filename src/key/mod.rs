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

//! Compressed key entries
//!
//! A key entry is a packed variable-length tuple of values ("v-tuple") with
//! a small header: flags (delete mark), value count, and a blob bitmap
//! marking which values are out-of-line BLOB descriptors. The tree layer
//! hands these to the cursor verbatim; the cursor decodes values lazily
//! through an [`AttributeMap`] of payload offsets.
//!
//! Layout:
//!
//! ```text
//! [flags u8][count u8][blob_bitmap u32 BE]
//! then per value: [tag u8][len u32 BE][payload]
//! ```

use std::cmp::Ordering;

use smallvec::SmallVec;

use crate::core::{Error, Result, Value};

/// Header flag: this entry is a delete mark, not live data.
/// Delete-marked entries sort before live entries with the same values.
pub const FLAG_DELETE_MARK: u8 = 0b0000_0001;

const HEADER_LEN: usize = 6;

const TAG_NULL: u8 = 0;
const TAG_INTEGER: u8 = 1;
const TAG_FLOAT: u8 = 2;
const TAG_TEXT: u8 = 3;
const TAG_BLOB: u8 = 4;

/// Encodes a key entry into `buf`, replacing its contents
pub fn encode_into(buf: &mut Vec<u8>, values: &[Value], delete_mark: bool, blob_bitmap: u32) {
    debug_assert!(values.len() <= u8::MAX as usize);
    buf.clear();
    let flags = if delete_mark { FLAG_DELETE_MARK } else { 0 };
    buf.push(flags);
    buf.push(values.len() as u8);
    buf.extend_from_slice(&blob_bitmap.to_be_bytes());
    for value in values {
        match value {
            Value::Null => {
                buf.push(TAG_NULL);
                buf.extend_from_slice(&0u32.to_be_bytes());
            }
            Value::Integer(i) => {
                buf.push(TAG_INTEGER);
                buf.extend_from_slice(&8u32.to_be_bytes());
                buf.extend_from_slice(&i.to_be_bytes());
            }
            Value::Float(f) => {
                buf.push(TAG_FLOAT);
                buf.extend_from_slice(&8u32.to_be_bytes());
                buf.extend_from_slice(&f.to_bits().to_be_bytes());
            }
            Value::Text(s) => {
                buf.push(TAG_TEXT);
                buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
            Value::Blob(b) => {
                buf.push(TAG_BLOB);
                buf.extend_from_slice(&(b.len() as u32).to_be_bytes());
                buf.extend_from_slice(b);
            }
            Value::BlobRef(r) => {
                let bytes = r.to_bytes();
                buf.push(TAG_BLOB);
                buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                buf.extend_from_slice(&bytes);
            }
        }
    }
}

/// Convenience: encode into a fresh buffer
pub fn encode(values: &[Value], delete_mark: bool, blob_bitmap: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + values.len() * 16);
    encode_into(&mut buf, values, delete_mark, blob_bitmap);
    buf
}

/// One decoded value slot: tag plus payload location
#[derive(Debug, Clone, Copy)]
struct AttrSlot {
    tag: u8,
    offset: usize,
    len: usize,
}

/// Offsets of each value inside a compressed key entry
///
/// Built once per entry on first attribute access and cached by the search
/// return key; the map holds no bytes itself, so the backing buffer may be
/// reused as long as the map is rebuilt after every overwrite.
#[derive(Debug, Clone, Default)]
pub struct AttributeMap {
    slots: SmallVec<[AttrSlot; 8]>,
}

impl AttributeMap {
    /// Number of values in the mapped entry
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if the mapped entry has no values
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Decodes the value at `index` from the mapped entry's bytes
    pub fn value_at(&self, key: &CompressedKeyBuf, index: usize) -> Result<Value> {
        let slot = self
            .slots
            .get(index)
            .ok_or_else(|| Error::corrupt_key(format!("attribute index {} out of range", index)))?;
        let bytes = key.as_bytes();
        let payload = bytes
            .get(slot.offset..slot.offset + slot.len)
            .ok_or_else(|| Error::corrupt_key("attribute payload out of bounds"))?;
        decode_payload(slot.tag, payload)
    }
}

fn decode_payload(tag: u8, payload: &[u8]) -> Result<Value> {
    match tag {
        TAG_NULL => Ok(Value::Null),
        TAG_INTEGER => {
            let arr: [u8; 8] = payload
                .try_into()
                .map_err(|_| Error::corrupt_key("integer payload must be 8 bytes"))?;
            Ok(Value::Integer(i64::from_be_bytes(arr)))
        }
        TAG_FLOAT => {
            let arr: [u8; 8] = payload
                .try_into()
                .map_err(|_| Error::corrupt_key("float payload must be 8 bytes"))?;
            Ok(Value::Float(f64::from_bits(u64::from_be_bytes(arr))))
        }
        TAG_TEXT => String::from_utf8(payload.to_vec())
            .map(Value::Text)
            .map_err(|_| Error::corrupt_key("text payload is not valid UTF-8")),
        TAG_BLOB => Ok(Value::Blob(payload.to_vec())),
        other => Err(Error::corrupt_key(format!("unknown value tag {}", other))),
    }
}

/// Owned, reusable buffer holding one compressed key entry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompressedKeyBuf {
    bytes: Vec<u8>,
}

impl CompressedKeyBuf {
    /// Creates an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a buffer holding the encoding of `values`
    pub fn from_values(values: &[Value]) -> Self {
        Self {
            bytes: encode(values, false, 0),
        }
    }

    /// Overwrites the buffer with new entry bytes, keeping the allocation
    pub fn load(&mut self, bytes: &[u8]) {
        self.bytes.clear();
        self.bytes.extend_from_slice(bytes);
    }

    /// Encodes `values` into the buffer in place, keeping the allocation
    pub fn encode_values(&mut self, values: &[Value]) {
        encode_into(&mut self.bytes, values, false, 0);
    }

    /// Clears the buffer
    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    /// Returns true if no entry is loaded
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Raw entry bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Delete-mark flag from the header
    pub fn delete_mark(&self) -> bool {
        self.bytes
            .first()
            .is_some_and(|f| f & FLAG_DELETE_MARK != 0)
    }

    /// Number of values in the entry
    pub fn value_count(&self) -> usize {
        self.bytes.get(1).copied().unwrap_or(0) as usize
    }

    /// Blob bitmap from the header; bit `i` set means value `i` is an
    /// out-of-line BLOB descriptor
    pub fn blob_bitmap(&self) -> u32 {
        match self.bytes.get(2..HEADER_LEN) {
            Some(b) => u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
            None => 0,
        }
    }

    /// Returns true if value `index` is flagged as a BLOB descriptor
    pub fn is_blob_attr(&self, index: usize) -> bool {
        index < 32 && self.blob_bitmap() & (1 << index) != 0
    }

    /// Walks the entry and builds the offset map for its values
    pub fn build_attribute_map(&self) -> Result<AttributeMap> {
        if self.bytes.len() < HEADER_LEN {
            return Err(Error::corrupt_key("entry shorter than header"));
        }
        let count = self.value_count();
        let mut slots = SmallVec::with_capacity(count);
        let mut pos = HEADER_LEN;
        for _ in 0..count {
            let tag = *self
                .bytes
                .get(pos)
                .ok_or_else(|| Error::corrupt_key("truncated value tag"))?;
            let len_bytes = self
                .bytes
                .get(pos + 1..pos + 5)
                .ok_or_else(|| Error::corrupt_key("truncated value length"))?;
            let len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]])
                as usize;
            let offset = pos + 5;
            if offset + len > self.bytes.len() {
                return Err(Error::corrupt_key("value payload past end of entry"));
            }
            slots.push(AttrSlot { tag, offset, len });
            pos = offset + len;
        }
        if pos != self.bytes.len() {
            return Err(Error::corrupt_key("trailing bytes after last value"));
        }
        Ok(AttributeMap { slots })
    }

    /// Decodes all values of the entry
    pub fn decode_values(&self) -> Result<SmallVec<[Value; 4]>> {
        let map = self.build_attribute_map()?;
        let mut out = SmallVec::with_capacity(map.len());
        for i in 0..map.len() {
            out.push(map.value_at(self, i)?);
        }
        Ok(out)
    }

    /// Logical order of two entries: by value tuple, with delete-marked
    /// entries sorting before live entries of the same values
    pub fn compare(&self, other: &CompressedKeyBuf) -> Result<Ordering> {
        let a = self.decode_values()?;
        let b = other.decode_values()?;
        let ord = a
            .iter()
            .zip(b.iter())
            .map(|(x, y)| x.compare(y))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| a.len().cmp(&b.len()));
        if ord != Ordering::Equal {
            return Ok(ord);
        }
        // delete mark sorts low
        Ok(other.delete_mark().cmp(&self.delete_mark()))
    }
}
