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

//! Runtime values for key parts and materialized tuples
//!
//! This is the subset of a SQL value model the cursor layer needs: the
//! scalar types that occur in key entries, plus the out-of-line BLOB
//! reference descriptor substituted during materialization.

use std::cmp::Ordering;
use std::fmt;

use crate::core::error::{Error, Result};

/// Declared type of an attribute, carried by the plan's key parts so the
/// cursor can undo descending storage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Integer,
    Float,
    Text,
    Blob,
}

/// Reference descriptor for an out-of-line BLOB
///
/// BLOB attributes are never inlined in a materialized tuple; the key entry
/// carries this descriptor and the caller dereferences it through the blob
/// store when (and if) the value is actually needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobRef {
    /// Identifier in the out-of-line blob store
    pub id: u64,
    /// Total byte length of the stored blob
    pub len: u64,
}

impl BlobRef {
    /// Serialized descriptor size: id + len
    pub const ENCODED_LEN: usize = 16;

    /// Encodes the descriptor into its stored form
    pub fn to_bytes(self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[..8].copy_from_slice(&self.id.to_be_bytes());
        buf[8..].copy_from_slice(&self.len.to_be_bytes());
        buf
    }

    /// Decodes a descriptor from its stored form
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(Error::corrupt_key(format!(
                "blob descriptor must be {} bytes, got {}",
                Self::ENCODED_LEN,
                bytes.len()
            )));
        }
        let mut id = [0u8; 8];
        let mut len = [0u8; 8];
        id.copy_from_slice(&bytes[..8]);
        len.copy_from_slice(&bytes[8..]);
        Ok(BlobRef {
            id: u64::from_be_bytes(id),
            len: u64::from_be_bytes(len),
        })
    }
}

/// A single runtime value
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
    /// Out-of-line BLOB reference, produced only by materialization
    BlobRef(BlobRef),
}

impl Value {
    /// Convenience constructor for text values
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    /// Returns true for SQL NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer accessor
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Text accessor
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Blob reference accessor
    pub fn as_blob_ref(&self) -> Option<BlobRef> {
        match self {
            Value::BlobRef(r) => Some(*r),
            _ => None,
        }
    }

    /// The declared type this value inhabits, if unambiguous
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Integer(_) => Some(DataType::Integer),
            Value::Float(_) => Some(DataType::Float),
            Value::Text(_) => Some(DataType::Text),
            Value::Blob(_) | Value::BlobRef(_) => Some(DataType::Blob),
        }
    }

    /// Converts a value into the order-reversed form used when a key part
    /// is stored descending. The transform is an involution at the byte
    /// level: integers are bitwise complemented, floats negated, and
    /// text/blob payloads complemented bytewise (text travels as a blob in
    /// stored form because the complement is not valid UTF-8).
    pub fn to_descending_stored(&self) -> Value {
        match self {
            Value::Null => Value::Null,
            Value::Integer(i) => Value::Integer(!i),
            Value::Float(f) => Value::Float(-f),
            Value::Text(s) => Value::Blob(complement(s.as_bytes())),
            Value::Blob(b) => Value::Blob(complement(b)),
            Value::BlobRef(r) => Value::BlobRef(*r),
        }
    }

    /// Undoes [`to_descending_stored`](Self::to_descending_stored), using the
    /// key part's declared type to rebuild text from its complemented bytes
    pub fn from_descending_stored(&self, declared: DataType) -> Result<Value> {
        match (self, declared) {
            (Value::Null, _) => Ok(Value::Null),
            (Value::Integer(i), DataType::Integer) => Ok(Value::Integer(!i)),
            (Value::Float(f), DataType::Float) => Ok(Value::Float(-f)),
            (Value::Blob(b), DataType::Text) => {
                let restored = complement(b);
                String::from_utf8(restored)
                    .map(Value::Text)
                    .map_err(|_| Error::corrupt_key("descending text is not valid UTF-8"))
            }
            (Value::Blob(b), DataType::Blob) => Ok(Value::Blob(complement(b))),
            _ => Err(Error::corrupt_key(format!(
                "descending stored form {:?} does not match declared type {:?}",
                self, declared
            ))),
        }
    }

    /// Total order over values, NULL first, then by type rank, then by
    /// payload. Floats compare by total order so the relation is valid for
    /// tree keys.
    pub fn compare(&self, other: &Value) -> Ordering {
        fn rank(v: &Value) -> u8 {
            match v {
                Value::Null => 0,
                Value::Integer(_) | Value::Float(_) => 1,
                Value::Text(_) => 2,
                Value::Blob(_) => 3,
                Value::BlobRef(_) => 4,
            }
        }
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Integer(a), Value::Float(b)) => (*a as f64).total_cmp(b),
            (Value::Float(a), Value::Integer(b)) => a.total_cmp(&(*b as f64)),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Blob(a), Value::Blob(b)) => a.cmp(b),
            (Value::BlobRef(a), Value::BlobRef(b)) => (a.id, a.len).cmp(&(b.id, b.len)),
            (a, b) => rank(a).cmp(&rank(b)),
        }
    }
}

fn complement(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().map(|b| !b).collect()
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.compare(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(s) => write!(f, "'{}'", s),
            Value::Blob(b) => write!(f, "x'{}'", hex(b)),
            Value::BlobRef(r) => write!(f, "blob#{}({} bytes)", r.id, r.len),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
