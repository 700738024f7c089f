//! Cacheable values and their payload encoding
//!
//! Payload layout: one tag byte followed by the body.
//!
//! ```text
//! 0x00 | raw bytes           (Blob)
//! 0x01 | compact JSON        (Structured)
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

const TAG_BLOB: u8 = 0x00;
const TAG_STRUCTURED: u8 = 0x01;

/// Column-oriented table with row-major cell storage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, row: Vec<Value>) {
        self.rows.push(row);
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Cell lookup by row index and column name
    pub fn cell(&self, row: usize, column: &str) -> Option<&Value> {
        let col = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(col)
    }
}

/// Tabular, dictionary or list-shaped data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum StructuredValue {
    Table(Table),
    Dict(Map<String, Value>),
    List(Vec<Value>),
}

/// Anything the cache can hold
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    /// Written to the structured store in addition to the size-routed tier
    Structured(StructuredValue),
    /// Opaque bytes
    Blob(Bytes),
}

impl CacheValue {
    pub fn is_structured(&self) -> bool {
        matches!(self, CacheValue::Structured(_))
    }

    /// Encode into a tier payload
    pub fn encode(&self) -> Result<Bytes> {
        match self {
            CacheValue::Blob(data) => {
                let mut buf = BytesMut::with_capacity(data.len() + 1);
                buf.put_u8(TAG_BLOB);
                buf.put_slice(data);
                Ok(buf.freeze())
            }
            CacheValue::Structured(value) => {
                let mut buf = vec![TAG_STRUCTURED];
                serde_json::to_writer(&mut buf, value)?;
                Ok(Bytes::from(buf))
            }
        }
    }

    /// Decode a tier payload
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (tag, body) = payload
            .split_first()
            .ok_or_else(|| Error::Decode("empty payload".into()))?;
        match *tag {
            TAG_BLOB => Ok(CacheValue::Blob(Bytes::copy_from_slice(body))),
            TAG_STRUCTURED => serde_json::from_slice(body)
                .map(CacheValue::Structured)
                .map_err(|e| Error::Decode(format!("structured body: {}", e))),
            other => Err(Error::Decode(format!("unknown payload tag 0x{:02x}", other))),
        }
    }
}

impl From<Table> for CacheValue {
    fn from(table: Table) -> Self {
        CacheValue::Structured(StructuredValue::Table(table))
    }
}

impl From<Map<String, Value>> for CacheValue {
    fn from(map: Map<String, Value>) -> Self {
        CacheValue::Structured(StructuredValue::Dict(map))
    }
}

impl From<Vec<Value>> for CacheValue {
    fn from(list: Vec<Value>) -> Self {
        CacheValue::Structured(StructuredValue::List(list))
    }
}

impl From<Bytes> for CacheValue {
    fn from(data: Bytes) -> Self {
        CacheValue::Blob(data)
    }
}

impl From<Vec<u8>> for CacheValue {
    fn from(data: Vec<u8>) -> Self {
        CacheValue::Blob(Bytes::from(data))
    }
}

impl From<Value> for CacheValue {
    /// Objects become dicts, arrays become lists, scalars are stored as JSON text blobs
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => map.into(),
            Value::Array(list) => list.into(),
            scalar => CacheValue::Blob(Bytes::from(scalar.to_string())),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
