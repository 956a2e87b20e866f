// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Scalar values, result rows and result schema
//!
//! Query parameters and result cells share one scalar type so that results
//! can be fed back as parameters (refresh keys, partition ranges).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scalar value used for query parameters and result cells
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(String),
    DateTime(DateTime<Utc>),
}

impl Value {
    /// Extract as string if possible
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Extract as integer if possible
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Extract as datetime if possible
    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Append a type-tagged, length-prefixed encoding of this value.
    ///
    /// The encoding is stable across processes and platforms; fingerprints
    /// and composite refresh keys are hashed over it.
    pub fn write_canonical(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Null => buf.push(0),
            Value::Boolean(b) => {
                buf.push(1);
                buf.push(*b as u8);
            }
            Value::Integer(i) => {
                buf.push(2);
                buf.extend_from_slice(&i.to_be_bytes());
            }
            Value::Number(n) => {
                buf.push(3);
                // All NaNs collapse to one encoding
                let bits = if n.is_nan() { f64::NAN.to_bits() } else { n.to_bits() };
                buf.extend_from_slice(&bits.to_be_bytes());
            }
            Value::String(s) => {
                buf.push(4);
                write_bytes(buf, s.as_bytes());
            }
            Value::DateTime(dt) => {
                buf.push(5);
                buf.extend_from_slice(&dt.timestamp().to_be_bytes());
                buf.extend_from_slice(&dt.timestamp_subsec_nanos().to_be_bytes());
            }
        }
    }

    /// Rough in-memory footprint, used for cache byte accounting
    pub fn size_bytes(&self) -> usize {
        let inline = std::mem::size_of::<Value>();
        match self {
            Value::String(s) => inline + s.len(),
            _ => inline,
        }
    }
}

/// Length-prefixed byte string
pub(crate) fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
    buf.extend_from_slice(bytes);
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", s),
            Value::DateTime(dt) => write!(f, "{}", dt.to_rfc3339()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(dt: DateTime<Utc>) -> Self {
        Value::DateTime(dt)
    }
}

/// One result row, positionally aligned with the result schema
pub type Row = Vec<Value>;

/// Result column description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: String,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// Rows and schema produced by one execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOutput {
    pub rows: Vec<Row>,
    pub schema: Vec<Column>,
}

impl QueryOutput {
    pub fn new(schema: Vec<Column>, rows: Vec<Row>) -> Self {
        Self { rows, schema }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// First column of the first row, the shape refresh-key queries return
    pub fn first_value(&self) -> Option<&Value> {
        self.rows.first().and_then(|row| row.first())
    }

    pub fn size_bytes(&self) -> usize {
        let schema_size: usize = self
            .schema
            .iter()
            .map(|c| c.name.len() + c.data_type.len())
            .sum();
        let rows_size: usize = self
            .rows
            .iter()
            .map(|row| row.iter().map(Value::size_bytes).sum::<usize>())
            .sum();
        std::mem::size_of::<Self>() + schema_size + rows_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: &Value) -> Vec<u8> {
        let mut buf = Vec::new();
        value.write_canonical(&mut buf);
        buf
    }

    #[test]
    fn test_canonical_encoding_distinguishes_types() {
        assert_ne!(encode(&Value::Integer(1)), encode(&Value::Number(1.0)));
        assert_ne!(encode(&Value::String("1".into())), encode(&Value::Integer(1)));
        assert_eq!(encode(&Value::Number(f64::NAN)), encode(&Value::Number(-f64::NAN)));
    }

    #[test]
    fn test_first_value() {
        let output = QueryOutput::new(
            vec![Column::new("max", "timestamp")],
            vec![vec![Value::Integer(42)]],
        );
        assert_eq!(output.first_value(), Some(&Value::Integer(42)));
        assert_eq!(QueryOutput::empty().first_value(), None);
    }
}
