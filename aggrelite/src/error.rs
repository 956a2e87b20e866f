// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Error types
//!
//! Drivers signal one of four kinds; the queue decides what each kind means
//! for retries and what interactive callers finally observe.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Kinds every driver error must be mapped into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Connection drop, deadlock, momentary pool exhaustion
    Transient,
    /// Malformed SQL, permission denied, schema mismatch
    Fatal,
    /// Caller- or system-initiated cancellation
    Cancelled,
    /// Lease or per-call deadline exceeded
    Timeout,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Fatal => write!(f, "fatal"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
            ErrorKind::Timeout => write!(f, "timeout"),
        }
    }
}

/// Error returned by a driver through the execution contract
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} driver error: {message}")]
pub struct DriverError {
    pub kind: ErrorKind,
    pub message: String,
}

impl DriverError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }
}

/// Error observed by callers awaiting a queued query
///
/// Cloned to every waiter joined on the same fingerprint.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Fatal error: {0}")]
    Fatal(String),

    #[error("Query cancelled: {0}")]
    Cancelled(String),

    #[error("Query timed out: {0}")]
    Timeout(String),
}

impl QueryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueryError::Transient(_) => ErrorKind::Transient,
            QueryError::Fatal(_) => ErrorKind::Fatal,
            QueryError::Cancelled(_) => ErrorKind::Cancelled,
            QueryError::Timeout(_) => ErrorKind::Timeout,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            QueryError::Transient(m)
            | QueryError::Fatal(m)
            | QueryError::Cancelled(m)
            | QueryError::Timeout(m) => m,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, QueryError::Transient(_) | QueryError::Timeout(_))
    }

    /// Escalate to `Fatal`, keeping the original message
    pub fn into_fatal(self) -> Self {
        match self {
            QueryError::Fatal(_) | QueryError::Cancelled(_) => self,
            other => QueryError::Fatal(format!("{} (retries exhausted)", other.message())),
        }
    }
}

impl From<DriverError> for QueryError {
    fn from(error: DriverError) -> Self {
        match error.kind {
            ErrorKind::Transient => QueryError::Transient(error.message),
            ErrorKind::Fatal => QueryError::Fatal(error.message),
            ErrorKind::Cancelled => QueryError::Cancelled(error.message),
            ErrorKind::Timeout => QueryError::Timeout(error.message),
        }
    }
}

/// Configuration and definition errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Unknown data source: {0}")]
    UnknownDataSource(String),

    #[error("Unknown pre-aggregation: {0}")]
    UnknownDefinition(String),

    #[error("Dependency cycle involving pre-aggregation '{0}'")]
    DependencyCycle(String),

    #[error("Failed to load partition metadata: {0}")]
    Store(#[from] StoreError),
}

/// Partition metadata store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[cfg(feature = "sled-backend")]
impl From<sled::Error> for StoreError {
    fn from(error: sled::Error) -> Self {
        StoreError::Storage(error.to_string())
    }
}

#[cfg(feature = "sled-backend")]
impl From<bincode::Error> for StoreError {
    fn from(error: bincode::Error) -> Self {
        StoreError::Serialization(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_maps_to_query_error_kind() {
        for kind in [
            ErrorKind::Transient,
            ErrorKind::Fatal,
            ErrorKind::Cancelled,
            ErrorKind::Timeout,
        ] {
            let err: QueryError = DriverError::new(kind, "boom").into();
            assert_eq!(err.kind(), kind);
            assert_eq!(err.message(), "boom");
        }
    }

    #[test]
    fn test_escalation_keeps_cancelled() {
        let cancelled = QueryError::Cancelled("by user".into());
        assert_eq!(cancelled.clone().into_fatal(), cancelled);

        let escalated = QueryError::Timeout("slow".into()).into_fatal();
        assert_eq!(escalated.kind(), ErrorKind::Fatal);
        assert!(escalated.message().starts_with("slow"));
    }
}
