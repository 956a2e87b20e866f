// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Result cache
//!
//! This module provides:
//! - the storage seam for cached results (`CacheStore`)
//! - an in-memory LRU implementation with entry and byte ceilings
//! - refresh key evaluation
//! - the read protocol that decides between hit, renewal and stale serving

pub mod memory;
pub mod query_cache;
pub mod refresh_key;

pub use memory::MemoryCacheStore;
pub use query_cache::{is_stale, CacheStatus, CachedResult, QueryCache};
pub use refresh_key::{RefreshKeySpec, RefreshKeys};

use crate::clock;
use crate::request::Fingerprint;
use crate::value::QueryOutput;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Cached result of one fingerprint
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub output: Arc<QueryOutput>,
    /// Refresh key observed when the data was produced
    pub refresh_key_value: String,
    pub stored_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn new(
        fingerprint: Fingerprint,
        output: Arc<QueryOutput>,
        refresh_key_value: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            fingerprint,
            output,
            refresh_key_value: refresh_key_value.into(),
            stored_at: Utc::now(),
            ttl,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        clock::elapsed(self.stored_at, now)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.age(now) > self.ttl
    }

    pub fn size_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.fingerprint.as_str().len()
            + self.refresh_key_value.len()
            + self.output.size_bytes()
    }
}

/// Cache statistics
///
/// Read directly from a store, `hits` counts lookups that found an entry,
/// fresh or stale. [`QueryCache::stats`] counts only fresh answers as hits
/// and reports stale ones as `renewals` or `stale_served`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Stale reads that waited for a foreground renewal
    pub renewals: u64,
    /// Stale reads answered while a background renewal ran
    pub stale_served: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
    pub bytes: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.renewals + self.stale_served;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Storage for cache entries
///
/// The in-memory store is the default. A networked key-value store can be
/// plugged in here as long as `put` replaces the entry atomically.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry>;

    /// Insert or replace the entry for `entry.fingerprint`
    async fn put(&self, entry: CacheEntry);

    /// Remove an entry; returns whether one was present
    async fn del(&self, fingerprint: &Fingerprint) -> bool;

    fn stats(&self) -> CacheStats;
}
