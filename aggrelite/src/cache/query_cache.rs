// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Cached reads with refresh-key driven renewal

use super::refresh_key::{RefreshKeySpec, RefreshKeys};
use super::{CacheEntry, CacheStats, CacheStore};
use crate::config::{CacheConfig, RenewalPolicy};
use crate::error::QueryError;
use crate::queue::QueryQueue;
use crate::request::{CacheDirective, Fingerprint, QueryRequest};
use crate::value::QueryOutput;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How a cached read was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Fresh entry served from the store
    Hit,
    /// No entry; the caller waited for an execution
    Miss,
    /// Stale entry; the caller waited for a renewal
    Renewed,
    /// Stale entry served while a background renewal runs
    Stale,
    /// Caching disabled
    Bypass,
}

#[derive(Debug, Clone)]
pub struct CachedResult {
    pub output: Arc<QueryOutput>,
    pub status: CacheStatus,
    /// Refresh key the result was validated against, if one was computed
    pub refresh_key_value: Option<String>,
}

/// An entry is stale when its TTL has elapsed or the data's refresh key moved
pub fn is_stale(entry: &CacheEntry, current_refresh_key: &str, now: DateTime<Utc>) -> bool {
    entry.is_expired(now) || entry.refresh_key_value != current_refresh_key
}

/// Outcomes of `fetch`, by status
#[derive(Debug, Default)]
struct ReadCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    renewals: AtomicU64,
    stale_served: AtomicU64,
}

impl ReadCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

async fn store_result(
    store: &Arc<dyn CacheStore>,
    fingerprint: Fingerprint,
    output: Arc<QueryOutput>,
    directive: CacheDirective,
) {
    store
        .put(CacheEntry::new(
            fingerprint,
            output,
            directive.refresh_key_value,
            directive.ttl,
        ))
        .await;
}

/// Read path over the cache store
///
/// Executions always go through the query queue, so concurrent readers of
/// one fingerprint share a single driver call.
pub struct QueryCache {
    config: CacheConfig,
    store: Arc<dyn CacheStore>,
    queue: Arc<QueryQueue>,
    refresh_keys: RefreshKeys,
    counters: ReadCounters,
}

impl QueryCache {
    pub fn new(config: CacheConfig, store: Arc<dyn CacheStore>, queue: Arc<QueryQueue>) -> Self {
        let refresh_keys = RefreshKeys::new(queue.clone());
        Self {
            config,
            store,
            queue,
            refresh_keys,
            counters: ReadCounters::default(),
        }
    }

    pub fn refresh_keys(&self) -> &RefreshKeys {
        &self.refresh_keys
    }

    pub async fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        self.store.get(fingerprint).await
    }

    pub async fn put(
        &self,
        fingerprint: Fingerprint,
        output: Arc<QueryOutput>,
        refresh_key_value: impl Into<String>,
        ttl: Duration,
    ) {
        self.store
            .put(CacheEntry::new(fingerprint, output, refresh_key_value, ttl))
            .await;
    }

    pub async fn evict(&self, fingerprint: &Fingerprint) -> bool {
        self.store.del(fingerprint).await
    }

    /// Store occupancy with hits and misses counted per `fetch` outcome
    pub fn stats(&self) -> CacheStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        CacheStats {
            hits: load(&self.counters.hits),
            misses: load(&self.counters.misses),
            renewals: load(&self.counters.renewals),
            stale_served: load(&self.counters.stale_served),
            ..self.store.stats()
        }
    }

    /// Run `request` through the queue and wait.
    ///
    /// A request that joins an execution already in flight does not pass its
    /// cache directive to that item, so the result is stored here instead.
    async fn execute(&self, request: QueryRequest) -> Result<Arc<QueryOutput>, QueryError> {
        let fingerprint = request.fingerprint.clone();
        let directive = request.cache.clone();
        let handle = self.queue.enqueue(request).await?;
        let joined = handle.is_joined();
        let output = handle.wait().await?;
        if let (true, Some(directive)) = (joined, directive) {
            store_result(&self.store, fingerprint, output.clone(), directive).await;
        }
        Ok(output)
    }

    /// Enqueue a detached renewal and return without waiting
    async fn renew_in_background(&self, request: QueryRequest) -> Result<(), QueryError> {
        let fingerprint = request.fingerprint.clone();
        let directive = request.cache.clone();
        let handle = self.queue.enqueue(request.detached()).await?;
        let Some(directive) = directive.filter(|_| handle.is_joined()) else {
            // The handle is dropped; detached items are never orphaned
            return Ok(());
        };

        let store = self.store.clone();
        tokio::spawn(async move {
            match handle.wait().await {
                Ok(output) => store_result(&store, fingerprint, output, directive).await,
                Err(e) => warn!("Background renewal of {} failed: {}", fingerprint.short(), e),
            }
        });
        Ok(())
    }

    /// Serve `request` from cache, renewing according to the configured policy.
    ///
    /// Without a refresh key only the TTL decides staleness. A TTL carried on
    /// `request.cache` overrides the configured default.
    pub async fn fetch(
        &self,
        request: QueryRequest,
        refresh_key: Option<&RefreshKeySpec>,
    ) -> Result<CachedResult, QueryError> {
        if !self.config.enabled {
            let output = self.queue.execute(request).await?;
            return Ok(CachedResult {
                output,
                status: CacheStatus::Bypass,
                refresh_key_value: None,
            });
        }

        let current = match refresh_key {
            Some(spec) => {
                self.refresh_keys
                    .compute(spec, &request.data_source)
                    .await?
            }
            None => String::new(),
        };
        let ttl = request
            .cache
            .as_ref()
            .map(|directive| directive.ttl)
            .unwrap_or(self.config.default_ttl);
        let renewal = request.with_cache(CacheDirective {
            refresh_key_value: current.clone(),
            ttl,
        });

        let entry = self.store.get(&renewal.fingerprint).await;
        let now = Utc::now();

        match entry {
            Some(entry) if !is_stale(&entry, &current, now) => {
                debug!("Cache hit for {}", entry.fingerprint.short());
                ReadCounters::bump(&self.counters.hits);
                Ok(CachedResult {
                    output: entry.output,
                    status: CacheStatus::Hit,
                    refresh_key_value: Some(current),
                })
            }
            Some(entry) => match self.config.renewal {
                RenewalPolicy::Foreground => {
                    debug!(
                        "Cache entry {} is stale, renewing in foreground",
                        entry.fingerprint.short()
                    );
                    ReadCounters::bump(&self.counters.renewals);
                    let output = self.execute(renewal).await?;
                    Ok(CachedResult {
                        output,
                        status: CacheStatus::Renewed,
                        refresh_key_value: Some(current),
                    })
                }
                RenewalPolicy::StaleWhileRevalidate => {
                    info!(
                        "Serving stale entry {} while renewing in background",
                        entry.fingerprint.short()
                    );
                    self.renew_in_background(renewal).await?;
                    ReadCounters::bump(&self.counters.stale_served);
                    Ok(CachedResult {
                        output: entry.output,
                        status: CacheStatus::Stale,
                        refresh_key_value: Some(entry.refresh_key_value),
                    })
                }
            },
            None => {
                debug!("Cache miss for {}", renewal.fingerprint.short());
                ReadCounters::bump(&self.counters.misses);
                let output = self.execute(renewal).await?;
                Ok(CachedResult {
                    output,
                    status: CacheStatus::Miss,
                    refresh_key_value: Some(current),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::QueryOutput;

    fn entry(refresh_key: &str, ttl: Duration) -> CacheEntry {
        CacheEntry::new(
            Fingerprint::compute("SELECT 1", &[], "default"),
            Arc::new(QueryOutput::empty()),
            refresh_key,
            ttl,
        )
    }

    #[test]
    fn test_fresh_entry_is_not_stale() {
        let e = entry("k1", Duration::from_secs(60));
        assert!(!is_stale(&e, "k1", Utc::now()));
    }

    #[test]
    fn test_changed_refresh_key_is_stale() {
        let e = entry("k1", Duration::from_secs(60));
        assert!(is_stale(&e, "k2", Utc::now()));
    }

    #[test]
    fn test_elapsed_ttl_is_stale() {
        let e = entry("k1", Duration::from_secs(60));
        let later = Utc::now() + chrono::Duration::seconds(61);
        assert!(is_stale(&e, "k1", later));
    }
}
