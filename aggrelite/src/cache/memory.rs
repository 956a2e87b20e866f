// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! In-memory cache store with LRU eviction

use super::{CacheEntry, CacheStats, CacheStore};
use crate::clock;
use crate::config::CacheConfig;
use crate::request::Fingerprint;
use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::time::Duration;

/// LRU eviction tracker
///
/// Every access stamps the key with a fresh tick; the smallest tick is the
/// least recently used key.
#[derive(Debug)]
struct LruTracker<K> {
    order: BTreeMap<u64, K>,
    ticks: HashMap<K, u64>,
    next_tick: u64,
}

impl<K: Clone + Eq + Hash> LruTracker<K> {
    fn new() -> Self {
        Self {
            order: BTreeMap::new(),
            ticks: HashMap::new(),
            next_tick: 0,
        }
    }

    fn access(&mut self, key: &K) {
        if let Some(tick) = self.ticks.remove(key) {
            self.order.remove(&tick);
        }
        let tick = self.next_tick;
        self.next_tick += 1;
        self.order.insert(tick, key.clone());
        self.ticks.insert(key.clone(), tick);
    }

    fn remove(&mut self, key: &K) {
        if let Some(tick) = self.ticks.remove(key) {
            self.order.remove(&tick);
        }
    }

    fn remove_lru(&mut self) -> Option<K> {
        let (_, key) = self.order.pop_first()?;
        self.ticks.remove(&key);
        Some(key)
    }
}

struct Slot {
    entry: CacheEntry,
    size: usize,
}

struct Inner {
    slots: HashMap<Fingerprint, Slot>,
    lru: LruTracker<Fingerprint>,
    bytes: usize,
    stats: CacheStats,
}

impl Inner {
    fn remove(&mut self, fingerprint: &Fingerprint) -> Option<Slot> {
        let slot = self.slots.remove(fingerprint)?;
        self.lru.remove(fingerprint);
        self.bytes = self.bytes.saturating_sub(slot.size);
        Some(slot)
    }
}

/// Cache store kept in process memory
///
/// Entries are bounded by count and by accounted bytes. An entry is
/// physically removed once it is older than its TTL plus `stale_grace`;
/// until then it can still be served stale.
pub struct MemoryCacheStore {
    inner: Mutex<Inner>,
    max_entries: usize,
    max_bytes: usize,
    stale_grace: Duration,
}

impl MemoryCacheStore {
    pub fn new(max_entries: usize, max_bytes: usize, stale_grace: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: HashMap::new(),
                lru: LruTracker::new(),
                bytes: 0,
                stats: CacheStats::default(),
            }),
            max_entries,
            max_bytes,
            stale_grace,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_entries, config.max_bytes, config.stale_grace)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.slots.clear();
        inner.lru = LruTracker::new();
        inner.bytes = 0;
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let now = Utc::now();
        let mut inner = self.inner.lock();

        let expired = inner
            .slots
            .get(fingerprint)
            .map(|slot| slot.entry.age(now) > slot.entry.ttl.saturating_add(self.stale_grace));

        let Some(expired) = expired else {
            inner.stats.misses += 1;
            return None;
        };

        if expired {
            inner.remove(fingerprint);
            inner.stats.expirations += 1;
            inner.stats.misses += 1;
            debug!("Cache entry {} expired", fingerprint.short());
            return None;
        }

        inner.lru.access(fingerprint);
        inner.stats.hits += 1;
        inner.slots.get(fingerprint).map(|slot| slot.entry.clone())
    }

    async fn put(&self, entry: CacheEntry) {
        let size = entry.size_bytes();
        let fingerprint = entry.fingerprint.clone();
        let mut inner = self.inner.lock();

        inner.remove(&fingerprint);
        if size > self.max_bytes {
            debug!(
                "Not caching {}: {} bytes exceeds the {} byte ceiling",
                fingerprint.short(),
                size,
                self.max_bytes
            );
            return;
        }

        inner.slots.insert(fingerprint.clone(), Slot { entry, size });
        inner.lru.access(&fingerprint);
        inner.bytes += size;
        inner.stats.insertions += 1;

        // The new entry holds the newest tick, so it is evicted last
        while inner.slots.len() > self.max_entries || inner.bytes > self.max_bytes {
            let Some(victim) = inner.lru.remove_lru() else {
                break;
            };
            if let Some(slot) = inner.slots.remove(&victim) {
                inner.bytes = inner.bytes.saturating_sub(slot.size);
                inner.stats.evictions += 1;
                debug!(
                    "Evicted cache entry {} (age {:?})",
                    victim.short(),
                    clock::elapsed(slot.entry.stored_at, Utc::now())
                );
            }
        }
    }

    async fn del(&self, fingerprint: &Fingerprint) -> bool {
        self.inner.lock().remove(fingerprint).is_some()
    }

    fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.slots.len(),
            bytes: inner.bytes,
            ..inner.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Column, QueryOutput, Value};
    use std::sync::Arc;

    fn entry(name: &str, ttl: Duration) -> CacheEntry {
        let output = QueryOutput::new(
            vec![Column::new("v", "text")],
            vec![vec![Value::from(name)]],
        );
        CacheEntry::new(
            Fingerprint::compute(name, &[], "default"),
            Arc::new(output),
            "rk",
            ttl,
        )
    }

    #[test]
    fn test_lru_tracker_order() {
        let mut lru = LruTracker::new();
        lru.access(&"a");
        lru.access(&"b");
        lru.access(&"c");
        lru.access(&"a");

        assert_eq!(lru.remove_lru(), Some("b"));
        assert_eq!(lru.remove_lru(), Some("c"));
        assert_eq!(lru.remove_lru(), Some("a"));
        assert_eq!(lru.remove_lru(), None);
    }

    #[tokio::test]
    async fn test_put_get_del() {
        let store = MemoryCacheStore::new(10, 1 << 20, Duration::ZERO);
        let e = entry("q1", Duration::from_secs(60));
        let fp = e.fingerprint.clone();

        store.put(e).await;
        let fetched = store.get(&fp).await.unwrap();
        assert_eq!(fetched.refresh_key_value, "rk");
        assert_eq!(fetched.output.rows[0][0], Value::from("q1"));

        assert!(store.del(&fp).await);
        assert!(store.get(&fp).await.is_none());
        assert!(!store.del(&fp).await);
    }

    #[tokio::test]
    async fn test_entry_ceiling_evicts_least_recently_used() {
        let store = MemoryCacheStore::new(2, 1 << 20, Duration::ZERO);
        let (a, b, c) = (
            entry("a", Duration::from_secs(60)),
            entry("b", Duration::from_secs(60)),
            entry("c", Duration::from_secs(60)),
        );
        let (fa, fb, fc) = (
            a.fingerprint.clone(),
            b.fingerprint.clone(),
            c.fingerprint.clone(),
        );

        store.put(a).await;
        store.put(b).await;
        // Touch a so b becomes the eviction victim
        assert!(store.get(&fa).await.is_some());
        store.put(c).await;

        assert!(store.get(&fa).await.is_some());
        assert!(store.get(&fb).await.is_none());
        assert!(store.get(&fc).await.is_some());
        assert_eq!(store.stats().evictions, 1);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_byte_ceiling() {
        let one = entry("x", Duration::from_secs(60)).size_bytes();
        let store = MemoryCacheStore::new(100, one * 2, Duration::ZERO);

        for name in ["x", "y", "z"] {
            store.put(entry(name, Duration::from_secs(60))).await;
        }

        let stats = store.stats();
        assert!(stats.bytes <= one * 2);
        assert_eq!(stats.entries, 2);
    }

    #[tokio::test]
    async fn test_oversized_entry_is_not_stored() {
        let store = MemoryCacheStore::new(100, 16, Duration::ZERO);
        let e = entry("big", Duration::from_secs(60));
        let fp = e.fingerprint.clone();
        store.put(e).await;
        assert!(store.get(&fp).await.is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_expired_entry_survives_grace_then_goes() {
        let store = MemoryCacheStore::new(10, 1 << 20, Duration::from_secs(3600));
        let mut e = entry("old", Duration::from_secs(1));
        e.stored_at = Utc::now() - chrono::Duration::seconds(10);
        let fp = e.fingerprint.clone();
        store.put(e).await;

        // Past TTL but inside the grace period
        let fetched = store.get(&fp).await.unwrap();
        assert!(fetched.is_expired(Utc::now()));

        let store = MemoryCacheStore::new(10, 1 << 20, Duration::ZERO);
        let mut e = entry("old", Duration::from_secs(1));
        e.stored_at = Utc::now() - chrono::Duration::seconds(10);
        store.put(e).await;
        assert!(store.get(&fp).await.is_none());
        assert_eq!(store.stats().expirations, 1);
    }

    #[tokio::test]
    async fn test_unbounded_ttl_never_expires() {
        let store = MemoryCacheStore::new(10, 1 << 20, Duration::from_secs(3600));
        let mut e = entry("forever", Duration::MAX);
        e.stored_at = Utc::now() - chrono::Duration::days(365);
        let fp = e.fingerprint.clone();
        store.put(e).await;

        for _ in 0..2 {
            let fetched = store.get(&fp).await.unwrap();
            assert!(!fetched.is_expired(Utc::now()));
        }
        assert_eq!(store.stats().expirations, 0);
    }

    #[tokio::test]
    async fn test_hit_rate() {
        let store = MemoryCacheStore::new(10, 1 << 20, Duration::ZERO);
        let e = entry("q", Duration::from_secs(60));
        let fp = e.fingerprint.clone();
        store.put(e).await;

        store.get(&fp).await;
        store.get(&Fingerprint::compute("missing", &[], "default")).await;

        let stats = store.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }
}
