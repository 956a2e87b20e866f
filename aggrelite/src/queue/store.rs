// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Queue state storage
//!
//! Every operation on [`QueueStore`] is atomic. Deduplication and admission
//! are global across all queue processes sharing one store, which is what
//! keeps a fingerprint from running twice.

use super::item::{ItemState, LeaseStatus, QueueItem, QueryOutcome};
use crate::clock;
use crate::request::{Fingerprint, QueryKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Admission domain: interactive and build work are capped separately
pub type Domain = (String, QueryKind);

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert `item` unless a non-terminal item with its fingerprint exists
    async fn try_acquire(&self, item: QueueItem) -> bool;

    async fn get(&self, fingerprint: &Fingerprint) -> Option<QueueItem>;

    /// Activate the best available pending item of a domain if fewer than
    /// `cap` items of that domain are active
    async fn claim_next(
        &self,
        data_source: &str,
        kind: QueryKind,
        cap: usize,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Option<QueueItem>;

    async fn renew_lease(
        &self,
        fingerprint: &Fingerprint,
        worker_id: &str,
        expiry: DateTime<Utc>,
    ) -> LeaseStatus;

    /// Return an active item to pending for another attempt
    async fn requeue(
        &self,
        fingerprint: &Fingerprint,
        attempts: u32,
        timeouts: u32,
        available_at: DateTime<Utc>,
    ) -> bool;

    /// Flag a non-terminal item for cancellation by whichever worker runs it
    async fn request_cancel(&self, fingerprint: &Fingerprint) -> bool;

    /// Remove an item only if it is still pending
    async fn remove_pending(&self, fingerprint: &Fingerprint) -> Option<QueueItem>;

    /// Destroy the item and publish its outcome for remote waiters
    async fn complete(&self, fingerprint: &Fingerprint, outcome: QueryOutcome);

    /// Published outcome of a finished item, while retained
    async fn outcome(&self, fingerprint: &Fingerprint) -> Option<QueryOutcome>;

    async fn list_expired_leases(&self, now: DateTime<Utc>) -> Vec<Fingerprint>;

    /// Move an item whose lease expired back to pending, counting the attempt
    async fn reclaim_expired(
        &self,
        fingerprint: &Fingerprint,
        now: DateTime<Utc>,
    ) -> Option<QueueItem>;

    /// Domains that currently have pending items
    async fn pending_domains(&self) -> Vec<Domain>;

    /// Copy of every live item
    async fn items(&self) -> Vec<QueueItem>;
}

type PendingKey = (Reverse<i32>, u64);

#[derive(Default)]
struct Inner {
    items: HashMap<Fingerprint, QueueItem>,
    pending: HashMap<Domain, BTreeMap<PendingKey, Fingerprint>>,
    active: HashMap<Domain, usize>,
    outcomes: HashMap<Fingerprint, (QueryOutcome, DateTime<Utc>)>,
    next_sequence: u64,
}

fn domain_of(item: &QueueItem) -> Domain {
    (item.data_source().to_string(), item.kind())
}

fn pending_key(item: &QueueItem) -> PendingKey {
    (Reverse(item.priority()), item.sequence)
}

impl Inner {
    fn index_pending(&mut self, item: &QueueItem) {
        self.pending
            .entry(domain_of(item))
            .or_default()
            .insert(pending_key(item), item.fingerprint().clone());
    }

    fn unindex_pending(&mut self, item: &QueueItem) {
        let domain = domain_of(item);
        if let Some(queue) = self.pending.get_mut(&domain) {
            queue.remove(&pending_key(item));
            if queue.is_empty() {
                self.pending.remove(&domain);
            }
        }
    }

    fn release_slot(&mut self, item: &QueueItem) {
        if let Some(count) = self.active.get_mut(&domain_of(item)) {
            *count = count.saturating_sub(1);
        }
    }

    fn purge_outcomes(&mut self, now: DateTime<Utc>, retention: Duration) {
        let cutoff = clock::sub(now, retention);
        self.outcomes.retain(|_, (_, finished_at)| *finished_at >= cutoff);
    }
}

/// Queue store for a single process, or several queues sharing one `Arc`
pub struct MemoryQueueStore {
    inner: Mutex<Inner>,
    result_retention: Duration,
}

impl MemoryQueueStore {
    pub fn new(result_retention: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            result_retention,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Active items of a domain
    pub fn active_count(&self, data_source: &str, kind: QueryKind) -> usize {
        self.inner
            .lock()
            .active
            .get(&(data_source.to_string(), kind))
            .copied()
            .unwrap_or(0)
    }
}

impl Default for MemoryQueueStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn try_acquire(&self, mut item: QueueItem) -> bool {
        let mut inner = self.inner.lock();
        let live = inner
            .items
            .get(item.fingerprint())
            .is_some_and(|existing| !existing.state.is_terminal());
        if live {
            return false;
        }

        item.sequence = inner.next_sequence;
        inner.next_sequence += 1;
        item.state = ItemState::Pending;
        inner.outcomes.remove(item.fingerprint());
        inner.index_pending(&item);
        inner.items.insert(item.fingerprint().clone(), item);
        true
    }

    async fn get(&self, fingerprint: &Fingerprint) -> Option<QueueItem> {
        self.inner.lock().items.get(fingerprint).cloned()
    }

    async fn claim_next(
        &self,
        data_source: &str,
        kind: QueryKind,
        cap: usize,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Option<QueueItem> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let domain = (data_source.to_string(), kind);

        if inner.active.get(&domain).copied().unwrap_or(0) >= cap {
            return None;
        }

        let queue = inner.pending.get_mut(&domain)?;
        let (key, fingerprint) = queue
            .iter()
            .find(|(_, fp)| {
                inner
                    .items
                    .get(*fp)
                    .is_some_and(|item| item.available_at <= now)
            })
            .map(|(key, fp)| (*key, fp.clone()))?;
        queue.remove(&key);
        if queue.is_empty() {
            inner.pending.remove(&domain);
        }

        let item = inner.items.get_mut(&fingerprint)?;
        item.activate(worker_id, now);
        *inner.active.entry(domain).or_insert(0) += 1;
        Some(item.clone())
    }

    async fn renew_lease(
        &self,
        fingerprint: &Fingerprint,
        worker_id: &str,
        expiry: DateTime<Utc>,
    ) -> LeaseStatus {
        let mut inner = self.inner.lock();
        match inner.items.get_mut(fingerprint) {
            Some(item)
                if item.state == ItemState::Active
                    && item.worker_id.as_deref() == Some(worker_id) =>
            {
                item.lease_expiry = Some(expiry);
                if item.cancel_requested {
                    LeaseStatus::CancelRequested
                } else {
                    LeaseStatus::Held
                }
            }
            _ => LeaseStatus::Lost,
        }
    }

    async fn requeue(
        &self,
        fingerprint: &Fingerprint,
        attempts: u32,
        timeouts: u32,
        available_at: DateTime<Utc>,
    ) -> bool {
        let mut inner = self.inner.lock();
        let Some(item) = inner.items.get_mut(fingerprint) else {
            return false;
        };
        if item.state != ItemState::Active {
            return false;
        }
        item.return_to_pending();
        item.attempts = attempts;
        item.timeouts = timeouts;
        item.available_at = available_at;
        let item = item.clone();

        inner.release_slot(&item);
        inner.index_pending(&item);
        true
    }

    async fn request_cancel(&self, fingerprint: &Fingerprint) -> bool {
        let mut inner = self.inner.lock();
        match inner.items.get_mut(fingerprint) {
            Some(item) if !item.state.is_terminal() => {
                item.cancel_requested = true;
                true
            }
            _ => false,
        }
    }

    async fn remove_pending(&self, fingerprint: &Fingerprint) -> Option<QueueItem> {
        let mut inner = self.inner.lock();
        if inner.items.get(fingerprint)?.state != ItemState::Pending {
            return None;
        }
        let item = inner.items.remove(fingerprint)?;
        inner.unindex_pending(&item);
        Some(item)
    }

    async fn complete(&self, fingerprint: &Fingerprint, outcome: QueryOutcome) {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        if let Some(item) = inner.items.remove(fingerprint) {
            match item.state {
                ItemState::Active => inner.release_slot(&item),
                ItemState::Pending => inner.unindex_pending(&item),
                _ => {}
            }
        }
        inner.purge_outcomes(now, self.result_retention);
        inner.outcomes.insert(fingerprint.clone(), (outcome, now));
    }

    async fn outcome(&self, fingerprint: &Fingerprint) -> Option<QueryOutcome> {
        self.inner
            .lock()
            .outcomes
            .get(fingerprint)
            .map(|(outcome, _)| outcome.clone())
    }

    async fn list_expired_leases(&self, now: DateTime<Utc>) -> Vec<Fingerprint> {
        self.inner
            .lock()
            .items
            .values()
            .filter(|item| item.lease_expired(now))
            .map(|item| item.fingerprint().clone())
            .collect()
    }

    async fn reclaim_expired(
        &self,
        fingerprint: &Fingerprint,
        now: DateTime<Utc>,
    ) -> Option<QueueItem> {
        let mut inner = self.inner.lock();
        let item = inner.items.get_mut(fingerprint)?;
        if !item.lease_expired(now) {
            return None;
        }
        item.return_to_pending();
        item.attempts += 1;
        item.available_at = now;
        let item = item.clone();

        inner.release_slot(&item);
        inner.index_pending(&item);
        Some(item)
    }

    async fn pending_domains(&self) -> Vec<Domain> {
        self.inner.lock().pending.keys().cloned().collect()
    }

    async fn items(&self) -> Vec<QueueItem> {
        self.inner.lock().items.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::QueryRequest;

    fn item(sql: &str, priority: i32) -> QueueItem {
        let request = QueryRequest::interactive(sql, vec![], "default").with_priority(priority);
        QueueItem::new(request, Duration::from_secs(30), Utc::now())
    }

    #[tokio::test]
    async fn test_try_acquire_deduplicates() {
        let store = MemoryQueueStore::default();
        assert!(store.try_acquire(item("SELECT 1", 0)).await);
        assert!(!store.try_acquire(item("SELECT 1", 5)).await);
        assert!(store.try_acquire(item("SELECT 2", 0)).await);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_claim_order_is_priority_then_fifo() {
        let store = MemoryQueueStore::default();
        store.try_acquire(item("low", 0)).await;
        store.try_acquire(item("high", 10)).await;
        store.try_acquire(item("low2", 0)).await;

        let now = Utc::now();
        let mut order = Vec::new();
        while let Some(claimed) = store
            .claim_next("default", QueryKind::Interactive, 10, "w", now)
            .await
        {
            order.push(claimed.request.sql);
        }
        assert_eq!(order, vec!["high", "low", "low2"]);
    }

    #[tokio::test]
    async fn test_claim_respects_cap_per_kind() {
        let store = MemoryQueueStore::default();
        for sql in ["a", "b", "c"] {
            store.try_acquire(item(sql, 0)).await;
        }
        let now = Utc::now();
        let kind = QueryKind::Interactive;

        assert!(store.claim_next("default", kind, 2, "w", now).await.is_some());
        assert!(store.claim_next("default", kind, 2, "w", now).await.is_some());
        assert!(store.claim_next("default", kind, 2, "w", now).await.is_none());
        assert_eq!(store.active_count("default", kind), 2);

        // Build work has its own cap
        assert!(store
            .claim_next("default", QueryKind::PreAggregationBuild, 1, "w", now)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_backoff_delays_claim() {
        let store = MemoryQueueStore::default();
        let first = item("a", 0);
        let fp = first.fingerprint().clone();
        store.try_acquire(first).await;

        let now = Utc::now();
        store
            .claim_next("default", QueryKind::Interactive, 1, "w", now)
            .await
            .unwrap();
        let later = now + chrono::Duration::seconds(5);
        assert!(store.requeue(&fp, 1, 0, later).await);

        assert!(store
            .claim_next("default", QueryKind::Interactive, 1, "w", now)
            .await
            .is_none());
        let claimed = store
            .claim_next("default", QueryKind::Interactive, 1, "w", later)
            .await
            .unwrap();
        assert_eq!(claimed.attempts, 1);
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let store = MemoryQueueStore::default();
        let first = item("a", 0);
        let fp = first.fingerprint().clone();
        store.try_acquire(first).await;

        let now = Utc::now();
        store
            .claim_next("default", QueryKind::Interactive, 1, "dead-worker", now)
            .await
            .unwrap();
        let past = now - chrono::Duration::seconds(1);
        assert_eq!(
            store.renew_lease(&fp, "dead-worker", past).await,
            LeaseStatus::Held
        );
        assert_eq!(
            store.renew_lease(&fp, "someone-else", now).await,
            LeaseStatus::Lost
        );

        assert_eq!(store.list_expired_leases(now).await, vec![fp.clone()]);
        let reclaimed = store.reclaim_expired(&fp, now).await.unwrap();
        assert_eq!(reclaimed.state, ItemState::Pending);
        assert_eq!(reclaimed.attempts, 1);
        assert_eq!(store.active_count("default", QueryKind::Interactive), 0);
        assert!(store.list_expired_leases(now).await.is_empty());
    }

    #[tokio::test]
    async fn test_complete_publishes_outcome_and_frees_fingerprint() {
        let store = MemoryQueueStore::default();
        let first = item("a", 0);
        let fp = first.fingerprint().clone();
        store.try_acquire(first).await;
        store
            .claim_next("default", QueryKind::Interactive, 1, "w", Utc::now())
            .await
            .unwrap();

        store
            .complete(&fp, Ok(std::sync::Arc::new(Default::default())))
            .await;
        assert!(store.get(&fp).await.is_none());
        assert!(store.outcome(&fp).await.unwrap().is_ok());
        assert_eq!(store.active_count("default", QueryKind::Interactive), 0);

        // A new item for the same fingerprint may now be admitted
        assert!(store.try_acquire(item("a", 0)).await);
        assert!(store.outcome(&fp).await.is_none());
    }

    #[tokio::test]
    async fn test_remove_pending_ignores_active() {
        let store = MemoryQueueStore::default();
        let first = item("a", 0);
        let fp = first.fingerprint().clone();
        store.try_acquire(first).await;
        store.request_cancel(&fp).await;

        store
            .claim_next("default", QueryKind::Interactive, 1, "w", Utc::now())
            .await
            .unwrap();
        assert!(store.remove_pending(&fp).await.is_none());
        assert_eq!(
            store.renew_lease(&fp, "w", Utc::now()).await,
            LeaseStatus::CancelRequested
        );
    }
}
