// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Query queue dispatcher
//!
//! Callers enqueue requests and get a [`QueryHandle`]. Items with the same
//! fingerprint share one execution. Workers claim items from the store under
//! the per data source caps, execute them through the driver, and settle the
//! outcome: success is written to the cache store (interactive) or reported
//! to the build listener (pre-aggregation builds); transient failures go
//! back to pending with backoff.

use super::handle::QueryHandle;
use super::item::{ItemState, LeaseStatus, QueryOutcome, QueueItem};
use super::store::{MemoryQueueStore, QueueStore};
use super::{backoff_delay, BuildListener};
use crate::cache::{CacheEntry, CacheStore};
use crate::cancel::CancellationToken;
use crate::clock;
use crate::config::QueueConfig;
use crate::driver::{ConnectionHandle, Driver, DriverRegistry};
use crate::error::{ErrorKind, QueryError};
use crate::request::{Fingerprint, QueryKind, QueryRequest};
use crate::value::QueryOutput;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Local callers waiting on one fingerprint
struct Waiter {
    sender: watch::Sender<Option<QueryOutcome>>,
    detached: bool,
    enqueued_at: DateTime<Utc>,
    /// The item is owned by another queue sharing the store
    remote: bool,
}

/// Bookkeeping for an item this process is executing
struct ActiveExecution {
    driver: Arc<dyn Driver>,
    connection: Option<ConnectionHandle>,
    token: CancellationToken,
    cancel_requested: bool,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    deduplicated: AtomicU64,
    executed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    cancelled: AtomicU64,
    reclaimed: AtomicU64,
    orphaned: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub deduplicated: u64,
    pub executed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub cancelled: u64,
    pub reclaimed: u64,
    pub orphaned: u64,
    pub pending: usize,
    pub active: usize,
}

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reclaimed: usize,
    pub failed: usize,
    pub orphaned: usize,
}

pub struct QueryQueue {
    id: String,
    config: QueueConfig,
    drivers: DriverRegistry,
    store: Arc<dyn QueueStore>,
    cache_store: Option<Arc<dyn CacheStore>>,
    build_listener: RwLock<Option<Arc<dyn BuildListener>>>,
    waiters: Mutex<HashMap<Fingerprint, Waiter>>,
    active: Mutex<HashMap<Fingerprint, ActiveExecution>>,
    counters: Counters,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl QueryQueue {
    /// Queue backed by its own in-memory store
    pub fn new(config: QueueConfig, drivers: DriverRegistry) -> Self {
        let store = Arc::new(MemoryQueueStore::new(config.result_retention));
        Self {
            id: format!("queue-{}", Uuid::new_v4()),
            config,
            drivers,
            store,
            cache_store: None,
            build_listener: RwLock::new(None),
            waiters: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            counters: Counters::default(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Share a store with other queues; fingerprints are deduplicated across all of them
    pub fn with_store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.store = store;
        self
    }

    /// Successful interactive results carrying a cache directive land here
    pub fn with_cache_store(mut self, cache_store: Arc<dyn CacheStore>) -> Self {
        self.cache_store = Some(cache_store);
        self
    }

    pub fn set_build_listener(&self, listener: Arc<dyn BuildListener>) {
        *self.build_listener.write() = Some(listener);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn drivers(&self) -> &DriverRegistry {
        &self.drivers
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    /// Admit a request, or attach to the item already running its fingerprint
    pub async fn enqueue(self: &Arc<Self>, request: QueryRequest) -> Result<QueryHandle, QueryError> {
        self.drivers
            .get(&request.data_source)
            .map_err(|e| QueryError::Fatal(e.to_string()))?;

        let fingerprint = request.fingerprint.clone();
        let now = Utc::now();
        let receiver = {
            let mut waiters = self.waiters.lock();
            if let Some(waiter) = waiters.get_mut(&fingerprint) {
                waiter.detached |= request.detached;
                Counters::bump(&self.counters.deduplicated);
                debug!("Joined in-flight query {}", fingerprint.short());
                return Ok(QueryHandle::new(fingerprint, waiter.sender.subscribe(), true));
            }
            let (sender, receiver) = watch::channel(None);
            waiters.insert(
                fingerprint.clone(),
                Waiter {
                    sender,
                    detached: request.detached,
                    enqueued_at: now,
                    remote: false,
                },
            );
            receiver
        };

        let timeout = request.timeout.unwrap_or(self.config.default_timeout);
        let (kind, priority) = (request.kind, request.priority);
        let data_source = request.data_source.clone();
        let item = QueueItem::new(request, timeout, now);

        if self.store.try_acquire(item).await {
            Counters::bump(&self.counters.enqueued);
            debug!(
                "Enqueued {} query {} on '{}' (priority {})",
                kind,
                fingerprint.short(),
                data_source,
                priority
            );
            self.pump().await;
            Ok(QueryHandle::new(fingerprint, receiver, false))
        } else {
            Counters::bump(&self.counters.deduplicated);
            if let Some(waiter) = self.waiters.lock().get_mut(&fingerprint) {
                waiter.remote = true;
            }
            debug!(
                "Query {} is owned by another queue, waiting for its outcome",
                fingerprint.short()
            );
            self.spawn_remote_watch(fingerprint.clone());
            Ok(QueryHandle::new(fingerprint, receiver, true))
        }
    }

    /// Enqueue and wait
    pub async fn execute(self: &Arc<Self>, request: QueryRequest) -> QueryOutcome {
        self.enqueue(request).await?.wait().await
    }

    /// Cancel by fingerprint.
    ///
    /// A pending item is removed without touching the driver. An active one
    /// gets a cooperative driver cancel, forced after the grace period; a
    /// forced cancel discards the connection.
    pub async fn cancel(&self, fingerprint: &Fingerprint) -> bool {
        if let Some(item) = self.store.remove_pending(fingerprint).await {
            info!(
                "Cancelled pending query {} on '{}'",
                fingerprint.short(),
                item.data_source()
            );
            Counters::bump(&self.counters.cancelled);
            self.finish(
                fingerprint,
                Err(QueryError::Cancelled("cancelled before execution".to_string())),
            )
            .await;
            return true;
        }

        if self.cancel_local(fingerprint).await {
            return true;
        }

        let requested = self.store.request_cancel(fingerprint).await;
        if requested {
            info!(
                "Requested cancel of {} from the worker that owns it",
                fingerprint.short()
            );
        }
        requested
    }

    /// Claim and start every item the caps currently allow
    pub async fn pump(self: &Arc<Self>) {
        for (data_source, kind) in self.store.pending_domains().await {
            let limits = self.config.limits_for(&data_source);
            let cap = match kind {
                QueryKind::Interactive => limits.concurrency,
                QueryKind::PreAggregationBuild => limits.build_concurrency,
            };
            while let Some(item) = self
                .store
                .claim_next(&data_source, kind, cap, &self.id, Utc::now())
                .await
            {
                debug!(
                    "Dispatching {} on '{}' (attempt {})",
                    item.fingerprint().short(),
                    data_source,
                    item.attempts + 1
                );
                self.spawn_worker(item);
            }
        }
    }

    /// Reclaim expired leases and drop orphaned pending items
    pub async fn sweep(self: &Arc<Self>) -> SweepReport {
        let now = Utc::now();
        let mut report = SweepReport::default();

        for fingerprint in self.store.list_expired_leases(now).await {
            // Our own workers renew their leases; leave them alone
            if self.active.lock().contains_key(&fingerprint) {
                continue;
            }
            let Some(item) = self.store.reclaim_expired(&fingerprint, now).await else {
                continue;
            };
            report.reclaimed += 1;
            Counters::bump(&self.counters.reclaimed);
            warn!(
                "Lease on {} expired, returned to pending after {} attempts",
                fingerprint.short(),
                item.attempts
            );

            if item.attempts >= self.config.max_attempts
                && self.store.remove_pending(&fingerprint).await.is_some()
            {
                report.failed += 1;
                Counters::bump(&self.counters.failed);
                self.finish(
                    &fingerprint,
                    Err(QueryError::Fatal(format!(
                        "worker lease expired {} times",
                        item.attempts
                    ))),
                )
                .await;
            }
        }

        let cutoff = clock::sub(now, self.config.orphaned_timeout);
        let orphans: Vec<Fingerprint> = self
            .waiters
            .lock()
            .iter()
            .filter(|(_, waiter)| {
                !waiter.detached
                    && !waiter.remote
                    && waiter.enqueued_at < cutoff
                    && waiter.sender.receiver_count() == 0
            })
            .map(|(fingerprint, _)| fingerprint.clone())
            .collect();

        for fingerprint in orphans {
            if self.store.remove_pending(&fingerprint).await.is_some() {
                report.orphaned += 1;
                Counters::bump(&self.counters.orphaned);
                info!("Dropped orphaned query {}", fingerprint.short());
                self.finish(
                    &fingerprint,
                    Err(QueryError::Cancelled("no callers left waiting".to_string())),
                )
                .await;
            }
        }

        self.pump().await;
        report
    }

    /// Start the background sweep loop
    pub fn start(self: &Arc<Self>) {
        let queue = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(queue.config.lease_sweep_interval);
            loop {
                ticker.tick().await;
                let report = queue.sweep().await;
                if report != SweepReport::default() {
                    debug!("Queue sweep: {:?}", report);
                }
            }
        });
        self.tasks.lock().push(handle);
        info!("Query queue {} started", self.id);
    }

    /// Stop background loops; running workers finish on their own
    pub fn shutdown(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        info!("Query queue {} stopped", self.id);
    }

    pub async fn stats(&self) -> QueueStats {
        let items = self.store.items().await;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        QueueStats {
            enqueued: load(&self.counters.enqueued),
            deduplicated: load(&self.counters.deduplicated),
            executed: load(&self.counters.executed),
            succeeded: load(&self.counters.succeeded),
            failed: load(&self.counters.failed),
            retried: load(&self.counters.retried),
            cancelled: load(&self.counters.cancelled),
            reclaimed: load(&self.counters.reclaimed),
            orphaned: load(&self.counters.orphaned),
            pending: items
                .iter()
                .filter(|item| item.state == ItemState::Pending)
                .count(),
            active: items
                .iter()
                .filter(|item| item.state == ItemState::Active)
                .count(),
        }
    }

    /// Live items, grouped by data source and kind, in dispatch order
    pub async fn snapshot(&self) -> Vec<QueueItem> {
        let mut items = self.store.items().await;
        items.sort_by(|a, b| {
            (a.data_source(), a.kind(), b.priority(), a.sequence).cmp(&(
                b.data_source(),
                b.kind(),
                a.priority(),
                b.sequence,
            ))
        });
        items
    }

    pub async fn item(&self, fingerprint: &Fingerprint) -> Option<QueueItem> {
        self.store.get(fingerprint).await
    }

    fn spawn_worker(self: &Arc<Self>, item: QueueItem) {
        let queue = Arc::clone(self);
        tokio::spawn(async move { queue.run_item(item).await });
    }

    fn spawn_pump(self: &Arc<Self>, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            queue.pump().await;
        });
    }

    fn spawn_heartbeat(self: &Arc<Self>, fingerprint: Fingerprint, lease: Duration) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(queue.config.lease_renew_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let expiry = clock::add(Utc::now(), lease);
                match queue.store.renew_lease(&fingerprint, &queue.id, expiry).await {
                    LeaseStatus::Held => {}
                    LeaseStatus::CancelRequested => {
                        queue.cancel_local(&fingerprint).await;
                    }
                    LeaseStatus::Lost => {
                        warn!("Lost lease on {}", fingerprint.short());
                        break;
                    }
                }
            }
        })
    }

    fn spawn_remote_watch(self: &Arc<Self>, fingerprint: Fingerprint) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(queue.config.result_poll_interval);
            loop {
                ticker.tick().await;
                let abandoned = match queue.waiters.lock().get(&fingerprint) {
                    // Resolved locally, e.g. this queue ended up claiming it
                    None => break,
                    Some(waiter) => !waiter.detached && waiter.sender.receiver_count() == 0,
                };

                if let Some(outcome) = queue.store.outcome(&fingerprint).await {
                    queue.resolve(&fingerprint, outcome);
                    break;
                }
                if abandoned {
                    queue.waiters.lock().remove(&fingerprint);
                    break;
                }
                if queue.store.get(&fingerprint).await.is_none() {
                    let outcome = queue.store.outcome(&fingerprint).await.unwrap_or_else(|| {
                        Err(QueryError::Transient(
                            "query finished elsewhere and its result expired".to_string(),
                        ))
                    });
                    queue.resolve(&fingerprint, outcome);
                    break;
                }
            }
        });
    }

    async fn run_item(self: Arc<Self>, item: QueueItem) {
        let fingerprint = item.fingerprint().clone();
        let driver = match self.drivers.get(item.data_source()) {
            Ok(driver) => driver,
            Err(e) => {
                self.finish(&fingerprint, Err(QueryError::Fatal(e.to_string())))
                    .await;
                self.spawn_pump(Duration::ZERO);
                return;
            }
        };

        let token = CancellationToken::new();
        self.active.lock().insert(
            fingerprint.clone(),
            ActiveExecution {
                driver: driver.clone(),
                connection: None,
                token: token.clone(),
                cancel_requested: false,
            },
        );
        if item.cancel_requested {
            self.cancel_local(&fingerprint).await;
        }

        let heartbeat = self.spawn_heartbeat(fingerprint.clone(), item.timeout);
        let result = self.execute_item(&driver, &item, &token).await;
        heartbeat.abort();

        let cancel_requested = self
            .active
            .lock()
            .remove(&fingerprint)
            .is_some_and(|execution| execution.cancel_requested);
        self.settle(item, result, cancel_requested).await;
        self.spawn_pump(Duration::ZERO);
    }

    async fn execute_item(
        &self,
        driver: &Arc<dyn Driver>,
        item: &QueueItem,
        token: &CancellationToken,
    ) -> Result<QueryOutput, QueryError> {
        let fingerprint = item.fingerprint();
        let connection = tokio::select! {
            biased;
            _ = token.cancelled() => {
                return Err(QueryError::Cancelled(
                    "cancelled while waiting for a connection".to_string(),
                ));
            }
            acquired = driver.acquire(self.config.acquire_timeout) => acquired?,
        };

        if let Some(execution) = self.active.lock().get_mut(fingerprint) {
            execution.connection = Some(connection.clone());
        }
        Counters::bump(&self.counters.executed);
        debug!(
            "Executing {} on {} (attempt {})",
            fingerprint.short(),
            connection,
            item.attempts + 1
        );

        let deadline = item.timeout;
        let request = &item.request;
        let (result, discard) = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("Force-cancelled {}", fingerprint.short());
                (
                    Err(QueryError::Cancelled("forced after cancel grace period".to_string())),
                    true,
                )
            }
            finished = tokio::time::timeout(
                deadline,
                driver.execute(&connection, &request.sql, &request.params, deadline),
            ) => match finished {
                Ok(Ok(output)) => (Ok(output), false),
                Ok(Err(error)) => {
                    let discard = matches!(error.kind, ErrorKind::Transient | ErrorKind::Timeout);
                    (Err(QueryError::from(error)), discard)
                }
                Err(_) => (
                    Err(QueryError::Timeout(format!(
                        "query exceeded its {:?} deadline",
                        deadline
                    ))),
                    true,
                ),
            },
        };

        driver.release(connection, discard).await;
        result
    }

    async fn settle(
        self: &Arc<Self>,
        item: QueueItem,
        result: Result<QueryOutput, QueryError>,
        cancel_requested: bool,
    ) {
        let fingerprint = item.fingerprint().clone();
        let result = if cancel_requested {
            Err(QueryError::Cancelled("cancelled by request".to_string()))
        } else {
            result
        };

        let error = match result {
            Ok(output) => {
                let output = Arc::new(output);
                if let (Some(directive), Some(cache)) = (&item.request.cache, &self.cache_store) {
                    cache
                        .put(CacheEntry::new(
                            fingerprint.clone(),
                            output.clone(),
                            directive.refresh_key_value.clone(),
                            directive.ttl,
                        ))
                        .await;
                }
                if let Some(partition) = &item.request.partition {
                    let listener = self.build_listener.read().clone();
                    if let Some(listener) = listener {
                        listener.on_build_staged(partition);
                    }
                }
                Counters::bump(&self.counters.succeeded);
                self.finish(&fingerprint, Ok(output)).await;
                return;
            }
            Err(error) => error,
        };

        match self.retry_delay(&item, &error) {
            Ok(delay) => {
                let attempts = item.attempts + 1;
                let timeouts = item.timeouts + u32::from(error.kind() == ErrorKind::Timeout);
                warn!(
                    "Query {} failed ({}), retrying in {:?} (attempt {}/{})",
                    fingerprint.short(),
                    error,
                    delay,
                    attempts + 1,
                    self.config.max_attempts
                );
                Counters::bump(&self.counters.retried);
                let available_at = clock::add(Utc::now(), delay);
                if self
                    .store
                    .requeue(&fingerprint, attempts, timeouts, available_at)
                    .await
                {
                    self.spawn_pump(delay);
                } else {
                    warn!(
                        "Query {} was reclaimed before it could be retried",
                        fingerprint.short()
                    );
                }
            }
            Err(final_error) => {
                match final_error {
                    QueryError::Cancelled(_) => {
                        info!("Query {} cancelled", fingerprint.short());
                        Counters::bump(&self.counters.cancelled);
                    }
                    _ => {
                        warn!("Query {} failed: {}", fingerprint.short(), final_error);
                        Counters::bump(&self.counters.failed);
                    }
                }
                self.finish(&fingerprint, Err(final_error)).await;
            }
        }
    }

    /// Backoff before the next attempt, or the error to surface
    fn retry_delay(&self, item: &QueueItem, error: &QueryError) -> Result<Duration, QueryError> {
        let next_attempt = item.attempts + 1;
        let retryable = match error {
            QueryError::Transient(_) => true,
            // A timeout gets one retry; a second one is fatal
            QueryError::Timeout(_) => item.timeouts == 0,
            QueryError::Fatal(_) | QueryError::Cancelled(_) => return Err(error.clone()),
        };

        if retryable && next_attempt < self.config.max_attempts {
            Ok(backoff_delay(
                next_attempt,
                self.config.backoff_base,
                self.config.backoff_max,
            ))
        } else {
            Err(error.clone().into_fatal())
        }
    }

    async fn cancel_local(&self, fingerprint: &Fingerprint) -> bool {
        let (driver, connection, token) = {
            let mut active = self.active.lock();
            let Some(execution) = active.get_mut(fingerprint) else {
                return false;
            };
            if execution.cancel_requested {
                return true;
            }
            execution.cancel_requested = true;
            (
                execution.driver.clone(),
                execution.connection.clone(),
                execution.token.clone(),
            )
        };

        match connection {
            Some(connection) if driver.supports_cancel() => {
                info!(
                    "Cancelling active query {} on {}",
                    fingerprint.short(),
                    connection
                );
                if let Err(e) = driver.cancel(&connection).await {
                    warn!("Driver cancel failed for {}: {}", fingerprint.short(), e);
                    token.cancel();
                    return true;
                }
                let grace = self.config.cancel_grace;
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    token.cancel();
                });
            }
            _ => {
                info!("Force-cancelling query {}", fingerprint.short());
                token.cancel();
            }
        }
        true
    }

    async fn finish(&self, fingerprint: &Fingerprint, outcome: QueryOutcome) {
        debug!(
            "Query {} finished as {:?}",
            fingerprint.short(),
            ItemState::for_outcome(&outcome)
        );
        self.store.complete(fingerprint, outcome.clone()).await;
        self.resolve(fingerprint, outcome);
    }

    fn resolve(&self, fingerprint: &Fingerprint, outcome: QueryOutcome) {
        let waiter = self.waiters.lock().remove(fingerprint);
        if let Some(waiter) = waiter {
            waiter.sender.send_replace(Some(outcome));
        }
    }
}

impl Drop for QueryQueue {
    fn drop(&mut self) {
        for handle in self.tasks.get_mut().drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryDriver;
    use crate::error::DriverError;
    use crate::value::{Column, Value};
    use std::sync::atomic::AtomicUsize;

    fn fast_config() -> QueueConfig {
        QueueConfig {
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_millis(20),
            ..QueueConfig::default()
        }
    }

    fn queue_with(driver: Arc<MemoryDriver>, config: QueueConfig) -> Arc<QueryQueue> {
        let drivers = DriverRegistry::new().with_driver("default", driver);
        Arc::new(QueryQueue::new(config, drivers))
    }

    fn one_row(value: i64) -> QueryOutput {
        QueryOutput::new(
            vec![Column::new("v", "integer")],
            vec![vec![Value::Integer(value)]],
        )
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let driver = Arc::new(MemoryDriver::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        driver.set_handler(move |_, _| {
            let attempt = seen.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(DriverError::transient("connection reset"))
                } else {
                    Ok(one_row(7))
                }
            }
        });
        let queue = queue_with(driver, fast_config());

        let output = queue
            .execute(QueryRequest::interactive("SELECT 7", vec![], "default"))
            .await
            .unwrap();
        assert_eq!(output.first_value(), Some(&Value::Integer(7)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(queue.stats().await.retried, 2);
    }

    #[tokio::test]
    async fn test_transient_escalates_after_max_attempts() {
        let driver = Arc::new(MemoryDriver::new());
        driver.set_handler(|_, _| async { Err(DriverError::transient("deadlock detected")) });
        let queue = queue_with(driver.clone(), fast_config());

        let err = queue
            .execute(QueryRequest::interactive("SELECT 1", vec![], "default"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert!(err.message().contains("deadlock detected"));
        assert_eq!(driver.executions_matching("SELECT 1"), 3);
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let driver = Arc::new(MemoryDriver::new());
        driver.set_handler(|_, _| async { Err(DriverError::fatal("syntax error")) });
        let queue = queue_with(driver.clone(), fast_config());

        let err = queue
            .execute(QueryRequest::interactive("SELEC 1", vec![], "default"))
            .await
            .unwrap_err();
        assert_eq!(err, QueryError::Fatal("syntax error".to_string()));
        assert_eq!(driver.execution_count(), 1);
    }

    #[tokio::test]
    async fn test_second_timeout_is_fatal() {
        let driver = Arc::new(MemoryDriver::new());
        driver.set_handler(|_, _| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(QueryOutput::empty())
        });
        let queue = queue_with(driver.clone(), fast_config());

        let request = QueryRequest::interactive("SELECT slow", vec![], "default")
            .with_timeout(Duration::from_millis(20));
        let err = queue.execute(request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert_eq!(driver.executions_matching("SELECT slow"), 2);
    }

    #[tokio::test]
    async fn test_unknown_data_source_fails_fast() {
        let queue = queue_with(Arc::new(MemoryDriver::new()), fast_config());
        let err = queue
            .enqueue(QueryRequest::interactive("SELECT 1", vec![], "nowhere"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }

    #[tokio::test]
    async fn test_build_success_notifies_listener() {
        struct Recorder(Mutex<Vec<String>>);
        impl BuildListener for Recorder {
            fn on_build_staged(&self, partition: &crate::request::PartitionRef) {
                self.0.lock().push(partition.partition_id.clone());
            }
        }

        let driver = Arc::new(MemoryDriver::new());
        driver.set_handler(|_, _| async { Ok(QueryOutput::empty()) });
        let queue = queue_with(driver, fast_config());
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        queue.set_build_listener(recorder.clone());

        let request = QueryRequest::build(
            "CREATE TABLE \"s\".\"t__stg\" AS SELECT 1",
            "default",
            crate::request::PartitionRef {
                definition: "t".into(),
                partition_id: "t:20240101".into(),
            },
        );
        queue.execute(request).await.unwrap();
        assert_eq!(*recorder.0.lock(), vec!["t:20240101".to_string()]);
    }
}
