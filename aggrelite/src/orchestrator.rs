// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Query Orchestrator - entry point tying cache, queue and scheduler together
//!
//! A request flows cache → queue → driver → cache: `fetch` answers from the
//! cache store when the entry is fresh, and otherwise routes the query
//! through the queue, whose workers write the result back. The
//! pre-aggregation scheduler feeds build jobs into the same queue.

use crate::cache::{CacheStats, CacheStore, CachedResult, MemoryCacheStore, QueryCache, RefreshKeySpec};
use crate::config::OrchestratorConfig;
use crate::driver::DriverRegistry;
use crate::error::{ConfigError, DriverError, QueryError};
use crate::preagg::{
    MemoryPartitionStore, Partition, PartitionStore, PreAggregationDefinition,
    PreAggregationScheduler, TickReport,
};
use crate::queue::{QueryHandle, QueryOutcome, QueryQueue, QueueStats, QueueStore};
use crate::request::{Fingerprint, QueryRequest};
use chrono::{DateTime, Utc};
use log::{info, warn};
use std::sync::Arc;

/// Assembles a [`QueryOrchestrator`]; every store defaults to in-memory
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    drivers: DriverRegistry,
    definitions: Vec<PreAggregationDefinition>,
    queue_store: Option<Arc<dyn QueueStore>>,
    cache_store: Option<Arc<dyn CacheStore>>,
    partition_store: Option<Arc<dyn PartitionStore>>,
}

impl OrchestratorBuilder {
    pub fn new(config: OrchestratorConfig, drivers: DriverRegistry) -> Self {
        Self {
            config,
            drivers,
            definitions: Vec::new(),
            queue_store: None,
            cache_store: None,
            partition_store: None,
        }
    }

    pub fn with_definitions(mut self, definitions: Vec<PreAggregationDefinition>) -> Self {
        self.definitions = definitions;
        self
    }

    pub fn with_definition(mut self, definition: PreAggregationDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    /// Share queue state with other orchestrators (cross-process dedupe)
    pub fn with_queue_store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.queue_store = Some(store);
        self
    }

    pub fn with_cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache_store = Some(store);
        self
    }

    pub fn with_partition_store(mut self, store: Arc<dyn PartitionStore>) -> Self {
        self.partition_store = Some(store);
        self
    }

    /// Persist partition metadata in a sled database at `path`
    #[cfg(feature = "sled-backend")]
    pub fn with_partition_path(self, path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let store = crate::preagg::SledPartitionStore::open(path)?;
        Ok(self.with_partition_store(Arc::new(store)))
    }

    pub fn build(self) -> Result<QueryOrchestrator, ConfigError> {
        self.config.validate()?;

        let cache_store = self
            .cache_store
            .unwrap_or_else(|| Arc::new(MemoryCacheStore::from_config(&self.config.cache)));

        let mut queue = QueryQueue::new(self.config.queue.clone(), self.drivers)
            .with_cache_store(cache_store.clone());
        if let Some(store) = self.queue_store {
            queue = queue.with_store(store);
        }
        let queue = Arc::new(queue);

        let cache = QueryCache::new(self.config.cache.clone(), cache_store, queue.clone());

        let partition_store = self
            .partition_store
            .unwrap_or_else(|| Arc::new(MemoryPartitionStore::new()));
        let scheduler = Arc::new(PreAggregationScheduler::new(
            self.config.scheduler.clone(),
            self.definitions,
            queue.clone(),
            partition_store,
        )?);

        Ok(QueryOrchestrator {
            config: self.config,
            queue,
            cache,
            scheduler,
        })
    }
}

/// Query Orchestrator - the public entry point
///
/// Construct with [`QueryOrchestrator::builder`], call [`start`] to run the
/// background loops, and [`shutdown`] before dropping.
///
/// [`start`]: QueryOrchestrator::start
/// [`shutdown`]: QueryOrchestrator::shutdown
pub struct QueryOrchestrator {
    config: OrchestratorConfig,
    queue: Arc<QueryQueue>,
    cache: QueryCache,
    scheduler: Arc<PreAggregationScheduler>,
}

impl QueryOrchestrator {
    pub fn builder(config: OrchestratorConfig, drivers: DriverRegistry) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config, drivers)
    }

    /// Orchestrator with in-memory stores and no pre-aggregations
    pub fn new(config: OrchestratorConfig, drivers: DriverRegistry) -> Result<Self, ConfigError> {
        Self::builder(config, drivers).build()
    }

    /// Answer `request` through the cache.
    ///
    /// `refresh_key` decides staleness together with the entry's TTL; see
    /// [`QueryCache::fetch`].
    pub async fn fetch(
        &self,
        request: QueryRequest,
        refresh_key: Option<&RefreshKeySpec>,
    ) -> Result<CachedResult, QueryError> {
        self.cache.fetch(request, refresh_key).await
    }

    /// Run `request` through the queue, skipping the cache
    pub async fn execute(&self, request: QueryRequest) -> QueryOutcome {
        self.queue.execute(request).await
    }

    pub async fn enqueue(&self, request: QueryRequest) -> Result<QueryHandle, QueryError> {
        self.queue.enqueue(request).await
    }

    pub async fn cancel(&self, fingerprint: &Fingerprint) -> bool {
        self.queue.cancel(fingerprint).await
    }

    /// Table to read for `definition` at instant `at`, once built
    pub fn active_table(&self, definition: &str, at: DateTime<Utc>) -> Option<String> {
        self.scheduler.active_table(definition, at)
    }

    pub fn partitions(&self) -> Vec<Partition> {
        self.scheduler.partitions()
    }

    /// Run one scheduler pass now, independent of the timer
    pub async fn run_scheduler_tick(&self) -> TickReport {
        self.scheduler.tick().await
    }

    /// Check every configured data source; failures are reported, not fatal
    pub async fn test_connections(&self) -> Vec<(String, Result<(), DriverError>)> {
        let mut sources: Vec<String> = self
            .queue
            .drivers()
            .data_sources()
            .map(str::to_string)
            .collect();
        sources.sort();

        let mut results = Vec::with_capacity(sources.len());
        for source in sources {
            let result = match self.queue.drivers().get(&source) {
                Ok(driver) => driver.test_connection().await,
                Err(e) => Err(DriverError::fatal(e.to_string())),
            };
            if let Err(e) = &result {
                warn!("Connection test for '{}' failed: {}", source, e);
            }
            results.push((source, result));
        }
        results
    }

    /// Spawn the queue sweep loop and, if enabled, the scheduler loop
    pub fn start(&self) {
        self.queue.start();
        if self.config.scheduler.enabled {
            self.scheduler.start();
        }
        info!("Query orchestrator started");
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        self.queue.shutdown();
        info!("Query orchestrator stopped");
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<QueryQueue> {
        &self.queue
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn scheduler(&self) -> &Arc<PreAggregationScheduler> {
        &self.scheduler
    }

    pub async fn queue_stats(&self) -> QueueStats {
        self.queue.stats().await
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStatus;
    use crate::driver::MemoryDriver;
    use crate::value::{Column, QueryOutput, Value};

    fn orchestrator(driver: Arc<MemoryDriver>) -> QueryOrchestrator {
        QueryOrchestrator::new(
            OrchestratorConfig::default(),
            DriverRegistry::new().with_driver("default", driver),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_fetch_caches_results() {
        let driver = Arc::new(MemoryDriver::new());
        driver.set_handler(|_, _| async {
            Ok(QueryOutput::new(
                vec![Column::new("n", "integer")],
                vec![vec![Value::Integer(3)]],
            ))
        });
        let orchestrator = orchestrator(driver.clone());
        let request = QueryRequest::interactive("SELECT count(*) FROM orders", vec![], "default");

        let first = orchestrator.fetch(request.clone(), None).await.unwrap();
        assert_eq!(first.status, CacheStatus::Miss);
        let second = orchestrator.fetch(request, None).await.unwrap();
        assert_eq!(second.status, CacheStatus::Hit);
        assert_eq!(second.output.first_value(), Some(&Value::Integer(3)));
        assert_eq!(driver.execution_count(), 1);
        assert_eq!(orchestrator.cache_stats().hits, 1);
    }

    #[tokio::test]
    async fn test_connection_report() {
        let healthy = Arc::new(MemoryDriver::new());
        let down = Arc::new(MemoryDriver::new());
        down.set_available(false);
        let orchestrator = QueryOrchestrator::new(
            OrchestratorConfig::default(),
            DriverRegistry::new()
                .with_driver("analytics", healthy)
                .with_driver("warehouse", down),
        )
        .unwrap();

        let report = orchestrator.test_connections().await;
        assert_eq!(report.len(), 2);
        assert_eq!(report[0].0, "analytics");
        assert!(report[0].1.is_ok());
        assert!(report[1].1.is_err());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = OrchestratorConfig::default();
        config.queue.max_attempts = 0;
        let result = QueryOrchestrator::new(config, DriverRegistry::new());
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
