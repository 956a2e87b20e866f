// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Pre-aggregation scheduler
//!
//! Each tick walks the definitions in dependency order, materializes the
//! partitions of the build window, and rebuilds the ones whose refresh key
//! moved since their last build. Builds go through the query queue like any
//! other work:
//!
//! 1. `CREATE TABLE <staging> AS <build sql>` (build kind, detached)
//! 2. on success, one atomic batch renames the active table to a retired
//!    name and the staging table to the active name
//! 3. the retired table is dropped
//!
//! Readers therefore only ever see a complete generation. A failure marks
//! the partition `Failed` and leaves its staging table for garbage
//! collection; nothing else in the tick is affected.

use super::definition::{PreAggregationDefinition, TimeRange};
use super::partition::{
    parse_generated_table, partition_ranges, retired_table_name, staging_table_name,
    BuildState, GeneratedTable, Partition,
};
use super::store::PartitionStore;
use super::dependency_levels;
use crate::cache::RefreshKeys;
use crate::clock;
use crate::config::SchedulerConfig;
use crate::driver::Driver;
use crate::error::{ConfigError, QueryError};
use crate::queue::{BuildListener, QueryQueue};
use crate::request::{PartitionRef, QueryKind, QueryRequest};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tokio::task::{JoinHandle, JoinSet};

/// Partition working set, written through to a [`PartitionStore`]
pub struct PartitionRegistry {
    partitions: RwLock<BTreeMap<String, Partition>>,
    store: Arc<dyn PartitionStore>,
}

impl PartitionRegistry {
    /// Load every persisted partition from `store`
    pub fn load(store: Arc<dyn PartitionStore>) -> Result<Self, ConfigError> {
        let partitions = store
            .load_all()?
            .into_iter()
            .map(|partition| (partition.id.clone(), partition))
            .collect();
        Ok(Self {
            partitions: RwLock::new(partitions),
            store,
        })
    }

    pub fn get(&self, id: &str) -> Option<Partition> {
        self.partitions.read().get(id).cloned()
    }

    pub fn all(&self) -> Vec<Partition> {
        self.partitions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.partitions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.read().is_empty()
    }

    /// Existing partition with this id, or `partition` registered as new
    fn get_or_insert(&self, partition: Partition) -> Partition {
        let mut partitions = self.partitions.write();
        if let Some(existing) = partitions.get(&partition.id) {
            return existing.clone();
        }
        partitions.insert(partition.id.clone(), partition.clone());
        drop(partitions);
        self.persist(&partition);
        partition
    }

    /// Apply `change` and persist the result
    fn update<F>(&self, id: &str, change: F) -> Option<Partition>
    where
        F: FnOnce(&mut Partition),
    {
        let updated = {
            let mut partitions = self.partitions.write();
            let partition = partitions.get_mut(id)?;
            change(partition);
            partition.clone()
        };
        self.persist(&updated);
        Some(updated)
    }

    fn remove(&self, id: &str) {
        self.partitions.write().remove(id);
        if let Err(e) = self.store.remove(id) {
            warn!("Failed to remove partition {} from the store: {}", id, e);
        }
    }

    fn persist(&self, partition: &Partition) {
        if let Err(e) = self.store.save(partition) {
            warn!("Failed to persist partition {}: {}", partition.id, e);
        }
    }
}

impl BuildListener for PartitionRegistry {
    fn on_build_staged(&self, partition: &PartitionRef) {
        let staged = self.update(&partition.partition_id, |p| p.staged = true);
        if staged.is_some() {
            debug!("Staging table ready for {}", partition.partition_id);
        }
    }
}

/// What one scheduler tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Build jobs submitted
    pub scheduled: usize,
    pub built: usize,
    pub failed: usize,
    /// Partitions already fresh or outside their update window
    pub skipped: usize,
    /// Partitions dropped for falling out of retention
    pub dropped: usize,
    /// Orphaned staging and retired tables removed
    pub gc_dropped: usize,
}

/// One partition rebuild
struct BuildJob {
    partition_id: String,
    definition: usize,
    range: Option<TimeRange>,
    refresh_key_value: String,
}

pub struct PreAggregationScheduler {
    config: SchedulerConfig,
    tz: Tz,
    queue: Arc<QueryQueue>,
    refresh_keys: RefreshKeys,
    definitions: Vec<PreAggregationDefinition>,
    levels: Vec<Vec<usize>>,
    registry: Arc<PartitionRegistry>,
    tick_lock: tokio::sync::Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PreAggregationScheduler {
    /// Validate `definitions`, load partition metadata and register for build
    /// notifications on `queue`
    pub fn new(
        config: SchedulerConfig,
        definitions: Vec<PreAggregationDefinition>,
        queue: Arc<QueryQueue>,
        store: Arc<dyn PartitionStore>,
    ) -> Result<Self, ConfigError> {
        let tz = config.timezone()?;
        let levels = dependency_levels(&definitions)?;
        for definition in &definitions {
            queue.drivers().get(&definition.data_source)?;
            if let Some(range) = &definition.build_range {
                if range.history > config.retention {
                    return Err(ConfigError::Invalid(format!(
                        "Pre-aggregation '{}' builds further back than the retention window",
                        definition.name
                    )));
                }
            }
        }

        let registry = Arc::new(PartitionRegistry::load(store)?);
        queue.set_build_listener(registry.clone());
        info!(
            "Pre-aggregation scheduler ready: {} definitions in {} levels, {} known partitions",
            definitions.len(),
            levels.len(),
            registry.len()
        );

        Ok(Self {
            config,
            tz,
            refresh_keys: RefreshKeys::new(queue.clone()),
            queue,
            definitions,
            levels,
            registry,
            tick_lock: tokio::sync::Mutex::new(()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn definitions(&self) -> &[PreAggregationDefinition] {
        &self.definitions
    }

    pub fn registry(&self) -> &Arc<PartitionRegistry> {
        &self.registry
    }

    pub fn partitions(&self) -> Vec<Partition> {
        self.registry.all()
    }

    pub fn partition(&self, id: &str) -> Option<Partition> {
        self.registry.get(id)
    }

    /// Active table of the partition of `definition` covering `at`.
    ///
    /// `None` until that partition has been built at least once.
    pub fn active_table(&self, definition: &str, at: DateTime<Utc>) -> Option<String> {
        self.registry
            .partitions
            .read()
            .values()
            .find(|p| p.definition == definition && p.covers(at) && p.has_active_table())
            .map(|p| p.table_name_active.clone())
    }

    pub async fn tick(self: &Arc<Self>) -> TickReport {
        self.tick_at(Utc::now()).await
    }

    /// Run one scheduling pass as of `now`.
    ///
    /// Concurrent calls are serialized.
    pub async fn tick_at(self: &Arc<Self>, now: DateTime<Utc>) -> TickReport {
        let _running = self.tick_lock.lock().await;
        let mut report = TickReport::default();

        for level in &self.levels {
            let mut jobs = Vec::new();
            for &index in level {
                jobs.extend(self.plan(index, now, &mut report).await);
            }
            if jobs.is_empty() {
                continue;
            }

            report.scheduled += jobs.len();
            let mut running = JoinSet::new();
            for job in jobs {
                let scheduler = Arc::clone(self);
                running.spawn(async move { scheduler.build(job, now).await });
            }
            while let Some(joined) = running.join_next().await {
                match joined {
                    Ok(true) => report.built += 1,
                    Ok(false) => report.failed += 1,
                    Err(e) => {
                        error!("Build task panicked: {}", e);
                        report.failed += 1;
                    }
                }
            }
        }

        report.dropped = self.apply_retention(now).await;
        report.gc_dropped = self.collect_garbage(now).await;

        info!(
            "Scheduler tick: {} scheduled, {} built, {} failed, {} fresh, {} expired, {} collected",
            report.scheduled,
            report.built,
            report.failed,
            report.skipped,
            report.dropped,
            report.gc_dropped
        );
        report
    }

    /// Start the periodic tick loop; a no-op when the scheduler is disabled
    pub fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            info!("Pre-aggregation scheduler disabled");
            return;
        }
        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.config.tick_interval);
            loop {
                ticker.tick().await;
                scheduler.tick().await;
            }
        });
        self.tasks.lock().push(handle);
        info!(
            "Pre-aggregation scheduler started (every {:?})",
            self.config.tick_interval
        );
    }

    pub fn shutdown(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }

    /// Partition ranges of `definition` inside its build window
    fn window(&self, definition: &PreAggregationDefinition, now: DateTime<Utc>) -> Vec<Option<TimeRange>> {
        if definition.partition_granularity == super::Granularity::None {
            return vec![None];
        }
        let (history, future) = definition
            .build_range
            .map(|range| (range.history, range.future))
            .unwrap_or((self.config.history, self.config.future));
        partition_ranges(
            definition.partition_granularity,
            clock::sub(now, history),
            clock::add(now, future),
            self.tz,
        )
        .into_iter()
        .map(Some)
        .collect()
    }

    /// Decide which partitions of one definition need a build
    async fn plan(&self, index: usize, now: DateTime<Utc>, report: &mut TickReport) -> Vec<BuildJob> {
        let definition = &self.definitions[index];
        let mut jobs = Vec::new();

        for range in self.window(definition, now) {
            let partition = self.registry.get_or_insert(Partition::new(
                definition,
                range,
                &self.config.schema,
                self.tz,
            ));

            // Building here means a previous process died mid-build
            let needs_build = matches!(
                partition.build_state,
                BuildState::Unbuilt | BuildState::Building | BuildState::Failed
            );

            if !needs_build {
                if let (Some(window), Some(range)) = (definition.update_window, range) {
                    if range.end < clock::sub(now, window) {
                        report.skipped += 1;
                        continue;
                    }
                }
            }

            let spec = definition.render_refresh_key(range.as_ref());
            let refresh_key_value = match self
                .refresh_keys
                .compute_at(&spec, &definition.data_source, now)
                .await
            {
                Ok(value) => value,
                Err(e) => {
                    warn!("Refresh key of {} failed: {}", partition.id, e);
                    self.mark_failed(&partition.id, &e);
                    report.failed += 1;
                    continue;
                }
            };

            if !needs_build
                && partition.last_built_refresh_key.as_deref() == Some(refresh_key_value.as_str())
            {
                report.skipped += 1;
                continue;
            }

            jobs.push(BuildJob {
                partition_id: partition.id,
                definition: index,
                range,
                refresh_key_value,
            });
        }
        jobs
    }

    /// Build one partition and swap it in; `true` on success
    async fn build(&self, job: BuildJob, now: DateTime<Utc>) -> bool {
        match self.try_build(&job, now).await {
            Ok(active) => {
                info!("Swapped in {} for {}", active, job.partition_id);
                true
            }
            Err(e) => {
                warn!("Build of {} failed: {}", job.partition_id, e);
                self.mark_failed(&job.partition_id, &e);
                false
            }
        }
    }

    async fn try_build(&self, job: &BuildJob, now: DateTime<Utc>) -> Result<String, QueryError> {
        let definition = &self.definitions[job.definition];
        let driver = self
            .queue
            .drivers()
            .get(&definition.data_source)
            .map_err(|e| QueryError::Fatal(e.to_string()))?;
        if driver.is_read_only() {
            return Err(QueryError::Fatal(format!(
                "data source '{}' is read-only",
                definition.data_source
            )));
        }

        let previous = self
            .registry
            .get(&job.partition_id)
            .ok_or_else(|| QueryError::Fatal(format!("unknown partition {}", job.partition_id)))?;
        let active = previous.table_name_active.clone();
        let build_sql = definition.render_build_sql(job.range.as_ref());
        let epoch = now.timestamp();
        let staging = staging_table_name(
            &active,
            crc32fast::hash(build_sql.as_bytes()),
            crc32fast::hash(job.refresh_key_value.as_bytes()),
            epoch,
        );

        // A failed swap within the same second left this exact table behind
        if previous.table_name_staging.as_deref() == Some(staging.as_str()) {
            self.run_ddl(definition, driver.drop_table_sql(&staging)).await?;
        }

        self.registry.update(&job.partition_id, |p| {
            p.build_state = BuildState::Building;
            p.table_name_staging = Some(staging.clone());
            p.staged = false;
        });
        debug!("Building {} into {}", job.partition_id, staging);

        let create = QueryRequest::build(
            driver.create_table_as_sql(&staging, &build_sql),
            definition.data_source.clone(),
            previous.partition_ref(),
        )
        .with_priority(definition.priority);
        self.queue.execute(create).await?;

        let retired = previous
            .has_active_table()
            .then(|| retired_table_name(&active, epoch));
        let swap = driver.swap_tables_sql(&staging, &active, retired.as_deref());
        self.run_ddl(definition, swap).await?;

        let refresh_key_value = job.refresh_key_value.clone();
        self.registry.update(&job.partition_id, |p| {
            p.build_state = BuildState::Built;
            p.last_built_refresh_key = Some(refresh_key_value);
            p.table_name_staging = None;
            p.staged = false;
            p.built_at = Some(now);
            p.last_error = None;
        });

        if let Some(retired) = retired {
            if let Err(e) = self.run_ddl(definition, driver.drop_table_sql(&retired)).await {
                warn!("Failed to drop retired table {}: {}", retired, e);
            }
        }
        Ok(active)
    }

    /// Run table maintenance through the queue under the build cap
    async fn run_ddl(
        &self,
        definition: &PreAggregationDefinition,
        sql: String,
    ) -> Result<(), QueryError> {
        let request = QueryRequest::new(
            sql,
            Vec::new(),
            definition.data_source.clone(),
            QueryKind::PreAggregationBuild,
        )
        .with_priority(definition.priority)
        .detached();
        self.queue.execute(request).await.map(|_| ())
    }

    fn mark_failed(&self, partition_id: &str, error: &QueryError) {
        let message = error.to_string();
        self.registry.update(partition_id, |p| {
            p.build_state = BuildState::Failed;
            p.staged = false;
            p.last_error = Some(message);
        });
    }

    /// Drop partitions whose range ended before `now - retention`
    async fn apply_retention(&self, now: DateTime<Utc>) -> usize {
        let cutoff = clock::sub(now, self.config.retention);
        let expired: Vec<Partition> = self
            .registry
            .all()
            .into_iter()
            .filter(|p| p.range.is_some_and(|range| range.end <= cutoff))
            .collect();

        let mut dropped = 0;
        for partition in expired {
            let Some(definition) = self
                .definitions
                .iter()
                .find(|d| d.name == partition.definition)
            else {
                continue;
            };
            let Ok(driver) = self.queue.drivers().get(&definition.data_source) else {
                continue;
            };

            let mut tables = Vec::new();
            if partition.has_active_table() {
                tables.push(partition.table_name_active.clone());
            }
            tables.extend(partition.table_name_staging.clone());

            let mut clean = true;
            for table in &tables {
                if let Err(e) = self.run_ddl(definition, driver.drop_table_sql(table)).await {
                    warn!("Failed to drop expired table {}: {}", table, e);
                    clean = false;
                }
            }
            if clean {
                info!("Dropped expired partition {}", partition.id);
                self.registry.remove(&partition.id);
                dropped += 1;
            }
        }
        dropped
    }

    /// Drop staging and retired tables nobody references any more
    async fn collect_garbage(&self, now: DateTime<Utc>) -> usize {
        let max_age = i64::try_from(self.config.staging_max_age.as_secs()).unwrap_or(i64::MAX);
        let referenced: HashSet<String> = self
            .registry
            .all()
            .into_iter()
            .filter(|p| p.build_state == BuildState::Building)
            .filter_map(|p| p.table_name_staging)
            .collect();

        let mut sources = BTreeSet::new();
        let mut dropped = 0;
        for definition in &self.definitions {
            if !sources.insert(definition.data_source.as_str()) {
                continue;
            }
            let Ok(driver) = self.queue.drivers().get(&definition.data_source) else {
                continue;
            };
            if driver.is_read_only() {
                continue;
            }

            let tables = match self.list_tables(definition, driver.as_ref()).await {
                Ok(tables) => tables,
                Err(e) => {
                    warn!(
                        "Could not list tables of '{}' for cleanup: {}",
                        definition.data_source, e
                    );
                    continue;
                }
            };

            for name in tables {
                let epoch = match parse_generated_table(&name) {
                    Some(GeneratedTable::Staging { epoch } | GeneratedTable::Retired { epoch }) => epoch,
                    None => continue,
                };
                let table = format!("{}.{}", self.config.schema, name);
                if now.timestamp().saturating_sub(epoch) < max_age || referenced.contains(&table) {
                    continue;
                }
                match self.run_ddl(definition, driver.drop_table_sql(&table)).await {
                    Ok(()) => {
                        info!("Dropped orphaned table {}", table);
                        dropped += 1;
                    }
                    Err(e) => warn!("Failed to drop orphaned table {}: {}", table, e),
                }
            }
        }
        dropped
    }

    async fn list_tables(
        &self,
        definition: &PreAggregationDefinition,
        driver: &dyn Driver,
    ) -> Result<Vec<String>, QueryError> {
        let (sql, params) = driver.list_tables_sql(&self.config.schema);
        let request = QueryRequest::new(
            sql,
            params,
            definition.data_source.clone(),
            QueryKind::PreAggregationBuild,
        )
        .detached();
        let output = self.queue.execute(request).await?;
        Ok(output
            .rows
            .iter()
            .filter_map(|row| row.first())
            .map(ToString::to_string)
            .collect())
    }
}

impl Drop for PreAggregationScheduler {
    fn drop(&mut self) {
        for handle in self.tasks.get_mut().drain(..) {
            handle.abort();
        }
    }
}
