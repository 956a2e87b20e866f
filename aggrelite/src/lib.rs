// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Aggrelite - query orchestration and pre-aggregation engine for SQL backends
//!
//! Aggrelite sits between an analytics API and its SQL databases. It runs
//! every query through one pipeline: results are cached by fingerprint and
//! invalidated by cheap refresh keys, executions are deduplicated and
//! admitted per data source by a lease-based queue, and summary tables are
//! materialized in time partitions and swapped in atomically.
//!
//! # Features
//!
//! - **Execution contract**: one [`Driver`] trait per database backend, with
//!   optional cooperative cancel and overridable DDL generation
//! - **Result cache**: LRU with entry and byte ceilings, TTL plus refresh
//!   keys, foreground or stale-while-revalidate renewal
//! - **Query queue**: fingerprint dedupe, priority with FIFO tie-break,
//!   separate interactive and build caps, retries with backoff, leases
//! - **Pre-aggregations**: hour to year partitions in any IANA timezone,
//!   dependency ordering, staging/active swaps, retention and cleanup
//!
//! # Usage
//!
//! ```no_run
//! use aggrelite::{DriverRegistry, MemoryDriver, OrchestratorConfig, QueryOrchestrator, QueryRequest};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let drivers = DriverRegistry::new().with_driver("default", Arc::new(MemoryDriver::new()));
//! let orchestrator = QueryOrchestrator::new(OrchestratorConfig::default(), drivers)?;
//! orchestrator.start();
//!
//! let request = QueryRequest::interactive("SELECT count(*) FROM orders", vec![], "default");
//! let result = orchestrator.fetch(request, None).await?;
//! println!("{} rows ({:?})", result.output.rows.len(), result.status);
//!
//! orchestrator.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod cancel;
pub mod clock;
pub mod config;
pub mod driver;
pub mod error;
pub mod orchestrator;
pub mod preagg;
pub mod queue;
pub mod request;
pub mod value;

pub use cache::{CacheEntry, CacheStatus, CacheStore, CachedResult, MemoryCacheStore, RefreshKeySpec};
pub use config::{CacheConfig, OrchestratorConfig, QueueConfig, RenewalPolicy, SchedulerConfig};
pub use driver::{ConnectionHandle, Driver, DriverRegistry, MemoryDriver};
pub use error::{ConfigError, DriverError, ErrorKind, QueryError, StoreError};
pub use orchestrator::{OrchestratorBuilder, QueryOrchestrator};
pub use preagg::{
    BuildState, Granularity, MemoryPartitionStore, Partition, PartitionStore,
    PreAggregationDefinition, TickReport,
};
#[cfg(feature = "sled-backend")]
pub use preagg::SledPartitionStore;
pub use queue::{MemoryQueueStore, QueryHandle, QueryQueue, QueueStore};
pub use request::{Fingerprint, QueryKind, QueryRequest};
pub use value::{Column, QueryOutput, Value};

/// Aggrelite version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Aggrelite crate name
pub const CRATE_NAME: &str = env!("CARGO_PKG_NAME");
