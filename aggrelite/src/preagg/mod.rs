// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Pre-aggregations: definitions, partitions and the build scheduler

pub mod definition;
pub mod partition;
pub mod scheduler;
#[cfg(feature = "sled-backend")]
pub mod sled_store;
pub mod store;

pub use definition::{
    dependency_levels, render_sql, BuildRange, Granularity, PreAggregationDefinition, TimeRange,
};
pub use partition::{partition_ranges, BuildState, Partition};
pub use scheduler::{PartitionRegistry, PreAggregationScheduler, TickReport};
#[cfg(feature = "sled-backend")]
pub use sled_store::SledPartitionStore;
pub use store::{MemoryPartitionStore, PartitionStore};
