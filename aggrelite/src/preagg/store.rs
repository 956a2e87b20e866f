// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Partition metadata storage
//!
//! The scheduler keeps its working set in memory and writes every state
//! change through a [`PartitionStore`], so a restarted process knows which
//! tables are active and which refresh keys they were built from.

use super::partition::Partition;
use crate::error::StoreError;
use parking_lot::RwLock;
use std::collections::BTreeMap;

pub trait PartitionStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<Partition>, StoreError>;

    fn save(&self, partition: &Partition) -> Result<(), StoreError>;

    fn remove(&self, id: &str) -> Result<(), StoreError>;
}

/// Non-persistent partition store (for testing and single-run processes)
#[derive(Default)]
pub struct MemoryPartitionStore {
    partitions: RwLock<BTreeMap<String, Partition>>,
}

impl MemoryPartitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.partitions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.read().is_empty()
    }
}

impl PartitionStore for MemoryPartitionStore {
    fn load_all(&self) -> Result<Vec<Partition>, StoreError> {
        Ok(self.partitions.read().values().cloned().collect())
    }

    fn save(&self, partition: &Partition) -> Result<(), StoreError> {
        self.partitions
            .write()
            .insert(partition.id.clone(), partition.clone());
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.partitions.write().remove(id);
        Ok(())
    }
}
