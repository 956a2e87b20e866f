// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Sled-backed partition store

use super::partition::Partition;
use super::store::PartitionStore;
use crate::error::StoreError;
use std::path::Path;

const PARTITIONS_TREE: &str = "partitions";

/// Partition metadata persisted in a sled tree, one bincode record per id
pub struct SledPartitionStore {
    tree: sled::Tree,
    _db: sled::Db,
}

impl SledPartitionStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Store in a temporary database removed on drop
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        let tree = db.open_tree(PARTITIONS_TREE)?;
        Ok(Self { tree, _db: db })
    }
}

impl PartitionStore for SledPartitionStore {
    fn load_all(&self) -> Result<Vec<Partition>, StoreError> {
        self.tree
            .iter()
            .map(|entry| {
                let (_, value) = entry?;
                Ok(bincode::deserialize(&value)?)
            })
            .collect()
    }

    fn save(&self, partition: &Partition) -> Result<(), StoreError> {
        let bytes = bincode::serialize(partition)?;
        self.tree.insert(partition.id.as_bytes(), bytes)?;
        self.tree.flush()?;
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.tree.remove(id.as_bytes())?;
        self.tree.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RefreshKeySpec;
    use crate::preagg::definition::{Granularity, PreAggregationDefinition, TimeRange};
    use crate::preagg::partition::BuildState;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;
    use tempfile::TempDir;

    fn built_partition() -> Partition {
        let definition = PreAggregationDefinition::new(
            "orders_daily",
            "SELECT 1",
            Granularity::Day,
            RefreshKeySpec::every(Duration::from_secs(60)),
            "default",
        );
        let range = TimeRange::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
        );
        let mut partition =
            Partition::new(&definition, Some(range), "pre_aggregations", chrono_tz::Tz::UTC);
        partition.build_state = BuildState::Built;
        partition.last_built_refresh_key = Some("42".to_string());
        partition.built_at = Some(Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap());
        partition
    }

    #[test]
    fn test_partitions_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let partition = built_partition();

        {
            let store = SledPartitionStore::open(dir.path()).unwrap();
            store.save(&partition).unwrap();
        }

        let store = SledPartitionStore::open(dir.path()).unwrap();
        assert_eq!(store.load_all().unwrap(), vec![partition.clone()]);

        store.remove(&partition.id).unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_temporary_store() {
        let store = SledPartitionStore::temporary().unwrap();
        store.save(&built_partition()).unwrap();
        assert_eq!(store.load_all().unwrap().len(), 1);
    }
}
