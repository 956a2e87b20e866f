// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Execution contract between the orchestrator and database drivers
//!
//! Every backend implements [`Driver`]. The orchestrator only relies on the
//! operations listed here:
//! - connection pool lifecycle (`acquire`, `release`, `test_connection`)
//! - `execute` with a per-call deadline
//! - optional cooperative `cancel` (see `supports_cancel`)
//! - identifier quoting and the DDL used for pre-aggregation tables
//!
//! Pool sizing, idle eviction and borrow validation are the driver's
//! business; `acquire` must fail fast once its bounded wait elapses.

pub mod memory;

pub use memory::MemoryDriver;

use crate::error::{ConfigError, DriverError};
use crate::value::{QueryOutput, Value};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Opaque handle for one pooled connection
///
/// Cheap to clone so a cancel can be issued while `execute` still borrows it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    id: Uuid,
}

impl ConnectionHandle {
    pub fn new() -> Self {
        Self { id: Uuid::new_v4() }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Default for ConnectionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.id)
    }
}

/// Capability interface implemented once per database backend
#[async_trait]
pub trait Driver: Send + Sync {
    /// Borrow a connection, waiting at most `timeout`
    async fn acquire(&self, timeout: Duration) -> Result<ConnectionHandle, DriverError>;

    /// Return a connection; `discard` destroys it instead of pooling it
    async fn release(&self, connection: ConnectionHandle, discard: bool);

    /// Open a fresh connection and run a trivial query on it
    async fn test_connection(&self) -> Result<(), DriverError>;

    /// Run one statement (or an atomic batch, for table swaps)
    async fn execute(
        &self,
        connection: &ConnectionHandle,
        sql: &str,
        params: &[Value],
        timeout: Duration,
    ) -> Result<QueryOutput, DriverError>;

    /// Ask the backend to interrupt whatever `connection` is running
    async fn cancel(&self, connection: &ConnectionHandle) -> Result<(), DriverError>;

    fn supports_cancel(&self) -> bool;

    fn quote_identifier(&self, name: &str) -> String;

    fn is_read_only(&self) -> bool;

    /// Quote every segment of a possibly schema-qualified name
    fn quote_table_name(&self, table: &str) -> String {
        table
            .split('.')
            .map(|segment| self.quote_identifier(segment))
            .collect::<Vec<_>>()
            .join(".")
    }

    fn create_table_as_sql(&self, table: &str, select_sql: &str) -> String {
        format!(
            "CREATE TABLE {} AS {}",
            self.quote_table_name(table),
            select_sql
        )
    }

    fn drop_table_sql(&self, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {}", self.quote_table_name(table))
    }

    /// Batch that makes `staging` visible under the `active` name.
    ///
    /// Must execute atomically: readers see either the previous active table
    /// or the new one, never neither. The previous table, if any, is renamed
    /// to `retired`.
    fn swap_tables_sql(&self, staging: &str, active: &str, retired: Option<&str>) -> String {
        let mut statements = vec!["BEGIN".to_string()];
        if let Some(retired) = retired {
            statements.push(format!(
                "ALTER TABLE {} RENAME TO {}",
                self.quote_table_name(active),
                self.quote_identifier(unqualified(retired))
            ));
        }
        statements.push(format!(
            "ALTER TABLE {} RENAME TO {}",
            self.quote_table_name(staging),
            self.quote_identifier(unqualified(active))
        ));
        statements.push("COMMIT".to_string());
        statements.join("; ")
    }

    /// Query listing table names in `schema`, one per row, first column
    fn list_tables_sql(&self, schema: &str) -> (String, Vec<Value>) {
        (
            "SELECT table_name FROM information_schema.tables WHERE table_schema = $1".to_string(),
            vec![Value::from(schema)],
        )
    }
}

/// Last segment of a schema-qualified name
pub fn unqualified(table: &str) -> &str {
    table.rsplit('.').next().unwrap_or(table)
}

/// Schema part of a qualified name, if present
pub fn schema_of(table: &str) -> Option<&str> {
    table.rsplit_once('.').map(|(schema, _)| schema)
}

/// Drivers by data source id, fixed at startup
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_driver(mut self, data_source: impl Into<String>, driver: Arc<dyn Driver>) -> Self {
        self.register(data_source, driver);
        self
    }

    pub fn register(&mut self, data_source: impl Into<String>, driver: Arc<dyn Driver>) {
        self.drivers.insert(data_source.into(), driver);
    }

    pub fn get(&self, data_source: &str) -> Result<Arc<dyn Driver>, ConfigError> {
        self.drivers
            .get(data_source)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownDataSource(data_source.to_string()))
    }

    pub fn data_sources(&self) -> impl Iterator<Item = &str> {
        self.drivers.keys().map(String::as_str)
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("data_sources", &self.drivers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_helpers() {
        assert_eq!(unqualified("pre_aggregations.orders_day"), "orders_day");
        assert_eq!(unqualified("orders_day"), "orders_day");
        assert_eq!(schema_of("pre_aggregations.orders_day"), Some("pre_aggregations"));
        assert_eq!(schema_of("orders_day"), None);
    }

    #[test]
    fn test_default_swap_sql() {
        let driver = MemoryDriver::new();
        let sql = driver.swap_tables_sql(
            "s.orders__stg_1_2_3",
            "s.orders",
            Some("s.orders__old_3"),
        );
        assert_eq!(
            sql,
            "BEGIN; ALTER TABLE \"s\".\"orders\" RENAME TO \"orders__old_3\"; \
             ALTER TABLE \"s\".\"orders__stg_1_2_3\" RENAME TO \"orders\"; COMMIT"
        );
    }

    #[test]
    fn test_registry_unknown_data_source() {
        let registry = DriverRegistry::new().with_driver("default", Arc::new(MemoryDriver::new()));
        assert!(registry.get("default").is_ok());
        assert!(matches!(
            registry.get("missing"),
            Err(ConfigError::UnknownDataSource(_))
        ));
    }
}
