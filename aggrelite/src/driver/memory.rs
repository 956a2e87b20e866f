// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! In-memory driver implementation for testing and embedding
//!
//! Keeps tables in a process-local catalog and answers every other query
//! through a programmable async handler. Understands the DDL the scheduler
//! emits: `CREATE TABLE .. AS ..`, `DROP TABLE IF EXISTS ..`, atomic
//! `BEGIN; ALTER TABLE .. RENAME TO ..; COMMIT` batches, table listing, and
//! `SELECT * FROM <table>` reads.

use super::{schema_of, ConnectionHandle, Driver};
use crate::cancel::CancellationToken;
use crate::error::DriverError;
use crate::value::{Column, QueryOutput, Value};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

const IDENT: &str = r#"((?:"[^"]+"|\w+)(?:\.(?:"[^"]+"|\w+))?)"#;

static CREATE_AS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?is)^CREATE\s+TABLE\s+{}\s+AS\s+(.+)$", IDENT))
        .expect("valid CREATE TABLE pattern")
});
static DROP_TABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)^DROP\s+TABLE\s+IF\s+EXISTS\s+{}$", IDENT))
        .expect("valid DROP TABLE pattern")
});
static RENAME_TABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)^ALTER\s+TABLE\s+{}\s+RENAME\s+TO\s+{}$",
        IDENT, IDENT
    ))
    .expect("valid ALTER TABLE pattern")
});
static SELECT_TABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)^SELECT\s+\*\s+FROM\s+{}$", IDENT))
        .expect("valid SELECT pattern")
});
static LIST_TABLES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^SELECT\s+table_name\s+FROM\s+information_schema\.tables")
        .expect("valid table listing pattern")
});

/// Future returned by a query handler
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<QueryOutput, DriverError>> + Send>>;

/// Answers queries that are not table DDL or plain table reads
pub type QueryHandler = Arc<dyn Fn(String, Vec<Value>) -> HandlerFuture + Send + Sync>;

struct PooledConnection {
    _permit: OwnedSemaphorePermit,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct DriverCounters {
    executions: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    cancel_calls: AtomicUsize,
    discarded: AtomicUsize,
}

/// Decrements the in-flight counter however execution ends
struct InFlightGuard<'a> {
    counters: &'a DriverCounters,
}

impl<'a> InFlightGuard<'a> {
    fn enter(counters: &'a DriverCounters) -> Self {
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self { counters }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory driver
pub struct MemoryDriver {
    pool: Arc<Semaphore>,
    pool_size: usize,
    connections: Mutex<HashMap<Uuid, PooledConnection>>,
    tables: RwLock<HashMap<String, QueryOutput>>,
    handler: RwLock<Option<QueryHandler>>,
    supports_cancel: bool,
    read_only: bool,
    available: AtomicBool,
    counters: DriverCounters,
    statements: Mutex<Vec<String>>,
}

impl MemoryDriver {
    /// Create a driver with an 8-connection pool and cancel support
    pub fn new() -> Self {
        Self::with_pool_size(8)
    }

    pub fn with_pool_size(pool_size: usize) -> Self {
        Self {
            pool: Arc::new(Semaphore::new(pool_size)),
            pool_size,
            connections: Mutex::new(HashMap::new()),
            tables: RwLock::new(HashMap::new()),
            handler: RwLock::new(None),
            supports_cancel: true,
            read_only: false,
            available: AtomicBool::new(true),
            counters: DriverCounters::default(),
            statements: Mutex::new(Vec::new()),
        }
    }

    /// Toggle cooperative cancel; without it the queue has to force-cancel
    pub fn with_cancel_support(mut self, supported: bool) -> Self {
        self.supports_cancel = supported;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Install the handler for non-DDL queries
    pub fn set_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(String, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<QueryOutput, DriverError>> + Send + 'static,
    {
        let handler: QueryHandler =
            Arc::new(move |sql: String, params: Vec<Value>| -> HandlerFuture {
                Box::pin(handler(sql, params))
            });
        *self.handler.write() = Some(handler);
    }

    /// Simulate an outage: `acquire` and `test_connection` fail transiently
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn insert_table(&self, name: &str, output: QueryOutput) {
        self.tables.write().insert(normalize(name), output);
    }

    pub fn table(&self, name: &str) -> Option<QueryOutput> {
        self.tables.read().get(&normalize(name)).cloned()
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.read().contains_key(&normalize(name))
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Total `execute` calls
    pub fn execution_count(&self) -> usize {
        self.counters.executions.load(Ordering::SeqCst)
    }

    /// `execute` calls whose SQL contains `fragment`
    pub fn executions_matching(&self, fragment: &str) -> usize {
        self.statements
            .lock()
            .iter()
            .filter(|sql| sql.contains(fragment))
            .count()
    }

    pub fn executed_statements(&self) -> Vec<String> {
        self.statements.lock().clone()
    }

    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.counters.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn cancel_calls(&self) -> usize {
        self.counters.cancel_calls.load(Ordering::SeqCst)
    }

    pub fn discarded_connections(&self) -> usize {
        self.counters.discarded.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.connections.lock().len()
    }

    fn check_writable(&self) -> Result<(), DriverError> {
        if self.read_only {
            return Err(DriverError::fatal("Driver is read-only"));
        }
        Ok(())
    }

    async fn run(&self, sql: String, params: Vec<Value>) -> Result<QueryOutput, DriverError> {
        let sql = sql.trim();

        if sql.get(..5).is_some_and(|head| head.eq_ignore_ascii_case("BEGIN")) {
            let statements: Vec<&str> = sql
                .split(';')
                .map(str::trim)
                .filter(|s| {
                    !s.is_empty() && !s.eq_ignore_ascii_case("BEGIN") && !s.eq_ignore_ascii_case("COMMIT")
                })
                .collect();
            self.apply_renames(&statements)?;
            return Ok(QueryOutput::empty());
        }

        if let Some(caps) = RENAME_TABLE.captures(sql) {
            let statement = caps.get(0).map(|m| m.as_str()).unwrap_or(sql);
            self.apply_renames(&[statement])?;
            return Ok(QueryOutput::empty());
        }

        if let Some(caps) = CREATE_AS.captures(sql) {
            self.check_writable()?;
            let table = normalize(&caps[1]);
            let select = caps[2].to_string();
            if self.tables.read().contains_key(&table) {
                return Err(DriverError::fatal(format!("relation {} already exists", table)));
            }
            // Populate fully before the table becomes visible
            let output = self.select(select, params).await?;
            let mut tables = self.tables.write();
            if tables.contains_key(&table) {
                return Err(DriverError::fatal(format!("relation {} already exists", table)));
            }
            tables.insert(table, output);
            return Ok(QueryOutput::empty());
        }

        if let Some(caps) = DROP_TABLE.captures(sql) {
            self.check_writable()?;
            self.tables.write().remove(&normalize(&caps[1]));
            return Ok(QueryOutput::empty());
        }

        if LIST_TABLES.is_match(sql) {
            let schema = params
                .first()
                .and_then(Value::as_string)
                .map(str::to_string)
                .unwrap_or_default();
            let mut rows: Vec<Vec<Value>> = self
                .tables
                .read()
                .keys()
                .filter(|name| schema_of(name) == Some(schema.as_str()))
                .map(|name| vec![Value::from(super::unqualified(name))])
                .collect();
            rows.sort_by(|a, b| a[0].to_string().cmp(&b[0].to_string()));
            return Ok(QueryOutput::new(vec![Column::new("table_name", "text")], rows));
        }

        self.select(sql.to_string(), params).await
    }

    async fn select(&self, sql: String, params: Vec<Value>) -> Result<QueryOutput, DriverError> {
        let handler = self.handler.read().clone();

        if let Some(caps) = SELECT_TABLE.captures(sql.trim()) {
            let table = normalize(&caps[1]);
            if let Some(found) = self.tables.read().get(&table) {
                return Ok(found.clone());
            }
            if handler.is_none() {
                return Err(DriverError::fatal(format!(
                    "relation {} does not exist",
                    table
                )));
            }
        }

        match handler {
            Some(handler) => handler(sql, params).await,
            None => Err(DriverError::fatal(format!("No handler for query: {}", sql))),
        }
    }

    /// Apply a batch of renames all-or-nothing
    fn apply_renames(&self, statements: &[&str]) -> Result<(), DriverError> {
        self.check_writable()?;
        let mut tables = self.tables.write();
        let mut staged = tables.clone();

        for statement in statements {
            let caps = RENAME_TABLE.captures(statement).ok_or_else(|| {
                DriverError::fatal(format!("Unsupported statement in batch: {}", statement))
            })?;
            let from = normalize(&caps[1]);
            let to_name = normalize(&caps[2]);
            let to = match schema_of(&from) {
                Some(schema) => format!("{}.{}", schema, to_name),
                None => to_name,
            };

            let table = staged
                .remove(&from)
                .ok_or_else(|| DriverError::fatal(format!("relation {} does not exist", from)))?;
            if staged.contains_key(&to) {
                return Err(DriverError::fatal(format!("relation {} already exists", to)));
            }
            staged.insert(to, table);
        }

        *tables = staged;
        Ok(())
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(identifier: &str) -> String {
    identifier.replace('"', "")
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn acquire(&self, timeout: Duration) -> Result<ConnectionHandle, DriverError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(DriverError::transient("Connection refused"));
        }

        let permit = match tokio::time::timeout(timeout, self.pool.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(DriverError::fatal("Connection pool closed")),
            Err(_) => {
                return Err(DriverError::transient(format!(
                    "Timed out after {:?} acquiring connection (pool size {})",
                    timeout, self.pool_size
                )))
            }
        };

        let handle = ConnectionHandle::new();
        self.connections.lock().insert(
            handle.id(),
            PooledConnection {
                _permit: permit,
                cancel: CancellationToken::new(),
            },
        );
        Ok(handle)
    }

    async fn release(&self, connection: ConnectionHandle, discard: bool) {
        if discard {
            self.counters.discarded.fetch_add(1, Ordering::SeqCst);
            log::debug!("Discarding connection {}", connection);
        }
        // Dropping the permit frees the pool slot either way
        self.connections.lock().remove(&connection.id());
    }

    async fn test_connection(&self) -> Result<(), DriverError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DriverError::transient("Connection refused"))
        }
    }

    async fn execute(
        &self,
        connection: &ConnectionHandle,
        sql: &str,
        params: &[Value],
        timeout: Duration,
    ) -> Result<QueryOutput, DriverError> {
        let cancel = self
            .connections
            .lock()
            .get(&connection.id())
            .map(|c| c.cancel.clone())
            .ok_or_else(|| DriverError::fatal(format!("Unknown connection {}", connection)))?;

        let _in_flight = InFlightGuard::enter(&self.counters);
        self.counters.executions.fetch_add(1, Ordering::SeqCst);
        self.statements.lock().push(sql.to_string());

        let work = tokio::time::timeout(timeout, self.run(sql.to_string(), params.to_vec()));
        let timed_out = || DriverError::timeout(format!("Query exceeded {:?}", timeout));

        if self.supports_cancel {
            tokio::select! {
                result = work => result.unwrap_or_else(|_| Err(timed_out())),
                _ = cancel.cancelled() => Err(DriverError::cancelled("Query cancelled by request")),
            }
        } else {
            work.await.unwrap_or_else(|_| Err(timed_out()))
        }
    }

    async fn cancel(&self, connection: &ConnectionHandle) -> Result<(), DriverError> {
        self.counters.cancel_calls.fetch_add(1, Ordering::SeqCst);
        if !self.supports_cancel {
            return Err(DriverError::fatal("Cancel is not supported by this driver"));
        }
        match self.connections.lock().get(&connection.id()) {
            Some(pooled) => {
                pooled.cancel.cancel();
                Ok(())
            }
            None => Err(DriverError::fatal(format!("Unknown connection {}", connection))),
        }
    }

    fn supports_cancel(&self) -> bool {
        self.supports_cancel
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}
