//! Test utilities for Aggrelite integration tests
//!
//! - `fixture`: an orchestrator over the in-memory driver with fast timings
//! - helpers for building result sets and polling for asynchronous effects

pub mod fixture;

use aggrelite::{Column, QueryOutput, Value};
use std::future::Future;
use std::time::Duration;

/// Initialise logging once per test binary
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Single-column, single-row result
pub fn one_row(value: i64) -> QueryOutput {
    QueryOutput::new(
        vec![Column::new("v", "integer")],
        vec![vec![Value::Integer(value)]],
    )
}

/// Poll `check` every 10ms until it returns true or `limit` elapses
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Like [`eventually`] for conditions that need no `.await`
pub async fn wait_until<F>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    true
}
