// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Refresh keys
//!
//! A refresh key is a cheap probe whose value changes when the underlying
//! data changes. Three forms are supported:
//! - `Sql`: a query whose first cell is the key, run through the queue
//! - `Every`: the current wall-clock bucket of a fixed interval
//! - `Composite`: an ordered list of keys hashed into one value

use crate::error::QueryError;
use crate::queue::QueryQueue;
use crate::request::QueryRequest;
use crate::value::{write_bytes, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Refresh key queries jump ahead of regular interactive work
pub const REFRESH_KEY_PRIORITY: i32 = 1_000;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RefreshKeySpec {
    Sql { sql: String, params: Vec<Value> },
    Every(Duration),
    Composite(Vec<RefreshKeySpec>),
}

impl RefreshKeySpec {
    pub fn sql(sql: impl Into<String>) -> Self {
        RefreshKeySpec::Sql {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn every(interval: Duration) -> Self {
        RefreshKeySpec::Every(interval)
    }

    /// Rewrite every SQL text in this key, leaving the structure intact
    pub fn map_sql<F>(&self, f: &F) -> RefreshKeySpec
    where
        F: Fn(&str) -> String,
    {
        match self {
            RefreshKeySpec::Sql { sql, params } => RefreshKeySpec::Sql {
                sql: f(sql),
                params: params.clone(),
            },
            RefreshKeySpec::Every(interval) => RefreshKeySpec::Every(*interval),
            RefreshKeySpec::Composite(parts) => {
                RefreshKeySpec::Composite(parts.iter().map(|p| p.map_sql(f)).collect())
            }
        }
    }

    fn tag(&self) -> u8 {
        match self {
            RefreshKeySpec::Sql { .. } => 0,
            RefreshKeySpec::Every(_) => 1,
            RefreshKeySpec::Composite(_) => 2,
        }
    }
}

/// Bucket number of `now` for a fixed interval
pub fn every_value(interval: Duration, now: DateTime<Utc>) -> String {
    let secs = interval.as_secs().max(1) as i64;
    now.timestamp().div_euclid(secs).to_string()
}

/// Hash the component values of a composite key in declaration order
pub fn composite_value(components: &[(&RefreshKeySpec, String)]) -> String {
    let mut buf = Vec::new();
    for (spec, value) in components {
        buf.push(spec.tag());
        write_bytes(&mut buf, value.as_bytes());
    }
    format!("{:x}", Sha256::digest(&buf))
}

/// Evaluates refresh keys, running SQL probes through the query queue
#[derive(Clone)]
pub struct RefreshKeys {
    queue: Arc<QueryQueue>,
}

impl RefreshKeys {
    pub fn new(queue: Arc<QueryQueue>) -> Self {
        Self { queue }
    }

    pub async fn compute(
        &self,
        spec: &RefreshKeySpec,
        data_source: &str,
    ) -> Result<String, QueryError> {
        self.compute_at(spec, data_source, Utc::now()).await
    }

    pub fn compute_at<'a>(
        &'a self,
        spec: &'a RefreshKeySpec,
        data_source: &'a str,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<String, QueryError>> {
        Box::pin(async move {
            match spec {
                RefreshKeySpec::Every(interval) => Ok(every_value(*interval, now)),
                RefreshKeySpec::Sql { sql, params } => {
                    let request =
                        QueryRequest::interactive(sql.clone(), params.clone(), data_source)
                            .with_priority(REFRESH_KEY_PRIORITY);
                    let output = self.queue.execute(request).await?;
                    Ok(output
                        .first_value()
                        .map(ToString::to_string)
                        .unwrap_or_default())
                }
                RefreshKeySpec::Composite(parts) => {
                    let mut values = Vec::with_capacity(parts.len());
                    for part in parts {
                        let value = self.compute_at(part, data_source, now).await?;
                        values.push((part, value));
                    }
                    Ok(composite_value(&values))
                }
            }
        })
    }
}
