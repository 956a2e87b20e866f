// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Caller side of an enqueued query

use super::item::QueryOutcome;
use crate::error::QueryError;
use crate::request::Fingerprint;
use crate::value::QueryOutput;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Awaitable result of an enqueued query
///
/// Every handle for one fingerprint observes the same outcome. Dropping the
/// last handle of a pending item makes it an orphan candidate.
#[derive(Debug)]
pub struct QueryHandle {
    fingerprint: Fingerprint,
    receiver: watch::Receiver<Option<QueryOutcome>>,
    joined: bool,
}

impl QueryHandle {
    pub(crate) fn new(
        fingerprint: Fingerprint,
        receiver: watch::Receiver<Option<QueryOutcome>>,
        joined: bool,
    ) -> Self {
        Self {
            fingerprint,
            receiver,
            joined,
        }
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Whether this handle attached to an item that already existed
    pub fn is_joined(&self) -> bool {
        self.joined
    }

    /// Outcome if already available
    pub fn try_result(&self) -> Option<QueryOutcome> {
        self.receiver.borrow().clone()
    }

    pub async fn wait(mut self) -> QueryOutcome {
        wait_for_outcome(&mut self.receiver).await
    }

    /// Wait up to `timeout`. `Ok(None)` means still running; call again to
    /// keep waiting on the same execution.
    pub async fn wait_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Arc<QueryOutput>>, QueryError> {
        match tokio::time::timeout(timeout, wait_for_outcome(&mut self.receiver)).await {
            Ok(outcome) => outcome.map(Some),
            Err(_) => Ok(None),
        }
    }
}

async fn wait_for_outcome(receiver: &mut watch::Receiver<Option<QueryOutcome>>) -> QueryOutcome {
    let outcome = receiver
        .wait_for(Option::is_some)
        .await
        .map(|current| (*current).clone());
    match outcome {
        Ok(Some(outcome)) => outcome,
        _ => Err(QueryError::Cancelled(
            "queue dropped the request without a result".to_string(),
        )),
    }
}
