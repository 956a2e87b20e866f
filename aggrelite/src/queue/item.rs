// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Queue item lifecycle

use crate::clock;
use crate::error::QueryError;
use crate::request::{Fingerprint, QueryKind, QueryRequest};
use crate::value::QueryOutput;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Result shared by every waiter of one fingerprint
pub type QueryOutcome = Result<Arc<QueryOutput>, QueryError>;

/// Lifecycle state of a queue item
///
/// `Pending -> Active -> {Done, Failed, Cancelled}`; `Active -> Pending` on
/// retry or lease expiry; `Pending -> Cancelled` on cancel or orphaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemState {
    Pending,
    Active,
    Done,
    Failed,
    Cancelled,
}

impl ItemState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemState::Done | ItemState::Failed | ItemState::Cancelled)
    }

    /// Terminal state matching an outcome
    pub fn for_outcome(outcome: &QueryOutcome) -> Self {
        match outcome {
            Ok(_) => ItemState::Done,
            Err(QueryError::Cancelled(_)) => ItemState::Cancelled,
            Err(_) => ItemState::Failed,
        }
    }
}

/// Answer to a lease renewal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    Held,
    /// Still held, but a cancel was requested from elsewhere
    CancelRequested,
    /// Reclaimed, finished, or owned by another worker
    Lost,
}

/// Queued execution of one fingerprint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub request: QueryRequest,
    pub state: ItemState,
    /// Failed attempts so far
    pub attempts: u32,
    /// Timeouts so far; a second one is fatal
    pub timeouts: u32,
    /// Per-attempt deadline, also the initial lease length
    pub timeout: Duration,
    pub lease_expiry: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    /// Retry backoff: not claimable before this instant
    pub available_at: DateTime<Utc>,
    /// Enqueue order, assigned by the store
    pub sequence: u64,
    pub cancel_requested: bool,
}

impl QueueItem {
    pub fn new(request: QueryRequest, timeout: Duration, now: DateTime<Utc>) -> Self {
        Self {
            request,
            state: ItemState::Pending,
            attempts: 0,
            timeouts: 0,
            timeout,
            lease_expiry: None,
            worker_id: None,
            enqueued_at: now,
            available_at: now,
            sequence: 0,
            cancel_requested: false,
        }
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.request.fingerprint
    }

    pub fn data_source(&self) -> &str {
        &self.request.data_source
    }

    pub fn kind(&self) -> QueryKind {
        self.request.kind
    }

    pub fn priority(&self) -> i32 {
        self.request.priority
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == ItemState::Active && self.lease_expiry.is_some_and(|expiry| expiry < now)
    }

    /// Mark active for `worker_id`, leased for one timeout
    pub fn activate(&mut self, worker_id: &str, now: DateTime<Utc>) {
        self.state = ItemState::Active;
        self.worker_id = Some(worker_id.to_string());
        self.lease_expiry = Some(clock::add(now, self.timeout));
    }

    pub fn return_to_pending(&mut self) {
        self.state = ItemState::Pending;
        self.worker_id = None;
        self.lease_expiry = None;
    }
}
