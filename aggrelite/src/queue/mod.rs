// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Query queue
//!
//! Deduplicates executions by fingerprint, admits work per data source under
//! separate interactive and build caps, retries transient failures with
//! backoff, and reclaims work from workers whose lease expired.

pub mod handle;
pub mod item;
pub mod query_queue;
pub mod store;

pub use handle::QueryHandle;
pub use item::{ItemState, LeaseStatus, QueryOutcome, QueueItem};
pub use query_queue::{QueryQueue, QueueStats, SweepReport};
pub use store::{MemoryQueueStore, QueueStore};

use crate::request::PartitionRef;
use std::time::Duration;

/// Notified when a build job has filled its staging table
pub trait BuildListener: Send + Sync {
    fn on_build_staged(&self, partition: &PartitionRef);
}

/// Delay before retry number `attempt` (1-based): exponential with jitter
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let multiplier = 2_u32.saturating_pow(attempt.saturating_sub(1));
    let delay = base.saturating_mul(multiplier).min(max);
    // Jitter up to a quarter of the delay
    let jitter_ceiling = (delay.as_millis() / 4) as u64;
    let jitter = if jitter_ceiling > 0 {
        Duration::from_millis(fastrand::u64(0..=jitter_ceiling))
    } else {
        Duration::ZERO
    };
    delay.saturating_add(jitter).min(max)
}
