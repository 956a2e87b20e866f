// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Partitions: time buckets, table naming and build state
//!
//! Buckets are aligned in the scheduler's timezone and stored as UTC
//! instants. Consecutive buckets share their boundary, so a list of ranges
//! produced for a window has neither gaps nor overlaps.

use super::definition::{Granularity, PreAggregationDefinition, TimeRange};
use crate::request::PartitionRef;
use chrono::offset::LocalResult;
use chrono::{DateTime, Datelike, Days, Months, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

const STAGING_MARKER: &str = "__stg_";
const RETIRED_MARKER: &str = "__old_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildState {
    Unbuilt,
    Building,
    Built,
    Failed,
}

/// One materialized slice of a pre-aggregation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub id: String,
    pub definition: String,
    /// `None` for unpartitioned definitions
    pub range: Option<TimeRange>,
    pub table_name_active: String,
    pub table_name_staging: Option<String>,
    pub last_built_refresh_key: Option<String>,
    pub build_state: BuildState,
    /// Staging table filled and waiting for the swap
    pub staged: bool,
    /// When the active table was last swapped in
    pub built_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Partition {
    pub fn new(
        definition: &PreAggregationDefinition,
        range: Option<TimeRange>,
        schema: &str,
        tz: Tz,
    ) -> Self {
        let suffix = range
            .map(|r| partition_suffix(definition.partition_granularity, r.start, tz))
            .unwrap_or_default();
        Self {
            id: partition_id(&definition.name, &suffix),
            definition: definition.name.clone(),
            range,
            table_name_active: active_table_name(schema, &definition.name, &suffix),
            table_name_staging: None,
            last_built_refresh_key: None,
            build_state: BuildState::Unbuilt,
            staged: false,
            built_at: None,
            last_error: None,
        }
    }

    /// Whether readers can use `table_name_active`
    pub fn has_active_table(&self) -> bool {
        self.built_at.is_some()
    }

    pub fn partition_ref(&self) -> PartitionRef {
        PartitionRef {
            definition: self.definition.clone(),
            partition_id: self.id.clone(),
        }
    }

    pub fn covers(&self, at: DateTime<Utc>) -> bool {
        self.range.map_or(true, |range| range.contains(at))
    }
}

pub fn partition_id(definition: &str, suffix: &str) -> String {
    if suffix.is_empty() {
        definition.to_string()
    } else {
        format!("{}:{}", definition, suffix)
    }
}

pub fn active_table_name(schema: &str, definition: &str, suffix: &str) -> String {
    if suffix.is_empty() {
        format!("{}.{}", schema, definition)
    } else {
        format!("{}.{}_{}", schema, definition, suffix)
    }
}

/// Staging name: structure and content hashes plus the creation epoch
pub fn staging_table_name(active: &str, structure: u32, content: u32, epoch: i64) -> String {
    format!(
        "{}{}{:08x}_{:08x}_{}",
        active, STAGING_MARKER, structure, content, epoch
    )
}

pub fn retired_table_name(active: &str, epoch: i64) -> String {
    format!("{}{}{}", active, RETIRED_MARKER, epoch)
}

/// Role of a generated table, read back from its name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratedTable {
    Staging { epoch: i64 },
    Retired { epoch: i64 },
}

pub fn parse_generated_table(name: &str) -> Option<GeneratedTable> {
    let epoch = || name.rsplit('_').next()?.parse::<i64>().ok();
    if name.contains(STAGING_MARKER) {
        Some(GeneratedTable::Staging { epoch: epoch()? })
    } else if name.contains(RETIRED_MARKER) {
        Some(GeneratedTable::Retired { epoch: epoch()? })
    } else {
        None
    }
}

/// Table suffix derived from the bucket start in local time
pub fn partition_suffix(granularity: Granularity, start: DateTime<Utc>, tz: Tz) -> String {
    let local = start.with_timezone(&tz);
    let format = match granularity {
        Granularity::None => return String::new(),
        Granularity::Hour => "%Y%m%d%H",
        Granularity::Day | Granularity::Week => "%Y%m%d",
        Granularity::Month => "%Y%m",
        Granularity::Year => "%Y",
    };
    local.format(format).to_string()
}

/// Resolve a local wall-clock time to an instant; DST gaps move forward
fn localize(naive: NaiveDateTime, tz: Tz) -> DateTime<Utc> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(at) => at.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => tz
            .from_local_datetime(&(naive + chrono::Duration::hours(1)))
            .earliest()
            .map(|at| at.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&naive)),
    }
}

fn midnight(date: NaiveDate, tz: Tz) -> Option<DateTime<Utc>> {
    date.and_hms_opt(0, 0, 0).map(|naive| localize(naive, tz))
}

/// Start of the bucket containing `at`
pub fn bucket_start(granularity: Granularity, at: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let local = at.with_timezone(&tz);
    let date = local.date_naive();
    let start = match granularity {
        Granularity::None => Some(at),
        Granularity::Hour => {
            // Trim local minutes and seconds off the instant itself so
            // repeated DST hours stay distinct
            let into_hour = chrono::Duration::seconds(i64::from(local.minute() * 60 + local.second()))
                + chrono::Duration::nanoseconds(i64::from(local.nanosecond()));
            Some(at - into_hour)
        }
        Granularity::Day => midnight(date, tz),
        Granularity::Week => date
            .checked_sub_days(Days::new(u64::from(date.weekday().num_days_from_monday())))
            .and_then(|monday| midnight(monday, tz)),
        Granularity::Month => date.with_day(1).and_then(|first| midnight(first, tz)),
        Granularity::Year => {
            NaiveDate::from_ymd_opt(date.year(), 1, 1).and_then(|first| midnight(first, tz))
        }
    };
    start.unwrap_or(at)
}

/// Start of the bucket following the one starting at `start`
pub fn bucket_end(granularity: Granularity, start: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let date = start.with_timezone(&tz).date_naive();
    let next = match granularity {
        Granularity::None => None,
        Granularity::Hour => return start + chrono::Duration::hours(1),
        Granularity::Day => date.succ_opt(),
        Granularity::Week => date.checked_add_days(Days::new(7)),
        Granularity::Month => date.checked_add_months(Months::new(1)),
        Granularity::Year => date.checked_add_months(Months::new(12)),
    };
    next.and_then(|date| midnight(date, tz))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Contiguous buckets covering `[from, to]`
pub fn partition_ranges(
    granularity: Granularity,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    tz: Tz,
) -> Vec<TimeRange> {
    if granularity == Granularity::None || from > to {
        return Vec::new();
    }

    let mut ranges = Vec::new();
    let mut start = bucket_start(granularity, from, tz);
    while start <= to {
        let end = bucket_end(granularity, start, tz);
        if end <= start {
            break;
        }
        ranges.push(TimeRange::new(start, end));
        start = end;
    }
    ranges
}
