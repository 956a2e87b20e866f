// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Pre-aggregation definitions

use crate::cache::RefreshKeySpec;
use crate::error::ConfigError;
use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{(range_start|range_end)\}").expect("valid placeholder regex"));

static NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid name regex"));

/// Time bucket size of a partitioned pre-aggregation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Granularity {
    /// One unpartitioned table
    None,
    Hour,
    Day,
    /// ISO weeks, starting on Monday
    Week,
    Month,
    Year,
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Granularity::None => "none",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
            Granularity::Year => "year",
        };
        write!(f, "{}", name)
    }
}

/// Half-open time interval `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

/// Per-definition override of the scheduler's build window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRange {
    pub history: Duration,
    pub future: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreAggregationDefinition {
    pub name: String,
    /// SELECT producing the rows; may use `{range_start}` and `{range_end}`
    pub build_sql: String,
    pub partition_granularity: Granularity,
    pub refresh_key: RefreshKeySpec,
    pub data_source: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Built partitions ending longer ago than this are never refreshed again
    #[serde(default)]
    pub update_window: Option<Duration>,
    #[serde(default)]
    pub build_range: Option<BuildRange>,
    #[serde(default)]
    pub priority: i32,
}

impl PreAggregationDefinition {
    pub fn new(
        name: impl Into<String>,
        build_sql: impl Into<String>,
        partition_granularity: Granularity,
        refresh_key: RefreshKeySpec,
        data_source: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            build_sql: build_sql.into(),
            partition_granularity,
            refresh_key,
            data_source: data_source.into(),
            depends_on: Vec::new(),
            update_window: None,
            build_range: None,
            priority: 0,
        }
    }

    pub fn depends_on(mut self, names: &[&str]) -> Self {
        self.depends_on = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn with_update_window(mut self, window: Duration) -> Self {
        self.update_window = Some(window);
        self
    }

    pub fn with_build_range(mut self, history: Duration, future: Duration) -> Self {
        self.build_range = Some(BuildRange { history, future });
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !NAME.is_match(&self.name) {
            return Err(ConfigError::Invalid(format!(
                "Pre-aggregation name '{}' must be a plain identifier",
                self.name
            )));
        }
        if self.build_sql.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "Pre-aggregation '{}' has an empty build query",
                self.name
            )));
        }
        if self.depends_on.iter().any(|dep| dep == &self.name) {
            return Err(ConfigError::DependencyCycle(self.name.clone()));
        }
        Ok(())
    }

    /// Build query with the partition range substituted
    pub fn render_build_sql(&self, range: Option<&TimeRange>) -> String {
        render_sql(&self.build_sql, range)
    }

    /// Refresh key with the partition range substituted into its queries
    pub fn render_refresh_key(&self, range: Option<&TimeRange>) -> RefreshKeySpec {
        self.refresh_key.map_sql(&|sql: &str| render_sql(sql, range))
    }
}

fn sql_timestamp(at: DateTime<Utc>) -> String {
    format!("'{}'", at.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Substitute `{range_start}` / `{range_end}` with timestamp literals.
///
/// Unpartitioned definitions have no range; their placeholders are left as is.
pub fn render_sql(template: &str, range: Option<&TimeRange>) -> String {
    let Some(range) = range else {
        return template.to_string();
    };
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures| match &caps[1] {
            "range_start" => sql_timestamp(range.start),
            _ => sql_timestamp(range.end),
        })
        .into_owned()
}

/// Group definitions into dependency levels.
///
/// Level 0 has no dependencies; every definition sits one level above its
/// deepest dependency. Returns indices into `definitions`.
pub fn dependency_levels(
    definitions: &[PreAggregationDefinition],
) -> Result<Vec<Vec<usize>>, ConfigError> {
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();

    for (index, definition) in definitions.iter().enumerate() {
        definition.validate()?;
        if nodes
            .insert(definition.name.as_str(), graph.add_node(index))
            .is_some()
        {
            return Err(ConfigError::Invalid(format!(
                "Duplicate pre-aggregation '{}'",
                definition.name
            )));
        }
    }

    for definition in definitions {
        let dependent = nodes[definition.name.as_str()];
        for dependency in &definition.depends_on {
            let upstream = nodes
                .get(dependency.as_str())
                .ok_or_else(|| ConfigError::UnknownDefinition(dependency.clone()))?;
            graph.add_edge(*upstream, dependent, ());
        }
    }

    let order = toposort(&graph, None).map_err(|cycle| {
        ConfigError::DependencyCycle(definitions[graph[cycle.node_id()]].name.clone())
    })?;

    let mut depth = vec![0usize; definitions.len()];
    for node in &order {
        let level = graph
            .neighbors_directed(*node, petgraph::Direction::Incoming)
            .map(|upstream| depth[graph[upstream]] + 1)
            .max()
            .unwrap_or(0);
        depth[graph[*node]] = level;
    }

    let levels = depth.iter().copied().max().map_or(0, |deepest| deepest + 1);
    let mut grouped = vec![Vec::new(); levels];
    for (index, level) in depth.into_iter().enumerate() {
        grouped[level].push(index);
    }
    Ok(grouped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn def(name: &str, deps: &[&str]) -> PreAggregationDefinition {
        PreAggregationDefinition::new(
            name,
            "SELECT 1",
            Granularity::Day,
            RefreshKeySpec::every(Duration::from_secs(3600)),
            "default",
        )
        .depends_on(deps)
    }

    #[test]
    fn test_render_sql_substitutes_range() {
        let range = TimeRange::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
        );
        let sql = render_sql(
            "SELECT * FROM orders WHERE ts >= {range_start} AND ts < {range_end} AND x = '{other}'",
            Some(&range),
        );
        assert_eq!(
            sql,
            "SELECT * FROM orders WHERE ts >= '2024-01-01T00:00:00.000Z' \
             AND ts < '2024-01-02T00:00:00.000Z' AND x = '{other}'"
        );
        assert_eq!(render_sql("SELECT {range_start}", None), "SELECT {range_start}");
    }

    #[test]
    fn test_dependency_levels() {
        let defs = vec![def("c", &["b"]), def("a", &[]), def("b", &["a"]), def("d", &["a"])];
        let levels = dependency_levels(&defs).unwrap();
        assert_eq!(levels.len(), 3);
        assert_eq!(levels[0], vec![1]);
        let mut second = levels[1].clone();
        second.sort();
        assert_eq!(second, vec![2, 3]);
        assert_eq!(levels[2], vec![0]);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let defs = vec![def("a", &["b"]), def("b", &["a"])];
        assert!(matches!(
            dependency_levels(&defs),
            Err(ConfigError::DependencyCycle(_))
        ));
        assert!(matches!(
            dependency_levels(&[def("a", &["a"])]),
            Err(ConfigError::DependencyCycle(_))
        ));
    }

    #[test]
    fn test_unknown_dependency_and_bad_names() {
        assert!(matches!(
            dependency_levels(&[def("a", &["missing"])]),
            Err(ConfigError::UnknownDefinition(_))
        ));
        assert!(dependency_levels(&[def("orders daily", &[])]).is_err());
        assert!(dependency_levels(&[def("a", &[]), def("a", &[])]).is_err());
        assert!(dependency_levels(&[]).unwrap().is_empty());
    }
}
