//! Derived network topology and structural validation.
//!
//! A `NetworkTopology` is rebuilt from the live connection set on every call
//! and never stored. `validate` looks for three hazards:
//!
//! - cycles: DFS with a recursion stack; bidirectional edges are walked both
//!   ways, and the node just left is never counted as a way back
//! - fan-out: more than `max_fan_out` edges leaving one node
//! - event amplification: one `source->target` event mapping repeated more
//!   than `max_mapping_repeats` times
//!
//! With `advanced` set it also flags high-frequency connections: older than
//! `high_frequency_min_age_ms` yet active within `high_frequency_max_idle_ms`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use crate::config::ValidationThresholds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyEdge {
    pub id: String,
    pub from: String,
    pub to: String,
    pub bidirectional: bool,
    pub health_status: HealthStatus,
    pub event_mapping: BTreeMap<String, String>,
    pub trace_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl TopologyEdge {
    /// A fresh, healthy edge; mostly useful for building topologies by hand.
    pub fn new(id: impl Into<String>, from: impl Into<String>, to: impl Into<String>, bidirectional: bool) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            from: from.into(),
            to: to.into(),
            bidirectional,
            health_status: HealthStatus::Healthy,
            event_mapping: BTreeMap::new(),
            trace_id: None,
            created_at: now,
            last_activity: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyMetrics {
    pub total_connections: usize,
    pub healthy_connections: usize,
    pub degraded_connections: usize,
    pub unhealthy_connections: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkTopology {
    /// Participants in order of first appearance
    pub nodes: Vec<String>,
    pub edges: Vec<TopologyEdge>,
    pub metrics: TopologyMetrics,
}

/// Structural findings. Errors are hazards; warnings are heuristics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty() && self.errors.is_empty()
    }
}

struct CycleSearch<'a> {
    adjacency: HashMap<&'a str, Vec<&'a str>>,
    visited: HashSet<&'a str>,
    stack: HashSet<&'a str>,
}

impl<'a> CycleSearch<'a> {
    fn new(edges: &'a [TopologyEdge]) -> Self {
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in edges {
            adjacency
                .entry(edge.from.as_str())
                .or_default()
                .push(edge.to.as_str());
            if edge.bidirectional {
                adjacency
                    .entry(edge.to.as_str())
                    .or_default()
                    .push(edge.from.as_str());
            }
        }
        Self {
            adjacency,
            visited: HashSet::new(),
            stack: HashSet::new(),
        }
    }

    fn visit(&mut self, node: &'a str, parent: Option<&'a str>) -> bool {
        if self.stack.contains(node) {
            return true;
        }
        if !self.visited.insert(node) {
            return false;
        }
        self.stack.insert(node);
        let neighbours = self.adjacency.get(node).cloned().unwrap_or_default();
        for next in neighbours {
            if Some(next) == parent {
                continue;
            }
            if self.visit(next, Some(node)) {
                return true;
            }
        }
        self.stack.remove(node);
        false
    }
}

impl NetworkTopology {
    /// Builds nodes and metrics from `edges`.
    pub fn from_edges(edges: Vec<TopologyEdge>) -> Self {
        let mut nodes: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        let mut metrics = TopologyMetrics {
            total_connections: edges.len(),
            ..Default::default()
        };
        for edge in &edges {
            for node in [&edge.from, &edge.to] {
                if seen.insert(node.clone()) {
                    nodes.push(node.clone());
                }
            }
            match edge.health_status {
                HealthStatus::Healthy => metrics.healthy_connections += 1,
                HealthStatus::Degraded => metrics.degraded_connections += 1,
                HealthStatus::Unhealthy => metrics.unhealthy_connections += 1,
            }
        }
        Self {
            nodes,
            edges,
            metrics,
        }
    }

    /// Nodes from which a cycle was found, in node order.
    pub fn cyclic_nodes(&self) -> Vec<String> {
        let mut search = CycleSearch::new(&self.edges);
        let mut found = Vec::new();
        for node in &self.nodes {
            search.stack.clear();
            if search.visit(node, None) {
                found.push(node.clone());
            }
        }
        found
    }

    /// Outgoing edges per node; bidirectional edges count for both ends.
    pub fn fan_out(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for edge in &self.edges {
            *counts.entry(edge.from.clone()).or_insert(0) += 1;
            if edge.bidirectional {
                *counts.entry(edge.to.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    pub fn validate(&self, thresholds: &ValidationThresholds, advanced: bool) -> ValidationReport {
        let mut report = ValidationReport::default();

        for node in self.cyclic_nodes() {
            report
                .errors
                .push(format!("Circular dependency detected involving node: {}", node));
        }

        let fan_out = self.fan_out();
        for node in &self.nodes {
            let count = fan_out.get(node).copied().unwrap_or(0);
            if count > thresholds.max_fan_out {
                report.warnings.push(format!(
                    "High fan-out detected for node {}: {} connections",
                    node, count
                ));
            }
        }

        let mut mapping_counts: BTreeMap<String, usize> = BTreeMap::new();
        for edge in &self.edges {
            for (source_event, target_event) in &edge.event_mapping {
                *mapping_counts
                    .entry(format!("{}->{}", source_event, target_event))
                    .or_insert(0) += 1;
            }
        }
        for (pair, count) in mapping_counts {
            if count > thresholds.max_mapping_repeats {
                report.warnings.push(format!(
                    "Potential event amplification detected: {} appears {} times",
                    pair, count
                ));
            }
        }

        if advanced {
            let now = Utc::now();
            let busy = self
                .edges
                .iter()
                .filter(|edge| {
                    let age = (now - edge.created_at).num_milliseconds();
                    let idle = (now - edge.last_activity).num_milliseconds();
                    age > thresholds.high_frequency_min_age_ms as i64
                        && idle < thresholds.high_frequency_max_idle_ms as i64
                })
                .count();
            if busy > 0 {
                report.warnings.push(format!(
                    "High frequency connections detected: {} connections showing high activity",
                    busy
                ));
            }
        }

        report
    }
}
