//! Resource monitoring: request counters, byte counters and latency percentiles
//!
//! A `ResourceMonitor` aggregates what RobotCopy (or an admission layer) saw on
//! the wire and hands out point-in-time `MetricsSnapshot`s. Circuit breakers
//! mirror their transitions into it so a single snapshot describes both
//! traffic and breaker state.
//!
//! Counters are cumulative. Latency percentiles and the `window_*` fields only
//! cover the trailing `window_ms`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::MonitorConfig;

/// Breaker state as reported to monitors and snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "halfOpen",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestMeta {
    pub path: String,
    pub method: String,
    pub bytes_in: Option<u64>,
    pub bytes_out: Option<u64>,
    pub latency_ms: Option<f64>,
    pub status: Option<u16>,
}

impl RequestMeta {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method: method.into(),
            ..Default::default()
        }
    }

    pub fn bytes(mut self, bytes_in: u64, bytes_out: u64) -> Self {
        self.bytes_in = Some(bytes_in);
        self.bytes_out = Some(bytes_out);
        self
    }

    pub fn latency_ms(mut self, latency_ms: f64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    pub fn status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub avg: f64,
}

/// Derived, read-only view of a monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub request_count: u64,
    pub error_count: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Requests observed within the trailing window
    pub window_requests: u64,
    /// Bytes in + out observed within the trailing window
    pub window_bytes: u64,
    pub latency: Option<LatencySummary>,
    pub circuit_state: Option<CircuitState>,
    pub timestamp: DateTime<Utc>,
    pub dimensions: BTreeMap<String, String>,
}

/// Sink for request and circuit observations.
pub trait ResourceMonitor: Send + Sync {
    fn track_request(&self, meta: RequestMeta);

    fn track_circuit(&self, name: &str, state: CircuitState);

    fn snapshot(&self) -> MetricsSnapshot;
}

#[derive(Debug, Clone, Copy)]
struct LatencySample {
    ms: f64,
    at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct TrafficSample {
    bytes: u64,
    at: Instant,
}

#[derive(Default)]
struct Counters {
    request_count: u64,
    error_count: u64,
    bytes_in: u64,
    bytes_out: u64,
    latency_samples: VecDeque<LatencySample>,
    traffic: VecDeque<TrafficSample>,
    // Insertion-ordered so "first tracked circuit" is well defined.
    circuits: Vec<(String, CircuitState)>,
}

/// In-memory monitor; a single lock covers each increment+append.
pub struct DefaultResourceMonitor {
    counters: Mutex<Counters>,
    window: Duration,
    max_samples: usize,
    dimensions: BTreeMap<String, String>,
}

impl Default for DefaultResourceMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

impl DefaultResourceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            window: Duration::from_millis(config.window_ms),
            max_samples: config.max_samples,
            dimensions: config.dimensions,
        }
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn within_window(&self, at: Instant, now: Instant) -> bool {
        now.saturating_duration_since(at) <= self.window
    }
}

/// Sorted-array lookup at `floor(n * p)`, clamped to the last element.
pub(crate) fn percentile(sorted: &[f64], p: f64) -> f64 {
    let idx = ((sorted.len() as f64) * p).floor() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn summarize(mut values: Vec<f64>) -> Option<LatencySummary> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let avg = values.iter().sum::<f64>() / values.len() as f64;
    Some(LatencySummary {
        p50: percentile(&values, 0.5),
        p95: percentile(&values, 0.95),
        p99: percentile(&values, 0.99),
        avg,
    })
}

fn representative_circuit(circuits: &[(String, CircuitState)]) -> Option<CircuitState> {
    match circuits {
        [] => None,
        [(_, only)] => Some(*only),
        [(_, first), ..] => circuits
            .iter()
            .find(|(name, _)| name == "default")
            .map(|(_, state)| *state)
            .or(Some(*first)),
    }
}

impl ResourceMonitor for DefaultResourceMonitor {
    fn track_request(&self, meta: RequestMeta) {
        let now = Instant::now();
        let mut c = self.counters();
        c.request_count += 1;
        if meta.status.map_or(false, |s| s >= 400) {
            c.error_count += 1;
        }
        let bytes_in = meta.bytes_in.unwrap_or(0);
        let bytes_out = meta.bytes_out.unwrap_or(0);
        c.bytes_in += bytes_in;
        c.bytes_out += bytes_out;

        if let Some(ms) = meta.latency_ms {
            c.latency_samples.push_back(LatencySample { ms, at: now });
            if c.latency_samples.len() > self.max_samples {
                c.latency_samples.pop_front();
            }
        }

        c.traffic.push_back(TrafficSample {
            bytes: bytes_in + bytes_out,
            at: now,
        });
        while c
            .traffic
            .front()
            .map_or(false, |s| !self.within_window(s.at, now))
        {
            c.traffic.pop_front();
        }
    }

    fn track_circuit(&self, name: &str, state: CircuitState) {
        let mut c = self.counters();
        match c.circuits.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = state,
            None => c.circuits.push((name.to_string(), state)),
        }
    }

    fn snapshot(&self) -> MetricsSnapshot {
        let now = Instant::now();
        let c = self.counters();

        let recent: Vec<f64> = c
            .latency_samples
            .iter()
            .filter(|s| self.within_window(s.at, now))
            .map(|s| s.ms)
            .collect();

        let (window_requests, window_bytes) = c
            .traffic
            .iter()
            .filter(|s| self.within_window(s.at, now))
            .fold((0u64, 0u64), |(n, b), s| (n + 1, b + s.bytes));

        MetricsSnapshot {
            request_count: c.request_count,
            error_count: c.error_count,
            bytes_in: c.bytes_in,
            bytes_out: c.bytes_out,
            window_requests,
            window_bytes,
            latency: summarize(recent),
            circuit_state: representative_circuit(&c.circuits),
            timestamp: Utc::now(),
            dimensions: self.dimensions.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(window_ms: u64, max_samples: usize) -> DefaultResourceMonitor {
        DefaultResourceMonitor::new(MonitorConfig {
            window_ms,
            max_samples,
            dimensions: BTreeMap::from([("service".to_string(), "orders".to_string())]),
        })
    }

    #[test]
    fn window_traffic_is_not_capped_by_sample_limit() {
        let m = monitor(60_000, 10);
        for _ in 0..25 {
            m.track_request(RequestMeta::new("POST", "/api/a").bytes(2, 2).latency_ms(1.0));
        }
        let snap = m.snapshot();
        assert_eq!(snap.request_count, 25);
        assert_eq!(snap.window_requests, 25);
        assert_eq!(snap.window_bytes, 100);
        assert_eq!(m.counters().latency_samples.len(), 10);
    }

    #[test]
    fn counts_requests_errors_and_bytes() {
        let m = monitor(60_000, 100);
        m.track_request(RequestMeta::new("POST", "/api/a").bytes(10, 20).status(200));
        m.track_request(RequestMeta::new("POST", "/api/a").bytes(5, 0).status(503));
        m.track_request(RequestMeta::new("GET", "/api/b").status(404));

        let snap = m.snapshot();
        assert_eq!(snap.request_count, 3);
        assert_eq!(snap.error_count, 2);
        assert_eq!(snap.bytes_in, 15);
        assert_eq!(snap.bytes_out, 20);
        assert_eq!(snap.window_requests, 3);
        assert_eq!(snap.window_bytes, 35);
        assert!(snap.latency.is_none());
        assert_eq!(snap.dimensions.get("service").map(String::as_str), Some("orders"));
    }

    #[test]
    fn latency_percentiles_use_floor_index() {
        let m = monitor(60_000, 1_000);
        for ms in 1..=10 {
            m.track_request(RequestMeta::new("POST", "/x").latency_ms(ms as f64));
        }
        let latency = m.snapshot().latency.unwrap();
        // sorted [1..=10]; floor(10 * 0.5) = 5 -> 6, floor(9.5) = 9 -> 10
        assert_eq!(latency.p50, 6.0);
        assert_eq!(latency.p95, 10.0);
        assert_eq!(latency.p99, 10.0);
        assert_eq!(latency.avg, 5.5);
    }

    #[test]
    fn oldest_latency_sample_is_evicted_past_max_samples() {
        let m = monitor(60_000, 3);
        for ms in [100.0, 1.0, 2.0, 3.0] {
            m.track_request(RequestMeta::new("POST", "/x").latency_ms(ms));
        }
        let latency = m.snapshot().latency.unwrap();
        assert_eq!(latency.p99, 3.0);
        assert_eq!(latency.avg, 2.0);
    }

    #[test]
    fn samples_outside_window_are_ignored() {
        let m = monitor(20, 100);
        m.track_request(RequestMeta::new("POST", "/x").latency_ms(5.0).bytes(1, 1));
        std::thread::sleep(Duration::from_millis(40));
        let snap = m.snapshot();
        assert!(snap.latency.is_none());
        assert_eq!(snap.window_requests, 0);
        assert_eq!(snap.request_count, 1);
    }

    #[test]
    fn circuit_state_resolution() {
        let m = monitor(60_000, 100);
        assert!(m.snapshot().circuit_state.is_none());

        m.track_circuit("payments", CircuitState::Open);
        assert_eq!(m.snapshot().circuit_state, Some(CircuitState::Open));

        m.track_circuit("search", CircuitState::HalfOpen);
        assert_eq!(m.snapshot().circuit_state, Some(CircuitState::Open));

        m.track_circuit("default", CircuitState::Closed);
        assert_eq!(m.snapshot().circuit_state, Some(CircuitState::Closed));
    }

    #[test]
    fn snapshot_is_idempotent_apart_from_timestamp() {
        let m = monitor(60_000, 100);
        m.track_request(RequestMeta::new("POST", "/x").latency_ms(3.0).status(200));
        m.track_circuit("default", CircuitState::Closed);

        let first = m.snapshot();
        let mut second = m.snapshot();
        second.timestamp = first.timestamp;
        assert_eq!(first, second);
    }

    #[test]
    fn circuit_state_serializes_camel_case() {
        let json = serde_json::to_string(&CircuitState::HalfOpen).unwrap();
        assert_eq!(json, "\"halfOpen\"");
    }
}
