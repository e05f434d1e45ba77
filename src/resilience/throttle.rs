//! Sliding-window admission control over request count and byte volume.
//!
//! The window only ever holds samples from `[now - window_ms, now]`; it is
//! pruned on every `record` and `is_over_limit`. When a monitor is attached its
//! windowed counters are checked against the same limits.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::ThrottleConfig;
use crate::monitoring::ResourceMonitor;

#[derive(Debug, Clone, Copy)]
struct ThrottleSample {
    requests: u64,
    bytes: u64,
    at: Instant,
}

/// Totals currently inside the window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowUsage {
    pub requests: u64,
    pub bytes: u64,
}

pub struct ThrottlePolicy {
    config: ThrottleConfig,
    monitor: Option<Arc<dyn ResourceMonitor>>,
    window: Mutex<VecDeque<ThrottleSample>>,
}

impl ThrottlePolicy {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            monitor: None,
            window: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn ResourceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    fn pruned(&self) -> MutexGuard<'_, VecDeque<ThrottleSample>> {
        let window = Duration::from_millis(self.config.window_ms);
        let now = Instant::now();
        let mut samples = self.window.lock().unwrap_or_else(|e| e.into_inner());
        while samples
            .front()
            .map_or(false, |s| now.saturating_duration_since(s.at) > window)
        {
            samples.pop_front();
        }
        samples
    }

    /// Adds one request carrying `bytes_in + bytes_out` bytes.
    pub fn record(&self, bytes_in: u64, bytes_out: u64) {
        let mut samples = self.pruned();
        samples.push_back(ThrottleSample {
            requests: 1,
            bytes: bytes_in + bytes_out,
            at: Instant::now(),
        });
    }

    pub fn usage(&self) -> WindowUsage {
        self.pruned().iter().fold(WindowUsage::default(), |acc, s| WindowUsage {
            requests: acc.requests + s.requests,
            bytes: acc.bytes + s.bytes,
        })
    }

    fn exceeds(&self, requests: u64, bytes: u64) -> bool {
        self.config
            .max_requests_per_minute
            .map_or(false, |max| requests >= max)
            || self
                .config
                .max_bytes_per_minute
                .map_or(false, |max| bytes >= max)
    }

    /// True when the window (or the attached monitor's window) meets either limit.
    pub fn is_over_limit(&self) -> bool {
        let usage = self.usage();
        if self.exceeds(usage.requests, usage.bytes) {
            debug!(
                requests = usage.requests,
                bytes = usage.bytes,
                "Throttle window over limit"
            );
            return true;
        }
        if let Some(monitor) = &self.monitor {
            let snap = monitor.snapshot();
            if self.exceeds(snap.window_requests, snap.window_bytes) {
                debug!(
                    requests = snap.window_requests,
                    bytes = snap.window_bytes,
                    "Monitor window over limit"
                );
                return true;
            }
        }
        false
    }
}
