//! Periodic connection health checks.
//!
//! A connection is `unhealthy` when either endpoint's state is unreadable or
//! empty, `degraded` when it has been idle longer than `stale_after_ms`, and
//! `healthy` otherwise. Each pass reports an aggregate through RobotCopy as a
//! `health-check` message when one is attached.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::machine::Machine;
use super::topology::HealthStatus;
use super::{Connection, TomeConnector};
use crate::config::HealthCheckConfig;

/// Aggregate sent with each health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSummary {
    pub total_connections: usize,
    /// Both endpoints answered with state
    pub active_connections: usize,
    pub healthy_connections: usize,
    pub degraded_connections: usize,
    pub unhealthy_connections: usize,
    pub timestamp: DateTime<Utc>,
    /// Set when reporting through RobotCopy
    pub connector_id: Option<String>,
}

fn has_state(machine: &Arc<dyn Machine>) -> bool {
    match machine.get_state() {
        Ok(Some(state)) => !state.is_null(),
        Ok(None) => false,
        Err(err) => {
            debug!(machine = machine.name(), error = %err, "State read failed");
            false
        }
    }
}

pub(crate) fn assess(connection: &Connection, stale_after: Duration) -> HealthStatus {
    if !has_state(&connection.source) || !has_state(&connection.target) {
        HealthStatus::Unhealthy
    } else if connection.idle() > stale_after {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

impl TomeConnector {
    /// Starts the periodic check, replacing any loop already running.
    pub fn start_health_monitoring(&self, config: HealthCheckConfig) {
        self.stop_health_monitoring();
        let period = Duration::from_millis(config.interval_ms.max(1));
        *self.inner.health_config.write().unwrap_or_else(|e| e.into_inner()) = config;

        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                TomeConnector { inner }.perform_health_check().await;
            }
        });
        *self.inner.health_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        info!(interval = ?period, "Connection health monitoring started");
    }

    pub fn stop_health_monitoring(&self) {
        let task = self
            .inner
            .health_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
            info!("Connection health monitoring stopped");
        }
    }

    pub fn is_health_monitoring(&self) -> bool {
        self.inner
            .health_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }

    /// Re-assesses every connection and reports the aggregate.
    pub async fn perform_health_check(&self) -> HealthSummary {
        let stale_after = {
            let config = self.inner.health_config.read().unwrap_or_else(|e| e.into_inner());
            Duration::from_millis(config.stale_after_ms)
        };

        let mut summary = HealthSummary {
            total_connections: 0,
            active_connections: 0,
            healthy_connections: 0,
            degraded_connections: 0,
            unhealthy_connections: 0,
            timestamp: Utc::now(),
            connector_id: self.inner.robot_copy.as_ref().map(|_| self.inner.id.clone()),
        };

        for connection in self.inner.snapshot() {
            let status = assess(&connection, stale_after);
            connection.set_health(status);
            summary.total_connections += 1;
            match status {
                HealthStatus::Healthy => summary.healthy_connections += 1,
                HealthStatus::Degraded => summary.degraded_connections += 1,
                HealthStatus::Unhealthy => summary.unhealthy_connections += 1,
            }
            if status != HealthStatus::Unhealthy {
                summary.active_connections += 1;
            }
        }

        debug!(
            total = summary.total_connections,
            degraded = summary.degraded_connections,
            unhealthy = summary.unhealthy_connections,
            "Health check complete"
        );

        if let Some(robot_copy) = &self.inner.robot_copy {
            match serde_json::to_value(&summary) {
                Ok(report) => {
                    if let Err(err) = robot_copy.send_message("health-check", report).await {
                        warn!(code = err.code(), error = %err, "Health report failed");
                    }
                }
                Err(err) => warn!(error = %err, "Health report could not be encoded"),
            }
        }

        summary
    }
}
