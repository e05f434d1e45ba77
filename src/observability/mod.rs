//! Observability: periodic metrics reporting
//!
//! A `MetricsReporter` pulls a snapshot from a `ResourceMonitor` and pushes it
//! into a sink. Sinks are plain tower services, so anything from an exporter
//! client to a `service_fn` closure works:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tome_link::monitoring::{DefaultResourceMonitor, MetricsSnapshot};
//! use tome_link::observability::MetricsReporter;
//! use tower::{service_fn, BoxError};
//!
//! # async fn run() {
//! let monitor = Arc::new(DefaultResourceMonitor::default());
//! let sink = service_fn(|snap: MetricsSnapshot| async move {
//!     println!("{} requests", snap.request_count);
//!     Ok::<_, BoxError>(())
//! });
//! let handle = MetricsReporter::new(monitor, sink).start(Duration::from_secs(10));
//! // ...
//! handle.stop();
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tower::{BoxError, Service, ServiceExt};
use tracing::{debug, info, warn};

use crate::monitoring::{MetricsSnapshot, ResourceMonitor};

pub trait MetricsSink: Service<MetricsSnapshot, Response = (), Error = BoxError> {}
impl<T> MetricsSink for T where T: Service<MetricsSnapshot, Response = (), Error = BoxError> {}

/// Sink that writes each snapshot as an `info` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl Service<MetricsSnapshot> for LogSink {
    type Response = ();
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, snap: MetricsSnapshot) -> Self::Future {
        info!(
            requests = snap.request_count,
            errors = snap.error_count,
            bytes_in = snap.bytes_in,
            bytes_out = snap.bytes_out,
            p95 = snap.latency.map(|l| l.p95),
            circuit = snap.circuit_state.map(|c| c.as_str()),
            "metrics snapshot"
        );
        Box::pin(async { Ok(()) })
    }
}

pub struct MetricsReporter<C> {
    monitor: Arc<dyn ResourceMonitor>,
    sink: C,
}

impl<C> Clone for MetricsReporter<C>
where
    C: Clone,
{
    fn clone(&self) -> Self {
        Self {
            monitor: self.monitor.clone(),
            sink: self.sink.clone(),
        }
    }
}

impl<C> MetricsReporter<C>
where
    C: MetricsSink + Clone + Send + 'static,
    C::Future: Send + 'static,
{
    pub fn new(monitor: Arc<dyn ResourceMonitor>, sink: C) -> Self {
        Self { monitor, sink }
    }

    /// Pushes one snapshot. Sink errors are logged and swallowed.
    pub async fn report_once(&self) {
        Self::push(self.sink.clone(), self.monitor.snapshot()).await
    }

    async fn push(mut sink: C, snapshot: MetricsSnapshot) {
        let result = match sink.ready().await {
            Ok(ready) => ready.call(snapshot).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => debug!("Reported metrics snapshot"),
            Err(err) => warn!(error = %err, "Metrics sink failed"),
        }
    }

    /// Reports every `period`, first after one full period.
    pub fn start(&self, period: Duration) -> ReporterHandle {
        let monitor = self.monitor.clone();
        let sink = self.sink.clone();
        let task = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                Self::push(sink.clone(), monitor.snapshot()).await;
            }
        });
        ReporterHandle { task }
    }
}

/// Running reporter; stopping or dropping it cancels the task.
pub struct ReporterHandle {
    task: JoinHandle<()>,
}

impl ReporterHandle {
    pub fn stop(self) {
        // Drop aborts.
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for ReporterHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
