//! Admission middleware: throttle + circuit breaker + monitor as a tower layer.
//!
//! Wraps any transport-shaped service. Requests are rejected with
//! `DispatchError::Throttled` / `DispatchError::CircuitOpen` (boxed) before the
//! inner service is called. Completed calls are recorded into the monitor and
//! throttle; statuses >= 400 count as breaker failures.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tome_link::config::{ThrottleConfig, CircuitBreakerConfig};
//! use tome_link::resilience::{AdmissionLayer, CircuitBreaker, ThrottlePolicy};
//! use tome_link::transport::HttpTransport;
//! use tower::ServiceBuilder;
//!
//! let svc = ServiceBuilder::new()
//!     .layer(
//!         AdmissionLayer::new()
//!             .throttle(Arc::new(ThrottlePolicy::new(ThrottleConfig::default())))
//!             .breaker(Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()))),
//!     )
//!     .service(HttpTransport::new());
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use tower::{BoxError, Layer, Service};
use tracing::debug;

use crate::error::DispatchError;
use crate::monitoring::{RequestMeta, ResourceMonitor};
use crate::resilience::{CircuitBreaker, ThrottlePolicy};
use crate::transport::{TransportRequest, TransportResponse};

#[derive(Clone, Default)]
pub struct AdmissionLayer {
    throttle: Option<Arc<ThrottlePolicy>>,
    breaker: Option<Arc<CircuitBreaker>>,
    monitor: Option<Arc<dyn ResourceMonitor>>,
}

impl AdmissionLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn throttle(mut self, throttle: Arc<ThrottlePolicy>) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn monitor(mut self, monitor: Arc<dyn ResourceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }
}

#[derive(Clone)]
pub struct Admission<S> {
    inner: S,
    throttle: Option<Arc<ThrottlePolicy>>,
    breaker: Option<Arc<CircuitBreaker>>,
    monitor: Option<Arc<dyn ResourceMonitor>>,
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = Admission<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Admission {
            inner,
            throttle: self.throttle.clone(),
            breaker: self.breaker.clone(),
            monitor: self.monitor.clone(),
        }
    }
}

impl<S> Service<TransportRequest> for Admission<S>
where
    S: Service<TransportRequest, Response = TransportResponse, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = TransportResponse;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: TransportRequest) -> Self::Future {
        if self.throttle.as_ref().map_or(false, |t| t.is_over_limit()) {
            debug!(path = %req.path, "Request throttled");
            return Box::pin(async { Err(DispatchError::Throttled.into()) });
        }
        if let Some(breaker) = &self.breaker {
            if !breaker.allow_request() {
                let name = breaker.name().to_string();
                return Box::pin(async move { Err(DispatchError::CircuitOpen { name }.into()) });
            }
        }

        let throttle = self.throttle.clone();
        let breaker = self.breaker.clone();
        let monitor = self.monitor.clone();
        let method = req.method.clone();
        let path = req.path.clone();
        let bytes_in = req.body.len() as u64;
        let start = Instant::now();
        let fut = self.inner.call(req);

        Box::pin(async move {
            let result = fut.await;
            let latency_ms = start.elapsed().as_secs_f64() * 1_000.0;
            match &result {
                Ok(resp) => {
                    let bytes_out = resp.body.len() as u64;
                    if let Some(monitor) = &monitor {
                        monitor.track_request(
                            RequestMeta::new(method, path)
                                .bytes(bytes_in, bytes_out)
                                .latency_ms(latency_ms)
                                .status(resp.status),
                        );
                    }
                    if let Some(throttle) = &throttle {
                        throttle.record(bytes_in, bytes_out);
                    }
                    if let Some(breaker) = &breaker {
                        if resp.status >= 400 {
                            breaker.record_failure();
                        } else {
                            breaker.record_success();
                        }
                    }
                }
                Err(_) => {
                    if let Some(breaker) = &breaker {
                        breaker.record_failure();
                    }
                }
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitBreakerConfig, MonitorConfig, ThrottleConfig};
    use crate::monitoring::DefaultResourceMonitor;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::{service_fn, ServiceExt};

    fn request() -> TransportRequest {
        TransportRequest {
            method: "POST".into(),
            url: "http://backend/api/x".into(),
            path: "/api/x".into(),
            headers: BTreeMap::new(),
            body: "{}".into(),
        }
    }

    fn code_of(err: &BoxError) -> Option<&'static str> {
        err.downcast_ref::<DispatchError>().map(|e| e.code())
    }

    #[tokio::test]
    async fn throttles_before_calling_inner() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_cl = calls.clone();
        let inner = service_fn(move |_req: TransportRequest| {
            calls_cl.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, BoxError>(TransportResponse::ok("{}")) }
        });
        let throttle = Arc::new(ThrottlePolicy::new(ThrottleConfig {
            max_requests_per_minute: Some(1),
            ..Default::default()
        }));
        let mut svc = AdmissionLayer::new().throttle(throttle).layer(inner);

        svc.ready().await.unwrap().call(request()).await.unwrap();
        let err = svc.ready().await.unwrap().call(request()).await.unwrap_err();
        assert_eq!(code_of(&err), Some("THROTTLED"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn error_statuses_open_the_breaker_and_feed_the_monitor() {
        let inner = service_fn(|_req: TransportRequest| async move {
            Ok::<_, BoxError>(TransportResponse::with_status(500, "nope"))
        });
        let monitor = Arc::new(DefaultResourceMonitor::new(MonitorConfig::default()));
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            threshold: 2,
            ..Default::default()
        }));
        let mut svc = AdmissionLayer::new()
            .breaker(breaker.clone())
            .monitor(monitor.clone())
            .layer(inner);

        for _ in 0..2 {
            let resp = svc.ready().await.unwrap().call(request()).await.unwrap();
            assert_eq!(resp.status, 500);
        }
        let err = svc.ready().await.unwrap().call(request()).await.unwrap_err();
        assert_eq!(code_of(&err), Some("CIRCUIT_OPEN"));

        let snap = monitor.snapshot();
        assert_eq!(snap.request_count, 2);
        assert_eq!(snap.error_count, 2);
        assert!(snap.latency.is_some());
    }
}
