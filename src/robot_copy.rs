//! # RobotCopy
//!
//! Message dispatch facade. A send runs, in order:
//!
//! 1. throttle check (`THROTTLED`, no network call)
//! 2. circuit check (`CIRCUIT_OPEN`, no network call)
//! 3. backend resolution through the selector toggle
//! 4. request assembly: correlation ids, tracing headers, optional message token
//! 5. transport call, reported to the monitor and throttle
//! 6. status classification: 5xx and transport failures are retryable
//! 7. retry with exponential backoff, the whole loop inside the breaker
//! 8. response tracking and JSON decoding
//!
//! ```rust,no_run
//! use serde_json::json;
//! use tome_link::config::ConfigBuilder;
//! use tome_link::RobotCopy;
//!
//! # async fn run() -> tome_link::Result<()> {
//! let robot_copy = RobotCopy::new(ConfigBuilder::new().max_retries(2).build());
//! let order = robot_copy.send_message("create-order", json!({"id": 1})).await?;
//! # let _ = order;
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tower::util::BoxCloneService;
use tower::{Service, ServiceExt};
use tracing::{debug, warn};

use crate::config::RobotCopyConfig;
use crate::error::{DispatchError, Result};
use crate::monitoring::{RequestMeta, ResourceMonitor};
use crate::registry::{Location, MachineConfig, MachineRecord, MachineRegistry};
use crate::resilience::{CircuitBreaker, ThrottlePolicy};
use crate::retry::{retry_async, RetryPolicy};
use crate::toggles::{StaticToggles, ToggleSource, ENABLE_DATADOG};
use crate::token::{serialize_token, MessageToken, MessageTokenProvider, MESSAGE_TOKEN_FIELD, MESSAGE_TOKEN_HEADER};
use crate::trace::{Message, MessageId, SpanId, TraceId, TraceInfo, TrackedData, Tracing};
use crate::transport::{BoxTransport, HttpTransport, Transport, TransportRequest, TransportResponse};

/// Which of the two configured backends a send targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Primary,
    Secondary,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Primary => "primary",
            BackendKind::Secondary => "secondary",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct RobotCopy {
    config: RobotCopyConfig,
    tracing: Tracing,
    toggles: Arc<dyn ToggleSource>,
    transport: Mutex<BoxTransport>,
    monitor: Option<Arc<dyn ResourceMonitor>>,
    throttle: Option<Arc<ThrottlePolicy>>,
    breaker: Option<Arc<CircuitBreaker>>,
    token_provider: Option<Arc<dyn MessageTokenProvider>>,
    retry: RetryPolicy,
    registry: MachineRegistry,
    last_backend: RwLock<BackendKind>,
}

/// Builder for [`RobotCopy`]. Unset collaborators fall back to the HTTP
/// transport, in-memory toggles, and the breaker/throttle described by the config.
pub struct RobotCopyBuilder {
    config: RobotCopyConfig,
    transport: Option<BoxTransport>,
    toggles: Option<Arc<dyn ToggleSource>>,
    monitor: Option<Arc<dyn ResourceMonitor>>,
    throttle: Option<Arc<ThrottlePolicy>>,
    breaker: Option<Arc<CircuitBreaker>>,
    token_provider: Option<Arc<dyn MessageTokenProvider>>,
}

impl RobotCopyBuilder {
    pub fn transport<T>(mut self, transport: T) -> Self
    where
        T: Transport + Clone + Send + 'static,
        T::Future: Send + 'static,
    {
        self.transport = Some(BoxCloneService::new(transport));
        self
    }

    pub fn toggles(mut self, toggles: Arc<dyn ToggleSource>) -> Self {
        self.toggles = Some(toggles);
        self
    }

    pub fn monitor(mut self, monitor: Arc<dyn ResourceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Overrides `config.throttle`.
    pub fn throttle_policy(mut self, throttle: Arc<ThrottlePolicy>) -> Self {
        self.throttle = Some(throttle);
        self
    }

    /// Overrides `config.circuit_breaker`.
    pub fn circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn token_provider(mut self, provider: Arc<dyn MessageTokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    pub fn build(self) -> RobotCopy {
        let monitor = self.monitor;
        let breaker = self.breaker.or_else(|| {
            self.config.circuit_breaker.clone().map(|cfg| {
                let breaker = CircuitBreaker::new(cfg);
                Arc::new(match &monitor {
                    Some(m) => breaker.with_monitor(m.clone()),
                    None => breaker,
                })
            })
        });
        let throttle = self.throttle.or_else(|| {
            self.config.throttle.clone().map(|cfg| {
                let throttle = ThrottlePolicy::new(cfg);
                Arc::new(match &monitor {
                    Some(m) => throttle.with_monitor(m.clone()),
                    None => throttle,
                })
            })
        });
        let toggles = self
            .toggles
            .unwrap_or_else(|| Arc::new(StaticToggles::with_initial(&self.config.initial_toggles)));
        let transport = self
            .transport
            .unwrap_or_else(|| BoxCloneService::new(HttpTransport::new()));

        RobotCopy {
            retry: RetryPolicy::new(self.config.retry_policy.clone()),
            config: self.config,
            tracing: Tracing::new(),
            toggles,
            transport: Mutex::new(transport),
            monitor,
            throttle,
            breaker,
            token_provider: self.token_provider,
            registry: MachineRegistry::new(),
            last_backend: RwLock::new(BackendKind::Primary),
        }
    }
}

/// Caller payload merged with the correlation ids. Non-object payloads are
/// carried under `data`.
fn request_body(data: &Value, message_id: &str, trace_id: &str, span_id: &str) -> Map<String, Value> {
    let mut body = match data {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other.clone());
            map
        }
    };
    body.insert("messageId".to_string(), json!(message_id));
    body.insert("traceId".to_string(), json!(trace_id));
    body.insert("spanId".to_string(), json!(span_id));
    body
}

/// Empty or non-JSON bodies decode to `{}`.
fn decode_body(body: &str) -> Value {
    if body.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(body).unwrap_or_else(|_| json!({}))
}

impl RobotCopy {
    pub fn new(config: RobotCopyConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: RobotCopyConfig) -> RobotCopyBuilder {
        RobotCopyBuilder {
            config,
            transport: None,
            toggles: None,
            monitor: None,
            throttle: None,
            breaker: None,
            token_provider: None,
        }
    }

    pub fn config(&self) -> &RobotCopyConfig {
        &self.config
    }

    pub fn tracing(&self) -> &Tracing {
        &self.tracing
    }

    pub fn monitor(&self) -> Option<&Arc<dyn ResourceMonitor>> {
        self.monitor.as_ref()
    }

    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    pub fn throttle_policy(&self) -> Option<&Arc<ThrottlePolicy>> {
        self.throttle.as_ref()
    }

    pub async fn is_enabled(&self, toggle: &str) -> bool {
        self.toggles.is_enabled(toggle).await
    }

    // Backend routing

    /// Resolves the active backend and caches it for [`RobotCopy::last_backend`].
    pub async fn backend_type(&self) -> BackendKind {
        let kind = match &self.config.backend_selector_toggle {
            None => BackendKind::Primary,
            Some(toggle) if self.toggles.is_enabled(toggle).await => BackendKind::Secondary,
            Some(_) => BackendKind::Primary,
        };
        *self.last_backend.write().unwrap_or_else(|e| e.into_inner()) = kind;
        kind
    }

    pub async fn backend_url(&self) -> String {
        let kind = self.backend_type().await;
        self.url_for(kind).to_string()
    }

    /// Backend chosen by the most recent resolution; primary before any.
    pub fn last_backend(&self) -> BackendKind {
        *self.last_backend.read().unwrap_or_else(|e| e.into_inner())
    }

    fn url_for(&self, kind: BackendKind) -> &str {
        match kind {
            BackendKind::Primary => &self.config.primary_backend_url,
            BackendKind::Secondary => &self.config.secondary_backend_url,
        }
    }

    fn api_path(&self, suffix: &str) -> String {
        format!("{}/{}", self.config.api_base_path.trim_end_matches('/'), suffix)
    }

    // Dispatch

    /// Sends `data` to `{backend}{api_base_path}/{action}` and returns the decoded reply.
    pub async fn send_message(&self, action: &str, data: Value) -> Result<Value> {
        if let Some(throttle) = &self.throttle {
            if throttle.is_over_limit() {
                warn!(action, "Send rejected by throttle");
                return Err(DispatchError::Throttled);
            }
        }

        match &self.breaker {
            Some(breaker) => breaker
                .execute(|| self.send_with_retry(action, &data))
                .await
                .map_err(|err| {
                    let err = DispatchError::from(err);
                    warn!(action, code = err.code(), error = %err, "Send failed");
                    err
                }),
            None => self.send_with_retry(action, &data).await.map_err(|err| {
                warn!(action, code = err.code(), error = %err, "Send failed");
                err
            }),
        }
    }

    async fn send_with_retry(&self, action: &str, data: &Value) -> Result<Value> {
        retry_async(|| self.send_once(action, data), &self.retry).await
    }

    fn message_token(&self) -> Option<MessageToken> {
        let provider = self.token_provider.as_ref()?;
        match provider.token() {
            Ok(token) => token,
            Err(err) => {
                warn!(error = %err, "Message token provider failed; sending without token");
                None
            }
        }
    }

    async fn send_once(&self, action: &str, data: &Value) -> Result<Value> {
        let message_id = self.tracing.generate_message_id();
        let trace_id = self.tracing.generate_trace_id();
        let span_id = self.tracing.generate_span_id();
        let backend = self.backend_type().await;
        let backend_url = self.url_for(backend);

        self.record(
            &message_id,
            &trace_id,
            &span_id,
            TrackedData::action(action)
                .backend(backend.as_str())
                .data(data.clone()),
        );

        let vendor = self.config.enable_datadog && self.toggles.is_enabled(ENABLE_DATADOG).await;
        let mut headers =
            self.tracing
                .create_tracing_headers(&trace_id, &span_id, &message_id, vendor);
        headers.insert("content-type".to_string(), "application/json".to_string());

        let mut body = request_body(data, &message_id, &trace_id, &span_id);
        if let Some(token) = self.message_token() {
            headers.insert(MESSAGE_TOKEN_HEADER.to_string(), serialize_token(&token)?);
            body.insert(MESSAGE_TOKEN_FIELD.to_string(), serde_json::to_value(&token)?);
        }

        let path = self.api_path(action);
        let request = TransportRequest {
            method: "POST".to_string(),
            url: format!("{}{}", backend_url, path),
            path: path.clone(),
            headers,
            body: serde_json::to_string(&Value::Object(body))?,
        };
        let bytes_in = request.body.len() as u64;

        debug!(action, message_id = %message_id, backend = %backend, "Sending message");
        let start = Instant::now();
        let response = match self.call(request).await {
            Ok(response) => response,
            Err(err) => {
                self.record_error(&message_id, &trace_id, &span_id, backend, action, &err);
                return Err(err);
            }
        };
        let latency_ms = start.elapsed().as_secs_f64() * 1_000.0;
        let bytes_out = response.body.len() as u64;

        if let Some(monitor) = &self.monitor {
            monitor.track_request(
                RequestMeta::new("POST", path)
                    .bytes(bytes_in, bytes_out)
                    .latency_ms(latency_ms)
                    .status(response.status),
            );
        }
        if let Some(throttle) = &self.throttle {
            throttle.record(bytes_in, bytes_out);
        }

        if !response.is_success() {
            let err = DispatchError::HttpStatus {
                status: response.status,
                status_text: response.status_text,
            };
            self.record_error(&message_id, &trace_id, &span_id, backend, action, &err);
            return Err(err);
        }

        let result = decode_body(&response.body);
        self.record(
            &format!("{}_response", message_id),
            &trace_id,
            &span_id,
            TrackedData::action(format!("{}_response", action))
                .backend(backend.as_str())
                .data(result.clone()),
        );
        Ok(result)
    }

    async fn call(&self, request: TransportRequest) -> Result<TransportResponse> {
        let mut transport = self
            .transport
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        transport
            .ready()
            .await
            .map_err(DispatchError::from_boxed)?
            .call(request)
            .await
            .map_err(DispatchError::from_boxed)
    }

    fn record(&self, message_id: &str, trace_id: &str, span_id: &str, tracked: TrackedData) {
        if self.config.enable_tracing {
            self.tracing.track_message(message_id, trace_id, span_id, tracked);
        }
    }

    fn record_error(
        &self,
        message_id: &str,
        trace_id: &str,
        span_id: &str,
        backend: BackendKind,
        action: &str,
        err: &DispatchError,
    ) {
        self.record(
            &format!("{}_error", message_id),
            trace_id,
            span_id,
            TrackedData::action(format!("{}_error", action))
                .backend(backend.as_str())
                .data(json!({ "error": err.to_string(), "code": err.code() })),
        );
    }

    async fn fetch(&self, suffix: &str) -> Result<Value> {
        let backend_url = self.backend_url().await;
        let path = self.api_path(suffix);
        let response = self
            .call(TransportRequest {
                method: "GET".to_string(),
                url: format!("{}{}", backend_url, path),
                path,
                headers: BTreeMap::new(),
                body: String::new(),
            })
            .await?;
        if !response.is_success() {
            return Err(DispatchError::HttpStatus {
                status: response.status,
                status_text: response.status_text,
            });
        }
        Ok(serde_json::from_str(&response.body)?)
    }

    /// Trace as known to the backend, falling back to the local history.
    pub async fn fetch_trace(&self, trace_id: &str) -> Result<Value> {
        match self.fetch(&format!("trace/{}", trace_id)).await {
            Ok(trace) => Ok(trace),
            Err(err) => {
                warn!(trace_id, error = %err, "Backend trace lookup failed; using local history");
                Ok(serde_json::to_value(self.full_trace(trace_id))?)
            }
        }
    }

    /// Message as known to the backend, falling back to the local history.
    pub async fn fetch_message(&self, message_id: &str) -> Result<Option<Value>> {
        match self.fetch(&format!("message/{}", message_id)).await {
            Ok(message) => Ok(Some(message)),
            Err(err) => {
                warn!(message_id, error = %err, "Backend message lookup failed; using local history");
                self.message(message_id)
                    .map(serde_json::to_value)
                    .transpose()
                    .map_err(Into::into)
            }
        }
    }

    // Tracing passthrough

    pub fn generate_message_id(&self) -> MessageId {
        self.tracing.generate_message_id()
    }

    pub fn generate_trace_id(&self) -> TraceId {
        self.tracing.generate_trace_id()
    }

    pub fn generate_span_id(&self) -> SpanId {
        self.tracing.generate_span_id()
    }

    pub fn track_message(
        &self,
        message_id: &str,
        trace_id: &str,
        span_id: &str,
        tracked: TrackedData,
    ) -> Message {
        self.tracing.track_message(message_id, trace_id, span_id, tracked)
    }

    pub fn message(&self, message_id: &str) -> Option<Message> {
        self.tracing.message(message_id)
    }

    pub fn trace_messages(&self, trace_id: &str) -> Vec<Message> {
        self.tracing.trace_messages(trace_id)
    }

    pub fn full_trace(&self, trace_id: &str) -> TraceInfo {
        self.tracing.full_trace(trace_id)
    }

    pub fn message_history(&self) -> Vec<Message> {
        self.tracing.message_history()
    }

    pub fn trace_ids(&self) -> Vec<TraceId> {
        self.tracing.trace_ids()
    }

    pub fn clear_history(&self) {
        self.tracing.clear_history()
    }

    // Registry passthrough

    pub fn registry(&self) -> &MachineRegistry {
        &self.registry
    }

    pub fn register_machine(
        &self,
        name: &str,
        instance: Arc<dyn Any + Send + Sync>,
        config: MachineConfig,
    ) {
        self.registry.register_machine(name, instance, config)
    }

    pub fn registered_machine(&self, name: &str) -> Option<MachineRecord> {
        self.registry.registered_machine(name)
    }

    pub fn registered_machines(&self) -> Vec<(String, MachineRecord)> {
        self.registry.registered_machines()
    }

    pub fn set_location(&self, id: &str, location: Location) {
        self.registry.set_location(id, location)
    }

    pub fn location(&self, id: &str) -> Option<Location> {
        self.registry.location(id)
    }

    pub fn register_machine_location(&self, id: &str, location: Option<&str>, remote_client: Option<Value>) {
        self.registry.register_machine_location(id, location, remote_client)
    }

    pub fn is_local(&self, id: &str) -> bool {
        self.registry.is_local(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use crate::trace::{DATADOG_TRACE_ID_HEADER, TRACE_ID_HEADER};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::{service_fn, BoxError};

    type Captured = Arc<Mutex<Vec<TransportRequest>>>;

    fn recording(status: u16, body: &'static str) -> (BoxTransport, Captured) {
        let captured: Captured = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();
        let svc = service_fn(move |req: TransportRequest| {
            sink.lock().unwrap().push(req);
            async move { Ok::<_, BoxError>(TransportResponse::with_status(status, body)) }
        });
        (BoxCloneService::new(svc), captured)
    }

    #[tokio::test]
    async fn builds_url_headers_and_body() {
        let (transport, captured) = recording(200, r#"{"ok":true}"#);
        let rc = RobotCopy::builder(
            ConfigBuilder::new()
                .primary_backend("http://node:3001")
                .api_base_path("/api/orders/")
                .build(),
        )
        .transport(transport)
        .build();

        let reply = rc.send_message("create", json!({"id": 1})).await.unwrap();
        assert_eq!(reply, json!({"ok": true}));

        let req = captured.lock().unwrap().remove(0);
        assert_eq!(req.method, "POST");
        assert_eq!(req.url, "http://node:3001/api/orders/create");
        assert_eq!(req.headers["content-type"], "application/json");
        assert!(req.headers.contains_key(DATADOG_TRACE_ID_HEADER));

        let body: Value = serde_json::from_str(&req.body).unwrap();
        assert_eq!(body["id"], 1);
        assert_eq!(body["traceId"], json!(req.headers[TRACE_ID_HEADER]));
        assert!(body["messageId"].as_str().unwrap().starts_with("msg_"));
        assert!(body.get(MESSAGE_TOKEN_FIELD).is_none());
    }

    #[tokio::test]
    async fn selector_toggle_routes_to_secondary() {
        let (transport, captured) = recording(200, "");
        let toggles = Arc::new(StaticToggles::new());
        let rc = RobotCopy::builder(
            ConfigBuilder::new()
                .primary_backend("http://node:3001")
                .secondary_backend("http://jvm:8080")
                .backend_selector_toggle("use-jvm")
                .build(),
        )
        .transport(transport)
        .toggles(toggles.clone())
        .build();

        assert_eq!(rc.backend_type().await, BackendKind::Primary);
        toggles.set("use-jvm", true);
        assert_eq!(rc.backend_url().await, "http://jvm:8080");
        assert_eq!(rc.last_backend(), BackendKind::Secondary);

        assert_eq!(rc.send_message("ping", Value::Null).await.unwrap(), json!({}));
        assert!(captured.lock().unwrap()[0].url.starts_with("http://jvm:8080/api/ping"));
    }

    #[tokio::test]
    async fn vendor_headers_need_config_and_toggle() {
        let (transport, captured) = recording(200, "{}");
        let rc = RobotCopy::builder(ConfigBuilder::new().datadog(false).build())
            .transport(transport)
            .build();
        rc.send_message("a", json!({})).await.unwrap();
        let headers = captured.lock().unwrap()[0].headers.clone();
        assert!(headers.contains_key(TRACE_ID_HEADER));
        assert!(!headers.contains_key(DATADOG_TRACE_ID_HEADER));
    }

    #[tokio::test]
    async fn tracks_request_and_response() {
        let (transport, _) = recording(200, r#"{"total":3}"#);
        let rc = RobotCopy::builder(RobotCopyConfig::default())
            .transport(transport)
            .build();
        rc.send_message("sum", json!({"a": 1})).await.unwrap();

        let trace_id = rc.trace_ids().remove(0);
        let trace = rc.full_trace(&trace_id);
        let actions: Vec<_> = trace.messages.iter().map(|m| m.action.as_str()).collect();
        assert_eq!(actions, vec!["sum", "sum_response"]);
        assert!(trace.messages[1].id.ends_with("_response"));
        assert_eq!(trace.messages[1].payload, json!({"total": 3}));
        assert_eq!(trace.backend.as_deref(), Some("primary"));
    }

    #[tokio::test]
    async fn tracing_disabled_skips_history() {
        let (transport, captured) = recording(200, "{}");
        let rc = RobotCopy::builder(ConfigBuilder::new().tracing(false).build())
            .transport(transport)
            .build();
        rc.send_message("quiet", json!({})).await.unwrap();
        assert!(rc.message_history().is_empty());
        assert!(captured.lock().unwrap()[0].headers.contains_key(TRACE_ID_HEADER));
    }

    #[tokio::test]
    async fn client_errors_are_terminal_and_tracked() {
        let (transport, captured) = recording(404, "");
        let rc = RobotCopy::builder(ConfigBuilder::new().max_retries(3).build())
            .transport(transport)
            .build();

        let err = rc.send_message("missing", json!({})).await.unwrap_err();
        assert!(matches!(err, DispatchError::HttpStatus { status: 404, .. }));
        assert_eq!(err.to_string(), "HTTP 404: Not Found");
        assert_eq!(captured.lock().unwrap().len(), 1);
        let history = rc.message_history();
        assert_eq!(history.last().unwrap().action, "missing_error");
    }

    #[tokio::test]
    async fn token_is_attached_to_header_and_body() {
        let (transport, captured) = recording(200, "{}");
        let provider = || -> std::result::Result<Option<MessageToken>, BoxError> {
            Ok(Some(MessageToken {
                salt: "s".into(),
                hash: "h".into(),
                origin_id: None,
                cave_id: None,
                tome_id: Some("orders".into()),
                expires_at: None,
            }))
        };
        let rc = RobotCopy::builder(RobotCopyConfig::default())
            .transport(transport)
            .token_provider(Arc::new(provider))
            .build();
        rc.send_message("a", json!({})).await.unwrap();

        let req = captured.lock().unwrap().remove(0);
        let header = &req.headers[MESSAGE_TOKEN_HEADER];
        assert_eq!(
            crate::token::parse_token(header).unwrap().tome_id.as_deref(),
            Some("orders")
        );
        let body: Value = serde_json::from_str(&req.body).unwrap();
        assert_eq!(body[MESSAGE_TOKEN_FIELD]["tomeId"], "orders");
    }

    #[tokio::test]
    async fn failing_token_provider_does_not_block_send() {
        let (transport, captured) = recording(200, "{}");
        let provider =
            || -> std::result::Result<Option<MessageToken>, BoxError> { Err("no key".into()) };
        let rc = RobotCopy::builder(RobotCopyConfig::default())
            .transport(transport)
            .token_provider(Arc::new(provider))
            .build();
        rc.send_message("a", json!({})).await.unwrap();
        assert!(!captured.lock().unwrap()[0].headers.contains_key(MESSAGE_TOKEN_HEADER));
    }

    #[tokio::test]
    async fn transport_failures_surface_as_transport_errors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let transport = service_fn(move |_req: TransportRequest| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Err::<TransportResponse, BoxError>("connection refused".into()) }
        });
        let mut config = ConfigBuilder::new().max_retries(1).build();
        config.retry_policy.initial_delay_ms = 1;
        let rc = RobotCopy::builder(config).transport(transport).build();

        let err = rc.send_message("a", json!({})).await.unwrap_err();
        assert_eq!(err.code(), "TRANSPORT");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fetch_trace_falls_back_to_local_history() {
        let (transport, _) = recording(503, "");
        let rc = RobotCopy::builder(RobotCopyConfig::default())
            .transport(transport)
            .build();
        let trace_id = rc.generate_trace_id();
        rc.track_message("m1", &trace_id, "s1", TrackedData::action("local"));

        let trace = rc.fetch_trace(&trace_id).await.unwrap();
        assert_eq!(trace["messages"][0]["action"], "local");
        assert_eq!(
            rc.fetch_message("m1").await.unwrap().unwrap()["id"],
            "m1"
        );
        assert!(rc.fetch_message("nope").await.unwrap().is_none());
    }

    #[test]
    fn registry_passthrough() {
        let rc = RobotCopy::new(RobotCopyConfig::default());
        rc.register_machine(
            "cart",
            Arc::new(()),
            MachineConfig {
                location: Some("remote".into()),
                ..Default::default()
            },
        );
        assert!(!rc.is_local("cart"));
        assert!(rc.is_local("other"));
        assert!(rc.registered_machine("cart").is_some());
    }
}
