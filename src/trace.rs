//! # Message Tracing
//!
//! Correlation identifiers and an in-memory message history for everything
//! RobotCopy and TomeConnector send.
//!
//! ## Core Concepts
//!
//! - **Trace**: a group of related messages, such as a request and its
//!   response, identified by a `TraceId`.
//! - **Span**: a single hop within a trace, identified by a `SpanId`.
//! - **Message**: one tracked send, keyed by its `MessageId`. Messages are
//!   immutable once recorded; the trace index is append-only.
//!
//! ### Example
//!
//! ```rust
//! use tome_link::trace::{Tracing, TrackedData};
//!
//! let tracing = Tracing::new();
//! let trace_id = tracing.generate_trace_id();
//! let span_id = tracing.generate_span_id();
//!
//! tracing.track_message("m1", &trace_id, &span_id, TrackedData::action("create-order"));
//! tracing.track_message("m1_response", &trace_id, &span_id, TrackedData::action("create-order_response"));
//!
//! let trace = tracing.full_trace(&trace_id);
//! assert_eq!(trace.messages.len(), 2);
//! assert_eq!(trace.messages[0].id, "m1");
//! ```

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use tracing::trace;

/// Identifier of a single tracked message.
pub type MessageId = String;

/// Identifier grouping related messages.
pub type TraceId = String;

/// Identifier of one hop within a trace.
pub type SpanId = String;

pub const TRACE_ID_HEADER: &str = "x-trace-id";
pub const SPAN_ID_HEADER: &str = "x-span-id";
pub const MESSAGE_ID_HEADER: &str = "x-message-id";
pub const DATADOG_TRACE_ID_HEADER: &str = "x-datadog-trace-id";
pub const DATADOG_PARENT_ID_HEADER: &str = "x-datadog-parent-id";
pub const DATADOG_SAMPLING_PRIORITY_HEADER: &str = "x-datadog-sampling-priority";

const DEFAULT_BACKEND: &str = "primary";
const UNKNOWN_ACTION: &str = "unknown";

/// `{prefix}_{epoch millis}_{9 random chars}`, unique enough within a process.
pub(crate) fn correlation_id(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("{}_{}_{}", prefix, Utc::now().timestamp_millis(), suffix)
}

/// A recorded message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub timestamp: DateTime<Utc>,
    pub backend: String,
    pub action: String,
    pub payload: Value,
}

/// Caller-supplied part of a tracked message.
#[derive(Debug, Clone, Default)]
pub struct TrackedData {
    pub backend: Option<String>,
    pub action: Option<String>,
    pub data: Option<Value>,
}

impl TrackedData {
    pub fn action(action: impl Into<String>) -> Self {
        Self {
            action: Some(action.into()),
            ..Default::default()
        }
    }

    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// All messages of one trace in tracking order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceInfo {
    pub trace_id: TraceId,
    pub messages: Vec<Message>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub backend: Option<String>,
}

#[derive(Default)]
struct History {
    messages: HashMap<MessageId, Message>,
    // Insertion order of message ids, used by `message_history`.
    order: Vec<MessageId>,
    traces: HashMap<TraceId, Vec<MessageId>>,
    trace_order: Vec<TraceId>,
}

/// In-memory message history indexed by message id and by trace id.
#[derive(Default)]
pub struct Tracing {
    history: Mutex<History>,
}

impl Tracing {
    pub fn new() -> Self {
        Self::default()
    }

    fn history(&self) -> MutexGuard<'_, History> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn generate_message_id(&self) -> MessageId {
        correlation_id("msg")
    }

    pub fn generate_trace_id(&self) -> TraceId {
        correlation_id("trace")
    }

    pub fn generate_span_id(&self) -> SpanId {
        correlation_id("span")
    }

    /// Records a message and appends its id to the trace index.
    ///
    /// An id that is already recorded keeps its first record; the stored
    /// message is returned and nothing is re-indexed.
    pub fn track_message(
        &self,
        message_id: &str,
        trace_id: &str,
        span_id: &str,
        tracked: TrackedData,
    ) -> Message {
        let mut history = self.history();
        if let Some(existing) = history.messages.get(message_id) {
            trace!(message_id, trace_id, "Message already tracked");
            return existing.clone();
        }

        let message = Message {
            id: message_id.to_string(),
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
            timestamp: Utc::now(),
            backend: tracked
                .backend
                .unwrap_or_else(|| DEFAULT_BACKEND.to_string()),
            action: tracked
                .action
                .unwrap_or_else(|| UNKNOWN_ACTION.to_string()),
            payload: tracked.data.unwrap_or(Value::Null),
        };

        trace!(message_id, trace_id, action = %message.action, "Tracked message");

        history.messages.insert(message.id.clone(), message.clone());
        history.order.push(message.id.clone());
        if !history.traces.contains_key(trace_id) {
            history.trace_order.push(trace_id.to_string());
        }
        history
            .traces
            .entry(trace_id.to_string())
            .or_default()
            .push(message.id.clone());

        message
    }

    pub fn message(&self, message_id: &str) -> Option<Message> {
        self.history().messages.get(message_id).cloned()
    }

    /// Messages of a trace in the order they were tracked.
    pub fn trace_messages(&self, trace_id: &str) -> Vec<Message> {
        let history = self.history();
        history
            .traces
            .get(trace_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| history.messages.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn full_trace(&self, trace_id: &str) -> TraceInfo {
        let messages = self.trace_messages(trace_id);
        TraceInfo {
            trace_id: trace_id.to_string(),
            start_time: messages.first().map(|m| m.timestamp),
            end_time: messages.last().map(|m| m.timestamp),
            backend: messages.first().map(|m| m.backend.clone()),
            messages,
        }
    }

    pub fn message_history(&self) -> Vec<Message> {
        let history = self.history();
        history
            .order
            .iter()
            .filter_map(|id| history.messages.get(id).cloned())
            .collect()
    }

    pub fn trace_ids(&self) -> Vec<TraceId> {
        self.history().trace_order.clone()
    }

    pub fn clear_history(&self) {
        *self.history() = History::default();
    }

    /// Correlation headers, plus the vendor triple when `enable_datadog` is set.
    pub fn create_tracing_headers(
        &self,
        trace_id: &str,
        span_id: &str,
        message_id: &str,
        enable_datadog: bool,
    ) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        headers.insert(TRACE_ID_HEADER.to_string(), trace_id.to_string());
        headers.insert(SPAN_ID_HEADER.to_string(), span_id.to_string());
        headers.insert(MESSAGE_ID_HEADER.to_string(), message_id.to_string());

        if enable_datadog {
            headers.insert(DATADOG_TRACE_ID_HEADER.to_string(), trace_id.to_string());
            headers.insert(DATADOG_PARENT_ID_HEADER.to_string(), span_id.to_string());
            headers.insert(DATADOG_SAMPLING_PRIORITY_HEADER.to_string(), "1".to_string());
        }

        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn test_id_generation_is_unique_and_prefixed() {
        let tracing = Tracing::new();
        let ids: HashSet<String> = (0..500).map(|_| tracing.generate_message_id()).collect();
        assert_eq!(ids.len(), 500);
        assert!(tracing.generate_trace_id().starts_with("trace_"));
        assert!(tracing.generate_span_id().starts_with("span_"));
    }

    #[test]
    fn test_track_message_defaults() {
        let tracing = Tracing::new();
        let msg = tracing.track_message("m1", "t1", "s1", TrackedData::default());
        assert_eq!(msg.backend, "primary");
        assert_eq!(msg.action, "unknown");
        assert_eq!(msg.payload, Value::Null);
        assert_eq!(tracing.message("m1"), Some(msg));
    }

    #[test]
    fn test_full_trace_preserves_order() {
        let tracing = Tracing::new();
        for i in 0..5 {
            tracing.track_message(
                &format!("m{}", i),
                "t1",
                "s1",
                TrackedData::action(format!("step{}", i)).data(json!({ "i": i })),
            );
        }
        tracing.track_message("other", "t2", "s2", TrackedData::action("elsewhere"));

        let trace = tracing.full_trace("t1");
        let ids: Vec<_> = trace.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m0", "m1", "m2", "m3", "m4"]);
        assert_eq!(trace.start_time, Some(trace.messages[0].timestamp));
        assert_eq!(trace.end_time, Some(trace.messages[4].timestamp));
        assert_eq!(tracing.trace_ids(), vec!["t1".to_string(), "t2".to_string()]);
    }

    #[test]
    fn test_duplicate_message_id_keeps_first_record() {
        let tracing = Tracing::new();
        let first = tracing.track_message("m1", "t1", "s1", TrackedData::action("first").data(json!(1)));
        let again = tracing.track_message("m1", "t1", "s2", TrackedData::action("second").data(json!(2)));

        assert_eq!(again, first);
        assert_eq!(tracing.message("m1"), Some(first));
        assert_eq!(tracing.full_trace("t1").messages.len(), 1);
        assert_eq!(tracing.message_history().len(), 1);
    }

    #[test]
    fn test_unknown_trace_is_empty() {
        let tracing = Tracing::new();
        let trace = tracing.full_trace("missing");
        assert!(trace.messages.is_empty());
        assert!(trace.start_time.is_none());
        assert!(trace.backend.is_none());
    }

    #[test]
    fn test_clear_history() {
        let tracing = Tracing::new();
        tracing.track_message("m1", "t1", "s1", TrackedData::action("a"));
        tracing.clear_history();
        assert!(tracing.message("m1").is_none());
        assert!(tracing.trace_messages("t1").is_empty());
        assert!(tracing.message_history().is_empty());
    }

    #[test]
    fn test_tracing_headers() {
        let tracing = Tracing::new();
        let plain = tracing.create_tracing_headers("t", "s", "m", false);
        assert_eq!(plain.len(), 3);
        assert_eq!(plain.get(TRACE_ID_HEADER).map(String::as_str), Some("t"));

        let vendor = tracing.create_tracing_headers("t", "s", "m", true);
        assert_eq!(vendor.len(), 6);
        assert_eq!(vendor.get(DATADOG_PARENT_ID_HEADER).map(String::as_str), Some("s"));
        assert_eq!(
            vendor.get(DATADOG_SAMPLING_PRIORITY_HEADER).map(String::as_str),
            Some("1")
        );
    }

    #[test]
    fn test_message_serialization() {
        let tracing = Tracing::new();
        let msg = tracing.track_message("m1", "t1", "s1", TrackedData::action("a").backend("secondary"));
        let serialized = serde_json::to_string(&msg).unwrap();
        let deserialized: Message = serde_json::from_str(&serialized).unwrap();
        assert_eq!(msg, deserialized);
    }
}
