//! # TomeConnector
//!
//! Links pairs of machines so that events and state fragments flow between
//! them, and derives a validatable topology from the live links.
//!
//! ## Forwarding
//!
//! `connect(source, target, config)` installs listeners on the source (and on
//! the target when bidirectional; that direction uses the inverted mappings):
//!
//! - **events**: allow-list on the original type, optional transformer, type
//!   remap through `event_mapping`, then `target.send` with [`ForwardMeta`]
//!   provenance
//! - **state**: skipped unless an allow-listed path changed; optional
//!   transformer, backend transform, then each `state_mapping` pair is
//!   projected by dotted-path lookup into one `SYNC_STATE` event
//!
//! Forwarding is synchronous with the source's emission and best-effort: a
//! failing transformer or `send` is logged and only affects that connection.
//! Listeners hold weak references, and `disconnect` unsubscribes them.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tome_link::connector::{ConnectionConfig, Machine, TomeConnector};
//!
//! # fn wire(cart: Arc<dyn Machine>, checkout: Arc<dyn Machine>) {
//! let connector = TomeConnector::new();
//! let id = connector.connect(
//!     cart,
//!     checkout,
//!     ConnectionConfig::new()
//!         .map_event("ADD_ITEM", "CART_CHANGED")
//!         .map_state("items.count", "cart.size"),
//! );
//! assert!(connector.disconnect(&id));
//! # }
//! ```

pub mod health;
pub mod machine;
pub mod topology;
pub mod transform;

pub use health::HealthSummary;
pub use machine::{
    Direction, Envelope, EventHandler, ForwardMeta, Listener, ListenerSet, Machine, MachineEvent,
    StateChange, StateHandler, Subscription, SYNC_STATE,
};
pub use topology::{
    HealthStatus, NetworkTopology, TopologyEdge, TopologyMetrics, ValidationReport,
};
pub use transform::{BackendTransforms, StateTransform};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tower::BoxError;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::{HealthCheckConfig, ValidationThresholds};
use crate::registry::MachineConfig;
use crate::robot_copy::RobotCopy;
use crate::toggles::{ENABLE_ADVANCED_VALIDATION, ENABLE_HEALTH_MONITORING};
use crate::trace::{correlation_id, TrackedData};

/// Name the connector registers under in RobotCopy.
pub const CONNECTOR_MACHINE_NAME: &str = "tome-connector";

pub type EventTransformer =
    Arc<dyn Fn(MachineEvent, Direction) -> Result<MachineEvent, BoxError> + Send + Sync>;
pub type StateTransformer = Arc<dyn Fn(Value, Direction) -> Result<Value, BoxError> + Send + Sync>;

/// Dotted-path lookup (`a.b.0.c`). Missing keys and indexes yield `None`.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, key| match current {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionFilters {
    /// Event types that may be forwarded; all when unset
    pub events: Option<Vec<String>>,
    /// State paths whose change triggers a sync; any change when unset
    pub states: Option<Vec<String>>,
}

/// Options for [`TomeConnector::connect`].
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Source event type -> target event type
    pub event_mapping: BTreeMap<String, String>,
    /// Source state path -> target state path
    pub state_mapping: BTreeMap<String, String>,
    pub bidirectional: bool,
    pub filters: ConnectionFilters,
    pub event_transformer: Option<EventTransformer>,
    pub state_transformer: Option<StateTransformer>,
    /// Trace through RobotCopy when one is attached
    pub enable_tracing: bool,
    pub custom_trace_id: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            event_mapping: BTreeMap::new(),
            state_mapping: BTreeMap::new(),
            bidirectional: true,
            filters: ConnectionFilters::default(),
            event_transformer: None,
            state_transformer: None,
            enable_tracing: true,
            custom_trace_id: None,
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("event_mapping", &self.event_mapping)
            .field("state_mapping", &self.state_mapping)
            .field("bidirectional", &self.bidirectional)
            .field("filters", &self.filters)
            .field("event_transformer", &self.event_transformer.is_some())
            .field("state_transformer", &self.state_transformer.is_some())
            .field("enable_tracing", &self.enable_tracing)
            .field("custom_trace_id", &self.custom_trace_id)
            .finish()
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map_event(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.event_mapping.insert(source.into(), target.into());
        self
    }

    pub fn map_state(mut self, source_path: impl Into<String>, target_path: impl Into<String>) -> Self {
        self.state_mapping.insert(source_path.into(), target_path.into());
        self
    }

    pub fn bidirectional(mut self, bidirectional: bool) -> Self {
        self.bidirectional = bidirectional;
        self
    }

    pub fn filter_events<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filters.events = Some(events.into_iter().map(Into::into).collect());
        self
    }

    pub fn filter_states<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filters.states = Some(paths.into_iter().map(Into::into).collect());
        self
    }

    pub fn event_transformer<F>(mut self, transformer: F) -> Self
    where
        F: Fn(MachineEvent, Direction) -> Result<MachineEvent, BoxError> + Send + Sync + 'static,
    {
        self.event_transformer = Some(Arc::new(transformer));
        self
    }

    pub fn state_transformer<F>(mut self, transformer: F) -> Self
    where
        F: Fn(Value, Direction) -> Result<Value, BoxError> + Send + Sync + 'static,
    {
        self.state_transformer = Some(Arc::new(transformer));
        self
    }

    pub fn tracing(mut self, enabled: bool) -> Self {
        self.enable_tracing = enabled;
        self
    }

    pub fn trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.custom_trace_id = Some(trace_id.into());
        self
    }
}

fn invert(mapping: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    mapping
        .iter()
        .map(|(k, v)| (v.clone(), k.clone()))
        .collect()
}

#[derive(Debug, Clone, Copy)]
struct Activity {
    last_activity: DateTime<Utc>,
    last_instant: Instant,
    health: HealthStatus,
}

/// A live link. Only the connector holds strong references.
pub(crate) struct Connection {
    id: String,
    source: Arc<dyn Machine>,
    target: Arc<dyn Machine>,
    event_mapping: BTreeMap<String, String>,
    state_mapping: BTreeMap<String, String>,
    bidirectional: bool,
    filters: ConnectionFilters,
    event_transformer: Option<EventTransformer>,
    state_transformer: Option<StateTransformer>,
    traced: bool,
    trace_id: Option<String>,
    span_id: Option<String>,
    created_at: DateTime<Utc>,
    activity: Mutex<Activity>,
}

impl Connection {
    fn activity(&self) -> MutexGuard<'_, Activity> {
        self.activity.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn touch(&self) {
        let mut activity = self.activity();
        activity.last_activity = Utc::now();
        activity.last_instant = Instant::now();
    }

    pub(crate) fn idle(&self) -> Duration {
        self.activity().last_instant.elapsed()
    }

    pub(crate) fn set_health(&self, health: HealthStatus) {
        self.activity().health = health;
    }

    /// (from, to) for a forwarding direction.
    fn endpoints(&self, direction: Direction) -> (&Arc<dyn Machine>, &Arc<dyn Machine>) {
        match direction {
            Direction::Forward => (&self.source, &self.target),
            Direction::Backward => (&self.target, &self.source),
        }
    }

    fn involves(&self, name: &str) -> bool {
        self.source.name() == name || self.target.name() == name
    }

    fn info(&self) -> ConnectionInfo {
        let activity = *self.activity();
        ConnectionInfo {
            id: self.id.clone(),
            source: self.source.name().to_string(),
            target: self.target.name().to_string(),
            event_mapping: self.event_mapping.clone(),
            state_mapping: self.state_mapping.clone(),
            bidirectional: self.bidirectional,
            filters: self.filters.clone(),
            trace_id: self.trace_id.clone(),
            span_id: self.span_id.clone(),
            created_at: self.created_at,
            last_activity: activity.last_activity,
            health_status: activity.health,
        }
    }

    fn edge(&self) -> TopologyEdge {
        let activity = *self.activity();
        TopologyEdge {
            id: self.id.clone(),
            from: self.source.name().to_string(),
            to: self.target.name().to_string(),
            bidirectional: self.bidirectional,
            health_status: activity.health,
            event_mapping: self.event_mapping.clone(),
            trace_id: self.trace_id.clone(),
            created_at: self.created_at,
            last_activity: activity.last_activity,
        }
    }
}

/// Read-only view of a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: String,
    pub source: String,
    pub target: String,
    pub event_mapping: BTreeMap<String, String>,
    pub state_mapping: BTreeMap<String, String>,
    pub bidirectional: bool,
    pub filters: ConnectionFilters,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub health_status: HealthStatus,
}

pub(crate) struct Inner {
    id: String,
    // Creation order.
    connections: RwLock<Vec<Arc<Connection>>>,
    subscriptions: Mutex<HashMap<String, Vec<Subscription>>>,
    robot_copy: Option<Arc<RobotCopy>>,
    transforms: RwLock<BackendTransforms>,
    thresholds: RwLock<ValidationThresholds>,
    health_config: RwLock<HealthCheckConfig>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let task = self
            .health_task
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl Inner {
    fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Trace ids for one forwarded item, when the connection is traced.
    fn trace_context(&self, connection: &Connection) -> Option<(&RobotCopy, String, String)> {
        if !connection.traced {
            return None;
        }
        let robot_copy = self.robot_copy.as_deref()?;
        Some((
            robot_copy,
            robot_copy.generate_trace_id(),
            robot_copy.generate_span_id(),
        ))
    }

    fn forward_event(
        &self,
        connection: &Connection,
        direction: Direction,
        mapping: &BTreeMap<String, String>,
        envelope: &Envelope,
    ) {
        let (from, to) = connection.endpoints(direction);
        let original_type = envelope.event_type();

        if let Some(allowed) = &connection.filters.events {
            if !allowed.iter().any(|t| t == original_type) {
                trace!(connection_id = %connection.id, event = original_type, "Event filtered");
                return;
            }
        }

        let mut event = envelope.event.clone();
        if let Some(transformer) = &connection.event_transformer {
            event = match transformer(event, direction) {
                Ok(event) => event,
                Err(err) => {
                    warn!(connection_id = %connection.id, error = %err, "Event transformer failed");
                    return;
                }
            };
        }
        if let Some(mapped) = mapping.get(&event.event_type) {
            event.event_type = mapped.clone();
        }

        let mut meta = ForwardMeta {
            forwarded: true,
            direction: Some(direction),
            source: Some(from.name().to_string()),
            ..Default::default()
        };
        if let Some((robot_copy, trace_id, span_id)) = self.trace_context(connection) {
            robot_copy.track_message(
                &format!("event_{}", robot_copy.generate_message_id()),
                &trace_id,
                &span_id,
                TrackedData::action("event_forwarded").data(json!({
                    "eventType": original_type,
                    "source": from.name(),
                    "target": to.name(),
                    "direction": direction,
                    "connectionId": connection.id,
                })),
            );
            meta.trace_id = Some(trace_id);
            meta.span_id = Some(span_id);
            meta.connection_id = Some(connection.id.clone());
            meta.timestamp = Some(Utc::now());
        }

        debug!(
            connection_id = %connection.id,
            from = from.name(),
            to = to.name(),
            event = %event.event_type,
            %direction,
            "Forwarding event"
        );
        match to.send(Envelope { event, meta }) {
            Ok(()) => connection.touch(),
            Err(err) => warn!(connection_id = %connection.id, error = %err, "Event forwarding failed"),
        }
    }

    fn forward_state(
        &self,
        connection: &Connection,
        direction: Direction,
        mapping: &BTreeMap<String, String>,
        change: &StateChange,
    ) {
        let (from, to) = connection.endpoints(direction);

        if let Some(paths) = &connection.filters.states {
            let changed = paths
                .iter()
                .any(|p| lookup(&change.new_state, p) != lookup(&change.old_state, p));
            if !changed {
                trace!(connection_id = %connection.id, "No watched state path changed");
                return;
            }
        }

        let mut state = change.new_state.clone();
        if let Some(transformer) = &connection.state_transformer {
            state = match transformer(state, direction) {
                Ok(state) => state,
                Err(err) => {
                    warn!(connection_id = %connection.id, error = %err, "State transformer failed");
                    return;
                }
            };
        }
        if let Some(robot_copy) = &self.robot_copy {
            let backend = robot_copy.last_backend();
            state = self
                .transforms
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .apply(backend.as_str(), state);
        }

        let updates: Map<String, Value> = mapping
            .iter()
            .filter_map(|(source_path, target_path)| {
                lookup(&state, source_path).map(|v| (target_path.clone(), v.clone()))
            })
            .collect();
        if updates.is_empty() {
            return;
        }

        let mut meta = ForwardMeta {
            forwarded: true,
            direction: Some(direction),
            source: Some(from.name().to_string()),
            ..Default::default()
        };
        if let Some((robot_copy, trace_id, span_id)) = self.trace_context(connection) {
            robot_copy.track_message(
                &format!("state_sync_{}", robot_copy.generate_message_id()),
                &trace_id,
                &span_id,
                TrackedData::action("state_synchronized").data(json!({
                    "updates": updates.keys().collect::<Vec<_>>(),
                    "source": from.name(),
                    "target": to.name(),
                    "direction": direction,
                    "connectionId": connection.id,
                })),
            );
            meta.trace_id = Some(trace_id);
            meta.span_id = Some(span_id);
            meta.connection_id = Some(connection.id.clone());
            meta.timestamp = Some(Utc::now());
        }

        debug!(
            connection_id = %connection.id,
            from = from.name(),
            to = to.name(),
            paths = updates.len(),
            %direction,
            "Synchronizing state"
        );
        let event = MachineEvent::new(SYNC_STATE, Value::Object(updates));
        match to.send(Envelope { event, meta }) {
            Ok(()) => connection.touch(),
            Err(err) => warn!(connection_id = %connection.id, error = %err, "State sync failed"),
        }
    }
}

fn event_listener(
    inner: Weak<Inner>,
    connection: Weak<Connection>,
    direction: Direction,
    mapping: BTreeMap<String, String>,
) -> Listener {
    Listener::Event(Arc::new(move |envelope: &Envelope| {
        let (Some(inner), Some(connection)) = (inner.upgrade(), connection.upgrade()) else {
            return;
        };
        inner.forward_event(&connection, direction, &mapping, envelope);
    }))
}

fn state_listener(
    inner: Weak<Inner>,
    connection: Weak<Connection>,
    direction: Direction,
    mapping: BTreeMap<String, String>,
) -> Listener {
    Listener::StateChange(Arc::new(move |change: &StateChange| {
        let (Some(inner), Some(connection)) = (inner.upgrade(), connection.upgrade()) else {
            return;
        };
        inner.forward_state(&connection, direction, &mapping, change);
    }))
}

/// Weak handle stored in the RobotCopy registry.
#[derive(Clone)]
pub struct WeakTomeConnector {
    inner: Weak<Inner>,
}

impl WeakTomeConnector {
    pub fn upgrade(&self) -> Option<TomeConnector> {
        self.inner.upgrade().map(|inner| TomeConnector { inner })
    }
}

/// Cheap to clone; clones share the same connection set.
#[derive(Clone)]
pub struct TomeConnector {
    pub(crate) inner: Arc<Inner>,
}

impl Default for TomeConnector {
    fn default() -> Self {
        Self::build(None)
    }
}

impl TomeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches RobotCopy for tracing and health reports, and registers the
    /// connector there as [`CONNECTOR_MACHINE_NAME`].
    pub fn with_robot_copy(robot_copy: Arc<RobotCopy>) -> Self {
        let connector = Self::build(Some(robot_copy.clone()));
        robot_copy.register_machine(
            CONNECTOR_MACHINE_NAME,
            Arc::new(connector.downgrade()),
            MachineConfig {
                metadata: json!({
                    "type": "connector",
                    "id": connector.id(),
                    "capabilities": ["event-routing", "state-sync", "network-topology"],
                    "version": env!("CARGO_PKG_VERSION"),
                }),
                ..Default::default()
            },
        );
        connector
    }

    fn build(robot_copy: Option<Arc<RobotCopy>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4().to_string(),
                connections: RwLock::new(Vec::new()),
                subscriptions: Mutex::new(HashMap::new()),
                robot_copy,
                transforms: RwLock::new(BackendTransforms::default()),
                thresholds: RwLock::new(ValidationThresholds::default()),
                health_config: RwLock::new(HealthCheckConfig::default()),
                health_task: Mutex::new(None),
            }),
        }
    }

    /// Starts health monitoring when the `enable-health-monitoring` toggle is on.
    pub async fn init(&self) {
        let Some(robot_copy) = &self.inner.robot_copy else {
            return;
        };
        if robot_copy.is_enabled(ENABLE_HEALTH_MONITORING).await && !self.is_health_monitoring() {
            let config = self
                .inner
                .health_config
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            self.start_health_monitoring(config);
        }
    }

    /// Instance id, reported with health checks.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn downgrade(&self) -> WeakTomeConnector {
        WeakTomeConnector {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn robot_copy(&self) -> Option<&Arc<RobotCopy>> {
        self.inner.robot_copy.as_ref()
    }

    pub fn set_backend_transforms(&self, transforms: BackendTransforms) {
        *self.inner.transforms.write().unwrap_or_else(|e| e.into_inner()) = transforms;
    }

    pub fn register_backend_transform<F>(&self, backend: impl Into<String>, transform: F)
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.inner
            .transforms
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .register(backend, transform);
    }

    pub fn set_validation_thresholds(&self, thresholds: ValidationThresholds) {
        *self.inner.thresholds.write().unwrap_or_else(|e| e.into_inner()) = thresholds;
    }

    /// Links `source` to `target` and returns the new connection id.
    pub fn connect(
        &self,
        source: Arc<dyn Machine>,
        target: Arc<dyn Machine>,
        config: ConnectionConfig,
    ) -> String {
        let id = correlation_id("connection");
        let now = Utc::now();

        let traced = config.enable_tracing && self.inner.robot_copy.is_some();
        let (trace_id, span_id) = match (&self.inner.robot_copy, traced) {
            (Some(robot_copy), true) => {
                let trace_id = config
                    .custom_trace_id
                    .clone()
                    .unwrap_or_else(|| robot_copy.generate_trace_id());
                let span_id = robot_copy.generate_span_id();
                robot_copy.track_message(
                    &id,
                    &trace_id,
                    &span_id,
                    TrackedData::action("connection_created").data(json!({
                        "source": source.name(),
                        "target": target.name(),
                        "eventMapping": config.event_mapping,
                        "stateMapping": config.state_mapping,
                        "bidirectional": config.bidirectional,
                        "timestamp": now,
                    })),
                );
                (Some(trace_id), Some(span_id))
            }
            _ => (None, None),
        };

        let connection = Arc::new(Connection {
            id: id.clone(),
            source: source.clone(),
            target: target.clone(),
            event_mapping: config.event_mapping,
            state_mapping: config.state_mapping,
            bidirectional: config.bidirectional,
            filters: config.filters,
            event_transformer: config.event_transformer,
            state_transformer: config.state_transformer,
            traced,
            trace_id,
            span_id,
            created_at: now,
            activity: Mutex::new(Activity {
                last_activity: now,
                last_instant: Instant::now(),
                health: HealthStatus::Healthy,
            }),
        });

        let inner = Arc::downgrade(&self.inner);
        let weak = Arc::downgrade(&connection);
        let mut subscriptions = vec![
            source.on(event_listener(
                inner.clone(),
                weak.clone(),
                Direction::Forward,
                connection.event_mapping.clone(),
            )),
            source.on(state_listener(
                inner.clone(),
                weak.clone(),
                Direction::Forward,
                connection.state_mapping.clone(),
            )),
        ];
        if connection.bidirectional {
            subscriptions.push(target.on(event_listener(
                inner.clone(),
                weak.clone(),
                Direction::Backward,
                invert(&connection.event_mapping),
            )));
            subscriptions.push(target.on(state_listener(
                inner,
                weak,
                Direction::Backward,
                invert(&connection.state_mapping),
            )));
        }

        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), subscriptions);
        self.inner
            .connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(connection);

        info!(
            connection_id = %id,
            source = source.name(),
            target = target.name(),
            bidirectional = config.bidirectional,
            "Connected machines"
        );
        id
    }

    /// Removes the connection and its listeners. False if unknown.
    pub fn disconnect(&self, connection_id: &str) -> bool {
        let removed = {
            let mut connections = self
                .inner
                .connections
                .write()
                .unwrap_or_else(|e| e.into_inner());
            let idx = connections.iter().position(|c| c.id == connection_id);
            idx.map(|idx| connections.remove(idx))
        };
        let Some(connection) = removed else {
            return false;
        };

        let subscriptions = self
            .inner
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(connection_id)
            .unwrap_or_default();
        for subscription in subscriptions {
            subscription.unsubscribe();
        }

        if let Some(robot_copy) = &self.inner.robot_copy {
            let duration_ms = (Utc::now() - connection.created_at).num_milliseconds();
            robot_copy.track_message(
                &format!("disconnect_{}", connection_id),
                &robot_copy.generate_trace_id(),
                &robot_copy.generate_span_id(),
                TrackedData::action("connection_disconnected").data(json!({
                    "connectionId": connection_id,
                    "source": connection.source.name(),
                    "target": connection.target.name(),
                    "durationMs": duration_ms,
                    "timestamp": Utc::now(),
                })),
            );
        }

        info!(
            connection_id,
            source = connection.source.name(),
            target = connection.target.name(),
            "Disconnected machines"
        );
        true
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.inner.snapshot().iter().map(|c| c.info()).collect()
    }

    pub fn connection(&self, connection_id: &str) -> Option<ConnectionInfo> {
        self.inner
            .snapshot()
            .iter()
            .find(|c| c.id == connection_id)
            .map(|c| c.info())
    }

    /// Connections with `machine_name` at either end.
    pub fn connections_for(&self, machine_name: &str) -> Vec<ConnectionInfo> {
        self.inner
            .snapshot()
            .iter()
            .filter(|c| c.involves(machine_name))
            .map(|c| c.info())
            .collect()
    }

    /// Ring: each machine to the next, closed back to the first for three or more.
    pub fn create_network(&self, machines: &[Arc<dyn Machine>], config: ConnectionConfig) -> Vec<String> {
        let mut ids: Vec<String> = machines
            .windows(2)
            .map(|pair| self.connect(pair[0].clone(), pair[1].clone(), config.clone()))
            .collect();
        if machines.len() > 2 {
            let (first, last) = (&machines[0], &machines[machines.len() - 1]);
            ids.push(self.connect(last.clone(), first.clone(), config));
        }
        ids
    }

    /// Hub to each spoke, one connection per spoke.
    pub fn create_hub_network(
        &self,
        hub: Arc<dyn Machine>,
        spokes: &[Arc<dyn Machine>],
        config: ConnectionConfig,
    ) -> Vec<String> {
        spokes
            .iter()
            .map(|spoke| self.connect(hub.clone(), spoke.clone(), config.clone()))
            .collect()
    }

    /// Sends `event` to the other end of every connection touching `source`.
    /// Returns how many machines accepted it.
    pub fn broadcast_event(&self, event: MachineEvent, source: &dyn Machine) -> usize {
        let source_name = source.name();
        let connections: Vec<_> = self
            .inner
            .snapshot()
            .into_iter()
            .filter(|c| c.involves(source_name))
            .collect();

        let mut meta = ForwardMeta {
            broadcasted: true,
            source: Some(source_name.to_string()),
            ..Default::default()
        };
        if let Some(robot_copy) = &self.inner.robot_copy {
            let trace_id = robot_copy.generate_trace_id();
            let span_id = robot_copy.generate_span_id();
            robot_copy.track_message(
                &format!("broadcast_{}", robot_copy.generate_message_id()),
                &trace_id,
                &span_id,
                TrackedData::action("event_broadcasted").data(json!({
                    "eventType": event.event_type,
                    "source": source_name,
                    "targetCount": connections.len(),
                })),
            );
            meta.trace_id = Some(trace_id);
            meta.span_id = Some(span_id);
            meta.timestamp = Some(Utc::now());
        }

        let mut delivered = 0;
        for connection in connections {
            let other = if connection.source.name() == source_name {
                &connection.target
            } else {
                &connection.source
            };
            let envelope = Envelope {
                event: event.clone(),
                meta: meta.clone(),
            };
            match other.send(envelope) {
                Ok(()) => {
                    connection.touch();
                    delivered += 1;
                }
                Err(err) => warn!(
                    connection_id = %connection.id,
                    machine = other.name(),
                    error = %err,
                    "Broadcast delivery failed"
                ),
            }
        }
        delivered
    }

    pub fn network_topology(&self) -> NetworkTopology {
        NetworkTopology::from_edges(self.inner.snapshot().iter().map(|c| c.edge()).collect())
    }

    /// Structural check of the current topology; advanced checks follow the
    /// `enable-advanced-validation` toggle.
    pub async fn validate_network(&self) -> ValidationReport {
        let advanced = match &self.inner.robot_copy {
            Some(robot_copy) => robot_copy.is_enabled(ENABLE_ADVANCED_VALIDATION).await,
            None => false,
        };
        let thresholds = self
            .inner
            .thresholds
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let report = self.network_topology().validate(&thresholds, advanced);
        if !report.errors.is_empty() {
            warn!(errors = report.errors.len(), "Network validation found errors");
        }
        report
    }

    /// Stops health checks and disconnects everything.
    pub fn destroy(&self) {
        self.stop_health_monitoring();
        let ids: Vec<String> = self.inner.snapshot().iter().map(|c| c.id.clone()).collect();
        for id in ids {
            self.disconnect(&id);
        }
        info!("Connector destroyed");
    }
}
