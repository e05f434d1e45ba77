//! The machine seam: what the connector needs from a state machine.
//!
//! Machines are opaque. They accept envelopes through `send`, publish events
//! and state changes to listeners registered with `on`, and expose a
//! best-effort `get_state`. Forwarded items travel as an [`Envelope`]: the
//! event itself plus typed provenance in [`ForwardMeta`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tower::BoxError;

/// Event type used for state synchronization.
pub const SYNC_STATE: &str = "SYNC_STATE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
}

impl MachineEvent {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }

    pub fn named(event_type: impl Into<String>) -> Self {
        Self::new(event_type, Value::Null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Backward => "backward",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provenance attached to forwarded and broadcast events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardMeta {
    pub forwarded: bool,
    pub broadcasted: bool,
    pub direction: Option<Direction>,
    /// Name of the machine the event came from
    pub source: Option<String>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub connection_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: MachineEvent,
    #[serde(default)]
    pub meta: ForwardMeta,
}

impl Envelope {
    /// An event with empty metadata, as a machine would emit it.
    pub fn new(event: MachineEvent) -> Self {
        Self {
            event,
            meta: ForwardMeta::default(),
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event.event_type
    }
}

impl From<MachineEvent> for Envelope {
    fn from(event: MachineEvent) -> Self {
        Envelope::new(event)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub new_state: Value,
    pub old_state: Value,
}

pub type EventHandler = Arc<dyn Fn(&Envelope) + Send + Sync>;
pub type StateHandler = Arc<dyn Fn(&StateChange) + Send + Sync>;

/// What a listener subscribes to.
#[derive(Clone)]
pub enum Listener {
    Event(EventHandler),
    StateChange(StateHandler),
}

/// Handle returned by [`Machine::on`]. Dropping it keeps the listener
/// installed; call [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// For machines that cannot remove listeners.
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// An opaque state machine instance.
pub trait Machine: Send + Sync {
    /// Identity used in topology and provenance.
    fn name(&self) -> &str;

    fn send(&self, event: Envelope) -> Result<(), BoxError>;

    fn on(&self, listener: Listener) -> Subscription;

    /// `Ok(None)` means the machine has no usable state.
    fn get_state(&self) -> Result<Option<Value>, BoxError>;
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    events: Vec<(u64, EventHandler)>,
    states: Vec<(u64, StateHandler)>,
}

/// Subscribe/emit bookkeeping for machine implementations.
///
/// Handlers run in subscription order, outside the internal lock, so a
/// handler may send to other machines or subscribe again.
#[derive(Clone, Default)]
pub struct ListenerSet {
    inner: Arc<Mutex<Listeners>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(inner: &Mutex<Listeners>) -> MutexGuard<'_, Listeners> {
        inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self, listener: Listener) -> Subscription {
        let id = {
            let mut listeners = Self::lock(&self.inner);
            let id = listeners.next_id;
            listeners.next_id += 1;
            match listener {
                Listener::Event(handler) => listeners.events.push((id, handler)),
                Listener::StateChange(handler) => listeners.states.push((id, handler)),
            }
            id
        };
        let weak: Weak<Mutex<Listeners>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                let mut listeners = Self::lock(&inner);
                listeners.events.retain(|(i, _)| *i != id);
                listeners.states.retain(|(i, _)| *i != id);
            }
        })
    }

    pub fn emit_event(&self, envelope: &Envelope) {
        let handlers: Vec<EventHandler> = Self::lock(&self.inner)
            .events
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            handler(envelope);
        }
    }

    pub fn emit_state_change(&self, change: &StateChange) {
        let handlers: Vec<StateHandler> = Self::lock(&self.inner)
            .states
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            handler(change);
        }
    }

    /// Installed listeners of both kinds.
    pub fn len(&self) -> usize {
        let listeners = Self::lock(&self.inner);
        listeners.events.len() + listeners.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
