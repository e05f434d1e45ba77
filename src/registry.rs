//! Named machine registrations and the local/remote location map.
//!
//! Both maps are owned by a `RobotCopy` instance. Enforcing "remote machines
//! go through `send_message`" is left to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Location hint meaning "run elsewhere, reach through a client".
pub const REMOTE: &str = "remote";
pub const LOCAL: &str = "local";
pub const SAME_CAVE: &str = "same-cave";

/// Registration options for a machine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MachineConfig {
    /// `local`, `same-cave`, `remote`, or a client address
    pub location: Option<String>,
    /// Explicit client; a string address or a structured descriptor
    pub remote_client: Option<Value>,
    pub metadata: Value,
}

#[derive(Clone)]
pub struct MachineRecord {
    pub instance: Arc<dyn Any + Send + Sync>,
    pub config: MachineConfig,
    pub registered_at: DateTime<Utc>,
}

impl MachineRecord {
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.instance.clone().downcast::<T>().ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub local: bool,
    pub client: Option<Value>,
}

impl Location {
    pub fn local() -> Self {
        Self {
            local: true,
            client: None,
        }
    }

    pub fn remote(client: impl Into<Value>) -> Self {
        Self {
            local: false,
            client: Some(client.into()),
        }
    }
}

#[derive(Default)]
pub struct MachineRegistry {
    machines: RwLock<HashMap<String, MachineRecord>>,
    locations: RwLock<HashMap<String, Location>>,
}

impl MachineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `instance` under `name` and applies the config's default location.
    pub fn register_machine(
        &self,
        name: &str,
        instance: Arc<dyn Any + Send + Sync>,
        config: MachineConfig,
    ) {
        debug!(machine = name, location = ?config.location, "Registering machine");
        if config.location.is_some() || config.remote_client.is_some() {
            self.register_machine_location(name, config.location.as_deref(), config.remote_client.clone());
        }
        self.machines
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                name.to_string(),
                MachineRecord {
                    instance,
                    config,
                    registered_at: Utc::now(),
                },
            );
    }

    pub fn registered_machine(&self, name: &str) -> Option<MachineRecord> {
        self.machines
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn registered_machines(&self) -> Vec<(String, MachineRecord)> {
        let mut all: Vec<_> = self
            .machines
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(name, record)| (name.clone(), record.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Sets or overrides the location of a machine or tome.
    pub fn set_location(&self, id: &str, location: Location) {
        self.locations
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), location);
    }

    pub fn location(&self, id: &str) -> Option<Location> {
        self.locations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Default location from a location hint; never overrides an existing entry.
    pub fn register_machine_location(
        &self,
        id: &str,
        location: Option<&str>,
        remote_client: Option<Value>,
    ) {
        let local = location != Some(REMOTE);
        let client = remote_client.or_else(|| {
            location
                .filter(|hint| *hint != LOCAL && *hint != SAME_CAVE)
                .map(|hint| Value::String(hint.to_string()))
        });
        self.locations
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(id.to_string())
            .or_insert(Location { local, client });
    }

    /// Unregistered ids are local.
    pub fn is_local(&self, id: &str) -> bool {
        self.location(id).map_or(true, |l| l.local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unregistered_ids_are_local() {
        let registry = MachineRegistry::new();
        assert!(registry.is_local("anything"));
        assert!(registry.location("anything").is_none());
    }

    #[test]
    fn register_machine_applies_default_location() {
        let registry = MachineRegistry::new();
        registry.register_machine(
            "cart",
            Arc::new(42u32),
            MachineConfig {
                location: Some(REMOTE.into()),
                remote_client: Some(json!({"baseUrl": "http://carts:9000"})),
                ..Default::default()
            },
        );

        assert!(!registry.is_local("cart"));
        assert_eq!(
            registry.location("cart").unwrap().client,
            Some(json!({"baseUrl": "http://carts:9000"}))
        );
        let record = registry.registered_machine("cart").unwrap();
        assert_eq!(*record.downcast::<u32>().unwrap(), 42);
        assert!(record.downcast::<String>().is_none());
    }

    #[test]
    fn location_hint_becomes_client_unless_local() {
        let registry = MachineRegistry::new();
        registry.register_machine_location("a", Some("same-cave"), None);
        registry.register_machine_location("b", Some("http://peer:3000"), None);

        assert_eq!(registry.location("a"), Some(Location::local()));
        let b = registry.location("b").unwrap();
        assert!(b.local);
        assert_eq!(b.client, Some(json!("http://peer:3000")));
    }

    #[test]
    fn defaults_never_override_explicit_locations() {
        let registry = MachineRegistry::new();
        registry.set_location("search", Location::remote("http://search:7000"));
        registry.register_machine("search", Arc::new(()), MachineConfig {
            location: Some(LOCAL.into()),
            ..Default::default()
        });
        assert!(!registry.is_local("search"));

        registry.set_location("search", Location::local());
        assert!(registry.is_local("search"));
    }

    #[test]
    fn registered_machines_are_listed_by_name() {
        let registry = MachineRegistry::new();
        registry.register_machine("b", Arc::new(()), MachineConfig::default());
        registry.register_machine("a", Arc::new(()), MachineConfig::default());
        let names: Vec<_> = registry.registered_machines().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(registry.is_local("a"));
    }
}
