//! Feature toggles consulted for backend selection and feature gating.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

/// Vendor trace headers on outgoing requests.
pub const ENABLE_DATADOG: &str = "enable-datadog";
pub const ENABLE_TRACING: &str = "enable-tracing";
/// Connector starts periodic health checks on `init`.
pub const ENABLE_HEALTH_MONITORING: &str = "enable-health-monitoring";
/// Topology validation also reports high-frequency connections.
pub const ENABLE_ADVANCED_VALIDATION: &str = "enable-advanced-validation";

/// Boolean toggle lookup. Unknown names are disabled.
#[async_trait]
pub trait ToggleSource: Send + Sync {
    async fn is_enabled(&self, name: &str) -> bool;
}

/// In-memory toggles, seeded with tracing and vendor tracing enabled.
pub struct StaticToggles {
    toggles: RwLock<HashMap<String, bool>>,
}

impl Default for StaticToggles {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticToggles {
    pub fn new() -> Self {
        let toggles = HashMap::from([
            (ENABLE_TRACING.to_string(), true),
            (ENABLE_DATADOG.to_string(), true),
        ]);
        Self {
            toggles: RwLock::new(toggles),
        }
    }

    /// Defaults overlaid with `initial`.
    pub fn with_initial(initial: &HashMap<String, bool>) -> Self {
        let toggles = Self::new();
        for (name, enabled) in initial {
            toggles.set(name, *enabled);
        }
        toggles
    }

    pub fn set(&self, name: &str, enabled: bool) {
        self.toggles
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), enabled);
    }

    pub fn get(&self, name: &str) -> bool {
        self.toggles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .copied()
            .unwrap_or(false)
    }
}

#[async_trait]
impl ToggleSource for StaticToggles {
    async fn is_enabled(&self, name: &str) -> bool {
        self.get(name)
    }
}
