//! Backend-specific state transforms, keyed by backend id.
//!
//! Adding a backend means registering a function; unknown backends pass
//! state through unchanged.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub type StateTransform = Arc<dyn Fn(Value) -> Value + Send + Sync>;

#[derive(Clone, Default)]
pub struct BackendTransforms {
    transforms: HashMap<String, StateTransform>,
}

impl BackendTransforms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, backend: impl Into<String>, transform: F)
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.transforms.insert(backend.into(), Arc::new(transform));
    }

    pub fn with<F>(mut self, backend: impl Into<String>, transform: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.register(backend, transform);
        self
    }

    pub fn contains(&self, backend: &str) -> bool {
        self.transforms.contains_key(backend)
    }

    pub fn apply(&self, backend: &str, state: Value) -> Value {
        match self.transforms.get(backend) {
            Some(transform) => transform(state),
            None => state,
        }
    }
}

impl fmt::Debug for BackendTransforms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut backends: Vec<_> = self.transforms.keys().collect();
        backends.sort();
        f.debug_struct("BackendTransforms")
            .field("backends", &backends)
            .finish()
    }
}
