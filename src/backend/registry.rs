//! Registry of backend constructors.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::backend::{AgentBackend, BackendSpec};
use crate::error::BackendError;

/// Builds a fresh backend for one run.
pub type BackendFactory =
    Arc<dyn Fn(&BackendSpec) -> Result<Box<dyn AgentBackend>, BackendError> + Send + Sync>;

/// Maps backend names to factories.
pub struct BackendRegistry {
    factories: RwLock<HashMap<String, BackendFactory>>,
    default_backend: String,
}

impl BackendRegistry {
    pub fn new(default_backend: impl Into<String>) -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            default_backend: default_backend.into(),
        }
    }

    /// Register a factory, replacing any previous one with the same name.
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&BackendSpec) -> Result<Box<dyn AgentBackend>, BackendError> + Send + Sync + 'static,
    {
        let name = name.into();
        let mut factories = self.factories.write().unwrap_or_else(|p| p.into_inner());
        if factories.insert(name.clone(), Arc::new(factory)).is_some() {
            tracing::warn!(backend = %name, "Replaced backend registration");
        } else {
            tracing::debug!("Registered backend: {}", name);
        }
    }

    pub fn default_backend(&self) -> &str {
        &self.default_backend
    }

    /// Name a task's backend resolves to.
    pub fn resolve_name<'a>(&'a self, requested: Option<&'a str>) -> &'a str {
        requested.unwrap_or(&self.default_backend)
    }

    pub fn has(&self, name: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(name)
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .factories
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Construct a backend. `None` selects the default.
    pub fn create(
        &self,
        name: Option<&str>,
        model: Option<String>,
    ) -> Result<Box<dyn AgentBackend>, BackendError> {
        let name = self.resolve_name(name).to_string();
        let factory = self
            .factories
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&name)
            .cloned()
            .ok_or_else(|| BackendError::UnknownBackend(name.clone()))?;
        factory(&BackendSpec { name, model })
    }
}
