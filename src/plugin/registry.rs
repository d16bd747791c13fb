//! In-memory registry of plugins, indexed by name and by step type.

use super::{Plugin, PluginManifest};
use crate::errors::EngineError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Maps plugin names to handlers and step types to plugin names.
///
/// Registration is additive; names and step types may not be replaced.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: RwLock<HashMap<String, Arc<dyn Plugin>>>,
    step_types: RwLock<HashMap<String, String>>,
}

impl PluginRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plugin under its manifest name and claims its step
    /// types.
    ///
    /// # Errors
    ///
    /// Returns `Duplicate` when the name or any advertised step type is
    /// already claimed; nothing is registered in that case.
    pub fn register(&self, plugin: Arc<dyn Plugin>) -> Result<(), EngineError> {
        let manifest = plugin.manifest();

        let mut plugins = self.plugins.write();
        let mut step_types = self.step_types.write();

        if plugins.contains_key(&manifest.name) {
            return Err(EngineError::duplicate("plugin", &manifest.name));
        }
        for step_type in &manifest.step_types {
            if step_types.contains_key(step_type) {
                return Err(EngineError::duplicate("step type", step_type));
            }
        }

        for step_type in &manifest.step_types {
            step_types.insert(step_type.clone(), manifest.name.clone());
        }
        debug!(
            plugin = %manifest.name,
            step_types = ?manifest.step_types,
            "plugin registered"
        );
        plugins.insert(manifest.name, plugin);
        Ok(())
    }

    /// Looks up a plugin by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.read().get(name).cloned()
    }

    /// Resolves a step type to its handling plugin.
    #[must_use]
    pub fn resolve(&self, step_type: &str) -> Option<Arc<dyn Plugin>> {
        let name = self.step_types.read().get(step_type).cloned()?;
        self.get(&name)
    }

    /// Whether any plugin handles the given step type.
    #[must_use]
    pub fn handles(&self, step_type: &str) -> bool {
        self.step_types.read().contains_key(step_type)
    }

    /// Manifests of all registered plugins.
    #[must_use]
    pub fn manifests(&self) -> Vec<PluginManifest> {
        self.plugins
            .read()
            .values()
            .map(|p| p.manifest())
            .collect()
    }

    /// Number of registered plugins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.read().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.read().is_empty()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.plugins.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockPlugin;

    #[test]
    fn test_register_and_resolve() {
        let registry = PluginRegistry::new();
        registry
            .register(Arc::new(MockPlugin::new("builder", ["shell", "docker"])))
            .unwrap();

        assert!(registry.handles("shell"));
        assert!(registry.handles("docker"));
        assert!(!registry.handles("deploy"));
        assert!(registry.resolve("shell").is_some());
        assert_eq!(registry.resolve("shell").unwrap().manifest().name, "builder");
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = PluginRegistry::new();
        registry
            .register(Arc::new(MockPlugin::new("builder", ["shell"])))
            .unwrap();
        let err = registry
            .register(Arc::new(MockPlugin::new("builder", ["other"])))
            .unwrap_err();
        assert!(matches!(err, EngineError::Duplicate { kind: "plugin", .. }));
    }

    #[test]
    fn test_duplicate_step_type_rejected() {
        let registry = PluginRegistry::new();
        registry
            .register(Arc::new(MockPlugin::new("a", ["shell"])))
            .unwrap();
        let err = registry
            .register(Arc::new(MockPlugin::new("b", ["shell"])))
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Duplicate {
                kind: "step type",
                ..
            }
        ));
        // The failed registration left nothing behind.
        assert!(registry.get("b").is_none());
    }

    #[test]
    fn test_manifests() {
        let registry = PluginRegistry::new();
        registry
            .register(Arc::new(MockPlugin::new("a", ["t1"])))
            .unwrap();
        registry
            .register(Arc::new(MockPlugin::new("b", ["t2"])))
            .unwrap();

        let mut names: Vec<String> = registry.manifests().into_iter().map(|m| m.name).collect();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
    }
}
