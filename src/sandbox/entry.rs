//! Typed plugin entry points.
//!
//! Plugin code enters the runtime as a registered [`PluginEntry`] trait
//! object resolved by the identifier the manifest names, never as a string
//! handed to an evaluator. The registry is an explicitly constructed value
//! the embedder owns and passes into the runtime.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{RuntimeError, RuntimeResult};
use crate::sandbox::SandboxContext;

/// Behavior a plugin contributes to the host.
///
/// All methods receive the capability-scoped [`SandboxContext`]; anything a
/// plugin does to the host flows through it.
#[async_trait]
pub trait PluginEntry: Send + Sync {
    /// Called once per activation, before the plugin is reported active.
    async fn initialize(&self, ctx: &SandboxContext) -> RuntimeResult<()> {
        let _ = ctx;
        Ok(())
    }

    /// Handle an invocation with JSON arguments.
    async fn call(
        &self,
        ctx: &SandboxContext,
        args: serde_json::Value,
    ) -> RuntimeResult<serde_json::Value>;

    /// Called during deactivation, before the context is destroyed.
    async fn shutdown(&self, ctx: &SandboxContext) -> RuntimeResult<()> {
        let _ = ctx;
        Ok(())
    }

    /// Version-specific data migration hook, keyed by the versions an
    /// update moves between. Default is a no-op.
    async fn migrate(&self, from_version: &str, to_version: &str) -> RuntimeResult<()> {
        let _ = (from_version, to_version);
        Ok(())
    }

    /// Source text the entry was built from, when the plugin ships it.
    /// Screened before every execution when present.
    fn source(&self) -> Option<&str> {
        None
    }
}

impl std::fmt::Debug for dyn PluginEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PluginEntry")
    }
}

/// Registry of entry points, keyed by the manifest's `entry_point` id.
#[derive(Default)]
pub struct EntryPointRegistry {
    entries: RwLock<HashMap<String, Arc<dyn PluginEntry>>>,
}

impl EntryPointRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entry point under an identifier. Replaces any previous
    /// registration for the same id.
    pub fn register(&self, id: impl Into<String>, entry: Arc<dyn PluginEntry>) {
        self.entries.write().insert(id.into(), entry);
    }

    /// Remove a registration.
    pub fn unregister(&self, id: &str) {
        self.entries.write().remove(id);
    }

    /// Look up an entry point.
    pub fn get(&self, id: &str) -> RuntimeResult<Arc<dyn PluginEntry>> {
        self.entries
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::EntryPointNotFound(id.to_string()))
    }

    /// Whether an entry point is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.read().contains_key(id)
    }
}

impl std::fmt::Debug for EntryPointRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryPointRegistry")
            .field("entries", &self.entries.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoEntry;

    #[async_trait]
    impl PluginEntry for EchoEntry {
        async fn call(
            &self,
            _ctx: &SandboxContext,
            args: serde_json::Value,
        ) -> RuntimeResult<serde_json::Value> {
            Ok(args)
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = EntryPointRegistry::new();
        registry.register("echo", Arc::new(EchoEntry));

        assert!(registry.contains("echo"));
        assert!(registry.get("echo").is_ok());
    }

    #[test]
    fn test_missing_entry_point() {
        let registry = EntryPointRegistry::new();
        let err = registry.get("ghost").unwrap_err();
        assert!(matches!(err, RuntimeError::EntryPointNotFound(_)));
    }

    #[test]
    fn test_unregister() {
        let registry = EntryPointRegistry::new();
        registry.register("echo", Arc::new(EchoEntry));
        registry.unregister("echo");
        assert!(!registry.contains("echo"));
    }
}
