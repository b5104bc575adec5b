//! Per-activation sandbox contexts and namespaced storage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::instance::PluginId;
use crate::manifest::SandboxPolicy;
use crate::sandbox::api::PluginApi;

/// Key-value store shared by the sandbox, partitioned per plugin.
pub(crate) type SharedStorage = Arc<RwLock<HashMap<PluginId, HashMap<String, serde_json::Value>>>>;

/// Log level exposed to plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Trace level (most verbose).
    Trace,
    /// Debug level.
    Debug,
    /// Info level.
    Info,
    /// Warning level.
    Warn,
    /// Error level.
    Error,
}

/// Storage handle scoped to one plugin's namespace.
///
/// Reads and writes only ever touch the owning plugin's partition; there is
/// no way to name, read, or enumerate another namespace through this handle.
#[derive(Clone)]
pub struct StorageHandle {
    namespace: PluginId,
    store: SharedStorage,
    memory: Arc<AtomicUsize>,
}

impl StorageHandle {
    pub(crate) fn new(namespace: PluginId, store: SharedStorage, memory: Arc<AtomicUsize>) -> Self {
        Self { namespace, store, memory }
    }

    fn entry_size(key: &str, value: &serde_json::Value) -> usize {
        key.len() + serde_json::to_string(value).map_or(0, |s| s.len())
    }

    /// Read a value from the namespace.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.store.read().get(&self.namespace).and_then(|ns| ns.get(key).cloned())
    }

    /// Write a value into the namespace.
    pub fn set(&self, key: impl Into<String>, value: serde_json::Value) {
        let key = key.into();
        let added = Self::entry_size(&key, &value);

        let mut store = self.store.write();
        let namespace = store.entry(self.namespace).or_default();
        let removed = namespace.get(&key).map_or(0, |old| Self::entry_size(&key, old));
        namespace.insert(key, value);
        drop(store);

        self.memory.fetch_add(added, Ordering::Relaxed);
        self.memory.fetch_sub(removed, Ordering::Relaxed);
    }

    /// Remove a value, returning whether it existed.
    pub fn remove(&self, key: &str) -> bool {
        let mut store = self.store.write();
        let Some(namespace) = store.get_mut(&self.namespace) else {
            return false;
        };
        match namespace.remove(key) {
            Some(old) => {
                let freed = Self::entry_size(key, &old);
                drop(store);
                self.memory.fetch_sub(freed, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Keys currently present in the namespace.
    pub fn keys(&self) -> Vec<String> {
        self.store
            .read()
            .get(&self.namespace)
            .map(|ns| ns.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of entries in the namespace.
    pub fn len(&self) -> usize {
        self.store.read().get(&self.namespace).map_or(0, HashMap::len)
    }

    /// Whether the namespace is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Capability-scoped execution environment handed to a plugin.
///
/// Created fresh per activation and destroyed when the plugin deactivates;
/// a context never outlives the activation it was created for. Cloning is
/// cheap and shares the same underlying handles.
#[derive(Clone)]
pub struct SandboxContext {
    pub(crate) plugin_id: PluginId,
    pub(crate) slug: String,
    pub(crate) entry_point: String,
    pub(crate) policy: SandboxPolicy,
    /// Capability-gated host API surface.
    pub api: PluginApi,
    /// Storage scoped to this plugin's namespace.
    pub storage: StorageHandle,
    pub(crate) memory: Arc<AtomicUsize>,
    destroyed: Arc<AtomicBool>,
}

impl SandboxContext {
    pub(crate) fn new(
        plugin_id: PluginId,
        slug: String,
        entry_point: String,
        policy: SandboxPolicy,
        api: PluginApi,
        storage: StorageHandle,
        memory: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            plugin_id,
            slug,
            entry_point,
            policy,
            api,
            storage,
            memory,
            destroyed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Identifier of the plugin this context belongs to.
    pub fn plugin_id(&self) -> PluginId {
        self.plugin_id
    }

    /// Slug of the plugin this context belongs to.
    pub fn slug(&self) -> &str {
        &self.slug
    }

    /// The sandbox policy resolved for this activation.
    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    /// Approximate memory currently attributed to this plugin.
    pub fn approx_memory(&self) -> usize {
        self.memory.load(Ordering::Relaxed)
    }

    /// Whether `destroy` has been called on this context.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_destroyed(&self) -> bool {
        !self.destroyed.swap(true, Ordering::Relaxed)
    }

    /// Logger handle: emits under the host's subscriber, tagged with the
    /// plugin slug so host logs and plugin logs stay distinguishable.
    pub fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Trace => tracing::trace!(plugin = %self.slug, "{}", message),
            LogLevel::Debug => tracing::debug!(plugin = %self.slug, "{}", message),
            LogLevel::Info => tracing::info!(plugin = %self.slug, "{}", message),
            LogLevel::Warn => tracing::warn!(plugin = %self.slug, "{}", message),
            LogLevel::Error => tracing::error!(plugin = %self.slug, "{}", message),
        }
    }
}

impl std::fmt::Debug for SandboxContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxContext")
            .field("plugin_id", &self.plugin_id)
            .field("slug", &self.slug)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn handle(namespace: PluginId, store: &SharedStorage) -> StorageHandle {
        StorageHandle::new(namespace, Arc::clone(store), Arc::new(AtomicUsize::new(0)))
    }

    #[test]
    fn test_storage_round_trip() {
        let store: SharedStorage = Arc::default();
        let ns = Uuid::new_v4();
        let storage = handle(ns, &store);

        storage.set("greeting", json!("hello"));
        assert_eq!(storage.get("greeting"), Some(json!("hello")));
        assert_eq!(storage.keys(), vec!["greeting".to_string()]);
        assert!(storage.remove("greeting"));
        assert!(!storage.remove("greeting"));
        assert!(storage.is_empty());
    }

    #[test]
    fn test_namespaces_are_isolated() {
        let store: SharedStorage = Arc::default();
        let first = handle(Uuid::new_v4(), &store);
        let second = handle(Uuid::new_v4(), &store);

        first.set("shared-key", json!(1));
        assert_eq!(second.get("shared-key"), None);
        assert!(second.keys().is_empty());

        second.set("shared-key", json!(2));
        assert_eq!(first.get("shared-key"), Some(json!(1)));
    }

    #[test]
    fn test_memory_accounting_tracks_writes() {
        let store: SharedStorage = Arc::default();
        let memory = Arc::new(AtomicUsize::new(0));
        let storage = StorageHandle::new(Uuid::new_v4(), store, Arc::clone(&memory));

        storage.set("k", json!("0123456789"));
        let after_set = memory.load(Ordering::Relaxed);
        assert!(after_set > 0);

        storage.remove("k");
        assert!(memory.load(Ordering::Relaxed) < after_set);
    }
}
