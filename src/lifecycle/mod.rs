//! Plugin lifecycle management.
//!
//! [`LifecycleManager`] is the orchestrating state machine: install,
//! activate, deactivate, update, and uninstall are serialized through a
//! single FIFO operation queue drained by one worker task, so no two
//! mutating operations ever interleave. Read-only queries go straight to a
//! shared snapshot and may run concurrently with queued writes.

mod events;
mod worker;

pub use events::LifecycleEvent;

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::error::{RuntimeError, RuntimeResult};
use crate::instance::{
    FaultRecord, PluginFilter, PluginHealth, PluginId, PluginInstance, PluginStatus, RegistryStats,
};
use crate::manifest::PluginManifest;
use crate::sandbox::{EntryPointRegistry, ExecutionSandbox, HostServices, OfflineHostServices};
use crate::store::{NullStore, RegistryStore};

use events::EventHub;
use worker::{Operation, RegistryState, Worker};

/// Capacity of the lifecycle event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Orchestrates plugin lifecycles over a serialized operation queue.
///
/// The manager must be created inside a tokio runtime; dropping the last
/// handle shuts the worker down. Cloning is cheap and all clones share the
/// same registry and queue.
#[derive(Clone)]
pub struct LifecycleManager {
    ops: mpsc::UnboundedSender<Operation>,
    state: Arc<RwLock<RegistryState>>,
    sandbox: Arc<ExecutionSandbox>,
    events: EventHub,
}

impl LifecycleManager {
    /// Create a manager with no host services and no persistence.
    pub fn new(entries: Arc<EntryPointRegistry>) -> Self {
        Self::with_host(entries, Arc::new(OfflineHostServices::new()))
    }

    /// Create a manager delegating host operations to the embedder.
    pub fn with_host(entries: Arc<EntryPointRegistry>, host: Arc<dyn HostServices>) -> Self {
        Self::build(entries, host, Arc::new(NullStore), Vec::new())
    }

    /// Create a manager backed by a registry store, reconstructing the
    /// in-memory registry from the persisted records.
    ///
    /// Plugins persisted in a running or transitional state come back
    /// `Inactive`; reactivation is an explicit caller decision.
    pub fn with_store(
        entries: Arc<EntryPointRegistry>,
        host: Arc<dyn HostServices>,
        store: Arc<dyn RegistryStore>,
    ) -> RuntimeResult<Self> {
        let mut restored = store.load()?;
        for instance in &mut restored {
            instance.status = match instance.status {
                PluginStatus::Installed => PluginStatus::Installed,
                PluginStatus::Error => PluginStatus::Error,
                _ => PluginStatus::Inactive,
            };
        }
        Ok(Self::build(entries, host, store, restored))
    }

    fn build(
        entries: Arc<EntryPointRegistry>,
        host: Arc<dyn HostServices>,
        store: Arc<dyn RegistryStore>,
        restored: Vec<PluginInstance>,
    ) -> Self {
        let sandbox = Arc::new(ExecutionSandbox::with_host(entries, host));
        let mut state = RegistryState::new();

        for instance in restored {
            state.instances.insert(instance.id, instance);
        }
        // Re-derive the dependency graph from the restored manifests. A
        // record whose dependencies no longer resolve lands in the error
        // state instead of silently losing its edges.
        let ids: Vec<PluginId> = state.instances.keys().copied().collect();
        for id in ids {
            let snapshot = match state.instances.get(&id) {
                Some(instance) => instance.clone(),
                None => continue,
            };
            if let Err(error) = state.resolver.resolve(&snapshot, &state.instances) {
                tracing::warn!(plugin = %snapshot.slug(), error = %error, "restored plugin no longer resolves");
                if let Some(instance) = state.instances.get_mut(&id) {
                    instance.status = PluginStatus::Error;
                    instance.last_fault = Some(
                        FaultRecord::from_error(&error).with_context("operation", "install"),
                    );
                }
            }
        }

        let state = Arc::new(RwLock::new(state));
        let events = EventHub::new(EVENT_CHANNEL_CAPACITY);
        let (ops, rx) = mpsc::unbounded_channel();

        let worker = Worker {
            state: Arc::clone(&state),
            sandbox: Arc::clone(&sandbox),
            events: events.clone(),
            store,
        };
        tokio::spawn(worker.run(rx));

        Self { ops, state, sandbox, events }
    }

    async fn submit<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<RuntimeResult<T>>) -> Operation,
    ) -> RuntimeResult<T> {
        let (tx, rx) = oneshot::channel();
        self.ops.send(make(tx)).map_err(|_| RuntimeError::QueueClosed)?;
        rx.await.map_err(|_| RuntimeError::QueueClosed)?
    }

    /// Validate and register a plugin for a tenant.
    ///
    /// The instance is created in the `Installed` state and its dependency
    /// edges recorded; activation is a separate call. A resolver failure
    /// leaves the instance registered in the error state and fails the
    /// operation.
    pub async fn install(
        &self,
        manifest: PluginManifest,
        tenant: impl Into<String>,
    ) -> RuntimeResult<PluginInstance> {
        let tenant = tenant.into();
        self.submit(|reply| Operation::Install { manifest, tenant, reply }).await
    }

    /// Activate a plugin, depth-first activating its not-yet-active
    /// dependencies first. No-op when already active.
    ///
    /// When a dependency fails mid-chain, dependencies activated earlier in
    /// the same call stay active; callers that need all-or-nothing must
    /// deactivate explicitly.
    pub async fn activate(&self, id: PluginId) -> RuntimeResult<()> {
        self.submit(|reply| Operation::Activate { id, reply }).await
    }

    /// Deactivate a plugin. Fails with
    /// [`RuntimeError::HasActiveDependents`] unless `force` is set or no
    /// active plugin depends on it. Idempotent when already inactive.
    pub async fn deactivate(&self, id: PluginId, force: bool) -> RuntimeResult<()> {
        self.submit(|reply| Operation::Deactivate { id, force, reply }).await
    }

    /// Remove a plugin entirely: its instance, dependency edges, dependents
    /// entry, and sandbox storage namespace. Deactivates first when active.
    /// Fails with [`RuntimeError::HasDependents`] unless `force` is set or
    /// nothing depends on it.
    pub async fn uninstall(&self, id: PluginId, force: bool) -> RuntimeResult<()> {
        self.submit(|reply| Operation::Uninstall { id, force, reply }).await
    }

    /// Replace a plugin's manifest, re-resolve its dependencies, run the
    /// migration hook for the version pair, and reactivate when the plugin
    /// was active before the update began.
    pub async fn update(&self, id: PluginId, manifest: PluginManifest) -> RuntimeResult<()> {
        self.submit(|reply| Operation::Update { id, manifest, reply }).await
    }

    /// Invoke an active plugin's entry point with JSON arguments.
    ///
    /// Executions are not queued: calls for different plugins run
    /// concurrently, each bounded by its own policy timeout. An execution
    /// fault is recorded on the instance and re-raised; a plugin with an
    /// established execution history keeps its status, a freshly activated
    /// one transitions to the error state.
    pub async fn execute(
        &self,
        id: PluginId,
        args: serde_json::Value,
    ) -> RuntimeResult<serde_json::Value> {
        let ctx = {
            let state = self.state.read();
            match state.contexts.get(&id) {
                Some(ctx) => ctx.clone(),
                None => {
                    return Err(match state.instances.get(&id) {
                        Some(instance) => RuntimeError::Execution(format!(
                            "plugin '{}' is not active",
                            instance.slug()
                        )),
                        None => RuntimeError::PluginNotFound(id.to_string()),
                    });
                }
            }
        };

        let result = self.sandbox.execute(&ctx, args).await;

        let mut state = self.state.write();
        if let Some(instance) = state.instances.get_mut(&id) {
            match &result {
                Ok(_) => instance.execution_count += 1,
                Err(error) => {
                    let established = instance.status.is_active() && instance.execution_count > 1;
                    instance.last_fault = Some(
                        FaultRecord::from_error(error).with_context("operation", "execute"),
                    );
                    if established {
                        tracing::warn!(plugin = %instance.slug(), error = %error, "execution fault");
                    } else {
                        instance.status = PluginStatus::Error;
                    }
                }
            }
        }

        result
    }

    /// Snapshot of a plugin by id.
    pub fn get_plugin(&self, id: PluginId) -> Option<PluginInstance> {
        self.state.read().instances.get(&id).cloned()
    }

    /// Snapshot of a plugin by tenant and slug.
    pub fn find(&self, tenant: &str, slug: &str) -> Option<PluginInstance> {
        self.state
            .read()
            .instances
            .values()
            .find(|i| i.tenant == tenant && i.manifest.slug == slug)
            .cloned()
    }

    /// Snapshots of all plugins passing the filter.
    pub fn get_plugins(&self, filter: &PluginFilter) -> Vec<PluginInstance> {
        self.state.read().instances.values().filter(|i| filter.matches(i)).cloned().collect()
    }

    /// Health snapshot for a plugin: status, counters, last fault, and the
    /// slugs of plugins depending on it.
    pub fn health(&self, id: PluginId) -> Option<PluginHealth> {
        let state = self.state.read();
        let instance = state.instances.get(&id)?;
        let dependents = state
            .resolver
            .dependents_of(id)
            .into_iter()
            .filter_map(|dep| state.instances.get(&dep).map(|i| i.slug().to_string()))
            .collect();
        Some(PluginHealth {
            id: instance.id,
            slug: instance.slug().to_string(),
            status: instance.status,
            execution_count: instance.execution_count,
            activated_at: instance.activated_at,
            last_fault: instance.last_fault.clone(),
            dependents,
        })
    }

    /// Aggregate counts over the registry.
    pub fn stats(&self) -> RegistryStats {
        let state = self.state.read();
        let mut stats = RegistryStats { total: state.instances.len(), ..Default::default() };
        for instance in state.instances.values() {
            match instance.status {
                PluginStatus::Active => stats.active += 1,
                PluginStatus::Error => stats.errored += 1,
                _ => stats.inactive += 1,
            }
        }
        stats
    }

    /// Subscribe to lifecycle events. Best-effort: a lagging subscriber
    /// drops events rather than slowing the runtime down.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// The sandbox backing this manager, for embedders that need direct
    /// access to its event bus.
    pub fn sandbox(&self) -> &Arc<ExecutionSandbox> {
        &self.sandbox
    }
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("LifecycleManager")
            .field("plugins", &state.instances.len())
            .field("active_contexts", &state.contexts.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::PluginEntry;
    use async_trait::async_trait;
    use serde_json::json;

    struct NoopEntry;

    #[async_trait]
    impl PluginEntry for NoopEntry {
        async fn call(
            &self,
            _ctx: &crate::sandbox::SandboxContext,
            _args: serde_json::Value,
        ) -> RuntimeResult<serde_json::Value> {
            Ok(json!(null))
        }
    }

    fn manager_with(slugs: &[&str]) -> LifecycleManager {
        let entries = Arc::new(EntryPointRegistry::new());
        for slug in slugs {
            entries.register(*slug, Arc::new(NoopEntry));
        }
        LifecycleManager::new(entries)
    }

    fn manifest(slug: &str) -> PluginManifest {
        PluginManifest::from_toml(&format!(
            r#"
name = "{slug}"
slug = "{slug}"
version = "1.0.0"
entry_point = "{slug}"
"#
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_install_rejects_invalid_manifest() {
        let manager = manager_with(&[]);
        let mut bad = manifest("bad");
        bad.slug = "Not A Slug".to_string();

        let err = manager.install(bad, "default").await.unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidManifest(_)));
        assert_eq!(manager.stats().total, 0);
    }

    #[tokio::test]
    async fn test_activate_unknown_plugin() {
        let manager = manager_with(&[]);
        let err = manager.activate(PluginId::new_v4()).await.unwrap_err();
        assert!(matches!(err, RuntimeError::PluginNotFound(_)));
    }

    #[tokio::test]
    async fn test_deactivate_is_idempotent_when_never_activated() {
        let manager = manager_with(&["quiet"]);
        let instance = manager.install(manifest("quiet"), "default").await.unwrap();
        manager.deactivate(instance.id, false).await.unwrap();
        manager.deactivate(instance.id, false).await.unwrap();
    }

    #[tokio::test]
    async fn test_health_and_stats_snapshots() {
        let manager = manager_with(&["seen"]);
        let instance = manager.install(manifest("seen"), "default").await.unwrap();
        manager.activate(instance.id).await.unwrap();

        let health = manager.health(instance.id).unwrap();
        assert_eq!(health.slug, "seen");
        assert_eq!(health.status, PluginStatus::Active);
        assert_eq!(health.execution_count, 1);
        assert!(health.activated_at.is_some());
        assert!(health.dependents.is_empty());

        let stats = manager.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.inactive, 0);
    }

    #[tokio::test]
    async fn test_filtered_listing() {
        let manager = manager_with(&["one", "two"]);
        let one = manager.install(manifest("one"), "default").await.unwrap();
        manager.install(manifest("two"), "acme").await.unwrap();
        manager.activate(one.id).await.unwrap();

        let active = manager
            .get_plugins(&PluginFilter { status: Some(PluginStatus::Active), ..Default::default() });
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].slug(), "one");

        let acme =
            manager.get_plugins(&PluginFilter { tenant: Some("acme".to_string()), ..Default::default() });
        assert_eq!(acme.len(), 1);
        assert_eq!(acme[0].slug(), "two");
    }

    #[tokio::test]
    async fn test_activation_fault_is_cleared_by_later_success() {
        struct FlakyEntry {
            failures: std::sync::atomic::AtomicUsize,
        }

        #[async_trait]
        impl PluginEntry for FlakyEntry {
            async fn initialize(&self, _ctx: &crate::sandbox::SandboxContext) -> RuntimeResult<()> {
                let remaining = self.failures.fetch_update(
                    std::sync::atomic::Ordering::Relaxed,
                    std::sync::atomic::Ordering::Relaxed,
                    |n| n.checked_sub(1),
                );
                if remaining.is_ok() {
                    return Err(RuntimeError::Execution("warming up".to_string()));
                }
                Ok(())
            }

            async fn call(
                &self,
                _ctx: &crate::sandbox::SandboxContext,
                _args: serde_json::Value,
            ) -> RuntimeResult<serde_json::Value> {
                Ok(json!(null))
            }
        }

        let entries = Arc::new(EntryPointRegistry::new());
        entries.register(
            "flaky",
            Arc::new(FlakyEntry { failures: std::sync::atomic::AtomicUsize::new(1) }),
        );
        let manager = LifecycleManager::new(entries);
        let instance = manager.install(manifest("flaky"), "default").await.unwrap();

        manager.activate(instance.id).await.unwrap_err();
        let errored = manager.get_plugin(instance.id).unwrap();
        assert_eq!(errored.status, PluginStatus::Error);
        assert!(errored.last_fault.is_some());

        manager.activate(instance.id).await.unwrap();
        let recovered = manager.get_plugin(instance.id).unwrap();
        assert_eq!(recovered.status, PluginStatus::Active);
        assert!(recovered.last_fault.is_none());
    }
}
