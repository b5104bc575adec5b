//! Execution sandbox.
//!
//! Builds a restricted execution context per plugin activation: a
//! capability-scoped API surface, a namespaced key-value store, and
//! bounded-time execution of registered entry points with static source
//! screening. This is a pragmatic middle ground, not hard isolation: a
//! deployment wrapper must add process- or container-level boundaries
//! when plugins are truly untrusted.

mod api;
mod context;
mod entry;
mod screen;

pub use api::{
    domain_matches, is_sensitive_key, EventBus, EventHandler, HostServices, HttpRequest,
    HttpResponse, OfflineHostServices, PluginApi, SubscriptionId,
};
pub use context::{LogLevel, SandboxContext, StorageHandle};
pub use entry::{EntryPointRegistry, PluginEntry};
pub use screen::screen_source;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::error::{RuntimeError, RuntimeResult};
use crate::instance::{PluginId, PluginInstance};
use crate::manifest::{SandboxPolicy, DEFAULT_TIMEOUT_MS};

use context::SharedStorage;

/// Baseline bytes attributed to an in-flight execution on top of its
/// serialized arguments.
const EXECUTION_OVERHEAD_BYTES: usize = 1024;

fn effective_timeout(policy: &SandboxPolicy) -> Duration {
    let ms = if policy.timeout_ms == 0 { DEFAULT_TIMEOUT_MS } else { policy.timeout_ms };
    Duration::from_millis(ms)
}

/// Releases an execution's memory reservation when the call completes or
/// is abandoned by the timeout.
struct MemoryReservation {
    counter: Arc<AtomicUsize>,
    bytes: usize,
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.counter.fetch_sub(self.bytes, Ordering::Relaxed);
    }
}

/// Constructs sandbox contexts and runs plugin entry points inside them.
///
/// Executions for different plugins may run concurrently; each is bounded
/// by its own policy timeout and acts on a disjoint context.
pub struct ExecutionSandbox {
    host: Arc<dyn HostServices>,
    entries: Arc<EntryPointRegistry>,
    events: EventBus,
    storage: SharedStorage,
    memory: RwLock<HashMap<PluginId, Arc<AtomicUsize>>>,
}

impl ExecutionSandbox {
    /// Create a sandbox with no backing host services.
    pub fn new(entries: Arc<EntryPointRegistry>) -> Self {
        Self::with_host(entries, Arc::new(OfflineHostServices::new()))
    }

    /// Create a sandbox delegating host operations to the embedder.
    pub fn with_host(entries: Arc<EntryPointRegistry>, host: Arc<dyn HostServices>) -> Self {
        Self {
            host,
            entries,
            events: EventBus::new(),
            storage: Arc::default(),
            memory: RwLock::new(HashMap::new()),
        }
    }

    /// The bus plugin events travel on.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn memory_counter(&self, id: PluginId) -> Arc<AtomicUsize> {
        if let Some(counter) = self.memory.read().get(&id) {
            return Arc::clone(counter);
        }
        Arc::clone(self.memory.write().entry(id).or_default())
    }

    /// Materialize a fresh context for an activation.
    ///
    /// The API surface exposes only operations the instance's capability
    /// list grants; storage is scoped to the instance's namespace.
    pub fn create(&self, instance: &PluginInstance) -> SandboxContext {
        let memory = self.memory_counter(instance.id);
        let api = PluginApi::new(
            instance.id,
            instance.slug().to_string(),
            instance.manifest.capabilities.iter().cloned().collect(),
            instance.manifest.sandbox.clone(),
            Arc::clone(&self.host),
            self.events.clone(),
        );
        let storage =
            StorageHandle::new(instance.id, Arc::clone(&self.storage), Arc::clone(&memory));

        tracing::debug!(plugin = %instance.slug(), "sandbox context created");

        SandboxContext::new(
            instance.id,
            instance.slug().to_string(),
            instance.manifest.entry_point.clone(),
            instance.manifest.sandbox.clone(),
            api,
            storage,
            memory,
        )
    }

    fn prepare(&self, ctx: &SandboxContext) -> RuntimeResult<Arc<dyn PluginEntry>> {
        if ctx.is_destroyed() {
            return Err(RuntimeError::Execution(format!(
                "sandbox context for '{}' is already destroyed",
                ctx.slug()
            )));
        }

        let entry = self.entries.get(&ctx.entry_point)?;
        if let Some(source) = entry.source() {
            screen::screen_source(source)?;
        }
        Ok(entry)
    }

    fn reserve(&self, ctx: &SandboxContext, args: &serde_json::Value) -> RuntimeResult<MemoryReservation> {
        let used = ctx.approx_memory();
        let limit = ctx.policy().max_memory_bytes;
        if used >= limit {
            return Err(RuntimeError::ResourceCeilingExceeded {
                plugin: ctx.slug().to_string(),
                used,
                limit,
            });
        }

        let bytes =
            serde_json::to_string(args).map_or(0, |s| s.len()) + EXECUTION_OVERHEAD_BYTES;
        ctx.memory.fetch_add(bytes, Ordering::Relaxed);
        Ok(MemoryReservation { counter: Arc::clone(&ctx.memory), bytes })
    }

    /// Run the entry point's initialization hook, bounded by the policy
    /// timeout. Called during activation.
    pub async fn initialize(&self, ctx: &SandboxContext) -> RuntimeResult<()> {
        let entry = self.prepare(ctx)?;
        let timeout = effective_timeout(ctx.policy());

        match tokio::time::timeout(timeout, entry.initialize(ctx)).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::ExecutionTimeout {
                plugin: ctx.slug().to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Invoke the plugin's entry point with JSON arguments.
    ///
    /// The call races the policy timeout; on elapse the execution is
    /// abandoned and [`RuntimeError::ExecutionTimeout`] is returned. Host
    /// side effects the plugin already triggered are not rolled back.
    pub async fn execute(
        &self,
        ctx: &SandboxContext,
        args: serde_json::Value,
    ) -> RuntimeResult<serde_json::Value> {
        let entry = self.prepare(ctx)?;
        let _reservation = self.reserve(ctx, &args)?;
        let timeout = effective_timeout(ctx.policy());

        match tokio::time::timeout(timeout, entry.call(ctx, args)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    plugin = %ctx.slug(),
                    timeout_ms = timeout.as_millis() as u64,
                    "execution abandoned at timeout"
                );
                Err(RuntimeError::ExecutionTimeout {
                    plugin: ctx.slug().to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Run the entry point's shutdown hook, bounded by the policy timeout.
    /// Called during deactivation, before the context is destroyed.
    pub async fn shutdown(&self, ctx: &SandboxContext) -> RuntimeResult<()> {
        let entry = self.prepare(ctx)?;
        let timeout = effective_timeout(ctx.policy());

        match tokio::time::timeout(timeout, entry.shutdown(ctx)).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::ExecutionTimeout {
                plugin: ctx.slug().to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Run the migration hook for an update between two versions.
    pub async fn migrate(
        &self,
        entry_point: &str,
        from_version: &str,
        to_version: &str,
    ) -> RuntimeResult<()> {
        let entry = self.entries.get(entry_point)?;
        entry.migrate(from_version, to_version).await
    }

    /// Release per-context resources. Idempotent; safe to call more than
    /// once. Storage survives until the plugin is uninstalled.
    pub fn destroy(&self, ctx: &SandboxContext) {
        if ctx.mark_destroyed() {
            ctx.api.release_subscriptions();
            tracing::debug!(plugin = %ctx.slug(), "sandbox context destroyed");
        }
    }

    /// Drop a plugin's storage namespace and memory accounting entirely.
    /// Called on uninstall.
    pub fn remove_namespace(&self, id: PluginId) {
        self.storage.write().remove(&id);
        self.memory.write().remove(&id);
    }
}

impl std::fmt::Debug for ExecutionSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionSandbox")
            .field("entries", &self.entries)
            .field("namespaces", &self.storage.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Instant;

    struct EchoEntry;

    #[async_trait]
    impl PluginEntry for EchoEntry {
        async fn call(
            &self,
            _ctx: &SandboxContext,
            args: serde_json::Value,
        ) -> RuntimeResult<serde_json::Value> {
            Ok(json!({ "echo": args }))
        }
    }

    struct SleepyEntry;

    #[async_trait]
    impl PluginEntry for SleepyEntry {
        async fn call(
            &self,
            _ctx: &SandboxContext,
            _args: serde_json::Value,
        ) -> RuntimeResult<serde_json::Value> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(json!(null))
        }
    }

    struct ShippedSourceEntry {
        source: String,
    }

    #[async_trait]
    impl PluginEntry for ShippedSourceEntry {
        async fn call(
            &self,
            _ctx: &SandboxContext,
            _args: serde_json::Value,
        ) -> RuntimeResult<serde_json::Value> {
            Ok(json!(null))
        }

        fn source(&self) -> Option<&str> {
            Some(&self.source)
        }
    }

    fn instance(slug: &str, entry_point: &str, timeout_ms: u64) -> PluginInstance {
        let mut manifest = crate::manifest::PluginManifest::from_toml(&format!(
            r#"
name = "{slug}"
slug = "{slug}"
version = "1.0.0"
entry_point = "{entry_point}"
"#
        ))
        .unwrap();
        manifest.sandbox.timeout_ms = timeout_ms;
        PluginInstance::new(manifest, "default")
    }

    fn sandbox_with(entry_point: &str, entry: Arc<dyn PluginEntry>) -> ExecutionSandbox {
        let entries = Arc::new(EntryPointRegistry::new());
        entries.register(entry_point, entry);
        ExecutionSandbox::new(entries)
    }

    #[tokio::test]
    async fn test_execute_returns_entry_result() {
        let sandbox = sandbox_with("echo", Arc::new(EchoEntry));
        let ctx = sandbox.create(&instance("echo", "echo", 1000));

        let result = sandbox.execute(&ctx, json!({"value": 21})).await.unwrap();
        assert_eq!(result, json!({"echo": {"value": 21}}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_enforced_within_margin() {
        let sandbox = sandbox_with("sleepy", Arc::new(SleepyEntry));
        let ctx = sandbox.create(&instance("sleepy", "sleepy", 100));

        let wall = Instant::now();
        let err = sandbox.execute(&ctx, json!(null)).await.unwrap_err();
        assert!(wall.elapsed() < Duration::from_millis(150));

        match err {
            RuntimeError::ExecutionTimeout { timeout_ms, .. } => assert_eq!(timeout_ms, 100),
            other => panic!("expected ExecutionTimeout, got {other:?}"),
        }

        // The context remains destroyable after a timeout.
        sandbox.destroy(&ctx);
        assert!(ctx.is_destroyed());
    }

    #[tokio::test]
    async fn test_missing_entry_point() {
        let sandbox = ExecutionSandbox::new(Arc::new(EntryPointRegistry::new()));
        let ctx = sandbox.create(&instance("ghost", "ghost", 1000));

        let err = sandbox.execute(&ctx, json!(null)).await.unwrap_err();
        assert!(matches!(err, RuntimeError::EntryPointNotFound(_)));
    }

    #[tokio::test]
    async fn test_unsafe_source_rejected_before_execution() {
        let entry = ShippedSourceEntry { source: "return eval('1+1');".to_string() };
        let sandbox = sandbox_with("shipped", Arc::new(entry));
        let ctx = sandbox.create(&instance("shipped", "shipped", 1000));

        let err = sandbox.execute(&ctx, json!(null)).await.unwrap_err();
        assert!(matches!(err, RuntimeError::UnsafeCodePattern(_)));
    }

    #[tokio::test]
    async fn test_resource_ceiling_refuses_execution() {
        let sandbox = sandbox_with("echo", Arc::new(EchoEntry));
        let mut inst = instance("echo", "echo", 1000);
        inst.manifest.sandbox.max_memory_bytes = 32;
        let ctx = sandbox.create(&inst);

        ctx.storage.set("blob", json!("x".repeat(64)));
        let err = sandbox.execute(&ctx, json!(null)).await.unwrap_err();
        assert!(matches!(err, RuntimeError::ResourceCeilingExceeded { .. }));

        // Freeing the storage lets executions through again.
        ctx.storage.remove("blob");
        sandbox.execute(&ctx, json!(null)).await.unwrap();
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent_and_blocks_execution() {
        let sandbox = sandbox_with("echo", Arc::new(EchoEntry));
        let ctx = sandbox.create(&instance("echo", "echo", 1000));

        sandbox.destroy(&ctx);
        sandbox.destroy(&ctx);
        assert!(ctx.is_destroyed());

        let err = sandbox.execute(&ctx, json!(null)).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Execution(_)));
    }

    #[tokio::test]
    async fn test_destroy_releases_subscriptions() {
        let mut inst = instance("sub", "echo", 1000);
        inst.manifest.capabilities =
            vec!["events:subscribe".to_string(), "events:emit".to_string()];
        let sandbox = sandbox_with("echo", Arc::new(EchoEntry));
        let ctx = sandbox.create(&inst);

        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        ctx.api
            .on(
                "tick",
                Arc::new(move |_| {
                    seen.fetch_add(1, Ordering::Relaxed);
                }),
            )
            .unwrap();

        sandbox.events().emit("tick", &json!(null));
        assert_eq!(hits.load(Ordering::Relaxed), 1);

        sandbox.destroy(&ctx);
        sandbox.events().emit("tick", &json!(null));
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_remove_namespace_clears_storage() {
        let sandbox = sandbox_with("echo", Arc::new(EchoEntry));
        let inst = instance("echo", "echo", 1000);
        let ctx = sandbox.create(&inst);

        ctx.storage.set("k", json!(1));
        sandbox.remove_namespace(inst.id);

        let fresh = sandbox.create(&inst);
        assert_eq!(fresh.storage.get("k"), None);
    }
}
