//! The lifecycle operation worker.
//!
//! All state-mutating operations arrive as queued [`Operation`] messages
//! and are processed here one at a time. The worker is the sole writer of
//! the registry; readers take the lock concurrently and see a consistent,
//! possibly slightly stale snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};

use crate::error::{RuntimeError, RuntimeResult};
use crate::instance::{FaultCode, FaultRecord, PluginId, PluginInstance, PluginStatus};
use crate::lifecycle::events::{EventHub, LifecycleEvent};
use crate::manifest::PluginManifest;
use crate::resolver::DependencyResolver;
use crate::sandbox::{ExecutionSandbox, SandboxContext};
use crate::store::RegistryStore;

/// A queued state-mutating operation with its reply channel.
pub(crate) enum Operation {
    Install {
        manifest: PluginManifest,
        tenant: String,
        reply: oneshot::Sender<RuntimeResult<PluginInstance>>,
    },
    Activate {
        id: PluginId,
        reply: oneshot::Sender<RuntimeResult<()>>,
    },
    Deactivate {
        id: PluginId,
        force: bool,
        reply: oneshot::Sender<RuntimeResult<()>>,
    },
    Uninstall {
        id: PluginId,
        force: bool,
        reply: oneshot::Sender<RuntimeResult<()>>,
    },
    Update {
        id: PluginId,
        manifest: PluginManifest,
        reply: oneshot::Sender<RuntimeResult<()>>,
    },
}

/// Registry state owned by the worker, readable by the manager handle.
pub(crate) struct RegistryState {
    pub instances: HashMap<PluginId, PluginInstance>,
    pub resolver: DependencyResolver,
    pub contexts: HashMap<PluginId, SandboxContext>,
}

impl RegistryState {
    pub fn new() -> Self {
        Self {
            instances: HashMap::new(),
            resolver: DependencyResolver::new(),
            contexts: HashMap::new(),
        }
    }
}

/// Depth-first post-order over the not-yet-active dependency closure of
/// `root`, so every dependency precedes its dependents.
fn activation_order(state: &RegistryState, root: PluginId) -> Vec<PluginId> {
    fn visit(
        state: &RegistryState,
        id: PluginId,
        seen: &mut std::collections::HashSet<PluginId>,
        out: &mut Vec<PluginId>,
    ) {
        if !seen.insert(id) {
            return;
        }
        if state.instances.get(&id).is_some_and(|i| i.status.is_active()) {
            return;
        }
        for dep in state.resolver.dependencies_of(id) {
            visit(state, dep, seen, out);
        }
        out.push(id);
    }

    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    visit(state, root, &mut seen, &mut out);
    out
}

/// Clear the fault when the operation that recorded it succeeds again.
fn clear_fault(instance: &mut PluginInstance, operation: &str) {
    let same_operation = instance
        .last_fault
        .as_ref()
        .and_then(|fault| fault.context.get("operation"))
        .is_some_and(|recorded| recorded == operation);
    if same_operation {
        instance.last_fault = None;
    }
}

pub(crate) struct Worker {
    pub state: Arc<RwLock<RegistryState>>,
    pub sandbox: Arc<ExecutionSandbox>,
    pub events: EventHub,
    pub store: Arc<dyn RegistryStore>,
}

impl Worker {
    /// Drain the queue until every manager handle is gone.
    ///
    /// One operation's failure never stops the loop; the error travels
    /// back on the operation's own reply channel.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<Operation>) {
        while let Some(op) = rx.recv().await {
            match op {
                Operation::Install { manifest, tenant, reply } => {
                    let _ = reply.send(self.install(manifest, tenant));
                }
                Operation::Activate { id, reply } => {
                    let _ = reply.send(self.activate(id).await);
                }
                Operation::Deactivate { id, force, reply } => {
                    let _ = reply.send(self.deactivate(id, force).await);
                }
                Operation::Uninstall { id, force, reply } => {
                    let _ = reply.send(self.uninstall(id, force).await);
                }
                Operation::Update { id, manifest, reply } => {
                    let _ = reply.send(self.update(id, manifest).await);
                }
            }
        }
        tracing::debug!("lifecycle worker stopped");
    }

    fn persist(&self) -> RuntimeResult<()> {
        let instances: Vec<PluginInstance> =
            self.state.read().instances.values().cloned().collect();
        self.store.save(&instances)
    }

    fn persist_best_effort(&self) {
        if let Err(error) = self.persist() {
            tracing::warn!(error = %error, "failed to persist plugin registry");
        }
    }

    /// Transition an instance into the error state with a fault record.
    fn fail(&self, id: PluginId, error: &RuntimeError, operation: &'static str) {
        let mut state = self.state.write();
        if let Some(instance) = state.instances.get_mut(&id) {
            instance.status = PluginStatus::Error;
            instance.last_fault =
                Some(FaultRecord::from_error(error).with_context("operation", operation));
        }
    }

    fn slug_of(&self, id: PluginId) -> String {
        self.state
            .read()
            .instances
            .get(&id)
            .map(|i| i.slug().to_string())
            .unwrap_or_else(|| id.to_string())
    }

    fn install(&self, manifest: PluginManifest, tenant: String) -> RuntimeResult<PluginInstance> {
        let report = manifest.validate();
        if !report.is_valid() {
            return Err(RuntimeError::InvalidManifest(report.errors.join("; ")));
        }
        for warning in &report.warnings {
            tracing::warn!(plugin = %manifest.slug, "{}", warning);
        }

        let result = {
            let mut guard = self.state.write();
            let RegistryState { instances, resolver, .. } = &mut *guard;

            if instances
                .values()
                .any(|i| i.tenant == tenant && i.manifest.slug == manifest.slug)
            {
                return Err(RuntimeError::AlreadyInstalled { slug: manifest.slug, tenant });
            }

            let instance = PluginInstance::new(manifest, tenant);
            match resolver.resolve(&instance, instances) {
                Ok(()) => {
                    instances.insert(instance.id, instance.clone());
                    Ok(instance)
                }
                Err(error) => {
                    let mut failed = instance;
                    failed.status = PluginStatus::Error;
                    failed.last_fault = Some(
                        FaultRecord::from_error(&error).with_context("operation", "install"),
                    );
                    instances.insert(failed.id, failed);
                    Err(error)
                }
            }
        };

        match result {
            Ok(instance) => {
                tracing::info!(
                    plugin = %instance.slug(),
                    version = %instance.manifest.version,
                    "plugin installed"
                );
                self.events.emit(LifecycleEvent::Installed {
                    id: instance.id,
                    slug: instance.slug().to_string(),
                });
                self.persist()?;
                Ok(instance)
            }
            Err(error) => {
                self.persist_best_effort();
                Err(error)
            }
        }
    }

    async fn activate(&self, id: PluginId) -> RuntimeResult<()> {
        let order = {
            let state = self.state.read();
            let instance = state
                .instances
                .get(&id)
                .ok_or_else(|| RuntimeError::PluginNotFound(id.to_string()))?;
            if instance.status.is_active() {
                return Ok(());
            }
            activation_order(&state, id)
        };

        for pid in order {
            if let Err(error) = self.activate_single(pid).await {
                if pid != id {
                    // A dependency failed mid-chain. Dependencies activated
                    // earlier in this call stay active; the requested plugin
                    // records the failed chain.
                    let dep_slug = self.slug_of(pid);
                    let slug = self.slug_of(id);
                    {
                        let mut state = self.state.write();
                        if let Some(instance) = state.instances.get_mut(&id) {
                            instance.status = PluginStatus::Error;
                            instance.last_fault = Some(
                                FaultRecord::new(
                                    FaultCode::ActivationFailed,
                                    format!("dependency '{dep_slug}' failed to activate"),
                                )
                                .with_context("operation", "activate")
                                .with_context("dependency", dep_slug.clone()),
                            );
                        }
                    }
                    self.events.emit(LifecycleEvent::ActivateError {
                        id,
                        slug,
                        message: error.to_string(),
                    });
                    self.persist_best_effort();
                }
                return Err(error);
            }
        }

        Ok(())
    }

    async fn activate_single(&self, id: PluginId) -> RuntimeResult<()> {
        let instance = {
            let mut state = self.state.write();
            let Some(instance) = state.instances.get_mut(&id) else {
                return Err(RuntimeError::PluginNotFound(id.to_string()));
            };
            if instance.status.is_active() {
                return Ok(());
            }
            instance.status = PluginStatus::Activating;
            instance.clone()
        };

        let ctx = self.sandbox.create(&instance);
        match self.sandbox.initialize(&ctx).await {
            Ok(()) => {
                {
                    let mut state = self.state.write();
                    state.contexts.insert(id, ctx);
                    if let Some(record) = state.instances.get_mut(&id) {
                        record.status = PluginStatus::Active;
                        record.activated_at = Some(Utc::now());
                        record.execution_count += 1;
                        clear_fault(record, "activate");
                    }
                }
                tracing::info!(plugin = %instance.slug(), "plugin activated");
                self.events.emit(LifecycleEvent::Activated {
                    id,
                    slug: instance.slug().to_string(),
                });
                self.persist()?;
                Ok(())
            }
            Err(error) => {
                self.sandbox.destroy(&ctx);
                self.fail(id, &error, "activate");
                self.events.emit(LifecycleEvent::ActivateError {
                    id,
                    slug: instance.slug().to_string(),
                    message: error.to_string(),
                });
                self.persist_best_effort();
                Err(error)
            }
        }
    }

    async fn deactivate(&self, id: PluginId, force: bool) -> RuntimeResult<()> {
        let (slug, status, active_dependents) = {
            let state = self.state.read();
            let instance = state
                .instances
                .get(&id)
                .ok_or_else(|| RuntimeError::PluginNotFound(id.to_string()))?;
            let active_dependents = state
                .resolver
                .dependents_of(id)
                .into_iter()
                .filter(|dep| state.instances.get(dep).is_some_and(|i| i.status.is_active()))
                .count();
            (instance.slug().to_string(), instance.status, active_dependents)
        };

        if status.is_inactive() {
            return Ok(());
        }
        if active_dependents > 0 && !force {
            return Err(RuntimeError::HasActiveDependents(slug));
        }

        self.deactivate_single(id).await
    }

    async fn deactivate_single(&self, id: PluginId) -> RuntimeResult<()> {
        let (slug, ctx) = {
            let mut guard = self.state.write();
            let RegistryState { instances, contexts, .. } = &mut *guard;
            let Some(instance) = instances.get_mut(&id) else {
                return Err(RuntimeError::PluginNotFound(id.to_string()));
            };
            instance.status = PluginStatus::Deactivating;
            (instance.slug().to_string(), contexts.get(&id).cloned())
        };

        if let Some(ctx) = &ctx {
            if let Err(error) = self.sandbox.shutdown(ctx).await {
                self.fail(id, &error, "deactivate");
                self.events.emit(LifecycleEvent::DeactivateError {
                    id,
                    slug,
                    message: error.to_string(),
                });
                self.persist_best_effort();
                return Err(error);
            }
            self.sandbox.destroy(ctx);
        }

        {
            let mut state = self.state.write();
            state.contexts.remove(&id);
            if let Some(instance) = state.instances.get_mut(&id) {
                instance.status = PluginStatus::Inactive;
                clear_fault(instance, "deactivate");
            }
        }
        tracing::info!(plugin = %slug, "plugin deactivated");
        self.events.emit(LifecycleEvent::Deactivated { id, slug });
        self.persist()?;
        Ok(())
    }

    async fn uninstall(&self, id: PluginId, force: bool) -> RuntimeResult<()> {
        let (slug, has_dependents, ctx) = {
            let state = self.state.read();
            let instance = state
                .instances
                .get(&id)
                .ok_or_else(|| RuntimeError::PluginNotFound(id.to_string()))?;
            (
                instance.slug().to_string(),
                !state.resolver.can_safely_remove(id),
                state.contexts.get(&id).cloned(),
            )
        };

        if has_dependents && !force {
            return Err(RuntimeError::HasDependents(slug));
        }

        // Deactivate first when a context is live. Uninstall proceeds even
        // if the shutdown hook fails.
        if let Some(ctx) = &ctx {
            if let Err(error) = self.sandbox.shutdown(ctx).await {
                tracing::warn!(plugin = %slug, error = %error, "shutdown hook failed during uninstall");
            }
            self.sandbox.destroy(ctx);
        }

        {
            let mut state = self.state.write();
            state.contexts.remove(&id);
            state.instances.remove(&id);
            state.resolver.remove_instance(id);
        }
        self.sandbox.remove_namespace(id);

        tracing::info!(plugin = %slug, "plugin uninstalled");
        self.events.emit(LifecycleEvent::Uninstalled { id, slug });
        self.persist()?;
        Ok(())
    }

    async fn update(&self, id: PluginId, new_manifest: PluginManifest) -> RuntimeResult<()> {
        let report = new_manifest.validate();
        if !report.is_valid() {
            return Err(RuntimeError::InvalidManifest(report.errors.join("; ")));
        }

        let (slug, old_version, was_active) = {
            let state = self.state.read();
            let instance = state
                .instances
                .get(&id)
                .ok_or_else(|| RuntimeError::PluginNotFound(id.to_string()))?;
            (
                instance.slug().to_string(),
                instance.manifest.version.clone(),
                instance.status.is_active(),
            )
        };

        if was_active {
            self.deactivate_single(id).await?;
        }

        let new_version = new_manifest.version.clone();
        let entry_point = new_manifest.entry_point.clone();

        let resolve_result = {
            let mut guard = self.state.write();
            let RegistryState { instances, resolver, .. } = &mut *guard;
            let Some(instance) = instances.get_mut(&id) else {
                return Err(RuntimeError::PluginNotFound(id.to_string()));
            };
            instance.status = PluginStatus::Updating;
            instance.manifest = new_manifest;
            let snapshot = instance.clone();
            resolver.clear_edges(id);
            resolver.resolve(&snapshot, instances)
        };

        if let Err(error) = resolve_result {
            self.fail(id, &error, "update");
            self.events.emit(LifecycleEvent::UpdateError {
                id,
                slug,
                message: error.to_string(),
            });
            self.persist_best_effort();
            return Err(error);
        }

        // Migration hook keyed by the versions the update moves between.
        if let Err(error) = self.sandbox.migrate(&entry_point, &old_version, &new_version).await {
            self.fail(id, &error, "update");
            self.events.emit(LifecycleEvent::UpdateError {
                id,
                slug,
                message: error.to_string(),
            });
            self.persist_best_effort();
            return Err(error);
        }

        if was_active {
            self.activate_single(id).await?;
        } else {
            let mut state = self.state.write();
            if let Some(instance) = state.instances.get_mut(&id) {
                instance.status = PluginStatus::Inactive;
                clear_fault(instance, "update");
            }
        }

        tracing::info!(
            plugin = %slug,
            old_version = %old_version,
            new_version = %new_version,
            "plugin updated"
        );
        self.events.emit(LifecycleEvent::Updated {
            id,
            slug,
            old_version,
            new_version,
        });
        self.persist()?;
        Ok(())
    }
}
