//! # Plugrun
//!
//! A capability-sandboxed plugin runtime for embedding third-party
//! extensions in a host application.
//!
//! Plugrun registers plugin manifests, tracks each plugin's lifecycle
//! through a serialized state machine, resolves inter-plugin dependencies
//! with cycle prevention and version checks, and executes plugin entry
//! points inside a restricted sandbox: a capability-scoped host API,
//! namespaced storage, static source screening, bounded execution time,
//! and an approximate memory ceiling.
//!
//! ## Architecture
//!
//! - [`manifest`]: manifest types and structural validation
//! - [`resolver`]: the acyclic dependency graph and dependents index
//! - [`sandbox`]: per-activation contexts, the gated host API surface,
//!   and bounded entry-point execution
//! - [`lifecycle`]: the FIFO operation queue and state machine
//! - [`store`]: coarse-grained registry persistence
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use plugrun::{EntryPointRegistry, LifecycleManager, PluginManifest};
//!
//! # async fn demo(my_entry: Arc<dyn plugrun::PluginEntry>) -> plugrun::RuntimeResult<()> {
//! let entries = Arc::new(EntryPointRegistry::new());
//! entries.register("greeter", my_entry);
//!
//! let manager = LifecycleManager::new(entries);
//! let manifest = PluginManifest::from_toml(r#"
//! name = "Greeter"
//! slug = "greeter"
//! version = "1.0.0"
//! entry_point = "greeter"
//! "#)?;
//!
//! let instance = manager.install(manifest, "default").await?;
//! manager.activate(instance.id).await?;
//! let reply = manager.execute(instance.id, serde_json::json!({"name": "ada"})).await?;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```
//!
//! ## Isolation boundary
//!
//! The sandbox is a pragmatic middle ground: static screening plus a
//! capability-scoped API, not language-level isolation. A timed-out
//! execution is abandoned, never forcibly unwound, so host-side effects it
//! already triggered are not rolled back. Deployments running truly
//! untrusted code must add an OS-level process or container boundary.

#![forbid(unsafe_code)]

pub mod error;
pub mod instance;
pub mod lifecycle;
pub mod manifest;
pub mod resolver;
pub mod sandbox;
pub mod store;
pub mod version;

pub use error::{RuntimeError, RuntimeResult};
pub use instance::{
    FaultCode, FaultRecord, PluginFilter, PluginHealth, PluginId, PluginInstance, PluginStatus,
    RegistryStats,
};
pub use lifecycle::{LifecycleEvent, LifecycleManager};
pub use manifest::{
    PluginDependency, PluginManifest, SandboxPolicy, ValidationReport, DEFAULT_MAX_MEMORY_BYTES,
    DEFAULT_TIMEOUT_MS,
};
pub use resolver::{DependencyEdge, DependencyResolver};
pub use sandbox::{
    domain_matches, is_sensitive_key, screen_source, EntryPointRegistry, EventBus, EventHandler,
    ExecutionSandbox, HostServices, HttpRequest, HttpResponse, LogLevel, OfflineHostServices,
    PluginApi, PluginEntry, SandboxContext, StorageHandle, SubscriptionId,
};
pub use store::{JsonFileStore, NullStore, RegistryStore};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
