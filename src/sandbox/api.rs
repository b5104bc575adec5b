//! Capability-gated host API surface.
//!
//! Every operation a plugin can perform against the host goes through
//! [`PluginApi`], which checks the caller's granted capabilities (and, for
//! network calls, the manifest's domain allowlist) before delegating to the
//! embedder's [`HostServices`]. The bundled [`OfflineHostServices`] returns
//! empty defaults so the whole surface is safe to call with no database or
//! network behind it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::error::{RuntimeError, RuntimeResult};
use crate::instance::PluginId;
use crate::manifest::SandboxPolicy;

/// Configuration key substrings that plugins may never read.
const SENSITIVE_KEY_SUBSTRINGS: &[&str] = &[
    "secret",
    "password",
    "passwd",
    "token",
    "credential",
    "private_key",
    "privatekey",
    "api_key",
    "apikey",
];

/// Whether a configuration key matches the sensitive denylist.
pub fn is_sensitive_key(key: &str) -> bool {
    let lowered = key.to_lowercase();
    SENSITIVE_KEY_SUBSTRINGS.iter().any(|needle| lowered.contains(needle))
}

/// Match a host against an allowlist pattern. `*.example.com` matches the
/// apex and any subdomain; anything else is an exact match.
pub fn domain_matches(host: &str, pattern: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix("*.") {
        host == suffix || host.ends_with(&format!(".{suffix}"))
    } else {
        host == pattern
    }
}

/// Extract the lowercased host portion of a URL.
fn host_of(url: &str) -> Option<String> {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let host = rest.split(['/', '?', '#']).next()?;
    let host = host.split('@').last()?;
    let host = host.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_lowercase())
    }
}

/// Outbound HTTP-like request a plugin hands to the host.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTP method.
    pub method: String,
    /// Target URL; its host is checked against the domain allowlist.
    pub url: String,
    /// Request headers.
    pub headers: HashMap<String, String>,
    /// Optional body.
    pub body: Option<String>,
}

impl HttpRequest {
    /// Convenience constructor for a GET request.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: HashMap::new(),
            body: None,
        }
    }
}

/// Response returned from the host's HTTP surface.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Status code; `0` means no network backend was available.
    pub status: u16,
    /// Response body.
    pub body: String,
}

impl HttpResponse {
    /// The negative default returned when no network backend exists.
    pub fn unavailable() -> Self {
        Self { status: 0, body: String::new() }
    }
}

/// Host-side services the embedder provides to plugins.
///
/// Implementations must be safe to call with no database or network
/// available, returning empty or negative defaults rather than panicking.
#[async_trait]
pub trait HostServices: Send + Sync {
    /// Read a user record, if the host knows one.
    async fn user(&self, user_id: &str) -> RuntimeResult<Option<serde_json::Value>>;

    /// Read a tenant record, if the host knows one.
    async fn tenant(&self, tenant_id: &str) -> RuntimeResult<Option<serde_json::Value>>;

    /// Perform an outbound HTTP call on the plugin's behalf. Domain
    /// checking has already happened by the time this is invoked.
    async fn http_call(&self, request: HttpRequest) -> RuntimeResult<HttpResponse>;

    /// Read a host configuration value. Sensitive-key screening has
    /// already happened by the time this is invoked.
    fn config_value(&self, key: &str) -> Option<serde_json::Value>;
}

/// Default host services for running without a surrounding application:
/// no users, no tenants, no network, plus an optional in-memory config map.
#[derive(Debug, Default)]
pub struct OfflineHostServices {
    config: HashMap<String, serde_json::Value>,
}

impl OfflineHostServices {
    /// Create offline services with an empty config map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create offline services backed by the given config map.
    pub fn with_config(config: HashMap<String, serde_json::Value>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl HostServices for OfflineHostServices {
    async fn user(&self, _user_id: &str) -> RuntimeResult<Option<serde_json::Value>> {
        Ok(None)
    }

    async fn tenant(&self, _tenant_id: &str) -> RuntimeResult<Option<serde_json::Value>> {
        Ok(None)
    }

    async fn http_call(&self, _request: HttpRequest) -> RuntimeResult<HttpResponse> {
        Ok(HttpResponse::unavailable())
    }

    fn config_value(&self, key: &str) -> Option<serde_json::Value> {
        self.config.get(key).cloned()
    }
}

/// Identifier returned by [`PluginApi::on`], used to unsubscribe.
pub type SubscriptionId = u64;

/// Handler invoked when a subscribed event fires.
pub type EventHandler = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    handler: EventHandler,
}

#[derive(Default)]
struct EventBusInner {
    subscribers: Mutex<HashMap<String, Vec<Subscription>>>,
    next_id: AtomicU64,
}

/// In-process event bus plugins publish and subscribe on.
///
/// Delivery is synchronous and best-effort: handlers run inline on the
/// emitter's thread, and nothing is queued for absent subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an event to all current subscribers.
    pub fn emit(&self, event: &str, payload: &serde_json::Value) {
        let handlers: Vec<EventHandler> = {
            let subscribers = self.inner.subscribers.lock();
            subscribers
                .get(event)
                .map(|subs| subs.iter().map(|s| Arc::clone(&s.handler)).collect())
                .unwrap_or_default()
        };
        for handler in handlers {
            handler(payload);
        }
    }

    /// Subscribe a handler to an event name.
    pub fn subscribe(&self, event: impl Into<String>, handler: EventHandler) -> SubscriptionId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .entry(event.into())
            .or_default()
            .push(Subscription { id, handler });
        id
    }

    /// Remove a subscription by id.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut subscribers = self.inner.subscribers.lock();
        for subs in subscribers.values_mut() {
            subs.retain(|s| s.id != id);
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("events", &self.inner.subscribers.lock().len())
            .finish()
    }
}

/// The capability-scoped API handle inside a [`crate::sandbox::SandboxContext`].
///
/// Holds the plugin's granted capability set and resolved policy; every
/// method checks them before touching the host.
#[derive(Clone)]
pub struct PluginApi {
    plugin_id: PluginId,
    slug: String,
    capabilities: Arc<HashSet<String>>,
    policy: SandboxPolicy,
    host: Arc<dyn HostServices>,
    events: EventBus,
    subscriptions: Arc<Mutex<Vec<SubscriptionId>>>,
}

impl PluginApi {
    pub(crate) fn new(
        plugin_id: PluginId,
        slug: String,
        capabilities: HashSet<String>,
        policy: SandboxPolicy,
        host: Arc<dyn HostServices>,
        events: EventBus,
    ) -> Self {
        Self {
            plugin_id,
            slug,
            capabilities: Arc::new(capabilities),
            policy,
            host,
            events,
            subscriptions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn require(&self, capability: &str) -> RuntimeResult<()> {
        if self.capabilities.contains(capability) {
            Ok(())
        } else {
            Err(RuntimeError::PermissionDenied {
                plugin: self.slug.clone(),
                capability: capability.to_string(),
            })
        }
    }

    fn require_module(&self, module: &str) -> RuntimeResult<()> {
        if self.policy.blocked_apis.iter().any(|blocked| blocked == module) {
            return Err(RuntimeError::PermissionDenied {
                plugin: self.slug.clone(),
                capability: format!("api module '{module}'"),
            });
        }
        Ok(())
    }

    /// Read a user record. Requires `users:read`.
    pub async fn get_user(&self, user_id: &str) -> RuntimeResult<Option<serde_json::Value>> {
        self.require_module("users")?;
        self.require("users:read")?;
        self.host.user(user_id).await
    }

    /// Read a tenant record. Requires `tenant:read`.
    pub async fn get_tenant(&self, tenant_id: &str) -> RuntimeResult<Option<serde_json::Value>> {
        self.require_module("tenant")?;
        self.require("tenant:read")?;
        self.host.tenant(tenant_id).await
    }

    /// Perform an outbound HTTP call. Requires `network:http`, and the
    /// target host must match the manifest's allowed domains.
    pub async fn http(&self, request: HttpRequest) -> RuntimeResult<HttpResponse> {
        self.require_module("network")?;
        self.require("network:http")?;

        let host = host_of(&request.url).ok_or_else(|| RuntimeError::DomainNotAllowed {
            plugin: self.slug.clone(),
            domain: request.url.clone(),
        })?;

        if !self.policy.allowed_domains.iter().any(|pattern| domain_matches(&host, pattern)) {
            return Err(RuntimeError::DomainNotAllowed { plugin: self.slug.clone(), domain: host });
        }

        tracing::debug!(plugin = %self.slug, host = %host, "outbound http call");
        self.host.http_call(request).await
    }

    /// Read a host configuration value. Requires `config:read`; keys
    /// matching the sensitive denylist are refused outright.
    pub fn config_get(&self, key: &str) -> RuntimeResult<Option<serde_json::Value>> {
        self.require_module("config")?;
        self.require("config:read")?;

        if is_sensitive_key(key) {
            return Err(RuntimeError::SensitiveConfigAccessDenied(key.to_string()));
        }

        Ok(self.host.config_value(key))
    }

    /// Publish an event on the bus. Requires `events:emit`.
    pub fn emit(&self, event: &str, payload: &serde_json::Value) -> RuntimeResult<()> {
        self.require_module("events")?;
        self.require("events:emit")?;
        self.events.emit(event, payload);
        Ok(())
    }

    /// Subscribe to an event. Requires `events:subscribe`. The
    /// subscription dies with the context.
    pub fn on(&self, event: &str, handler: EventHandler) -> RuntimeResult<SubscriptionId> {
        self.require_module("events")?;
        self.require("events:subscribe")?;
        let id = self.events.subscribe(event, handler);
        self.subscriptions.lock().push(id);
        Ok(id)
    }

    /// Remove a subscription created through this handle.
    pub fn off(&self, id: SubscriptionId) {
        self.subscriptions.lock().retain(|sub| *sub != id);
        self.events.unsubscribe(id);
    }

    /// SHA-256 digest as lowercase hex. Requires `crypto:hash`.
    pub fn sha256_hex(&self, data: &[u8]) -> RuntimeResult<String> {
        self.require_module("crypto")?;
        self.require("crypto:hash")?;
        let mut hasher = Sha256::new();
        hasher.update(data);
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Keyed SHA-256 digest (key prepended) as lowercase hex. Requires
    /// `crypto:hash`.
    pub fn keyed_digest(&self, key: &[u8], data: &[u8]) -> RuntimeResult<String> {
        self.require_module("crypto")?;
        self.require("crypto:hash")?;
        let mut hasher = Sha256::new();
        hasher.update(key);
        hasher.update(data);
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Identifier of the plugin this handle belongs to.
    pub fn plugin_id(&self) -> PluginId {
        self.plugin_id
    }

    /// Drop every subscription this handle created. Called on destroy.
    pub(crate) fn release_subscriptions(&self) {
        let ids: Vec<SubscriptionId> = std::mem::take(&mut *self.subscriptions.lock());
        for id in ids {
            self.events.unsubscribe(id);
        }
    }
}

impl std::fmt::Debug for PluginApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginApi")
            .field("plugin_id", &self.plugin_id)
            .field("slug", &self.slug)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}
