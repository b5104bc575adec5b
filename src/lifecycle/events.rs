//! Lifecycle event notifications.
//!
//! Events are best-effort observability signals, not guaranteed-delivery
//! messages: they fan out over a broadcast channel and are dropped when no
//! subscriber is listening or a subscriber lags.

use tokio::sync::broadcast;

use crate::instance::PluginId;

/// Notification emitted by the lifecycle manager.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// A plugin was installed.
    Installed { id: PluginId, slug: String },
    /// A plugin finished activating.
    Activated { id: PluginId, slug: String },
    /// A plugin finished deactivating.
    Deactivated { id: PluginId, slug: String },
    /// A plugin's manifest was replaced.
    Updated { id: PluginId, slug: String, old_version: String, new_version: String },
    /// A plugin was removed from the registry.
    Uninstalled { id: PluginId, slug: String },
    /// Activation failed.
    ActivateError { id: PluginId, slug: String, message: String },
    /// Deactivation failed.
    DeactivateError { id: PluginId, slug: String, message: String },
    /// Update failed.
    UpdateError { id: PluginId, slug: String, message: String },
}

impl LifecycleEvent {
    /// Stable event name, e.g. `plugin:activated`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Installed { .. } => "plugin:installed",
            Self::Activated { .. } => "plugin:activated",
            Self::Deactivated { .. } => "plugin:deactivated",
            Self::Updated { .. } => "plugin:updated",
            Self::Uninstalled { .. } => "plugin:uninstalled",
            Self::ActivateError { .. } => "plugin:activate-error",
            Self::DeactivateError { .. } => "plugin:deactivate-error",
            Self::UpdateError { .. } => "plugin:update-error",
        }
    }

    /// The plugin the event concerns.
    pub fn plugin_id(&self) -> PluginId {
        match self {
            Self::Installed { id, .. }
            | Self::Activated { id, .. }
            | Self::Deactivated { id, .. }
            | Self::Updated { id, .. }
            | Self::Uninstalled { id, .. }
            | Self::ActivateError { id, .. }
            | Self::DeactivateError { id, .. }
            | Self::UpdateError { id, .. } => *id,
        }
    }

    /// Slug of the plugin the event concerns.
    pub fn slug(&self) -> &str {
        match self {
            Self::Installed { slug, .. }
            | Self::Activated { slug, .. }
            | Self::Deactivated { slug, .. }
            | Self::Updated { slug, .. }
            | Self::Uninstalled { slug, .. }
            | Self::ActivateError { slug, .. }
            | Self::DeactivateError { slug, .. }
            | Self::UpdateError { slug, .. } => slug,
        }
    }
}

/// Broadcast hub for lifecycle events.
#[derive(Debug, Clone)]
pub(crate) struct EventHub {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: LifecycleEvent) {
        tracing::debug!(event = event.kind(), plugin = event.slug(), "lifecycle event");
        let _ = self.tx.send(event);
    }
}
