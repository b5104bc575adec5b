//! Plugin instance state.
//!
//! A [`PluginInstance`] is the mutable record the lifecycle manager keeps
//! for each installed plugin. The manager is the sole writer; everything
//! else sees clones.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RuntimeError;
use crate::manifest::PluginManifest;

/// Identifier generated for each installed plugin instance.
pub type PluginId = Uuid;

/// Lifecycle status of a plugin instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    /// Installed but never activated.
    Installed,
    /// Activation in progress.
    Activating,
    /// Running; sandbox context materialized.
    Active,
    /// Deactivation in progress.
    Deactivating,
    /// Deactivated; context destroyed.
    Inactive,
    /// Manifest replacement in progress.
    Updating,
    /// Last operation failed; see the fault record.
    Error,
}

impl PluginStatus {
    /// Whether the plugin currently holds a live sandbox context.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }

    /// Whether the plugin is settled in a non-running state.
    pub fn is_inactive(self) -> bool {
        matches!(self, Self::Installed | Self::Inactive)
    }
}

impl std::fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Active => "active",
            Self::Deactivating => "deactivating",
            Self::Inactive => "inactive",
            Self::Updating => "updating",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Enumerated reason attached to a fault record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultCode {
    InvalidManifest,
    UnresolvedDependency,
    IncompatibleVersion,
    CircularDependency,
    ActivationFailed,
    DeactivationFailed,
    UpdateFailed,
    ExecutionFailed,
    ExecutionTimeout,
    ResourceCeiling,
    PermissionDenied,
    Internal,
}

impl FaultCode {
    /// Map a runtime error to the fault code recorded on the instance.
    pub fn from_error(error: &RuntimeError) -> Self {
        match error {
            RuntimeError::InvalidManifest(_) => Self::InvalidManifest,
            RuntimeError::UnresolvedRequiredDependency { .. } => Self::UnresolvedDependency,
            RuntimeError::IncompatibleDependencyVersion { .. } => Self::IncompatibleVersion,
            RuntimeError::CircularDependency { .. } => Self::CircularDependency,
            RuntimeError::ExecutionTimeout { .. } => Self::ExecutionTimeout,
            RuntimeError::ResourceCeilingExceeded { .. } => Self::ResourceCeiling,
            RuntimeError::PermissionDenied { .. }
            | RuntimeError::DomainNotAllowed { .. }
            | RuntimeError::SensitiveConfigAccessDenied(_) => Self::PermissionDenied,
            RuntimeError::UnsafeCodePattern(_) | RuntimeError::Execution(_) => {
                Self::ExecutionFailed
            }
            _ => Self::Internal,
        }
    }
}

/// Structured description of the most recent failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultRecord {
    /// Enumerated reason.
    pub code: FaultCode,
    /// Human-readable message.
    pub message: String,
    /// When the fault occurred.
    pub timestamp: DateTime<Utc>,
    /// Free-form context, e.g. the dependency that failed.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl FaultRecord {
    /// Create a fault record stamped with the current time.
    pub fn new(code: FaultCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), timestamp: Utc::now(), context: HashMap::new() }
    }

    /// Create a fault record from a runtime error.
    pub fn from_error(error: &RuntimeError) -> Self {
        Self::new(FaultCode::from_error(error), error.to_string())
    }

    /// Attach a context entry.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Mutable per-plugin record owned by the lifecycle manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInstance {
    /// Generated identifier.
    pub id: PluginId,
    /// The installed manifest.
    pub manifest: PluginManifest,
    /// Tenant this instance belongs to.
    pub tenant: String,
    /// Current lifecycle status.
    pub status: PluginStatus,
    /// Per-instance configuration values.
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,
    /// Cumulative activation/execution count.
    pub execution_count: u64,
    /// When the instance was installed.
    pub installed_at: DateTime<Utc>,
    /// Timestamp of the last successful activation.
    #[serde(default)]
    pub activated_at: Option<DateTime<Utc>>,
    /// Most recent failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fault: Option<FaultRecord>,
}

impl PluginInstance {
    /// Create a fresh instance in the `Installed` state.
    pub fn new(manifest: PluginManifest, tenant: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            manifest,
            tenant: tenant.into(),
            status: PluginStatus::Installed,
            config: HashMap::new(),
            execution_count: 0,
            installed_at: Utc::now(),
            activated_at: None,
            last_fault: None,
        }
    }

    /// Slug shorthand.
    pub fn slug(&self) -> &str {
        &self.manifest.slug
    }
}

/// Read-only health snapshot returned alongside `get`.
#[derive(Debug, Clone, Serialize)]
pub struct PluginHealth {
    /// Instance identifier.
    pub id: PluginId,
    /// Plugin slug.
    pub slug: String,
    /// Current status.
    pub status: PluginStatus,
    /// Cumulative activation/execution count.
    pub execution_count: u64,
    /// Last successful activation.
    pub activated_at: Option<DateTime<Utc>>,
    /// Most recent failure.
    pub last_fault: Option<FaultRecord>,
    /// Slugs of plugins that depend on this one.
    pub dependents: Vec<String>,
}

/// Aggregate counts over the registry.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RegistryStats {
    /// Total installed plugins.
    pub total: usize,
    /// Plugins currently active.
    pub active: usize,
    /// Plugins installed or deactivated.
    pub inactive: usize,
    /// Plugins in the error state.
    pub errored: usize,
}

/// Filter for plugin listing.
#[derive(Debug, Clone, Default)]
pub struct PluginFilter {
    /// Only plugins with this status.
    pub status: Option<PluginStatus>,
    /// Only plugins in this category.
    pub category: Option<String>,
    /// Only plugins for this tenant.
    pub tenant: Option<String>,
}

impl PluginFilter {
    /// Whether the instance passes the filter.
    pub fn matches(&self, instance: &PluginInstance) -> bool {
        if let Some(status) = self.status {
            if instance.status != status {
                return false;
            }
        }
        if let Some(ref category) = self.category {
            if instance.manifest.category.as_deref() != Some(category.as_str()) {
                return false;
            }
        }
        if let Some(ref tenant) = self.tenant {
            if &instance.tenant != tenant {
                return false;
            }
        }
        true
    }
}
