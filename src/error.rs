//! Runtime error types.

use thiserror::Error;

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors that can occur during plugin runtime operations.
///
/// Every variant renders to a message suitable for an admin surface; no
/// host paths or internal state leak through `Display`.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Manifest failed structural validation.
    #[error("Invalid plugin manifest: {0}")]
    InvalidManifest(String),

    /// A plugin with the same slug is already installed for the tenant.
    #[error("Plugin '{slug}' is already installed for tenant '{tenant}'")]
    AlreadyInstalled { slug: String, tenant: String },

    /// A required dependency has no matching installed plugin.
    #[error("Plugin '{plugin}' requires '{dependency}' which is not installed")]
    UnresolvedRequiredDependency { plugin: String, dependency: String },

    /// A dependency exists but its version does not satisfy the requirement.
    #[error(
        "Plugin '{plugin}' requires '{dependency}' >= {required}, but {installed} is installed"
    )]
    IncompatibleDependencyVersion {
        plugin: String,
        dependency: String,
        required: String,
        installed: String,
    },

    /// Recording the dependency edge would make the graph cyclic.
    #[error("Dependency from '{plugin}' on '{dependency}' would create a cycle")]
    CircularDependency { plugin: String, dependency: String },

    /// Deactivation refused because active plugins depend on this one.
    #[error("Plugin '{0}' has active dependents")]
    HasActiveDependents(String),

    /// Uninstall refused because other plugins depend on this one.
    #[error("Plugin '{0}' is required by other installed plugins")]
    HasDependents(String),

    /// The plugin invoked an API operation its capabilities do not grant.
    #[error("Plugin '{plugin}' is not granted '{capability}'")]
    PermissionDenied { plugin: String, capability: String },

    /// The plugin attempted a network call to a host outside its allowlist.
    #[error("Plugin '{plugin}' may not reach domain '{domain}'")]
    DomainNotAllowed { plugin: String, domain: String },

    /// The plugin read a configuration key matching the sensitive denylist.
    #[error("Access to configuration key '{0}' is denied")]
    SensitiveConfigAccessDenied(String),

    /// Static screening rejected the plugin source.
    #[error("Plugin source rejected: {0}")]
    UnsafeCodePattern(String),

    /// Execution exceeded the sandbox policy timeout.
    #[error("Plugin '{plugin}' timed out after {timeout_ms}ms")]
    ExecutionTimeout { plugin: String, timeout_ms: u64 },

    /// The sandbox refused to start a new execution over its memory ceiling.
    #[error("Plugin '{plugin}' exceeded its memory ceiling ({used} of {limit} bytes)")]
    ResourceCeilingExceeded { plugin: String, used: usize, limit: usize },

    /// No installed plugin matches the given identifier.
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    /// The manifest references an entry point no one registered.
    #[error("Entry point '{0}' is not registered")]
    EntryPointNotFound(String),

    /// Plugin code returned an error.
    #[error("Plugin execution failed: {0}")]
    Execution(String),

    /// Registry persistence failed.
    #[error("Registry storage error: {0}")]
    Storage(String),

    /// The runtime worker is gone; no further operations can be queued.
    #[error("Plugin runtime is shut down")]
    QueueClosed,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_are_admin_friendly() {
        let err = RuntimeError::PermissionDenied {
            plugin: "mailer".to_string(),
            capability: "users:write".to_string(),
        };
        assert_eq!(err.to_string(), "Plugin 'mailer' is not granted 'users:write'");

        let err = RuntimeError::ExecutionTimeout { plugin: "slow".to_string(), timeout_ms: 100 };
        assert_eq!(err.to_string(), "Plugin 'slow' timed out after 100ms");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: RuntimeError = io.into();
        assert!(matches!(err, RuntimeError::Io(_)));
    }
}
