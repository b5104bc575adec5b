//! Plugin manifest parsing and validation.
//!
//! A manifest declares a plugin's identity, its dependencies on other
//! plugins, the capabilities it requests, its entry point, and the sandbox
//! policy its executions run under. Manifests are immutable once installed;
//! `update` replaces the whole document.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{RuntimeError, RuntimeResult};
use crate::version;

/// Default execution timeout when the manifest does not set one.
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Default memory ceiling when the manifest does not set one (16 MiB).
pub const DEFAULT_MAX_MEMORY_BYTES: usize = 16 * 1024 * 1024;

/// Plugin manifest containing identity, dependencies, and sandbox policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Human-readable plugin name.
    pub name: String,
    /// Unique identifier, restricted to `[a-z0-9-]`.
    pub slug: String,
    /// Plugin version as a dotted numeric sequence.
    pub version: String,
    /// Plugin description.
    #[serde(default)]
    pub description: Option<String>,
    /// Plugin author.
    #[serde(default)]
    pub author: Option<String>,
    /// Category for listing filters.
    #[serde(default)]
    pub category: Option<String>,
    /// Keywords for search.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Plugins this plugin requires.
    #[serde(default)]
    pub dependencies: Vec<PluginDependency>,
    /// Capabilities the plugin requests, e.g. `users:read`.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Identifier of the registered entry point to invoke.
    pub entry_point: String,
    /// Sandbox policy for this plugin's executions.
    #[serde(default)]
    pub sandbox: SandboxPolicy,
}

/// A declared dependency on another plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDependency {
    /// Slug (or declared name) of the required plugin.
    pub slug: String,
    /// Minimum version required.
    pub version: String,
    /// Optional dependencies that are missing are skipped, never an error.
    #[serde(default)]
    pub optional: bool,
}

/// Sandbox policy limits resolved per plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxPolicy {
    /// Execution timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Approximate memory ceiling in bytes.
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: usize,
    /// Hosts the plugin may reach over the network. Supports exact names
    /// and `*.example.com` wildcards.
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    /// Host API modules the plugin may never touch, regardless of
    /// granted capabilities.
    #[serde(default)]
    pub blocked_apis: Vec<String>,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_max_memory_bytes() -> usize {
    DEFAULT_MAX_MEMORY_BYTES
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
            allowed_domains: Vec::new(),
            blocked_apis: Vec::new(),
        }
    }
}

/// Outcome of manifest validation.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    /// Validation errors; non-empty means the manifest is rejected.
    pub errors: Vec<String>,
    /// Non-blocking issues.
    pub warnings: Vec<String>,
}

impl ValidationReport {
    /// Whether the manifest passed validation.
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

impl PluginManifest {
    /// Parse a manifest from a TOML string.
    pub fn from_toml(content: &str) -> RuntimeResult<Self> {
        toml::from_str(content).map_err(|e| RuntimeError::InvalidManifest(e.to_string()))
    }

    /// Parse a manifest from a JSON string.
    pub fn from_json(content: &str) -> RuntimeResult<Self> {
        serde_json::from_str(content).map_err(|e| RuntimeError::InvalidManifest(e.to_string()))
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> RuntimeResult<String> {
        toml::to_string_pretty(self).map_err(|e| RuntimeError::InvalidManifest(e.to_string()))
    }

    /// Validate the manifest structurally.
    ///
    /// Pure function: the same manifest always yields the same report, and
    /// no state is touched.
    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();

        if self.name.trim().is_empty() {
            report.error("plugin name is required");
        }

        if self.slug.is_empty() {
            report.error("plugin slug is required");
        } else if !self.slug.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            report.error("plugin slug must contain only lowercase letters, digits, and hyphens");
        }

        if self.version.is_empty() {
            report.error("plugin version is required");
        } else if version::parse(&self.version).is_none() {
            report.error(format!(
                "plugin version '{}' is not a dotted numeric sequence",
                self.version
            ));
        }

        if self.entry_point.is_empty() {
            report.error("plugin entry point is required");
        }

        let mut seen = HashSet::new();
        for dep in &self.dependencies {
            if dep.slug.is_empty() {
                report.error("dependency with empty slug");
                continue;
            }
            if !seen.insert(dep.slug.as_str()) {
                report.error(format!("duplicate dependency '{}'", dep.slug));
            }
            if version::parse(&dep.version).is_none() {
                report.error(format!(
                    "dependency '{}' has unparseable version '{}'",
                    dep.slug, dep.version
                ));
            }
        }

        if self.description.as_deref().map_or(true, str::is_empty) {
            report.warning("plugin has no description");
        }

        if self.author.as_deref().map_or(true, str::is_empty) {
            report.warning("plugin has no author");
        }

        if self.sandbox.timeout_ms == 0 {
            report.warning("sandbox timeout of 0 falls back to the default");
        }

        report
    }

    /// Whether the manifest grants the given capability.
    pub fn grants(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// Effective execution timeout, substituting the default for zero.
    pub fn effective_timeout_ms(&self) -> u64 {
        if self.sandbox.timeout_ms == 0 {
            DEFAULT_TIMEOUT_MS
        } else {
            self.sandbox.timeout_ms
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_MANIFEST: &str = r#"
name = "Audit Logger"
slug = "audit-logger"
version = "1.2.0"
author = "community"
description = "Streams audit events to an external collector"
category = "observability"
tags = ["audit", "events"]
capabilities = ["events:subscribe", "network:http"]
entry_point = "audit-logger"

[[dependencies]]
slug = "event-core"
version = "1.0.0"

[sandbox]
timeout_ms = 2000
max_memory_bytes = 1048576
allowed_domains = ["collector.example.com"]
"#;

    #[test]
    fn test_parse_manifest() {
        let manifest = PluginManifest::from_toml(SAMPLE_MANIFEST).unwrap();

        assert_eq!(manifest.slug, "audit-logger");
        assert_eq!(manifest.version, "1.2.0");
        assert_eq!(manifest.dependencies.len(), 1);
        assert!(!manifest.dependencies[0].optional);
        assert_eq!(manifest.sandbox.timeout_ms, 2000);
        assert!(manifest.grants("network:http"));
        assert!(!manifest.grants("users:write"));
    }

    #[test]
    fn test_validate_ok() {
        let manifest = PluginManifest::from_toml(SAMPLE_MANIFEST).unwrap();
        let report = manifest.validate();
        assert!(report.is_valid(), "unexpected errors: {:?}", report.errors);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_slug() {
        let mut manifest = PluginManifest::from_toml(SAMPLE_MANIFEST).unwrap();
        manifest.slug = "Audit_Logger".to_string();
        let report = manifest.validate();
        assert!(!report.is_valid());
        assert!(report.errors[0].contains("slug"));
    }

    #[test]
    fn test_validate_rejects_bad_version() {
        let mut manifest = PluginManifest::from_toml(SAMPLE_MANIFEST).unwrap();
        manifest.version = "one.two".to_string();
        assert!(!manifest.validate().is_valid());
    }

    #[test]
    fn test_missing_author_is_warning_not_error() {
        let mut manifest = PluginManifest::from_toml(SAMPLE_MANIFEST).unwrap();
        manifest.author = None;
        manifest.description = None;
        let report = manifest.validate();
        assert!(report.is_valid());
        assert_eq!(report.warnings.len(), 2);
    }

    #[test]
    fn test_duplicate_dependency_is_error() {
        let mut manifest = PluginManifest::from_toml(SAMPLE_MANIFEST).unwrap();
        manifest.dependencies.push(PluginDependency {
            slug: "event-core".to_string(),
            version: "1.1.0".to_string(),
            optional: false,
        });
        let report = manifest.validate();
        assert!(!report.is_valid());
        assert!(report.errors.iter().any(|e| e.contains("duplicate")));
    }

    #[test]
    fn test_validation_is_pure() {
        let manifest = PluginManifest::from_toml(SAMPLE_MANIFEST).unwrap();
        let first = manifest.validate();
        let second = manifest.validate();
        assert_eq!(first.errors, second.errors);
        assert_eq!(first.warnings, second.warnings);
    }

    #[test]
    fn test_default_policy_applied() {
        let manifest = PluginManifest::from_toml(
            r#"
name = "Minimal"
slug = "minimal"
version = "0.1.0"
entry_point = "minimal"
"#,
        )
        .unwrap();

        assert_eq!(manifest.sandbox.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(manifest.sandbox.max_memory_bytes, DEFAULT_MAX_MEMORY_BYTES);
        assert!(manifest.sandbox.allowed_domains.is_empty());
    }

    #[test]
    fn test_json_round_trip() {
        let manifest = PluginManifest::from_toml(SAMPLE_MANIFEST).unwrap();
        let json = serde_json::to_string(&manifest).unwrap();
        let back = PluginManifest::from_json(&json).unwrap();
        assert_eq!(back.slug, manifest.slug);
        assert_eq!(back.sandbox.allowed_domains, manifest.sandbox.allowed_domains);
    }
}
