//! Dependency resolution and the dependency graph.
//!
//! The resolver matches a plugin's declared dependencies against installed
//! plugins, enforces version compatibility, and maintains the directed
//! dependency graph together with a reverse dependents index. The graph is
//! acyclic by construction: a candidate edge that would close a cycle is
//! rejected before anything is recorded.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RuntimeError, RuntimeResult};
use crate::instance::{PluginId, PluginInstance};
use crate::version;

/// A directed relation from a dependent plugin to its dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyEdge {
    /// The plugin that declares the requirement.
    pub dependent: PluginId,
    /// The plugin being depended on.
    pub dependency: PluginId,
    /// Version range required at resolution time.
    pub required_version: String,
    /// When the edge was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Maintains dependency edges and the reverse dependents index.
#[derive(Debug, Default)]
pub struct DependencyResolver {
    /// Edges keyed by the dependent instance.
    edges: HashMap<PluginId, Vec<DependencyEdge>>,
    /// Reverse index: who depends on a given instance.
    dependents: HashMap<PluginId, HashSet<PluginId>>,
}

impl DependencyResolver {
    /// Create an empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the instance's declared dependencies against the installed
    /// set and record the resulting edges.
    ///
    /// Matching is by slug or declared name within the same tenant. A
    /// missing non-optional dependency fails with
    /// [`RuntimeError::UnresolvedRequiredDependency`]; a version mismatch
    /// with [`RuntimeError::IncompatibleDependencyVersion`]; an edge that
    /// would close a cycle with [`RuntimeError::CircularDependency`].
    /// Nothing is recorded unless every dependency resolves, so a failed
    /// resolve leaves the graph untouched.
    pub fn resolve(
        &mut self,
        instance: &PluginInstance,
        installed: &HashMap<PluginId, PluginInstance>,
    ) -> RuntimeResult<()> {
        let mut pending = Vec::new();

        for dep in &instance.manifest.dependencies {
            let found = installed.values().find(|candidate| {
                candidate.id != instance.id
                    && candidate.tenant == instance.tenant
                    && (candidate.manifest.slug == dep.slug || candidate.manifest.name == dep.slug)
            });

            let Some(found) = found else {
                if dep.optional {
                    tracing::debug!(
                        plugin = %instance.slug(),
                        dependency = %dep.slug,
                        "optional dependency not installed, skipping"
                    );
                    continue;
                }
                return Err(RuntimeError::UnresolvedRequiredDependency {
                    plugin: instance.slug().to_string(),
                    dependency: dep.slug.clone(),
                });
            };

            if !version::satisfies(&found.manifest.version, &dep.version) {
                return Err(RuntimeError::IncompatibleDependencyVersion {
                    plugin: instance.slug().to_string(),
                    dependency: dep.slug.clone(),
                    required: dep.version.clone(),
                    installed: found.manifest.version.clone(),
                });
            }

            if self.would_create_cycle(instance.id, found.id) {
                return Err(RuntimeError::CircularDependency {
                    plugin: instance.slug().to_string(),
                    dependency: dep.slug.clone(),
                });
            }

            pending.push(DependencyEdge {
                dependent: instance.id,
                dependency: found.id,
                required_version: dep.version.clone(),
                recorded_at: Utc::now(),
            });
        }

        for edge in pending {
            self.dependents.entry(edge.dependency).or_default().insert(edge.dependent);
            self.edges.entry(edge.dependent).or_default().push(edge);
        }

        Ok(())
    }

    /// Whether adding an edge from `candidate` to `new_dependency` would
    /// make `candidate` reachable from itself.
    ///
    /// Walks the transitive dependency closure of `new_dependency` and
    /// checks for `candidate`. A self-edge counts as a cycle.
    pub fn would_create_cycle(&self, candidate: PluginId, new_dependency: PluginId) -> bool {
        if candidate == new_dependency {
            return true;
        }

        let mut queue = VecDeque::from([new_dependency]);
        let mut seen = HashSet::new();

        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(edges) = self.edges.get(&current) {
                for edge in edges {
                    if edge.dependency == candidate {
                        return true;
                    }
                    queue.push_back(edge.dependency);
                }
            }
        }

        false
    }

    /// True iff no other instance has an edge whose dependency is `id`.
    pub fn can_safely_remove(&self, id: PluginId) -> bool {
        self.dependents.get(&id).map_or(true, HashSet::is_empty)
    }

    /// Instances that directly depend on `id`.
    pub fn dependents_of(&self, id: PluginId) -> Vec<PluginId> {
        self.dependents.get(&id).map(|set| set.iter().copied().collect()).unwrap_or_default()
    }

    /// Instances that `id` directly depends on.
    pub fn dependencies_of(&self, id: PluginId) -> Vec<PluginId> {
        self.edges
            .get(&id)
            .map(|edges| edges.iter().map(|e| e.dependency).collect())
            .unwrap_or_default()
    }

    /// Recorded edges declared by `id`.
    pub fn edges_of(&self, id: PluginId) -> &[DependencyEdge] {
        self.edges.get(&id).map_or(&[], Vec::as_slice)
    }

    /// Drop the edges declared by `dependent`, keeping edges pointing at it.
    ///
    /// Used by `update` before re-resolving against a new manifest.
    pub fn clear_edges(&mut self, dependent: PluginId) {
        if let Some(edges) = self.edges.remove(&dependent) {
            for edge in edges {
                if let Some(set) = self.dependents.get_mut(&edge.dependency) {
                    set.remove(&dependent);
                }
            }
        }
    }

    /// Remove every trace of an instance: its own edges, its dependents
    /// entry, and any edge other instances recorded against it.
    pub fn remove_instance(&mut self, id: PluginId) {
        self.clear_edges(id);
        self.dependents.remove(&id);
        for edges in self.edges.values_mut() {
            edges.retain(|e| e.dependency != id);
        }
    }
}
