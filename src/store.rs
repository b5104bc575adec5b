//! Registry persistence.
//!
//! The lifecycle manager writes the registry at coarse granularity: one
//! document holding every installed plugin's manifest, status,
//! configuration, and fault history, enough to reconstruct the in-memory
//! registry on restart. The storage collaborator behind the trait owns the
//! exact schema.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{RuntimeError, RuntimeResult};
use crate::instance::PluginInstance;

/// Coarse-grained persistence for the plugin registry.
pub trait RegistryStore: Send + Sync {
    /// Load every persisted plugin record.
    fn load(&self) -> RuntimeResult<Vec<PluginInstance>>;

    /// Replace the persisted registry with the given records.
    fn save(&self, instances: &[PluginInstance]) -> RuntimeResult<()>;
}

/// Registry document format.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDocument {
    plugins: Vec<PluginInstance>,
}

/// JSON-file registry store.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Create a store writing to the given file, creating parent
    /// directories as needed.
    pub fn new(path: impl Into<PathBuf>) -> RuntimeResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    /// Path of the registry file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RegistryStore for JsonFileStore {
    fn load(&self) -> RuntimeResult<Vec<PluginInstance>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&self.path)?;
        let document: RegistryDocument =
            serde_json::from_str(&content).map_err(|e| RuntimeError::Storage(e.to_string()))?;
        Ok(document.plugins)
    }

    fn save(&self, instances: &[PluginInstance]) -> RuntimeResult<()> {
        let document = RegistryDocument { plugins: instances.to_vec() };
        let content = serde_json::to_string_pretty(&document)
            .map_err(|e| RuntimeError::Storage(e.to_string()))?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

/// Store that keeps nothing; used when the embedder wants a purely
/// in-memory registry.
#[derive(Debug, Default)]
pub struct NullStore;

impl RegistryStore for NullStore {
    fn load(&self) -> RuntimeResult<Vec<PluginInstance>> {
        Ok(Vec::new())
    }

    fn save(&self, _instances: &[PluginInstance]) -> RuntimeResult<()> {
        Ok(())
    }
}
