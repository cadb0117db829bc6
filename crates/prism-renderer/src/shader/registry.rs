//! Shader registry and hot reload.
//!
//! Owns every live [`ShaderUnit`], keyed by resolved path. Units are handed
//! out as [`SharedShader`]: the registry is the only writer (during
//! [`ShaderRegistry::update`]), pipelines take read locks while building.
//! Call `update` between frames, never while a build is in flight.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use prism_common::files::normalize;
use prism_common::{FileSystem, SearchPaths};

use super::compiler::ShaderCompiler;
use super::unit::ShaderUnit;
use crate::config::ShaderConfig;
use crate::device::GpuDevice;
use crate::error::ShaderError;

/// A unit shared between the registry and the pipelines built from it.
pub type SharedShader = Arc<RwLock<ShaderUnit>>;

/// Outcome of one polling pass.
#[derive(Debug, Default)]
pub struct ReloadSummary {
    /// Units whose module was replaced.
    pub reloaded: Vec<PathBuf>,
    /// Units whose source changed but failed to rebuild; they keep their last good module.
    pub failed: Vec<(PathBuf, ShaderError)>,
}

impl ReloadSummary {
    pub fn is_empty(&self) -> bool {
        self.reloaded.is_empty() && self.failed.is_empty()
    }
}

/// Owns all loaded shader units.
pub struct ShaderRegistry {
    compiler: Arc<ShaderCompiler>,
    device: Arc<dyn GpuDevice>,
    fs: Arc<dyn FileSystem>,
    search_paths: SearchPaths,
    units: HashMap<PathBuf, SharedShader>,
}

impl ShaderRegistry {
    pub fn new(config: ShaderConfig, device: Arc<dyn GpuDevice>, fs: Arc<dyn FileSystem>) -> Self {
        let compiler = Arc::new(ShaderCompiler::new(config));
        let search_paths = compiler.config().search_paths.iter().cloned().collect();
        Self {
            compiler,
            device,
            fs,
            search_paths,
            units: HashMap::new(),
        }
    }

    pub fn compiler(&self) -> &Arc<ShaderCompiler> {
        &self.compiler
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub fn config(&self) -> &ShaderConfig {
        self.compiler.config()
    }

    /// Path a request resolves to against the search paths.
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        normalize(&self.search_paths.resolve(self.fs.as_ref(), path.as_ref()))
    }

    /// The cached unit for `path`, loading it on first request.
    ///
    /// Fails only on an unsupported extension or a missing file; a source
    /// that does not compile still yields an (invalid) unit that the next
    /// successful reload repairs.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<SharedShader, ShaderError> {
        let resolved = self.resolve(path);
        if let Some(unit) = self.units.get(&resolved) {
            return Ok(Arc::clone(unit));
        }

        let unit = ShaderUnit::new(
            resolved.clone(),
            Arc::clone(&self.compiler),
            Arc::clone(&self.device),
            Arc::clone(&self.fs),
        )?;
        let shared = Arc::new(RwLock::new(unit));
        self.units.insert(resolved, Arc::clone(&shared));
        Ok(shared)
    }

    /// Register a unit built elsewhere, such as one from [`ShaderUnit::from_spirv`].
    ///
    /// Replaces any unit already stored under the same path.
    pub fn insert(&mut self, unit: ShaderUnit) -> SharedShader {
        let key = normalize(unit.path());
        let shared = Arc::new(RwLock::new(unit));
        self.units.insert(key, Arc::clone(&shared));
        shared
    }

    /// Look up an already loaded unit.
    pub fn get(&self, path: impl AsRef<Path>) -> Option<SharedShader> {
        self.units.get(&self.resolve(path)).cloned()
    }

    /// Forget a unit. Pipelines still holding it keep it alive.
    pub fn remove(&mut self, path: impl AsRef<Path>) -> Option<SharedShader> {
        let resolved = self.resolve(path);
        self.units.remove(&resolved)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Loaded units, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&Path, &SharedShader)> {
        self.units.iter().map(|(path, unit)| (path.as_path(), unit))
    }

    /// Poll every unit's source timestamp and reload the ones that moved.
    pub fn update(&mut self) -> ReloadSummary {
        let mut summary = ReloadSummary::default();

        for (path, unit) in &self.units {
            match unit.write().update() {
                Ok(true) => summary.reloaded.push(path.clone()),
                Ok(false) => {}
                Err(e) => summary.failed.push((path.clone(), e)),
            }
        }

        if !summary.is_empty() {
            log::debug!(
                "Shader update: {} reloaded, {} failed",
                summary.reloaded.len(),
                summary.failed.len()
            );
        }
        summary
    }
}
