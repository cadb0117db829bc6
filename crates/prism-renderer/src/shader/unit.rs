//! A single compiled shader.
//!
//! A [`ShaderUnit`] owns the SPIR-V words, the reflected layout and the
//! device shader module for one source file. It is rebuilt in place on hot
//! reload: the new state only replaces the old one once compile, reflection
//! and module creation have all succeeded, so a broken edit leaves the last
//! good module in service and the unit flagged invalid.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use ash::vk;
use prism_common::FileSystem;

use super::analysis::{self, AttributeAnnotation, ShaderAnalysis};
use super::compiler::ShaderCompiler;
use super::reflect::{self, InOut, PushConstantRange, Reflection, ResourceBinding};
use super::source::{self, Dialect, ShaderSource};
use super::ShaderStage;
use crate::config::ShaderConfig;
use crate::device::GpuDevice;
use crate::error::ShaderError;

/// One shader source, compiled, reflected and loaded on the device.
pub struct ShaderUnit {
    path: PathBuf,
    dialect: Dialect,
    stage: ShaderStage,
    code: Vec<u32>,
    module: vk::ShaderModule,
    reflection: Reflection,
    attributes: Vec<AttributeAnnotation>,
    /// Source timestamp seen by the last reload attempt
    modified: Option<SystemTime>,
    valid: bool,
    changed: bool,
    /// Bumped every time the module is replaced
    generation: u64,
    compiler: Arc<ShaderCompiler>,
    device: Arc<dyn GpuDevice>,
    /// `None` for units built from in-memory words, which never reload.
    fs: Option<Arc<dyn FileSystem>>,
}

impl ShaderUnit {
    /// Load and compile a shader file.
    ///
    /// An unsupported extension or a missing file is an error. A compile,
    /// reflection or module failure is logged and yields an invalid unit that
    /// becomes valid once the source is fixed and reloaded.
    pub fn new(
        path: impl Into<PathBuf>,
        compiler: Arc<ShaderCompiler>,
        device: Arc<dyn GpuDevice>,
        fs: Arc<dyn FileSystem>,
    ) -> Result<Self, ShaderError> {
        let path = path.into();
        let (dialect, stage) = source::detect(&path)?;
        let modified = fs.modified(&path).map_err(|source| ShaderError::Io {
            path: path.clone(),
            source,
        })?;

        let mut unit = Self {
            reflection: Reflection::empty(stage),
            path,
            dialect,
            stage,
            code: Vec::new(),
            module: vk::ShaderModule::null(),
            attributes: Vec::new(),
            modified: Some(modified),
            valid: false,
            changed: false,
            generation: 0,
            compiler,
            device,
            fs: Some(fs),
        };

        match unit.rebuild() {
            Ok(_) => log::info!("Compiled {} shader {}", unit.stage, unit.path.display()),
            Err(e) => log::warn!("{e}"),
        }
        Ok(unit)
    }

    /// Wrap already compiled SPIR-V. The stage comes from the module itself.
    ///
    /// `label` names the unit in diagnostics only. Such a unit has no source
    /// file and never reloads.
    pub fn from_spirv(
        label: impl Into<PathBuf>,
        code: Vec<u32>,
        compiler: Arc<ShaderCompiler>,
        device: Arc<dyn GpuDevice>,
    ) -> Result<Self, ShaderError> {
        let path = label.into();
        let reflection = reflect::reflect(&code, compiler.config(), &Default::default())?;
        let module = device
            .create_shader_module(&code)
            .map_err(|result| ShaderError::Module {
                path: path.clone(),
                result,
            })?;

        log::debug!("Loaded {} shader {} from memory", reflection.stage, path.display());
        Ok(Self {
            path,
            dialect: Dialect::Spirv,
            stage: reflection.stage,
            code,
            module,
            reflection,
            attributes: Vec::new(),
            modified: None,
            valid: true,
            changed: false,
            generation: 1,
            compiler,
            device,
            fs: None,
        })
    }

    /// Recompile from the current source.
    ///
    /// Returns whether the module was replaced. Identical output leaves the
    /// module alone and reports no change. On failure the previous code and
    /// module stay in place and the unit is marked invalid.
    pub fn reload(&mut self) -> Result<bool, ShaderError> {
        let Some(fs) = self.fs.as_ref() else {
            self.changed = false;
            return Ok(false);
        };
        if let Ok(modified) = fs.modified(&self.path) {
            self.modified = Some(modified);
        }

        match self.rebuild() {
            Ok(changed) => {
                self.changed = changed;
                if changed {
                    log::info!("Reloaded {} shader {}", self.stage, self.path.display());
                }
                Ok(changed)
            }
            Err(e) => {
                self.valid = false;
                self.changed = false;
                log::warn!("{e}");
                Err(e)
            }
        }
    }

    /// Reload if the source timestamp moved since the last attempt.
    ///
    /// The new timestamp is recorded even when the reload fails, so a broken
    /// source is only retried after it is saved again.
    pub fn update(&mut self) -> Result<bool, ShaderError> {
        let Some(fs) = self.fs.as_ref() else {
            self.changed = false;
            return Ok(false);
        };

        let modified = match fs.modified(&self.path) {
            Ok(modified) => modified,
            Err(e) => {
                log::trace!("Cannot stat {}: {e}", self.path.display());
                self.changed = false;
                return Ok(false);
            }
        };

        if self.modified == Some(modified) {
            self.changed = false;
            return Ok(false);
        }

        log::trace!("{} changed on disk", self.path.display());
        self.reload()
    }

    fn rebuild(&mut self) -> Result<bool, ShaderError> {
        let Some(fs) = self.fs.as_ref() else {
            return Ok(false);
        };
        let config = self.compiler.config();

        let source = source::load(fs.as_ref(), &self.path, self.dialect)?;
        let attributes = match &source {
            ShaderSource::Text(text) => analysis::scan_attributes(text, config),
            ShaderSource::Binary(_) => Vec::new(),
        };
        let compiled = self
            .compiler
            .compile_annotated(&self.path, &source, self.dialect, self.stage)?;
        let code = compiled.words;
        let mut hints = analysis::semantic_hints(&attributes);
        hints.by_name = compiled.semantics;

        // Same module: annotations may still have moved, so refresh semantics only
        if code == self.code && self.module != vk::ShaderModule::null() {
            reflect::apply_semantics(&mut self.reflection, config, &hints);
            self.attributes = attributes;
            self.valid = true;
            return Ok(false);
        }

        let reflection = reflect::reflect(&code, config, &hints)?;
        if reflection.stage != self.stage {
            return Err(ShaderError::Compile {
                path: self.path.clone(),
                log: format!(
                    "declared as a {} shader but the module is {}",
                    self.stage, reflection.stage
                ),
            });
        }

        let module = self
            .device
            .create_shader_module(&code)
            .map_err(|result| ShaderError::Module {
                path: self.path.clone(),
                result,
            })?;

        if self.module != vk::ShaderModule::null() {
            self.device.destroy_shader_module(self.module);
        }
        self.module = module;
        self.code = code;
        self.reflection = reflection;
        self.attributes = attributes;
        self.valid = true;
        self.generation += 1;
        Ok(true)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    /// SPIR-V words of the current module, empty before the first good compile.
    pub fn code(&self) -> &[u32] {
        &self.code
    }

    /// Device module, null before the first good compile.
    pub fn module(&self) -> vk::ShaderModule {
        self.module
    }

    pub fn entry_point(&self) -> &str {
        &self.reflection.entry_point
    }

    pub fn reflection(&self) -> &Reflection {
        &self.reflection
    }

    pub fn bindings(&self) -> impl Iterator<Item = &ResourceBinding> {
        self.reflection.bindings.values()
    }

    pub fn push_constants(&self) -> &[PushConstantRange] {
        &self.reflection.push_constants
    }

    pub fn inputs(&self) -> &[InOut] {
        &self.reflection.inputs
    }

    pub fn outputs(&self) -> &[InOut] {
        &self.reflection.outputs
    }

    pub fn attributes(&self) -> &[AttributeAnnotation] {
        &self.attributes
    }

    pub fn modified(&self) -> Option<SystemTime> {
        self.modified
    }

    /// False after a failed compile, until the next successful one.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Whether the last reload or update replaced the module.
    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn config(&self) -> &ShaderConfig {
        self.compiler.config()
    }

    /// Serializable summary: name, path, stage and annotated inputs.
    pub fn analysis(&self) -> ShaderAnalysis {
        ShaderAnalysis::new(&self.path, self.stage, self.attributes.clone())
    }

    /// Human readable listing of the reflected interface.
    pub fn layout_report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} shader {} (entry point {}){}",
            self.stage,
            self.path.display(),
            self.entry_point(),
            if self.valid { "" } else { " [invalid]" }
        );

        for (direction, list) in [("in", self.inputs()), ("out", self.outputs())] {
            for io in list {
                let semantic = if io.semantic.is_empty() {
                    String::new()
                } else {
                    format!("{} : ", io.semantic)
                };
                let _ = writeln!(
                    out,
                    "layout (location = {}) {direction} {} : {semantic}{:?};",
                    io.location, io.name, io.format
                );
            }
        }
        for binding in self.bindings() {
            let _ = writeln!(
                out,
                "layout (set = {}, binding = {}) uniform {} {} count: {};",
                binding.set,
                binding.binding,
                binding.kind.name(),
                binding.name,
                binding.count
            );
        }
        for range in self.push_constants() {
            let _ = writeln!(
                out,
                "push constant range {} size: {} offset: {}",
                range.name, range.size, range.offset
            );
        }
        out
    }
}

impl Drop for ShaderUnit {
    fn drop(&mut self) {
        if self.module != vk::ShaderModule::null() {
            self.device.destroy_shader_module(self.module);
        }
    }
}

impl std::fmt::Debug for ShaderUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderUnit")
            .field("path", &self.path)
            .field("stage", &self.stage)
            .field("module", &self.module)
            .field("valid", &self.valid)
            .field("changed", &self.changed)
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::device::mock::MockDevice;
    use crate::shader::reflect::tests::Fixture;
    use prism_common::MemoryFileSystem;
    use rspirv::spirv::ExecutionModel;

    pub(crate) const VERT: &str = r#"#version 450
#pragma POSITION
layout(location = 0) in vec3 position;
layout(location = 0) out vec3 v_color;

void main() {
    v_color = position * 0.5 + 0.5;
    gl_Position = vec4(position, 1.0);
}
"#;

    pub(crate) const FRAG: &str = r#"#version 450
layout(location = 0) in vec3 v_color;
layout(location = 0) out vec4 color;

void main() {
    color = vec4(v_color, 1.0);
}
"#;

    const FRAG_EDITED: &str = r#"#version 450
layout(location = 0) in vec3 v_color;
layout(location = 0) out vec4 color;

void main() {
    color = vec4(v_color.bgr, 1.0);
}
"#;

    pub(crate) struct Env {
        pub fs: Arc<MemoryFileSystem>,
        pub device: Arc<MockDevice>,
        pub compiler: Arc<ShaderCompiler>,
    }

    impl Env {
        pub fn new() -> Self {
            Self::with_config(ShaderConfig::default())
        }

        pub fn with_config(config: ShaderConfig) -> Self {
            Self {
                fs: Arc::new(MemoryFileSystem::new()),
                device: Arc::new(MockDevice::new()),
                compiler: Arc::new(ShaderCompiler::new(config)),
            }
        }

        pub fn unit(&self, path: &str) -> Result<ShaderUnit, ShaderError> {
            ShaderUnit::new(
                path,
                Arc::clone(&self.compiler),
                self.device.clone(),
                self.fs.clone(),
            )
        }

        /// A unit for a stage GLSL cannot express, built from assembled words.
        pub fn assembled(&self, model: ExecutionModel) -> ShaderUnit {
            ShaderUnit::from_spirv(
                format!("{model:?}"),
                Fixture::new(model).words(),
                Arc::clone(&self.compiler),
                self.device.clone(),
            )
            .unwrap()
        }
    }

    // ============================================================
    // Construction
    // ============================================================

    #[test]
    fn test_new_compiles_and_reflects() {
        let env = Env::new();
        env.fs.write("lit.vert", VERT);
        let unit = env.unit("lit.vert").unwrap();

        assert!(unit.is_valid());
        assert!(!unit.changed());
        assert_eq!(unit.stage(), ShaderStage::Vertex);
        assert_eq!(unit.dialect(), Dialect::Glsl);
        assert_ne!(unit.module(), vk::ShaderModule::null());
        assert_eq!(unit.entry_point(), "main");
        assert_eq!(unit.inputs().len(), 1);
        assert_eq!(unit.inputs()[0].semantic, "POSITION");
        assert_eq!(unit.generation(), 1);
        assert_eq!(env.device.live_modules(), 1);
    }

    #[test]
    fn test_new_unsupported_extension_is_fatal() {
        let env = Env::new();
        env.fs.write("lit.hlsl", "float4 main() : SV_Target { return 0; }");
        assert!(matches!(
            env.unit("lit.hlsl"),
            Err(ShaderError::UnsupportedExtension { .. })
        ));
    }

    #[test]
    fn test_new_missing_file_is_io_error() {
        let env = Env::new();
        assert!(matches!(env.unit("gone.frag"), Err(ShaderError::Io { .. })));
    }

    #[test]
    fn test_new_compile_failure_is_recoverable() {
        let env = Env::new();
        env.fs.write("lit.frag", "#version 450\nvoid main( {");
        let mut unit = env.unit("lit.frag").unwrap();
        assert!(!unit.is_valid());
        assert_eq!(unit.module(), vk::ShaderModule::null());
        assert!(unit.code().is_empty());
        assert_eq!(env.device.live_modules(), 0);

        env.fs.write("lit.frag", FRAG);
        assert!(unit.update().unwrap());
        assert!(unit.is_valid());
        assert!(unit.changed());
        assert_eq!(env.device.live_modules(), 1);
    }

    #[test]
    fn test_precompiled_stage_mismatch_is_invalid() {
        let env = Env::new();
        let words = Fixture::new(ExecutionModel::Fragment).words();
        let bytes: Vec<u8> = bytemuck::cast_slice(&words).to_vec();
        env.fs.write("wrong.vert.spv", bytes);
        let unit = env.unit("wrong.vert.spv").unwrap();
        assert!(!unit.is_valid());
        assert_eq!(env.device.live_modules(), 0);
    }

    #[test]
    fn test_precompiled_loads() {
        let env = Env::new();
        let words = Fixture::new(ExecutionModel::Fragment).words();
        env.fs.write("pre.frag.spv", bytemuck::cast_slice::<u32, u8>(&words));
        let unit = env.unit("pre.frag.spv").unwrap();
        assert!(unit.is_valid());
        assert_eq!(unit.dialect(), Dialect::Spirv);
        assert_eq!(unit.code(), words.as_slice());
    }

    #[test]
    fn test_from_spirv_takes_stage_from_module() {
        let env = Env::new();
        let mut unit = env.assembled(ExecutionModel::RayGenerationKHR);
        assert_eq!(unit.stage(), ShaderStage::Raygen);
        assert!(unit.is_valid());
        assert!(!unit.reload().unwrap());
        assert!(!unit.update().unwrap());
    }

    // ============================================================
    // Reload
    // ============================================================

    #[test]
    fn test_reload_without_change_is_idempotent() {
        let env = Env::new();
        env.fs.write("lit.frag", FRAG);
        let mut unit = env.unit("lit.frag").unwrap();
        let code = unit.code().to_vec();
        let module = unit.module();

        assert!(!unit.reload().unwrap());
        assert!(!unit.reload().unwrap());
        assert!(!unit.changed());
        assert_eq!(unit.code(), code.as_slice());
        assert_eq!(unit.module(), module);
        assert_eq!(env.device.modules_created.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn test_reload_failure_keeps_last_good_state() {
        let env = Env::new();
        env.fs.write("lit.frag", FRAG);
        let mut unit = env.unit("lit.frag").unwrap();
        let code = unit.code().to_vec();
        let module = unit.module();

        env.fs.write("lit.frag", "#version 450\nvoid main() { color = ; }");
        let err = unit.reload().unwrap_err();
        assert!(err.is_recoverable());
        assert!(matches!(err, ShaderError::Compile { .. }));

        assert!(!unit.is_valid());
        assert!(!unit.changed());
        assert_eq!(unit.module(), module);
        assert_eq!(unit.code(), code.as_slice());
        assert_eq!(env.device.live_modules(), 1);
    }

    #[test]
    fn test_reload_replaces_module_once() {
        let env = Env::new();
        env.fs.write("lit.frag", FRAG);
        let mut unit = env.unit("lit.frag").unwrap();
        let old = unit.module();

        env.fs.write("lit.frag", FRAG_EDITED);
        assert!(unit.reload().unwrap());
        assert!(unit.changed());
        assert_ne!(unit.module(), old);
        assert_eq!(unit.generation(), 2);
        assert_eq!(env.device.live_modules(), 1);
        assert_eq!(env.device.modules_destroyed.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn test_annotation_only_edit_refreshes_semantics() {
        // Without debug info the source text stays out of the module
        let env = Env::with_config(ShaderConfig::default().debug_info(false));
        env.fs.write("lit.vert", VERT);
        let mut unit = env.unit("lit.vert").unwrap();
        assert_eq!(unit.inputs()[0].semantic, "POSITION");
        let module = unit.module();

        // Pragmas do not reach the SPIR-V, so the module is kept as is
        env.fs.write("lit.vert", VERT.replace("#pragma POSITION", "#pragma NORMAL"));
        assert!(!unit.update().unwrap());
        assert_eq!(unit.module(), module);
        assert_eq!(unit.generation(), 1);

        assert_eq!(unit.attributes()[0].attribute, "NORMAL");
        assert_eq!(unit.inputs()[0].semantic, "NORMAL");
        assert!(unit.layout_report().contains("NORMAL : R32G32B32_SFLOAT;"));

        env.fs.write("lit.vert", VERT.replace("#pragma POSITION", "#pragma TANGENT"));
        assert!(!unit.update().unwrap());
        assert_eq!(unit.inputs()[0].semantic, "TANGENT");
        assert_eq!(env.device.live_modules(), 1);
    }

    #[test]
    fn test_module_failure_on_reload_keeps_module() {
        let env = Env::new();
        env.fs.write("lit.frag", FRAG);
        let mut unit = env.unit("lit.frag").unwrap();
        let module = unit.module();

        env.device
            .fail_modules
            .store(true, std::sync::atomic::Ordering::Relaxed);
        env.fs.write("lit.frag", FRAG_EDITED);
        assert!(matches!(unit.reload(), Err(ShaderError::Module { .. })));
        assert!(!unit.is_valid());
        assert_eq!(unit.module(), module);
    }

    // ============================================================
    // Polling
    // ============================================================

    #[test]
    fn test_update_only_reloads_on_new_timestamp() {
        let env = Env::new();
        env.fs.write("lit.frag", FRAG);
        let mut unit = env.unit("lit.frag").unwrap();

        assert!(!unit.update().unwrap());

        // Same timestamp, new contents: not noticed
        env.fs.write_preserving_time("lit.frag", FRAG_EDITED);
        assert!(!unit.update().unwrap());
        assert_eq!(unit.generation(), 1);

        env.fs.touch("lit.frag");
        assert!(unit.update().unwrap());
        assert!(unit.changed());
        assert_eq!(unit.generation(), 2);

        assert!(!unit.update().unwrap());
        assert!(!unit.changed());
    }

    #[test]
    fn test_failed_update_retries_only_after_next_save() {
        let env = Env::new();
        env.fs.write("lit.frag", FRAG);
        let mut unit = env.unit("lit.frag").unwrap();

        env.fs.write("lit.frag", "#version 450\nvoid main( {");
        assert!(unit.update().is_err());
        // Timestamp recorded, so no retry until the file changes again
        assert!(!unit.update().unwrap());
        assert!(!unit.is_valid());

        env.fs.write("lit.frag", FRAG);
        // Same code as the last good module: valid again without a new module
        assert!(!unit.update().unwrap());
        assert!(unit.is_valid());
        assert_eq!(env.device.live_modules(), 1);
    }

    #[test]
    fn test_update_survives_deleted_source() {
        let env = Env::new();
        env.fs.write("lit.frag", FRAG);
        let mut unit = env.unit("lit.frag").unwrap();
        env.fs.remove("lit.frag");
        assert!(!unit.update().unwrap());
        assert!(unit.is_valid());
    }

    // ============================================================
    // Reports
    // ============================================================

    #[test]
    fn test_layout_report_and_analysis() {
        let env = Env::new();
        env.fs.write("lit.vert", VERT);
        let unit = env.unit("lit.vert").unwrap();

        let report = unit.layout_report();
        assert!(report.starts_with("vertex shader lit.vert"));
        assert!(report.contains("layout (location = 0) in"));
        assert!(report.contains("POSITION : R32G32B32_SFLOAT;"));

        let analysis = unit.analysis();
        assert_eq!(analysis.name, "lit.vert");
        assert_eq!(analysis.stage, ShaderStage::Vertex);
        assert_eq!(analysis.inputs.len(), 1);
        assert_eq!(analysis.inputs[0].attribute, "POSITION");
    }

    #[test]
    fn test_drop_destroys_module_once() {
        let env = Env::new();
        env.fs.write("lit.frag", FRAG);
        let unit = env.unit("lit.frag").unwrap();
        assert_eq!(env.device.live_modules(), 1);
        drop(unit);
        assert_eq!(env.device.live_modules(), 0);
        assert_eq!(env.device.modules_destroyed.load(std::sync::atomic::Ordering::Relaxed), 1);
    }
}
