//! GLSL front end.
//!
//! glslang through shaderc by default. Built without the `shaderc` feature,
//! naga takes over for the stages it supports.

use std::path::Path;

use crate::config::ShaderConfig;
use crate::error::ShaderError;
use crate::shader::ShaderStage;

// ============================================================================
// naga (fallback without `shaderc`)
// ============================================================================

#[cfg(not(feature = "shaderc"))]
pub(super) fn compile(
    config: &ShaderConfig,
    path: &Path,
    source: &str,
    stage: ShaderStage,
) -> Result<Vec<u32>, ShaderError> {
    use naga::back::spv;
    use naga::front::glsl;
    use naga::valid::{Capabilities, ValidationFlags, Validator};

    let naga_stage = match stage {
        ShaderStage::Vertex => naga::ShaderStage::Vertex,
        ShaderStage::Fragment => naga::ShaderStage::Fragment,
        ShaderStage::Compute => naga::ShaderStage::Compute,
        _ => {
            return Err(ShaderError::Unavailable {
                path: path.to_path_buf(),
                dialect: "GLSL tessellation, geometry, task and mesh",
                feature: "shaderc",
            })
        }
    };

    let mut frontend = glsl::Frontend::default();
    let module = frontend
        .parse(&glsl::Options::from(naga_stage), source)
        .map_err(|e| ShaderError::Compile {
            path: path.to_path_buf(),
            log: e.emit_to_string(source),
        })?;

    let info = Validator::new(ValidationFlags::all(), Capabilities::all())
        .validate(&module)
        .map_err(|e| ShaderError::Link {
            path: path.to_path_buf(),
            log: e.emit_to_string(source),
        })?;

    let mut flags = spv::WriterFlags::empty();
    if config.debug_info {
        flags |= spv::WriterFlags::DEBUG | spv::WriterFlags::LABEL_VARYINGS;
    }
    let options = spv::Options {
        lang_version: config.spirv_version,
        flags,
        ..Default::default()
    };

    spv::write_vec(&module, &info, &options, None).map_err(|e| ShaderError::Link {
        path: path.to_path_buf(),
        log: e.to_string(),
    })
}

// ============================================================================
// glslang through shaderc (default)
// ============================================================================

#[cfg(feature = "shaderc")]
pub(super) fn compile(
    config: &ShaderConfig,
    path: &Path,
    source: &str,
    stage: ShaderStage,
) -> Result<Vec<u32>, ShaderError> {
    use shaderc::{CompileOptions, Compiler, EnvVersion, ShaderKind, SpirvVersion, TargetEnv};

    let setup_error = |what: &str| ShaderError::Compile {
        path: path.to_path_buf(),
        log: format!("failed to initialize shaderc {what}"),
    };

    let kind = match stage {
        ShaderStage::Vertex => ShaderKind::Vertex,
        ShaderStage::TessControl => ShaderKind::TessControl,
        ShaderStage::TessEval => ShaderKind::TessEvaluation,
        ShaderStage::Geometry => ShaderKind::Geometry,
        ShaderStage::Fragment => ShaderKind::Fragment,
        ShaderStage::Compute => ShaderKind::Compute,
        ShaderStage::Task => ShaderKind::Task,
        ShaderStage::Mesh => ShaderKind::Mesh,
        other => {
            return Err(ShaderError::Compile {
                path: path.to_path_buf(),
                log: format!("{other} shaders have no GLSL extension"),
            })
        }
    };

    let env_version = match config.vulkan_version {
        (1, 0) => EnvVersion::Vulkan1_0,
        (1, 1) => EnvVersion::Vulkan1_1,
        (1, 2) => EnvVersion::Vulkan1_2,
        _ => EnvVersion::Vulkan1_3,
    };
    let spirv_version = match config.spirv_version {
        (1, 0) => SpirvVersion::V1_0,
        (1, 1) => SpirvVersion::V1_1,
        (1, 2) => SpirvVersion::V1_2,
        (1, 3) => SpirvVersion::V1_3,
        (1, 4) => SpirvVersion::V1_4,
        (1, 5) => SpirvVersion::V1_5,
        _ => SpirvVersion::V1_6,
    };

    let compiler = Compiler::new().ok_or_else(|| setup_error("compiler"))?;
    let mut options = CompileOptions::new().ok_or_else(|| setup_error("options"))?;
    options.set_target_env(TargetEnv::Vulkan, env_version as u32);
    options.set_target_spirv(spirv_version);
    if config.debug_info {
        options.set_generate_debug_info();
    }

    let file_name = path.to_string_lossy();
    let artifact = compiler
        .compile_into_spirv(source, kind, &file_name, &config.entry_point, Some(&options))
        .map_err(|e| ShaderError::Compile {
            path: path.to_path_buf(),
            log: e.to_string(),
        })?;

    if artifact.get_num_warnings() > 0 {
        log::warn!("{}: {}", path.display(), artifact.get_warning_messages());
    }

    Ok(artifact.as_binary().to_vec())
}
