//! Slang front end.
//!
//! A fresh global session per compile, targeting SPIR-V with the configured
//! profile, search paths and macros. The module is loaded by name and linked
//! with every entry point it declares. The code returned is that of the
//! entry point named in the config, or the first one when none matches.
//! Semantics declared on that entry point's parameters, including nested
//! struct fields as `param.field`, are returned by variable name.

use std::path::Path;

use super::CompiledShader;
use crate::config::ShaderConfig;
use crate::error::ShaderError;

#[cfg(feature = "slang")]
pub(super) fn compile(
    config: &ShaderConfig,
    path: &Path,
    _source: &str,
) -> Result<CompiledShader, ShaderError> {
    use std::collections::BTreeMap;
    use std::ffi::CString;

    use shader_slang as slang;
    use slang::Downcast;

    use crate::shader::source::words_from_bytes;

    let compile_error = |log: String| ShaderError::Compile {
        path: path.to_path_buf(),
        log,
    };
    let link_error = |log: String| ShaderError::Link {
        path: path.to_path_buf(),
        log,
    };

    let module_name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| compile_error("shader path has no module name".to_string()))?;

    let global_session = slang::GlobalSession::new()
        .ok_or_else(|| compile_error("failed to create Slang global session".to_string()))?;

    let mut search_dirs: Vec<&Path> = config.slang_search_paths.iter().map(|p| p.as_path()).collect();
    if let Some(parent) = path.parent() {
        search_dirs.insert(0, parent);
    }
    let search_paths = search_dirs
        .iter()
        .map(|dir| CString::new(dir.to_string_lossy().as_bytes()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| compile_error(format!("invalid search path: {e}")))?;
    let search_path_ptrs: Vec<_> = search_paths.iter().map(|p| p.as_ptr()).collect();

    let mut options = slang::CompilerOptions::default();
    for (name, value) in &config.slang_macros {
        options = options.macro_define(name, value);
    }

    let target = slang::TargetDesc::default()
        .format(slang::CompileTarget::Spirv)
        .profile(global_session.find_profile(&config.slang_profile));
    let targets = [target];

    let session_desc = slang::SessionDesc::default()
        .targets(&targets)
        .search_paths(&search_path_ptrs)
        .options(&options);

    let session = global_session
        .create_session(&session_desc)
        .ok_or_else(|| compile_error("failed to create Slang session".to_string()))?;

    let module = session
        .load_module(module_name)
        .map_err(|e| compile_error(e.to_string()))?;

    let mut components = vec![module.downcast().clone()];
    for entry_point in module.entry_points() {
        components.push(entry_point.downcast().clone());
    }
    if components.len() == 1 {
        return Err(compile_error(format!("{module_name} declares no entry points")));
    }

    let program = session
        .create_composite_component_type(&components)
        .map_err(|e| link_error(e.to_string()))?;
    let linked = program.link().map_err(|e| link_error(e.to_string()))?;
    let layout = linked
        .layout(0)
        .map_err(|e| link_error(format!("no program layout: {e:?}")))?;

    let entry_point = (0..layout.entry_point_count())
        .filter_map(|index| Some((index, layout.entry_point_by_index(index)?)))
        .find(|(_, entry)| entry.name() == config.entry_point);
    let (index, semantics) = match entry_point {
        Some((index, entry)) => {
            let mut semantics = BTreeMap::new();
            for param in (0..entry.parameter_count()).filter_map(|i| entry.parameter_by_index(i)) {
                collect_semantics("", param, &mut semantics);
            }
            (index, semantics)
        }
        None => {
            log::warn!(
                "{} has no entry point named {}, using the first one",
                path.display(),
                config.entry_point
            );
            (0, BTreeMap::new())
        }
    };

    let code = linked
        .entry_point_code(index as i64, 0)
        .map_err(|e| link_error(e.to_string()))?;

    Ok(CompiledShader {
        words: words_from_bytes(code.as_slice()).map_err(link_error)?,
        semantics,
    })
}

/// Record the semantic of `variable` and of every field nested below it.
#[cfg(feature = "slang")]
fn collect_semantics(
    parent: &str,
    variable: &shader_slang::reflection::VariableLayout,
    semantics: &mut std::collections::BTreeMap<String, String>,
) {
    let Some(name) = variable.name() else {
        return;
    };
    let name = if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}.{name}")
    };

    if let Some(semantic) = variable.semantic_name() {
        semantics.insert(name.clone(), semantic.to_string());
    }

    let type_layout = variable.type_layout();
    if matches!(type_layout.kind(), shader_slang::TypeKind::Struct) {
        for field in (0..type_layout.field_count()).filter_map(|i| type_layout.field_by_index(i)) {
            collect_semantics(&name, field, semantics);
        }
    }
}

#[cfg(not(feature = "slang"))]
pub(super) fn compile(
    _config: &ShaderConfig,
    path: &Path,
    _source: &str,
) -> Result<CompiledShader, ShaderError> {
    Err(ShaderError::Unavailable {
        path: path.to_path_buf(),
        dialect: "Slang",
        feature: "slang",
    })
}
