//! Front-end compilers: shader source to SPIR-V words.
//!
//! GLSL goes through glslang (the default `shaderc` feature), or through
//! naga when built without it. Slang needs the `slang` feature. Every
//! compile holds the compiler's lock for its full duration, so overlapping
//! calls from several threads are serialized.

mod glsl;
mod slang;

use std::collections::BTreeMap;
use std::path::Path;

use parking_lot::Mutex;

use super::source::{Dialect, ShaderSource, SPIRV_MAGIC};
use super::ShaderStage;
use crate::config::ShaderConfig;
use crate::error::ShaderError;

/// Output of one front-end run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledShader {
    pub words: Vec<u32>,
    /// Semantics the front end reported, keyed by variable name
    pub semantics: BTreeMap<String, String>,
}

/// Compiles shader sources to SPIR-V.
pub struct ShaderCompiler {
    config: ShaderConfig,
    /// Held across each compile; the front ends keep process-wide state.
    lock: Mutex<()>,
}

impl ShaderCompiler {
    pub fn new(config: ShaderConfig) -> Self {
        Self {
            config: config.validated(),
            lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ShaderConfig {
        &self.config
    }

    /// Produce SPIR-V words for `source`.
    ///
    /// `path` is used for diagnostics and, for Slang, to name the module.
    /// Precompiled binaries are passed through after a header check.
    pub fn compile(
        &self,
        path: &Path,
        source: &ShaderSource,
        dialect: Dialect,
        stage: ShaderStage,
    ) -> Result<Vec<u32>, ShaderError> {
        self.compile_annotated(path, source, dialect, stage)
            .map(|compiled| compiled.words)
    }

    /// Like [`compile`](Self::compile), also returning the semantics the
    /// front end reported for entry point parameters.
    pub fn compile_annotated(
        &self,
        path: &Path,
        source: &ShaderSource,
        dialect: Dialect,
        stage: ShaderStage,
    ) -> Result<CompiledShader, ShaderError> {
        let _guard = self.lock.lock();

        let compiled = match (dialect, source) {
            (Dialect::Glsl, ShaderSource::Text(text)) => CompiledShader {
                words: glsl::compile(&self.config, path, text, stage)?,
                semantics: BTreeMap::new(),
            },
            (Dialect::Slang, ShaderSource::Text(text)) => slang::compile(&self.config, path, text)?,
            (_, ShaderSource::Binary(words)) => CompiledShader {
                words: words.clone(),
                semantics: BTreeMap::new(),
            },
            (Dialect::Spirv, ShaderSource::Text(_)) => {
                return Err(ShaderError::Compile {
                    path: path.to_path_buf(),
                    log: "precompiled shader was read as text".to_string(),
                })
            }
        };

        let words = &compiled.words;
        if words.len() < 5 || words[0] != SPIRV_MAGIC {
            return Err(ShaderError::Link {
                path: path.to_path_buf(),
                log: format!("front end produced no valid SPIR-V ({} words)", words.len()),
            });
        }

        log::debug!(
            "Compiled {} ({} {}, {} words)",
            path.display(),
            dialect.name(),
            stage,
            words.len()
        );
        Ok(compiled)
    }
}
