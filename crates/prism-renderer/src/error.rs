//! Error types for shader loading and pipeline assembly.

use std::io;
use std::path::PathBuf;

use ash::vk;
use thiserror::Error;

use crate::shader::{PipelineType, PipelineTypeSet, ShaderStage};

/// Failures while loading, compiling or reflecting a shader.
#[derive(Debug, Error)]
pub enum ShaderError {
    /// The file extension selects no known dialect or stage.
    #[error("unsupported shader extension: {}", path.display())]
    UnsupportedExtension { path: PathBuf },

    /// The front end rejected the source. `log` is the compiler output verbatim.
    #[error("failed to compile {}:\n{log}", path.display())]
    Compile { path: PathBuf, log: String },

    /// Linking or code generation failed after a successful parse.
    #[error("failed to link {}:\n{log}", path.display())]
    Link { path: PathBuf, log: String },

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The bytecode could not be parsed or describes something unsupported.
    #[error("reflection failed: {0}")]
    Reflection(String),

    /// The dialect's compiler was not built into this binary.
    #[error("{dialect} sources need the `{feature}` feature: {}", path.display())]
    Unavailable {
        path: PathBuf,
        dialect: &'static str,
        feature: &'static str,
    },

    /// Creating the device shader module failed.
    #[error("failed to create shader module for {}: {result}", path.display())]
    Module { path: PathBuf, result: vk::Result },
}

impl ShaderError {
    /// Whether a reload hitting this error should keep the last good state.
    ///
    /// Everything except an unsupported extension is recoverable; an
    /// extension cannot change under a live unit.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ShaderError::UnsupportedExtension { .. })
    }
}

/// Failures while assembling a pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The stage fits none of the pipeline shapes still possible.
    #[error("{stage} shader cannot be combined into any of {remaining}")]
    IncompatibleStageCombination {
        stage: ShaderStage,
        remaining: PipelineTypeSet,
    },

    /// The resolved shape lacks one of its required stages.
    #[error("{pipeline_type} pipeline is missing its {missing} shader")]
    MissingMandatoryStage {
        pipeline_type: PipelineType,
        missing: ShaderStage,
    },

    /// More than one shape is still possible at build time.
    #[error("pipeline type is ambiguous, still possible: {remaining}")]
    Ambiguous { remaining: PipelineTypeSet },

    /// A second shader for a stage that takes only one.
    #[error("a {0} shader was already added")]
    DuplicateStage(ShaderStage),

    /// A unit whose compile never succeeded has no module to hand out.
    #[error("{stage} shader {} has no valid module", path.display())]
    InvalidShader { stage: ShaderStage, path: PathBuf },

    #[error("expected a {expected} shader, got {found}")]
    WrongStage {
        expected: ShaderStage,
        found: ShaderStage,
    },

    /// Two stages declare different descriptor types at the same slot.
    #[error("conflicting descriptor types at set {set}, binding {binding}")]
    BindingConflict { set: u32, binding: u32 },

    /// Static viewports and scissors were both given, in different numbers.
    #[error("{viewports} viewports but {scissors} scissors")]
    ViewportScissorMismatch { viewports: usize, scissors: usize },

    /// The device refused to create an object.
    #[error("failed to create {what}: {result}")]
    DeviceCreation {
        what: &'static str,
        result: vk::Result,
    },
}
