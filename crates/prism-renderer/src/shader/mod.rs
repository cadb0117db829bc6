//! Shader loading, compilation, reflection and hot reload.

pub mod analysis;
pub mod compiler;
pub mod reflect;
pub mod registry;
pub mod source;
mod stage;
pub mod unit;

pub use analysis::{AttributeAnnotation, ShaderAnalysis};
pub use compiler::{CompiledShader, ShaderCompiler};
pub use reflect::{DescriptorKind, InOut, PushConstantRange, Reflection, ResourceBinding};
pub use registry::{ReloadSummary, ShaderRegistry, SharedShader};
pub use source::Dialect;
pub use stage::{PipelineType, PipelineTypeSet, ShaderStage, ShaderStages};
pub use unit::ShaderUnit;
