#![allow(clippy::new_without_default, clippy::too_many_arguments)]
// Vulkan shader toolchain: compile, reflect, hot reload, pipeline assembly

pub mod config;
pub mod device;
pub mod error;
pub mod pipeline;
pub mod shader;

pub use config::ShaderConfig;
pub use device::{GpuDevice, HeadlessDevice, VulkanDevice};
pub use error::{PipelineError, ShaderError};
pub use pipeline::{ComputePipelineBuilder, Pipeline, PipelineBuilder};
pub use shader::{
    PipelineType, PipelineTypeSet, ShaderRegistry, ShaderStage, ShaderStages, ShaderUnit,
    SharedShader,
};
