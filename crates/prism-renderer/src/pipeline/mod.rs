//! Pipeline assembly.
//!
//! [`PipelineBuilder`] collects shader units and fixed-function state for
//! the three graphics/ray tracing shapes and rejects stage combinations as
//! soon as they become impossible. [`ComputePipelineBuilder`] handles the
//! single-stage compute case. Both produce a [`Pipeline`], which owns its
//! device objects and remembers which units it was built from.

mod builder;
mod compute;
pub mod layout;

pub use builder::PipelineBuilder;
pub use compute::ComputePipelineBuilder;
pub use layout::{LayoutBinding, LayoutDescription, PushConstantBlock};

use std::sync::Arc;

use ash::vk;

use crate::device::GpuDevice;
use crate::error::PipelineError;
use crate::shader::{PipelineType, ShaderStage, SharedShader};
use layout::OwnedLayout;

pub(crate) fn device_error(what: &'static str, result: vk::Result) -> PipelineError {
    log::error!("Failed to create {what}: {result}");
    PipelineError::DeviceCreation { what, result }
}

/// A unit a pipeline was built from, with the generation it saw.
struct StageRef {
    stage: ShaderStage,
    unit: SharedShader,
    generation: u64,
}

/// A built device pipeline.
///
/// Destroys the pipeline, and the layout objects it created, exactly once
/// on drop.
pub struct Pipeline {
    device: Arc<dyn GpuDevice>,
    handle: vk::Pipeline,
    layout: vk::PipelineLayout,
    /// `None` when the caller supplied the layout
    owned_layout: Option<OwnedLayout>,
    /// `None` for compute pipelines
    pipeline_type: Option<PipelineType>,
    bind_point: vk::PipelineBindPoint,
    stages: Vec<StageRef>,
}

impl Pipeline {
    fn new(
        device: Arc<dyn GpuDevice>,
        handle: vk::Pipeline,
        layout: vk::PipelineLayout,
        owned_layout: Option<OwnedLayout>,
        pipeline_type: Option<PipelineType>,
        stages: Vec<StageRef>,
    ) -> Self {
        let bind_point = pipeline_type.map_or(vk::PipelineBindPoint::COMPUTE, PipelineType::bind_point);
        Self {
            device,
            handle,
            layout,
            owned_layout,
            pipeline_type,
            bind_point,
            stages,
        }
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    /// Descriptor set layouts created for this pipeline, indexed by set.
    ///
    /// Empty when the layout was supplied by the caller.
    pub fn set_layouts(&self) -> &[vk::DescriptorSetLayout] {
        match &self.owned_layout {
            Some(owned) => owned.set_layouts(),
            None => &[],
        }
    }

    /// The resolved shape, `None` for a compute pipeline.
    pub fn pipeline_type(&self) -> Option<PipelineType> {
        self.pipeline_type
    }

    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        self.bind_point
    }

    /// Stages in pipeline order, with their units.
    pub fn stages(&self) -> impl Iterator<Item = (ShaderStage, &SharedShader)> {
        self.stages.iter().map(|s| (s.stage, &s.unit))
    }

    /// Whether any unit was rebuilt since this pipeline was created.
    pub fn is_stale(&self) -> bool {
        self.stages
            .iter()
            .any(|s| s.unit.read().generation() != s.generation)
    }

    pub fn bind(&self, command_buffer: vk::CommandBuffer) {
        self.device
            .cmd_bind_pipeline(command_buffer, self.bind_point, self.handle);
    }

    pub fn bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        self.device.cmd_bind_descriptor_sets(
            command_buffer,
            self.bind_point,
            self.layout,
            first_set,
            sets,
        );
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.device.destroy_pipeline(self.handle);
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("handle", &self.handle)
            .field("layout", &self.layout)
            .field("pipeline_type", &self.pipeline_type)
            .field("stages", &self.stages.iter().map(|s| s.stage).collect::<Vec<_>>())
            .finish()
    }
}
