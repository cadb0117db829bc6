//! Graphics and ray tracing pipeline builder.
//!
//! The builder tracks the set of pipeline shapes (VTG, task/mesh, ray
//! tracing) still compatible with the stages added so far. The set starts
//! full and only shrinks; a stage that would empty it is rejected right
//! away. `build` requires exactly one shape left with all of its mandatory
//! stages present.

use std::ffi::CString;
use std::sync::Arc;

use ash::vk;

use super::layout::LayoutDescription;
use super::{device_error, Pipeline, StageRef};
use crate::device::GpuDevice;
use crate::error::PipelineError;
use crate::shader::{PipelineType, PipelineTypeSet, ShaderStage, SharedShader};

/// Stages a pipeline may contain more than once.
fn allows_several(stage: ShaderStage) -> bool {
    matches!(stage, ShaderStage::Miss | ShaderStage::Callable)
}

/// Ray tracing stage order: general shaders first, then the hit group.
fn ray_tracing_rank(stage: ShaderStage) -> u8 {
    match stage {
        ShaderStage::Raygen => 0,
        ShaderStage::Miss => 1,
        ShaderStage::Callable => 2,
        ShaderStage::ClosestHit => 3,
        ShaderStage::AnyHit => 4,
        ShaderStage::Intersection => 5,
        _ => 6,
    }
}

/// Accumulates shaders and fixed-function state for one pipeline.
pub struct PipelineBuilder {
    device: Arc<dyn GpuDevice>,
    shaders: Vec<(ShaderStage, SharedShader)>,
    remaining: PipelineTypeSet,

    vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    topology: vk::PrimitiveTopology,
    primitive_restart: bool,
    patch_control_points: u32,
    viewports: Vec<vk::Viewport>,
    scissors: Vec<vk::Rect2D>,
    rasterization: vk::PipelineRasterizationStateCreateInfo<'static>,
    depth_stencil: vk::PipelineDepthStencilStateCreateInfo<'static>,
    multisample: vk::PipelineMultisampleStateCreateInfo<'static>,
    color_blend_attachments: Vec<vk::PipelineColorBlendAttachmentState>,
    blend_constants: [f32; 4],
    logic_op: Option<vk::LogicOp>,
    dynamic_states: Vec<vk::DynamicState>,

    layout: Option<vk::PipelineLayout>,
    render_pass: vk::RenderPass,
    subpass: u32,
    color_formats: Vec<vk::Format>,
    depth_format: vk::Format,
    stencil_format: vk::Format,

    base_pipeline: vk::Pipeline,
    allow_derivatives: bool,
    max_recursion_depth: u32,
}

impl std::fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stages: Vec<ShaderStage> = self.shaders.iter().map(|(stage, _)| *stage).collect();
        f.debug_struct("PipelineBuilder")
            .field("stages", &stages)
            .field("remaining", &self.remaining)
            .field("layout", &self.layout)
            .field("render_pass", &self.render_pass)
            .finish()
    }
}

impl PipelineBuilder {
    pub fn new(device: Arc<dyn GpuDevice>) -> Self {
        Self {
            device,
            shaders: Vec::new(),
            remaining: PipelineTypeSet::all(),
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            primitive_restart: false,
            patch_control_points: 3,
            viewports: Vec::new(),
            scissors: Vec::new(),
            rasterization: vk::PipelineRasterizationStateCreateInfo::default()
                .polygon_mode(vk::PolygonMode::FILL)
                .cull_mode(vk::CullModeFlags::BACK)
                .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
                .line_width(1.0),
            depth_stencil: vk::PipelineDepthStencilStateCreateInfo::default()
                .depth_test_enable(true)
                .depth_write_enable(true)
                .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL),
            multisample: vk::PipelineMultisampleStateCreateInfo::default()
                .rasterization_samples(vk::SampleCountFlags::TYPE_1),
            color_blend_attachments: Vec::new(),
            blend_constants: [0.0; 4],
            logic_op: None,
            dynamic_states: Vec::new(),
            layout: None,
            render_pass: vk::RenderPass::null(),
            subpass: 0,
            color_formats: Vec::new(),
            depth_format: vk::Format::UNDEFINED,
            stencil_format: vk::Format::UNDEFINED,
            base_pipeline: vk::Pipeline::null(),
            allow_derivatives: false,
            max_recursion_depth: 1,
        }
    }

    /// Shapes still reachable with the stages added so far.
    pub fn remaining(&self) -> PipelineTypeSet {
        self.remaining
    }

    pub fn has_stage(&self, stage: ShaderStage) -> bool {
        self.shaders.iter().any(|(s, _)| *s == stage)
    }

    /// Add a shader unit.
    ///
    /// Fails when the unit's stage fits none of the remaining shapes (the
    /// pipeline could never be built) or when the stage is already taken.
    pub fn add_shader(&mut self, shader: &SharedShader) -> Result<&mut Self, PipelineError> {
        let stage = shader.read().stage();

        if !allows_several(stage) && self.has_stage(stage) {
            return Err(PipelineError::DuplicateStage(stage));
        }

        let next = self.remaining & stage.pipeline_types();
        if next.is_empty() {
            return Err(PipelineError::IncompatibleStageCombination {
                stage,
                remaining: self.remaining,
            });
        }

        log::debug!("Added {stage} shader, pipeline may be {next}");
        self.remaining = next;
        self.shaders.push((stage, Arc::clone(shader)));
        Ok(self)
    }

    pub fn vertex_input(
        &mut self,
        bindings: &[vk::VertexInputBindingDescription],
        attributes: &[vk::VertexInputAttributeDescription],
    ) -> &mut Self {
        self.vertex_bindings = bindings.to_vec();
        self.vertex_attributes = attributes.to_vec();
        self
    }

    pub fn input_assembly(&mut self, topology: vk::PrimitiveTopology, primitive_restart: bool) -> &mut Self {
        self.topology = topology;
        self.primitive_restart = primitive_restart;
        self
    }

    /// Patch size, used when a tessellation control shader is present.
    pub fn tessellation(&mut self, patch_control_points: u32) -> &mut Self {
        self.patch_control_points = patch_control_points;
        self
    }

    /// Add a static viewport. With none, the viewports are dynamic and as
    /// many as the static scissors (at least one).
    pub fn viewport(&mut self, viewport: vk::Viewport) -> &mut Self {
        self.viewports.push(viewport);
        self
    }

    /// Add a static scissor. With none, the scissors are dynamic and as
    /// many as the static viewports (at least one).
    pub fn scissor(&mut self, scissor: vk::Rect2D) -> &mut Self {
        self.scissors.push(scissor);
        self
    }

    pub fn rasterization(&mut self, state: vk::PipelineRasterizationStateCreateInfo<'static>) -> &mut Self {
        self.rasterization = state;
        self
    }

    pub fn depth_stencil(&mut self, state: vk::PipelineDepthStencilStateCreateInfo<'static>) -> &mut Self {
        self.depth_stencil = state;
        self
    }

    pub fn multisample(&mut self, state: vk::PipelineMultisampleStateCreateInfo<'static>) -> &mut Self {
        self.multisample = state;
        self
    }

    /// Add a color attachment blend state. With none, every color attachment
    /// gets an opaque write-all state.
    pub fn color_blend_attachment(&mut self, state: vk::PipelineColorBlendAttachmentState) -> &mut Self {
        self.color_blend_attachments.push(state);
        self
    }

    pub fn blend_constants(&mut self, constants: [f32; 4]) -> &mut Self {
        self.blend_constants = constants;
        self
    }

    pub fn logic_op(&mut self, op: vk::LogicOp) -> &mut Self {
        self.logic_op = Some(op);
        self
    }

    pub fn dynamic_state(&mut self, state: vk::DynamicState) -> &mut Self {
        if !self.dynamic_states.contains(&state) {
            self.dynamic_states.push(state);
        }
        self
    }

    /// Use a caller-owned layout instead of deriving one from the shaders.
    pub fn layout(&mut self, layout: vk::PipelineLayout) -> &mut Self {
        self.layout = Some(layout);
        self
    }

    pub fn render_pass(&mut self, render_pass: vk::RenderPass, subpass: u32) -> &mut Self {
        self.render_pass = render_pass;
        self.subpass = subpass;
        self
    }

    /// Dynamic rendering color format, used when no render pass is set.
    pub fn color_format(&mut self, format: vk::Format) -> &mut Self {
        self.color_formats.push(format);
        self
    }

    pub fn depth_format(&mut self, format: vk::Format) -> &mut Self {
        self.depth_format = format;
        self
    }

    pub fn stencil_format(&mut self, format: vk::Format) -> &mut Self {
        self.stencil_format = format;
        self
    }

    /// Create the pipeline as a derivative of `base`.
    pub fn base_pipeline(&mut self, base: vk::Pipeline) -> &mut Self {
        self.base_pipeline = base;
        self
    }

    pub fn allow_derivatives(&mut self, allow: bool) -> &mut Self {
        self.allow_derivatives = allow;
        self
    }

    pub fn max_recursion_depth(&mut self, depth: u32) -> &mut Self {
        self.max_recursion_depth = depth;
        self
    }

    fn create_flags(&self) -> vk::PipelineCreateFlags {
        let mut flags = vk::PipelineCreateFlags::empty();
        if self.allow_derivatives {
            flags |= vk::PipelineCreateFlags::ALLOW_DERIVATIVES;
        }
        if self.base_pipeline != vk::Pipeline::null() {
            flags |= vk::PipelineCreateFlags::DERIVATIVE;
        }
        flags
    }

    /// Validate the stage set and create the pipeline.
    ///
    /// Takes a read lock on every unit for the duration of the call. Units
    /// that failed a reload still contribute their last good module.
    pub fn build(&self) -> Result<Pipeline, PipelineError> {
        let pipeline_type = self.remaining.single().ok_or(PipelineError::Ambiguous {
            remaining: self.remaining,
        })?;
        for &required in pipeline_type.mandatory_stages() {
            if !self.has_stage(required) {
                return Err(PipelineError::MissingMandatoryStage {
                    pipeline_type,
                    missing: required,
                });
            }
        }
        if pipeline_type != PipelineType::RayTracing
            && !self.viewports.is_empty()
            && !self.scissors.is_empty()
            && self.viewports.len() != self.scissors.len()
        {
            return Err(PipelineError::ViewportScissorMismatch {
                viewports: self.viewports.len(),
                scissors: self.scissors.len(),
            });
        }

        let mut order: Vec<usize> = (0..self.shaders.len()).collect();
        if pipeline_type == PipelineType::RayTracing {
            order.sort_by_key(|&i| ray_tracing_rank(self.shaders[i].0));
        }

        let guards: Vec<_> = order
            .iter()
            .map(|&i| (self.shaders[i].0, self.shaders[i].1.read()))
            .collect();

        let mut entry_names = Vec::with_capacity(guards.len());
        for (stage, unit) in &guards {
            let invalid = || PipelineError::InvalidShader {
                stage: *stage,
                path: unit.path().to_path_buf(),
            };
            if unit.module() == vk::ShaderModule::null() {
                return Err(invalid());
            }
            entry_names.push(CString::new(unit.entry_point()).map_err(|_| invalid())?);
        }

        let stage_infos: Vec<vk::PipelineShaderStageCreateInfo<'_>> = guards
            .iter()
            .zip(&entry_names)
            .map(|((stage, unit), name)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage.to_vk())
                    .module(unit.module())
                    .name(name.as_c_str())
            })
            .collect();

        let (layout, owned_layout) = match self.layout {
            Some(layout) => (layout, None),
            None => {
                let description = LayoutDescription::from_units(guards.iter().map(|(_, unit)| &**unit))?;
                let owned = description.create(&self.device)?;
                (owned.layout(), Some(owned))
            }
        };

        let stages: Vec<ShaderStage> = guards.iter().map(|(stage, _)| *stage).collect();
        let handle = match pipeline_type {
            PipelineType::Vtg | PipelineType::TaskMesh => {
                self.create_graphics(pipeline_type, &stages, &stage_infos, layout)?
            }
            PipelineType::RayTracing => self.create_ray_tracing(&stages, &stage_infos, layout)?,
        };

        let stage_refs = guards
            .iter()
            .zip(&order)
            .map(|((stage, unit), &i)| StageRef {
                stage: *stage,
                unit: Arc::clone(&self.shaders[i].1),
                generation: unit.generation(),
            })
            .collect();

        log::debug!("Built {pipeline_type} pipeline with {} stages", stages.len());
        Ok(Pipeline::new(
            Arc::clone(&self.device),
            handle,
            layout,
            owned_layout,
            Some(pipeline_type),
            stage_refs,
        ))
    }

    fn create_graphics(
        &self,
        pipeline_type: PipelineType,
        stages: &[ShaderStage],
        stage_infos: &[vk::PipelineShaderStageCreateInfo<'_>],
        layout: vk::PipelineLayout,
    ) -> Result<vk::Pipeline, PipelineError> {
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&self.vertex_bindings)
            .vertex_attribute_descriptions(&self.vertex_attributes);
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(self.topology)
            .primitive_restart_enable(self.primitive_restart);
        let tessellation = vk::PipelineTessellationStateCreateInfo::default()
            .patch_control_points(self.patch_control_points);

        let mut dynamic_states = self.dynamic_states.clone();
        let mut viewport_state = vk::PipelineViewportStateCreateInfo::default();
        let count = self.viewports.len().max(self.scissors.len()).max(1) as u32;
        if self.viewports.is_empty() {
            viewport_state = viewport_state.viewport_count(count);
            if !dynamic_states.contains(&vk::DynamicState::VIEWPORT) {
                dynamic_states.push(vk::DynamicState::VIEWPORT);
            }
        } else {
            viewport_state = viewport_state.viewports(&self.viewports);
        }
        if self.scissors.is_empty() {
            viewport_state = viewport_state.scissor_count(count);
            if !dynamic_states.contains(&vk::DynamicState::SCISSOR) {
                dynamic_states.push(vk::DynamicState::SCISSOR);
            }
        } else {
            viewport_state = viewport_state.scissors(&self.scissors);
        }
        let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let attachments = if self.color_blend_attachments.is_empty() {
            let opaque = vk::PipelineColorBlendAttachmentState::default()
                .color_write_mask(
                    vk::ColorComponentFlags::R
                        | vk::ColorComponentFlags::G
                        | vk::ColorComponentFlags::B
                        | vk::ColorComponentFlags::A,
                )
                .blend_enable(false);
            vec![opaque; self.color_formats.len().max(1)]
        } else {
            self.color_blend_attachments.clone()
        };
        let mut color_blend = vk::PipelineColorBlendStateCreateInfo::default()
            .attachments(&attachments)
            .blend_constants(self.blend_constants);
        if let Some(op) = self.logic_op {
            color_blend = color_blend.logic_op_enable(true).logic_op(op);
        }

        let mut rendering = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&self.color_formats)
            .depth_attachment_format(self.depth_format)
            .stencil_attachment_format(self.stencil_format);
        let dynamic_rendering = self.render_pass == vk::RenderPass::null()
            && (!self.color_formats.is_empty()
                || self.depth_format != vk::Format::UNDEFINED
                || self.stencil_format != vk::Format::UNDEFINED);

        let mut info = vk::GraphicsPipelineCreateInfo::default()
            .flags(self.create_flags())
            .stages(stage_infos)
            .viewport_state(&viewport_state)
            .rasterization_state(&self.rasterization)
            .multisample_state(&self.multisample)
            .depth_stencil_state(&self.depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(layout)
            .render_pass(self.render_pass)
            .subpass(self.subpass)
            .base_pipeline_handle(self.base_pipeline)
            .base_pipeline_index(-1);

        if pipeline_type == PipelineType::Vtg {
            info = info
                .vertex_input_state(&vertex_input)
                .input_assembly_state(&input_assembly);
            if stages.contains(&ShaderStage::TessControl) {
                info = info.tessellation_state(&tessellation);
            }
        }
        if dynamic_rendering {
            info = info.push_next(&mut rendering);
        }

        self.device
            .create_graphics_pipeline(&info)
            .map_err(|result| device_error("graphics pipeline", result))
    }

    fn create_ray_tracing(
        &self,
        stages: &[ShaderStage],
        stage_infos: &[vk::PipelineShaderStageCreateInfo<'_>],
        layout: vk::PipelineLayout,
    ) -> Result<vk::Pipeline, PipelineError> {
        let general = |index: u32| {
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                .general_shader(index)
                .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR)
        };
        let mut hit_group = vk::RayTracingShaderGroupCreateInfoKHR::default()
            .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
            .general_shader(vk::SHADER_UNUSED_KHR)
            .closest_hit_shader(vk::SHADER_UNUSED_KHR)
            .any_hit_shader(vk::SHADER_UNUSED_KHR)
            .intersection_shader(vk::SHADER_UNUSED_KHR);
        let mut has_hit_group = false;

        let mut groups = Vec::with_capacity(stages.len());
        for (index, stage) in stages.iter().enumerate() {
            let index = index as u32;
            match stage {
                ShaderStage::Raygen | ShaderStage::Miss | ShaderStage::Callable => {
                    groups.push(general(index));
                }
                ShaderStage::ClosestHit => {
                    hit_group = hit_group.closest_hit_shader(index);
                    has_hit_group = true;
                }
                ShaderStage::AnyHit => {
                    hit_group = hit_group.any_hit_shader(index);
                    has_hit_group = true;
                }
                ShaderStage::Intersection => {
                    hit_group = hit_group
                        .ty(vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP)
                        .intersection_shader(index);
                    has_hit_group = true;
                }
                _ => {}
            }
        }
        if has_hit_group {
            groups.push(hit_group);
        }

        let info = vk::RayTracingPipelineCreateInfoKHR::default()
            .flags(self.create_flags())
            .stages(stage_infos)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(self.max_recursion_depth)
            .layout(layout)
            .base_pipeline_handle(self.base_pipeline)
            .base_pipeline_index(-1);

        self.device
            .create_ray_tracing_pipeline(&info)
            .map_err(|result| device_error("ray tracing pipeline", result))
    }
}
