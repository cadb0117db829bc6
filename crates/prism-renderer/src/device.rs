//! Device boundary.
//!
//! Everything the shader subsystem asks of the GPU goes through
//! [`GpuDevice`], which is injected into the registry and the pipeline
//! builders as an `Arc<dyn GpuDevice>`. [`VulkanDevice`] implements it over
//! an `ash::Device`; [`HeadlessDevice`] stands in when there is no GPU.

use std::sync::atomic::{AtomicU64, Ordering};

use ash::khr::ray_tracing_pipeline;
use ash::vk::{self, Handle};

/// Device capabilities consumed by shader units and pipelines.
pub trait GpuDevice: Send + Sync {
    fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule, vk::Result>;
    fn destroy_shader_module(&self, module: vk::ShaderModule);

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> Result<vk::DescriptorSetLayout, vk::Result>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout, vk::Result>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);

    fn create_graphics_pipeline(
        &self,
        info: &vk::GraphicsPipelineCreateInfo<'_>,
    ) -> Result<vk::Pipeline, vk::Result>;
    fn create_compute_pipeline(
        &self,
        info: &vk::ComputePipelineCreateInfo<'_>,
    ) -> Result<vk::Pipeline, vk::Result>;
    fn create_ray_tracing_pipeline(
        &self,
        info: &vk::RayTracingPipelineCreateInfoKHR<'_>,
    ) -> Result<vk::Pipeline, vk::Result>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    );
    fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    );
}

// ============================================================================
// Vulkan implementation
// ============================================================================

/// [`GpuDevice`] over a logical Vulkan device.
///
/// The caller keeps ownership of the device itself; dropping this wrapper
/// destroys nothing.
pub struct VulkanDevice {
    device: ash::Device,
    ray_tracing: Option<ray_tracing_pipeline::Device>,
    pipeline_cache: vk::PipelineCache,
}

impl VulkanDevice {
    pub fn new(device: ash::Device) -> Self {
        Self {
            device,
            ray_tracing: None,
            pipeline_cache: vk::PipelineCache::null(),
        }
    }

    /// Enable ray tracing pipeline creation.
    ///
    /// The device must have been created with `VK_KHR_ray_tracing_pipeline`.
    pub fn with_ray_tracing(mut self, instance: &ash::Instance) -> Self {
        self.ray_tracing = Some(ray_tracing_pipeline::Device::new(instance, &self.device));
        self
    }

    /// Route every pipeline creation through `cache`.
    pub fn with_pipeline_cache(mut self, cache: vk::PipelineCache) -> Self {
        self.pipeline_cache = cache;
        self
    }

    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    pub fn supports_ray_tracing(&self) -> bool {
        self.ray_tracing.is_some()
    }
}

impl GpuDevice for VulkanDevice {
    fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule, vk::Result> {
        let create_info = vk::ShaderModuleCreateInfo::default().code(code);
        // SAFETY: device is valid, create_info points at live SPIR-V words
        unsafe { self.device.create_shader_module(&create_info, None) }
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        // SAFETY: module was created by this device and is no longer referenced
        unsafe { self.device.destroy_shader_module(module, None) }
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> Result<vk::DescriptorSetLayout, vk::Result> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings);
        // SAFETY: device is valid, bindings outlive the call
        unsafe { self.device.create_descriptor_set_layout(&layout_info, None) }
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        // SAFETY: layout was created by this device
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) }
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout, vk::Result> {
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(set_layouts)
            .push_constant_ranges(push_constant_ranges);
        // SAFETY: device is valid, set layouts are live handles of this device
        unsafe { self.device.create_pipeline_layout(&layout_info, None) }
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        // SAFETY: layout was created by this device
        unsafe { self.device.destroy_pipeline_layout(layout, None) }
    }

    fn create_graphics_pipeline(
        &self,
        info: &vk::GraphicsPipelineCreateInfo<'_>,
    ) -> Result<vk::Pipeline, vk::Result> {
        // SAFETY: device is valid, every pointer in info is kept alive by the caller
        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(self.pipeline_cache, std::slice::from_ref(info), None)
        }
        .map_err(|(_, e)| e)?;
        pipelines
            .first()
            .copied()
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn create_compute_pipeline(
        &self,
        info: &vk::ComputePipelineCreateInfo<'_>,
    ) -> Result<vk::Pipeline, vk::Result> {
        // SAFETY: device is valid, every pointer in info is kept alive by the caller
        let pipelines = unsafe {
            self.device
                .create_compute_pipelines(self.pipeline_cache, std::slice::from_ref(info), None)
        }
        .map_err(|(_, e)| e)?;
        pipelines
            .first()
            .copied()
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn create_ray_tracing_pipeline(
        &self,
        info: &vk::RayTracingPipelineCreateInfoKHR<'_>,
    ) -> Result<vk::Pipeline, vk::Result> {
        let loader = self
            .ray_tracing
            .as_ref()
            .ok_or(vk::Result::ERROR_EXTENSION_NOT_PRESENT)?;
        // SAFETY: loader belongs to this device, info pointers are kept alive by the caller
        let pipelines = unsafe {
            loader.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                self.pipeline_cache,
                std::slice::from_ref(info),
                None,
            )
        }
        .map_err(|(_, e)| e)?;
        pipelines
            .first()
            .copied()
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        // SAFETY: pipeline was created by this device and is no longer in use
        unsafe { self.device.destroy_pipeline(pipeline, None) }
    }

    fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        // SAFETY: command buffer is in the recording state
        unsafe {
            self.device
                .cmd_bind_pipeline(command_buffer, bind_point, pipeline)
        }
    }

    fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        // SAFETY: command buffer is recording, sets are compatible with layout
        unsafe {
            self.device
                .cmd_bind_descriptor_sets(command_buffer, bind_point, layout, first_set, sets, &[])
        }
    }
}

// ============================================================================
// Headless implementation
// ============================================================================

/// [`GpuDevice`] with no GPU behind it.
///
/// Hands out unique non-null handles and destroys nothing, so shaders can be
/// compiled, reflected and assembled into pipelines offline. Handles must
/// never reach a real device.
#[derive(Debug)]
pub struct HeadlessDevice {
    next_handle: AtomicU64,
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
        }
    }

    fn handle<H: Handle>(&self) -> H {
        H::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }
}

impl GpuDevice for HeadlessDevice {
    fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule, vk::Result> {
        if code.is_empty() {
            return Err(vk::Result::ERROR_INVALID_SHADER_NV);
        }
        Ok(self.handle())
    }

    fn destroy_shader_module(&self, _module: vk::ShaderModule) {}

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> Result<vk::DescriptorSetLayout, vk::Result> {
        Ok(self.handle())
    }

    fn destroy_descriptor_set_layout(&self, _layout: vk::DescriptorSetLayout) {}

    fn create_pipeline_layout(
        &self,
        _set_layouts: &[vk::DescriptorSetLayout],
        _push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout, vk::Result> {
        Ok(self.handle())
    }

    fn destroy_pipeline_layout(&self, _layout: vk::PipelineLayout) {}

    fn create_graphics_pipeline(
        &self,
        _info: &vk::GraphicsPipelineCreateInfo<'_>,
    ) -> Result<vk::Pipeline, vk::Result> {
        Ok(self.handle())
    }

    fn create_compute_pipeline(
        &self,
        _info: &vk::ComputePipelineCreateInfo<'_>,
    ) -> Result<vk::Pipeline, vk::Result> {
        Ok(self.handle())
    }

    fn create_ray_tracing_pipeline(
        &self,
        _info: &vk::RayTracingPipelineCreateInfoKHR<'_>,
    ) -> Result<vk::Pipeline, vk::Result> {
        Ok(self.handle())
    }

    fn destroy_pipeline(&self, _pipeline: vk::Pipeline) {}

    fn cmd_bind_pipeline(
        &self,
        _command_buffer: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        _pipeline: vk::Pipeline,
    ) {
    }

    fn cmd_bind_descriptor_sets(
        &self,
        _command_buffer: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        _layout: vk::PipelineLayout,
        _first_set: u32,
        _sets: &[vk::DescriptorSet],
    ) {
    }
}

// ============================================================================
// Recording device for tests
// ============================================================================

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use ash::vk::Handle;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::ffi::CStr;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    /// What the mock saw in a pipeline create call.
    #[derive(Debug, Clone, Default)]
    pub struct PipelineRecord {
        pub stages: Vec<vk::ShaderStageFlags>,
        pub modules: Vec<vk::ShaderModule>,
        pub entry_points: Vec<String>,
        pub has_vertex_input: bool,
        pub has_input_assembly: bool,
        pub has_tessellation: bool,
        pub viewport_count: u32,
        pub scissor_count: u32,
        pub dynamic_states: Vec<vk::DynamicState>,
        pub color_attachments: u32,
        pub groups: Vec<vk::RayTracingShaderGroupTypeKHR>,
        pub max_recursion_depth: u32,
        pub layout: vk::PipelineLayout,
        pub render_pass: vk::RenderPass,
        pub base_pipeline_index: i32,
        pub has_rendering_info: bool,
    }

    #[derive(Default)]
    struct Live {
        modules: HashSet<u64>,
        pipelines: HashSet<u64>,
        pipeline_layouts: HashSet<u64>,
        set_layouts: HashSet<u64>,
    }

    /// A [`GpuDevice`] that hands out fake handles and records every call.
    #[derive(Default)]
    pub struct MockDevice {
        next_handle: AtomicU64,
        live: Mutex<Live>,
        pub fail_pipelines: AtomicBool,
        pub fail_modules: AtomicBool,
        pub modules_created: AtomicU64,
        pub modules_destroyed: AtomicU64,
        pub set_layout_bindings: Mutex<Vec<Vec<(u32, vk::DescriptorType, u32, vk::ShaderStageFlags)>>>,
        pub push_constant_ranges: Mutex<Vec<Vec<vk::PushConstantRange>>>,
        pub pipelines: Mutex<Vec<PipelineRecord>>,
        pub bound: Mutex<Vec<(vk::PipelineBindPoint, vk::Pipeline)>>,
    }

    impl MockDevice {
        pub fn new() -> Self {
            Self {
                next_handle: AtomicU64::new(0x1000),
                ..Self::default()
            }
        }

        fn handle(&self) -> u64 {
            self.next_handle.fetch_add(1, Ordering::Relaxed)
        }

        pub fn live_modules(&self) -> usize {
            self.live.lock().modules.len()
        }

        pub fn live_pipelines(&self) -> usize {
            self.live.lock().pipelines.len()
        }

        pub fn live_pipeline_layouts(&self) -> usize {
            self.live.lock().pipeline_layouts.len()
        }

        pub fn live_set_layouts(&self) -> usize {
            self.live.lock().set_layouts.len()
        }

        pub fn last_pipeline(&self) -> PipelineRecord {
            self.pipelines.lock().last().cloned().unwrap_or_default()
        }

        fn record_stages(record: &mut PipelineRecord, stages: &[vk::PipelineShaderStageCreateInfo<'_>]) {
            for stage in stages {
                record.stages.push(stage.stage);
                record.modules.push(stage.module);
                // SAFETY: the builders always set a NUL-terminated entry name
                let name = unsafe { CStr::from_ptr(stage.p_name) };
                record.entry_points.push(name.to_string_lossy().into_owned());
            }
        }

        fn new_pipeline(&self, record: PipelineRecord) -> Result<vk::Pipeline, vk::Result> {
            if self.fail_pipelines.load(Ordering::Relaxed) {
                return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
            }
            self.pipelines.lock().push(record);
            let raw = self.handle();
            self.live.lock().pipelines.insert(raw);
            Ok(vk::Pipeline::from_raw(raw))
        }
    }

    unsafe fn slice<'a, T>(ptr: *const T, len: u32) -> &'a [T] {
        if ptr.is_null() || len == 0 {
            &[]
        } else {
            std::slice::from_raw_parts(ptr, len as usize)
        }
    }

    impl GpuDevice for MockDevice {
        fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule, vk::Result> {
            if self.fail_modules.load(Ordering::Relaxed) || code.is_empty() {
                return Err(vk::Result::ERROR_INVALID_SHADER_NV);
            }
            self.modules_created.fetch_add(1, Ordering::Relaxed);
            let raw = self.handle();
            self.live.lock().modules.insert(raw);
            Ok(vk::ShaderModule::from_raw(raw))
        }

        fn destroy_shader_module(&self, module: vk::ShaderModule) {
            assert!(
                self.live.lock().modules.remove(&module.as_raw()),
                "shader module destroyed twice or never created"
            );
            self.modules_destroyed.fetch_add(1, Ordering::Relaxed);
        }

        fn create_descriptor_set_layout(
            &self,
            bindings: &[vk::DescriptorSetLayoutBinding<'_>],
        ) -> Result<vk::DescriptorSetLayout, vk::Result> {
            self.set_layout_bindings.lock().push(
                bindings
                    .iter()
                    .map(|b| (b.binding, b.descriptor_type, b.descriptor_count, b.stage_flags))
                    .collect(),
            );
            let raw = self.handle();
            self.live.lock().set_layouts.insert(raw);
            Ok(vk::DescriptorSetLayout::from_raw(raw))
        }

        fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
            assert!(self.live.lock().set_layouts.remove(&layout.as_raw()));
        }

        fn create_pipeline_layout(
            &self,
            _set_layouts: &[vk::DescriptorSetLayout],
            push_constant_ranges: &[vk::PushConstantRange],
        ) -> Result<vk::PipelineLayout, vk::Result> {
            self.push_constant_ranges
                .lock()
                .push(push_constant_ranges.to_vec());
            let raw = self.handle();
            self.live.lock().pipeline_layouts.insert(raw);
            Ok(vk::PipelineLayout::from_raw(raw))
        }

        fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
            assert!(self.live.lock().pipeline_layouts.remove(&layout.as_raw()));
        }

        fn create_graphics_pipeline(
            &self,
            info: &vk::GraphicsPipelineCreateInfo<'_>,
        ) -> Result<vk::Pipeline, vk::Result> {
            let mut record = PipelineRecord {
                has_vertex_input: !info.p_vertex_input_state.is_null(),
                has_input_assembly: !info.p_input_assembly_state.is_null(),
                has_tessellation: !info.p_tessellation_state.is_null(),
                layout: info.layout,
                render_pass: info.render_pass,
                base_pipeline_index: info.base_pipeline_index,
                has_rendering_info: !info.p_next.is_null(),
                ..PipelineRecord::default()
            };
            // SAFETY: the builder keeps every pointed-to state block alive for this call
            unsafe {
                Self::record_stages(&mut record, slice(info.p_stages, info.stage_count));
                if let Some(viewport) = info.p_viewport_state.as_ref() {
                    record.viewport_count = viewport.viewport_count;
                    record.scissor_count = viewport.scissor_count;
                }
                if let Some(dynamic) = info.p_dynamic_state.as_ref() {
                    record.dynamic_states =
                        slice(dynamic.p_dynamic_states, dynamic.dynamic_state_count).to_vec();
                }
                if let Some(blend) = info.p_color_blend_state.as_ref() {
                    record.color_attachments = blend.attachment_count;
                }
            }
            self.new_pipeline(record)
        }

        fn create_compute_pipeline(
            &self,
            info: &vk::ComputePipelineCreateInfo<'_>,
        ) -> Result<vk::Pipeline, vk::Result> {
            let mut record = PipelineRecord {
                layout: info.layout,
                base_pipeline_index: info.base_pipeline_index,
                ..PipelineRecord::default()
            };
            Self::record_stages(&mut record, std::slice::from_ref(&info.stage));
            self.new_pipeline(record)
        }

        fn create_ray_tracing_pipeline(
            &self,
            info: &vk::RayTracingPipelineCreateInfoKHR<'_>,
        ) -> Result<vk::Pipeline, vk::Result> {
            let mut record = PipelineRecord {
                layout: info.layout,
                max_recursion_depth: info.max_pipeline_ray_recursion_depth,
                base_pipeline_index: info.base_pipeline_index,
                ..PipelineRecord::default()
            };
            // SAFETY: the builder keeps stages and groups alive for this call
            unsafe {
                Self::record_stages(&mut record, slice(info.p_stages, info.stage_count));
                record.groups = slice(info.p_groups, info.group_count)
                    .iter()
                    .map(|g| g.ty)
                    .collect();
            }
            self.new_pipeline(record)
        }

        fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
            assert!(
                self.live.lock().pipelines.remove(&pipeline.as_raw()),
                "pipeline destroyed twice or never created"
            );
        }

        fn cmd_bind_pipeline(
            &self,
            _command_buffer: vk::CommandBuffer,
            bind_point: vk::PipelineBindPoint,
            pipeline: vk::Pipeline,
        ) {
            self.bound.lock().push((bind_point, pipeline));
        }

        fn cmd_bind_descriptor_sets(
            &self,
            _command_buffer: vk::CommandBuffer,
            _bind_point: vk::PipelineBindPoint,
            _layout: vk::PipelineLayout,
            _first_set: u32,
            _sets: &[vk::DescriptorSet],
        ) {
        }
    }
}
