use std::ffi::CString;
use std::sync::Arc;

use ash::vk;

use super::layout::{LayoutDescription, OwnedLayout};
use super::{device_error, Pipeline, StageRef};
use crate::device::GpuDevice;
use crate::error::PipelineError;
use crate::shader::{ShaderStage, SharedShader};

/// Builds a single-stage compute pipeline.
///
/// The layout comes from, in order of preference: an explicit
/// [`layout`](Self::layout), caller-owned [`set_layouts`](Self::set_layouts)
/// combined with the shader's push constants, or the shader's reflection.
pub struct ComputePipelineBuilder {
    device: Arc<dyn GpuDevice>,
    shader: SharedShader,
    layout: Option<vk::PipelineLayout>,
    set_layouts: Option<Vec<vk::DescriptorSetLayout>>,
    base_pipeline: vk::Pipeline,
}

impl ComputePipelineBuilder {
    pub fn new(device: Arc<dyn GpuDevice>, shader: &SharedShader) -> Result<Self, PipelineError> {
        let found = shader.read().stage();
        if found != ShaderStage::Compute {
            return Err(PipelineError::WrongStage {
                expected: ShaderStage::Compute,
                found,
            });
        }
        Ok(Self {
            device,
            shader: Arc::clone(shader),
            layout: None,
            set_layouts: None,
            base_pipeline: vk::Pipeline::null(),
        })
    }

    pub fn set_layouts(&mut self, set_layouts: &[vk::DescriptorSetLayout]) -> &mut Self {
        self.set_layouts = Some(set_layouts.to_vec());
        self
    }

    pub fn layout(&mut self, layout: vk::PipelineLayout) -> &mut Self {
        self.layout = Some(layout);
        self
    }

    pub fn base_pipeline(&mut self, base: vk::Pipeline) -> &mut Self {
        self.base_pipeline = base;
        self
    }

    pub fn build(&self) -> Result<Pipeline, PipelineError> {
        let unit = self.shader.read();
        let invalid = || PipelineError::InvalidShader {
            stage: ShaderStage::Compute,
            path: unit.path().to_path_buf(),
        };
        if unit.module() == vk::ShaderModule::null() {
            return Err(invalid());
        }
        let entry = CString::new(unit.entry_point()).map_err(|_| invalid())?;

        let (layout, owned_layout) = match (self.layout, &self.set_layouts) {
            (Some(layout), _) => (layout, None),
            (None, Some(set_layouts)) => {
                let ranges = LayoutDescription::from_units([&*unit])?.push_constant_ranges();
                let owned = OwnedLayout::over_set_layouts(&self.device, set_layouts, &ranges)?;
                (owned.layout(), Some(owned))
            }
            (None, None) => {
                let owned = LayoutDescription::from_units([&*unit])?.create(&self.device)?;
                (owned.layout(), Some(owned))
            }
        };

        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(unit.module())
            .name(entry.as_c_str());
        let mut info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout)
            .base_pipeline_handle(self.base_pipeline)
            .base_pipeline_index(-1);
        if self.base_pipeline != vk::Pipeline::null() {
            info = info.flags(vk::PipelineCreateFlags::DERIVATIVE);
        }

        let handle = self
            .device
            .create_compute_pipeline(&info)
            .map_err(|result| device_error("compute pipeline", result))?;

        log::debug!("Built compute pipeline from {}", unit.path().display());
        let stages = vec![StageRef {
            stage: ShaderStage::Compute,
            unit: Arc::clone(&self.shader),
            generation: unit.generation(),
        }];
        Ok(Pipeline::new(
            Arc::clone(&self.device),
            handle,
            layout,
            owned_layout,
            None,
            stages,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::unit::tests::{Env, VERT};
    use ash::vk::Handle;
    use parking_lot::RwLock;
    use std::sync::atomic::Ordering;

    const COMP: &str = r#"#version 450
layout(local_size_x = 64) in;
layout(set = 0, binding = 0) buffer Particles { vec4 data[]; } particles;
layout(push_constant) uniform Push { float dt; } push;

void main() {
    uint i = gl_GlobalInvocationID.x;
    particles.data[i] += vec4(push.dt);
}
"#;

    fn load(env: &Env, path: &str, text: &str) -> SharedShader {
        env.fs.write(path, text);
        Arc::new(RwLock::new(env.unit(path).unwrap()))
    }

    #[test]
    fn test_build_derives_layout() {
        let env = Env::new();
        let comp = load(&env, "sim.comp", COMP);
        let pipeline = ComputePipelineBuilder::new(env.device.clone(), &comp)
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(pipeline.pipeline_type(), None);
        assert_eq!(pipeline.bind_point(), vk::PipelineBindPoint::COMPUTE);
        assert_eq!(pipeline.set_layouts().len(), 1);

        let record = env.device.last_pipeline();
        assert_eq!(record.stages, vec![vk::ShaderStageFlags::COMPUTE]);
        assert_eq!(record.entry_points, vec!["main"]);
        assert_eq!(record.base_pipeline_index, -1);

        let bindings = env.device.set_layout_bindings.lock().clone();
        assert_eq!(
            bindings[0],
            vec![(0, vk::DescriptorType::STORAGE_BUFFER, 1, vk::ShaderStageFlags::COMPUTE)]
        );
        let ranges = env.device.push_constant_ranges.lock().clone();
        assert_eq!(ranges[0].len(), 1);
        assert_eq!(ranges[0][0].size, 4);
        assert_eq!(ranges[0][0].stage_flags, vk::ShaderStageFlags::COMPUTE);

        drop(pipeline);
        assert_eq!(env.device.live_pipelines(), 0);
        assert_eq!(env.device.live_set_layouts(), 0);
        assert_eq!(env.device.live_pipeline_layouts(), 0);
    }

    #[test]
    fn test_rejects_non_compute_stage() {
        let env = Env::new();
        let vert = load(&env, "lit.vert", VERT);
        assert!(matches!(
            ComputePipelineBuilder::new(env.device.clone(), &vert),
            Err(PipelineError::WrongStage {
                expected: ShaderStage::Compute,
                found: ShaderStage::Vertex,
            })
        ));
    }

    #[test]
    fn test_caller_set_layouts_keep_push_constants() {
        let env = Env::new();
        let comp = load(&env, "sim.comp", COMP);
        let external = [vk::DescriptorSetLayout::from_raw(0x42)];

        let pipeline = ComputePipelineBuilder::new(env.device.clone(), &comp)
            .unwrap()
            .set_layouts(&external)
            .build()
            .unwrap();

        assert!(pipeline.set_layouts().is_empty());
        assert_eq!(env.device.live_set_layouts(), 0);
        assert_eq!(env.device.live_pipeline_layouts(), 1);
        assert_eq!(env.device.push_constant_ranges.lock()[0][0].size, 4);

        drop(pipeline);
        assert_eq!(env.device.live_pipeline_layouts(), 0);
    }

    #[test]
    fn test_explicit_layout_and_derivative() {
        let env = Env::new();
        let comp = load(&env, "sim.comp", COMP);
        let layout = vk::PipelineLayout::from_raw(0x99);

        let mut builder = ComputePipelineBuilder::new(env.device.clone(), &comp).unwrap();
        builder.layout(layout);
        let base = builder.build().unwrap();
        builder.base_pipeline(base.handle());
        let derived = builder.build().unwrap();

        assert_eq!(derived.layout(), layout);
        assert_eq!(env.device.last_pipeline().layout, layout);
        assert_eq!(env.device.live_pipeline_layouts(), 0);
        assert_eq!(env.device.live_pipelines(), 2);
    }

    #[test]
    fn test_device_failure_releases_layout() {
        let env = Env::new();
        let comp = load(&env, "sim.comp", COMP);
        env.device.fail_pipelines.store(true, Ordering::Relaxed);

        let result = ComputePipelineBuilder::new(env.device.clone(), &comp)
            .unwrap()
            .build();
        assert!(matches!(
            result,
            Err(PipelineError::DeviceCreation {
                what: "compute pipeline",
                ..
            })
        ));
        assert_eq!(env.device.live_set_layouts(), 0);
        assert_eq!(env.device.live_pipeline_layouts(), 0);
    }

    #[test]
    fn test_stale_after_reload() {
        let env = Env::new();
        let comp = load(&env, "sim.comp", COMP);
        let pipeline = ComputePipelineBuilder::new(env.device.clone(), &comp)
            .unwrap()
            .build()
            .unwrap();
        assert!(!pipeline.is_stale());

        env.fs.write("sim.comp", COMP.replace("vec4(push.dt)", "vec4(push.dt * 2.0)"));
        assert!(comp.write().update().unwrap());
        assert!(pipeline.is_stale());

        pipeline.bind(vk::CommandBuffer::null());
        assert_eq!(
            env.device.bound.lock().as_slice(),
            &[(vk::PipelineBindPoint::COMPUTE, pipeline.handle())]
        );
    }
}
