//! Pipeline layout derivation.
//!
//! Merges the reflected bindings and push constant blocks of every unit in
//! a pipeline into one description, then creates the matching descriptor
//! set layouts and pipeline layout on the device.

use std::collections::BTreeMap;
use std::sync::Arc;

use ash::vk;

use super::device_error;
use crate::device::GpuDevice;
use crate::error::PipelineError;
use crate::shader::{DescriptorKind, ShaderStages, ShaderUnit};

/// One slot of a descriptor set layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutBinding {
    pub binding: u32,
    pub kind: DescriptorKind,
    /// Descriptor count. A runtime-sized array gets the configured
    /// `runtime_array_descriptors` instead of zero; the binding is created
    /// without variable-count flags, so the whole range must be written.
    pub count: u32,
    pub stages: ShaderStages,
}

/// A push constant range shared by one or more stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushConstantBlock {
    pub offset: u32,
    pub size: u32,
    pub stages: ShaderStages,
}

/// Merged resource interface of a set of units.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayoutDescription {
    /// Indexed by set number. Sets no unit uses are present and empty.
    pub sets: Vec<Vec<LayoutBinding>>,
    pub push_constants: Vec<PushConstantBlock>,
}

impl LayoutDescription {
    /// Merge the interfaces of `units`.
    ///
    /// Identical slots used by several stages get their stage flags combined;
    /// two different descriptor kinds at one slot are a conflict. Push
    /// constant ranges with equal offset and size are combined the same way.
    pub fn from_units<'a>(
        units: impl IntoIterator<Item = &'a ShaderUnit>,
    ) -> Result<Self, PipelineError> {
        let mut sets: BTreeMap<u32, BTreeMap<u32, LayoutBinding>> = BTreeMap::new();
        let mut push_constants: Vec<PushConstantBlock> = Vec::new();

        for unit in units {
            let stage = unit.stage().bit();
            let runtime_count = unit.config().runtime_array_descriptors;

            for resource in unit.bindings() {
                let count = match resource.count {
                    0 => runtime_count,
                    count => count,
                };
                let slots = sets.entry(resource.set).or_default();
                match slots.get_mut(&resource.binding) {
                    Some(existing) if existing.kind != resource.kind => {
                        return Err(PipelineError::BindingConflict {
                            set: resource.set,
                            binding: resource.binding,
                        });
                    }
                    Some(existing) => {
                        existing.stages |= stage;
                        existing.count = existing.count.max(count);
                    }
                    None => {
                        slots.insert(
                            resource.binding,
                            LayoutBinding {
                                binding: resource.binding,
                                kind: resource.kind,
                                count,
                                stages: stage,
                            },
                        );
                    }
                }
            }

            for range in unit.push_constants() {
                match push_constants
                    .iter_mut()
                    .find(|b| b.offset == range.offset && b.size == range.size)
                {
                    Some(block) => block.stages |= stage,
                    None => push_constants.push(PushConstantBlock {
                        offset: range.offset,
                        size: range.size,
                        stages: stage,
                    }),
                }
            }
        }

        let set_count = sets.keys().next_back().map_or(0, |last| last + 1);
        let sets = (0..set_count)
            .map(|set| {
                sets.remove(&set)
                    .map(|slots| slots.into_values().collect())
                    .unwrap_or_default()
            })
            .collect();

        Ok(Self {
            sets,
            push_constants,
        })
    }

    pub fn push_constant_ranges(&self) -> Vec<vk::PushConstantRange> {
        self.push_constants
            .iter()
            .map(|block| {
                vk::PushConstantRange::default()
                    .stage_flags(block.stages.to_vk())
                    .offset(block.offset)
                    .size(block.size)
            })
            .collect()
    }

    /// Create the set layouts and the pipeline layout.
    pub(crate) fn create(&self, device: &Arc<dyn GpuDevice>) -> Result<OwnedLayout, PipelineError> {
        let mut owned = OwnedLayout::empty(device);

        for set in &self.sets {
            let bindings: Vec<vk::DescriptorSetLayoutBinding<'_>> = set
                .iter()
                .map(|slot| {
                    vk::DescriptorSetLayoutBinding::default()
                        .binding(slot.binding)
                        .descriptor_type(slot.kind.to_vk())
                        .descriptor_count(slot.count)
                        .stage_flags(slot.stages.to_vk())
                })
                .collect();
            let layout = device
                .create_descriptor_set_layout(&bindings)
                .map_err(|result| device_error("descriptor set layout", result))?;
            owned.set_layouts.push(layout);
        }

        owned.layout = device
            .create_pipeline_layout(&owned.set_layouts, &self.push_constant_ranges())
            .map_err(|result| device_error("pipeline layout", result))?;
        Ok(owned)
    }
}

/// Layout objects created for, and destroyed with, one pipeline.
pub(crate) struct OwnedLayout {
    device: Arc<dyn GpuDevice>,
    set_layouts: Vec<vk::DescriptorSetLayout>,
    layout: vk::PipelineLayout,
}

impl OwnedLayout {
    fn empty(device: &Arc<dyn GpuDevice>) -> Self {
        Self {
            device: Arc::clone(device),
            set_layouts: Vec::new(),
            layout: vk::PipelineLayout::null(),
        }
    }

    /// A pipeline layout over caller-owned set layouts.
    pub(crate) fn over_set_layouts(
        device: &Arc<dyn GpuDevice>,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<Self, PipelineError> {
        let mut owned = Self::empty(device);
        owned.layout = device
            .create_pipeline_layout(set_layouts, push_constant_ranges)
            .map_err(|result| device_error("pipeline layout", result))?;
        Ok(owned)
    }

    pub(crate) fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub(crate) fn set_layouts(&self) -> &[vk::DescriptorSetLayout] {
        &self.set_layouts
    }
}

impl Drop for OwnedLayout {
    fn drop(&mut self) {
        if self.layout != vk::PipelineLayout::null() {
            self.device.destroy_pipeline_layout(self.layout);
        }
        for layout in self.set_layouts.drain(..) {
            self.device.destroy_descriptor_set_layout(layout);
        }
    }
}
