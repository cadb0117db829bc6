//! Shader stages, stage masks and pipeline shapes.
//!
//! A compiled unit always carries exactly one [`ShaderStage`]. Masks of
//! several stages ([`ShaderStages`]) are only used as filters. Which stages
//! may be combined into one pipeline is decided by an explicit
//! stage-to-[`PipelineType`] table, not by bit arithmetic on the masks.

use std::fmt;

use ash::vk;
use bitflags::bitflags;
use serde::Serialize;

// ============================================================================
// Single stage
// ============================================================================

/// One programmable pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ShaderStage {
    Vertex,
    TessControl,
    TessEval,
    Geometry,
    Fragment,
    Compute,
    Task,
    Mesh,
    Raygen,
    AnyHit,
    ClosestHit,
    Miss,
    Intersection,
    Callable,
}

impl ShaderStage {
    pub const ALL: [ShaderStage; 14] = [
        ShaderStage::Vertex,
        ShaderStage::TessControl,
        ShaderStage::TessEval,
        ShaderStage::Geometry,
        ShaderStage::Fragment,
        ShaderStage::Compute,
        ShaderStage::Task,
        ShaderStage::Mesh,
        ShaderStage::Raygen,
        ShaderStage::AnyHit,
        ShaderStage::ClosestHit,
        ShaderStage::Miss,
        ShaderStage::Intersection,
        ShaderStage::Callable,
    ];

    /// The stage's bit in a [`ShaderStages`] mask.
    ///
    /// The numbering matches `VkShaderStageFlagBits`.
    pub const fn bit(self) -> ShaderStages {
        match self {
            ShaderStage::Vertex => ShaderStages::VERTEX,
            ShaderStage::TessControl => ShaderStages::TESS_CONTROL,
            ShaderStage::TessEval => ShaderStages::TESS_EVAL,
            ShaderStage::Geometry => ShaderStages::GEOMETRY,
            ShaderStage::Fragment => ShaderStages::FRAGMENT,
            ShaderStage::Compute => ShaderStages::COMPUTE,
            ShaderStage::Task => ShaderStages::TASK,
            ShaderStage::Mesh => ShaderStages::MESH,
            ShaderStage::Raygen => ShaderStages::RAYGEN,
            ShaderStage::AnyHit => ShaderStages::ANY_HIT,
            ShaderStage::ClosestHit => ShaderStages::CLOSEST_HIT,
            ShaderStage::Miss => ShaderStages::MISS,
            ShaderStage::Intersection => ShaderStages::INTERSECTION,
            ShaderStage::Callable => ShaderStages::CALLABLE,
        }
    }

    /// Convert to Vulkan shader stage flags.
    pub fn to_vk(self) -> vk::ShaderStageFlags {
        vk::ShaderStageFlags::from_raw(self.bit().bits())
    }

    /// Map a SPIR-V `ExecutionModel` operand to a stage.
    ///
    /// Models 0 through 5 map to `1 << model`. Task and mesh accept both the
    /// NV and EXT enumerants. `Kernel` and unknown models have no stage.
    pub fn from_execution_model(model: u32) -> Option<Self> {
        let stage = match model {
            0 => ShaderStage::Vertex,
            1 => ShaderStage::TessControl,
            2 => ShaderStage::TessEval,
            3 => ShaderStage::Geometry,
            4 => ShaderStage::Fragment,
            5 => ShaderStage::Compute,
            5267 | 5364 => ShaderStage::Task,
            5268 | 5365 => ShaderStage::Mesh,
            5313 => ShaderStage::Raygen,
            5314 => ShaderStage::Intersection,
            5315 => ShaderStage::AnyHit,
            5316 => ShaderStage::ClosestHit,
            5317 => ShaderStage::Miss,
            5318 => ShaderStage::Callable,
            _ => return None,
        };
        Some(stage)
    }

    /// Pipeline shapes this stage may take part in.
    pub fn pipeline_types(self) -> PipelineTypeSet {
        match self {
            ShaderStage::Vertex
            | ShaderStage::TessControl
            | ShaderStage::TessEval
            | ShaderStage::Geometry => PipelineTypeSet::VTG,
            ShaderStage::Fragment => PipelineTypeSet::VTG | PipelineTypeSet::TASK_MESH,
            ShaderStage::Task | ShaderStage::Mesh => PipelineTypeSet::TASK_MESH,
            ShaderStage::Raygen
            | ShaderStage::AnyHit
            | ShaderStage::ClosestHit
            | ShaderStage::Miss
            | ShaderStage::Intersection
            | ShaderStage::Callable => PipelineTypeSet::RAY_TRACING,
            ShaderStage::Compute => PipelineTypeSet::empty(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vertex",
            ShaderStage::TessControl => "tessellation control",
            ShaderStage::TessEval => "tessellation evaluation",
            ShaderStage::Geometry => "geometry",
            ShaderStage::Fragment => "fragment",
            ShaderStage::Compute => "compute",
            ShaderStage::Task => "task",
            ShaderStage::Mesh => "mesh",
            ShaderStage::Raygen => "raygen",
            ShaderStage::AnyHit => "any hit",
            ShaderStage::ClosestHit => "closest hit",
            ShaderStage::Miss => "miss",
            ShaderStage::Intersection => "intersection",
            ShaderStage::Callable => "callable",
        }
    }
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Stage masks
// ============================================================================

bitflags! {
    /// A set of shader stages, bit-compatible with `VkShaderStageFlags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ShaderStages: u32 {
        const VERTEX = 0x0000_0001;
        const TESS_CONTROL = 0x0000_0002;
        const TESS_EVAL = 0x0000_0004;
        const GEOMETRY = 0x0000_0008;
        const FRAGMENT = 0x0000_0010;
        const COMPUTE = 0x0000_0020;
        const TASK = 0x0000_0040;
        const MESH = 0x0000_0080;
        const RAYGEN = 0x0000_0100;
        const ANY_HIT = 0x0000_0200;
        const CLOSEST_HIT = 0x0000_0400;
        const MISS = 0x0000_0800;
        const INTERSECTION = 0x0000_1000;
        const CALLABLE = 0x0000_2000;

        const ALL_GRAPHICS = 0x0000_001F;
        const ALL_RAY_TRACING = 0x0000_3F00;
    }
}

impl ShaderStages {
    pub fn to_vk(self) -> vk::ShaderStageFlags {
        vk::ShaderStageFlags::from_raw(self.bits())
    }

    /// Iterate the concrete stages in this mask, in declaration order.
    pub fn stages(self) -> impl Iterator<Item = ShaderStage> {
        ShaderStage::ALL
            .into_iter()
            .filter(move |stage| self.contains(stage.bit()))
    }
}

impl From<ShaderStage> for ShaderStages {
    fn from(stage: ShaderStage) -> Self {
        stage.bit()
    }
}

// ============================================================================
// Pipeline shapes
// ============================================================================

/// The three legal pipeline shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineType {
    /// Traditional vertex/tessellation/geometry/fragment graphics.
    Vtg,
    /// Task/mesh graphics.
    TaskMesh,
    /// Ray tracing.
    RayTracing,
}

impl PipelineType {
    pub const ALL: [PipelineType; 3] = [
        PipelineType::Vtg,
        PipelineType::TaskMesh,
        PipelineType::RayTracing,
    ];

    /// Stages that must be present before the shape can be built.
    pub fn mandatory_stages(self) -> &'static [ShaderStage] {
        match self {
            PipelineType::Vtg => &[ShaderStage::Vertex, ShaderStage::Fragment],
            PipelineType::TaskMesh => &[ShaderStage::Mesh, ShaderStage::Fragment],
            PipelineType::RayTracing => &[ShaderStage::Raygen, ShaderStage::Miss],
        }
    }

    pub fn bind_point(self) -> vk::PipelineBindPoint {
        match self {
            PipelineType::Vtg | PipelineType::TaskMesh => vk::PipelineBindPoint::GRAPHICS,
            PipelineType::RayTracing => vk::PipelineBindPoint::RAY_TRACING_KHR,
        }
    }

    fn flag(self) -> PipelineTypeSet {
        match self {
            PipelineType::Vtg => PipelineTypeSet::VTG,
            PipelineType::TaskMesh => PipelineTypeSet::TASK_MESH,
            PipelineType::RayTracing => PipelineTypeSet::RAY_TRACING,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PipelineType::Vtg => "VTG",
            PipelineType::TaskMesh => "TM",
            PipelineType::RayTracing => "RT",
        }
    }
}

impl fmt::Display for PipelineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

bitflags! {
    /// The set of pipeline shapes still reachable from a builder's stages.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PipelineTypeSet: u8 {
        const VTG = 0b001;
        const TASK_MESH = 0b010;
        const RAY_TRACING = 0b100;
    }
}

impl PipelineTypeSet {
    pub fn contains_type(self, ty: PipelineType) -> bool {
        self.contains(ty.flag())
    }

    /// Iterate the shapes in this set.
    pub fn types(self) -> impl Iterator<Item = PipelineType> {
        PipelineType::ALL
            .into_iter()
            .filter(move |ty| self.contains(ty.flag()))
    }

    /// The only remaining shape, if exactly one is left.
    pub fn single(self) -> Option<PipelineType> {
        let mut types = self.types();
        match (types.next(), types.next()) {
            (Some(ty), None) => Some(ty),
            _ => None,
        }
    }
}

impl Default for PipelineTypeSet {
    fn default() -> Self {
        Self::all()
    }
}

impl From<PipelineType> for PipelineTypeSet {
    fn from(ty: PipelineType) -> Self {
        ty.flag()
    }
}

impl fmt::Display for PipelineTypeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, ty) in self.types().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(ty.name())?;
        }
        f.write_str("}")
    }
}
