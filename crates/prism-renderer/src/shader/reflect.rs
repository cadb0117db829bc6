//! SPIR-V reflection.
//!
//! Parses a module with `rspirv` and recovers the entry point's stage, its
//! descriptor bindings, push constant ranges and stage inputs/outputs. Pure
//! function of the words; never touches the device.

use std::collections::{BTreeMap, HashMap};

use ash::vk;
use rspirv::dr::{self, Instruction, Operand};
use rspirv::spirv::{self, Decoration, Op, StorageClass, Word};

use super::ShaderStage;
use crate::config::ShaderConfig;
use crate::error::ShaderError;

const DIM_BUFFER: u32 = 5;
const DIM_SUBPASS_DATA: u32 = 6;
const OP_TYPE_ACCELERATION_STRUCTURE: u32 = 5341;

// ============================================================================
// Reflected records
// ============================================================================

/// Descriptor type of a reflected resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    Sampler,
    CombinedImageSampler,
    SampledImage,
    StorageImage,
    UniformTexelBuffer,
    StorageTexelBuffer,
    UniformBuffer,
    StorageBuffer,
    InputAttachment,
    AccelerationStructure,
}

impl DescriptorKind {
    pub fn to_vk(self) -> vk::DescriptorType {
        match self {
            DescriptorKind::Sampler => vk::DescriptorType::SAMPLER,
            DescriptorKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            DescriptorKind::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
            DescriptorKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
            DescriptorKind::UniformTexelBuffer => vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
            DescriptorKind::StorageTexelBuffer => vk::DescriptorType::STORAGE_TEXEL_BUFFER,
            DescriptorKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            DescriptorKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            DescriptorKind::InputAttachment => vk::DescriptorType::INPUT_ATTACHMENT,
            DescriptorKind::AccelerationStructure => {
                vk::DescriptorType::ACCELERATION_STRUCTURE_KHR
            }
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DescriptorKind::Sampler => "sampler",
            DescriptorKind::CombinedImageSampler => "combined image sampler",
            DescriptorKind::SampledImage => "sampled image",
            DescriptorKind::StorageImage => "storage image",
            DescriptorKind::UniformTexelBuffer => "uniform texel buffer",
            DescriptorKind::StorageTexelBuffer => "storage texel buffer",
            DescriptorKind::UniformBuffer => "uniform buffer",
            DescriptorKind::StorageBuffer => "storage buffer",
            DescriptorKind::InputAttachment => "input attachment",
            DescriptorKind::AccelerationStructure => "acceleration structure",
        }
    }
}

/// One descriptor slot used by a shader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceBinding {
    pub set: u32,
    pub binding: u32,
    pub name: String,
    pub kind: DescriptorKind,
    /// Array element count: 1 when not arrayed, 0 for runtime-sized arrays.
    pub count: u32,
}

/// A push constant block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushConstantRange {
    pub size: u32,
    pub offset: u32,
    pub name: String,
}

/// A user-defined stage input or output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InOut {
    pub location: u32,
    pub name: String,
    pub format: vk::Format,
    /// Vertex-attribute semantic, empty when unknown.
    pub semantic: String,
}

/// Semantic overrides reported alongside a module.
///
/// Location hints come from `#pragma` annotations in GLSL sources, name
/// hints from semantics the Slang front end reports for entry point
/// parameters. A location hint wins over a name hint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SemanticHints {
    pub by_location: BTreeMap<u32, String>,
    /// Keyed by the variable name as it appears in the module
    pub by_name: BTreeMap<String, String>,
}

impl SemanticHints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_location.is_empty() && self.by_name.is_empty()
    }

    fn lookup(&self, location: u32, name: &str) -> Option<&str> {
        self.by_location
            .get(&location)
            .or_else(|| self.by_name.get(name))
            .map(String::as_str)
    }
}

/// Everything recovered from one module.
#[derive(Debug, Clone, PartialEq)]
pub struct Reflection {
    pub stage: ShaderStage,
    pub entry_point: String,
    /// Keyed by (set, binding); a repeated slot overwrites the earlier one.
    pub bindings: BTreeMap<(u32, u32), ResourceBinding>,
    /// In declaration order.
    pub push_constants: Vec<PushConstantRange>,
    /// Sorted by location.
    pub inputs: Vec<InOut>,
    /// Sorted by location.
    pub outputs: Vec<InOut>,
}

impl Reflection {
    /// No resources, for a unit that has not compiled yet.
    pub fn empty(stage: ShaderStage) -> Self {
        Self {
            stage,
            entry_point: "main".to_string(),
            bindings: BTreeMap::new(),
            push_constants: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }
}

// ============================================================================
// Module tables
// ============================================================================

#[derive(Debug, Clone)]
enum Type {
    Bool,
    Int { width: u32, signed: bool },
    Float { width: u32 },
    Vector { component: Word, count: u32 },
    Matrix { column: Word, count: u32 },
    Image { dim: u32, sampled: u32 },
    Sampler,
    SampledImage,
    Array { element: Word, length: Word },
    RuntimeArray { element: Word },
    Struct { members: Vec<Word> },
    Pointer { pointee: Word },
    AccelerationStructure,
    Other,
}

#[derive(Debug, Default, Clone)]
struct Decorations {
    set: Option<u32>,
    binding: Option<u32>,
    location: Option<u32>,
    offset: Option<u32>,
    array_stride: Option<u32>,
    matrix_stride: Option<u32>,
    builtin: bool,
    block: bool,
    buffer_block: bool,
}

impl Decorations {
    fn apply(&mut self, decoration: Decoration, value: Option<&Operand>) {
        let literal = match value {
            Some(Operand::LiteralBit32(v)) => Some(*v),
            _ => None,
        };
        match decoration {
            Decoration::DescriptorSet => self.set = literal,
            Decoration::Binding => self.binding = literal,
            Decoration::Location => self.location = literal,
            Decoration::Offset => self.offset = literal,
            Decoration::ArrayStride => self.array_stride = literal,
            Decoration::MatrixStride => self.matrix_stride = literal,
            Decoration::BuiltIn => self.builtin = true,
            Decoration::Block => self.block = true,
            Decoration::BufferBlock => self.buffer_block = true,
            _ => {}
        }
    }
}

struct Tables {
    names: HashMap<Word, String>,
    decorations: HashMap<Word, Decorations>,
    member_decorations: HashMap<(Word, u32), Decorations>,
    types: HashMap<Word, Type>,
    constants: HashMap<Word, u32>,
}

fn id_operand(operand: Option<&Operand>) -> Option<Word> {
    match operand {
        Some(Operand::IdRef(id)) => Some(*id),
        _ => None,
    }
}

fn literal_operand(operand: Option<&Operand>) -> Option<u32> {
    match operand {
        Some(Operand::LiteralBit32(v)) => Some(*v),
        _ => None,
    }
}

impl Tables {
    fn build(module: &dr::Module) -> Self {
        let mut tables = Tables {
            names: HashMap::new(),
            decorations: HashMap::new(),
            member_decorations: HashMap::new(),
            types: HashMap::new(),
            constants: HashMap::new(),
        };

        for inst in &module.debug_names {
            if inst.class.opcode != Op::Name {
                continue;
            }
            if let (Some(id), Some(Operand::LiteralString(name))) =
                (id_operand(inst.operands.first()), inst.operands.get(1))
            {
                tables.names.insert(id, name.clone());
            }
        }

        for inst in &module.annotations {
            match inst.class.opcode {
                Op::Decorate => {
                    if let (Some(id), Some(Operand::Decoration(decoration))) =
                        (id_operand(inst.operands.first()), inst.operands.get(1))
                    {
                        tables
                            .decorations
                            .entry(id)
                            .or_default()
                            .apply(*decoration, inst.operands.get(2));
                    }
                }
                Op::MemberDecorate => {
                    if let (Some(id), Some(member), Some(Operand::Decoration(decoration))) = (
                        id_operand(inst.operands.first()),
                        literal_operand(inst.operands.get(1)),
                        inst.operands.get(2),
                    ) {
                        tables
                            .member_decorations
                            .entry((id, member))
                            .or_default()
                            .apply(*decoration, inst.operands.get(3));
                    }
                }
                _ => {}
            }
        }

        for inst in &module.types_global_values {
            if let Some(id) = inst.result_id {
                if let Some(ty) = Self::parse_type(inst) {
                    tables.types.insert(id, ty);
                }
                if matches!(inst.class.opcode, Op::Constant | Op::SpecConstant) {
                    if let Some(value) = literal_operand(inst.operands.first()) {
                        tables.constants.insert(id, value);
                    }
                }
            }
        }

        tables
    }

    fn parse_type(inst: &Instruction) -> Option<Type> {
        let ops = &inst.operands;
        let ty = match inst.class.opcode {
            Op::TypeBool => Type::Bool,
            Op::TypeInt => Type::Int {
                width: literal_operand(ops.first())?,
                signed: literal_operand(ops.get(1))? == 1,
            },
            Op::TypeFloat => Type::Float {
                width: literal_operand(ops.first())?,
            },
            Op::TypeVector => Type::Vector {
                component: id_operand(ops.first())?,
                count: literal_operand(ops.get(1))?,
            },
            Op::TypeMatrix => Type::Matrix {
                column: id_operand(ops.first())?,
                count: literal_operand(ops.get(1))?,
            },
            Op::TypeImage => {
                let dim = match ops.get(1) {
                    Some(Operand::Dim(dim)) => *dim as u32,
                    _ => return None,
                };
                Type::Image {
                    dim,
                    sampled: literal_operand(ops.get(5))?,
                }
            }
            Op::TypeSampler => Type::Sampler,
            Op::TypeSampledImage => Type::SampledImage,
            Op::TypeArray => Type::Array {
                element: id_operand(ops.first())?,
                length: id_operand(ops.get(1))?,
            },
            Op::TypeRuntimeArray => Type::RuntimeArray {
                element: id_operand(ops.first())?,
            },
            Op::TypeStruct => Type::Struct {
                members: ops.iter().filter_map(|o| id_operand(Some(o))).collect(),
            },
            Op::TypePointer => Type::Pointer {
                pointee: id_operand(ops.get(1))?,
            },
            op if op as u32 == OP_TYPE_ACCELERATION_STRUCTURE => Type::AccelerationStructure,
            Op::TypeVoid | Op::TypeFunction => Type::Other,
            _ => return None,
        };
        Some(ty)
    }

    fn name(&self, id: Word) -> Option<&str> {
        self.names.get(&id).map(String::as_str).filter(|n| !n.is_empty())
    }

    fn decorations(&self, id: Word) -> Decorations {
        self.decorations.get(&id).cloned().unwrap_or_default()
    }

    /// Strip array wrappers, returning the element type and the total count.
    fn unwrap_arrays(&self, mut ty: Word) -> (Word, u32) {
        let mut count = 1u32;
        loop {
            match self.types.get(&ty) {
                Some(Type::Array { element, length }) => {
                    count = count.saturating_mul(self.constants.get(length).copied().unwrap_or(1));
                    ty = *element;
                }
                Some(Type::RuntimeArray { element }) => {
                    count = 0;
                    ty = *element;
                }
                _ => return (ty, count),
            }
        }
    }

    /// Byte size of a type under explicit layout decorations.
    ///
    /// `None` when a size does not fit in 32 bits.
    fn size_of(&self, ty: Word, matrix_stride: Option<u32>) -> Option<u32> {
        match self.types.get(&ty) {
            Some(Type::Bool) => Some(4),
            Some(Type::Int { width, .. }) | Some(Type::Float { width }) => Some(width / 8),
            Some(Type::Vector { component, count }) => {
                self.size_of(*component, None)?.checked_mul(*count)
            }
            Some(Type::Matrix { column, count }) => {
                let stride = match matrix_stride {
                    Some(stride) => stride,
                    None => self.size_of(*column, None)?,
                };
                stride.checked_mul(*count)
            }
            Some(Type::Array { element, length }) => {
                let length = self.constants.get(length).copied().unwrap_or(1);
                let stride = match self.decorations.get(&ty).and_then(|d| d.array_stride) {
                    Some(stride) => stride,
                    None => self.size_of(*element, matrix_stride)?,
                };
                stride.checked_mul(length)
            }
            Some(Type::Struct { members }) => {
                let mut size = 0;
                for (index, member) in members.iter().enumerate() {
                    let decorations = self.member_decorations.get(&(ty, index as u32));
                    let offset = decorations.and_then(|d| d.offset).unwrap_or(0);
                    let member_size =
                        self.size_of(*member, decorations.and_then(|d| d.matrix_stride))?;
                    size = size.max(offset.checked_add(member_size)?);
                }
                Some(size)
            }
            _ => Some(0),
        }
    }

    fn is_builtin_block(&self, ty: Word) -> bool {
        match self.types.get(&ty) {
            Some(Type::Struct { members }) => (0..members.len() as u32).any(|index| {
                self.member_decorations
                    .get(&(ty, index))
                    .is_some_and(|d| d.builtin)
            }),
            _ => false,
        }
    }

    fn format_of(&self, ty: Word) -> vk::Format {
        let (scalar, count) = match self.types.get(&ty) {
            Some(Type::Vector { component, count }) => (*component, *count),
            _ => (ty, 1),
        };
        let formats: [vk::Format; 4] = match self.types.get(&scalar) {
            Some(Type::Float { width: 32 }) => [
                vk::Format::R32_SFLOAT,
                vk::Format::R32G32_SFLOAT,
                vk::Format::R32G32B32_SFLOAT,
                vk::Format::R32G32B32A32_SFLOAT,
            ],
            Some(Type::Float { width: 64 }) => [
                vk::Format::R64_SFLOAT,
                vk::Format::R64G64_SFLOAT,
                vk::Format::R64G64B64_SFLOAT,
                vk::Format::R64G64B64A64_SFLOAT,
            ],
            Some(Type::Int { width: 32, signed: true }) => [
                vk::Format::R32_SINT,
                vk::Format::R32G32_SINT,
                vk::Format::R32G32B32_SINT,
                vk::Format::R32G32B32A32_SINT,
            ],
            Some(Type::Int { width: 32, signed: false }) => [
                vk::Format::R32_UINT,
                vk::Format::R32G32_UINT,
                vk::Format::R32G32B32_UINT,
                vk::Format::R32G32B32A32_UINT,
            ],
            _ => return vk::Format::UNDEFINED,
        };
        match count {
            1..=4 => formats[count as usize - 1],
            _ => vk::Format::UNDEFINED,
        }
    }
}

// ============================================================================
// Reflection
// ============================================================================

/// Reflect a SPIR-V module.
///
/// `hints` carries semantics declared in the source; they take priority
/// over matching variable names against the configured semantic list.
pub fn reflect(
    words: &[u32],
    config: &ShaderConfig,
    hints: &SemanticHints,
) -> Result<Reflection, ShaderError> {
    let module = dr::load_words(words)
        .map_err(|e| ShaderError::Reflection(format!("malformed SPIR-V: {e:?}")))?;

    let entry = module
        .entry_points
        .first()
        .ok_or_else(|| ShaderError::Reflection("module has no entry point".to_string()))?;
    if module.entry_points.len() > 1 {
        log::debug!(
            "Module declares {} entry points, reflecting the first",
            module.entry_points.len()
        );
    }

    let model = match entry.operands.first() {
        Some(Operand::ExecutionModel(model)) => *model as u32,
        _ => return Err(ShaderError::Reflection("entry point without execution model".to_string())),
    };
    let stage = ShaderStage::from_execution_model(model).ok_or_else(|| {
        ShaderError::Reflection(format!("unsupported execution model {model}"))
    })?;
    let entry_point = match entry.operands.get(2) {
        Some(Operand::LiteralString(name)) => name.clone(),
        _ => "main".to_string(),
    };

    let tables = Tables::build(&module);
    let mut reflection = Reflection {
        stage,
        entry_point,
        bindings: BTreeMap::new(),
        push_constants: Vec::new(),
        inputs: Vec::new(),
        outputs: Vec::new(),
    };

    for inst in &module.types_global_values {
        if inst.class.opcode != Op::Variable {
            continue;
        }
        let (Some(id), Some(pointer)) = (inst.result_id, inst.result_type) else {
            continue;
        };
        let Some(Operand::StorageClass(class)) = inst.operands.first() else {
            continue;
        };
        let Some(Type::Pointer { pointee }) = tables.types.get(&pointer) else {
            continue;
        };

        match *class {
            StorageClass::UniformConstant | StorageClass::Uniform | StorageClass::StorageBuffer => {
                if let Some(binding) = resource_binding(&tables, id, *pointee, *class, config) {
                    reflection
                        .bindings
                        .insert((binding.set, binding.binding), binding);
                }
            }
            StorageClass::PushConstant => {
                reflection
                    .push_constants
                    .push(push_constant_range(&tables, id, *pointee)?);
            }
            StorageClass::Input | StorageClass::Output => {
                if let Some(io) = stage_io(&tables, id, *pointee) {
                    if *class == StorageClass::Input {
                        reflection.inputs.push(io);
                    } else {
                        reflection.outputs.push(io);
                    }
                }
            }
            _ => {}
        }
    }

    reflection.inputs.sort_by_key(|io| io.location);
    reflection.outputs.sort_by_key(|io| io.location);
    apply_semantics(&mut reflection, config, hints);

    log::debug!(
        "Reflected {} shader: {} bindings, {} push constant ranges, {} inputs, {} outputs",
        reflection.stage,
        reflection.bindings.len(),
        reflection.push_constants.len(),
        reflection.inputs.len(),
        reflection.outputs.len()
    );

    Ok(reflection)
}

fn variable_name(tables: &Tables, var: Word, ty: Word) -> String {
    tables
        .name(var)
        .or_else(|| tables.name(ty))
        .map(str::to_string)
        .unwrap_or_else(|| format!("_{var}"))
}

fn resource_binding(
    tables: &Tables,
    var: Word,
    pointee: Word,
    class: StorageClass,
    config: &ShaderConfig,
) -> Option<ResourceBinding> {
    let (base, count) = tables.unwrap_arrays(pointee);
    let base_decorations = tables.decorations(base);

    let kind = match (class, tables.types.get(&base)?) {
        (StorageClass::UniformConstant, Type::Sampler) => DescriptorKind::Sampler,
        (StorageClass::UniformConstant, Type::SampledImage) => DescriptorKind::CombinedImageSampler,
        (StorageClass::UniformConstant, Type::AccelerationStructure) => {
            DescriptorKind::AccelerationStructure
        }
        (StorageClass::UniformConstant, Type::Image { dim, sampled }) => {
            match (*dim, *sampled) {
                (DIM_SUBPASS_DATA, _) => DescriptorKind::InputAttachment,
                (DIM_BUFFER, 2) => DescriptorKind::StorageTexelBuffer,
                (_, 2) => DescriptorKind::StorageImage,
                (DIM_BUFFER, _) => DescriptorKind::UniformTexelBuffer,
                (_, _) if config.legacy_separate_image_mapping => DescriptorKind::StorageImage,
                (_, _) => DescriptorKind::SampledImage,
            }
        }
        (StorageClass::Uniform, Type::Struct { .. }) if base_decorations.buffer_block => {
            DescriptorKind::StorageBuffer
        }
        (StorageClass::Uniform, Type::Struct { .. }) => DescriptorKind::UniformBuffer,
        (StorageClass::StorageBuffer, Type::Struct { .. }) => DescriptorKind::StorageBuffer,
        _ => return None,
    };

    let decorations = tables.decorations(var);
    Some(ResourceBinding {
        set: decorations.set.unwrap_or(0),
        binding: decorations.binding.unwrap_or(0),
        name: variable_name(tables, var, base),
        kind,
        count,
    })
}

/// Resolve the semantic of every input and output from `hints`, falling back
/// to the configured semantic matching the variable name.
///
/// Replaces whatever semantics were resolved before, so a unit whose
/// annotations changed without changing its code can refresh them in place.
pub fn apply_semantics(reflection: &mut Reflection, config: &ShaderConfig, hints: &SemanticHints) {
    for io in reflection.inputs.iter_mut().chain(reflection.outputs.iter_mut()) {
        io.semantic = hints
            .lookup(io.location, &io.name)
            .or_else(|| config.semantic_for(&io.name))
            .map(str::to_string)
            .unwrap_or_default();
    }
}

fn push_constant_range(tables: &Tables, var: Word, ty: Word) -> Result<PushConstantRange, ShaderError> {
    let member_count = match tables.types.get(&ty) {
        Some(Type::Struct { members }) => members.len() as u32,
        _ => 0,
    };
    let offset = (0..member_count)
        .filter_map(|index| {
            tables
                .member_decorations
                .get(&(ty, index))
                .and_then(|d| d.offset)
        })
        .min()
        .unwrap_or(0);
    let name = variable_name(tables, var, ty);
    let size = tables
        .size_of(ty, None)
        .ok_or_else(|| ShaderError::Reflection(format!("push constant block {name} overflows 32 bits")))?
        .saturating_sub(offset);

    Ok(PushConstantRange { size, offset, name })
}

/// An input or output with its semantic left empty for [`apply_semantics`].
fn stage_io(tables: &Tables, var: Word, ty: Word) -> Option<InOut> {
    let decorations = tables.decorations(var);
    if decorations.builtin || tables.is_builtin_block(ty) {
        return None;
    }
    let location = decorations.location?;
    let name = variable_name(tables, var, ty);
    let (element, _) = tables.unwrap_arrays(ty);

    Some(InOut {
        location,
        format: tables.format_of(element),
        name,
        semantic: String::new(),
    })
}

// ============================================================================
// Tests
// ============================================================================
