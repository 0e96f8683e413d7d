//! Type conversions between frameforge types and Vulkan types.

use ash::vk;

use crate::compiler::AccessScope;
use crate::config::PresentMode;
use crate::encoder::IndexType;
use crate::graph::{ClearValue, LoadOp, PassType, StoreOp};
use crate::pipeline::{
    BlendFactor, BlendOperation, BlendState, CompareFunction, CullMode, FrontFace, PolygonMode,
    PrimitiveTopology, VertexFormat, VertexStepMode,
};
use crate::resource::ResourceUsage;
use crate::shader::ShaderBindingKind;
use crate::types::{BufferUsage, Extent3d, ImageUsage, TextureFormat};

pub fn convert_buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut result = vk::BufferUsageFlags::empty();
    if usage.contains(BufferUsage::TRANSFER_SRC) {
        result |= vk::BufferUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(BufferUsage::TRANSFER_DST) {
        result |= vk::BufferUsageFlags::TRANSFER_DST;
    }
    if usage.contains(BufferUsage::UNIFORM_BUFFER) {
        result |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if usage.contains(BufferUsage::STORAGE_BUFFER) {
        result |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(BufferUsage::INDEX_BUFFER) {
        result |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if usage.contains(BufferUsage::VERTEX_BUFFER) {
        result |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if usage.contains(BufferUsage::INDIRECT_BUFFER) {
        result |= vk::BufferUsageFlags::INDIRECT_BUFFER;
    }
    result
}

pub fn convert_image_usage(usage: ImageUsage) -> vk::ImageUsageFlags {
    let mut result = vk::ImageUsageFlags::empty();
    if usage.contains(ImageUsage::TRANSFER_SRC) {
        result |= vk::ImageUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(ImageUsage::TRANSFER_DST) {
        result |= vk::ImageUsageFlags::TRANSFER_DST;
    }
    if usage.contains(ImageUsage::SAMPLED) {
        result |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.contains(ImageUsage::STORAGE) {
        result |= vk::ImageUsageFlags::STORAGE;
    }
    if usage.contains(ImageUsage::COLOR_ATTACHMENT) {
        result |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }
    if usage.contains(ImageUsage::DEPTH_STENCIL_ATTACHMENT) {
        result |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
    }
    result
}

pub fn convert_texture_format(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::R8Unorm => vk::Format::R8_UNORM,
        TextureFormat::R16Float => vk::Format::R16_SFLOAT,
        TextureFormat::Rg8Unorm => vk::Format::R8G8_UNORM,
        TextureFormat::R32Float => vk::Format::R32_SFLOAT,
        TextureFormat::R32Uint => vk::Format::R32_UINT,
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::Rgba8UnormSrgb => vk::Format::R8G8B8A8_SRGB,
        TextureFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        TextureFormat::Bgra8UnormSrgb => vk::Format::B8G8R8A8_SRGB,
        TextureFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        TextureFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        TextureFormat::Depth16Unorm => vk::Format::D16_UNORM,
        TextureFormat::Depth24PlusStencil8 => vk::Format::D24_UNORM_S8_UINT,
        TextureFormat::Depth32Float => vk::Format::D32_SFLOAT,
        TextureFormat::Depth32FloatStencil8 => vk::Format::D32_SFLOAT_S8_UINT,
    }
}

/// Inverse of [`convert_texture_format`] for surface formats.
pub fn texture_format_from_vk(format: vk::Format) -> Option<TextureFormat> {
    Some(match format {
        vk::Format::R8G8B8A8_UNORM => TextureFormat::Rgba8Unorm,
        vk::Format::R8G8B8A8_SRGB => TextureFormat::Rgba8UnormSrgb,
        vk::Format::B8G8R8A8_UNORM => TextureFormat::Bgra8Unorm,
        vk::Format::B8G8R8A8_SRGB => TextureFormat::Bgra8UnormSrgb,
        vk::Format::R16G16B16A16_SFLOAT => TextureFormat::Rgba16Float,
        _ => return None,
    })
}

pub fn aspect_mask(format: TextureFormat) -> vk::ImageAspectFlags {
    if format.has_stencil() {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else if format.is_depth_stencil() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

pub fn convert_samples(samples: u32) -> vk::SampleCountFlags {
    match samples {
        2 => vk::SampleCountFlags::TYPE_2,
        4 => vk::SampleCountFlags::TYPE_4,
        8 => vk::SampleCountFlags::TYPE_8,
        16 => vk::SampleCountFlags::TYPE_16,
        _ => vk::SampleCountFlags::TYPE_1,
    }
}

pub fn convert_extent_2d(extent: Extent3d) -> vk::Extent2D {
    vk::Extent2D {
        width: extent.width,
        height: extent.height,
    }
}

pub fn convert_extent_3d(extent: Extent3d) -> vk::Extent3D {
    vk::Extent3D {
        width: extent.width,
        height: extent.height,
        depth: extent.depth.max(1),
    }
}

pub fn convert_present_mode(mode: PresentMode) -> vk::PresentModeKHR {
    match mode {
        PresentMode::Fifo => vk::PresentModeKHR::FIFO,
        PresentMode::Mailbox => vk::PresentModeKHR::MAILBOX,
        PresentMode::Immediate => vk::PresentModeKHR::IMMEDIATE,
    }
}

pub fn convert_index_type(index_type: IndexType) -> vk::IndexType {
    match index_type {
        IndexType::U16 => vk::IndexType::UINT16,
        IndexType::U32 => vk::IndexType::UINT32,
    }
}

pub fn convert_descriptor_type(kind: ShaderBindingKind) -> vk::DescriptorType {
    match kind {
        ShaderBindingKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        ShaderBindingKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        ShaderBindingKind::Texture => vk::DescriptorType::SAMPLED_IMAGE,
        ShaderBindingKind::StorageTexture => vk::DescriptorType::STORAGE_IMAGE,
        ShaderBindingKind::Sampler => vk::DescriptorType::SAMPLER,
    }
}

// ============================================================================
// Attachments
// ============================================================================

pub fn convert_load_op(load_op: LoadOp) -> vk::AttachmentLoadOp {
    match load_op {
        LoadOp::Clear(_) => vk::AttachmentLoadOp::CLEAR,
        LoadOp::Load => vk::AttachmentLoadOp::LOAD,
        LoadOp::DontCare => vk::AttachmentLoadOp::DONT_CARE,
    }
}

pub fn convert_store_op(store_op: StoreOp) -> vk::AttachmentStoreOp {
    match store_op {
        StoreOp::Store => vk::AttachmentStoreOp::STORE,
        StoreOp::DontCare => vk::AttachmentStoreOp::DONT_CARE,
    }
}

pub fn convert_clear_value(load_op: LoadOp) -> vk::ClearValue {
    match load_op {
        LoadOp::Clear(ClearValue::Color { r, g, b, a }) => vk::ClearValue {
            color: vk::ClearColorValue {
                float32: [r, g, b, a],
            },
        },
        LoadOp::Clear(ClearValue::DepthStencil { depth, stencil }) => vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
        },
        LoadOp::Load | LoadOp::DontCare => vk::ClearValue::default(),
    }
}

// ============================================================================
// Pipeline state
// ============================================================================

pub fn convert_topology(topology: PrimitiveTopology) -> vk::PrimitiveTopology {
    match topology {
        PrimitiveTopology::PointList => vk::PrimitiveTopology::POINT_LIST,
        PrimitiveTopology::LineList => vk::PrimitiveTopology::LINE_LIST,
        PrimitiveTopology::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
        PrimitiveTopology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
    }
}

pub fn convert_front_face(front_face: FrontFace) -> vk::FrontFace {
    match front_face {
        FrontFace::Ccw => vk::FrontFace::COUNTER_CLOCKWISE,
        FrontFace::Cw => vk::FrontFace::CLOCKWISE,
    }
}

pub fn convert_cull_mode(cull_mode: CullMode) -> vk::CullModeFlags {
    match cull_mode {
        CullMode::None => vk::CullModeFlags::NONE,
        CullMode::Front => vk::CullModeFlags::FRONT,
        CullMode::Back => vk::CullModeFlags::BACK,
    }
}

pub fn convert_polygon_mode(mode: PolygonMode) -> vk::PolygonMode {
    match mode {
        PolygonMode::Fill => vk::PolygonMode::FILL,
        PolygonMode::Line => vk::PolygonMode::LINE,
    }
}

pub fn convert_compare_function(func: CompareFunction) -> vk::CompareOp {
    match func {
        CompareFunction::Never => vk::CompareOp::NEVER,
        CompareFunction::Less => vk::CompareOp::LESS,
        CompareFunction::Equal => vk::CompareOp::EQUAL,
        CompareFunction::LessEqual => vk::CompareOp::LESS_OR_EQUAL,
        CompareFunction::Greater => vk::CompareOp::GREATER,
        CompareFunction::NotEqual => vk::CompareOp::NOT_EQUAL,
        CompareFunction::GreaterEqual => vk::CompareOp::GREATER_OR_EQUAL,
        CompareFunction::Always => vk::CompareOp::ALWAYS,
    }
}

fn convert_blend_factor(factor: BlendFactor) -> vk::BlendFactor {
    match factor {
        BlendFactor::Zero => vk::BlendFactor::ZERO,
        BlendFactor::One => vk::BlendFactor::ONE,
        BlendFactor::Src => vk::BlendFactor::SRC_COLOR,
        BlendFactor::OneMinusSrc => vk::BlendFactor::ONE_MINUS_SRC_COLOR,
        BlendFactor::SrcAlpha => vk::BlendFactor::SRC_ALPHA,
        BlendFactor::OneMinusSrcAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        BlendFactor::Dst => vk::BlendFactor::DST_COLOR,
        BlendFactor::OneMinusDst => vk::BlendFactor::ONE_MINUS_DST_COLOR,
        BlendFactor::DstAlpha => vk::BlendFactor::DST_ALPHA,
        BlendFactor::OneMinusDstAlpha => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
    }
}

fn convert_blend_op(op: BlendOperation) -> vk::BlendOp {
    match op {
        BlendOperation::Add => vk::BlendOp::ADD,
        BlendOperation::Subtract => vk::BlendOp::SUBTRACT,
        BlendOperation::ReverseSubtract => vk::BlendOp::REVERSE_SUBTRACT,
        BlendOperation::Min => vk::BlendOp::MIN,
        BlendOperation::Max => vk::BlendOp::MAX,
    }
}

pub fn convert_blend_state(blend: Option<BlendState>) -> vk::PipelineColorBlendAttachmentState {
    let state = vk::PipelineColorBlendAttachmentState::default()
        .color_write_mask(vk::ColorComponentFlags::RGBA);
    match blend {
        Some(blend) => state
            .blend_enable(true)
            .src_color_blend_factor(convert_blend_factor(blend.color.src_factor))
            .dst_color_blend_factor(convert_blend_factor(blend.color.dst_factor))
            .color_blend_op(convert_blend_op(blend.color.operation))
            .src_alpha_blend_factor(convert_blend_factor(blend.alpha.src_factor))
            .dst_alpha_blend_factor(convert_blend_factor(blend.alpha.dst_factor))
            .alpha_blend_op(convert_blend_op(blend.alpha.operation)),
        None => state.blend_enable(false),
    }
}

pub fn convert_vertex_format(format: VertexFormat) -> vk::Format {
    match format {
        VertexFormat::Float32 => vk::Format::R32_SFLOAT,
        VertexFormat::Float32x2 => vk::Format::R32G32_SFLOAT,
        VertexFormat::Float32x3 => vk::Format::R32G32B32_SFLOAT,
        VertexFormat::Float32x4 => vk::Format::R32G32B32A32_SFLOAT,
        VertexFormat::Uint32 => vk::Format::R32_UINT,
        VertexFormat::Sint32 => vk::Format::R32_SINT,
        VertexFormat::Unorm8x4 => vk::Format::R8G8B8A8_UNORM,
    }
}

pub fn convert_step_mode(step_mode: VertexStepMode) -> vk::VertexInputRate {
    match step_mode {
        VertexStepMode::Vertex => vk::VertexInputRate::VERTEX,
        VertexStepMode::Instance => vk::VertexInputRate::INSTANCE,
    }
}

// ============================================================================
// Synchronization
// ============================================================================

/// Pipeline stages an access scope touches.
pub fn scope_stages(scope: &AccessScope) -> vk::PipelineStageFlags2 {
    match scope.pass_type {
        PassType::Transfer => vk::PipelineStageFlags2::ALL_TRANSFER,
        PassType::Compute => match scope.usage {
            ResourceUsage::Buffer(usage) if usage.contains(BufferUsage::INDIRECT_BUFFER) => {
                vk::PipelineStageFlags2::COMPUTE_SHADER | vk::PipelineStageFlags2::DRAW_INDIRECT
            }
            _ => vk::PipelineStageFlags2::COMPUTE_SHADER,
        },
        PassType::Draw => match scope.usage {
            ResourceUsage::Buffer(usage) => {
                let mut stages = vk::PipelineStageFlags2::empty();
                if usage.intersects(BufferUsage::VERTEX_BUFFER | BufferUsage::INDEX_BUFFER) {
                    stages |= vk::PipelineStageFlags2::VERTEX_INPUT;
                }
                if usage.contains(BufferUsage::INDIRECT_BUFFER) {
                    stages |= vk::PipelineStageFlags2::DRAW_INDIRECT;
                }
                if usage.intersects(BufferUsage::UNIFORM_BUFFER | BufferUsage::STORAGE_BUFFER) {
                    stages |= vk::PipelineStageFlags2::VERTEX_SHADER
                        | vk::PipelineStageFlags2::FRAGMENT_SHADER;
                }
                if usage.intersects(BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST) {
                    stages |= vk::PipelineStageFlags2::ALL_TRANSFER;
                }
                if stages.is_empty() {
                    vk::PipelineStageFlags2::ALL_GRAPHICS
                } else {
                    stages
                }
            }
            ResourceUsage::Image(usage) => {
                let mut stages = vk::PipelineStageFlags2::empty();
                if usage.contains(ImageUsage::COLOR_ATTACHMENT) {
                    stages |= vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT;
                }
                if usage.contains(ImageUsage::DEPTH_STENCIL_ATTACHMENT) {
                    stages |= vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                        | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS;
                }
                if usage.intersects(ImageUsage::SAMPLED | ImageUsage::STORAGE) {
                    stages |= vk::PipelineStageFlags2::FRAGMENT_SHADER;
                }
                if usage.intersects(ImageUsage::TRANSFER_SRC | ImageUsage::TRANSFER_DST) {
                    stages |= vk::PipelineStageFlags2::ALL_TRANSFER;
                }
                if stages.is_empty() {
                    vk::PipelineStageFlags2::ALL_GRAPHICS
                } else {
                    stages
                }
            }
        },
    }
}

/// Memory accesses an access scope performs.
pub fn scope_access(scope: &AccessScope) -> vk::AccessFlags2 {
    let mut access = vk::AccessFlags2::empty();
    match scope.usage {
        ResourceUsage::Buffer(usage) => {
            if usage.contains(BufferUsage::TRANSFER_SRC) {
                access |= vk::AccessFlags2::TRANSFER_READ;
            }
            if usage.contains(BufferUsage::TRANSFER_DST) {
                access |= vk::AccessFlags2::TRANSFER_WRITE;
            }
            if usage.contains(BufferUsage::UNIFORM_BUFFER) {
                access |= vk::AccessFlags2::UNIFORM_READ;
            }
            if usage.contains(BufferUsage::STORAGE_BUFFER) {
                access |= vk::AccessFlags2::SHADER_STORAGE_READ
                    | vk::AccessFlags2::SHADER_STORAGE_WRITE;
            }
            if usage.contains(BufferUsage::INDEX_BUFFER) {
                access |= vk::AccessFlags2::INDEX_READ;
            }
            if usage.contains(BufferUsage::VERTEX_BUFFER) {
                access |= vk::AccessFlags2::VERTEX_ATTRIBUTE_READ;
            }
            if usage.contains(BufferUsage::INDIRECT_BUFFER) {
                access |= vk::AccessFlags2::INDIRECT_COMMAND_READ;
            }
        }
        ResourceUsage::Image(usage) => {
            if usage.contains(ImageUsage::TRANSFER_SRC) {
                access |= vk::AccessFlags2::TRANSFER_READ;
            }
            if usage.contains(ImageUsage::TRANSFER_DST) {
                access |= vk::AccessFlags2::TRANSFER_WRITE;
            }
            if usage.contains(ImageUsage::SAMPLED) {
                access |= vk::AccessFlags2::SHADER_SAMPLED_READ;
            }
            if usage.contains(ImageUsage::STORAGE) {
                access |= vk::AccessFlags2::SHADER_STORAGE_READ
                    | vk::AccessFlags2::SHADER_STORAGE_WRITE;
            }
            if usage.contains(ImageUsage::COLOR_ATTACHMENT) {
                access |= vk::AccessFlags2::COLOR_ATTACHMENT_READ
                    | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE;
            }
            if usage.contains(ImageUsage::DEPTH_STENCIL_ATTACHMENT) {
                access |= vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE;
            }
        }
    }
    access
}

/// Image layout an access scope expects.
pub fn scope_layout(scope: &AccessScope) -> vk::ImageLayout {
    let ResourceUsage::Image(usage) = scope.usage else {
        return vk::ImageLayout::UNDEFINED;
    };
    if usage.contains(ImageUsage::COLOR_ATTACHMENT) {
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
    } else if usage.contains(ImageUsage::DEPTH_STENCIL_ATTACHMENT) {
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
    } else if usage.contains(ImageUsage::STORAGE) {
        vk::ImageLayout::GENERAL
    } else if usage.contains(ImageUsage::SAMPLED) {
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    } else if usage.contains(ImageUsage::TRANSFER_DST) {
        vk::ImageLayout::TRANSFER_DST_OPTIMAL
    } else if usage.contains(ImageUsage::TRANSFER_SRC) {
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL
    } else {
        vk::ImageLayout::GENERAL
    }
}
