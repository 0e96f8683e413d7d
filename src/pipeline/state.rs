//! Pipeline state objects.
//!
//! Everything in here is hashed into the pipeline cache key, so the types only
//! hold integer and enum data. Two states that compare equal always produce
//! the same key.

use crate::resource::fnv_hash;
use crate::shader::ShaderModuleHandle;
use crate::types::TextureFormat;

// ============================================================================
// Fixed-function state
// ============================================================================

/// Primitive topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
}

/// Front face winding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FrontFace {
    #[default]
    Ccw,
    Cw,
}

/// Cull mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    #[default]
    None,
    Front,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PolygonMode {
    #[default]
    Fill,
    Line,
}

/// Rasterization state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RasterizationState {
    pub topology: PrimitiveTopology,
    pub front_face: FrontFace,
    pub cull_mode: CullMode,
    pub polygon_mode: PolygonMode,
}

/// Compare function for depth/stencil
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompareFunction {
    Never,
    #[default]
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

/// Depth state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DepthState {
    pub test_enabled: bool,
    pub write_enabled: bool,
    pub compare: CompareFunction,
}

impl DepthState {
    /// Depth test and write with `Less`.
    pub fn less() -> Self {
        Self {
            test_enabled: true,
            write_enabled: true,
            compare: CompareFunction::Less,
        }
    }
}

/// Blend factor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    Src,
    OneMinusSrc,
    SrcAlpha,
    OneMinusSrcAlpha,
    Dst,
    OneMinusDst,
    DstAlpha,
    OneMinusDstAlpha,
}

/// Blend operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendOperation {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

/// Blend component state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendComponent {
    pub src_factor: BlendFactor,
    pub dst_factor: BlendFactor,
    pub operation: BlendOperation,
}

impl Default for BlendComponent {
    fn default() -> Self {
        Self {
            src_factor: BlendFactor::One,
            dst_factor: BlendFactor::Zero,
            operation: BlendOperation::Add,
        }
    }
}

/// Blend state of a color attachment. `None` in a pipeline means opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BlendState {
    pub color: BlendComponent,
    pub alpha: BlendComponent,
}

impl BlendState {
    pub fn alpha_blending() -> Self {
        Self {
            color: BlendComponent {
                src_factor: BlendFactor::SrcAlpha,
                dst_factor: BlendFactor::OneMinusSrcAlpha,
                operation: BlendOperation::Add,
            },
            alpha: BlendComponent {
                src_factor: BlendFactor::One,
                dst_factor: BlendFactor::OneMinusSrcAlpha,
                operation: BlendOperation::Add,
            },
        }
    }

    pub fn additive() -> Self {
        let add = BlendComponent {
            src_factor: BlendFactor::One,
            dst_factor: BlendFactor::One,
            operation: BlendOperation::Add,
        };
        Self {
            color: add,
            alpha: add,
        }
    }
}

// ============================================================================
// Vertex input
// ============================================================================

/// Vertex attribute format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
    Uint32,
    Sint32,
    Unorm8x4,
}

impl VertexFormat {
    pub fn size(&self) -> u32 {
        match self {
            Self::Float32 | Self::Uint32 | Self::Sint32 | Self::Unorm8x4 => 4,
            Self::Float32x2 => 8,
            Self::Float32x3 => 12,
            Self::Float32x4 => 16,
        }
    }
}

/// Vertex attribute description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VertexStepMode {
    #[default]
    Vertex,
    Instance,
}

/// Vertex buffer layout
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VertexBufferLayout {
    pub binding: u32,
    pub stride: u32,
    pub step_mode: VertexStepMode,
    pub attributes: Vec<VertexAttribute>,
}

impl VertexBufferLayout {
    /// Tightly packed per-vertex layout; offsets follow attribute order.
    pub fn packed(binding: u32, formats: &[VertexFormat]) -> Self {
        let mut offset = 0;
        let attributes = formats
            .iter()
            .enumerate()
            .map(|(location, format)| {
                let attribute = VertexAttribute {
                    location: location as u32,
                    format: *format,
                    offset,
                };
                offset += format.size();
                attribute
            })
            .collect();
        Self {
            binding,
            stride: offset,
            step_mode: VertexStepMode::Vertex,
            attributes,
        }
    }
}

// ============================================================================
// Pipeline states
// ============================================================================

/// Everything needed to build a graphics pipeline apart from the render pass.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GraphicsPipelineState {
    pub vertex_shader: ShaderModuleHandle,
    pub fragment_shader: Option<ShaderModuleHandle>,
    pub rasterization: RasterizationState,
    pub depth: DepthState,
    pub blend: Option<BlendState>,
    pub vertex_layouts: Vec<VertexBufferLayout>,
}

impl GraphicsPipelineState {
    pub fn new(vertex_shader: ShaderModuleHandle, fragment_shader: ShaderModuleHandle) -> Self {
        Self {
            vertex_shader,
            fragment_shader: Some(fragment_shader),
            rasterization: RasterizationState::default(),
            depth: DepthState::default(),
            blend: None,
            vertex_layouts: Vec::new(),
        }
    }

    /// Vertex-only pipeline (depth prepass, shadow maps).
    pub fn vertex_only(vertex_shader: ShaderModuleHandle) -> Self {
        Self {
            fragment_shader: None,
            ..Self::new(vertex_shader, vertex_shader)
        }
    }

    pub fn with_rasterization(mut self, rasterization: RasterizationState) -> Self {
        self.rasterization = rasterization;
        self
    }

    pub fn with_topology(mut self, topology: PrimitiveTopology) -> Self {
        self.rasterization.topology = topology;
        self
    }

    pub fn with_cull_mode(mut self, cull_mode: CullMode) -> Self {
        self.rasterization.cull_mode = cull_mode;
        self
    }

    pub fn with_depth(mut self, depth: DepthState) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_blend(mut self, blend: BlendState) -> Self {
        self.blend = Some(blend);
        self
    }

    pub fn with_vertex_layout(mut self, layout: VertexBufferLayout) -> Self {
        self.vertex_layouts.push(layout);
        self
    }

    /// Shader modules this state references.
    pub fn shaders(&self) -> impl Iterator<Item = ShaderModuleHandle> + '_ {
        std::iter::once(self.vertex_shader).chain(self.fragment_shader)
    }

    /// Handle identifying this state in the pipeline manager.
    pub fn handle(&self) -> GraphicsPipelineHandle {
        GraphicsPipelineHandle(fnv_hash(self))
    }
}

/// Compute pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComputePipelineState {
    pub shader: ShaderModuleHandle,
}

impl ComputePipelineState {
    pub fn new(shader: ShaderModuleHandle) -> Self {
        Self { shader }
    }

    pub fn handle(&self) -> ComputePipelineHandle {
        ComputePipelineHandle(fnv_hash(self))
    }
}

/// Content hash of a [`GraphicsPipelineState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GraphicsPipelineHandle(pub(crate) u64);

/// Content hash of a [`ComputePipelineState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComputePipelineHandle(pub(crate) u64);

impl GraphicsPipelineHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl ComputePipelineHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Attachment formats a graphics pipeline must be compatible with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct RenderPassCompat {
    pub color_formats: Vec<TextureFormat>,
    pub depth_format: Option<TextureFormat>,
    pub samples: u32,
}

impl RenderPassCompat {
    pub fn new(color_formats: Vec<TextureFormat>, depth_format: Option<TextureFormat>) -> Self {
        Self {
            color_formats,
            depth_format,
            samples: 1,
        }
    }

    pub fn hash_key(&self) -> u64 {
        fnv_hash(self)
    }
}
