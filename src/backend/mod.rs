//! GPU backend abstraction layer.
//!
//! The frame orchestrator talks to the device only through the [`GpuBackend`]
//! trait. Resources, pipelines and frame contexts are referred to by small
//! copyable ids; each backend keeps the real objects in its own tables.
//!
//! # Available Backends
//!
//! - `dummy` (default): host-memory backend with simulated fences, used by
//!   tests, benches and headless runs
//! - `vulkan-backend`: native Vulkan backend using ash
//!
//! # Architecture
//!
//! Each backend implements the [`GpuBackend`] trait, which provides:
//! - Buffer and image creation
//! - Frame contexts (a command pool plus a completion fence)
//! - Pipeline creation from SPIR-V with optional cache data
//! - Swapchain acquisition and presentation
//! - Submission of a fully resolved [`DeviceCommand`] stream

#[cfg(any(feature = "dummy", test))]
pub mod dummy;

#[cfg(feature = "vulkan-backend")]
pub mod vulkan;

use std::time::Duration;

#[cfg(any(feature = "dummy", test))]
pub use dummy::DummyBackend;

use crate::compiler::{AccessScope, Hazard};
use crate::encoder::IndexType;
use crate::error::GraphicsResult;
use crate::graph::{LoadOp, StoreOp};
use crate::pipeline::{GraphicsPipelineState, PipelineLayoutInfo, RenderPassCompat};
use crate::resource::{BufferInfo, ImageInfo};
use crate::shader::ShaderBinary;
use crate::types::{Extent3d, ScissorRect, TextureFormat, Viewport};

/// Device buffer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceBuffer(pub u64);

/// Device image id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceImage(pub u64);

/// Compiled pipeline id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePipeline(pub u64);

/// Per-frame-slot recording context: command pool, command buffer and fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameContextId(pub u64);

/// Current swapchain configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainInfo {
    pub extent: Extent3d,
    pub format: TextureFormat,
    pub image_count: u32,
}

/// A swapchain image acquired for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SwapchainImage {
    pub index: u32,
    pub image: DeviceImage,
}

/// Outcome of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresentStatus {
    Presented,
    /// Presented, but the swapchain no longer matches the surface exactly.
    Suboptimal,
    /// The work was submitted but the image could not be presented.
    OutOfDate,
    /// No presentation was requested.
    NotRequested,
}

/// An image bound as an attachment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderTarget {
    pub image: DeviceImage,
    pub format: TextureFormat,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
}

/// Physical resource a barrier applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarrierResource {
    Buffer(DeviceBuffer),
    Image {
        image: DeviceImage,
        format: TextureFormat,
    },
}

/// Resolved synchronization between two accesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceBarrier {
    pub resource: BarrierResource,
    pub hazard: Hazard,
    pub src: AccessScope,
    pub dst: AccessScope,
}

/// A command with every handle resolved to a device object.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    Barrier(DeviceBarrier),
    BeginRendering {
        colors: Vec<RenderTarget>,
        depth: Option<RenderTarget>,
        extent: Extent3d,
    },
    EndRendering,
    BindGraphicsPipeline(DevicePipeline),
    BindComputePipeline(DevicePipeline),
    SetViewport(Viewport),
    SetScissor(ScissorRect),
    BindVertexBuffers {
        first_binding: u32,
        buffers: Vec<(DeviceBuffer, u64)>,
    },
    BindIndexBuffer {
        buffer: DeviceBuffer,
        offset: u64,
        index_type: IndexType,
    },
    BindUniformBuffer {
        set: u32,
        binding: u32,
        buffer: DeviceBuffer,
        offset: u64,
        size: u64,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    CopyBuffer {
        src: DeviceBuffer,
        src_offset: u64,
        dst: DeviceBuffer,
        dst_offset: u64,
        size: u64,
    },
    CopyBufferToImage {
        src: DeviceBuffer,
        src_offset: u64,
        dst: DeviceImage,
        format: TextureFormat,
        extent: Extent3d,
        mip_level: u32,
    },
}

/// Everything needed to build a graphics pipeline.
#[derive(Debug, Clone, Copy)]
pub struct GraphicsPipelineDesc<'a> {
    pub label: &'a str,
    pub state: &'a GraphicsPipelineState,
    pub compat: &'a RenderPassCompat,
    pub vertex: &'a ShaderBinary,
    pub fragment: Option<&'a ShaderBinary>,
    pub layout: &'a PipelineLayoutInfo,
    /// Cache data from a previous run for this exact pipeline.
    pub cache_data: Option<&'a [u8]>,
}

/// Everything needed to build a compute pipeline.
#[derive(Debug, Clone, Copy)]
pub struct ComputePipelineDesc<'a> {
    pub label: &'a str,
    pub shader: &'a ShaderBinary,
    pub layout: &'a PipelineLayoutInfo,
    pub cache_data: Option<&'a [u8]>,
}

/// Device interface used by the frame orchestrator and pipeline manager.
///
/// All methods take `&self`; backends synchronize internally.
pub trait GpuBackend: Send + Sync + 'static {
    /// Get the backend name.
    fn name(&self) -> &'static str;

    fn create_buffer(&self, info: &BufferInfo, label: &str) -> GraphicsResult<DeviceBuffer>;

    fn destroy_buffer(&self, buffer: DeviceBuffer);

    /// Write host data into a host-visible buffer.
    fn write_buffer(&self, buffer: DeviceBuffer, offset: u64, data: &[u8]) -> GraphicsResult<()>;

    /// Read back buffer contents.
    fn read_buffer(&self, buffer: DeviceBuffer, offset: u64, size: u64) -> GraphicsResult<Vec<u8>>;

    fn create_image(&self, info: &ImageInfo, label: &str) -> GraphicsResult<DeviceImage>;

    fn destroy_image(&self, image: DeviceImage);

    /// Create a command pool, command buffer and fence for one frame slot.
    fn create_frame_context(&self, label: &str) -> GraphicsResult<FrameContextId>;

    fn destroy_frame_context(&self, context: FrameContextId);

    /// Non-blocking fence check. `true` when the last submission finished or
    /// nothing was submitted.
    fn poll_frame(&self, context: FrameContextId) -> GraphicsResult<bool>;

    /// Wait up to `timeout` for the context's fence. Returns whether it signaled.
    fn wait_frame(&self, context: FrameContextId, timeout: Duration) -> GraphicsResult<bool>;

    /// Reset the fence and command pool. The context must not be in flight.
    fn reset_frame(&self, context: FrameContextId) -> GraphicsResult<()>;

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc<'_>,
    ) -> GraphicsResult<DevicePipeline>;

    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc<'_>,
    ) -> GraphicsResult<DevicePipeline>;

    /// Serialized driver cache data for a pipeline, if the backend has any.
    fn pipeline_cache_data(&self, pipeline: DevicePipeline) -> Option<Vec<u8>>;

    fn destroy_pipeline(&self, pipeline: DevicePipeline);

    /// `None` for headless backends.
    fn swapchain_info(&self) -> Option<SwapchainInfo>;

    /// Acquire the next presentable image for the given frame context.
    fn acquire_swapchain_image(&self, context: FrameContextId) -> GraphicsResult<SwapchainImage>;

    /// Recreate the swapchain, optionally with a new extent.
    fn reset_swapchain(&self, extent: Option<Extent3d>) -> GraphicsResult<SwapchainInfo>;

    /// Record `commands` into the context's command buffer, submit it with the
    /// context's fence and present `present` once the work completes.
    fn submit(
        &self,
        context: FrameContextId,
        commands: &[DeviceCommand],
        present: Option<SwapchainImage>,
    ) -> GraphicsResult<PresentStatus>;

    /// Block until the device has finished all submitted work.
    fn wait_idle(&self) -> GraphicsResult<()>;
}
