//! Command recording for pass execute callbacks.
//!
//! A [`CommandEncoder`] lives for one execute call. It records [`Command`]s
//! that still name resources by [`ResourceHandle`]; the frame orchestrator
//! resolves handles to device objects and pipelines to compiled pipeline
//! objects when the frame is dispatched.
//!
//! Raw data handed to the encoder goes into the frame slot's allocators:
//! vertex, index and argument data into the linear allocator, buffer and image
//! uploads into staging memory followed by a recorded copy.
//!
//! Recording errors (an exhausted allocator, for instance) are sticky: the
//! first one is kept, later calls are ignored, and the orchestrator drops the
//! frame once the callback returns.

use crate::allocator::{LinearAllocator, StagingAllocator};
use crate::error::{GraphicsError, GraphicsResult};
use crate::graph::{FrameInfo, PassType};
use crate::pipeline::{ComputePipelineHandle, GraphicsPipelineHandle};
use crate::resource::{argument_name, ResourceHandle};
use crate::types::{Extent3d, ScissorRect, Viewport};

/// Width of index buffer elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexType {
    U16,
    U32,
}

impl IndexType {
    pub fn size(self) -> u64 {
        match self {
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }
}

/// A byte range of a buffer resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferRange {
    pub handle: ResourceHandle,
    pub offset: u64,
    pub size: u64,
}

/// A recorded command, still expressed in logical handles.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    BindGraphicsPipeline(GraphicsPipelineHandle),
    BindComputePipeline(ComputePipelineHandle),
    SetViewport(Viewport),
    SetScissor(ScissorRect),
    BindVertexBuffers {
        first_binding: u32,
        buffers: Vec<(ResourceHandle, u64)>,
    },
    BindIndexBuffer {
        handle: ResourceHandle,
        offset: u64,
        index_type: IndexType,
    },
    /// Uniform data for the shader argument with the given name hash.
    SetArgument {
        argument: u64,
        data: BufferRange,
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
        src: BufferRange,
        dst: ResourceHandle,
        dst_offset: u64,
    },
    CopyBufferToImage {
        src: BufferRange,
        dst: ResourceHandle,
        extent: Extent3d,
        mip_level: u32,
    },
}

impl Command {
    /// Whether the command issues draw work.
    pub fn is_draw(&self) -> bool {
        matches!(self, Self::Draw { .. } | Self::DrawIndexed { .. })
    }
}

/// Recording facade passed to execute callbacks.
pub struct CommandEncoder<'e> {
    pass_name: &'e str,
    pass_type: PassType,
    frame: &'e FrameInfo,
    render_area: Extent3d,
    linear: &'e mut LinearAllocator,
    staging: &'e mut StagingAllocator,
    commands: Vec<Command>,
    error: Option<GraphicsError>,
}

impl<'e> CommandEncoder<'e> {
    pub(crate) fn new(
        pass_name: &'e str,
        pass_type: PassType,
        frame: &'e FrameInfo,
        render_area: Extent3d,
        linear: &'e mut LinearAllocator,
        staging: &'e mut StagingAllocator,
    ) -> Self {
        Self {
            pass_name,
            pass_type,
            frame,
            render_area,
            linear,
            staging,
            commands: Vec::new(),
            error: None,
        }
    }

    pub fn pass_name(&self) -> &str {
        self.pass_name
    }

    pub fn pass_type(&self) -> PassType {
        self.pass_type
    }

    pub fn frame(&self) -> &FrameInfo {
        self.frame
    }

    /// Extent of the pass's attachments, or the frame extent without any.
    pub fn render_area(&self) -> Extent3d {
        self.render_area
    }

    /// Commands recorded so far.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// First recording error, if any.
    pub fn error(&self) -> Option<&GraphicsError> {
        self.error.as_ref()
    }

    pub fn bind_graphics_pipeline(&mut self, pipeline: GraphicsPipelineHandle) -> &mut Self {
        self.push(Command::BindGraphicsPipeline(pipeline))
    }

    pub fn bind_compute_pipeline(&mut self, pipeline: ComputePipelineHandle) -> &mut Self {
        self.push(Command::BindComputePipeline(pipeline))
    }

    pub fn set_viewport(&mut self, viewport: Viewport) -> &mut Self {
        self.push(Command::SetViewport(viewport))
    }

    pub fn set_scissor(&mut self, scissor: ScissorRect) -> &mut Self {
        self.push(Command::SetScissor(scissor))
    }

    /// Bind buffer resources declared by the pass as vertex buffers.
    pub fn bind_vertex_buffers(
        &mut self,
        first_binding: u32,
        buffers: &[(ResourceHandle, u64)],
    ) -> &mut Self {
        self.push(Command::BindVertexBuffers {
            first_binding,
            buffers: buffers.to_vec(),
        })
    }

    /// Bind a buffer resource declared by the pass as the index buffer.
    pub fn bind_index_buffer(
        &mut self,
        handle: ResourceHandle,
        offset: u64,
        index_type: IndexType,
    ) -> &mut Self {
        self.push(Command::BindIndexBuffer {
            handle,
            offset,
            index_type,
        })
    }

    /// Copy `data` into per-frame memory and bind it as vertex buffer `binding`.
    pub fn set_vertex_data<T: bytemuck::Pod>(&mut self, data: &[T], binding: u32) -> &mut Self {
        let Some(range) = self.push_linear(bytemuck::cast_slice(data)) else {
            return self;
        };
        self.push(Command::BindVertexBuffers {
            first_binding: binding,
            buffers: vec![(range.handle, range.offset)],
        })
    }

    /// Copy `data` into per-frame memory and bind it as the index buffer.
    pub fn set_index_data<T: bytemuck::Pod>(
        &mut self,
        data: &[T],
        index_type: IndexType,
    ) -> &mut Self {
        let Some(range) = self.push_linear(bytemuck::cast_slice(data)) else {
            return self;
        };
        self.push(Command::BindIndexBuffer {
            handle: range.handle,
            offset: range.offset,
            index_type,
        })
    }

    /// Copy `data` into per-frame memory and bind it to the shader argument
    /// called `name` (a uniform block or its instance name).
    pub fn set_argument_data<T: bytemuck::Pod>(&mut self, name: &str, data: &T) -> &mut Self {
        let Some(range) = self.push_linear(bytemuck::bytes_of(data)) else {
            return self;
        };
        self.push(Command::SetArgument {
            argument: argument_name(name),
            data: range,
        })
    }

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> &mut Self {
        self.push(Command::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        })
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> &mut Self {
        self.push(Command::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        })
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> &mut Self {
        self.push(Command::Dispatch { x, y, z })
    }

    /// Copy `size` bytes between two buffer resources.
    pub fn copy_buffer(
        &mut self,
        src: ResourceHandle,
        src_offset: u64,
        dst: ResourceHandle,
        dst_offset: u64,
        size: u64,
    ) -> &mut Self {
        self.push(Command::CopyBuffer {
            src: BufferRange {
                handle: src,
                offset: src_offset,
                size,
            },
            dst,
            dst_offset,
        })
    }

    /// Upload `data` through staging memory into a buffer resource.
    pub fn write_to_buffer(
        &mut self,
        dst: ResourceHandle,
        dst_offset: u64,
        data: &[u8],
    ) -> &mut Self {
        let Some(src) = self.push_staging(data) else {
            return self;
        };
        self.push(Command::CopyBuffer {
            src,
            dst,
            dst_offset,
        })
    }

    /// Upload tightly packed texel `data` through staging memory into mip
    /// `mip_level` of an image resource.
    pub fn write_to_image(
        &mut self,
        dst: ResourceHandle,
        extent: Extent3d,
        mip_level: u32,
        data: &[u8],
    ) -> &mut Self {
        let Some(src) = self.push_staging(data) else {
            return self;
        };
        self.push(Command::CopyBufferToImage {
            src,
            dst,
            extent,
            mip_level,
        })
    }

    /// Map staging memory directly and record nothing.
    ///
    /// Pair with [`copy_buffer`](Self::copy_buffer) using the returned range.
    pub fn map_staging(&mut self, size: u64) -> GraphicsResult<(BufferRange, &mut [u8])> {
        let (allocation, memory) = self.staging.map(size)?;
        let range = BufferRange {
            handle: allocation.handle,
            offset: allocation.offset,
            size: allocation.size,
        };
        Ok((range, memory))
    }

    pub(crate) fn finish(self) -> GraphicsResult<Vec<Command>> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.commands),
        }
    }

    fn push(&mut self, command: Command) -> &mut Self {
        if self.error.is_none() {
            self.commands.push(command);
        }
        self
    }

    fn push_linear(&mut self, data: &[u8]) -> Option<BufferRange> {
        if self.error.is_some() {
            return None;
        }
        match self.linear.write(data) {
            Ok(offset) => Some(BufferRange {
                handle: self.linear.handle(),
                offset,
                size: data.len() as u64,
            }),
            Err(err) => {
                self.fail(err);
                None
            }
        }
    }

    fn push_staging(&mut self, data: &[u8]) -> Option<BufferRange> {
        if self.error.is_some() {
            return None;
        }
        match self.staging.upload(data) {
            Ok(allocation) => Some(BufferRange {
                handle: allocation.handle,
                offset: allocation.offset,
                size: allocation.size,
            }),
            Err(err) => {
                self.fail(err);
                None
            }
        }
    }

    fn fail(&mut self, err: GraphicsError) {
        log::error!("Pass '{}' failed to record: {err}", self.pass_name);
        self.error.get_or_insert(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceType;
    use rstest::{fixture, rstest};

    struct Allocators {
        linear: LinearAllocator,
        staging: StagingAllocator,
        frame: FrameInfo,
    }

    #[fixture]
    fn allocators() -> Allocators {
        Allocators {
            linear: LinearAllocator::new(
                ResourceHandle::indexed("test/linear", 0, ResourceType::Buffer),
                1024,
                256,
            )
            .unwrap(),
            staging: StagingAllocator::new("test/staging", 256, 1024).unwrap(),
            frame: FrameInfo::default(),
        }
    }

    fn encoder(a: &mut Allocators) -> CommandEncoder<'_> {
        CommandEncoder::new(
            "test",
            PassType::Draw,
            &a.frame,
            a.frame.extent,
            &mut a.linear,
            &mut a.staging,
        )
    }

    #[rstest]
    fn test_records_in_order(mut allocators: Allocators) {
        let mut enc = encoder(&mut allocators);
        enc.set_viewport(Viewport::new(0.0, 0.0, 64.0, 64.0))
            .draw(3, 1, 0, 0)
            .dispatch(1, 2, 3);
        let commands = enc.finish().unwrap();
        assert_eq!(commands.len(), 3);
        assert!(commands[1].is_draw());
        assert_eq!(commands[2], Command::Dispatch { x: 1, y: 2, z: 3 });
    }

    #[rstest]
    fn test_vertex_data_goes_through_linear_allocator(mut allocators: Allocators) {
        let handle = allocators.linear.handle();
        let mut enc = encoder(&mut allocators);
        enc.set_vertex_data(&[1.0f32, 2.0, 3.0], 0);
        enc.set_argument_data("ubo", &[0u32; 4]);
        let commands = enc.finish().unwrap();
        assert_eq!(
            commands[0],
            Command::BindVertexBuffers {
                first_binding: 0,
                buffers: vec![(handle, 0)],
            }
        );
        match &commands[1] {
            Command::SetArgument { argument, data } => {
                assert_eq!(*argument, argument_name("ubo"));
                assert_eq!(data.offset, 256);
                assert_eq!(data.size, 16);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(allocators.linear.used(), 272);
    }

    #[rstest]
    fn test_exhaustion_is_sticky(mut allocators: Allocators) {
        let mut enc = encoder(&mut allocators);
        enc.set_vertex_data(&[0u8; 600], 0)
            .set_vertex_data(&[0u8; 600], 1)
            .draw(3, 1, 0, 0);
        assert_eq!(enc.commands().len(), 1);
        assert!(matches!(
            enc.finish(),
            Err(GraphicsError::TransientAllocatorExhausted { requested: 600, .. })
        ));
    }

    #[rstest]
    fn test_write_to_buffer_records_copy(mut allocators: Allocators) {
        let dst = ResourceHandle::buffer("dst");
        let mut enc = encoder(&mut allocators);
        enc.write_to_buffer(dst, 32, &[7u8; 40]);
        let commands = enc.finish().unwrap();
        match &commands[0] {
            Command::CopyBuffer {
                src,
                dst: d,
                dst_offset,
            } => {
                assert_eq!(*d, dst);
                assert_eq!(*dst_offset, 32);
                assert_eq!(src.size, 40);
                assert_eq!(src.handle, allocators.staging.chunks()[0].handle());
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(allocators.staging.chunks()[0].contents(), &[7u8; 40][..]);
    }

    #[rstest]
    fn test_staging_budget_error(mut allocators: Allocators) {
        let image = ResourceHandle::image("img");
        let mut enc = encoder(&mut allocators);
        enc.write_to_image(image, Extent3d::new_2d(32, 32), 0, &[0u8; 4096]);
        assert!(matches!(
            enc.finish(),
            Err(GraphicsError::StagingAllocatorExhausted { .. })
        ));
    }
}
