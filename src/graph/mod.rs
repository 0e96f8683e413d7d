//! Render modules and passes.
//!
//! A frame is described as a [`RenderModule`]: an ordered list of
//! [`RenderPass`]es built by the application every frame. Each pass carries a
//! setup callback that declares the resources it touches through a
//! [`PassBuilder`], and an execute callback that records commands into a
//! [`CommandEncoder`](crate::encoder::CommandEncoder).
//!
//! Passes never reference each other directly. Ordering falls out of the
//! resources they declare, which the [`compiler`](crate::compiler) resolves.
//!
//! # Example
//!
//! ```
//! use frameforge::graph::{ColorAttachment, PassType, RenderModule, RenderPass};
//! use frameforge::resource::{BufferInfo, ResourceHandle};
//! use frameforge::types::BufferUsage;
//!
//! const VERTICES: ResourceHandle = ResourceHandle::buffer("vertices");
//!
//! let module = RenderModule::new()
//!     .with_pass(
//!         RenderPass::new("upload", PassType::Transfer).with_setup(|builder| {
//!             builder.use_resource(
//!                 VERTICES,
//!                 BufferInfo::new(1024).with_usage(BufferUsage::TRANSFER_DST),
//!             );
//!             true
//!         }),
//!     )
//!     .with_pass(
//!         RenderPass::new("draw", PassType::Draw).with_setup(|builder| {
//!             let target = builder.swapchain_image();
//!             builder
//!                 .use_resource(
//!                     VERTICES,
//!                     BufferInfo::new(1024).with_usage(BufferUsage::VERTEX_BUFFER),
//!                 )
//!                 .add_color_attachment(target, ColorAttachment::new())
//!                 .set_is_root(true);
//!             true
//!         }),
//!     );
//! assert_eq!(module.len(), 2);
//! ```

mod pass;
mod target;

pub use pass::{
    Access, ExecuteFn, PassBuilder, PassDeclaration, PassType, RenderPass, ResourceDeclaration,
    SetupFn,
};
pub use target::{
    Attachment, ClearValue, ColorAttachment, DepthStencilAttachment, LoadOp, StoreOp,
};

use crate::types::{Extent3d, TextureFormat};

/// Per-frame information visible to setup callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Monotonic frame counter, starting at 1 for the first acquired frame.
    pub frame_number: u64,
    /// Frame slot the frame is recorded into.
    pub slot: usize,
    /// Extent of the presentable image.
    pub extent: Extent3d,
    /// Format of the presentable image.
    pub format: TextureFormat,
}

impl Default for FrameInfo {
    fn default() -> Self {
        Self {
            frame_number: 0,
            slot: 0,
            extent: Extent3d::new_2d(1280, 720),
            format: TextureFormat::Bgra8UnormSrgb,
        }
    }
}

impl FrameInfo {
    pub fn new(extent: Extent3d, format: TextureFormat) -> Self {
        Self {
            extent,
            format,
            ..Self::default()
        }
    }

    pub fn with_frame(mut self, frame_number: u64, slot: usize) -> Self {
        self.frame_number = frame_number;
        self.slot = slot;
        self
    }
}

/// Ordered collection of passes making up one frame.
#[derive(Debug, Default)]
pub struct RenderModule<'a> {
    passes: Vec<RenderPass<'a>>,
}

impl<'a> RenderModule<'a> {
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    /// Append a pass.
    pub fn add_render_pass(&mut self, pass: RenderPass<'a>) -> &mut Self {
        self.passes.push(pass);
        self
    }

    /// Append a pass, builder style.
    pub fn with_pass(mut self, pass: RenderPass<'a>) -> Self {
        self.passes.push(pass);
        self
    }

    pub fn passes(&self) -> &[RenderPass<'a>] {
        &self.passes
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    pub(crate) fn into_passes(self) -> Vec<RenderPass<'a>> {
        self.passes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_preserves_order() {
        let mut module = RenderModule::new();
        module
            .add_render_pass(RenderPass::new("a", PassType::Transfer))
            .add_render_pass(RenderPass::new("b", PassType::Compute));
        let module = module.with_pass(RenderPass::new("c", PassType::Draw));
        let names: Vec<_> = module.passes().iter().map(|p| p.name()).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn test_frame_info() {
        let info = FrameInfo::new(Extent3d::new_2d(640, 480), TextureFormat::Rgba8Unorm)
            .with_frame(7, 1);
        assert_eq!(info.frame_number, 7);
        assert_eq!(info.slot, 1);
        assert_eq!(info.extent.width, 640);
    }
}
