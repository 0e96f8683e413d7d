//! Attachment types for draw passes.

use crate::resource::{ImageInfo, ResourceHandle};
use crate::types::{ImageUsage, TextureFormat};

/// Value an attachment is cleared to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    /// Clear color attachment with RGBA values.
    Color { r: f32, g: f32, b: f32, a: f32 },
    /// Clear depth and stencil attachments.
    DepthStencil { depth: f32, stencil: u32 },
}

impl ClearValue {
    /// Create a color clear value.
    pub fn color(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self::Color { r, g, b, a }
    }

    /// Create a depth clear value with stencil zero.
    pub fn depth(depth: f32) -> Self {
        Self::DepthStencil { depth, stencil: 0 }
    }
}

/// Operation to perform when loading an attachment at the start of a pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadOp {
    /// Clear the attachment with a specified value.
    Clear(ClearValue),
    /// Load the existing contents of the attachment.
    ///
    /// Loading makes the pass read the attachment as well as write it.
    Load,
    /// Don't care about the existing contents (may be undefined).
    DontCare,
}

impl LoadOp {
    /// Create a clear operation with a color value.
    pub fn clear_color(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self::Clear(ClearValue::color(r, g, b, a))
    }

    /// Create a clear operation with a depth value.
    pub fn clear_depth(depth: f32) -> Self {
        Self::Clear(ClearValue::depth(depth))
    }

    /// Whether the previous contents are read.
    pub fn reads(&self) -> bool {
        matches!(self, Self::Load)
    }
}

/// Operation to perform when storing an attachment at the end of a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StoreOp {
    /// Store the attachment contents for later use.
    #[default]
    Store,
    /// Don't care about the contents after the pass (may be discarded).
    DontCare,
}

/// A color attachment declaration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorAttachment {
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    /// Description of the attachment image. The format may be left unset for
    /// the swapchain image.
    pub info: ImageInfo,
}

impl Default for ColorAttachment {
    fn default() -> Self {
        Self {
            load_op: LoadOp::clear_color(0.0, 0.0, 0.0, 1.0),
            store_op: StoreOp::Store,
            info: ImageInfo::new(),
        }
    }
}

impl ColorAttachment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attachment that keeps the previous contents.
    pub fn load() -> Self {
        Self::default().with_load_op(LoadOp::Load)
    }

    pub fn with_clear_color(self, r: f32, g: f32, b: f32, a: f32) -> Self {
        self.with_load_op(LoadOp::clear_color(r, g, b, a))
    }

    pub fn with_load_op(mut self, load_op: LoadOp) -> Self {
        self.load_op = load_op;
        self
    }

    pub fn with_store_op(mut self, store_op: StoreOp) -> Self {
        self.store_op = store_op;
        self
    }

    pub fn with_format(mut self, format: TextureFormat) -> Self {
        self.info = self.info.with_format(format);
        self
    }

    pub fn with_info(mut self, info: ImageInfo) -> Self {
        self.info = info;
        self
    }

    pub(crate) fn image_info(&self) -> ImageInfo {
        self.info.add_usage(ImageUsage::COLOR_ATTACHMENT)
    }
}

/// A depth/stencil attachment declaration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthStencilAttachment {
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub info: ImageInfo,
}

impl Default for DepthStencilAttachment {
    fn default() -> Self {
        Self {
            load_op: LoadOp::clear_depth(1.0),
            store_op: StoreOp::DontCare,
            info: ImageInfo::new().with_format(TextureFormat::Depth32Float),
        }
    }
}

impl DepthStencilAttachment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clear_depth(self, depth: f32) -> Self {
        self.with_load_op(LoadOp::clear_depth(depth))
    }

    pub fn with_load_op(mut self, load_op: LoadOp) -> Self {
        self.load_op = load_op;
        self
    }

    pub fn with_store_op(mut self, store_op: StoreOp) -> Self {
        self.store_op = store_op;
        self
    }

    pub fn with_format(mut self, format: TextureFormat) -> Self {
        self.info = self.info.with_format(format);
        self
    }

    pub fn with_info(mut self, info: ImageInfo) -> Self {
        self.info = info;
        self
    }

    pub(crate) fn image_info(&self) -> ImageInfo {
        self.info.add_usage(ImageUsage::DEPTH_STENCIL_ATTACHMENT)
    }
}

/// An attachment as recorded by a pass's setup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attachment {
    pub handle: ResourceHandle,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_attachment_defaults() {
        let attachment = ColorAttachment::new();
        assert!(matches!(attachment.load_op, LoadOp::Clear(ClearValue::Color { a, .. }) if a == 1.0));
        assert_eq!(attachment.store_op, StoreOp::Store);
        assert!(attachment.image_info().usage.contains(ImageUsage::COLOR_ATTACHMENT));
        assert_eq!(attachment.info.format, None);
    }

    #[test]
    fn test_depth_attachment_defaults() {
        let attachment = DepthStencilAttachment::new();
        assert_eq!(attachment.load_op, LoadOp::clear_depth(1.0));
        assert_eq!(attachment.info.format, Some(TextureFormat::Depth32Float));
        assert!(attachment
            .image_info()
            .usage
            .contains(ImageUsage::DEPTH_STENCIL_ATTACHMENT));
    }

    #[test]
    fn test_load_reads() {
        assert!(LoadOp::Load.reads());
        assert!(!LoadOp::DontCare.reads());
        assert!(!ColorAttachment::new().load_op.reads());
        assert!(ColorAttachment::load().load_op.reads());
    }
}
