//! Render passes and the setup-time pass builder.

use std::fmt;

use super::target::{Attachment, ColorAttachment, DepthStencilAttachment};
use super::FrameInfo;
use crate::encoder::CommandEncoder;
use crate::error::GraphicsError;
use crate::resource::{ResourceHandle, ResourceInfo};

/// The kind of GPU work a pass records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PassType {
    /// Copy operations.
    Transfer,
    /// Rasterization with attachments.
    Draw,
    /// Compute dispatches.
    Compute,
}

/// How a pass accesses a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub fn is_read(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    pub fn is_write(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }

    /// Access covering both `self` and `other`.
    pub fn union(self, other: Self) -> Self {
        match (self.is_read() || other.is_read(), self.is_write() || other.is_write()) {
            (true, true) => Self::ReadWrite,
            (false, true) => Self::Write,
            _ => Self::Read,
        }
    }

    fn from_flags(read: bool, write: bool) -> Self {
        match (read, write) {
            (true, true) => Self::ReadWrite,
            (false, true) => Self::Write,
            _ => Self::Read,
        }
    }
}

/// One resource a pass declared during setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceDeclaration {
    pub handle: ResourceHandle,
    pub info: ResourceInfo,
    pub access: Access,
}

/// Everything a pass declared during setup.
#[derive(Debug, Clone, Default)]
pub struct PassDeclaration {
    /// Declared resources, one entry per handle, in declaration order.
    pub resources: Vec<ResourceDeclaration>,
    pub color_attachments: Vec<Attachment>,
    pub depth_attachment: Option<Attachment>,
    pub is_root: bool,
}

impl PassDeclaration {
    /// Declaration for `handle`, if the pass uses it.
    pub fn resource(&self, handle: ResourceHandle) -> Option<&ResourceDeclaration> {
        self.resources.iter().find(|r| r.handle == handle)
    }

    /// Whether the pass writes `handle`.
    pub fn writes(&self, handle: ResourceHandle) -> bool {
        self.resource(handle).is_some_and(|r| r.access.is_write())
    }
}

/// Mutable declaration object handed to a pass's setup callback.
///
/// Declaring the same handle twice in one pass merges the two declarations.
/// Conflicting declarations are reported when the module is compiled.
pub struct PassBuilder<'f> {
    name: &'f str,
    pass_type: PassType,
    frame: &'f FrameInfo,
    declaration: PassDeclaration,
    error: Option<GraphicsError>,
}

impl<'f> PassBuilder<'f> {
    pub(crate) fn new(name: &'f str, pass_type: PassType, frame: &'f FrameInfo) -> Self {
        Self {
            name,
            pass_type,
            frame,
            declaration: PassDeclaration::default(),
            error: None,
        }
    }

    /// Declare a resource, inferring read/write access from its usage flags.
    ///
    /// Usage flags that neither read nor write count as a read.
    pub fn use_resource(
        &mut self,
        handle: ResourceHandle,
        info: impl Into<ResourceInfo>,
    ) -> &mut Self {
        let info = info.into();
        let usage = info.usage();
        let access = Access::from_flags(usage.is_read() || !usage.is_write(), usage.is_write());
        self.declare(handle, info, access)
    }

    /// Declare a resource the pass only reads.
    pub fn read(&mut self, handle: ResourceHandle, info: impl Into<ResourceInfo>) -> &mut Self {
        self.declare(handle, info.into(), Access::Read)
    }

    /// Declare a resource the pass writes.
    pub fn write(&mut self, handle: ResourceHandle, info: impl Into<ResourceInfo>) -> &mut Self {
        self.declare(handle, info.into(), Access::Write)
    }

    /// Declare a resource the pass both reads and writes.
    pub fn read_write(
        &mut self,
        handle: ResourceHandle,
        info: impl Into<ResourceInfo>,
    ) -> &mut Self {
        self.declare(handle, info.into(), Access::ReadWrite)
    }

    /// Render into `handle` as a color attachment.
    pub fn add_color_attachment(
        &mut self,
        handle: ResourceHandle,
        attachment: ColorAttachment,
    ) -> &mut Self {
        let access = if attachment.load_op.reads() {
            Access::ReadWrite
        } else {
            Access::Write
        };
        self.declare(handle, attachment.image_info().into(), access);
        self.declaration.color_attachments.push(Attachment {
            handle,
            load_op: attachment.load_op,
            store_op: attachment.store_op,
        });
        self
    }

    /// Use `handle` as the depth/stencil attachment.
    ///
    /// A second call replaces the first attachment.
    pub fn add_depth_stencil_attachment(
        &mut self,
        handle: ResourceHandle,
        attachment: DepthStencilAttachment,
    ) -> &mut Self {
        let access = if attachment.load_op.reads() {
            Access::ReadWrite
        } else {
            Access::Write
        };
        self.declare(handle, attachment.image_info().into(), access);
        self.declaration.depth_attachment = Some(Attachment {
            handle,
            load_op: attachment.load_op,
            store_op: attachment.store_op,
        });
        self
    }

    /// Mark this pass as the one whose output reaches the presentable surface.
    pub fn set_is_root(&mut self, is_root: bool) -> &mut Self {
        self.declaration.is_root = is_root;
        self
    }

    pub fn is_root(&self) -> bool {
        self.declaration.is_root
    }

    /// Handle of the presentable image for this frame.
    pub fn swapchain_image(&self) -> ResourceHandle {
        ResourceHandle::SWAPCHAIN_IMAGE
    }

    /// Frame being set up.
    pub fn frame(&self) -> &FrameInfo {
        self.frame
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn pass_type(&self) -> PassType {
        self.pass_type
    }

    fn declare(&mut self, handle: ResourceHandle, info: ResourceInfo, access: Access) -> &mut Self {
        let existing = self
            .declaration
            .resources
            .iter_mut()
            .find(|r| r.handle == handle);
        match existing {
            Some(decl) => match decl.info.merge(&info) {
                Ok(merged) => {
                    decl.info = merged;
                    decl.access = decl.access.union(access);
                }
                Err(conflict) => {
                    if self.error.is_none() {
                        self.error = Some(GraphicsError::IncompatibleResourceInfo {
                            handle,
                            reason: format!("pass '{}': {conflict}", self.name),
                        });
                    }
                }
            },
            None => self.declaration.resources.push(ResourceDeclaration {
                handle,
                info,
                access,
            }),
        }
        self
    }

    pub(crate) fn finish(self) -> Result<PassDeclaration, GraphicsError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.declaration),
        }
    }
}

/// Setup callback. Returning `false` withdraws the pass from the frame.
pub type SetupFn<'a> = Box<dyn FnMut(&mut PassBuilder<'_>) -> bool + 'a>;

/// Execute callback, invoked once per frame in compiled order.
pub type ExecuteFn<'a> = Box<dyn FnMut(&mut CommandEncoder<'_>) + 'a>;

/// A named unit of frame work.
///
/// A pass is a plain record of two closures. Whatever state the callbacks need
/// is captured by them; the pass itself lives for one frame.
///
/// ```
/// use frameforge::graph::{ColorAttachment, PassType, RenderPass};
///
/// let pass = RenderPass::new("main", PassType::Draw)
///     .with_setup(|builder| {
///         let target = builder.swapchain_image();
///         builder
///             .add_color_attachment(target, ColorAttachment::new())
///             .set_is_root(true);
///         true
///     })
///     .with_execute(|encoder| {
///         encoder.draw(3, 1, 0, 0);
///     });
/// assert_eq!(pass.name(), "main");
/// ```
pub struct RenderPass<'a> {
    name: String,
    pass_type: PassType,
    setup: Option<SetupFn<'a>>,
    execute: Option<ExecuteFn<'a>>,
}

impl<'a> RenderPass<'a> {
    pub fn new(name: impl Into<String>, pass_type: PassType) -> Self {
        Self {
            name: name.into(),
            pass_type,
            setup: None,
            execute: None,
        }
    }

    pub fn with_setup<F>(mut self, setup: F) -> Self
    where
        F: FnMut(&mut PassBuilder<'_>) -> bool + 'a,
    {
        self.setup = Some(Box::new(setup));
        self
    }

    pub fn with_execute<F>(mut self, execute: F) -> Self
    where
        F: FnMut(&mut CommandEncoder<'_>) + 'a,
    {
        self.execute = Some(Box::new(execute));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pass_type(&self) -> PassType {
        self.pass_type
    }

    /// Run setup against `frame`. `Ok(None)` means the pass withdrew itself.
    pub(crate) fn run_setup(
        &mut self,
        frame: &FrameInfo,
    ) -> Result<Option<PassDeclaration>, GraphicsError> {
        let mut builder = PassBuilder::new(&self.name, self.pass_type, frame);
        let keep = match self.setup.as_mut() {
            Some(setup) => setup(&mut builder),
            None => true,
        };
        if !keep {
            return Ok(None);
        }
        builder.finish().map(Some)
    }

    pub(crate) fn run_execute(&mut self, encoder: &mut CommandEncoder<'_>) {
        if let Some(execute) = self.execute.as_mut() {
            execute(encoder);
        }
    }
}

impl fmt::Debug for RenderPass<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderPass")
            .field("name", &self.name)
            .field("pass_type", &self.pass_type)
            .field("has_setup", &self.setup.is_some())
            .field("has_execute", &self.execute.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{BufferInfo, ImageInfo};
    use crate::types::{BufferUsage, ImageUsage, TextureFormat};
    use rstest::rstest;

    const DATA: ResourceHandle = ResourceHandle::buffer("data");

    fn run(pass: &mut RenderPass<'_>) -> Result<Option<PassDeclaration>, GraphicsError> {
        pass.run_setup(&FrameInfo::default())
    }

    #[rstest]
    #[case::transfer_dst(BufferUsage::TRANSFER_DST, Access::Write)]
    #[case::vertex(BufferUsage::VERTEX_BUFFER, Access::Read)]
    #[case::storage(BufferUsage::STORAGE_BUFFER, Access::ReadWrite)]
    #[case::empty(BufferUsage::empty(), Access::Read)]
    fn test_use_resource_infers_access(#[case] usage: BufferUsage, #[case] expected: Access) {
        let mut pass = RenderPass::new("p", PassType::Compute).with_setup(move |b| {
            b.use_resource(DATA, BufferInfo::new(16).with_usage(usage));
            true
        });
        let decl = run(&mut pass).unwrap().unwrap();
        assert_eq!(decl.resource(DATA).unwrap().access, expected);
    }

    #[test]
    fn test_repeated_declaration_merges() {
        let mut pass = RenderPass::new("p", PassType::Transfer).with_setup(|b| {
            b.read(DATA, BufferInfo::new(16).with_usage(BufferUsage::TRANSFER_SRC))
                .write(DATA, BufferInfo::new(64).with_usage(BufferUsage::TRANSFER_DST));
            true
        });
        let decl = run(&mut pass).unwrap().unwrap();
        assert_eq!(decl.resources.len(), 1);
        let data = decl.resource(DATA).unwrap();
        assert_eq!(data.access, Access::ReadWrite);
        assert_eq!(data.info.as_buffer().unwrap().size, 64);
    }

    #[test]
    fn test_conflicting_declaration_is_reported() {
        let target = ResourceHandle::image("target");
        let mut pass = RenderPass::new("p", PassType::Draw).with_setup(move |b| {
            b.read(target, ImageInfo::new().with_format(TextureFormat::Rgba8Unorm))
                .write(target, ImageInfo::new().with_format(TextureFormat::R32Float));
            true
        });
        assert!(matches!(
            run(&mut pass),
            Err(GraphicsError::IncompatibleResourceInfo { handle, .. }) if handle == target
        ));
    }

    #[test]
    fn test_withdrawn_pass() {
        let mut pass = RenderPass::new("p", PassType::Draw).with_setup(|_| false);
        assert!(run(&mut pass).unwrap().is_none());
    }

    #[test]
    fn test_attachments() {
        let depth = ResourceHandle::image("depth");
        let mut pass = RenderPass::new("p", PassType::Draw).with_setup(move |b| {
            let swapchain = b.swapchain_image();
            b.add_color_attachment(swapchain, ColorAttachment::load())
                .add_depth_stencil_attachment(depth, DepthStencilAttachment::new())
                .set_is_root(true);
            true
        });
        let decl = run(&mut pass).unwrap().unwrap();
        assert!(decl.is_root);
        assert_eq!(decl.color_attachments.len(), 1);
        assert_eq!(
            decl.resource(ResourceHandle::SWAPCHAIN_IMAGE).unwrap().access,
            Access::ReadWrite
        );
        assert_eq!(decl.resource(depth).unwrap().access, Access::Write);
        let depth_info = decl.resource(depth).unwrap().info;
        assert!(depth_info
            .as_image()
            .unwrap()
            .usage
            .contains(ImageUsage::DEPTH_STENCIL_ATTACHMENT));
    }

    #[rstest]
    #[case(Access::Read, Access::Read, Access::Read)]
    #[case(Access::Read, Access::Write, Access::ReadWrite)]
    #[case(Access::Write, Access::Write, Access::Write)]
    #[case(Access::ReadWrite, Access::Read, Access::ReadWrite)]
    fn test_access_union(#[case] a: Access, #[case] b: Access, #[case] expected: Access) {
        assert_eq!(a.union(b), expected);
        assert_eq!(b.union(a), expected);
    }
}
