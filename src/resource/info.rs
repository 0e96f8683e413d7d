//! Resource descriptions declared by passes and their merge rules.

use thiserror::Error;

use crate::types::{BufferUsage, Extent3d, ImageUsage, TextureFormat};

// ============================================================================
// Usage
// ============================================================================

/// Usage flags of either resource kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceUsage {
    Buffer(BufferUsage),
    Image(ImageUsage),
}

impl ResourceUsage {
    pub fn is_read(&self) -> bool {
        match self {
            Self::Buffer(usage) => usage.is_read(),
            Self::Image(usage) => usage.is_read(),
        }
    }

    pub fn is_write(&self) -> bool {
        match self {
            Self::Buffer(usage) => usage.is_write(),
            Self::Image(usage) => usage.is_write(),
        }
    }
}

// ============================================================================
// Buffer
// ============================================================================

/// How a buffer resource is to be backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferInfo {
    /// Size in bytes.
    pub size: u64,
    pub usage: BufferUsage,
    /// Transient buffers live for one frame and may alias other transients.
    pub transient: bool,
}

impl BufferInfo {
    /// Transient buffer of `size` bytes with no usage yet.
    pub fn new(size: u64) -> Self {
        Self {
            size,
            usage: BufferUsage::empty(),
            transient: true,
        }
    }

    pub fn with_usage(mut self, usage: BufferUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn add_usage(mut self, usage: BufferUsage) -> Self {
        self.usage |= usage;
        self
    }

    /// Keep the contents across frames.
    pub fn persistent(mut self) -> Self {
        self.transient = false;
        self
    }
}

// ============================================================================
// Image
// ============================================================================

/// How an image resource is to be backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageInfo {
    /// `None` until some pass declares a format.
    pub format: Option<TextureFormat>,
    /// A zero extent is filled in with the swapchain extent by the compiler.
    pub extent: Extent3d,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: u32,
    pub usage: ImageUsage,
    pub transient: bool,
}

impl Default for ImageInfo {
    fn default() -> Self {
        Self {
            format: None,
            extent: Extent3d::default(),
            mip_levels: 1,
            array_layers: 1,
            samples: 1,
            usage: ImageUsage::empty(),
            transient: true,
        }
    }
}

impl ImageInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_format(mut self, format: TextureFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_extent(mut self, extent: Extent3d) -> Self {
        self.extent = extent;
        self
    }

    pub fn with_extent_2d(self, width: u32, height: u32) -> Self {
        self.with_extent(Extent3d::new_2d(width, height))
    }

    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    pub fn with_array_layers(mut self, array_layers: u32) -> Self {
        self.array_layers = array_layers;
        self
    }

    pub fn with_samples(mut self, samples: u32) -> Self {
        self.samples = samples;
        self
    }

    pub fn with_usage(mut self, usage: ImageUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn add_usage(mut self, usage: ImageUsage) -> Self {
        self.usage |= usage;
        self
    }

    pub fn persistent(mut self) -> Self {
        self.transient = false;
        self
    }

    /// Whether two images share a memory layout and can alias each other.
    pub fn same_layout(&self, other: &Self) -> bool {
        self.format == other.format
            && self.extent == other.extent
            && self.mip_levels == other.mip_levels
            && self.array_layers == other.array_layers
            && self.samples == other.samples
    }
}

// ============================================================================
// Merge
// ============================================================================

/// Reason two resource infos cannot be merged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MergeConflict {
    #[error("declared both as a buffer and as an image")]
    KindMismatch,
    #[error("format {0:?} conflicts with {1:?}")]
    FormatMismatch(TextureFormat, TextureFormat),
}

/// Backing description for a resource handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceInfo {
    Buffer(BufferInfo),
    Image(ImageInfo),
}

impl From<BufferInfo> for ResourceInfo {
    fn from(info: BufferInfo) -> Self {
        Self::Buffer(info)
    }
}

impl From<ImageInfo> for ResourceInfo {
    fn from(info: ImageInfo) -> Self {
        Self::Image(info)
    }
}

impl ResourceInfo {
    pub fn usage(&self) -> ResourceUsage {
        match self {
            Self::Buffer(info) => ResourceUsage::Buffer(info.usage),
            Self::Image(info) => ResourceUsage::Image(info.usage),
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            Self::Buffer(info) => info.transient,
            Self::Image(info) => info.transient,
        }
    }

    pub fn as_buffer(&self) -> Option<&BufferInfo> {
        match self {
            Self::Buffer(info) => Some(info),
            Self::Image(_) => None,
        }
    }

    pub fn as_image(&self) -> Option<&ImageInfo> {
        match self {
            Self::Image(info) => Some(info),
            Self::Buffer(_) => None,
        }
    }

    /// Merge two declarations of the same resource.
    ///
    /// Usage flags are unioned, sizes and extents take the maximum and the
    /// resource stays transient only if both sides are transient. Formats must
    /// agree when both are set. The operation is commutative and associative.
    pub fn merge(&self, other: &Self) -> Result<Self, MergeConflict> {
        match (self, other) {
            (Self::Buffer(a), Self::Buffer(b)) => Ok(Self::Buffer(BufferInfo {
                size: a.size.max(b.size),
                usage: a.usage | b.usage,
                transient: a.transient && b.transient,
            })),
            (Self::Image(a), Self::Image(b)) => {
                let format = match (a.format, b.format) {
                    (Some(fa), Some(fb)) if fa != fb => {
                        return Err(MergeConflict::FormatMismatch(fa.min(fb), fa.max(fb)));
                    }
                    (Some(fa), _) => Some(fa),
                    (None, fb) => fb,
                };
                Ok(Self::Image(ImageInfo {
                    format,
                    extent: a.extent.max(b.extent),
                    mip_levels: a.mip_levels.max(b.mip_levels),
                    array_layers: a.array_layers.max(b.array_layers),
                    samples: a.samples.max(b.samples),
                    usage: a.usage | b.usage,
                    transient: a.transient && b.transient,
                }))
            }
            _ => Err(MergeConflict::KindMismatch),
        }
    }

    /// Whether physical memory created for `self` can back `required`.
    pub fn can_back(&self, required: &Self) -> bool {
        match (self, required) {
            (Self::Buffer(have), Self::Buffer(want)) => {
                have.size >= want.size && have.usage.contains(want.usage)
            }
            (Self::Image(have), Self::Image(want)) => {
                have.same_layout(want) && have.usage.contains(want.usage)
            }
            _ => false,
        }
    }
}
