//! Image formats and usage flags.

use bitflags::bitflags;

/// Image format enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[non_exhaustive]
pub enum TextureFormat {
    // 8-bit formats
    /// 8-bit red channel, unsigned normalized.
    R8Unorm,

    // 16-bit formats
    /// 16-bit red channel, float.
    R16Float,
    /// 8-bit RG channels, unsigned normalized.
    Rg8Unorm,

    // 32-bit formats
    /// 32-bit red channel, float.
    R32Float,
    /// 32-bit red channel, unsigned integer.
    R32Uint,
    /// 8-bit RGBA channels, unsigned normalized.
    #[default]
    Rgba8Unorm,
    /// 8-bit RGBA channels, sRGB.
    Rgba8UnormSrgb,
    /// 8-bit BGRA channels, unsigned normalized.
    Bgra8Unorm,
    /// 8-bit BGRA channels, sRGB.
    Bgra8UnormSrgb,

    // 64-bit formats
    /// 16-bit RGBA channels, float.
    Rgba16Float,

    // 128-bit formats
    /// 32-bit RGBA channels, float.
    Rgba32Float,

    // Depth/stencil formats
    /// 16-bit depth.
    Depth16Unorm,
    /// 24-bit depth with 8-bit stencil.
    Depth24PlusStencil8,
    /// 32-bit depth, float.
    Depth32Float,
    /// 32-bit depth float with 8-bit stencil.
    Depth32FloatStencil8,
}

impl TextureFormat {
    /// Returns true if this is a depth or stencil format.
    pub fn is_depth_stencil(&self) -> bool {
        matches!(
            self,
            Self::Depth16Unorm
                | Self::Depth24PlusStencil8
                | Self::Depth32Float
                | Self::Depth32FloatStencil8
        )
    }

    /// Returns true if this format has a stencil component.
    pub fn has_stencil(&self) -> bool {
        matches!(self, Self::Depth24PlusStencil8 | Self::Depth32FloatStencil8)
    }

    /// Returns the size in bytes per pixel.
    pub fn block_size(&self) -> u32 {
        match self {
            Self::R8Unorm => 1,
            Self::R16Float | Self::Rg8Unorm | Self::Depth16Unorm => 2,
            Self::R32Float
            | Self::R32Uint
            | Self::Rgba8Unorm
            | Self::Rgba8UnormSrgb
            | Self::Bgra8Unorm
            | Self::Bgra8UnormSrgb
            | Self::Depth24PlusStencil8
            | Self::Depth32Float => 4,
            Self::Rgba16Float | Self::Depth32FloatStencil8 => 8,
            Self::Rgba32Float => 16,
        }
    }
}

bitflags! {
    /// Usage flags for images and textures.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct ImageUsage: u32 {
        /// Image can be the source of a transfer.
        const TRANSFER_SRC = 1 << 0;
        /// Image can be the destination of a transfer.
        const TRANSFER_DST = 1 << 1;
        /// Image can be sampled in a shader.
        const SAMPLED = 1 << 2;
        /// Image can be bound as a storage image (read and write).
        const STORAGE = 1 << 3;
        /// Image can be a color attachment.
        const COLOR_ATTACHMENT = 1 << 4;
        /// Image can be a depth/stencil attachment.
        const DEPTH_STENCIL_ATTACHMENT = 1 << 5;
    }
}

impl ImageUsage {
    /// Flags that imply the pass reads the image contents.
    pub const READS: Self = Self::TRANSFER_SRC
        .union(Self::SAMPLED)
        .union(Self::STORAGE)
        .union(Self::DEPTH_STENCIL_ATTACHMENT);

    /// Flags that imply the pass writes the image contents.
    pub const WRITES: Self = Self::TRANSFER_DST
        .union(Self::STORAGE)
        .union(Self::COLOR_ATTACHMENT)
        .union(Self::DEPTH_STENCIL_ATTACHMENT);

    /// Whether these flags imply a read access.
    pub fn is_read(self) -> bool {
        self.intersects(Self::READS)
    }

    /// Whether these flags imply a write access.
    pub fn is_write(self) -> bool {
        self.intersects(Self::WRITES)
    }
}

impl Default for ImageUsage {
    fn default() -> Self {
        Self::empty()
    }
}
