//! Extents, viewports and scissor rectangles.

// ============================================================================
// Extent
// ============================================================================

/// Three dimensional size of an image or render area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Extent3d {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Extent3d {
    /// Create a new extent.
    pub const fn new(width: u32, height: u32, depth: u32) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }

    /// Create a 2D extent (depth = 1).
    pub const fn new_2d(width: u32, height: u32) -> Self {
        Self::new(width, height, 1)
    }

    /// Component-wise maximum.
    pub fn max(self, other: Self) -> Self {
        Self {
            width: self.width.max(other.width),
            height: self.height.max(other.height),
            depth: self.depth.max(other.depth),
        }
    }

    /// Whether any dimension is zero.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.depth == 0
    }
}

impl Default for Extent3d {
    fn default() -> Self {
        Self::new(0, 0, 1)
    }
}

// ============================================================================
// Viewport
// ============================================================================

/// Viewport with a `[0, 1]` depth range by default.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    /// Create a new viewport with the standard depth range.
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }

    /// Viewport covering `extent` from the origin.
    pub fn from_extent(extent: Extent3d) -> Self {
        Self::new(0.0, 0.0, extent.width as f32, extent.height as f32)
    }

    /// Set the depth range.
    pub fn with_depth_range(mut self, min_depth: f32, max_depth: f32) -> Self {
        self.min_depth = min_depth;
        self.max_depth = max_depth;
        self
    }
}

// ============================================================================
// Scissor Rectangle
// ============================================================================

/// Scissor rectangle in framebuffer pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ScissorRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl ScissorRect {
    /// Create a new scissor rectangle.
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Scissor covering `extent` from the origin.
    pub fn from_extent(extent: Extent3d) -> Self {
        Self::new(0, 0, extent.width, extent.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extent_max() {
        let a = Extent3d::new_2d(640, 480);
        let b = Extent3d::new(320, 720, 2);
        assert_eq!(a.max(b), Extent3d::new(640, 720, 2));
        assert_eq!(a.max(b), b.max(a));
    }

    #[test]
    fn test_extent_empty() {
        assert!(Extent3d::default().is_empty());
        assert!(!Extent3d::new_2d(1, 1).is_empty());
    }

    #[test]
    fn test_viewport_from_extent() {
        let viewport = Viewport::from_extent(Extent3d::new_2d(800, 600));
        assert_eq!(viewport.width, 800.0);
        assert_eq!(viewport.height, 600.0);
        assert_eq!(viewport.max_depth, 1.0);

        let scissor = ScissorRect::from_extent(Extent3d::new_2d(800, 600));
        assert_eq!(scissor, ScissorRect::new(0, 0, 800, 600));
    }
}
