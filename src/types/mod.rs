//! Plain value types shared by resources, pipelines and backends.

mod buffer;
mod common;
mod image;

pub use buffer::BufferUsage;
pub use common::{Extent3d, ScissorRect, Viewport};
pub use image::{ImageUsage, TextureFormat};
