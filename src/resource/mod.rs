//! Resource identity.
//!
//! A [`ResourceHandle`] names a logical buffer or image independently of any
//! physical backing memory. Handles are content-derived: hashing the same name
//! and [`ResourceType`] always yields the same handle, so passes authored in
//! different places can refer to the same resource without sharing pointers.
//!
//! ```
//! use frameforge::resource::{ResourceHandle, ResourceType, handle_for};
//!
//! const VERTICES: ResourceHandle = ResourceHandle::buffer("triangle_vertices");
//! assert_eq!(VERTICES, handle_for("triangle_vertices", ResourceType::Buffer));
//! assert_ne!(VERTICES, ResourceHandle::image("triangle_vertices"));
//! ```

mod arena;
mod info;

use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasherDefault, Hasher};

use parking_lot::RwLock;

pub use arena::{PhysicalResource, ResourceArena};
pub use info::{BufferInfo, ImageInfo, ResourceInfo, ResourceUsage};

// ============================================================================
// FNV-1a
// ============================================================================

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a hash of `bytes`.
pub const fn fnv1a_64(bytes: &[u8]) -> u64 {
    fnv1a_extend(FNV_OFFSET_BASIS, bytes)
}

/// Continue an FNV-1a hash with more bytes.
pub const fn fnv1a_extend(mut hash: u64, bytes: &[u8]) -> u64 {
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
        i += 1;
    }
    hash
}

/// Streaming FNV-1a [`Hasher`].
///
/// Unlike the std `DefaultHasher` the output is stable across processes, which
/// the persisted pipeline cache relies on.
#[derive(Debug, Clone, Copy)]
pub struct FnvHasher(u64);

impl Default for FnvHasher {
    fn default() -> Self {
        Self(FNV_OFFSET_BASIS)
    }
}

impl Hasher for FnvHasher {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        self.0 = fnv1a_extend(self.0, bytes);
    }
}

/// `BuildHasher` for [`FnvHasher`].
pub type FnvBuildHasher = BuildHasherDefault<FnvHasher>;

/// Hash any `Hash` value with [`FnvHasher`].
pub fn fnv_hash<T: std::hash::Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = FnvHasher::default();
    value.hash(&mut hasher);
    hasher.finish()
}

// ============================================================================
// Handles
// ============================================================================

/// Kind of logical resource a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceType {
    Buffer,
    Image,
    /// A sampled view of an image.
    Texture,
}

impl ResourceType {
    const fn tag(self) -> u8 {
        match self {
            Self::Buffer => b'B',
            Self::Image => b'I',
            Self::Texture => b'T',
        }
    }

    /// Whether resources of this type are backed by image memory.
    pub fn is_image(self) -> bool {
        matches!(self, Self::Image | Self::Texture)
    }
}

/// Opaque, content-derived identifier for a logical resource.
///
/// Equality and hashing use the derived hash, which already folds in the type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceHandle {
    id: u64,
    kind: ResourceType,
}

impl ResourceHandle {
    /// The presentable swapchain image of the current frame.
    pub const SWAPCHAIN_IMAGE: Self = Self::image("frameforge/swapchain_image");

    /// Handle for `name` with the given type.
    pub const fn new(name: &str, kind: ResourceType) -> Self {
        let hash = fnv1a_64(name.as_bytes());
        Self {
            id: fnv1a_extend(hash, &[kind.tag()]),
            kind,
        }
    }

    /// Handle for the `index`-th member of a family of resources named `name`.
    pub const fn indexed(name: &str, index: u64, kind: ResourceType) -> Self {
        let hash = fnv1a_64(name.as_bytes());
        let hash = fnv1a_extend(hash, &index.to_le_bytes());
        Self {
            id: fnv1a_extend(hash, &[kind.tag()]),
            kind,
        }
    }

    /// Buffer handle for `name`.
    pub const fn buffer(name: &str) -> Self {
        Self::new(name, ResourceType::Buffer)
    }

    /// Image handle for `name`.
    pub const fn image(name: &str) -> Self {
        Self::new(name, ResourceType::Image)
    }

    /// Texture handle for `name`.
    pub const fn texture(name: &str) -> Self {
        Self::new(name, ResourceType::Texture)
    }

    /// Rebuild a handle from its raw parts.
    pub const fn from_raw(id: u64, kind: ResourceType) -> Self {
        Self { id, kind }
    }

    /// Raw hash value.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Resource type.
    pub fn kind(&self) -> ResourceType {
        self.kind
    }

    pub fn is_buffer(&self) -> bool {
        self.kind == ResourceType::Buffer
    }

    pub fn is_image(&self) -> bool {
        self.kind.is_image()
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ResourceType::Buffer => "buffer",
            ResourceType::Image => "image",
            ResourceType::Texture => "texture",
        };
        write!(f, "{kind}:{:016x}", self.id)
    }
}

/// Compute the handle for `name` and `kind`.
///
/// Pure function of its inputs; no registry lookup is involved.
pub const fn handle_for(name: &str, kind: ResourceType) -> ResourceHandle {
    ResourceHandle::new(name, kind)
}

/// Name of a shader argument (uniform block) as bound by the command encoder.
pub const fn argument_name(name: &str) -> u64 {
    fnv1a_64(name.as_bytes())
}

// ============================================================================
// Debug names
// ============================================================================

/// Shared table mapping handles back to their human-readable names.
///
/// Only used for diagnostics. Lookups take a read lock; registering a new
/// name takes the write lock.
#[derive(Debug, Default)]
pub struct HandleNames {
    names: RwLock<HashMap<ResourceHandle, String, FnvBuildHasher>>,
}

impl HandleNames {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute the handle for `name` and remember the name.
    pub fn handle_for(&self, name: &str, kind: ResourceType) -> ResourceHandle {
        let handle = handle_for(name, kind);
        if !self.names.read().contains_key(&handle) {
            self.names.write().insert(handle, name.to_string());
        }
        handle
    }

    /// Name registered for `handle`, if any.
    pub fn name(&self, handle: ResourceHandle) -> Option<String> {
        self.names.read().get(&handle).cloned()
    }

    /// Registered name, or the handle's hex form.
    pub fn describe(&self, handle: ResourceHandle) -> String {
        self.name(handle).unwrap_or_else(|| handle.to_string())
    }

    pub fn len(&self) -> usize {
        self.names.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_fnv_reference_values() {
        assert_eq!(fnv1a_64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a_64(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a_64(b"foobar"), 0x8594_4171_f739_67e8);
    }

    #[test]
    fn test_hasher_matches_const_fn() {
        let mut hasher = FnvHasher::default();
        hasher.write(b"foo");
        hasher.write(b"bar");
        assert_eq!(hasher.finish(), fnv1a_64(b"foobar"));
    }

    #[test]
    fn test_same_name_same_handle() {
        let a = handle_for("gbuffer_albedo", ResourceType::Image);
        let b = ResourceHandle::image("gbuffer_albedo");
        assert_eq!(a, b);
        assert_eq!(a.id(), b.id());
    }

    #[rstest]
    #[case(ResourceType::Buffer, ResourceType::Image)]
    #[case(ResourceType::Image, ResourceType::Texture)]
    #[case(ResourceType::Buffer, ResourceType::Texture)]
    fn test_type_is_part_of_identity(#[case] a: ResourceType, #[case] b: ResourceType) {
        assert_ne!(handle_for("shared", a), handle_for("shared", b));
    }

    #[test]
    fn test_const_handles() {
        const DEPTH: ResourceHandle = ResourceHandle::image("depth");
        assert!(DEPTH.is_image());
        assert!(!DEPTH.is_buffer());
        assert_eq!(DEPTH.kind(), ResourceType::Image);
        assert!(ResourceHandle::SWAPCHAIN_IMAGE.is_image());
    }

    #[test]
    fn test_indexed_handles_are_distinct() {
        let a = ResourceHandle::indexed("staging", 0, ResourceType::Buffer);
        let b = ResourceHandle::indexed("staging", 1, ResourceType::Buffer);
        assert_ne!(a, b);
        assert_ne!(a, ResourceHandle::buffer("staging"));
        assert_eq!(a, ResourceHandle::indexed("staging", 0, ResourceType::Buffer));
    }

    #[test]
    fn test_display() {
        let handle = ResourceHandle::from_raw(0xff, ResourceType::Buffer);
        assert_eq!(handle.to_string(), "buffer:00000000000000ff");
    }

    #[test]
    fn test_handle_names() {
        let names = HandleNames::new();
        assert!(names.is_empty());

        let handle = names.handle_for("shadow_map", ResourceType::Image);
        assert_eq!(handle, ResourceHandle::image("shadow_map"));
        assert_eq!(names.name(handle).as_deref(), Some("shadow_map"));
        assert_eq!(names.describe(handle), "shadow_map");

        let unknown = ResourceHandle::buffer("unknown");
        assert_eq!(names.describe(unknown), unknown.to_string());

        names.handle_for("shadow_map", ResourceType::Image);
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn test_handle_names_concurrent_lookup() {
        let names = std::sync::Arc::new(HandleNames::new());
        let threads: Vec<_> = (0..4)
            .map(|i| {
                let names = names.clone();
                std::thread::spawn(move || {
                    for j in 0..64 {
                        names.handle_for(&format!("res_{}", (i * 64 + j) % 96), ResourceType::Buffer);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(names.len(), 96);
    }
}
