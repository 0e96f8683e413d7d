//! Arena of physical resources indexed by handle.

use std::collections::HashMap;

use super::{BufferInfo, FnvBuildHasher, ImageInfo, ResourceHandle, ResourceInfo};
use crate::backend::{DeviceBuffer, DeviceImage};

/// Device object currently backing a logical resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysicalResource {
    Buffer { buffer: DeviceBuffer, info: BufferInfo },
    Image { image: DeviceImage, info: ImageInfo },
}

impl PhysicalResource {
    /// Description the backing was created with.
    pub fn info(&self) -> ResourceInfo {
        match self {
            Self::Buffer { info, .. } => ResourceInfo::Buffer(*info),
            Self::Image { info, .. } => ResourceInfo::Image(*info),
        }
    }

    pub fn as_buffer(&self) -> Option<DeviceBuffer> {
        match self {
            Self::Buffer { buffer, .. } => Some(*buffer),
            Self::Image { .. } => None,
        }
    }

    pub fn as_image(&self) -> Option<DeviceImage> {
        match self {
            Self::Image { image, .. } => Some(*image),
            Self::Buffer { .. } => None,
        }
    }
}

/// Handle to physical resource indirection.
///
/// Passes only ever see [`ResourceHandle`]s; the orchestrator resolves them
/// through an arena when translating recorded commands.
#[derive(Debug, Default)]
pub struct ResourceArena {
    entries: HashMap<ResourceHandle, PhysicalResource, FnvBuildHasher>,
}

impl ResourceArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, handle: ResourceHandle) -> Option<&PhysicalResource> {
        self.entries.get(&handle)
    }

    /// Bind `resource` to `handle`, returning the previous binding.
    pub fn insert(
        &mut self,
        handle: ResourceHandle,
        resource: PhysicalResource,
    ) -> Option<PhysicalResource> {
        self.entries.insert(handle, resource)
    }

    pub fn remove(&mut self, handle: ResourceHandle) -> Option<PhysicalResource> {
        self.entries.remove(&handle)
    }

    pub fn contains(&self, handle: ResourceHandle) -> bool {
        self.entries.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ResourceHandle, &PhysicalResource)> {
        self.entries.iter()
    }

    /// Remove every binding and return the physical resources.
    pub fn drain(&mut self) -> Vec<PhysicalResource> {
        self.entries.drain().map(|(_, resource)| resource).collect()
    }
}
