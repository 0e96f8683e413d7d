//! Frame slots and their state machine.

use std::collections::HashMap;

use crate::allocator::{LinearAllocator, StagingAllocator};
use crate::backend::{DeviceBuffer, FrameContextId, GpuBackend, SwapchainImage};
use crate::config::BackendSettings;
use crate::error::{GraphicsError, GraphicsResult};
use crate::resource::{FnvBuildHasher, PhysicalResource, ResourceArena, ResourceHandle, ResourceType};

/// Frames a pooled transient may sit unused before it is destroyed.
const POOL_IDLE_FRAMES: u64 = 120;

/// Lifecycle of a frame slot.
///
/// `Idle -> Recording -> Submitted -> Complete -> Idle`. A recording slot may
/// also be abandoned straight back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FrameState {
    #[default]
    Idle,
    Recording,
    Submitted,
    Complete,
}

impl FrameState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Recording => "recording",
            Self::Submitted => "submitted",
            Self::Complete => "complete",
        }
    }
}

impl std::fmt::Display for FrameState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transient backing owned by one slot, reused by later frames of that slot.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PooledResource {
    pub(crate) resource: PhysicalResource,
    pub(crate) in_use: bool,
    pub(crate) last_used: u64,
}

/// Device buffer shadowing a host-side allocator.
#[derive(Debug, Clone, Copy)]
pub(crate) struct UploadBuffer {
    pub(crate) buffer: DeviceBuffer,
    pub(crate) capacity: u64,
}

/// One entry of the frames-in-flight ring.
///
/// Everything in a slot is owned exclusively by the frames recorded into it,
/// so nothing here is touched while the slot's last submission may still be
/// executing.
#[derive(Debug)]
pub struct FrameSlot {
    pub(crate) index: usize,
    pub(crate) state: FrameState,
    pub(crate) context: FrameContextId,
    /// Frame number of the frame last recorded into this slot.
    pub(crate) frame_number: u64,
    pub(crate) linear: Vec<LinearAllocator>,
    pub(crate) staging: StagingAllocator,
    pub(crate) upload_buffers: HashMap<ResourceHandle, UploadBuffer, FnvBuildHasher>,
    pub(crate) pool: Vec<PooledResource>,
    /// Handle to physical resource bindings of the frame being recorded.
    pub(crate) bindings: ResourceArena,
    pub(crate) swapchain_image: Option<SwapchainImage>,
    pub(crate) resources_acquired: bool,
}

impl FrameSlot {
    pub(crate) fn new(
        index: usize,
        context: FrameContextId,
        settings: &BackendSettings,
    ) -> GraphicsResult<Self> {
        let linear_name = format!("frameforge/slot{index}/linear");
        let linear = (0..settings.concurrency_count)
            .map(|i| {
                LinearAllocator::new(
                    ResourceHandle::indexed(&linear_name, i as u64, ResourceType::Buffer),
                    settings.transient_capacity,
                    settings.transient_alignment,
                )
            })
            .collect::<GraphicsResult<Vec<_>>>()?;
        let staging = StagingAllocator::new(
            format!("frameforge/slot{index}/staging"),
            settings.staging_chunk_size,
            settings.staging_budget,
        )?;

        Ok(Self {
            index,
            state: FrameState::Idle,
            context,
            frame_number: 0,
            linear,
            staging,
            upload_buffers: HashMap::default(),
            pool: Vec::new(),
            bindings: ResourceArena::new(),
            swapchain_image: None,
            resources_acquired: false,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn linear_allocators(&self) -> &[LinearAllocator] {
        &self.linear
    }

    pub fn staging_allocator(&self) -> &StagingAllocator {
        &self.staging
    }

    /// Number of transient backings pooled by this slot.
    pub fn pooled_resources(&self) -> usize {
        self.pool.len()
    }

    pub(crate) fn transition(&mut self, to: FrameState) {
        log::trace!("Frame slot {}: {} -> {}", self.index, self.state, to);
        self.state = to;
    }

    pub(crate) fn expect(&self, expected: FrameState) -> GraphicsResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(GraphicsError::InvalidFrameState {
                slot: self.index,
                expected: expected.as_str(),
                actual: self.state.as_str(),
            })
        }
    }

    /// Forget everything recorded for the current frame.
    ///
    /// Only valid once the slot's device work has finished or was never
    /// submitted.
    pub(crate) fn reset_frame_data(&mut self) {
        for allocator in &mut self.linear {
            allocator.reset();
        }
        self.staging.reset();
        self.bindings.drain();
        for pooled in &mut self.pool {
            pooled.in_use = false;
        }
        self.swapchain_image = None;
        self.resources_acquired = false;
    }

    /// Take an unused pooled backing able to hold `required`.
    pub(crate) fn take_pooled(
        &mut self,
        required: &crate::resource::ResourceInfo,
    ) -> Option<PhysicalResource> {
        let frame_number = self.frame_number;
        let pooled = self
            .pool
            .iter_mut()
            .find(|p| !p.in_use && p.resource.info().can_back(required))?;
        pooled.in_use = true;
        pooled.last_used = frame_number;
        Some(pooled.resource)
    }

    pub(crate) fn add_pooled(&mut self, resource: PhysicalResource) {
        self.pool.push(PooledResource {
            resource,
            in_use: true,
            last_used: self.frame_number,
        });
    }

    /// Destroy pooled backings no frame of this slot used for a while.
    pub(crate) fn trim_pool<B: GpuBackend + ?Sized>(&mut self, backend: &B) {
        let frame_number = self.frame_number;
        let index = self.index;
        self.pool.retain(|pooled| {
            let idle = !pooled.in_use && pooled.last_used + POOL_IDLE_FRAMES < frame_number;
            if idle {
                log::debug!("Frame slot {index}: releasing idle pooled resource");
                destroy_physical(backend, pooled.resource);
            }
            !idle
        });
    }

    /// Destroy every device object owned by the slot.
    pub(crate) fn destroy<B: GpuBackend + ?Sized>(&mut self, backend: &B) {
        for pooled in self.pool.drain(..) {
            destroy_physical(backend, pooled.resource);
        }
        for (_, upload) in self.upload_buffers.drain() {
            backend.destroy_buffer(upload.buffer);
        }
        self.bindings.drain();
        backend.destroy_frame_context(self.context);
    }
}

pub(crate) fn destroy_physical<B: GpuBackend + ?Sized>(backend: &B, resource: PhysicalResource) {
    match resource {
        PhysicalResource::Buffer { buffer, .. } => backend.destroy_buffer(buffer),
        PhysicalResource::Image { image, .. } => backend.destroy_image(image),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyBackend;
    use crate::resource::{BufferInfo, ResourceInfo};
    use crate::types::BufferUsage;

    fn slot(backend: &DummyBackend) -> FrameSlot {
        let settings = BackendSettings::default()
            .with_concurrency_count(2)
            .with_transient_capacity(1024)
            .with_staging(256, 1024);
        let context = backend.create_frame_context("slot0").unwrap();
        FrameSlot::new(0, context, &settings).unwrap()
    }

    #[test]
    fn test_new_slot_is_idle() {
        let backend = DummyBackend::headless();
        let slot = slot(&backend);
        assert_eq!(slot.state(), FrameState::Idle);
        assert_eq!(slot.linear_allocators().len(), 2);
        assert_ne!(
            slot.linear_allocators()[0].handle(),
            slot.linear_allocators()[1].handle()
        );
        assert!(slot.expect(FrameState::Idle).is_ok());
        assert!(matches!(
            slot.expect(FrameState::Recording),
            Err(GraphicsError::InvalidFrameState { expected: "recording", actual: "idle", .. })
        ));
    }

    #[test]
    fn test_reset_frame_data() {
        let backend = DummyBackend::headless();
        let mut slot = slot(&backend);
        slot.linear[0].write(&[1; 100]).unwrap();
        slot.staging.upload(&[2; 10]).unwrap();
        slot.reset_frame_data();
        assert_eq!(slot.linear[0].used(), 0);
        assert_eq!(slot.staging.used(), 0);
        assert_eq!(slot.staging.chunks().len(), 1);
    }

    #[test]
    fn test_pool_reuse_and_trim() {
        let backend = DummyBackend::headless();
        let mut slot = slot(&backend);
        let info = BufferInfo::new(64).with_usage(BufferUsage::STORAGE_BUFFER);
        let buffer = backend.create_buffer(&info, "pooled").unwrap();
        slot.add_pooled(PhysicalResource::Buffer { buffer, info });

        let smaller = ResourceInfo::Buffer(BufferInfo::new(32).with_usage(BufferUsage::STORAGE_BUFFER));
        assert!(slot.take_pooled(&smaller).is_none(), "still in use this frame");

        slot.reset_frame_data();
        assert_eq!(slot.take_pooled(&smaller).and_then(|r| r.as_buffer()), Some(buffer));

        let larger = ResourceInfo::Buffer(BufferInfo::new(128));
        slot.reset_frame_data();
        assert!(slot.take_pooled(&larger).is_none());

        slot.frame_number += POOL_IDLE_FRAMES + 1;
        slot.trim_pool(&backend);
        assert_eq!(slot.pooled_resources(), 0);
        assert_eq!(backend.live_buffers(), 0);
    }
}
