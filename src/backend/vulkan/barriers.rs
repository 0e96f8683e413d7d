//! Barrier batching and image layout tracking.
//!
//! Barriers produced by the render graph and the layout transitions the
//! backend needs on its own (attachments, copies, presentation) are collected
//! into one batch and flushed as a single `vkCmdPipelineBarrier2` right before
//! the command that depends on them.

use std::collections::HashMap;

use ash::vk;

use super::conversion::{scope_access, scope_layout, scope_stages};
use crate::compiler::AccessScope;

/// One side of a dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPoint {
    pub stages: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}

impl SyncPoint {
    pub const NONE: Self = Self {
        stages: vk::PipelineStageFlags2::NONE,
        access: vk::AccessFlags2::NONE,
    };

    /// Conservative source for transitions the graph did not order.
    pub const ANY: Self = Self {
        stages: vk::PipelineStageFlags2::ALL_COMMANDS,
        access: vk::AccessFlags2::MEMORY_WRITE,
    };

    pub fn from_scope(scope: &AccessScope) -> Self {
        Self {
            stages: scope_stages(scope),
            access: scope_access(scope),
        }
    }
}

/// Last known layout of every image, across frames.
#[derive(Debug, Default)]
pub struct LayoutTracker {
    layouts: HashMap<vk::Image, vk::ImageLayout>,
}

impl LayoutTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layout(&self, image: vk::Image) -> vk::ImageLayout {
        self.layouts
            .get(&image)
            .copied()
            .unwrap_or(vk::ImageLayout::UNDEFINED)
    }

    pub fn set_layout(&mut self, image: vk::Image, layout: vk::ImageLayout) {
        self.layouts.insert(image, layout);
    }

    pub fn forget(&mut self, image: vk::Image) {
        self.layouts.remove(&image);
    }
}

/// Barriers waiting to be recorded.
#[derive(Debug, Default)]
pub struct BarrierBatch {
    image_barriers: Vec<vk::ImageMemoryBarrier2<'static>>,
    buffer_barriers: Vec<vk::BufferMemoryBarrier2<'static>>,
}

impl BarrierBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.image_barriers.is_empty() && self.buffer_barriers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.image_barriers.len() + self.buffer_barriers.len()
    }

    /// Order a graph-declared hazard on a whole buffer.
    pub fn add_buffer_barrier(&mut self, buffer: vk::Buffer, src: &AccessScope, dst: &AccessScope) {
        let src = SyncPoint::from_scope(src);
        let dst = SyncPoint::from_scope(dst);
        self.buffer_barriers.push(
            vk::BufferMemoryBarrier2::default()
                .src_stage_mask(src.stages)
                .src_access_mask(src.access)
                .dst_stage_mask(dst.stages)
                .dst_access_mask(dst.access)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .buffer(buffer)
                .offset(0)
                .size(vk::WHOLE_SIZE),
        );
    }

    /// Order a graph-declared hazard on an image, moving it to the layout the
    /// destination scope needs.
    pub fn add_image_barrier(
        &mut self,
        tracker: &mut LayoutTracker,
        image: vk::Image,
        aspect_mask: vk::ImageAspectFlags,
        src: &AccessScope,
        dst: &AccessScope,
    ) {
        let layout = scope_layout(dst);
        self.push_image(
            tracker,
            image,
            aspect_mask,
            SyncPoint::from_scope(src),
            SyncPoint::from_scope(dst),
            layout,
        );
    }

    /// Move `image` to `layout` if it is not there already.
    pub fn transition(
        &mut self,
        tracker: &mut LayoutTracker,
        image: vk::Image,
        aspect_mask: vk::ImageAspectFlags,
        layout: vk::ImageLayout,
        dst: SyncPoint,
    ) {
        if tracker.layout(image) == layout {
            return;
        }
        self.push_image(tracker, image, aspect_mask, SyncPoint::ANY, dst, layout);
    }

    fn push_image(
        &mut self,
        tracker: &mut LayoutTracker,
        image: vk::Image,
        aspect_mask: vk::ImageAspectFlags,
        src: SyncPoint,
        dst: SyncPoint,
        new_layout: vk::ImageLayout,
    ) {
        let old_layout = tracker.layout(image);
        self.image_barriers.push(
            vk::ImageMemoryBarrier2::default()
                .src_stage_mask(src.stages)
                .src_access_mask(src.access)
                .dst_stage_mask(dst.stages)
                .dst_access_mask(dst.access)
                .old_layout(old_layout)
                .new_layout(new_layout)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask,
                    base_mip_level: 0,
                    level_count: vk::REMAINING_MIP_LEVELS,
                    base_array_layer: 0,
                    layer_count: vk::REMAINING_ARRAY_LAYERS,
                }),
        );
        tracker.set_layout(image, new_layout);
    }

    /// Record every pending barrier and clear the batch.
    pub fn flush(&mut self, device: &ash::Device, cmd: vk::CommandBuffer) {
        if self.is_empty() {
            return;
        }
        let dependency = vk::DependencyInfo::default()
            .image_memory_barriers(&self.image_barriers)
            .buffer_memory_barriers(&self.buffer_barriers);
        unsafe { device.cmd_pipeline_barrier2(cmd, &dependency) };
        self.image_barriers.clear();
        self.buffer_barriers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::PassType;
    use crate::resource::ResourceUsage;
    use crate::types::ImageUsage;
    use ash::vk::Handle;

    fn scope(pass_type: PassType, usage: ImageUsage) -> AccessScope {
        AccessScope {
            pass_type,
            usage: ResourceUsage::Image(usage),
        }
    }

    #[test]
    fn test_transition_skips_matching_layout() {
        let mut tracker = LayoutTracker::new();
        let mut batch = BarrierBatch::new();
        let image = vk::Image::from_raw(7);

        batch.transition(
            &mut tracker,
            image,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            SyncPoint::NONE,
        );
        batch.transition(
            &mut tracker,
            image,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            SyncPoint::NONE,
        );
        assert_eq!(batch.len(), 1);
        assert_eq!(tracker.layout(image), vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    }

    #[test]
    fn test_graph_barrier_always_recorded() {
        let mut tracker = LayoutTracker::new();
        let mut batch = BarrierBatch::new();
        let image = vk::Image::from_raw(9);
        tracker.set_layout(image, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);

        batch.add_image_barrier(
            &mut tracker,
            image,
            vk::ImageAspectFlags::COLOR,
            &scope(PassType::Draw, ImageUsage::COLOR_ATTACHMENT),
            &scope(PassType::Draw, ImageUsage::SAMPLED),
        );
        assert_eq!(batch.len(), 1);
        assert_eq!(tracker.layout(image), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

        tracker.forget(image);
        assert_eq!(tracker.layout(image), vk::ImageLayout::UNDEFINED);
    }
}
