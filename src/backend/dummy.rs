//! Dummy GPU backend for testing and development.
//!
//! Buffers live in host memory, images are bookkeeping only, and fences
//! signal after a configurable latency or when the test signals them by hand.
//! Buffer copies in submitted command streams are carried out, so data flow
//! through staging and transient memory can be checked without a GPU.
//!
//! Faults can be injected to exercise error paths: running out of memory,
//! losing the device, and the swapchain going out of date at acquisition or
//! presentation.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{
    ComputePipelineDesc, DeviceBuffer, DeviceCommand, DeviceImage, DevicePipeline,
    FrameContextId, GpuBackend, GraphicsPipelineDesc, PresentStatus, SwapchainImage,
    SwapchainInfo,
};
use crate::config::BackendSettings;
use crate::error::{GraphicsError, GraphicsResult};
use crate::resource::{BufferInfo, ImageInfo};
use crate::types::{Extent3d, TextureFormat};

/// A submission as seen by the dummy device.
#[derive(Debug, Clone)]
pub struct SubmissionRecord {
    pub context: FrameContextId,
    pub commands: Vec<DeviceCommand>,
    pub present: Option<SwapchainImage>,
    pub submitted_at: Instant,
}

#[derive(Debug)]
struct ContextState {
    label: String,
    submitted_at: Option<Instant>,
    signaled: bool,
}

impl ContextState {
    fn is_complete(&self, latency: Duration, manual: bool) -> bool {
        match self.submitted_at {
            None => true,
            Some(_) if manual => self.signaled,
            Some(at) => self.signaled || at.elapsed() >= latency,
        }
    }
}

#[derive(Debug)]
struct DummySwapchain {
    info: SwapchainInfo,
    images: Vec<DeviceImage>,
    next: u32,
}

#[derive(Debug, Default)]
struct Faults {
    out_of_memory: u32,
    pipeline_failures: u32,
    device_lost: bool,
    out_of_date_on_acquire: u32,
    out_of_date_on_present: u32,
}

#[derive(Debug, Default)]
struct DummyState {
    next_id: u64,
    buffers: HashMap<u64, Vec<u8>>,
    images: HashMap<u64, ImageInfo>,
    pipelines: HashMap<u64, String>,
    contexts: HashMap<u64, ContextState>,
    swapchain: Option<DummySwapchain>,
    fence_latency: Duration,
    manual_fences: bool,
    faults: Faults,
    submissions: Vec<SubmissionRecord>,
    violations: u64,
    pipelines_created: u64,
    pipelines_from_cache: u64,
}

impl DummyState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_device(&self) -> GraphicsResult<()> {
        if self.faults.device_lost {
            Err(GraphicsError::DeviceLost)
        } else {
            Ok(())
        }
    }

    fn check_memory(&mut self) -> GraphicsResult<()> {
        self.check_device()?;
        if self.faults.out_of_memory > 0 {
            self.faults.out_of_memory -= 1;
            return Err(GraphicsError::OutOfMemory);
        }
        Ok(())
    }

    fn context(&self, context: FrameContextId) -> GraphicsResult<&ContextState> {
        self.contexts.get(&context.0).ok_or_else(|| {
            GraphicsError::InvalidParameter(format!("unknown frame context {}", context.0))
        })
    }

    fn context_complete(&self, context: FrameContextId) -> GraphicsResult<bool> {
        let latency = self.fence_latency;
        let manual = self.manual_fences;
        Ok(self.context(context)?.is_complete(latency, manual))
    }

    fn create_swapchain_images(&mut self, info: SwapchainInfo) -> Vec<DeviceImage> {
        let image_info = ImageInfo::new()
            .with_format(info.format)
            .with_extent(info.extent)
            .persistent();
        (0..info.image_count)
            .map(|_| {
                let id = self.allocate_id();
                self.images.insert(id, image_info);
                DeviceImage(id)
            })
            .collect()
    }

    fn buffer_mut(&mut self, buffer: DeviceBuffer) -> GraphicsResult<&mut Vec<u8>> {
        self.buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| GraphicsError::InvalidParameter(format!("unknown buffer {}", buffer.0)))
    }

    fn copy_buffer(
        &mut self,
        src: DeviceBuffer,
        src_offset: u64,
        dst: DeviceBuffer,
        dst_offset: u64,
        size: u64,
    ) -> GraphicsResult<()> {
        let data = {
            let src_data = self.buffer_mut(src)?;
            let range = byte_range(src_offset, size, src_data.len())?;
            src_data[range].to_vec()
        };
        let dst_data = self.buffer_mut(dst)?;
        let range = byte_range(dst_offset, size, dst_data.len())?;
        dst_data[range].copy_from_slice(&data);
        Ok(())
    }
}

fn byte_range(offset: u64, size: u64, len: usize) -> GraphicsResult<std::ops::Range<usize>> {
    let end = offset
        .checked_add(size)
        .filter(|end| *end <= len as u64)
        .ok_or_else(|| {
            GraphicsError::InvalidParameter(format!(
                "range {offset}..{offset}+{size} exceeds buffer of {len} bytes"
            ))
        })?;
    Ok(offset as usize..end as usize)
}

/// Dummy GPU backend.
#[derive(Debug)]
pub struct DummyBackend {
    state: Mutex<DummyState>,
    fence_signaled: Condvar,
}

impl Default for DummyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyBackend {
    /// Backend with a 1280x720 three-image swapchain and instantly signaling fences.
    pub fn new() -> Self {
        Self::headless().with_swapchain(Extent3d::new_2d(1280, 720), TextureFormat::Bgra8UnormSrgb, 3)
    }

    /// Backend without a swapchain.
    pub fn headless() -> Self {
        Self {
            state: Mutex::new(DummyState::default()),
            fence_signaled: Condvar::new(),
        }
    }

    /// Backend whose swapchain follows `settings`.
    pub fn from_settings(settings: &BackendSettings) -> Self {
        Self::headless().with_swapchain(
            settings.swapchain.extent,
            TextureFormat::Bgra8UnormSrgb,
            settings.swapchain.image_count_hint.max(2),
        )
    }

    pub fn with_swapchain(mut self, extent: Extent3d, format: TextureFormat, image_count: u32) -> Self {
        let state = self.state.get_mut();
        let info = SwapchainInfo {
            extent,
            format,
            image_count,
        };
        let images = state.create_swapchain_images(info);
        state.swapchain = Some(DummySwapchain {
            info,
            images,
            next: 0,
        });
        self
    }

    /// Fences signal `latency` after submission.
    pub fn with_fence_latency(mut self, latency: Duration) -> Self {
        self.state.get_mut().fence_latency = latency;
        self
    }

    /// Fences only signal through [`signal_frame`](Self::signal_frame) or
    /// [`signal_all_frames`](Self::signal_all_frames).
    pub fn with_manual_fences(mut self) -> Self {
        self.state.get_mut().manual_fences = true;
        self
    }

    // ------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------

    /// Fail the next `count` buffer or image creations with out-of-memory.
    pub fn fail_allocations(&self, count: u32) {
        self.state.lock().faults.out_of_memory = count;
    }

    /// Fail the next `count` pipeline creations.
    pub fn fail_pipeline_creations(&self, count: u32) {
        self.state.lock().faults.pipeline_failures = count;
    }

    /// Every later device call fails with [`GraphicsError::DeviceLost`].
    pub fn lose_device(&self) {
        self.state.lock().faults.device_lost = true;
        self.fence_signaled.notify_all();
    }

    /// The next `count` acquisitions report an out-of-date swapchain.
    pub fn invalidate_swapchain_on_acquire(&self, count: u32) {
        self.state.lock().faults.out_of_date_on_acquire = count;
    }

    /// The next `count` presentations report an out-of-date swapchain.
    pub fn invalidate_swapchain_on_present(&self, count: u32) {
        self.state.lock().faults.out_of_date_on_present = count;
    }

    // ------------------------------------------------------------------
    // Fence control
    // ------------------------------------------------------------------

    pub fn signal_frame(&self, context: FrameContextId) {
        if let Some(ctx) = self.state.lock().contexts.get_mut(&context.0) {
            ctx.signaled = true;
        }
        self.fence_signaled.notify_all();
    }

    pub fn signal_all_frames(&self) {
        for ctx in self.state.lock().contexts.values_mut() {
            ctx.signaled = true;
        }
        self.fence_signaled.notify_all();
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.state.lock().submissions.clone()
    }

    pub fn submission_count(&self) -> usize {
        self.state.lock().submissions.len()
    }

    /// Number of times a context was reset or resubmitted while in flight.
    pub fn violations(&self) -> u64 {
        self.state.lock().violations
    }

    /// Contexts whose last submission has not completed.
    pub fn frames_in_flight(&self) -> usize {
        let state = self.state.lock();
        state
            .contexts
            .values()
            .filter(|ctx| !ctx.is_complete(state.fence_latency, state.manual_fences))
            .count()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Live images, swapchain images included.
    pub fn live_images(&self) -> usize {
        self.state.lock().images.len()
    }

    pub fn live_pipelines(&self) -> usize {
        self.state.lock().pipelines.len()
    }

    pub fn live_frame_contexts(&self) -> usize {
        self.state.lock().contexts.len()
    }

    pub fn pipelines_created(&self) -> u64 {
        self.state.lock().pipelines_created
    }

    /// Pipelines that were created with cache data from a previous run.
    pub fn pipelines_created_from_cache(&self) -> u64 {
        self.state.lock().pipelines_from_cache
    }

    pub fn buffer_contents(&self, buffer: DeviceBuffer) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&buffer.0).cloned()
    }

    pub fn image_info(&self, image: DeviceImage) -> Option<ImageInfo> {
        self.state.lock().images.get(&image.0).copied()
    }

    fn create_pipeline(&self, label: &str, cache_data: Option<&[u8]>) -> GraphicsResult<DevicePipeline> {
        let mut state = self.state.lock();
        state.check_device()?;
        if state.faults.pipeline_failures > 0 {
            state.faults.pipeline_failures -= 1;
            return Err(GraphicsError::PipelineCreation(format!(
                "injected failure creating '{label}'"
            )));
        }
        let id = state.allocate_id();
        state.pipelines.insert(id, label.to_string());
        state.pipelines_created += 1;
        if cache_data.is_some() {
            state.pipelines_from_cache += 1;
        }
        log::trace!("DummyBackend: creating pipeline {label} ({id})");
        Ok(DevicePipeline(id))
    }
}

impl GpuBackend for DummyBackend {
    fn name(&self) -> &'static str {
        "Dummy Backend"
    }

    fn create_buffer(&self, info: &BufferInfo, label: &str) -> GraphicsResult<DeviceBuffer> {
        let mut state = self.state.lock();
        state.check_memory()?;
        let id = state.allocate_id();
        state.buffers.insert(id, vec![0; info.size as usize]);
        log::trace!("DummyBackend: creating buffer {label} (size: {})", info.size);
        Ok(DeviceBuffer(id))
    }

    fn destroy_buffer(&self, buffer: DeviceBuffer) {
        self.state.lock().buffers.remove(&buffer.0);
    }

    fn write_buffer(&self, buffer: DeviceBuffer, offset: u64, data: &[u8]) -> GraphicsResult<()> {
        let mut state = self.state.lock();
        state.check_device()?;
        let target = state.buffer_mut(buffer)?;
        let range = byte_range(offset, data.len() as u64, target.len())?;
        target[range].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: DeviceBuffer, offset: u64, size: u64) -> GraphicsResult<Vec<u8>> {
        let mut state = self.state.lock();
        state.check_device()?;
        let source = state.buffer_mut(buffer)?;
        let range = byte_range(offset, size, source.len())?;
        Ok(source[range].to_vec())
    }

    fn create_image(&self, info: &ImageInfo, label: &str) -> GraphicsResult<DeviceImage> {
        let mut state = self.state.lock();
        state.check_memory()?;
        let id = state.allocate_id();
        state.images.insert(id, *info);
        log::trace!(
            "DummyBackend: creating image {label} ({}x{}x{})",
            info.extent.width,
            info.extent.height,
            info.extent.depth
        );
        Ok(DeviceImage(id))
    }

    fn destroy_image(&self, image: DeviceImage) {
        self.state.lock().images.remove(&image.0);
    }

    fn create_frame_context(&self, label: &str) -> GraphicsResult<FrameContextId> {
        let mut state = self.state.lock();
        state.check_device()?;
        let id = state.allocate_id();
        state.contexts.insert(
            id,
            ContextState {
                label: label.to_string(),
                submitted_at: None,
                signaled: false,
            },
        );
        Ok(FrameContextId(id))
    }

    fn destroy_frame_context(&self, context: FrameContextId) {
        self.state.lock().contexts.remove(&context.0);
    }

    fn poll_frame(&self, context: FrameContextId) -> GraphicsResult<bool> {
        let state = self.state.lock();
        state.check_device()?;
        state.context_complete(context)
    }

    fn wait_frame(&self, context: FrameContextId, timeout: Duration) -> GraphicsResult<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            state.check_device()?;
            if state.context_complete(context)? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let mut wake = deadline;
            if !state.manual_fences {
                if let Some(at) = state.context(context)?.submitted_at {
                    wake = wake.min(at + state.fence_latency);
                }
            }
            self.fence_signaled.wait_until(&mut state, wake);
        }
    }

    fn reset_frame(&self, context: FrameContextId) -> GraphicsResult<()> {
        let mut state = self.state.lock();
        state.check_device()?;
        if !state.context_complete(context)? {
            state.violations += 1;
            let label = &state.context(context)?.label;
            return Err(GraphicsError::InvalidParameter(format!(
                "frame context {label} reset while in flight"
            )));
        }
        if let Some(ctx) = state.contexts.get_mut(&context.0) {
            ctx.submitted_at = None;
            ctx.signaled = false;
        }
        Ok(())
    }

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc<'_>,
    ) -> GraphicsResult<DevicePipeline> {
        self.create_pipeline(desc.label, desc.cache_data)
    }

    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc<'_>,
    ) -> GraphicsResult<DevicePipeline> {
        self.create_pipeline(desc.label, desc.cache_data)
    }

    fn pipeline_cache_data(&self, pipeline: DevicePipeline) -> Option<Vec<u8>> {
        self.state
            .lock()
            .pipelines
            .get(&pipeline.0)
            .map(|label| format!("dummy-pipeline-cache:{label}").into_bytes())
    }

    fn destroy_pipeline(&self, pipeline: DevicePipeline) {
        self.state.lock().pipelines.remove(&pipeline.0);
    }

    fn swapchain_info(&self) -> Option<SwapchainInfo> {
        self.state.lock().swapchain.as_ref().map(|s| s.info)
    }

    fn acquire_swapchain_image(&self, context: FrameContextId) -> GraphicsResult<SwapchainImage> {
        let mut state = self.state.lock();
        state.check_device()?;
        state.context(context)?;
        if state.faults.out_of_date_on_acquire > 0 {
            state.faults.out_of_date_on_acquire -= 1;
            return Err(GraphicsError::SwapchainOutOfDate);
        }
        let swapchain = state.swapchain.as_mut().ok_or_else(|| {
            GraphicsError::InitializationFailed("headless backend has no swapchain".into())
        })?;
        let index = swapchain.next;
        swapchain.next = (index + 1) % swapchain.info.image_count.max(1);
        let image = swapchain.images[index as usize];
        log::trace!("DummyBackend: acquired swapchain image {index}");
        Ok(SwapchainImage { index, image })
    }

    fn reset_swapchain(&self, extent: Option<Extent3d>) -> GraphicsResult<SwapchainInfo> {
        let mut state = self.state.lock();
        state.check_device()?;
        let Some(old) = state.swapchain.take() else {
            return Err(GraphicsError::InitializationFailed(
                "headless backend has no swapchain".into(),
            ));
        };
        for image in &old.images {
            state.images.remove(&image.0);
        }
        let info = SwapchainInfo {
            extent: extent.unwrap_or(old.info.extent),
            ..old.info
        };
        let images = state.create_swapchain_images(info);
        state.swapchain = Some(DummySwapchain {
            info,
            images,
            next: 0,
        });
        log::trace!(
            "DummyBackend: swapchain reset to {}x{}",
            info.extent.width,
            info.extent.height
        );
        Ok(info)
    }

    fn submit(
        &self,
        context: FrameContextId,
        commands: &[DeviceCommand],
        present: Option<SwapchainImage>,
    ) -> GraphicsResult<PresentStatus> {
        let mut state = self.state.lock();
        state.check_device()?;
        if !state.context_complete(context)? {
            state.violations += 1;
            return Err(GraphicsError::InvalidParameter(format!(
                "frame context {} submitted while in flight",
                context.0
            )));
        }

        for command in commands {
            if let DeviceCommand::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } = *command
            {
                state.copy_buffer(src, src_offset, dst, dst_offset, size)?;
            }
        }

        let now = Instant::now();
        if let Some(ctx) = state.contexts.get_mut(&context.0) {
            ctx.submitted_at = Some(now);
            ctx.signaled = false;
        }
        state.submissions.push(SubmissionRecord {
            context,
            commands: commands.to_vec(),
            present,
            submitted_at: now,
        });
        log::trace!(
            "DummyBackend: submitted {} commands on context {}",
            commands.len(),
            context.0
        );

        if present.is_none() {
            return Ok(PresentStatus::NotRequested);
        }
        if state.faults.out_of_date_on_present > 0 {
            state.faults.out_of_date_on_present -= 1;
            return Ok(PresentStatus::OutOfDate);
        }
        Ok(PresentStatus::Presented)
    }

    fn wait_idle(&self) -> GraphicsResult<()> {
        let mut state = self.state.lock();
        state.check_device()?;
        let now = Instant::now();
        for ctx in state.contexts.values_mut() {
            if ctx.submitted_at.is_some() {
                ctx.signaled = true;
                ctx.submitted_at = Some(ctx.submitted_at.map_or(now, |at| at.min(now)));
            }
        }
        self.fence_signaled.notify_all();
        Ok(())
    }
}
