//! Frame orchestration.
//!
//! The [`FrameOrchestrator`] owns a ring of [`FrameSlot`]s, one per frame in
//! flight, and drives each of them through
//! `Idle -> Recording -> Submitted -> Complete -> Idle`:
//!
//! 1. [`acquire_frame_slot`](FrameOrchestrator::acquire_frame_slot) waits (with
//!    a bound) for the next slot's fence, resets its allocators and starts
//!    recording
//! 2. the application builds a [`RenderModule`] and compiles it
//! 3. [`acquire_physical_resources`](FrameOrchestrator::acquire_physical_resources)
//!    binds every resource of the plan to device memory
//! 4. [`dispatch_frame`](FrameOrchestrator::dispatch_frame) runs the execute
//!    callbacks, resolves pipelines and handles, inserts barriers, submits and
//!    presents
//!
//! [`render`](FrameOrchestrator::render) does all of the above in one call.
//!
//! Errors that concern the whole frame (invalid modules, exhausted allocators,
//! out of device memory) drop the frame: the slot returns to `Idle` and nothing
//! is submitted. Pipeline errors only skip the draws that needed the pipeline
//! and are listed in the [`FrameReport`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use frameforge::backend::DummyBackend;
//! use frameforge::config::BackendSettings;
//! use frameforge::frame::FrameOrchestrator;
//! use frameforge::graph::{ColorAttachment, PassType, RenderModule, RenderPass};
//! use frameforge::shader::NagaShaderCompiler;
//!
//! let mut orchestrator = FrameOrchestrator::new(
//!     Arc::new(DummyBackend::new()),
//!     BackendSettings::default(),
//!     Arc::new(NagaShaderCompiler::new()),
//! )
//! .unwrap();
//!
//! let report = orchestrator
//!     .render(|_frame| {
//!         RenderModule::new().with_pass(RenderPass::new("clear", PassType::Draw).with_setup(
//!             |builder| {
//!                 let target = builder.swapchain_image();
//!                 builder
//!                     .add_color_attachment(target, ColorAttachment::new())
//!                     .set_is_root(true);
//!                 true
//!             },
//!         ))
//!     })
//!     .unwrap();
//! assert_eq!(report.executed, ["clear"]);
//! assert!(report.presented);
//! ```

mod slot;

use std::collections::HashMap;
use std::sync::Arc;

pub use slot::{FrameSlot, FrameState};

use crate::allocator::{LinearAllocator, StagingAllocator};
use crate::backend::{
    BarrierResource, DeviceBarrier, DeviceBuffer, DeviceCommand, DeviceImage, GpuBackend,
    PresentStatus, RenderTarget, SwapchainInfo,
};
use crate::compiler::{compile_module, CompiledFrame, ExecutionPlan, PlannedPass};
use crate::config::BackendSettings;
use crate::encoder::{Command, CommandEncoder};
use crate::error::{GraphicsError, GraphicsResult};
use crate::graph::{Attachment, FrameInfo, PassType, RenderModule, RenderPass};
use crate::pipeline::{PipelineLayoutInfo, PipelineManager, RenderPassCompat};
use crate::resource::{
    BufferInfo, FnvBuildHasher, ImageInfo, PhysicalResource, ResourceArena, ResourceHandle,
    ResourceInfo,
};
use crate::shader::ShaderCompiler;
use crate::types::{BufferUsage, Extent3d, ImageUsage, TextureFormat};

use slot::{destroy_physical, UploadBuffer};

/// Usage of the device buffers behind linear allocators.
const LINEAR_BUFFER_USAGE: BufferUsage = BufferUsage::VERTEX_BUFFER
    .union(BufferUsage::INDEX_BUFFER)
    .union(BufferUsage::UNIFORM_BUFFER)
    .union(BufferUsage::TRANSFER_SRC);

/// Summary of one dispatched frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FrameReport {
    pub frame_number: u64,
    pub slot: usize,
    /// Passes whose execute callback ran, in order.
    pub executed: Vec<String>,
    /// Passes removed because the root does not depend on them.
    pub pruned: Vec<String>,
    /// Passes whose setup declined to run.
    pub withdrawn: Vec<String>,
    /// Draws and dispatches dropped because their pipeline was unavailable.
    pub skipped_draws: usize,
    /// Pipeline failures by pass name.
    pub pipeline_errors: Vec<(String, GraphicsError)>,
    /// Device commands submitted.
    pub command_count: usize,
    pub presented: bool,
}

impl FrameReport {
    /// Whether every draw of the frame was recorded.
    pub fn is_complete(&self) -> bool {
        self.skipped_draws == 0 && self.pipeline_errors.is_empty()
    }
}

/// A persistent backing replaced by a bigger one, kept alive until no frame
/// that may still use it is in flight.
#[derive(Debug)]
struct RetiredResource {
    resource: PhysicalResource,
    retired_at: u64,
}

/// Drives frames in flight on a [`GpuBackend`].
pub struct FrameOrchestrator<B: GpuBackend + ?Sized> {
    backend: Arc<B>,
    settings: BackendSettings,
    pipelines: Arc<PipelineManager>,
    slots: Vec<FrameSlot>,
    frame_counter: u64,
    persistent: ResourceArena,
    retired: Vec<RetiredResource>,
    surface: SwapchainInfo,
    /// Stand-in for the swapchain on headless backends.
    offscreen: Option<DeviceImage>,
    headless: bool,
}

impl<B: GpuBackend + ?Sized> std::fmt::Debug for FrameOrchestrator<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameOrchestrator")
            .field("backend", &self.backend.name())
            .field("slots", &self.slots)
            .field("frame_counter", &self.frame_counter)
            .field("surface", &self.surface)
            .field("headless", &self.headless)
            .finish_non_exhaustive()
    }
}

impl<B: GpuBackend + ?Sized> FrameOrchestrator<B> {
    /// Create the frame slots and load the pipeline cache, if configured.
    pub fn new(
        backend: Arc<B>,
        settings: BackendSettings,
        compiler: Arc<dyn ShaderCompiler>,
    ) -> GraphicsResult<Self> {
        settings.validate()?;

        let pipelines = Arc::new(PipelineManager::new(compiler));
        if let Some(path) = &settings.pipeline_cache_path {
            pipelines.load_cache(path)?;
        }

        let (surface, headless) = match backend.swapchain_info() {
            Some(info) => (info, false),
            None => (
                SwapchainInfo {
                    extent: settings.swapchain.extent,
                    format: TextureFormat::Bgra8UnormSrgb,
                    image_count: 1,
                },
                true,
            ),
        };

        let slots = (0..settings.frames_in_flight)
            .map(|index| {
                let context = backend.create_frame_context(&format!("frame slot {index}"))?;
                FrameSlot::new(index, context, &settings)
            })
            .collect::<GraphicsResult<Vec<_>>>()?;

        log::info!(
            "Frame orchestrator on {}: {} frames in flight, surface {}x{}{}",
            backend.name(),
            settings.frames_in_flight,
            surface.extent.width,
            surface.extent.height,
            if headless { " (headless)" } else { "" }
        );

        Ok(Self {
            backend,
            settings,
            pipelines,
            slots,
            frame_counter: 0,
            persistent: ResourceArena::new(),
            retired: Vec::new(),
            surface,
            offscreen: None,
            headless,
        })
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn settings(&self) -> &BackendSettings {
        &self.settings
    }

    pub fn pipeline_manager(&self) -> &Arc<PipelineManager> {
        &self.pipelines
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    /// Number of frames acquired so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_counter
    }

    pub fn frame_state(&self, slot: usize) -> Option<FrameState> {
        self.slots.get(slot).map(FrameSlot::state)
    }

    pub fn slot(&self, slot: usize) -> Option<&FrameSlot> {
        self.slots.get(slot)
    }

    pub fn is_headless(&self) -> bool {
        self.headless
    }

    fn slot_mut(&mut self, slot: usize) -> GraphicsResult<&mut FrameSlot> {
        let count = self.slots.len();
        self.slots.get_mut(slot).ok_or_else(|| {
            GraphicsError::InvalidParameter(format!("frame slot {slot} out of range 0..{count}"))
        })
    }

    // ------------------------------------------------------------------
    // Slot lifecycle
    // ------------------------------------------------------------------

    /// Start recording the next frame.
    ///
    /// Blocks for at most `fence_timeout` if the slot's previous frame is
    /// still executing. A frame still recording in the slot is abandoned.
    pub fn acquire_frame_slot(&mut self) -> GraphicsResult<FrameInfo> {
        let index = (self.frame_counter % self.slots.len() as u64) as usize;
        let timeout = self.settings.fence_timeout;
        let backend = &*self.backend;
        let slot = &mut self.slots[index];

        match slot.state {
            FrameState::Recording => {
                // Recording is single-threaded: coming back to a recording slot
                // means its frame was never dispatched.
                log::warn!(
                    "Frame {} in slot {index} was never dispatched, abandoning it",
                    slot.frame_number
                );
                slot.reset_frame_data();
                slot.transition(FrameState::Idle);
            }
            FrameState::Submitted => {
                if !backend.wait_frame(slot.context, timeout)? {
                    log::warn!(
                        "Frame slot {index} (frame {}) still busy after {timeout:?}",
                        slot.frame_number
                    );
                    return Err(GraphicsError::FrameTimeout {
                        slot: index,
                        timeout,
                    });
                }
                slot.transition(FrameState::Complete);
            }
            FrameState::Idle | FrameState::Complete => {}
        }
        if slot.state == FrameState::Complete {
            backend.reset_frame(slot.context)?;
            slot.reset_frame_data();
            slot.transition(FrameState::Idle);
        }

        self.frame_counter += 1;
        slot.frame_number = self.frame_counter;
        slot.reset_frame_data();
        slot.transition(FrameState::Recording);
        slot.trim_pool(backend);

        self.release_retired();
        Ok(FrameInfo::new(self.surface.extent, self.surface.format)
            .with_frame(self.frame_counter, index))
    }

    /// Non-blocking check whether `slot` can start a new frame.
    pub fn poll_frame_fence(&mut self, slot: usize) -> GraphicsResult<bool> {
        let backend = &*self.backend;
        let count = self.slots.len();
        let frame_slot = self.slots.get_mut(slot).ok_or_else(|| {
            GraphicsError::InvalidParameter(format!("frame slot {slot} out of range 0..{count}"))
        })?;
        match frame_slot.state {
            FrameState::Idle | FrameState::Complete => Ok(true),
            FrameState::Recording => Ok(false),
            FrameState::Submitted => {
                let done = backend.poll_frame(frame_slot.context)?;
                if done {
                    frame_slot.transition(FrameState::Complete);
                }
                Ok(done)
            }
        }
    }

    /// Return a completed slot to `Idle`.
    pub fn clear_frame(&mut self, slot: usize) -> GraphicsResult<()> {
        if self.slot_mut(slot)?.state == FrameState::Submitted {
            self.poll_frame_fence(slot)?;
        }
        let backend = &*self.backend;
        let frame_slot = &mut self.slots[slot];
        match frame_slot.state {
            FrameState::Idle => Ok(()),
            FrameState::Complete => {
                backend.reset_frame(frame_slot.context)?;
                frame_slot.reset_frame_data();
                frame_slot.transition(FrameState::Idle);
                Ok(())
            }
            FrameState::Recording | FrameState::Submitted => {
                frame_slot.expect(FrameState::Complete)
            }
        }
    }

    /// Discard a frame that is being recorded. Nothing is submitted.
    pub fn abandon_frame(&mut self, slot: usize) -> GraphicsResult<()> {
        let frame_slot = self.slot_mut(slot)?;
        frame_slot.expect(FrameState::Recording)?;
        log::debug!(
            "Abandoning frame {} in slot {slot}",
            frame_slot.frame_number
        );
        frame_slot.reset_frame_data();
        frame_slot.transition(FrameState::Idle);
        Ok(())
    }

    fn drop_frame(&mut self, slot: usize, err: &GraphicsError) {
        if let Some(frame_slot) = self.slots.get_mut(slot) {
            if frame_slot.state == FrameState::Recording {
                log::warn!("Dropping frame {} in slot {slot}: {err}", frame_slot.frame_number);
                frame_slot.reset_frame_data();
                frame_slot.transition(FrameState::Idle);
            }
        }
    }

    // ------------------------------------------------------------------
    // Physical resources
    // ------------------------------------------------------------------

    /// Bind every resource of `plan` to device memory for the frame recorded
    /// in `slot`.
    ///
    /// Transient resources come from the slot's pool, one backing per alias
    /// slot. Persistent resources keep their backing across frames until a
    /// declaration outgrows it. On failure the frame is dropped.
    pub fn acquire_physical_resources(
        &mut self,
        slot: usize,
        plan: &ExecutionPlan,
    ) -> GraphicsResult<()> {
        self.slot_mut(slot)?.expect(FrameState::Recording)?;
        let result = self.bind_resources(slot, plan);
        if let Err(err) = &result {
            self.drop_frame(slot, err);
        }
        result
    }

    fn bind_resources(&mut self, index: usize, plan: &ExecutionPlan) -> GraphicsResult<()> {
        let backend = &*self.backend;
        let slot = &mut self.slots[index];
        slot.bindings.drain();

        let mut alias_backings = Vec::with_capacity(plan.alias_slots.len());
        for (i, alias) in plan.alias_slots.iter().enumerate() {
            let backing = match slot.take_pooled(&alias.info) {
                Some(backing) => backing,
                None => {
                    let label = format!("slot {index} transient {i}");
                    let backing = create_physical(backend, &alias.info, &label)?;
                    slot.add_pooled(backing);
                    backing
                }
            };
            alias_backings.push(backing);
        }

        for planned in &plan.resources {
            let physical = if planned.handle == ResourceHandle::SWAPCHAIN_IMAGE {
                let info = planned.info.as_image().copied().unwrap_or_default();
                let image = if self.headless {
                    match self.offscreen {
                        Some(image) => image,
                        None => {
                            let surface_info = info
                                .add_usage(ImageUsage::COLOR_ATTACHMENT | ImageUsage::TRANSFER_DST)
                                .persistent();
                            let image = backend.create_image(&surface_info, "offscreen surface")?;
                            self.offscreen = Some(image);
                            image
                        }
                    }
                } else {
                    let acquired = backend.acquire_swapchain_image(slot.context)?;
                    slot.swapchain_image = Some(acquired);
                    acquired.image
                };
                PhysicalResource::Image { image, info }
            } else if let Some(alias) = planned.alias_slot {
                alias_backings[alias]
            } else {
                match self.persistent.get(planned.handle).copied() {
                    Some(existing) if existing.info().can_back(&planned.info) => existing,
                    existing => {
                        let info = existing
                            .and_then(|old| old.info().merge(&planned.info).ok())
                            .unwrap_or(planned.info);
                        let label = format!("persistent {}", planned.handle);
                        let backing = create_physical(backend, &info, &label)?;
                        if let Some(old) = self.persistent.insert(planned.handle, backing) {
                            log::debug!("Resized persistent resource {}", planned.handle);
                            self.retired.push(RetiredResource {
                                resource: old,
                                retired_at: slot.frame_number,
                            });
                        }
                        backing
                    }
                }
            };
            slot.bindings.insert(planned.handle, physical);
        }

        slot.resources_acquired = true;
        Ok(())
    }

    /// Destroy retired backings once no frame that used them can be in flight.
    fn release_retired(&mut self) {
        let frames_in_flight = self.slots.len() as u64;
        let oldest_in_flight = self
            .slots
            .iter()
            .filter(|s| s.state == FrameState::Submitted)
            .map(|s| s.frame_number)
            .min();
        let frame_counter = self.frame_counter;
        let backend = &*self.backend;
        self.retired.retain(|retired| {
            let idle = oldest_in_flight.map_or(true, |oldest| oldest >= retired.retired_at);
            let release = idle && frame_counter >= retired.retired_at + frames_in_flight;
            if release {
                destroy_physical(backend, retired.resource);
            }
            !release
        });
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Execute, translate and submit a compiled frame.
    ///
    /// Binds physical resources first if that was not done yet. Any error
    /// drops the frame without submitting it.
    pub fn dispatch_frame(
        &mut self,
        slot: usize,
        compiled: CompiledFrame<'_>,
    ) -> GraphicsResult<FrameReport> {
        self.slot_mut(slot)?.expect(FrameState::Recording)?;
        let (plan, mut passes) = compiled.into_parts();
        if !self.slots[slot].resources_acquired {
            self.acquire_physical_resources(slot, &plan)?;
        }

        match self.record_and_submit(slot, &plan, &mut passes) {
            Ok((report, status)) => self.finish_presentation(report, status),
            Err(err) => {
                self.drop_frame(slot, &err);
                Err(err)
            }
        }
    }

    fn record_and_submit(
        &mut self,
        index: usize,
        plan: &ExecutionPlan,
        passes: &mut [RenderPass<'_>],
    ) -> GraphicsResult<(FrameReport, PresentStatus)> {
        let backend = &*self.backend;
        let pipelines = &*self.pipelines;
        let slot = &mut self.slots[index];
        let frame = FrameInfo::new(self.surface.extent, self.surface.format)
            .with_frame(slot.frame_number, index);

        let mut recorded = Vec::with_capacity(passes.len());
        for (planned, pass) in plan.passes.iter().zip(passes.iter_mut()) {
            let area = render_area(&slot.bindings, planned, &frame);
            let linear = slot.linear.first_mut().ok_or_else(|| {
                GraphicsError::InvalidParameter("frame slot has no linear allocator".into())
            })?;
            let mut encoder = CommandEncoder::new(
                &planned.name,
                planned.pass_type,
                &frame,
                area,
                linear,
                &mut slot.staging,
            );
            pass.run_execute(&mut encoder);
            recorded.push(encoder.finish()?);
        }

        upload_allocators(backend, slot)?;

        let mut report = FrameReport {
            frame_number: slot.frame_number,
            slot: index,
            executed: plan.passes.iter().map(|p| p.name.clone()).collect(),
            pruned: plan.pruned.clone(),
            withdrawn: plan.withdrawn.clone(),
            ..FrameReport::default()
        };
        let mut translator = Translator {
            backend,
            pipelines,
            bindings: &slot.bindings,
            frame: &frame,
            commands: Vec::new(),
            report: &mut report,
        };
        for (planned, commands) in plan.passes.iter().zip(recorded) {
            translator.translate_pass(planned, commands)?;
        }
        let commands = translator.commands;

        let present = if plan.targets_surface {
            slot.swapchain_image
        } else {
            None
        };
        let status = backend.submit(slot.context, &commands, present)?;
        slot.transition(FrameState::Submitted);

        report.command_count = commands.len();
        log::trace!(
            "Submitted frame {} from slot {index}: {} passes, {} commands",
            report.frame_number,
            report.executed.len(),
            report.command_count
        );
        Ok((report, status))
    }

    fn finish_presentation(
        &mut self,
        mut report: FrameReport,
        status: PresentStatus,
    ) -> GraphicsResult<FrameReport> {
        match status {
            PresentStatus::Presented => report.presented = true,
            PresentStatus::NotRequested => {}
            PresentStatus::Suboptimal => {
                report.presented = true;
                self.reset_swapchain(None)?;
            }
            PresentStatus::OutOfDate => {
                log::info!("Swapchain out of date at present of frame {}", report.frame_number);
                self.reset_swapchain(None)?;
            }
        }
        Ok(report)
    }

    /// Acquire a slot, build and compile a module, bind resources and
    /// dispatch.
    ///
    /// If the swapchain is out of date when the frame acquires its image, the
    /// swapchain is reset and the frame is built again once with the new
    /// extent.
    pub fn render<'m, F>(&mut self, mut build: F) -> GraphicsResult<FrameReport>
    where
        F: FnMut(&FrameInfo) -> RenderModule<'m>,
    {
        let mut retried = false;
        loop {
            let frame = self.acquire_frame_slot()?;
            let compiled = match compile_module(build(&frame), &frame) {
                Ok(compiled) => compiled,
                Err(err) => {
                    self.drop_frame(frame.slot, &err);
                    return Err(err);
                }
            };
            match self.acquire_physical_resources(frame.slot, compiled.plan()) {
                Ok(()) => return self.dispatch_frame(frame.slot, compiled),
                Err(GraphicsError::SwapchainOutOfDate) if !retried => {
                    log::info!("Swapchain out of date, rebuilding frame {}", frame.frame_number);
                    retried = true;
                    self.reset_swapchain(None)?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    // ------------------------------------------------------------------
    // Swapchain
    // ------------------------------------------------------------------

    /// Recreate the swapchain, optionally with a new extent.
    ///
    /// Waits for the device to go idle and abandons any frame being recorded.
    pub fn reset_swapchain(&mut self, extent: Option<Extent3d>) -> GraphicsResult<SwapchainInfo> {
        self.wait_idle()?;
        for index in 0..self.slots.len() {
            if self.slots[index].state == FrameState::Recording {
                self.abandon_frame(index)?;
            }
        }

        if self.headless {
            if let Some(image) = self.offscreen.take() {
                self.backend.destroy_image(image);
            }
            if let Some(extent) = extent {
                self.surface.extent = extent;
            }
        } else {
            self.surface = self.backend.reset_swapchain(extent)?;
        }
        log::info!(
            "Swapchain reset to {}x{}",
            self.surface.extent.width,
            self.surface.extent.height
        );
        Ok(self.surface)
    }

    pub fn get_swapchain_extent(&self) -> Extent3d {
        self.surface.extent
    }

    pub fn get_swapchain_format(&self) -> TextureFormat {
        self.surface.format
    }

    /// Handle passes use to target the presentable image.
    pub fn get_swapchain_resource(&self) -> ResourceHandle {
        ResourceHandle::SWAPCHAIN_IMAGE
    }

    pub fn get_num_swapchain_images(&self) -> u32 {
        self.surface.image_count
    }

    // ------------------------------------------------------------------
    // Allocators
    // ------------------------------------------------------------------

    /// Linear allocators of a slot that is recording.
    pub fn get_transient_allocators(&mut self, slot: usize) -> GraphicsResult<&mut [LinearAllocator]> {
        let frame_slot = self.slot_mut(slot)?;
        frame_slot.expect(FrameState::Recording)?;
        Ok(&mut frame_slot.linear)
    }

    /// Staging allocator of a slot that is recording.
    pub fn get_staging_allocator(&mut self, slot: usize) -> GraphicsResult<&mut StagingAllocator> {
        let frame_slot = self.slot_mut(slot)?;
        frame_slot.expect(FrameState::Recording)?;
        Ok(&mut frame_slot.staging)
    }

    // ------------------------------------------------------------------
    // Device
    // ------------------------------------------------------------------

    /// Reload changed shaders. See [`PipelineManager::update_shader_modules`].
    pub fn update_shader_modules(&self) -> GraphicsResult<usize> {
        self.pipelines.update_shader_modules(&*self.backend)
    }

    /// Block until the device is idle; every submitted slot becomes complete.
    pub fn wait_idle(&mut self) -> GraphicsResult<()> {
        self.backend.wait_idle()?;
        for slot in &mut self.slots {
            if slot.state == FrameState::Submitted {
                slot.transition(FrameState::Complete);
            }
        }
        Ok(())
    }
}

impl<B: GpuBackend + ?Sized> Drop for FrameOrchestrator<B> {
    fn drop(&mut self) {
        if let Err(err) = self.backend.wait_idle() {
            log::warn!("Failed to wait for device idle on shutdown: {err}");
        }
        let backend = &*self.backend;
        if let Some(path) = &self.settings.pipeline_cache_path {
            if let Err(err) = self.pipelines.save_cache(backend, path) {
                log::warn!("Failed to save pipeline cache: {err}");
            }
        }
        self.pipelines.destroy_all(backend);
        for slot in &mut self.slots {
            slot.destroy(backend);
        }
        for resource in self.persistent.drain() {
            destroy_physical(backend, resource);
        }
        for retired in self.retired.drain(..) {
            destroy_physical(backend, retired.resource);
        }
        if let Some(image) = self.offscreen.take() {
            backend.destroy_image(image);
        }
        log::debug!("Frame orchestrator destroyed after {} frames", self.frame_counter);
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn create_physical<B: GpuBackend + ?Sized>(
    backend: &B,
    info: &ResourceInfo,
    label: &str,
) -> GraphicsResult<PhysicalResource> {
    Ok(match *info {
        ResourceInfo::Buffer(info) => PhysicalResource::Buffer {
            buffer: backend.create_buffer(&info, label)?,
            info,
        },
        ResourceInfo::Image(info) => PhysicalResource::Image {
            image: backend.create_image(&info, label)?,
            info,
        },
    })
}

/// Extent of the first bound attachment, or the frame extent.
fn render_area(bindings: &ResourceArena, pass: &PlannedPass, frame: &FrameInfo) -> Extent3d {
    pass.color_attachments
        .iter()
        .chain(pass.depth_attachment.iter())
        .find_map(|attachment| match bindings.get(attachment.handle) {
            Some(PhysicalResource::Image { info, .. }) => Some(info.extent),
            _ => None,
        })
        .unwrap_or(frame.extent)
}

/// Copy allocator contents into their device buffers and bind them.
fn upload_allocators<B: GpuBackend + ?Sized>(backend: &B, slot: &mut FrameSlot) -> GraphicsResult<()> {
    for allocator in &slot.linear {
        if allocator.used() == 0 {
            continue;
        }
        let upload = upload_buffer(
            backend,
            &mut slot.upload_buffers,
            allocator.handle(),
            allocator.capacity(),
            LINEAR_BUFFER_USAGE,
        )?;
        backend.write_buffer(upload.buffer, 0, allocator.contents())?;
        slot.bindings.insert(allocator.handle(), upload_binding(upload, LINEAR_BUFFER_USAGE));
    }

    for chunk in slot.staging.chunks() {
        if chunk.used() == 0 {
            continue;
        }
        let upload = upload_buffer(
            backend,
            &mut slot.upload_buffers,
            chunk.handle(),
            chunk.capacity(),
            BufferUsage::TRANSFER_SRC,
        )?;
        backend.write_buffer(upload.buffer, 0, chunk.contents())?;
        slot.bindings.insert(chunk.handle(), upload_binding(upload, BufferUsage::TRANSFER_SRC));
    }
    Ok(())
}

fn upload_buffer<B: GpuBackend + ?Sized>(
    backend: &B,
    buffers: &mut HashMap<ResourceHandle, UploadBuffer, FnvBuildHasher>,
    handle: ResourceHandle,
    capacity: u64,
    usage: BufferUsage,
) -> GraphicsResult<UploadBuffer> {
    if let Some(existing) = buffers.get(&handle).filter(|b| b.capacity >= capacity) {
        return Ok(*existing);
    }
    if let Some(old) = buffers.remove(&handle) {
        backend.destroy_buffer(old.buffer);
    }
    let info = BufferInfo::new(capacity).with_usage(usage).persistent();
    let buffer = backend.create_buffer(&info, &format!("upload {handle}"))?;
    let upload = UploadBuffer { buffer, capacity };
    buffers.insert(handle, upload);
    Ok(upload)
}

fn upload_binding(upload: UploadBuffer, usage: BufferUsage) -> PhysicalResource {
    PhysicalResource::Buffer {
        buffer: upload.buffer,
        info: BufferInfo::new(upload.capacity).with_usage(usage).persistent(),
    }
}

/// Turns recorded commands into device commands for one frame.
struct Translator<'t, B: GpuBackend + ?Sized> {
    backend: &'t B,
    pipelines: &'t PipelineManager,
    bindings: &'t ResourceArena,
    frame: &'t FrameInfo,
    commands: Vec<DeviceCommand>,
    report: &'t mut FrameReport,
}

impl<B: GpuBackend + ?Sized> Translator<'_, B> {
    fn translate_pass(&mut self, pass: &PlannedPass, recorded: Vec<Command>) -> GraphicsResult<()> {
        for barrier in &pass.barriers {
            let resource = self.barrier_resource(barrier.resource)?;
            self.commands.push(DeviceCommand::Barrier(DeviceBarrier {
                resource,
                hazard: barrier.hazard,
                src: barrier.src,
                dst: barrier.dst,
            }));
        }

        let rendering = pass.pass_type == PassType::Draw
            && (!pass.color_attachments.is_empty() || pass.depth_attachment.is_some());
        let mut compat = RenderPassCompat::new(Vec::new(), None);
        if rendering {
            let colors = pass
                .color_attachments
                .iter()
                .map(|a| self.render_target(a))
                .collect::<GraphicsResult<Vec<_>>>()?;
            let depth = pass
                .depth_attachment
                .as_ref()
                .map(|a| self.render_target(a))
                .transpose()?;
            compat = RenderPassCompat {
                color_formats: colors.iter().map(|t| t.format).collect(),
                depth_format: depth.map(|t| t.format),
                samples: self.attachment_samples(pass),
            };
            self.commands.push(DeviceCommand::BeginRendering {
                colors,
                depth,
                extent: render_area(self.bindings, pass, self.frame),
            });
        }

        let mut pipeline_ready = true;
        let mut layout: Option<Arc<PipelineLayoutInfo>> = None;
        for command in recorded {
            match command {
                Command::BindGraphicsPipeline(handle) => {
                    let produced =
                        self.pipelines
                            .produce_graphics_pipeline(self.backend, handle, &compat);
                    layout = self.bind_pipeline(pass, produced, false);
                    pipeline_ready = layout.is_some();
                }
                Command::BindComputePipeline(handle) => {
                    let produced = self.pipelines.produce_compute_pipeline(self.backend, handle);
                    layout = self.bind_pipeline(pass, produced, true);
                    pipeline_ready = layout.is_some();
                }
                Command::Draw {
                    vertex_count,
                    instance_count,
                    first_vertex,
                    first_instance,
                } => self.push_work(
                    pipeline_ready,
                    DeviceCommand::Draw {
                        vertex_count,
                        instance_count,
                        first_vertex,
                        first_instance,
                    },
                ),
                Command::DrawIndexed {
                    index_count,
                    instance_count,
                    first_index,
                    vertex_offset,
                    first_instance,
                } => self.push_work(
                    pipeline_ready,
                    DeviceCommand::DrawIndexed {
                        index_count,
                        instance_count,
                        first_index,
                        vertex_offset,
                        first_instance,
                    },
                ),
                Command::Dispatch { x, y, z } => {
                    self.push_work(pipeline_ready, DeviceCommand::Dispatch { x, y, z })
                }
                Command::SetViewport(viewport) => {
                    self.commands.push(DeviceCommand::SetViewport(viewport))
                }
                Command::SetScissor(scissor) => self.commands.push(DeviceCommand::SetScissor(scissor)),
                Command::BindVertexBuffers {
                    first_binding,
                    buffers,
                } => {
                    let buffers = buffers
                        .into_iter()
                        .map(|(handle, offset)| Ok((self.buffer(handle)?, offset)))
                        .collect::<GraphicsResult<Vec<_>>>()?;
                    self.commands.push(DeviceCommand::BindVertexBuffers {
                        first_binding,
                        buffers,
                    });
                }
                Command::BindIndexBuffer {
                    handle,
                    offset,
                    index_type,
                } => {
                    let buffer = self.buffer(handle)?;
                    self.commands.push(DeviceCommand::BindIndexBuffer {
                        buffer,
                        offset,
                        index_type,
                    });
                }
                Command::SetArgument { argument, data } => {
                    match layout.as_ref().and_then(|l| l.argument_binding(argument)) {
                        Some((set, binding)) => {
                            let buffer = self.buffer(data.handle)?;
                            self.commands.push(DeviceCommand::BindUniformBuffer {
                                set,
                                binding,
                                buffer,
                                offset: data.offset,
                                size: data.size,
                            });
                        }
                        None if pipeline_ready => log::warn!(
                            "Pass '{}': bound pipeline has no uniform block for argument {argument:016x}",
                            pass.name
                        ),
                        None => {}
                    }
                }
                Command::CopyBuffer {
                    src,
                    dst,
                    dst_offset,
                } => {
                    let command = DeviceCommand::CopyBuffer {
                        src: self.buffer(src.handle)?,
                        src_offset: src.offset,
                        dst: self.buffer(dst)?,
                        dst_offset,
                        size: src.size,
                    };
                    self.commands.push(command);
                }
                Command::CopyBufferToImage {
                    src,
                    dst,
                    extent,
                    mip_level,
                } => {
                    let (image, info) = self.image(dst)?;
                    let command = DeviceCommand::CopyBufferToImage {
                        src: self.buffer(src.handle)?,
                        src_offset: src.offset,
                        dst: image,
                        format: info.format.unwrap_or(self.frame.format),
                        extent,
                        mip_level,
                    };
                    self.commands.push(command);
                }
            }
        }

        if rendering {
            self.commands.push(DeviceCommand::EndRendering);
        }
        Ok(())
    }

    fn bind_pipeline(
        &mut self,
        pass: &PlannedPass,
        produced: GraphicsResult<crate::pipeline::CachedPipeline>,
        compute: bool,
    ) -> Option<Arc<PipelineLayoutInfo>> {
        match produced {
            Ok(cached) => {
                self.commands.push(if compute {
                    DeviceCommand::BindComputePipeline(cached.pipeline)
                } else {
                    DeviceCommand::BindGraphicsPipeline(cached.pipeline)
                });
                Some(cached.layout)
            }
            Err(err) => {
                log::error!("Pass '{}' skips draws for this frame: {err}", pass.name);
                self.report.pipeline_errors.push((pass.name.clone(), err));
                None
            }
        }
    }

    fn push_work(&mut self, pipeline_ready: bool, command: DeviceCommand) {
        if pipeline_ready {
            self.commands.push(command);
        } else {
            self.report.skipped_draws += 1;
        }
    }

    fn buffer(&self, handle: ResourceHandle) -> GraphicsResult<DeviceBuffer> {
        match self.bindings.get(handle) {
            Some(PhysicalResource::Buffer { buffer, .. }) => Ok(*buffer),
            Some(PhysicalResource::Image { .. }) => Err(GraphicsError::InvalidParameter(format!(
                "{handle} is bound to an image, expected a buffer"
            ))),
            None => Err(unbound(handle)),
        }
    }

    fn image(&self, handle: ResourceHandle) -> GraphicsResult<(DeviceImage, ImageInfo)> {
        match self.bindings.get(handle) {
            Some(PhysicalResource::Image { image, info }) => Ok((*image, *info)),
            Some(PhysicalResource::Buffer { .. }) => Err(GraphicsError::InvalidParameter(format!(
                "{handle} is bound to a buffer, expected an image"
            ))),
            None => Err(unbound(handle)),
        }
    }

    fn barrier_resource(&self, handle: ResourceHandle) -> GraphicsResult<BarrierResource> {
        match self.bindings.get(handle) {
            Some(PhysicalResource::Buffer { buffer, .. }) => Ok(BarrierResource::Buffer(*buffer)),
            Some(PhysicalResource::Image { image, info }) => Ok(BarrierResource::Image {
                image: *image,
                format: info.format.unwrap_or(self.frame.format),
            }),
            None => Err(unbound(handle)),
        }
    }

    fn render_target(&self, attachment: &Attachment) -> GraphicsResult<RenderTarget> {
        let (image, info) = self.image(attachment.handle)?;
        Ok(RenderTarget {
            image,
            format: info.format.unwrap_or(self.frame.format),
            load_op: attachment.load_op,
            store_op: attachment.store_op,
        })
    }

    fn attachment_samples(&self, pass: &PlannedPass) -> u32 {
        pass.color_attachments
            .iter()
            .chain(pass.depth_attachment.iter())
            .find_map(|a| self.image(a.handle).ok())
            .map_or(1, |(_, info)| info.samples)
    }
}

fn unbound(handle: ResourceHandle) -> GraphicsError {
    GraphicsError::InvalidParameter(format!(
        "{handle} was not declared by any pass of this frame"
    ))
}
