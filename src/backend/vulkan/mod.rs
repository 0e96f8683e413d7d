//! Vulkan backend implementation using ash.
//!
//! Rendering uses dynamic rendering and synchronization2, memory comes from
//! `gpu-allocator`, and surfaces are created with `ash-window` from any
//! window exposing `raw-window-handle` handles.
//!
//! Each frame context owns a command pool with one primary command buffer, a
//! descriptor pool for the frame's uniform bindings, a fence and the two
//! semaphores used for acquire and present. Every pipeline gets its own
//! `VkPipelineCache` so its blob can be persisted independently.

mod barriers;
mod conversion;
mod device;
mod instance;
mod pipeline;
mod swapchain;

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::{AllocationError, MemoryLocation};
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use self::barriers::{BarrierBatch, LayoutTracker, SyncPoint};
use self::conversion::{
    aspect_mask, convert_buffer_usage, convert_clear_value, convert_extent_2d,
    convert_extent_3d, convert_image_usage, convert_index_type, convert_load_op, convert_samples,
    convert_store_op, convert_texture_format,
};
use self::instance::DebugMessenger;
use self::pipeline::{LayoutCache, LayoutEntry};
use self::swapchain::{SurfaceTarget, VulkanSwapchain};
use super::{
    BarrierResource, ComputePipelineDesc, DeviceBuffer, DeviceCommand, DeviceImage,
    DevicePipeline, FrameContextId, GpuBackend, GraphicsPipelineDesc, PresentStatus,
    RenderTarget, SwapchainImage, SwapchainInfo,
};
use crate::compiler::Hazard;
use crate::config::{BackendSettings, SwapchainSettings};
use crate::error::{GraphicsError, GraphicsResult};
use crate::resource::{BufferInfo, ImageInfo};
use crate::types::{BufferUsage, Extent3d, TextureFormat};

/// Descriptor sets each frame context can allocate per frame.
const DESCRIPTOR_SETS_PER_FRAME: u32 = 1024;

/// Map a Vulkan error to the crate error.
pub(crate) fn map_vk_error(what: &str, e: vk::Result) -> GraphicsError {
    match e {
        vk::Result::ERROR_DEVICE_LOST => GraphicsError::DeviceLost,
        vk::Result::ERROR_OUT_OF_HOST_MEMORY
        | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
        | vk::Result::ERROR_OUT_OF_POOL_MEMORY => GraphicsError::OutOfMemory,
        vk::Result::ERROR_OUT_OF_DATE_KHR => GraphicsError::SwapchainOutOfDate,
        _ => GraphicsError::InitializationFailed(format!("Failed to {what}: {e:?}")),
    }
}

fn map_allocation_error(label: &str, e: AllocationError) -> GraphicsError {
    match e {
        AllocationError::OutOfMemory => GraphicsError::OutOfMemory,
        other => GraphicsError::InitializationFailed(format!(
            "Failed to allocate memory for '{label}': {other}"
        )),
    }
}

struct VulkanBuffer {
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: u64,
}

struct VulkanImage {
    image: vk::Image,
    view: vk::ImageView,
    allocation: Option<Allocation>,
    format: TextureFormat,
    /// Swapchain images belong to the swapchain.
    owned: bool,
}

struct VulkanPipeline {
    pipeline: vk::Pipeline,
    cache: vk::PipelineCache,
    layout: LayoutEntry,
    bind_point: vk::PipelineBindPoint,
}

#[derive(Clone, Copy)]
struct FrameContext {
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    descriptor_pool: vk::DescriptorPool,
    fence: vk::Fence,
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
    submitted: bool,
    /// Swapchain image acquired for the frame being recorded.
    acquired: Option<u32>,
}

struct VulkanState {
    queue: vk::Queue,
    allocator: Option<Allocator>,
    next_id: u64,
    buffers: HashMap<u64, VulkanBuffer>,
    images: HashMap<u64, VulkanImage>,
    pipelines: HashMap<u64, VulkanPipeline>,
    contexts: HashMap<u64, FrameContext>,
    layouts: LayoutCache,
    tracker: LayoutTracker,
    swapchain: VulkanSwapchain,
    /// Device image ids of the swapchain images, by swapchain index.
    swapchain_ids: Vec<u64>,
}

impl VulkanState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn allocator(&mut self) -> GraphicsResult<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GraphicsError::InitializationFailed("allocator destroyed".into()))
    }

    fn context(&self, context: FrameContextId) -> GraphicsResult<FrameContext> {
        self.contexts.get(&context.0).copied().ok_or_else(|| {
            GraphicsError::InvalidParameter(format!("unknown frame context {}", context.0))
        })
    }

    fn buffer(&self, buffer: DeviceBuffer) -> GraphicsResult<vk::Buffer> {
        self.buffers
            .get(&buffer.0)
            .map(|b| b.buffer)
            .ok_or_else(|| GraphicsError::InvalidParameter(format!("unknown buffer {}", buffer.0)))
    }

    fn image(&self, image: DeviceImage) -> GraphicsResult<&VulkanImage> {
        self.images
            .get(&image.0)
            .ok_or_else(|| GraphicsError::InvalidParameter(format!("unknown image {}", image.0)))
    }

    fn register_swapchain_images(&mut self) {
        let images: Vec<_> = self
            .swapchain
            .images
            .iter()
            .copied()
            .zip(self.swapchain.views.iter().copied())
            .collect();
        let format = self.swapchain.format;
        let ids = images
            .into_iter()
            .map(|(image, view)| {
                let id = self.next_id();
                self.images.insert(
                    id,
                    VulkanImage {
                        image,
                        view,
                        allocation: None,
                        format,
                        owned: false,
                    },
                );
                id
            })
            .collect();
        self.swapchain_ids = ids;
    }

    fn unregister_swapchain_images(&mut self) {
        for id in std::mem::take(&mut self.swapchain_ids) {
            if let Some(image) = self.images.remove(&id) {
                self.tracker.forget(image.image);
            }
        }
    }
}

/// Vulkan implementation of [`GpuBackend`].
pub struct VulkanBackend {
    _entry: ash::Entry,
    instance: ash::Instance,
    debug: Option<DebugMessenger>,
    surface_fn: ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
    device: ash::Device,
    swapchain_fn: ash::khr::swapchain::Device,
    swapchain_settings: SwapchainSettings,
    state: Mutex<VulkanState>,
}

impl VulkanBackend {
    /// Create a device able to present to `window`.
    pub fn new<W>(settings: &BackendSettings, window: &W) -> GraphicsResult<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GraphicsError::InitializationFailed(format!("No display handle: {e}")))?
            .as_raw();
        let window_handle = window
            .window_handle()
            .map_err(|e| GraphicsError::InitializationFailed(format!("No window handle: {e}")))?
            .as_raw();

        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            GraphicsError::InitializationFailed(format!("Failed to load Vulkan library: {e}"))
        })?;
        let (instance, debug) =
            instance::create_instance(&entry, display, settings.enable_validation)?;

        let surface =
            unsafe { ash_window::create_surface(&entry, &instance, display, window_handle, None) }
                .map_err(|e| map_vk_error("create surface", e))?;
        let surface_fn = ash::khr::surface::Instance::new(&entry, &instance);

        let selected = device::select_physical_device(&instance, &surface_fn, surface)?;
        let device = device::create_logical_device(
            &instance,
            selected,
            &settings.requested_device_extensions,
        )?;
        let queue = unsafe { device.get_device_queue(selected.queue_family, 0) };
        let swapchain_fn = ash::khr::swapchain::Device::new(&instance, &device);

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device: selected.physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: gpu_allocator::AllocationSizes::default(),
        })
        .map_err(|e| {
            GraphicsError::InitializationFailed(format!("Failed to create memory allocator: {e}"))
        })?;

        let swapchain = VulkanSwapchain::new(
            &SurfaceTarget {
                device: &device,
                swapchain_fn: &swapchain_fn,
                surface_fn: &surface_fn,
                physical_device: selected.physical_device,
                surface,
            },
            &settings.swapchain,
            settings.swapchain.extent,
            vk::SwapchainKHR::null(),
        )?;

        let mut state = VulkanState {
            queue,
            allocator: Some(allocator),
            next_id: 0,
            buffers: HashMap::new(),
            images: HashMap::new(),
            pipelines: HashMap::new(),
            contexts: HashMap::new(),
            layouts: LayoutCache::new(),
            tracker: LayoutTracker::new(),
            swapchain,
            swapchain_ids: Vec::new(),
        };
        state.register_swapchain_images();

        log::info!("Vulkan backend initialized");
        Ok(Self {
            _entry: entry,
            instance,
            debug,
            surface_fn,
            surface,
            physical_device: selected.physical_device,
            queue_family: selected.queue_family,
            device,
            swapchain_fn,
            swapchain_settings: settings.swapchain.clone(),
            state: Mutex::new(state),
        })
    }

    fn surface_target(&self) -> SurfaceTarget<'_> {
        SurfaceTarget {
            device: &self.device,
            swapchain_fn: &self.swapchain_fn,
            surface_fn: &self.surface_fn,
            physical_device: self.physical_device,
            surface: self.surface,
        }
    }

    fn create_semaphore(&self) -> GraphicsResult<vk::Semaphore> {
        unsafe {
            self.device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
        }
        .map_err(|e| map_vk_error("create semaphore", e))
    }

    fn fence_signaled(&self, fence: vk::Fence) -> GraphicsResult<bool> {
        unsafe { self.device.get_fence_status(fence) }
            .map_err(|e| map_vk_error("query fence", e))
    }

}

/// # Safety
/// The context's last submission must have completed.
unsafe fn destroy_context(device: &ash::Device, context: &FrameContext) {
    unsafe {
        device.destroy_descriptor_pool(context.descriptor_pool, None);
        device.destroy_command_pool(context.command_pool, None);
        device.destroy_fence(context.fence, None);
        device.destroy_semaphore(context.image_available, None);
        device.destroy_semaphore(context.render_finished, None);
    }
}

impl GpuBackend for VulkanBackend {
    fn name(&self) -> &'static str {
        "vulkan"
    }

    fn create_buffer(&self, info: &BufferInfo, label: &str) -> GraphicsResult<DeviceBuffer> {
        // Buffers the device writes stay in device memory; everything else is
        // filled from the host.
        let location = if info
            .usage
            .intersects(BufferUsage::STORAGE_BUFFER | BufferUsage::TRANSFER_DST)
        {
            MemoryLocation::GpuOnly
        } else {
            MemoryLocation::CpuToGpu
        };
        let create_info = vk::BufferCreateInfo::default()
            .size(info.size.max(1))
            .usage(convert_buffer_usage(info.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let mut state = self.state.lock();
        let buffer = unsafe { self.device.create_buffer(&create_info, None) }
            .map_err(|e| map_vk_error("create buffer", e))?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let allocation = state.allocator().and_then(|allocator| {
            allocator
                .allocate(&AllocationCreateDesc {
                    name: label,
                    requirements,
                    location,
                    linear: true,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(|e| map_allocation_error(label, e))
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };
        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            unsafe { self.device.destroy_buffer(buffer, None) };
            if let Ok(allocator) = state.allocator() {
                let _ = allocator.free(allocation);
            }
            return Err(map_vk_error("bind buffer memory", e));
        }

        let id = state.next_id();
        state.buffers.insert(
            id,
            VulkanBuffer {
                buffer,
                allocation: Some(allocation),
                size: info.size,
            },
        );
        log::trace!("Created buffer '{label}' ({} bytes, {location:?})", info.size);
        Ok(DeviceBuffer(id))
    }

    fn destroy_buffer(&self, buffer: DeviceBuffer) {
        let mut state = self.state.lock();
        let Some(mut entry) = state.buffers.remove(&buffer.0) else {
            return;
        };
        unsafe { self.device.destroy_buffer(entry.buffer, None) };
        if let (Some(allocation), Ok(allocator)) = (entry.allocation.take(), state.allocator()) {
            if let Err(e) = allocator.free(allocation) {
                log::warn!("Failed to free buffer memory: {e}");
            }
        }
    }

    fn write_buffer(&self, buffer: DeviceBuffer, offset: u64, data: &[u8]) -> GraphicsResult<()> {
        let mut state = self.state.lock();
        let entry = state.buffers.get_mut(&buffer.0).ok_or_else(|| {
            GraphicsError::InvalidParameter(format!("unknown buffer {}", buffer.0))
        })?;
        let end = offset + data.len() as u64;
        if end > entry.size {
            return Err(GraphicsError::InvalidParameter(format!(
                "write of {} bytes at {offset} exceeds buffer size {}",
                data.len(),
                entry.size
            )));
        }
        let mapped = entry
            .allocation
            .as_mut()
            .and_then(|a| a.mapped_slice_mut())
            .ok_or_else(|| {
                GraphicsError::InvalidParameter(format!("buffer {} is not host visible", buffer.0))
            })?;
        mapped[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: DeviceBuffer, offset: u64, size: u64) -> GraphicsResult<Vec<u8>> {
        let state = self.state.lock();
        let entry = state.buffers.get(&buffer.0).ok_or_else(|| {
            GraphicsError::InvalidParameter(format!("unknown buffer {}", buffer.0))
        })?;
        let end = offset + size;
        if end > entry.size {
            return Err(GraphicsError::InvalidParameter(format!(
                "read of {size} bytes at {offset} exceeds buffer size {}",
                entry.size
            )));
        }
        let mapped = entry
            .allocation
            .as_ref()
            .and_then(|a| a.mapped_slice())
            .ok_or_else(|| {
                GraphicsError::InvalidParameter(format!("buffer {} is not host visible", buffer.0))
            })?;
        Ok(mapped[offset as usize..end as usize].to_vec())
    }

    fn create_image(&self, info: &ImageInfo, label: &str) -> GraphicsResult<DeviceImage> {
        let mut state = self.state.lock();
        let format = info.format.unwrap_or(state.swapchain.format);
        let vk_format = convert_texture_format(format);
        let three_d = info.extent.depth > 1;

        let create_info = vk::ImageCreateInfo::default()
            .image_type(if three_d {
                vk::ImageType::TYPE_3D
            } else {
                vk::ImageType::TYPE_2D
            })
            .format(vk_format)
            .extent(convert_extent_3d(info.extent))
            .mip_levels(info.mip_levels.max(1))
            .array_layers(info.array_layers.max(1))
            .samples(convert_samples(info.samples))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(convert_image_usage(info.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { self.device.create_image(&create_info, None) }
            .map_err(|e| map_vk_error("create image", e))?;
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let allocation = state.allocator().and_then(|allocator| {
            allocator
                .allocate(&AllocationCreateDesc {
                    name: label,
                    requirements,
                    location: MemoryLocation::GpuOnly,
                    linear: false,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(|e| map_allocation_error(label, e))
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let view_type = if three_d {
            vk::ImageViewType::TYPE_3D
        } else if info.array_layers > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        };
        let view_info = vk::ImageViewCreateInfo::default()
            .view_type(view_type)
            .format(vk_format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect_mask(format),
                base_mip_level: 0,
                level_count: info.mip_levels.max(1),
                base_array_layer: 0,
                layer_count: info.array_layers.max(1),
            });

        let bound = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        }
        .map_err(|e| map_vk_error("bind image memory", e))
        .and_then(|()| {
            unsafe { self.device.create_image_view(&view_info.image(image), None) }
                .map_err(|e| map_vk_error("create image view", e))
        });
        let view = match bound {
            Ok(view) => view,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                if let Ok(allocator) = state.allocator() {
                    let _ = allocator.free(allocation);
                }
                return Err(e);
            }
        };

        let id = state.next_id();
        state.images.insert(
            id,
            VulkanImage {
                image,
                view,
                allocation: Some(allocation),
                format,
                owned: true,
            },
        );
        log::trace!(
            "Created image '{label}' {}x{} {format:?}",
            info.extent.width,
            info.extent.height
        );
        Ok(DeviceImage(id))
    }

    fn destroy_image(&self, image: DeviceImage) {
        let mut state = self.state.lock();
        match state.images.get(&image.0) {
            Some(entry) if !entry.owned => {
                log::warn!("Ignoring destroy of swapchain image {}", image.0);
                return;
            }
            None => return,
            Some(_) => {}
        }
        let Some(mut entry) = state.images.remove(&image.0) else {
            return;
        };
        state.tracker.forget(entry.image);
        unsafe {
            self.device.destroy_image_view(entry.view, None);
            self.device.destroy_image(entry.image, None);
        }
        if let (Some(allocation), Ok(allocator)) = (entry.allocation.take(), state.allocator()) {
            if let Err(e) = allocator.free(allocation) {
                log::warn!("Failed to free image memory: {e}");
            }
        }
    }

    fn create_frame_context(&self, label: &str) -> GraphicsResult<FrameContextId> {
        let mut state = self.state.lock();
        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(self.queue_family);
        let command_pool = unsafe { self.device.create_command_pool(&pool_info, None) }
            .map_err(|e| map_vk_error("create command pool", e))?;
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| map_vk_error("allocate command buffer", e))?[0];

        let pool_sizes = [
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(DESCRIPTOR_SETS_PER_FRAME * 4),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(DESCRIPTOR_SETS_PER_FRAME),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::SAMPLED_IMAGE)
                .descriptor_count(DESCRIPTOR_SETS_PER_FRAME),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(DESCRIPTOR_SETS_PER_FRAME),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::SAMPLER)
                .descriptor_count(DESCRIPTOR_SETS_PER_FRAME),
        ];
        let descriptor_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(DESCRIPTOR_SETS_PER_FRAME)
            .pool_sizes(&pool_sizes);
        let descriptor_pool = unsafe { self.device.create_descriptor_pool(&descriptor_info, None) }
            .map_err(|e| map_vk_error("create descriptor pool", e))?;

        let fence = unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default(), None)
        }
        .map_err(|e| map_vk_error("create fence", e))?;

        let context = FrameContext {
            command_pool,
            command_buffer,
            descriptor_pool,
            fence,
            image_available: self.create_semaphore()?,
            render_finished: self.create_semaphore()?,
            submitted: false,
            acquired: None,
        };
        let id = state.next_id();
        state.contexts.insert(id, context);
        log::debug!("Created frame context '{label}'");
        Ok(FrameContextId(id))
    }

    fn destroy_frame_context(&self, context: FrameContextId) {
        let Some(entry) = self.state.lock().contexts.remove(&context.0) else {
            return;
        };
        unsafe {
            if entry.submitted {
                let _ = self.device.wait_for_fences(&[entry.fence], true, u64::MAX);
            }
            destroy_context(&self.device, &entry);
        }
    }

    fn poll_frame(&self, context: FrameContextId) -> GraphicsResult<bool> {
        let entry = self.state.lock().context(context)?;
        if !entry.submitted {
            return Ok(true);
        }
        self.fence_signaled(entry.fence)
    }

    fn wait_frame(&self, context: FrameContextId, timeout: Duration) -> GraphicsResult<bool> {
        let entry = self.state.lock().context(context)?;
        if !entry.submitted {
            return Ok(true);
        }
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        match unsafe { self.device.wait_for_fences(&[entry.fence], true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(map_vk_error("wait for frame fence", e)),
        }
    }

    fn reset_frame(&self, context: FrameContextId) -> GraphicsResult<()> {
        let mut state = self.state.lock();
        let entry = state.context(context)?;
        if entry.submitted && !self.fence_signaled(entry.fence)? {
            return Err(GraphicsError::InvalidParameter(format!(
                "frame context {} is still executing",
                context.0
            )));
        }
        unsafe {
            self.device
                .reset_command_pool(entry.command_pool, vk::CommandPoolResetFlags::empty())
                .map_err(|e| map_vk_error("reset command pool", e))?;
            self.device
                .reset_descriptor_pool(entry.descriptor_pool, vk::DescriptorPoolResetFlags::empty())
                .map_err(|e| map_vk_error("reset descriptor pool", e))?;
            if entry.submitted {
                self.device
                    .reset_fences(&[entry.fence])
                    .map_err(|e| map_vk_error("reset fence", e))?;
            }
        }
        if let Some(stored) = state.contexts.get_mut(&context.0) {
            stored.submitted = false;
        }
        Ok(())
    }

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc<'_>,
    ) -> GraphicsResult<DevicePipeline> {
        let mut state = self.state.lock();
        let layout = state.layouts.get_or_create(&self.device, desc.layout)?;
        let (pipeline, cache) = pipeline::create_graphics_pipeline(&self.device, desc, layout.layout)?;
        let id = state.next_id();
        state.pipelines.insert(
            id,
            VulkanPipeline {
                pipeline,
                cache,
                layout,
                bind_point: vk::PipelineBindPoint::GRAPHICS,
            },
        );
        log::debug!(
            "Created graphics pipeline '{}'{}",
            desc.label,
            if desc.cache_data.is_some() { " from cache" } else { "" }
        );
        Ok(DevicePipeline(id))
    }

    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc<'_>,
    ) -> GraphicsResult<DevicePipeline> {
        let mut state = self.state.lock();
        let layout = state.layouts.get_or_create(&self.device, desc.layout)?;
        let (pipeline, cache) = pipeline::create_compute_pipeline(&self.device, desc, layout.layout)?;
        let id = state.next_id();
        state.pipelines.insert(
            id,
            VulkanPipeline {
                pipeline,
                cache,
                layout,
                bind_point: vk::PipelineBindPoint::COMPUTE,
            },
        );
        log::debug!("Created compute pipeline '{}'", desc.label);
        Ok(DevicePipeline(id))
    }

    fn pipeline_cache_data(&self, pipeline: DevicePipeline) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let entry = state.pipelines.get(&pipeline.0)?;
        match unsafe { self.device.get_pipeline_cache_data(entry.cache) } {
            Ok(data) => Some(data),
            Err(e) => {
                log::warn!("Failed to read pipeline cache data: {e:?}");
                None
            }
        }
    }

    fn destroy_pipeline(&self, pipeline: DevicePipeline) {
        let Some(entry) = self.state.lock().pipelines.remove(&pipeline.0) else {
            return;
        };
        unsafe {
            self.device.destroy_pipeline(entry.pipeline, None);
            self.device.destroy_pipeline_cache(entry.cache, None);
        }
    }

    fn swapchain_info(&self) -> Option<SwapchainInfo> {
        Some(self.state.lock().swapchain.info())
    }

    fn acquire_swapchain_image(&self, context: FrameContextId) -> GraphicsResult<SwapchainImage> {
        let mut state = self.state.lock();
        let entry = state.context(context)?;

        // An image acquired for a dropped frame is reused by the next one.
        let index = match entry.acquired {
            Some(index) => index,
            None => {
                let acquired = unsafe {
                    self.swapchain_fn.acquire_next_image(
                        state.swapchain.swapchain,
                        u64::MAX,
                        entry.image_available,
                        vk::Fence::null(),
                    )
                };
                let (index, suboptimal) = match acquired {
                    Ok(result) => result,
                    Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                        return Err(GraphicsError::SwapchainOutOfDate)
                    }
                    Err(e) => return Err(map_vk_error("acquire swapchain image", e)),
                };
                if suboptimal {
                    log::debug!("Acquired image {index} from a suboptimal swapchain");
                }
                if let Some(stored) = state.contexts.get_mut(&context.0) {
                    stored.acquired = Some(index);
                }
                index
            }
        };

        let id = state.swapchain_ids.get(index as usize).copied().ok_or_else(|| {
            GraphicsError::InvalidParameter(format!("swapchain index {index} out of range"))
        })?;
        Ok(SwapchainImage {
            index,
            image: DeviceImage(id),
        })
    }

    fn reset_swapchain(&self, extent: Option<Extent3d>) -> GraphicsResult<SwapchainInfo> {
        unsafe { self.device.device_wait_idle() }
            .map_err(|e| map_vk_error("wait for device idle", e))?;

        let mut state = self.state.lock();
        let extent = extent.unwrap_or_else(|| state.swapchain.info().extent);
        let chain = VulkanSwapchain::new(
            &self.surface_target(),
            &self.swapchain_settings,
            extent,
            state.swapchain.swapchain,
        )?;
        let mut old = std::mem::replace(&mut state.swapchain, chain);
        state.unregister_swapchain_images();
        old.destroy(&self.device, &self.swapchain_fn);
        state.register_swapchain_images();

        // Pending acquire signals refer to the old swapchain.
        let stale: Vec<u64> = state
            .contexts
            .iter()
            .filter(|(_, c)| c.acquired.is_some())
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            let semaphore = self.create_semaphore()?;
            if let Some(context) = state.contexts.get_mut(&id) {
                unsafe { self.device.destroy_semaphore(context.image_available, None) };
                context.image_available = semaphore;
                context.acquired = None;
            }
        }

        Ok(state.swapchain.info())
    }

    fn submit(
        &self,
        context: FrameContextId,
        commands: &[DeviceCommand],
        present: Option<SwapchainImage>,
    ) -> GraphicsResult<PresentStatus> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let entry = state.context(context)?;
        if entry.submitted {
            return Err(GraphicsError::InvalidParameter(format!(
                "frame context {} is already in flight",
                context.0
            )));
        }
        if let Some(image) = present {
            if entry.acquired != Some(image.index) {
                return Err(GraphicsError::InvalidParameter(format!(
                    "swapchain image {} was not acquired by frame context {}",
                    image.index, context.0
                )));
            }
        }

        let cmd = entry.command_buffer;
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(cmd, &begin_info) }
            .map_err(|e| map_vk_error("begin command buffer", e))?;

        let mut recorder = Recorder {
            device: &self.device,
            cmd,
            descriptor_pool: entry.descriptor_pool,
            state: &mut *state,
            batch: BarrierBatch::new(),
            bound: None,
            pending: BTreeMap::new(),
        };
        for command in commands {
            recorder.record(command)?;
        }
        if let Some(image) = present {
            recorder.prepare_present(image.image)?;
        }
        recorder.finish();

        unsafe { self.device.end_command_buffer(cmd) }
            .map_err(|e| map_vk_error("end command buffer", e))?;

        let wait = [vk::SemaphoreSubmitInfo::default()
            .semaphore(entry.image_available)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        let signal = [vk::SemaphoreSubmitInfo::default()
            .semaphore(entry.render_finished)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        let command_buffers = [vk::CommandBufferSubmitInfo::default().command_buffer(cmd)];
        let mut submit_info =
            vk::SubmitInfo2::default().command_buffer_infos(&command_buffers);
        if entry.acquired.is_some() {
            submit_info = submit_info.wait_semaphore_infos(&wait);
        }
        if present.is_some() {
            submit_info = submit_info.signal_semaphore_infos(&signal);
        }

        unsafe {
            self.device
                .queue_submit2(state.queue, &[submit_info], entry.fence)
        }
        .map_err(|e| map_vk_error("submit frame", e))?;
        if let Some(stored) = state.contexts.get_mut(&context.0) {
            stored.submitted = true;
            stored.acquired = None;
        }

        let Some(image) = present else {
            return Ok(PresentStatus::NotRequested);
        };
        let wait_semaphores = [entry.render_finished];
        let swapchains = [state.swapchain.swapchain];
        let indices = [image.index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&indices);
        match unsafe { self.swapchain_fn.queue_present(state.queue, &present_info) } {
            Ok(false) => Ok(PresentStatus::Presented),
            Ok(true) => Ok(PresentStatus::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentStatus::OutOfDate),
            Err(e) => Err(map_vk_error("present", e)),
        }
    }

    fn wait_idle(&self) -> GraphicsResult<()> {
        // Queue access must be externally synchronized.
        let _state = self.state.lock();
        unsafe { self.device.device_wait_idle() }.map_err(|e| map_vk_error("wait for device idle", e))
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            let state = self.state.get_mut();

            for (_, context) in state.contexts.drain() {
                destroy_context(&self.device, &context);
            }
            for (_, pipeline) in state.pipelines.drain() {
                self.device.destroy_pipeline(pipeline.pipeline, None);
                self.device.destroy_pipeline_cache(pipeline.cache, None);
            }
            state.layouts.destroy(&self.device);

            if let Some(allocator) = state.allocator.as_mut() {
                for (_, mut buffer) in state.buffers.drain() {
                    self.device.destroy_buffer(buffer.buffer, None);
                    if let Some(allocation) = buffer.allocation.take() {
                        let _ = allocator.free(allocation);
                    }
                }
                for (_, mut image) in state.images.drain() {
                    if !image.owned {
                        continue;
                    }
                    self.device.destroy_image_view(image.view, None);
                    self.device.destroy_image(image.image, None);
                    if let Some(allocation) = image.allocation.take() {
                        let _ = allocator.free(allocation);
                    }
                }
            }
            // The allocator must go before the device.
            drop(state.allocator.take());

            state.swapchain.destroy(&self.device, &self.swapchain_fn);
            self.device.destroy_device(None);
            self.surface_fn.destroy_surface(self.surface, None);
            if let Some(debug) = &self.debug {
                debug.destroy();
            }
            self.instance.destroy_instance(None);
        }
        log::info!("Vulkan backend destroyed");
    }
}

// ============================================================================
// Command recording
// ============================================================================

struct BoundPipeline {
    bind_point: vk::PipelineBindPoint,
    layout: LayoutEntry,
}

/// Records a resolved command stream into one command buffer.
struct Recorder<'a> {
    device: &'a ash::Device,
    cmd: vk::CommandBuffer,
    descriptor_pool: vk::DescriptorPool,
    state: &'a mut VulkanState,
    batch: BarrierBatch,
    bound: Option<BoundPipeline>,
    /// Uniform bindings set since the last draw, by descriptor set.
    pending: BTreeMap<u32, Vec<(u32, vk::DescriptorBufferInfo)>>,
}

impl Recorder<'_> {
    fn record(&mut self, command: &DeviceCommand) -> GraphicsResult<()> {
        let device = self.device;
        let cmd = self.cmd;
        match command {
            DeviceCommand::Barrier(barrier) => match barrier.resource {
                BarrierResource::Buffer(buffer) => {
                    let buffer = self.state.buffer(buffer)?;
                    self.batch.add_buffer_barrier(buffer, &barrier.src, &barrier.dst);
                }
                BarrierResource::Image { image, format } => {
                    let image = self.state.image(image)?.image;
                    if barrier.hazard == Hazard::Alias {
                        self.state.tracker.forget(image);
                    }
                    self.batch.add_image_barrier(
                        &mut self.state.tracker,
                        image,
                        aspect_mask(format),
                        &barrier.src,
                        &barrier.dst,
                    );
                }
            },
            DeviceCommand::BeginRendering {
                colors,
                depth,
                extent,
            } => self.begin_rendering(colors, depth.as_ref(), *extent)?,
            DeviceCommand::EndRendering => unsafe { device.cmd_end_rendering(cmd) },
            DeviceCommand::BindGraphicsPipeline(pipeline)
            | DeviceCommand::BindComputePipeline(pipeline) => {
                let entry = self.state.pipelines.get(&pipeline.0).ok_or_else(|| {
                    GraphicsError::InvalidParameter(format!("unknown pipeline {}", pipeline.0))
                })?;
                unsafe { device.cmd_bind_pipeline(cmd, entry.bind_point, entry.pipeline) };
                self.bound = Some(BoundPipeline {
                    bind_point: entry.bind_point,
                    layout: entry.layout.clone(),
                });
                self.pending.clear();
            }
            DeviceCommand::SetViewport(viewport) => {
                let viewport = vk::Viewport {
                    x: viewport.x,
                    y: viewport.y,
                    width: viewport.width,
                    height: viewport.height,
                    min_depth: viewport.min_depth,
                    max_depth: viewport.max_depth,
                };
                unsafe { device.cmd_set_viewport(cmd, 0, &[viewport]) };
            }
            DeviceCommand::SetScissor(scissor) => {
                let rect = vk::Rect2D {
                    offset: vk::Offset2D {
                        x: scissor.x,
                        y: scissor.y,
                    },
                    extent: vk::Extent2D {
                        width: scissor.width,
                        height: scissor.height,
                    },
                };
                unsafe { device.cmd_set_scissor(cmd, 0, &[rect]) };
            }
            DeviceCommand::BindVertexBuffers {
                first_binding,
                buffers,
            } => {
                let handles = buffers
                    .iter()
                    .map(|(buffer, _)| self.state.buffer(*buffer))
                    .collect::<GraphicsResult<Vec<_>>>()?;
                let offsets: Vec<u64> = buffers.iter().map(|(_, offset)| *offset).collect();
                unsafe { device.cmd_bind_vertex_buffers(cmd, *first_binding, &handles, &offsets) };
            }
            DeviceCommand::BindIndexBuffer {
                buffer,
                offset,
                index_type,
            } => {
                let buffer = self.state.buffer(*buffer)?;
                unsafe {
                    device.cmd_bind_index_buffer(cmd, buffer, *offset, convert_index_type(*index_type))
                };
            }
            DeviceCommand::BindUniformBuffer {
                set,
                binding,
                buffer,
                offset,
                size,
            } => {
                let buffer = self.state.buffer(*buffer)?;
                self.pending.entry(*set).or_default().push((
                    *binding,
                    vk::DescriptorBufferInfo {
                        buffer,
                        offset: *offset,
                        range: *size,
                    },
                ));
            }
            DeviceCommand::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            } => {
                self.prepare_work()?;
                unsafe {
                    device.cmd_draw(cmd, *vertex_count, *instance_count, *first_vertex, *first_instance)
                };
            }
            DeviceCommand::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            } => {
                self.prepare_work()?;
                unsafe {
                    device.cmd_draw_indexed(
                        cmd,
                        *index_count,
                        *instance_count,
                        *first_index,
                        *vertex_offset,
                        *first_instance,
                    )
                };
            }
            DeviceCommand::Dispatch { x, y, z } => {
                self.prepare_work()?;
                unsafe { device.cmd_dispatch(cmd, *x, *y, *z) };
            }
            DeviceCommand::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                let src = self.state.buffer(*src)?;
                let dst = self.state.buffer(*dst)?;
                self.batch.flush(device, cmd);
                let region = vk::BufferCopy {
                    src_offset: *src_offset,
                    dst_offset: *dst_offset,
                    size: *size,
                };
                unsafe { device.cmd_copy_buffer(cmd, src, dst, &[region]) };
            }
            DeviceCommand::CopyBufferToImage {
                src,
                src_offset,
                dst,
                format,
                extent,
                mip_level,
            } => {
                let src = self.state.buffer(*src)?;
                let image = self.state.image(*dst)?.image;
                let aspect = aspect_mask(*format);
                self.batch.transition(
                    &mut self.state.tracker,
                    image,
                    aspect,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    SyncPoint {
                        stages: vk::PipelineStageFlags2::ALL_TRANSFER,
                        access: vk::AccessFlags2::TRANSFER_WRITE,
                    },
                );
                self.batch.flush(device, cmd);
                let region = vk::BufferImageCopy {
                    buffer_offset: *src_offset,
                    buffer_row_length: 0,
                    buffer_image_height: 0,
                    image_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: aspect,
                        mip_level: *mip_level,
                        base_array_layer: 0,
                        layer_count: 1,
                    },
                    image_offset: vk::Offset3D::default(),
                    image_extent: convert_extent_3d(*extent),
                };
                unsafe {
                    device.cmd_copy_buffer_to_image(
                        cmd,
                        src,
                        image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    )
                };
            }
        }
        Ok(())
    }

    fn begin_rendering(
        &mut self,
        colors: &[RenderTarget],
        depth: Option<&RenderTarget>,
        extent: Extent3d,
    ) -> GraphicsResult<()> {
        let color_sync = SyncPoint {
            stages: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            access: vk::AccessFlags2::COLOR_ATTACHMENT_READ
                | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        };
        let depth_sync = SyncPoint {
            stages: vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
            access: vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
        };

        let mut color_attachments = Vec::with_capacity(colors.len());
        for target in colors {
            let (image, view) = {
                let entry = self.state.image(target.image)?;
                (entry.image, entry.view)
            };
            self.batch.transition(
                &mut self.state.tracker,
                image,
                aspect_mask(target.format),
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                color_sync,
            );
            color_attachments.push(
                vk::RenderingAttachmentInfo::default()
                    .image_view(view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(convert_load_op(target.load_op))
                    .store_op(convert_store_op(target.store_op))
                    .clear_value(convert_clear_value(target.load_op)),
            );
        }

        let depth_attachment = match depth {
            Some(target) => {
                let (image, view) = {
                    let entry = self.state.image(target.image)?;
                    (entry.image, entry.view)
                };
                self.batch.transition(
                    &mut self.state.tracker,
                    image,
                    aspect_mask(target.format),
                    vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                    depth_sync,
                );
                Some((
                    target.format.has_stencil(),
                    vk::RenderingAttachmentInfo::default()
                        .image_view(view)
                        .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                        .load_op(convert_load_op(target.load_op))
                        .store_op(convert_store_op(target.store_op))
                        .clear_value(convert_clear_value(target.load_op)),
                ))
            }
            None => None,
        };
        self.batch.flush(self.device, self.cmd);

        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: convert_extent_2d(extent),
            })
            .layer_count(1)
            .color_attachments(&color_attachments);
        if let Some((has_stencil, attachment)) = &depth_attachment {
            rendering_info = rendering_info.depth_attachment(attachment);
            if *has_stencil {
                rendering_info = rendering_info.stencil_attachment(attachment);
            }
        }
        unsafe { self.device.cmd_begin_rendering(self.cmd, &rendering_info) };
        Ok(())
    }

    /// Flush barriers and bind pending uniform buffers before a draw or dispatch.
    fn prepare_work(&mut self) -> GraphicsResult<()> {
        self.batch.flush(self.device, self.cmd);
        if self.pending.is_empty() {
            return Ok(());
        }
        let Some(bound) = &self.bound else {
            self.pending.clear();
            return Ok(());
        };

        for (set, bindings) in std::mem::take(&mut self.pending) {
            let Some(&set_layout) = bound.layout.set_layouts.get(set as usize) else {
                log::warn!("Uniform binding for descriptor set {set} not in pipeline layout");
                continue;
            };
            let layouts = [set_layout];
            let alloc_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(self.descriptor_pool)
                .set_layouts(&layouts);
            let descriptor_set = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }
                .map_err(|e| map_vk_error("allocate descriptor set", e))?[0];

            let writes: Vec<vk::WriteDescriptorSet> = bindings
                .iter()
                .map(|(binding, info)| {
                    vk::WriteDescriptorSet::default()
                        .dst_set(descriptor_set)
                        .dst_binding(*binding)
                        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                        .buffer_info(std::slice::from_ref(info))
                })
                .collect();
            unsafe {
                self.device.update_descriptor_sets(&writes, &[]);
                self.device.cmd_bind_descriptor_sets(
                    self.cmd,
                    bound.bind_point,
                    bound.layout.layout,
                    set,
                    &[descriptor_set],
                    &[],
                );
            }
        }
        Ok(())
    }

    fn prepare_present(&mut self, image: DeviceImage) -> GraphicsResult<()> {
        let image = self.state.image(image)?.image;
        self.batch.transition(
            &mut self.state.tracker,
            image,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::PRESENT_SRC_KHR,
            SyncPoint::NONE,
        );
        Ok(())
    }

    fn finish(mut self) {
        self.batch.flush(self.device, self.cmd);
    }
}
