//! Vulkan swapchain creation and teardown.

use ash::vk;

use super::conversion::{
    convert_extent_2d, convert_present_mode, convert_texture_format, texture_format_from_vk,
};
use crate::backend::SwapchainInfo;
use crate::config::SwapchainSettings;
use crate::error::{GraphicsError, GraphicsResult};
use crate::types::{Extent3d, TextureFormat};

const PREFERRED_FORMAT: TextureFormat = TextureFormat::Bgra8UnormSrgb;

/// Device and surface handles a swapchain is built from.
pub struct SurfaceTarget<'a> {
    pub device: &'a ash::Device,
    pub swapchain_fn: &'a ash::khr::swapchain::Device,
    pub surface_fn: &'a ash::khr::surface::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub surface: vk::SurfaceKHR,
}

/// Swapchain images and their views.
pub struct VulkanSwapchain {
    pub(crate) swapchain: vk::SwapchainKHR,
    pub(crate) images: Vec<vk::Image>,
    pub(crate) views: Vec<vk::ImageView>,
    pub(crate) format: TextureFormat,
    pub(crate) extent: vk::Extent2D,
}

impl VulkanSwapchain {
    /// Create a swapchain, retiring `old` if it is not null.
    ///
    /// `extent` is only used when the surface leaves the choice to the
    /// application.
    pub fn new(
        target: &SurfaceTarget<'_>,
        settings: &SwapchainSettings,
        extent: Extent3d,
        old: vk::SwapchainKHR,
    ) -> GraphicsResult<Self> {
        let surface_error = |what: &str, e: vk::Result| {
            GraphicsError::InitializationFailed(format!("Failed to query surface {what}: {e:?}"))
        };
        let capabilities = unsafe {
            target
                .surface_fn
                .get_physical_device_surface_capabilities(target.physical_device, target.surface)
        }
        .map_err(|e| surface_error("capabilities", e))?;
        let formats = unsafe {
            target
                .surface_fn
                .get_physical_device_surface_formats(target.physical_device, target.surface)
        }
        .map_err(|e| surface_error("formats", e))?;
        let present_modes = unsafe {
            target
                .surface_fn
                .get_physical_device_surface_present_modes(target.physical_device, target.surface)
        }
        .map_err(|e| surface_error("present modes", e))?;

        let (surface_format, format) = formats
            .iter()
            .find(|f| f.format == convert_texture_format(PREFERRED_FORMAT))
            .map(|f| (*f, PREFERRED_FORMAT))
            .or_else(|| {
                formats
                    .iter()
                    .find_map(|f| texture_format_from_vk(f.format).map(|format| (*f, format)))
            })
            .ok_or_else(|| {
                GraphicsError::InitializationFailed(
                    "Surface supports no usable color format".to_string(),
                )
            })?;

        let present_mode = convert_present_mode(settings.present_mode);
        let present_mode = if present_modes.contains(&present_mode) {
            present_mode
        } else {
            log::warn!("Present mode {present_mode:?} unsupported, falling back to FIFO");
            vk::PresentModeKHR::FIFO
        };

        let extent = if capabilities.current_extent.width != u32::MAX {
            capabilities.current_extent
        } else {
            let wanted = convert_extent_2d(extent);
            vk::Extent2D {
                width: wanted.width.clamp(
                    capabilities.min_image_extent.width,
                    capabilities.max_image_extent.width,
                ),
                height: wanted.height.clamp(
                    capabilities.min_image_extent.height,
                    capabilities.max_image_extent.height,
                ),
            }
        };
        if extent.width == 0 || extent.height == 0 {
            return Err(GraphicsError::SwapchainOutOfDate);
        }

        let max_images = if capabilities.max_image_count > 0 {
            capabilities.max_image_count
        } else {
            u32::MAX
        };
        let image_count = settings
            .image_count_hint
            .clamp(capabilities.min_image_count, max_images);

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(target.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old);

        let swapchain = unsafe { target.swapchain_fn.create_swapchain(&create_info, None) }
            .map_err(|e| super::map_vk_error("create swapchain", e))?;
        let images = match unsafe { target.swapchain_fn.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { target.swapchain_fn.destroy_swapchain(swapchain, None) };
                return Err(super::map_vk_error("get swapchain images", e));
            }
        };

        let mut chain = Self {
            swapchain,
            images,
            views: Vec::new(),
            format,
            extent,
        };
        for &image in &chain.images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(surface_format.format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            match unsafe { target.device.create_image_view(&view_info, None) } {
                Ok(view) => chain.views.push(view),
                Err(e) => {
                    chain.destroy(target.device, target.swapchain_fn);
                    return Err(super::map_vk_error("create swapchain image view", e));
                }
            }
        }

        log::info!(
            "Created Vulkan swapchain: {}x{} {:?} with {} images, {:?}",
            extent.width,
            extent.height,
            format,
            chain.images.len(),
            present_mode
        );
        Ok(chain)
    }

    pub fn info(&self) -> SwapchainInfo {
        SwapchainInfo {
            extent: Extent3d::new_2d(self.extent.width, self.extent.height),
            format: self.format,
            image_count: self.images.len() as u32,
        }
    }

    /// Destroy the views and the swapchain. The device must be idle.
    pub fn destroy(&mut self, device: &ash::Device, swapchain_fn: &ash::khr::swapchain::Device) {
        if self.swapchain == vk::SwapchainKHR::null() {
            return;
        }
        unsafe {
            for view in self.views.drain(..) {
                device.destroy_image_view(view, None);
            }
            swapchain_fn.destroy_swapchain(self.swapchain, None);
        }
        self.images.clear();
        self.swapchain = vk::SwapchainKHR::null();
    }
}
