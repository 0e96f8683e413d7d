//! Vulkan physical and logical device selection.

use std::ffi::{CStr, CString};

use ash::vk;

use crate::error::{GraphicsError, GraphicsResult};

/// A physical device together with the queue family used for everything.
#[derive(Debug, Clone, Copy)]
pub struct SelectedDevice {
    pub physical_device: vk::PhysicalDevice,
    pub queue_family: u32,
}

/// Pick the best device that can render and present to `surface`.
///
/// Discrete GPUs are preferred over integrated ones. Devices older than
/// Vulkan 1.3 are skipped.
pub fn select_physical_device(
    instance: &ash::Instance,
    surface_fn: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
) -> GraphicsResult<SelectedDevice> {
    let devices = unsafe { instance.enumerate_physical_devices() }.map_err(|e| {
        GraphicsError::InitializationFailed(format!("Failed to enumerate physical devices: {e:?}"))
    })?;
    if devices.is_empty() {
        return Err(GraphicsError::InitializationFailed(
            "No Vulkan-capable GPU found".to_string(),
        ));
    }

    let mut best: Option<(u32, SelectedDevice)> = None;
    for physical_device in devices {
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        // SAFETY: device_name is a null-terminated string filled in by the driver
        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) };

        if properties.api_version < vk::make_api_version(0, 1, 3, 0) {
            log::info!("Skipping GPU {name:?}: Vulkan 1.3 not supported");
            continue;
        }
        let Some(queue_family) =
            find_queue_family(instance, surface_fn, surface, physical_device)
        else {
            log::info!("Skipping GPU {name:?}: no queue family can render and present");
            continue;
        };

        let mut score = match properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            _ => 1,
        };
        score += properties.limits.max_image_dimension2_d / 1024;
        log::info!(
            "Found GPU: {name:?} (type: {:?}, score: {score})",
            properties.device_type
        );

        if best.map_or(true, |(best_score, _)| score > best_score) {
            best = Some((
                score,
                SelectedDevice {
                    physical_device,
                    queue_family,
                },
            ));
        }
    }

    best.map(|(_, device)| device)
        .ok_or_else(|| GraphicsError::InitializationFailed("No suitable GPU found".to_string()))
}

fn find_queue_family(
    instance: &ash::Instance,
    surface_fn: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
) -> Option<u32> {
    let families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    families.iter().enumerate().find_map(|(index, family)| {
        let index = index as u32;
        let graphics = family
            .queue_flags
            .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE);
        let present = unsafe {
            surface_fn.get_physical_device_surface_support(physical_device, index, surface)
        }
        .unwrap_or(false);
        (graphics && present).then_some(index)
    })
}

/// Create the logical device with dynamic rendering and synchronization2.
///
/// `requested_extensions` are enabled in addition to the swapchain extension.
pub fn create_logical_device(
    instance: &ash::Instance,
    selected: SelectedDevice,
    requested_extensions: &[String],
) -> GraphicsResult<ash::Device> {
    let queue_priorities = [1.0f32];
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(selected.queue_family)
        .queue_priorities(&queue_priorities)];

    let requested = requested_extensions
        .iter()
        .map(|name| {
            CString::new(name.as_str()).map_err(|_| {
                GraphicsError::InvalidParameter(format!("Invalid device extension name {name:?}"))
            })
        })
        .collect::<GraphicsResult<Vec<_>>>()?;
    let mut extensions = vec![ash::khr::swapchain::NAME.as_ptr()];
    extensions.extend(requested.iter().map(|name| name.as_ptr()));

    let mut vulkan_13_features = vk::PhysicalDeviceVulkan13Features::default()
        .dynamic_rendering(true)
        .synchronization2(true);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extensions)
        .push_next(&mut vulkan_13_features);

    unsafe { instance.create_device(selected.physical_device, &create_info, None) }.map_err(|e| {
        GraphicsError::InitializationFailed(format!("Failed to create logical device: {e:?}"))
    })
}
