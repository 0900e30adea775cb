use std::{ffi::c_char, sync::Arc};

use anyhow::Context;
use ash::vk;

use super::physical::{DEVICE_EXTENSIONS, QueueFamiliesIndices};

/// Creates the logical device with the features the frame path depends on:
/// synchronization2 and dynamic rendering from Vulkan 1.3, plus anisotropic
/// filtering. One queue per distinct family.
pub fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_families: QueueFamiliesIndices,
) -> anyhow::Result<(Arc<ash::Device>, vk::Queue, vk::Queue)> {
    let queue_priorities = [1.0f32];
    let queue_create_infos = {
        let mut indices = vec![queue_families.graphics_index, queue_families.present_index];
        indices.dedup();

        indices
            .into_iter()
            .map(|index| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(index)
                    .queue_priorities(&queue_priorities)
            })
            .collect::<Vec<_>>()
    };

    let extension_ptrs: Vec<*const c_char> =
        DEVICE_EXTENSIONS.iter().map(|ext| ext.as_ptr()).collect();

    let features = vk::PhysicalDeviceFeatures::default().sampler_anisotropy(true);
    let mut features13 = vk::PhysicalDeviceVulkan13Features::default()
        .synchronization2(true)
        .dynamic_rendering(true);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_ptrs)
        .enabled_features(&features)
        .push_next(&mut features13);

    let device = Arc::new(unsafe {
        instance
            .create_device(physical_device, &create_info, None)
            .context("failed to create logical device")?
    });
    let graphics_queue =
        unsafe { device.get_device_queue(queue_families.graphics_index, 0) };
    let present_queue = unsafe { device.get_device_queue(queue_families.present_index, 0) };

    log::trace!("Created logical device");

    Ok((device, graphics_queue, present_queue))
}
