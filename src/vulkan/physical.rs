use std::ffi::CStr;

use anyhow::Context;
use ash::vk;

use super::surface::SwapchainSupportDetails;

/// Device extensions the engine cannot run without; also enabled at logical
/// device creation.
pub(super) const DEVICE_EXTENSIONS: [&CStr; 1] = [ash::khr::swapchain::NAME];

#[derive(Clone, Copy)]
pub struct QueueFamiliesIndices {
    pub graphics_index: u32,
    pub present_index: u32,
}

struct Candidate {
    device: vk::PhysicalDevice,
    families: QueueFamiliesIndices,
    discrete: bool,
    name: String,
}

/// Picks the device to run on: every device is evaluated against the
/// engine's requirements, and a discrete GPU wins over an integrated one
/// when both qualify.
pub fn pick_physical_device(
    instance: &ash::Instance,
    surface: &ash::khr::surface::Instance,
    surface_khr: vk::SurfaceKHR,
) -> anyhow::Result<(vk::PhysicalDevice, QueueFamiliesIndices)> {
    let devices = unsafe {
        instance
            .enumerate_physical_devices()
            .context("failed to enumerate physical devices")?
    };

    let mut candidates: Vec<Candidate> = devices
        .into_iter()
        .filter_map(|device| evaluate(instance, surface, surface_khr, device))
        .collect();
    candidates.sort_by_key(|c| !c.discrete);

    let chosen = candidates
        .into_iter()
        .next()
        .context("no suitable physical device found")?;
    log::debug!("Selected physical device: {}", chosen.name);

    Ok((chosen.device, chosen.families))
}

/// `None` when the device misses any requirement: graphics and present
/// queue families, the required extensions, an adequate surface, and
/// anisotropic filtering.
fn evaluate(
    instance: &ash::Instance,
    surface: &ash::khr::surface::Instance,
    surface_khr: vk::SurfaceKHR,
    device: vk::PhysicalDevice,
) -> Option<Candidate> {
    let families = find_queue_families(instance, surface, surface_khr, device)?;

    if !supports_required_extensions(instance, device) {
        return None;
    }

    let surface_adequate = match SwapchainSupportDetails::new(device, surface, surface_khr) {
        Ok(details) => !details.formats.is_empty() && !details.present_modes.is_empty(),
        Err(e) => {
            log::warn!("failed to query surface support: {e:?}");
            false
        }
    };
    if !surface_adequate {
        return None;
    }

    let features = unsafe { instance.get_physical_device_features(device) };
    if features.sampler_anisotropy != vk::TRUE {
        return None;
    }

    let props = unsafe { instance.get_physical_device_properties(device) };
    let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
        .to_string_lossy()
        .into_owned();

    Some(Candidate {
        device,
        families,
        discrete: props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU,
        name,
    })
}

fn find_queue_families(
    instance: &ash::Instance,
    surface: &ash::khr::surface::Instance,
    surface_khr: vk::SurfaceKHR,
    device: vk::PhysicalDevice,
) -> Option<QueueFamiliesIndices> {
    let mut graphics = None;
    let mut present = None;

    let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
    for (index, family) in families.iter().enumerate() {
        if family.queue_count == 0 {
            continue;
        }
        let index = index as u32;

        if graphics.is_none() && family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
            graphics = Some(index);
        }

        if present.is_none() {
            match unsafe {
                surface.get_physical_device_surface_support(device, index, surface_khr)
            } {
                Ok(true) => present = Some(index),
                Ok(false) => {}
                Err(e) => {
                    log::warn!("failed to query present support for queue family {index}: {e}");
                }
            }
        }

        if let (Some(graphics_index), Some(present_index)) = (graphics, present) {
            return Some(QueueFamiliesIndices {
                graphics_index,
                present_index,
            });
        }
    }

    None
}

fn supports_required_extensions(instance: &ash::Instance, device: vk::PhysicalDevice) -> bool {
    let available = match unsafe { instance.enumerate_device_extension_properties(device) } {
        Ok(props) => props,
        Err(e) => {
            log::warn!("failed to enumerate device extensions: {e}");
            return false;
        }
    };

    DEVICE_EXTENSIONS.iter().all(|required| {
        let found = available
            .iter()
            .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == *required);
        if !found {
            log::warn!(
                "required device extension missing: {}",
                required.to_string_lossy()
            );
        }
        found
    })
}
