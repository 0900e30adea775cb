use std::ffi::c_char;

use anyhow::Context;
use ash::{ext::debug_utils, vk};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use winit::window::Window;

use super::debug;

/// Everything instance creation yields, handed to [`VulkanContext`] to own.
///
/// [`VulkanContext`]: super::VulkanContext
pub struct InstanceParts {
    pub instance: ash::Instance,
    pub surface_instance: ash::khr::surface::Instance,
    pub surface_khr: vk::SurfaceKHR,
    pub debug_messenger: Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

/// Creates the instance with the surface extensions the window system
/// requires, layering in validation when the build asks for it and the
/// layer is installed.
pub fn create_instance(window: &Window) -> anyhow::Result<InstanceParts> {
    let entry = ash::Entry::linked();
    let display_handle = window
        .display_handle()
        .context("failed to acquire display handle")?;
    let window_handle = window
        .window_handle()
        .context("failed to acquire window handle")?;

    let app_info = vk::ApplicationInfo::default()
        .api_version(vk::API_VERSION_1_3)
        .application_name(c"Ember")
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"Ember")
        .engine_version(vk::make_api_version(0, 0, 1, 0));

    let mut extensions = ash_window::enumerate_required_extensions(display_handle.as_raw())
        .context("failed to enumerate required surface extensions")?
        .to_vec();

    let validation_layer = debug::supported_validation_layer(&entry)?;
    if validation_layer.is_some() {
        extensions.push(debug_utils::NAME.as_ptr());
    }
    let layer_ptrs: Vec<*const c_char> =
        validation_layer.iter().map(|layer| layer.as_ptr()).collect();

    // MoltenVK exposes the device only through the portability extension.
    let flags = if cfg!(any(target_os = "macos", target_os = "ios")) {
        vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR
    } else {
        vk::InstanceCreateFlags::default()
    };

    let mut messenger_info = debug::messenger_create_info();
    let mut create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layer_ptrs)
        .flags(flags);
    if validation_layer.is_some() {
        // Covers instance creation and destruction, which the messenger
        // proper cannot observe.
        create_info = create_info.push_next(&mut messenger_info);
    }

    let instance = unsafe {
        entry
            .create_instance(&create_info, None)
            .context("failed to create Vulkan instance")?
    };

    let surface_instance = ash::khr::surface::Instance::new(&entry, &instance);
    let surface_khr = unsafe {
        ash_window::create_surface(
            &entry,
            &instance,
            display_handle.as_raw(),
            window_handle.as_raw(),
            None,
        )
    }
    .context("failed to create window surface")?;

    let debug_messenger = if validation_layer.is_some() {
        debug::create_messenger(&entry, &instance)
    } else {
        None
    };

    Ok(InstanceParts {
        instance,
        surface_instance,
        surface_khr,
        debug_messenger,
    })
}
