use std::ffi::{CStr, c_void};

use anyhow::Context;
use ash::{ext::debug_utils, vk};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Validation follows the build profile: on for debug builds, off for
/// release.
pub fn validation_enabled() -> bool {
    cfg!(debug_assertions)
}

/// Returns the validation layer name when validation is on and the layer is
/// actually installed. A missing layer downgrades to a warning rather than
/// failing startup; the engine still runs, just unvalidated.
pub fn supported_validation_layer(entry: &ash::Entry) -> anyhow::Result<Option<&'static CStr>> {
    if !validation_enabled() {
        return Ok(None);
    }

    let available = unsafe {
        entry
            .enumerate_instance_layer_properties()
            .context("failed to enumerate instance layer properties")?
    };
    let installed = available
        .iter()
        .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER);

    if installed {
        Ok(Some(VALIDATION_LAYER))
    } else {
        log::warn!(
            "validation requested but {} is not installed; running unvalidated",
            VALIDATION_LAYER.to_string_lossy()
        );
        Ok(None)
    }
}

/// Routes validation output into the `vulkan` log target at the matching
/// level.
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    kind: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    use vk::DebugUtilsMessageSeverityFlagsEXT as Severity;

    let message = unsafe { CStr::from_ptr((*callback_data).p_message) }.to_string_lossy();
    match severity {
        Severity::VERBOSE => log::trace!(target: "vulkan", "[{kind:?}] {message}"),
        Severity::INFO => log::info!(target: "vulkan", "[{kind:?}] {message}"),
        Severity::WARNING => log::warn!(target: "vulkan", "[{kind:?}] {message}"),
        _ => log::error!(target: "vulkan", "[{kind:?}] {message}"),
    }
    vk::FALSE
}

pub fn messenger_create_info() -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback))
}

/// Installs the messenger. Callers gate this on the debug-utils extension
/// having been enabled at instance creation; a creation failure is logged
/// and swallowed because losing validation output is not fatal.
pub fn create_messenger(
    entry: &ash::Entry,
    instance: &ash::Instance,
) -> Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
    let loader = debug_utils::Instance::new(entry, instance);
    match unsafe { loader.create_debug_utils_messenger(&messenger_create_info(), None) } {
        Ok(messenger) => Some((loader, messenger)),
        Err(e) => {
            log::warn!("failed to create debug messenger: {e:?}");
            None
        }
    }
}
